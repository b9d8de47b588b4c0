use core::fmt;

use log::{info, warn};

use crate::{
    buffer::BoundedBuffer,
    config::{PASSWORD_BUFFER_SIZE, SSID_BUFFER_SIZE},
    error::{CredentialError, CredentialField},
};

pub const DECODE_BUFFER_SIZE: usize = 1024;

const SSID_MARKER: &[u8] = b"ssid=";
const PASSWORD_MARKER: &[u8] = b"password=";

// Stops at a NUL byte or once the scratch buffer is full.
pub fn url_decode(input: &[u8]) -> BoundedBuffer<DECODE_BUFFER_SIZE> {
    let mut out = BoundedBuffer::new();
    let mut i = 0;

    while i < input.len() && !out.is_full() {
        let byte = match input[i] {
            0 => break,
            b'%' => {
                match (hex_value(input.get(i + 1)), hex_value(input.get(i + 2))) {
                    (Some(high), Some(low)) => {
                        i += 2;
                        (high << 4) | low
                    }
                    _ => b'%',
                }
            }
            b'+' => b' ',
            other => other,
        };
        // The loop guard keeps at least one free slot.
        let _ = out.push(byte);
        i += 1;
    }

    out
}

fn hex_value(byte: Option<&u8>) -> Option<u8> {
    match byte? {
        b @ b'0'..=b'9' => Some(b - b'0'),
        b @ b'a'..=b'f' => Some(b - b'a' + 10),
        b @ b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: BoundedBuffer<SSID_BUFFER_SIZE>,
    password: BoundedBuffer<PASSWORD_BUFFER_SIZE>,
}

impl Credentials {
    pub const MAX_SSID_LEN: usize = SSID_BUFFER_SIZE - 1;
    pub const MAX_PASSWORD_LEN: usize = PASSWORD_BUFFER_SIZE - 1;

    pub fn new(
        ssid: impl AsRef<[u8]>,
        password: impl AsRef<[u8]>,
    ) -> Result<Self, CredentialError> {
        Ok(Self {
            ssid: checked_field(CredentialField::Ssid, ssid.as_ref())?,
            password: checked_field(CredentialField::Password, password.as_ref())?,
        })
    }

    // Both fields are validated as UTF-8 in `new`.
    pub fn ssid(&self) -> &str {
        core::str::from_utf8(self.ssid.as_bytes()).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        core::str::from_utf8(self.password.as_bytes()).unwrap_or_default()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid())
            .field("password", &format_args!("<{} bytes>", self.password.len()))
            .finish()
    }
}

fn checked_field<const N: usize>(
    field: CredentialField,
    value: &[u8],
) -> Result<BoundedBuffer<N>, CredentialError> {
    if value.is_empty() {
        return Err(CredentialError::EmptyField(field));
    }
    let mut stored = BoundedBuffer::new();
    stored
        .set(value)
        .map_err(|err| CredentialError::FieldTooLong {
            field,
            len: err.needed,
            max: err.capacity,
        })?;
    if core::str::from_utf8(value).is_err() {
        return Err(CredentialError::InvalidUtf8(field));
    }
    Ok(stored)
}

#[derive(Debug, Default, Clone)]
pub struct ProvisioningResult {
    credentials: Option<Credentials>,
    submissions: u32,
}

impl ProvisioningResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_collected(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn submissions(&self) -> u32 {
        self.submissions
    }

    pub fn record(&mut self, credentials: Credentials) {
        self.submissions = self.submissions.saturating_add(1);
        self.credentials = Some(credentials);
    }
}

// Markers are searched in the decoded text, so an encoded `&` or `=` acts as a separator.
pub fn parse_credentials(body: &[u8]) -> Result<Credentials, CredentialError> {
    let decoded = url_decode(body);
    if decoded.is_empty() {
        return Err(CredentialError::EmptyBody);
    }

    let ssid = field_value(decoded.as_bytes(), SSID_MARKER)
        .ok_or(CredentialError::MissingField(CredentialField::Ssid))?;
    let password = field_value(decoded.as_bytes(), PASSWORD_MARKER)
        .ok_or(CredentialError::MissingField(CredentialField::Password))?;

    Credentials::new(ssid, password)
}

fn field_value<'a>(decoded: &'a [u8], marker: &[u8]) -> Option<&'a [u8]> {
    let start = decoded
        .windows(marker.len())
        .position(|window| window == marker)?
        + marker.len();
    let value = &decoded[start..];
    let end = value.iter().position(|&b| b == b'&').unwrap_or(value.len());
    Some(&value[..end])
}

pub fn extract_credentials(
    body: &[u8],
    result: &mut ProvisioningResult,
) -> Result<(), CredentialError> {
    match parse_credentials(body) {
        Ok(credentials) => {
            info!(
                "credentials collected: ssid=`{}`, password={} bytes",
                credentials.ssid(),
                credentials.password().len()
            );
            result.record(credentials);
            Ok(())
        }
        Err(err) => {
            warn!("credential extraction failed: {err}");
            Err(err)
        }
    }
}
