use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("endpoint allocation failed")]
    Alloc,
    #[error("address already in use")]
    AddrInUse,
    #[error("bind failed")]
    Bind,
    #[error("listen failed")]
    Listen,
    #[error("write failed")]
    Write,
    #[error("close failed")]
    Close,
    #[error("connection reset by peer")]
    Reset,
    #[error("connection aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStage {
    Allocate,
    Bind,
    Listen,
}

impl OpenStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allocate => "allocate",
            Self::Bind => "bind",
            Self::Listen => "listen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to open provisioning server during {}: {source}", .stage.as_str())]
pub struct OpenError {
    pub stage: OpenStage,
    #[source]
    pub source: StackError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcceptError {
    #[error("accept reported failure: {0}")]
    Rejected(StackError),
    #[error("accept delivered no endpoint")]
    MissingEndpoint,
    #[error("connection table exhausted ({capacity} live connections)")]
    Exhausted { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{needed} bytes do not fit a buffer holding at most {capacity}")]
pub struct CapacityExceeded {
    pub needed: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResponseError {
    #[error("too much result data ({len} bytes, limit {capacity})")]
    BodyTooLarge { len: usize, capacity: usize },
    #[error("too much header data ({len} bytes, limit {capacity})")]
    HeaderTooLarge { len: usize, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Ssid,
    Password,
}

impl CredentialField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssid => "ssid",
            Self::Password => "password",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("request body is empty")]
    EmptyBody,
    #[error("field `{}` is missing", .0.as_str())]
    MissingField(CredentialField),
    #[error("field `{}` is empty", .0.as_str())]
    EmptyField(CredentialField),
    #[error("field `{}` is {len} bytes, at most {max} allowed", .field.as_str())]
    FieldTooLong {
        field: CredentialField,
        len: usize,
        max: usize,
    },
    #[error("field `{}` is not valid UTF-8", .0.as_str())]
    InvalidUtf8(CredentialField),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeError {
    #[error("failed to stop provisioning helpers: {0}")]
    Helpers(String),
    #[error("failed to disable access point: {0}")]
    AccessPoint(String),
    #[error("failed to join network: {0}")]
    Station(String),
}
