use std::net::Ipv4Addr;

use log::{debug, warn};

use crate::{
    buffer::BoundedBuffer,
    config::RESPONSE_BUFFER_SIZE,
    credentials::{extract_credentials, ProvisioningResult},
    error::ResponseError,
    request::Request,
    types::{LedState, Method},
};

pub const CONFIG_PATH: &str = "/config";
pub const LED_TEST_PATH: &str = "/ledtest";

const LED_PARAM: &str = "led=";

const SUCCESS_PAGE: &str = "<html><body style=\"display:flex;justify-content:center;align-items:center;height:100vh;background-color:#e3f2fd;\">\n\
<div style=\"text-align:center;max-width:400px;padding:20px;border-radius:10px;background-color:white;box-shadow:0 4px 8px rgba(0,0,0,0.2);\">\n\
<h1 style=\"color:#1976d2;\">Configuration saved successfully!</h1>\n\
<a href=\"/config\" style=\"display:inline-block;margin-top:20px;padding:10px 20px;background-color:#1976d2;color:white;text-decoration:none;border-radius:5px;font-size:16px;\">Back to Configuration</a>\n\
</div></body></html>";

const FAILURE_PAGE: &str = "<html><body style=\"display:flex;justify-content:center;align-items:center;height:100vh;background-color:#e3f2fd;\">\n\
<div style=\"text-align:center;max-width:400px;padding:20px;border-radius:10px;background-color:white;box-shadow:0 4px 8px rgba(0,0,0,0.2);\">\n\
<h1 style=\"color:#1976d2;\">Error saving configuration</h1>\n\
<p style=\"color:#444;\">Please try again.</p>\n\
<a href=\"/config\" style=\"display:inline-block;margin-top:20px;padding:10px 20px;background-color:#1976d2;color:white;text-decoration:none;border-radius:5px;font-size:16px;\">Back to Configuration</a>\n\
</div></body></html>";

pub trait StatusLed {
    fn is_on(&self) -> bool;
    fn set(&mut self, on: bool);

    fn state(&self) -> LedState {
        LedState::from_bool(self.is_on())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Config { led: LedState },
    LedTest { led: LedState },
    Success,
    Failure,
}

impl Page {
    pub fn render(&self) -> String {
        match *self {
            Self::Config { led } => config_page(led),
            Self::LedTest { led } => format!(
                "<html><body><h1>LED test</h1><p>Led is {}</p><p><a href=\"?led={}\">Turn led {}</a></body></html>",
                led.as_str(),
                led.toggled().param(),
                led.toggled().as_str(),
            ),
            Self::Success => SUCCESS_PAGE.to_string(),
            Self::Failure => FAILURE_PAGE.to_string(),
        }
    }
}

fn config_page(led: LedState) -> String {
    let input = "required style=\"width:100%;padding:10px;margin:10px 0;\"><br>\n";
    format!(
        "<html><body style=\"font-family:sans-serif;display:flex;justify-content:center;background:#e3f2fd;\">\n\
<div style=\"max-width:400px;padding:20px;border-radius:10px;background:#fff;text-align:center;\">\n\
<h1 style=\"color:#1976d2;\">Wi-Fi Configuration</h1>\n\
<p>Enter your Wi-Fi credentials below:</p>\n\
<form method=\"POST\" action=\"/post\">\n\
<label for=\"ssid\"><b>SSID:</b></label><br>\n\
<input type=\"text\" id=\"ssid\" name=\"ssid\" maxlength=\"31\" {input}\
<label for=\"password\"><b>PASSWORD:</b></label><br>\n\
<input type=\"password\" id=\"password\" name=\"password\" maxlength=\"63\" {input}\
<button type=\"submit\" style=\"width:100%;padding:10px;background:#1976d2;color:#fff;border:none;border-radius:5px;\">Save</button>\n\
</form>\n\
<p>Led is {state}</p><p><a href=\"?led={param}\">Turn led {other}</a></p>\n\
</div></body></html>",
        state = led.as_str(),
        param = led.toggled().param(),
        other = led.toggled().as_str(),
    )
}

// Bare LF line endings.
pub fn render_headers(status: u16, body_len: usize) -> String {
    format!(
        "HTTP/1.1 {status} OK\nContent-Length: {body_len}\nContent-Type: text/html; charset=utf-8\nConnection: close\n\n"
    )
}

pub fn render_redirect(gateway: Ipv4Addr) -> String {
    format!("HTTP/1.1 302 Redirect\nLocation: http://{gateway}{CONFIG_PATH}\n\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    header: BoundedBuffer<RESPONSE_BUFFER_SIZE>,
    body: BoundedBuffer<RESPONSE_BUFFER_SIZE>,
}

impl Response {
    pub fn html(status: u16, body: &str) -> Result<Self, ResponseError> {
        let mut response = Self::empty();
        response
            .body
            .set(body.as_bytes())
            .map_err(|err| ResponseError::BodyTooLarge {
                len: err.needed,
                capacity: err.capacity,
            })?;
        response.set_header(&render_headers(status, body.len()))?;
        Ok(response)
    }

    pub fn page(page: Page) -> Result<Self, ResponseError> {
        Self::html(200, &page.render())
    }

    pub fn redirect(gateway: Ipv4Addr) -> Result<Self, ResponseError> {
        let mut response = Self::empty();
        response.set_header(&render_redirect(gateway))?;
        Ok(response)
    }

    fn empty() -> Self {
        Self {
            header: BoundedBuffer::new(),
            body: BoundedBuffer::new(),
        }
    }

    fn set_header(&mut self, header: &str) -> Result<(), ResponseError> {
        self.header
            .set(header.as_bytes())
            .map_err(|err| ResponseError::HeaderTooLarge {
                len: err.needed,
                capacity: err.capacity,
            })
    }

    pub fn header(&self) -> &[u8] {
        self.header.as_bytes()
    }

    pub fn body(&self) -> &[u8] {
        self.body.as_bytes()
    }

    pub fn total_len(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

// `led=` must lead the query; any non-zero integer means on.
pub fn parse_led_param(query: &str) -> Option<bool> {
    let value = query.strip_prefix(LED_PARAM)?.trim_start();
    let digits = value
        .strip_prefix('-')
        .or_else(|| value.strip_prefix('+'))
        .unwrap_or(value);
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }
    let non_zero = digits[..end].bytes().any(|b| b != b'0');
    Some(non_zero)
}

pub fn get_content(path: &str, query: Option<&str>, led: &mut dyn StatusLed) -> Option<Page> {
    let is_config = path.starts_with(CONFIG_PATH);
    let is_led_test = path.starts_with(LED_TEST_PATH);
    if !is_config && !is_led_test {
        return None;
    }

    if let Some(on) = query.and_then(parse_led_param) {
        if on != led.is_on() {
            debug!("led switched {}", LedState::from_bool(on).as_str());
        }
        led.set(on);
    }

    let state = led.state();
    Some(if is_config {
        Page::Config { led: state }
    } else {
        Page::LedTest { led: state }
    })
}

pub fn respond(
    request: &Request<'_>,
    led: &mut dyn StatusLed,
    gateway: Ipv4Addr,
    result: &mut ProvisioningResult,
) -> Result<Response, ResponseError> {
    match request.method {
        Method::Get => match get_content(request.path, request.query, led) {
            Some(page) => Response::page(page),
            None => {
                debug!("redirecting {} to http://{gateway}{CONFIG_PATH}", request.path);
                Response::redirect(gateway)
            }
        },
        Method::Post => {
            let page = match request.body {
                Some(body) => match extract_credentials(body, result) {
                    Ok(()) => Page::Success,
                    Err(_) => Page::Failure,
                },
                None => {
                    warn!("POST {} carries no body marker", request.path);
                    Page::Failure
                }
            };
            Response::page(page)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::request::parse_request;
    use crate::testing::FakeLed;

    const GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    fn reply(raw: &[u8], led: &mut FakeLed, result: &mut ProvisioningResult) -> Response {
        let request = parse_request(raw).unwrap();
        respond(&request, led, GATEWAY, result).unwrap()
    }

    #[test]
    fn header_template_uses_bare_line_feeds() {
        assert_eq!(
            render_headers(200, 42),
            "HTTP/1.1 200 OK\nContent-Length: 42\nContent-Type: text/html; charset=utf-8\nConnection: close\n\n"
        );
    }

    #[test]
    fn every_page_fits_the_response_buffer() {
        for page in [
            Page::Config { led: LedState::On },
            Page::Config { led: LedState::Off },
            Page::LedTest { led: LedState::On },
            Page::Success,
            Page::Failure,
        ] {
            let response = Response::page(page).unwrap();
            assert!(response.body().len() <= 1023, "{page:?}");
        }
    }

    #[test]
    fn content_length_matches_body() {
        let response = Response::page(Page::Success).unwrap();
        let header = String::from_utf8(response.header().to_vec()).unwrap();

        assert!(header.contains(&format!("Content-Length: {}\n", response.body().len())));
        assert_eq!(response.total_len(), response.header().len() + response.body().len());
    }

    #[test]
    fn oversized_body_is_an_error() {
        let body = "x".repeat(1024);

        assert_eq!(
            Response::html(200, &body),
            Err(ResponseError::BodyTooLarge {
                len: 1024,
                capacity: 1023
            })
        );
        assert!(Response::html(200, &"x".repeat(1023)).is_ok());
    }

    #[test]
    fn unknown_path_redirects_to_config() {
        let mut led = FakeLed::default();
        let mut result = ProvisioningResult::new();

        let response = reply(b"GET /generate_204 HTTP/1.1\r\n\r\n", &mut led, &mut result);

        assert_eq!(
            response.header(),
            b"HTTP/1.1 302 Redirect\nLocation: http://192.168.4.1/config\n\n"
        );
        assert!(response.body().is_empty());
    }

    #[test]
    fn led_param_persists_across_requests() {
        let mut led = FakeLed::default();
        let mut result = ProvisioningResult::new();

        reply(b"GET /config?led=1 HTTP/1.1\r\n\r\n", &mut led, &mut result);
        let second = reply(b"GET /config HTTP/1.1\r\n\r\n", &mut led, &mut result);

        let body = String::from_utf8(second.body().to_vec()).unwrap();
        assert!(body.contains("Led is ON"));
        assert!(body.contains("href=\"?led=0\""));
    }

    #[test]
    fn led_test_page_toggles() {
        let mut led = FakeLed { on: true };
        let mut result = ProvisioningResult::new();

        let response = reply(b"GET /ledtest?led=0 HTTP/1.1\r\n\r\n", &mut led, &mut result);

        assert!(!led.on);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("Led is OFF"));
        assert!(body.contains("Turn led ON"));
    }

    #[test]
    fn led_param_follows_scanf_rules() {
        assert_eq!(parse_led_param("led=1"), Some(true));
        assert_eq!(parse_led_param("led=0"), Some(false));
        assert_eq!(parse_led_param("led=12&x=1"), Some(true));
        assert_eq!(parse_led_param("led=-3"), Some(true));
        assert_eq!(parse_led_param("led= 0"), Some(false));
        assert_eq!(parse_led_param("led=on"), None);
        assert_eq!(parse_led_param("x=1&led=1"), None);
    }

    #[test]
    fn post_with_credentials_renders_success() {
        let mut led = FakeLed::default();
        let mut result = ProvisioningResult::new();

        let response = reply(
            b"POST /post HTTP/1.1\r\n\r\nssid=My+Wifi%21&password=He%40llo",
            &mut led,
            &mut result,
        );

        assert_eq!(response.body(), SUCCESS_PAGE.as_bytes());
        assert_eq!(result.credentials().unwrap().ssid(), "My Wifi!");
    }

    #[test]
    fn post_failures_render_failure_page() {
        let mut led = FakeLed::default();
        let mut result = ProvisioningResult::new();

        let missing = reply(b"POST /post HTTP/1.1\r\n\r\nssid=Foo", &mut led, &mut result);
        let no_marker = reply(b"POST /post HTTP/1.1\r\nHost: x\r\n", &mut led, &mut result);

        assert_eq!(missing.body(), FAILURE_PAGE.as_bytes());
        assert_eq!(no_marker.body(), FAILURE_PAGE.as_bytes());
        assert!(!result.is_collected());
    }
}
