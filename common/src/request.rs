use httparse::{Header, Status, EMPTY_HEADER};

use crate::types::Method;

const MAX_HEADERS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub body: Option<&'a [u8]>,
}

fn classify(method: &str) -> Option<Method> {
    match method {
        "GET" => Some(Method::Get),
        "POST" => Some(Method::Post),
        _ => None,
    }
}

pub fn parse_request(raw: &[u8]) -> Option<Request<'_>> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed.parse(raw).ok()?;
    let method = classify(parsed.method?)?;
    let target = parsed.path?;

    let request = match method {
        Method::Get => {
            let (path, query) = match target.split_once('?') {
                Some((path, "")) => (path, None),
                Some((path, query)) => (path, Some(query)),
                None => (target, None),
            };
            Request {
                method,
                path,
                query,
                body: None,
            }
        }
        Method::Post => Request {
            method,
            path: target,
            query: None,
            body: match status {
                Status::Complete(head_len) => Some(&raw[head_len..]),
                Status::Partial => None,
            },
        },
    };

    Some(request)
}

pub fn request_method(raw: &[u8]) -> Option<Method> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    // A too-long head still yields its method.
    let _ = parsed.parse(raw);
    classify(parsed.method?)
}

pub fn content_length(headers: &[Header<'_>]) -> Option<usize> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case("content-length"))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .and_then(|value| value.trim().parse().ok())
}

// A head httparse rejects counts as complete so the caller can discard it.
pub fn is_complete(raw: &[u8]) -> bool {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(raw) {
        Ok(Status::Complete(head_len)) => match content_length(parsed.headers) {
            Some(expected) => raw.len() - head_len >= expected,
            None => true,
        },
        Ok(Status::Partial) => false,
        Err(_) => true,
    }
}
