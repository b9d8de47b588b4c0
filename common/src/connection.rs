use core::fmt;
use std::net::Ipv4Addr;

use log::{debug, info, warn};

use crate::{
    buffer::BoundedBuffer,
    config::REQUEST_BUFFER_SIZE,
    credentials::ProvisioningResult,
    error::{ResponseError, StackError},
    request::{is_complete, parse_request, request_method},
    response::{respond, Page, Response, StatusLed},
    types::Method,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait Endpoint {
    fn write(&mut self, data: &[u8]) -> Result<(), StackError>;
    fn close(&mut self) -> Result<(), StackError>;
    fn abort(&mut self);

    fn recved(&mut self, _len: usize) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Accepted,
    Receiving,
    Responding,
    // Request was not GET/POST; nothing will be sent.
    Discarding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    Sent,
    IdleTimeout,
    RequestTooLarge,
    Response(ResponseError),
    Stack(StackError),
    PeerAborted,
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed"),
            Self::Sent => f.write_str("response sent"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::RequestTooLarge => f.write_str("request too large"),
            Self::Response(err) => write!(f, "{err}"),
            Self::Stack(err) => write!(f, "{err}"),
            Self::PeerAborted => f.write_str("aborted by stack"),
            Self::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed {
    pub id: ConnectionId,
    pub reason: CloseReason,
    pub aborted: bool,
}

pub struct RequestContext<'a> {
    pub gateway: Ipv4Addr,
    pub led: &'a mut dyn StatusLed,
    pub result: &'a mut ProvisioningResult,
}

pub trait ConnectionEvents {
    // `None` means the peer closed its side.
    fn on_receive(&mut self, payload: Option<&[u8]>, ctx: &mut RequestContext<'_>) -> Flow;
    fn on_sent(&mut self, len: usize) -> Flow;
    fn on_poll(&mut self, now_ms: u64) -> Flow;
    fn on_error(&mut self, err: StackError) -> Flow;
}

pub struct ConnectionState<E: Endpoint> {
    id: ConnectionId,
    endpoint: E,
    phase: Phase,
    request: BoundedBuffer<REQUEST_BUFFER_SIZE>,
    header_len: usize,
    body_len: usize,
    sent_len: usize,
    deadline_ms: u64,
}

impl<E: Endpoint> ConnectionState<E> {
    pub fn new(id: ConnectionId, endpoint: E, now_ms: u64, idle_timeout_ms: u64) -> Self {
        Self {
            id,
            endpoint,
            phase: Phase::Accepted,
            request: BoundedBuffer::new(),
            header_len: 0,
            body_len: 0,
            sent_len: 0,
            deadline_ms: now_ms.saturating_add(idle_timeout_ms),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn sent_len(&self) -> usize {
        self.sent_len
    }

    pub fn expected_len(&self) -> usize {
        self.header_len + self.body_len
    }

    // Consumes the record, so it is released exactly once.
    pub fn close(mut self, reason: CloseReason) -> Closed {
        let mut aborted = false;
        if reason != CloseReason::PeerAborted {
            if let Err(err) = self.endpoint.close() {
                warn!("connection {}: close failed ({err}), aborting", self.id);
                self.endpoint.abort();
                aborted = true;
            }
        }
        info!(
            "connection {} closed: {reason} ({} of {} bytes acknowledged)",
            self.id,
            self.sent_len,
            self.expected_len()
        );
        Closed {
            id: self.id,
            reason,
            aborted,
        }
    }

    fn send(&mut self, response: Response) -> Flow {
        self.header_len = response.header().len();
        self.body_len = response.body().len();
        self.sent_len = 0;
        self.phase = Phase::Responding;

        if let Err(err) = self.endpoint.write(response.header()) {
            warn!("connection {}: failed to write header data: {err}", self.id);
            return Flow::Close(CloseReason::Stack(err));
        }
        if !response.body().is_empty() {
            if let Err(err) = self.endpoint.write(response.body()) {
                warn!("connection {}: failed to write result data: {err}", self.id);
                return Flow::Close(CloseReason::Stack(err));
            }
        }
        debug!(
            "connection {}: queued {} header + {} body bytes",
            self.id, self.header_len, self.body_len
        );
        Flow::Continue
    }

    fn overflow(&mut self) -> Flow {
        warn!(
            "connection {}: request exceeds {} bytes",
            self.id,
            BoundedBuffer::<REQUEST_BUFFER_SIZE>::CAPACITY
        );
        if request_method(self.request.as_bytes()) == Some(Method::Post) {
            match Response::page(Page::Failure) {
                Ok(response) => self.send(response),
                Err(err) => Flow::Close(CloseReason::Response(err)),
            }
        } else {
            Flow::Close(CloseReason::RequestTooLarge)
        }
    }
}

impl<E: Endpoint> ConnectionEvents for ConnectionState<E> {
    fn on_receive(&mut self, payload: Option<&[u8]>, ctx: &mut RequestContext<'_>) -> Flow {
        let Some(payload) = payload else {
            return Flow::Close(CloseReason::PeerClosed);
        };
        debug!("connection {}: received {} bytes", self.id, payload.len());
        self.endpoint.recved(payload.len());

        if matches!(self.phase, Phase::Responding | Phase::Discarding) {
            return Flow::Continue;
        }
        self.phase = Phase::Receiving;

        let kept = self.request.extend_truncating(payload);
        let complete = is_complete(self.request.as_bytes());
        if !complete && (kept < payload.len() || self.request.is_full()) {
            return self.overflow();
        }
        if !complete {
            return Flow::Continue;
        }

        let Some(request) = parse_request(self.request.as_bytes()) else {
            debug!("connection {}: unrecognized request, waiting for close", self.id);
            self.phase = Phase::Discarding;
            return Flow::Continue;
        };
        debug!(
            "connection {}: {} {}{}",
            self.id,
            request.method.as_str(),
            request.path,
            request.query.map(|q| format!("?{q}")).unwrap_or_default()
        );

        match respond(&request, &mut *ctx.led, ctx.gateway, &mut *ctx.result) {
            Ok(response) => self.send(response),
            Err(err) => {
                warn!("connection {}: {err}", self.id);
                Flow::Close(CloseReason::Response(err))
            }
        }
    }

    fn on_sent(&mut self, len: usize) -> Flow {
        self.sent_len = self.sent_len.saturating_add(len);
        debug!(
            "connection {}: {len} bytes acknowledged ({}/{})",
            self.id,
            self.sent_len,
            self.expected_len()
        );
        if self.phase == Phase::Responding && self.sent_len >= self.expected_len() {
            return Flow::Close(CloseReason::Sent);
        }
        Flow::Continue
    }

    fn on_poll(&mut self, now_ms: u64) -> Flow {
        if now_ms >= self.deadline_ms {
            return Flow::Close(CloseReason::IdleTimeout);
        }
        Flow::Continue
    }

    fn on_error(&mut self, err: StackError) -> Flow {
        if err == StackError::Aborted {
            return Flow::Close(CloseReason::PeerAborted);
        }
        warn!("connection {}: stack error {err}", self.id);
        Flow::Close(CloseReason::Stack(err))
    }
}
