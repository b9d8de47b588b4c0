use std::{
    collections::{hash_map::Entry, HashMap},
    net::{Ipv4Addr, SocketAddrV4},
};

use log::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::{
        CloseReason, Closed, ConnectionEvents, ConnectionId, ConnectionState, Endpoint, Flow,
        RequestContext,
    },
    credentials::ProvisioningResult,
    error::{AcceptError, OpenError, OpenStage, StackError},
    response::StatusLed,
};

pub trait ListenSocket {
    fn close(&mut self);
}

pub trait Stack {
    type Socket: ListenSocket;
    type Endpoint: Endpoint;

    fn allocate(&mut self) -> Result<Self::Socket, StackError>;
    fn bind(&mut self, socket: &mut Self::Socket, addr: SocketAddrV4) -> Result<(), StackError>;
    fn listen(&mut self, socket: &mut Self::Socket, backlog: u8) -> Result<(), StackError>;
}

pub struct ProvisioningServer<S: Stack, L: StatusLed> {
    socket: S::Socket,
    gateway: Ipv4Addr,
    config: ServerConfig,
    led: L,
    connections: HashMap<ConnectionId, ConnectionState<S::Endpoint>>,
    next_id: u32,
}

impl<S: Stack, L: StatusLed> ProvisioningServer<S, L> {
    pub fn open(stack: &mut S, config: &ServerConfig, led: L) -> Result<Self, OpenError> {
        let addr = config.bind_addr();
        info!("starting server on port {}", addr.port());

        let mut socket = stack.allocate().map_err(|source| OpenError {
            stage: OpenStage::Allocate,
            source,
        })?;

        if let Err(source) = stack.bind(&mut socket, addr) {
            warn!("failed to bind to port {}: {source}", addr.port());
            socket.close();
            return Err(OpenError {
                stage: OpenStage::Bind,
                source,
            });
        }

        if let Err(source) = stack.listen(&mut socket, config.backlog) {
            warn!("failed to listen: {source}");
            socket.close();
            return Err(OpenError {
                stage: OpenStage::Listen,
                source,
            });
        }

        Ok(Self {
            socket,
            gateway: config.gateway_addr(),
            config: config.clone(),
            led,
            connections: HashMap::new(),
            next_id: 1,
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn socket(&self) -> &S::Socket {
        &self.socket
    }

    pub fn led(&self) -> &L {
        &self.led
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionState<S::Endpoint>> {
        self.connections.get(&id)
    }

    pub fn on_accept(
        &mut self,
        endpoint: Option<S::Endpoint>,
        status: Result<(), StackError>,
        now_ms: u64,
    ) -> Result<ConnectionId, AcceptError> {
        if let Err(err) = status {
            warn!("failure in accept: {err}");
            return Err(AcceptError::Rejected(err));
        }
        let Some(mut endpoint) = endpoint else {
            warn!("failure in accept: no endpoint");
            return Err(AcceptError::MissingEndpoint);
        };

        let capacity = self.config.max_connections;
        if self.connections.len() >= capacity || self.connections.try_reserve(1).is_err() {
            warn!("failed to allocate connection state ({capacity} live)");
            endpoint.abort();
            return Err(AcceptError::Exhausted { capacity });
        }

        // Ids wrap; one still in use is skipped.
        let idle_timeout_ms = self.config.idle_timeout_ms();
        let id = loop {
            let id = ConnectionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if let Entry::Vacant(slot) = self.connections.entry(id) {
                slot.insert(ConnectionState::new(id, endpoint, now_ms, idle_timeout_ms));
                break id;
            }
        };
        info!("client connected: {id}");
        Ok(id)
    }

    pub fn on_receive(
        &mut self,
        id: ConnectionId,
        payload: Option<&[u8]>,
        result: &mut ProvisioningResult,
    ) -> Option<Closed> {
        let Some(conn) = self.connections.get_mut(&id) else {
            debug!("receive for unknown connection {id}");
            return None;
        };
        let mut ctx = RequestContext {
            gateway: self.gateway,
            led: &mut self.led,
            result,
        };
        let flow = conn.on_receive(payload, &mut ctx);
        self.apply(id, flow)
    }

    pub fn on_sent(&mut self, id: ConnectionId, len: usize) -> Option<Closed> {
        let flow = self.connections.get_mut(&id)?.on_sent(len);
        self.apply(id, flow)
    }

    pub fn on_error(&mut self, id: ConnectionId, err: StackError) -> Option<Closed> {
        let flow = self.connections.get_mut(&id)?.on_error(err);
        self.apply(id, flow)
    }

    pub fn poll(&mut self, now_ms: u64) -> Vec<Closed> {
        let mut expired: Vec<(ConnectionId, CloseReason)> = self
            .connections
            .iter_mut()
            .filter_map(|(id, conn)| match conn.on_poll(now_ms) {
                Flow::Continue => None,
                Flow::Close(reason) => Some((*id, reason)),
            })
            .collect();
        expired.sort_by_key(|(id, _)| *id);

        expired
            .into_iter()
            .filter_map(|(id, reason)| self.close_connection(id, reason))
            .collect()
    }

    // `None` when the connection is already gone.
    pub fn close_connection(&mut self, id: ConnectionId, reason: CloseReason) -> Option<Closed> {
        let conn = self.connections.remove(&id)?;
        Some(conn.close(reason))
    }

    pub fn shutdown(mut self) -> Vec<Closed> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        let closed = ids
            .into_iter()
            .filter_map(|id| self.close_connection(id, CloseReason::ServerShutdown))
            .collect();
        self.socket.close();
        info!("provisioning server closed, port {} released", self.config.port);
        closed
    }

    fn apply(&mut self, id: ConnectionId, flow: Flow) -> Option<Closed> {
        match flow {
            Flow::Continue => None,
            Flow::Close(reason) => self.close_connection(id, reason),
        }
    }
}

pub fn shutdown_server<S: Stack, L: StatusLed>(
    server: Option<ProvisioningServer<S, L>>,
) -> Vec<Closed> {
    server.map(ProvisioningServer::shutdown).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{FakeLed, FakeStack, RecordingEndpoint};

    fn open_server() -> ProvisioningServer<FakeStack, FakeLed> {
        let mut stack = FakeStack::default();
        ProvisioningServer::open(&mut stack, &ServerConfig::default(), FakeLed::default()).unwrap()
    }

    #[test]
    fn open_binds_port_80_with_backlog_1() {
        let mut stack = FakeStack::default();
        let server =
            ProvisioningServer::open(&mut stack, &ServerConfig::default(), FakeLed::default())
                .unwrap();

        assert_eq!(
            stack.bound,
            Some(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80))
        );
        assert_eq!(stack.backlog, Some(1));
        assert_eq!(server.gateway(), Ipv4Addr::new(192, 168, 4, 1));
        assert!(!server.socket().closed.get());
    }

    #[test]
    fn failed_open_releases_the_socket() {
        for stage in [OpenStage::Bind, OpenStage::Listen] {
            let mut stack = FakeStack {
                fail_at: Some(stage),
                ..FakeStack::default()
            };
            let err = match ProvisioningServer::open(
                &mut stack,
                &ServerConfig::default(),
                FakeLed::default(),
            ) {
                Ok(_) => panic!("open must fail at {stage:?}"),
                Err(err) => err,
            };

            assert_eq!(err.stage, stage);
            assert_eq!(stack.sockets_closed.get(), 1);
        }
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut stack = FakeStack {
            fail_at: Some(OpenStage::Allocate),
            ..FakeStack::default()
        };

        let result =
            ProvisioningServer::open(&mut stack, &ServerConfig::default(), FakeLed::default());

        assert!(matches!(
            result,
            Err(OpenError {
                stage: OpenStage::Allocate,
                source: StackError::Alloc
            })
        ));
    }

    #[test]
    fn accept_rejects_failures_and_missing_endpoints() {
        let mut server = open_server();
        let (endpoint, _) = RecordingEndpoint::new();

        assert_eq!(
            server.on_accept(Some(endpoint), Err(StackError::Reset), 0),
            Err(AcceptError::Rejected(StackError::Reset))
        );
        assert_eq!(
            server.on_accept(None, Ok(()), 0),
            Err(AcceptError::MissingEndpoint)
        );
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn accept_beyond_capacity_aborts_the_newcomer() {
        let mut server = open_server();
        for _ in 0..4 {
            let (endpoint, _) = RecordingEndpoint::new();
            server.on_accept(Some(endpoint), Ok(()), 0).unwrap();
        }
        let (endpoint, log) = RecordingEndpoint::new();

        let err = server.on_accept(Some(endpoint), Ok(()), 0).unwrap_err();

        assert_eq!(err, AcceptError::Exhausted { capacity: 4 });
        assert_eq!(log.borrow().aborts, 1);
        assert_eq!(server.connection_count(), 4);
    }

    #[test]
    fn wrapped_ids_never_replace_a_live_connection() {
        let mut server = open_server();
        let (first, first_log) = RecordingEndpoint::new();
        let first = server.on_accept(Some(first), Ok(()), 0).unwrap();
        assert_eq!(first, ConnectionId(1));

        server.next_id = u32::MAX;
        let (last, _) = RecordingEndpoint::new();
        let last = server.on_accept(Some(last), Ok(()), 0).unwrap();
        let (wrapped, _) = RecordingEndpoint::new();
        let wrapped = server.on_accept(Some(wrapped), Ok(()), 0).unwrap();

        assert_eq!(last, ConnectionId(u32::MAX));
        assert_eq!(wrapped, ConnectionId(2));
        assert_eq!(server.connection_count(), 3);
        assert!(server.connection(first).is_some());
        assert_eq!(first_log.borrow().closes, 0);
        assert_eq!(first_log.borrow().aborts, 0);
    }

    #[test]
    fn closing_twice_is_a_no_op() {
        let mut server = open_server();
        let (endpoint, log) = RecordingEndpoint::new();
        let id = server.on_accept(Some(endpoint), Ok(()), 0).unwrap();

        let first = server.close_connection(id, CloseReason::Sent);
        let second = server.close_connection(id, CloseReason::Sent);

        assert!(first.is_some());
        assert_eq!(second, None);
        assert_eq!(log.borrow().closes, 1);
        assert_eq!(server.on_sent(id, 10), None);
        assert_eq!(server.on_error(id, StackError::Reset), None);
    }

    #[test]
    fn full_exchange_closes_after_last_acknowledgement() {
        let mut server = open_server();
        let mut result = ProvisioningResult::new();
        let (endpoint, log) = RecordingEndpoint::new();
        let id = server.on_accept(Some(endpoint), Ok(()), 0).unwrap();

        let body = b"POST /post HTTP/1.1\r\nHost: 192.168.4.1\r\n\r\nssid=Lab&password=p4ssw0rd!";
        assert_eq!(server.on_receive(id, Some(body), &mut result), None);
        let total = log.borrow().written().len();

        assert_eq!(server.on_sent(id, total / 2), None);
        let closed = server.on_sent(id, total - total / 2).unwrap();

        assert_eq!(closed.reason, CloseReason::Sent);
        assert_eq!(server.connection_count(), 0);
        assert!(result.is_collected());
    }

    #[test]
    fn idle_connection_is_dropped_exactly_once() {
        let mut server = open_server();
        let (endpoint, log) = RecordingEndpoint::new();
        let id = server.on_accept(Some(endpoint), Ok(()), 1_000).unwrap();

        assert!(server.poll(5_500).is_empty());
        let closed = server.poll(6_000);
        let again = server.poll(12_000);

        assert_eq!(
            closed,
            vec![Closed {
                id,
                reason: CloseReason::IdleTimeout,
                aborted: false,
            }]
        );
        assert!(again.is_empty());
        assert_eq!(log.borrow().closes, 1);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn get_round_trip_reflects_led_state() {
        let mut server = open_server();
        let mut result = ProvisioningResult::new();

        let (first, _) = RecordingEndpoint::new();
        let first = server.on_accept(Some(first), Ok(()), 0).unwrap();
        server.on_receive(first, Some(b"GET /config?led=1 HTTP/1.1\r\n\r\n"), &mut result);

        let (second, log) = RecordingEndpoint::new();
        let second = server.on_accept(Some(second), Ok(()), 0).unwrap();
        server.on_receive(second, Some(b"GET /config HTTP/1.1\r\n\r\n"), &mut result);

        assert!(server.led().on);
        let written = String::from_utf8(log.borrow().written()).unwrap();
        assert!(written.contains("Led is ON"));
    }

    #[test]
    fn peer_close_tears_down_without_response() {
        let mut server = open_server();
        let mut result = ProvisioningResult::new();
        let (endpoint, log) = RecordingEndpoint::new();
        let id = server.on_accept(Some(endpoint), Ok(()), 0).unwrap();

        let closed = server.on_receive(id, None, &mut result).unwrap();

        assert_eq!(closed.reason, CloseReason::PeerClosed);
        assert!(log.borrow().writes.is_empty());
        assert_eq!(log.borrow().closes, 1);
    }

    #[test]
    fn shutdown_closes_connections_and_listener() {
        let mut server = open_server();
        let (a, log_a) = RecordingEndpoint::new();
        let (b, log_b) = RecordingEndpoint::new();
        server.on_accept(Some(a), Ok(()), 0).unwrap();
        server.on_accept(Some(b), Ok(()), 0).unwrap();
        let socket_closed = server.socket().closed.clone();

        let closed = shutdown_server(Some(server));

        assert_eq!(closed.len(), 2);
        assert!(closed
            .iter()
            .all(|c| c.reason == CloseReason::ServerShutdown));
        assert_eq!(log_a.borrow().closes, 1);
        assert_eq!(log_b.borrow().closes, 1);
        assert!(socket_closed.get());
        assert!(shutdown_server::<FakeStack, FakeLed>(None).is_empty());
    }
}
