use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream, UdpSocket},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use provision_common::{
    captive_answer,
    config::{ServerConfig, REQUEST_BUFFER_SIZE},
    ConnectionId, Endpoint, ListenSocket, OpenError, ProvisioningResult, ProvisioningServer,
    Stack, StackError, StatusLed,
};

pub type TokioServer<L> = ProvisioningServer<TokioStack, L>;

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[derive(Debug)]
enum Outbound {
    Write(Vec<u8>),
    Close,
    Abort,
}

#[derive(Debug)]
enum SocketEvent {
    /// `None` once the peer has closed its side.
    Received(ConnectionId, Option<Vec<u8>>),
    Sent(ConnectionId, usize),
    Failed(ConnectionId, StackError),
}

pub struct TokioEndpoint {
    outbound: UnboundedSender<Outbound>,
}

impl Endpoint for TokioEndpoint {
    fn write(&mut self, data: &[u8]) -> Result<(), StackError> {
        self.outbound
            .send(Outbound::Write(data.to_vec()))
            .map_err(|_| StackError::Write)
    }

    fn close(&mut self) -> Result<(), StackError> {
        self.outbound
            .send(Outbound::Close)
            .map_err(|_| StackError::Close)
    }

    fn abort(&mut self) {
        let _ = self.outbound.send(Outbound::Abort);
    }
}

pub struct TokioSocket {
    socket: Option<TcpSocket>,
    listener: Option<Arc<TcpListener>>,
}

impl TokioSocket {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    fn listener(&self) -> Option<Arc<TcpListener>> {
        self.listener.clone()
    }
}

impl ListenSocket for TokioSocket {
    fn close(&mut self) {
        self.socket = None;
        self.listener = None;
    }
}

#[derive(Debug, Default)]
pub struct TokioStack;

impl Stack for TokioStack {
    type Socket = TokioSocket;
    type Endpoint = TokioEndpoint;

    fn allocate(&mut self) -> Result<TokioSocket, StackError> {
        let socket = TcpSocket::new_v4().map_err(|err| {
            warn!("failed to create socket: {err}");
            StackError::Alloc
        })?;
        Ok(TokioSocket {
            socket: Some(socket),
            listener: None,
        })
    }

    fn bind(&mut self, socket: &mut TokioSocket, addr: SocketAddrV4) -> Result<(), StackError> {
        let inner = socket.socket.as_ref().ok_or(StackError::Bind)?;
        inner.set_reuseaddr(true).map_err(|_| StackError::Bind)?;
        inner
            .bind(SocketAddr::V4(addr))
            .map_err(|err| match err.kind() {
                ErrorKind::AddrInUse => StackError::AddrInUse,
                _ => StackError::Bind,
            })
    }

    fn listen(&mut self, socket: &mut TokioSocket, backlog: u8) -> Result<(), StackError> {
        let inner = socket.socket.take().ok_or(StackError::Listen)?;
        let listener = inner
            .listen(u32::from(backlog))
            .map_err(|_| StackError::Listen)?;
        socket.listener = Some(Arc::new(listener));
        Ok(())
    }
}

pub struct ProvisioningDriver<L: StatusLed> {
    server: TokioServer<L>,
    events_tx: UnboundedSender<SocketEvent>,
    events_rx: UnboundedReceiver<SocketEvent>,
    poll_interval: Duration,
}

impl<L: StatusLed> ProvisioningDriver<L> {
    pub fn open(config: &ServerConfig, led: L) -> Result<Self, OpenError> {
        let server = ProvisioningServer::open(&mut TokioStack, config, led)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            server,
            events_tx,
            events_rx,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.socket().local_addr()
    }

    /// Runs until `result` holds credentials and hands the server back, still
    /// open, for the caller to tear down.
    pub async fn run_until_collected(
        mut self,
        result: &mut ProvisioningResult,
    ) -> TokioServer<L> {
        let Some(listener) = self.server.socket().listener() else {
            warn!("provisioning server has no listener");
            return self.server;
        };
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !result.is_collected() {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(err) => {
                        debug!("accept failed: {err}");
                        let _ = self.server.on_accept(None, Err(StackError::Reset), monotonic_ms());
                    }
                },
                Some(event) = self.events_rx.recv() => self.dispatch(event, result),
                _ = ticker.tick() => {
                    for closed in self.server.poll(monotonic_ms()) {
                        debug!("connection {} dropped on poll", closed.id);
                    }
                }
            }
        }

        info!("credentials collected, provisioning loop finished");
        self.server
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let endpoint = TokioEndpoint {
            outbound: outbound_tx,
        };
        match self.server.on_accept(Some(endpoint), Ok(()), monotonic_ms()) {
            Ok(id) => {
                debug!("connection {id} from {peer}");
                tokio::spawn(socket_task(
                    id,
                    stream,
                    outbound_rx,
                    self.events_tx.clone(),
                ));
            }
            Err(err) => {
                warn!("rejected connection from {peer}: {err}");
                reset(&stream);
            }
        }
    }

    fn dispatch(&mut self, event: SocketEvent, result: &mut ProvisioningResult) {
        let closed = match event {
            SocketEvent::Received(id, payload) => {
                self.server.on_receive(id, payload.as_deref(), result)
            }
            SocketEvent::Sent(id, len) => self.server.on_sent(id, len),
            SocketEvent::Failed(id, err) => self.server.on_error(id, err),
        };
        if let Some(closed) = closed {
            debug!("connection {} released ({})", closed.id, closed.reason);
        }
    }
}

#[allow(deprecated)]
fn reset(stream: &TcpStream) {
    if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
        debug!("failed to set linger: {err}");
    }
}

async fn socket_task(
    id: ConnectionId,
    mut stream: TcpStream,
    mut outbound: UnboundedReceiver<Outbound>,
    events: UnboundedSender<SocketEvent>,
) {
    let mut buf = vec![0_u8; REQUEST_BUFFER_SIZE];
    let mut reading = true;

    loop {
        tokio::select! {
            read = stream.read(&mut buf), if reading => {
                let event = match read {
                    Ok(0) => {
                        reading = false;
                        SocketEvent::Received(id, None)
                    }
                    Ok(n) => SocketEvent::Received(id, Some(buf[..n].to_vec())),
                    Err(err) => {
                        debug!("connection {id}: read failed: {err}");
                        reading = false;
                        SocketEvent::Failed(id, StackError::Reset)
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            command = outbound.recv() => match command {
                Some(Outbound::Write(data)) => {
                    let event = match stream.write_all(&data).await {
                        Ok(()) => SocketEvent::Sent(id, data.len()),
                        Err(err) => {
                            debug!("connection {id}: write failed: {err}");
                            SocketEvent::Failed(id, StackError::Reset)
                        }
                    };
                    let _ = events.send(event);
                }
                Some(Outbound::Close) => {
                    let _ = stream.shutdown().await;
                    break;
                }
                Some(Outbound::Abort) => {
                    reset(&stream);
                    break;
                }
                None => break,
            }
        }
    }
}

const DNS_PACKET_SIZE: usize = 512;

// Answers every A query with the gateway until stopped.
pub struct CaptiveDns {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl CaptiveDns {
    pub async fn start(port: u16, gateway: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = socket.local_addr()?;
        info!("captive dns listening on {local_addr}, answering {gateway}");
        Ok(Self {
            local_addr,
            task: tokio::spawn(dns_task(socket, gateway)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(self) {
        self.task.abort();
        info!("captive dns on {} stopped", self.local_addr);
    }
}

async fn dns_task(socket: UdpSocket, gateway: Ipv4Addr) {
    let mut buf = vec![0_u8; DNS_PACKET_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!("dns receive failed: {err}");
                continue;
            }
        };
        let Some(reply) = captive_answer(&buf[..len], gateway) else {
            debug!("dns: ignored {len} bytes from {peer}");
            continue;
        };
        if let Err(err) = socket.send_to(&reply, peer).await {
            debug!("dns reply to {peer} failed: {err}");
        }
    }
}
