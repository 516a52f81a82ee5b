use super::{
    manager::ConnectionContext,
    sip_addr::{ConnectionIdentity, SipAddr},
    stream::{FrameEvent, SipFramer},
};
use crate::{Error, Result};
use bytes::Bytes;
use rsip::transport::Transport;
use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpSocket, TcpStream},
    select,
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    time::timeout,
};
use tokio_rustls::{rustls::pki_types::ServerName, TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, error, info, warn};

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Bound on the close handshake; a TLS close_notify stalls behind a full
/// send buffer.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Client side, before the TCP connect completed.
    Connecting,
    /// TLS only, while the handshake runs.
    Handshaking,
    Active,
    Closing,
    Closed,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Handshaking,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// The socket a connection owns: plain TCP, or a TLS session that owns the
/// TCP socket underneath it.
pub enum SipStream {
    Plain(TcpStream),
    Secured(Box<TlsStream<TcpStream>>),
}

impl SipStream {
    /// The raw TCP socket, whichever way the stream is wrapped.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            SipStream::Plain(stream) => stream,
            SipStream::Secured(stream) => stream.get_ref().0,
        }
    }

    pub fn is_secured(&self) -> bool {
        matches!(self, SipStream::Secured(_))
    }
}

impl AsyncRead for SipStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SipStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SipStream::Secured(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SipStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SipStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SipStream::Secured(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SipStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SipStream::Secured(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SipStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SipStream::Secured(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// What the serve loop does with the result of a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Data(usize),
    /// Empty or failed read below the threshold; read again.
    Retry,
    /// The threshold was reached; tear the connection down.
    Exhausted,
}

/// Counts consecutive empty or failed reads. Any read that returns data
/// resets the count.
#[derive(Debug)]
pub(crate) struct ReadExceptions {
    count: usize,
    threshold: usize,
}

impl ReadExceptions {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            count: 0,
            threshold,
        }
    }

    pub(crate) fn observe(&mut self, result: &io::Result<usize>) -> ReadOutcome {
        match result {
            Ok(n) if *n > 0 => {
                self.count = 0;
                ReadOutcome::Data(*n)
            }
            _ => {
                self.count += 1;
                if self.count >= self.threshold {
                    ReadOutcome::Exhausted
                } else {
                    ReadOutcome::Retry
                }
            }
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }
}

struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

struct ConnectionInner {
    id: u64,
    scheme: Transport,
    state: AtomicU8,
    local: OnceLock<SipAddr>,
    remote: OnceLock<SipAddr>,
    target: OnceLock<SipAddr>,
    tls: Option<TlsClient>,
    bound: Mutex<Option<TcpSocket>>,
    outgoing: UnboundedSender<Bytes>,
    queue: Mutex<Option<UnboundedReceiver<Bytes>>>,
    stopped: AtomicBool,
    ctx: ConnectionContext,
    cancel_token: tokio_util::sync::CancellationToken,
}

/// A SIP connection over TCP or TLS.
///
/// Cloning is cheap and every clone refers to the same connection. The
/// read loop holds its own clone, so the connection lives at least as long
/// as the socket is being served.
///
/// The read loop feeds each read into a [`SipFramer`], hands complete
/// messages to the dispatch sink in order and answers keep-alive probes.
/// Consecutive empty or failed reads are counted; reaching
/// `max_read_exceptions` closes the socket and unregisters the connection
/// from its manager. Outgoing messages are queued and written by the same
/// loop, so they reach the wire in the order they were queued.
#[derive(Clone)]
pub struct StreamedConnection {
    inner: Arc<ConnectionInner>,
}

impl StreamedConnection {
    fn new(
        scheme: Transport,
        state: ConnectionState,
        tls: Option<TlsClient>,
        ctx: ConnectionContext,
    ) -> Self {
        let (outgoing, queue) = unbounded_channel();
        let cancel_token = ctx.cancel_token.child_token();
        StreamedConnection {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                scheme,
                state: AtomicU8::new(state as u8),
                local: OnceLock::new(),
                remote: OnceLock::new(),
                target: OnceLock::new(),
                tls,
                bound: Mutex::new(None),
                outgoing,
                queue: Mutex::new(Some(queue)),
                stopped: AtomicBool::new(false),
                ctx,
                cancel_token,
            }),
        }
    }

    /// A plain TCP client connection, to be opened with
    /// [`client_connect`](Self::client_connect).
    pub fn client(ctx: ConnectionContext) -> Self {
        Self::new(Transport::Tcp, ConnectionState::Connecting, None, ctx)
    }

    /// A TLS client connection; `server_name` is checked against the
    /// peer certificate.
    pub fn client_tls(
        ctx: ConnectionContext,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    ) -> Self {
        let tls = TlsClient {
            connector,
            server_name,
        };
        Self::new(Transport::Tls, ConnectionState::Connecting, Some(tls), ctx)
    }

    /// Binds the client socket to the first free port in
    /// `[port_base, port_max)`. An empty range binds `port_base` alone, so
    /// `client_bind(ip, 0, 0)` picks an ephemeral port.
    pub fn client_bind(&self, ip: IpAddr, port_base: u16, port_max: u16) -> Result<SocketAddr> {
        if self.state() != ConnectionState::Connecting {
            return Err(self.state_error("bind"));
        }
        let last = port_max.saturating_sub(1).max(port_base);
        for port in port_base..=last {
            let socket = match ip {
                IpAddr::V4(_) => TcpSocket::new_v4()?,
                IpAddr::V6(_) => TcpSocket::new_v6()?,
            };
            match socket.bind(SocketAddr::new(ip, port)) {
                Ok(()) => {
                    let local = socket.local_addr()?;
                    debug!(id = self.id(), %local, "client socket bound");
                    *self
                        .inner
                        .bound
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(socket);
                    return Ok(local);
                }
                Err(e) => debug!(id = self.id(), port, "bind failed: {}", e),
            }
        }
        Err(Error::TransportLayerError(
            format!("no free port in {}..{}", port_base, port_max),
            SipAddr::new(self.scheme(), SocketAddr::new(ip, port_base).into()),
        ))
    }

    /// Connects (and for TLS, handshakes) with `target`, then starts
    /// serving the socket and registers with the connection manager.
    ///
    /// A missing or zero port means 5060. Failures are logged, leave the
    /// connection `Closing` and are not retried; nothing is registered.
    pub async fn client_connect(&self, target: SipAddr) -> Result<()> {
        if self.state() != ConnectionState::Connecting {
            return Err(self.state_error("connect"));
        }
        let target = SipAddr {
            r#type: Some(self.scheme()),
            addr: target.addr,
        }
        .with_default_port();
        self.inner.target.set(target.clone()).ok();

        match self.establish(&target).await {
            Ok(stream) => self.activate(stream),
            Err(e) => {
                self.set_state(ConnectionState::Closing);
                warn!(identity = %self.identity(), "connect to {} failed: {}", target, e);
                Err(e)
            }
        }
    }

    async fn establish(&self, target: &SipAddr) -> Result<SipStream> {
        let addr = target.resolve().await?;
        let bound = self
            .inner
            .bound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let socket = match bound {
            Some(socket) => socket,
            None if addr.is_ipv4() => TcpSocket::new_v4()?,
            None => TcpSocket::new_v6()?,
        };

        let tcp = select! {
            _ = self.inner.cancel_token.cancelled() => {
                return Err(Error::TransportLayerError(
                    "connection stopped".to_string(),
                    target.clone(),
                ));
            }
            result = socket.connect(addr) => result?,
        };
        tcp.set_nodelay(true).ok();

        match &self.inner.tls {
            None => Ok(SipStream::Plain(tcp)),
            Some(tls) => {
                self.set_state(ConnectionState::Handshaking);
                let stream = tls.connector.connect(tls.server_name.clone(), tcp).await?;
                Ok(SipStream::Secured(Box::new(TlsStream::Client(stream))))
            }
        }
    }

    /// Serves an accepted plain TCP socket.
    pub fn accept(tcp: TcpStream, ctx: ConnectionContext) -> Result<Self> {
        let connection = Self::new(Transport::Tcp, ConnectionState::Active, None, ctx);
        connection.activate(SipStream::Plain(tcp))?;
        Ok(connection)
    }

    /// Runs the server side TLS handshake on an accepted socket and serves
    /// it. A failed handshake drops the socket without registering.
    pub async fn accept_tls(
        tcp: TcpStream,
        acceptor: &TlsAcceptor,
        ctx: ConnectionContext,
    ) -> Result<Self> {
        let connection = Self::new(Transport::Tls, ConnectionState::Handshaking, None, ctx);
        if let Ok(peer) = tcp.peer_addr() {
            connection
                .inner
                .remote
                .set(SipAddr::new(Transport::Tls, peer.into()))
                .ok();
        }
        match acceptor.accept(tcp).await {
            Ok(stream) => {
                connection.activate(SipStream::Secured(Box::new(TlsStream::Server(stream))))?;
                Ok(connection)
            }
            Err(e) => {
                connection.set_state(ConnectionState::Closing);
                warn!(identity = %connection.identity(), "TLS handshake failed: {}", e);
                Err(Error::TlsError(e.to_string()))
            }
        }
    }

    fn activate(&self, stream: SipStream) -> Result<()> {
        self.resolve_addrs(&stream);
        let queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(queue) = queue else {
            return Err(self.state_error("start"));
        };
        if self.inner.cancel_token.is_cancelled() {
            self.set_state(ConnectionState::Closed);
            return Err(self.state_error("start"));
        }

        self.set_state(ConnectionState::Active);
        info!(identity = %self.identity(), "connection established");
        self.inner.ctx.manager.start(self.clone());
        tokio::spawn(self.clone().serve_loop(stream, queue));
        Ok(())
    }

    async fn serve_loop(self, mut stream: SipStream, mut queue: UnboundedReceiver<Bytes>) {
        let config = self.inner.ctx.config.clone();
        let mut framer = SipFramer::new(&config);
        let mut buf = vec![0u8; config.read_buffer_size];
        let mut exceptions = ReadExceptions::new(config.max_read_exceptions);

        loop {
            select! {
                _ = self.inner.cancel_token.cancelled() => {
                    info!(identity = %self.identity(), "connection stopped");
                    break;
                }
                Some(data) = queue.recv() => {
                    if let Err(e) = self.write_or_cancel(&mut stream, &data).await {
                        warn!(identity = %self.identity(), "write failed: {}", e);
                        break;
                    }
                }
                result = stream.read(&mut buf) => {
                    let n = match exceptions.observe(&result) {
                        ReadOutcome::Data(n) => n,
                        ReadOutcome::Retry => {
                            match &result {
                                Err(e) => warn!(identity = %self.identity(), exceptions = exceptions.count(), "read failed: {}", e),
                                Ok(_) => warn!(identity = %self.identity(), exceptions = exceptions.count(), "read returned no data"),
                            }
                            continue;
                        }
                        ReadOutcome::Exhausted => {
                            error!(identity = %self.identity(), exceptions = exceptions.count(), "too many failed reads, closing");
                            break;
                        }
                    };
                    if self.inner.remote.get().is_none() {
                        self.resolve_addrs(&stream);
                    }
                    if !self.handle_read(&mut framer, &buf[..n], &mut stream).await {
                        break;
                    }
                }
            }
        }
        self.teardown(&mut stream).await;
    }

    /// Writes `data` unless the connection is stopped first. A peer that
    /// stops reading must not keep the serve loop from noticing `stop`.
    async fn write_or_cancel(&self, stream: &mut SipStream, data: &[u8]) -> io::Result<()> {
        select! {
            _ = self.inner.cancel_token.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "connection stopped"))
            }
            result = write_to_stream(stream, data) => result,
        }
    }

    /// Returns false when the socket can no longer be written.
    async fn handle_read(
        &self,
        framer: &mut SipFramer,
        data: &[u8],
        stream: &mut SipStream,
    ) -> bool {
        for event in framer.decode_read(data) {
            match event {
                FrameEvent::Message(msg) => {
                    debug!(identity = %self.identity(), "received {}", msg.start_line());
                    self.inner.ctx.dispatch.on_received_message(msg, self);
                }
                FrameEvent::KeepaliveRequest => {
                    debug!(identity = %self.identity(), "keepalive request");
                    if let Err(e) = self.write_or_cancel(stream, KEEPALIVE_RESPONSE).await {
                        warn!(identity = %self.identity(), "keepalive response failed: {}", e);
                        return false;
                    }
                }
                FrameEvent::Invalid => {
                    warn!(identity = %self.identity(), "dropping malformed message");
                }
            }
        }
        true
    }

    async fn teardown(&self, stream: &mut SipStream) {
        self.set_state(ConnectionState::Closing);
        match timeout(SHUTDOWN_TIMEOUT, stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(identity = %self.identity(), "shutdown failed: {}", e),
            Err(_) => debug!(identity = %self.identity(), "shutdown timed out"),
        }
        self.set_state(ConnectionState::Closed);
        info!(identity = %self.identity(), "connection closed");
        if !self.inner.stopped.swap(true, Ordering::AcqRel) {
            self.inner.ctx.manager.stop(self);
        }
    }

    /// Closes the connection. No read is issued afterwards and queued
    /// writes are dropped.
    pub fn stop(&self) {
        if self.inner.cancel_token.is_cancelled() {
            return;
        }
        info!(identity = %self.identity(), "stopping connection");
        self.inner.cancel_token.cancel();
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Handshaking
        ) {
            self.set_state(ConnectionState::Closing);
        }
    }

    /// Queues pre-serialized message bytes.
    pub fn write_message(&self, data: Bytes) -> Result<()> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => Err(self.state_error("write")),
            _ => self
                .inner
                .outgoing
                .send(data)
                .map_err(|_| self.state_error("write")),
        }
    }

    pub fn write_sip_message(&self, msg: &rsip::SipMessage) -> Result<()> {
        self.write_message(Bytes::from(msg.to_string()))
    }

    /// Sends a `"\r\n\r\n"` probe; the peer's `"\r\n"` pong is absorbed by
    /// the framer.
    pub fn write_keep_alive(&self) -> Result<()> {
        self.write_message(Bytes::from_static(KEEPALIVE_REQUEST))
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn scheme(&self) -> Transport {
        self.inner.scheme
    }

    pub fn is_secured(&self) -> bool {
        self.inner.scheme == Transport::Tls
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    pub fn local_addr(&self) -> Option<SipAddr> {
        self.inner.local.get().cloned()
    }

    /// The peer address, or the connect target until the socket reports it.
    pub fn remote_addr(&self) -> Option<SipAddr> {
        self.inner
            .remote
            .get()
            .or_else(|| self.inner.target.get())
            .cloned()
    }

    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity {
            id: self.inner.id,
            scheme: self.inner.scheme,
            local: self.local_addr(),
            remote: self.remote_addr(),
        }
    }

    fn resolve_addrs(&self, stream: &SipStream) {
        let tcp = stream.tcp();
        if let Ok(addr) = tcp.local_addr() {
            self.inner
                .local
                .set(SipAddr::new(self.scheme(), addr.into()))
                .ok();
        }
        if let Ok(addr) = tcp.peer_addr() {
            self.inner
                .remote
                .set(SipAddr::new(self.scheme(), addr.into()))
                .ok();
        }
    }

    fn state_error(&self, operation: &str) -> Error {
        Error::TransportLayerError(
            format!("cannot {} in state {:?}", operation, self.state()),
            self.remote_addr().unwrap_or_default(),
        )
    }
}

async fn write_to_stream(stream: &mut SipStream, data: &[u8]) -> io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}

impl fmt::Display for StreamedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity())
    }
}

impl fmt::Debug for StreamedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::{ReadExceptions, ReadOutcome};
    use crate::config::MAX_READ_EXCEPTIONS;
    use std::io;

    fn reset() -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
    }

    #[test]
    fn test_read_exceptions_reset_on_data() {
        let mut exceptions = ReadExceptions::new(MAX_READ_EXCEPTIONS);
        for failure in [Ok(0), reset(), Ok(0), reset()] {
            assert_eq!(exceptions.observe(&failure), ReadOutcome::Retry);
        }
        assert_eq!(exceptions.count(), 4);

        assert_eq!(exceptions.observe(&Ok(12)), ReadOutcome::Data(12));
        assert_eq!(exceptions.count(), 0);

        for failure in [reset(), reset(), Ok(0), Ok(0)] {
            assert_eq!(exceptions.observe(&failure), ReadOutcome::Retry);
        }
        assert_eq!(exceptions.observe(&reset()), ReadOutcome::Exhausted);
        assert_eq!(exceptions.count(), MAX_READ_EXCEPTIONS);
    }

    #[test]
    fn test_read_exceptions_threshold_one() {
        let mut exceptions = ReadExceptions::new(1);
        assert_eq!(exceptions.observe(&Ok(1)), ReadOutcome::Data(1));
        assert_eq!(exceptions.observe(&Ok(0)), ReadOutcome::Exhausted);
    }
}
