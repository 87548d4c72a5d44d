//! Connection driver.
//!
//! Every accepted socket gets one task running `serve`: it feeds framed
//! elements to the `StreamNegotiator`, writes whatever the negotiator and the
//! session's outbound queue produce, performs TLS and compression upgrades,
//! and enforces the idle timeout. The byte-level details live behind
//! `StreamTransport` so TCP and WebSocket listeners share the loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::compression::ZlibStream;
use super::error::{StreamError, StreamErrorCondition, XmppError};
use super::framing::StanzaFramer;
use super::negotiation::{Action, ListenerPolicy, ServerContext, StreamNegotiator};
use super::session::{ConnectionKind, Outbound, PacketDeliverer, Session, SessionStatus};
use super::stanza::Stanza;
use super::tls::{self, TlsInfo};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound between two idle checks.
const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_millis(50);
const READ_BUFFER_SIZE: usize = 8192;

pub(super) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// RAII guard that keeps the active connection count.
/// Decrements even if the connection task returns early.
pub(super) struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub(super) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        debug!(active = prev - 1, "Connection released");
    }
}

/// Per-listener settings shared by its connections.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub kind: ConnectionKind,
    pub policy: ListenerPolicy,
    pub acceptor: Option<TlsAcceptor>,
    pub direct_tls: bool,
    pub idle_timeout: Option<Duration>,
    pub keepalive_ping: bool,
    pub max_stanza_size: usize,
    pub outbound_capacity: usize,
    pub fallback: Option<Arc<dyn PacketDeliverer>>,
}

/// Result of one read from the peer.
pub(super) enum Inbound {
    Elements(Vec<String>),
    /// The bytes could not be framed; the stream must end with this error.
    Invalid(StreamError),
    Eof,
}

#[async_trait]
pub(super) trait StreamTransport: Send {
    /// Wait for the next batch of complete elements. Must be cancel safe.
    async fn receive(&mut self) -> Result<Inbound, XmppError>;

    async fn send(&mut self, data: &str) -> Result<(), XmppError>;

    async fn start_tls(&mut self, acceptor: &TlsAcceptor, conn_id: u64) -> Result<TlsInfo, XmppError>;

    fn start_compression(&mut self) -> Result<(), XmppError>;

    async fn close(&mut self);
}

enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// `<stream:stream>` framing over a TCP socket, optionally TLS and zlib.
pub(super) struct TcpTransport {
    socket: Option<Socket>,
    framer: StanzaFramer,
    codec: Option<ZlibStream>,
    buf: Vec<u8>,
}

impl TcpTransport {
    pub(super) fn new(tcp: TcpStream, max_stanza_size: usize) -> Self {
        Self {
            socket: Some(Socket::Plain(tcp)),
            framer: StanzaFramer::new(max_stanza_size),
            codec: None,
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    async fn receive(&mut self) -> Result<Inbound, XmppError> {
        let n = match self.socket.as_mut() {
            Some(Socket::Plain(s)) => s.read(&mut self.buf).await?,
            Some(Socket::Tls(s)) => s.read(&mut self.buf).await?,
            None => return Ok(Inbound::Eof),
        };
        if n == 0 {
            return Ok(Inbound::Eof);
        }

        let data = match self.codec.as_mut() {
            Some(codec) => match codec.decompress(&self.buf[..n]) {
                Ok(data) => data,
                Err(e) => {
                    debug!(error = %e, "Discarding undecodable compressed data");
                    return Ok(Inbound::Invalid(
                        StreamError::new(StreamErrorCondition::BadFormat).with_text("corrupt compressed data"),
                    ));
                }
            },
            None => self.buf[..n].to_vec(),
        };

        match self.framer.feed(&data) {
            Ok(elements) => Ok(Inbound::Elements(elements)),
            Err(e) => {
                debug!(error = %e, buffered = self.framer.buffered_len(), "Framing failed");
                Ok(Inbound::Invalid(e.stream_error()))
            }
        }
    }

    async fn send(&mut self, data: &str) -> Result<(), XmppError> {
        let compressed;
        let bytes = match self.codec.as_mut() {
            Some(codec) => {
                compressed = codec.compress(data.as_bytes())?;
                compressed.as_slice()
            }
            None => data.as_bytes(),
        };
        match self.socket.as_mut() {
            Some(Socket::Plain(s)) => {
                s.write_all(bytes).await?;
                s.flush().await?;
            }
            Some(Socket::Tls(s)) => {
                s.write_all(bytes).await?;
                s.flush().await?;
            }
            None => return Err(XmppError::internal("write on a closed transport")),
        }
        Ok(())
    }

    async fn start_tls(&mut self, acceptor: &TlsAcceptor, conn_id: u64) -> Result<TlsInfo, XmppError> {
        match self.socket.take() {
            Some(Socket::Plain(tcp)) => {
                let (stream, info) = tls::accept(acceptor, tcp, conn_id).await?;
                self.socket = Some(Socket::Tls(Box::new(stream)));
                self.framer.reset();
                Ok(info)
            }
            other => {
                self.socket = other;
                Err(XmppError::tls("transport is already encrypted"))
            }
        }
    }

    fn start_compression(&mut self) -> Result<(), XmppError> {
        if self.codec.is_some() {
            return Err(XmppError::internal("compression already active"));
        }
        self.codec = Some(ZlibStream::new());
        self.framer.reset();
        Ok(())
    }

    async fn close(&mut self) {
        let result = match self.socket.as_mut() {
            Some(Socket::Plain(s)) => s.shutdown().await,
            Some(Socket::Tls(s)) => s.shutdown().await,
            None => Ok(()),
        };
        if let Err(e) = result {
            debug!(error = %e, "Socket shutdown failed");
        }
        self.socket = None;
    }
}

/// Handle one accepted TCP connection until it closes.
pub(super) async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    settings: Arc<ConnectionSettings>,
    shutdown: broadcast::Receiver<()>,
    active_connections: Arc<AtomicUsize>,
) -> Result<(), XmppError> {
    let conn_id = next_connection_id();
    let _guard = ConnectionGuard::new(active_connections);
    let started = Instant::now();
    info!(conn_id, peer = %peer, kind = %settings.kind, "Connection accepted");

    if let Err(e) = tcp.set_nodelay(true) {
        debug!(conn_id, error = %e, "Failed to set TCP_NODELAY");
    }
    let mut transport = TcpTransport::new(tcp, settings.max_stanza_size);

    let mut tls_info = None;
    if settings.direct_tls {
        let Some(acceptor) = settings.acceptor.as_ref() else {
            return Err(XmppError::tls("direct TLS listener without a certificate"));
        };
        tls_info = Some(transport.start_tls(acceptor, conn_id).await?);
    }

    let result = serve(transport, conn_id, Some(peer), tls_info, ctx, settings, shutdown).await;
    info!(
        conn_id,
        total_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "Connection finished"
    );
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The byte stream was replaced; remaining elements of the read are stale.
    Restarted,
    Closed,
}

enum Event {
    Inbound(Result<Inbound, XmppError>),
    Outbound(Option<Outbound>),
    Watchdog,
    Shutdown,
}

struct Driver<T> {
    conn_id: u64,
    transport: T,
    negotiator: StreamNegotiator,
    settings: Arc<ConnectionSettings>,
}

/// Run a stream on an established transport, then unregister its session.
pub(super) async fn serve<T: StreamTransport>(
    transport: T,
    conn_id: u64,
    peer: Option<SocketAddr>,
    tls_info: Option<TlsInfo>,
    ctx: Arc<ServerContext>,
    settings: Arc<ConnectionSettings>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), XmppError> {
    let (session, mut outbound) = Session::with_capacity(
        conn_id,
        settings.kind,
        peer,
        settings.fallback.clone(),
        settings.outbound_capacity,
    );
    let mut negotiator = StreamNegotiator::new(session.clone(), ctx.clone(), settings.policy);
    if let Some(info) = tls_info {
        negotiator.tls_established(info);
    }
    let mut driver = Driver {
        conn_id,
        transport,
        negotiator,
        settings: settings.clone(),
    };

    let period = settings
        .idle_timeout
        .map(|t| (t / 4).clamp(MIN_WATCHDOG_INTERVAL, WATCHDOG_CHECK_INTERVAL))
        .unwrap_or(WATCHDOG_CHECK_INTERVAL);
    let mut watchdog = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let result = loop {
        let event = tokio::select! {
            inbound = driver.transport.receive() => Event::Inbound(inbound),
            item = outbound.recv() => Event::Outbound(item),
            _ = watchdog.tick() => Event::Watchdog,
            _ = shutdown.recv() => Event::Shutdown,
        };

        let flow = match event {
            Event::Inbound(Err(e)) => {
                debug!(conn_id, error = %e, "Read failed");
                break Err(e);
            }
            Event::Inbound(Ok(Inbound::Eof)) => {
                debug!(conn_id, "Transport closed by peer");
                break Ok(());
            }
            Event::Inbound(Ok(Inbound::Invalid(error))) => {
                let actions = driver.negotiator.fail(error);
                driver.execute(actions).await
            }
            Event::Inbound(Ok(Inbound::Elements(elements))) => {
                session.touch();
                driver.process_elements(elements).await
            }
            Event::Outbound(Some(Outbound::Stanza(raw))) => {
                let actions = driver.negotiator.outgoing(raw);
                if !actions.is_empty() {
                    session.record_sent();
                }
                driver.execute(actions).await
            }
            Event::Outbound(Some(Outbound::Close(Some(error)))) => {
                let actions = driver.negotiator.fail(error);
                driver.execute(actions).await
            }
            Event::Outbound(Some(Outbound::Close(None))) => {
                let actions = driver.negotiator.close();
                driver.execute(actions).await
            }
            // The session keeps a sender alive, so this is unreachable while it exists.
            Event::Outbound(None) => break Ok(()),
            Event::Watchdog => {
                let actions = driver.check_idle(&session);
                driver.execute(actions).await
            }
            Event::Shutdown => {
                let actions = driver
                    .negotiator
                    .fail(StreamError::new(StreamErrorCondition::SystemShutdown));
                driver.execute(actions).await
            }
        };

        match flow {
            Ok(Flow::Closed) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e),
        }
    };

    session.set_status(SessionStatus::Closed);
    ctx.routing().unregister_session(&session);

    // Stanzas still queued go to the fallback deliverer, if any.
    outbound.close();
    while let Ok(item) = outbound.try_recv() {
        if let Outbound::Stanza(raw) = item {
            if let Ok(stanza) = Stanza::parse(raw) {
                session.deliver(&stanza);
            }
        }
    }

    debug!(
        conn_id,
        received = session.stanzas_received(),
        sent = session.stanzas_sent(),
        "Session closed"
    );
    result
}

impl<T: StreamTransport> Driver<T> {
    async fn process_elements(&mut self, elements: Vec<String>) -> Result<Flow, XmppError> {
        for element in elements {
            debug!(conn_id = self.conn_id, data = %element, "RECV");
            let actions = self.negotiator.process(&element);
            match self.execute(actions).await? {
                Flow::Continue => {}
                Flow::Restarted => {
                    debug!(conn_id = self.conn_id, "Byte stream restarted");
                    return Ok(Flow::Continue);
                }
                Flow::Closed => return Ok(Flow::Closed),
            }
        }
        Ok(Flow::Continue)
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Result<Flow, XmppError> {
        for action in actions {
            match action {
                Action::Send(data) => {
                    debug!(conn_id = self.conn_id, data = %data, "SEND");
                    self.transport.send(&data).await?
                }
                Action::StartTls => {
                    let Some(acceptor) = self.settings.acceptor.clone() else {
                        self.transport.close().await;
                        return Err(XmppError::tls("STARTTLS without a certificate"));
                    };
                    match self.transport.start_tls(&acceptor, self.conn_id).await {
                        Ok(info) => self.negotiator.tls_established(info),
                        Err(e) => {
                            self.transport.close().await;
                            return Err(e);
                        }
                    }
                    return Ok(Flow::Restarted);
                }
                Action::StartCompression => {
                    self.transport.start_compression()?;
                    self.negotiator.compression_established();
                    debug!(conn_id = self.conn_id, "Stream compression enabled");
                    return Ok(Flow::Restarted);
                }
                Action::Close => {
                    self.transport.close().await;
                    return Ok(Flow::Closed);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn check_idle(&mut self, session: &Session) -> Vec<Action> {
        let Some(timeout) = self.settings.idle_timeout else {
            return Vec::new();
        };
        let idle_ms = session.idle_millis();
        let timeout_ms = timeout.as_millis() as u64;
        if idle_ms >= timeout_ms {
            warn!(
                conn_id = self.conn_id,
                idle_secs = idle_ms / 1000,
                timeout_secs = timeout.as_secs(),
                "Idle timeout, closing connection"
            );
            return self
                .negotiator
                .fail(StreamError::new(StreamErrorCondition::ConnectionTimeout));
        }
        if self.settings.keepalive_ping && idle_ms >= timeout_ms / 2 {
            if let Some(ping) = self.negotiator.keepalive_ping() {
                debug!(conn_id = self.conn_id, idle_ms, "Sending keep-alive ping");
                return vec![Action::Send(ping)];
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_server::auth::StaticCredentialStore;
    use crate::xmpp_server::cluster::NodeId;
    use crate::xmpp_server::config::{ClientCertPolicy, CompressionPolicy, ServerConfig, TlsConfig, TlsPolicy};
    use crate::xmpp_server::framing::StreamFraming;
    use crate::xmpp_server::routing::{RoutingOptions, RoutingTable};
    use crate::xmpp_server::tls::test_certs::TestCa;
    use std::io::Write;
    use base64::prelude::*;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

    fn context() -> Arc<ServerContext> {
        let mut config = ServerConfig::default();
        config.server.domain = "example.com".to_string();
        let credentials = Arc::new(StaticCredentialStore::new(HashMap::from([(
            "juliet".to_string(),
            "r0m30".to_string(),
        )])));
        let routing = RoutingTable::new(
            "example.com",
            RoutingOptions {
                node_id: NodeId::new("local"),
                ..Default::default()
            },
        );
        Arc::new(ServerContext::new(&config, credentials, routing))
    }

    fn settings(idle_timeout: Option<Duration>, compression: CompressionPolicy) -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings {
            kind: ConnectionKind::Client,
            policy: ListenerPolicy {
                tls: TlsPolicy::Disabled,
                tls_available: false,
                compression,
                framing: StreamFraming::Tcp,
            },
            acceptor: None,
            direct_tls: false,
            idle_timeout,
            keepalive_ping: false,
            max_stanza_size: 64 * 1024,
            outbound_capacity: 64,
            fallback: None,
        })
    }

    /// Accept one connection on an ephemeral port and serve it.
    async fn spawn_server(
        ctx: Arc<ServerContext>,
        settings: Arc<ConnectionSettings>,
    ) -> (
        SocketAddr,
        broadcast::Sender<()>,
        Arc<AtomicUsize>,
        tokio::task::JoinHandle<Result<(), XmppError>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, _) = broadcast::channel(1);
        let active = Arc::new(AtomicUsize::new(0));
        let shutdown = shutdown_tx.subscribe();
        let active_for_task = active.clone();
        let task = tokio::spawn(async move {
            let (tcp, peer) = listener.accept().await.expect("accept");
            handle_connection(tcp, peer, ctx, settings, shutdown, active_for_task).await
        });
        (addr, shutdown_tx, active, task)
    }

    async fn read_until<S>(stream: &mut S, needle: &str) -> String
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let mut seen = String::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !seen.contains(needle) {
                let n = stream.read(&mut buf).await.expect("read");
                if n == 0 {
                    break;
                }
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        })
        .await
        .expect("timed out waiting for server output");
        seen
    }

    #[test]
    fn test_connection_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let _guard = ConnectionGuard::new(counter.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = next_connection_id();
        let b = next_connection_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_login_and_bind_over_tcp() {
        let ctx = context();
        let (addr, _shutdown, active, task) = spawn_server(ctx.clone(), settings(None, CompressionPolicy::Disabled)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(HEADER.as_bytes()).await.unwrap();
        let features = read_until(&mut client, "</stream:features>").await;
        assert!(features.contains("<mechanism>PLAIN</mechanism>"));

        let auth = format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            BASE64_STANDARD.encode("\0juliet\0r0m30")
        );
        // Split mid-element to exercise the framer.
        let (first, second) = auth.split_at(20);
        client.write_all(first.as_bytes()).await.unwrap();
        client.write_all(second.as_bytes()).await.unwrap();
        read_until(&mut client, "<success").await;

        client.write_all(HEADER.as_bytes()).await.unwrap();
        read_until(&mut client, "</stream:features>").await;
        client
            .write_all(b"<iq type='set' id='b'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>r</resource></bind></iq>")
            .await
            .unwrap();
        let bound = read_until(&mut client, "</iq>").await;
        assert!(bound.contains("<jid>juliet@example.com/r</jid>"));
        assert_eq!(active.load(Ordering::SeqCst), 1);

        let address = crate::xmpp_server::jid::Jid::parse("juliet@example.com/r").unwrap();
        assert!(ctx.routing().has_client_route(&address));

        client.write_all(b"</stream:stream>").await.unwrap();
        read_until(&mut client, "</stream:stream>").await;
        task.await.unwrap().unwrap();
        assert!(!ctx.routing().has_client_route(&address));
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_traffic_is_logged_at_debug() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        // The current-thread test runtime keeps the server task on this thread.
        let _default = tracing::subscriber::set_default(subscriber);

        let (addr, _shutdown, _active, task) =
            spawn_server(context(), settings(None, CompressionPolicy::Disabled)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(HEADER.as_bytes()).await.unwrap();
        read_until(&mut client, "</stream:features>").await;
        client.write_all(b"</stream:stream>").await.unwrap();
        read_until(&mut client, "</stream:stream>").await;
        task.await.unwrap().unwrap();

        let output = String::from_utf8_lossy(&logs.0.lock()).to_string();
        assert!(
            output.contains("RECV") && output.contains("data=<stream:stream xmlns='jabber:client'"),
            "{}",
            output
        );
        assert!(output.contains("SEND") && output.contains("<stream:features>"), "{}", output);
    }

    #[tokio::test]
    async fn test_starttls_upgrade_and_restart() {
        tls::init_crypto_provider();
        let ca = TestCa::new();
        let issued = ca.issue("example.com");
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(issued.cert_pem.as_bytes()).unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(issued.key_pem.as_bytes()).unwrap();
        let tls_config = TlsConfig {
            cert_chain: Some(cert.path().to_path_buf()),
            private_key: Some(key.path().to_path_buf()),
            ..Default::default()
        };
        let acceptor = tls::build_acceptor(&tls_config, ClientCertPolicy::Disabled).unwrap();
        let settings = Arc::new(ConnectionSettings {
            policy: ListenerPolicy {
                tls: TlsPolicy::Required,
                tls_available: true,
                compression: CompressionPolicy::Disabled,
                framing: StreamFraming::Tcp,
            },
            acceptor: Some(acceptor),
            ..(*settings(None, CompressionPolicy::Disabled)).clone()
        });

        let ctx = context();
        let (addr, _shutdown, _active, task) = spawn_server(ctx, settings).await;
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(HEADER.as_bytes()).await.unwrap();
        let features = read_until(&mut tcp, "</stream:features>").await;
        assert!(features.contains("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>"));
        assert!(!features.contains("<mechanisms"));

        tcp.write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await.unwrap();
        read_until(&mut tcp, "<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await;

        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.der()).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let server_name = rustls::pki_types::ServerName::try_from("example.com").unwrap();
        let mut stream = connector.connect(server_name, tcp).await.expect("TLS handshake");

        stream.write_all(HEADER.as_bytes()).await.unwrap();
        let features = read_until(&mut stream, "</stream:features>").await;
        assert!(!features.contains("starttls"));
        assert!(features.contains("<mechanism>PLAIN</mechanism>"));

        let auth = format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            BASE64_STANDARD.encode("\0juliet\0r0m30")
        );
        stream.write_all(auth.as_bytes()).await.unwrap();
        read_until(&mut stream, "<success").await;

        stream.write_all(b"</stream:stream>").await.unwrap();
        read_until(&mut stream, "</stream:stream>").await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_xml_closes_with_stream_error() {
        let (addr, _shutdown, _active, task) = spawn_server(context(), settings(None, CompressionPolicy::Disabled)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(HEADER.as_bytes()).await.unwrap();
        read_until(&mut client, "</stream:features>").await;
        client.write_all(b"<message><body></message>").await.unwrap();
        let out = read_until(&mut client, "</stream:stream>").await;
        assert!(out.contains("<not-well-formed xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (addr, _shutdown, _active, task) =
            spawn_server(context(), settings(Some(Duration::from_millis(200)), CompressionPolicy::Disabled)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(HEADER.as_bytes()).await.unwrap();
        let out = read_until(&mut client, "</stream:stream>").await;
        assert!(out.contains("<connection-timeout "));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_system_shutdown() {
        let (addr, shutdown, _active, task) = spawn_server(context(), settings(None, CompressionPolicy::Disabled)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(HEADER.as_bytes()).await.unwrap();
        read_until(&mut client, "</stream:features>").await;
        shutdown.send(()).unwrap();
        let out = read_until(&mut client, "</stream:stream>").await;
        assert!(out.contains("<system-shutdown "));
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_compressed_stream() {
        let (addr, _shutdown, _active, task) = spawn_server(context(), settings(None, CompressionPolicy::Optional)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(HEADER.as_bytes()).await.unwrap();
        let features = read_until(&mut client, "</stream:features>").await;
        assert!(features.contains("<method>zlib</method>"));

        client
            .write_all(b"<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress>")
            .await
            .unwrap();
        read_until(&mut client, "<compressed xmlns='http://jabber.org/protocol/compress'/>").await;

        let mut codec = ZlibStream::new();
        let wire = codec.compress(HEADER.as_bytes()).unwrap();
        client.write_all(&wire).await.unwrap();

        let mut plain = String::new();
        let mut buf = [0u8; 4096];
        tokio::time::timeout(Duration::from_secs(5), async {
            while !plain.contains("</stream:features>") {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0, "server closed the compressed stream");
                plain.push_str(&String::from_utf8_lossy(&codec.decompress(&buf[..n]).unwrap()));
            }
        })
        .await
        .expect("compressed features");
        assert!(plain.contains("<stream:stream"));
        assert!(!plain.contains("<compression"));

        drop(client);
        task.await.unwrap().unwrap();
    }
}
