//! XMPP over WebSocket (RFC 7395).
//!
//! Each text message carries exactly one element. Messages still go through
//! the stanza framer, so the XML rules and size limit of TCP streams apply
//! here too. The stream wrappers are `<open/>` and `<close/>`. STARTTLS and
//! stream compression do not exist here: `wss` listeners use direct TLS.

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, info};

use super::connection::{next_connection_id, serve, ConnectionGuard, ConnectionSettings, Inbound, StreamTransport};
use super::error::{StreamError, StreamErrorCondition, XmppError};
use super::framing::StanzaFramer;
use super::negotiation::ServerContext;
use super::tls::{self, TlsInfo};

const SUBPROTOCOL: &str = "xmpp";

/// Echo the `xmpp` subprotocol when the client offers it.
fn negotiate_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case(SUBPROTOCOL));
    if offered {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    } else {
        debug!(uri = %request.uri(), "WebSocket client did not offer the xmpp subprotocol");
    }
    Ok(response)
}

/// Protocol limits for a listener. Frames and messages above the stanza
/// size limit are refused before they are buffered.
fn websocket_config(max_stanza_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_stanza_size);
    config.max_frame_size = Some(max_stanza_size);
    config
}

pub(super) struct WebSocketTransport<S> {
    ws: WebSocketStream<S>,
    framer: StanzaFramer,
}

impl<S> WebSocketTransport<S> {
    pub(super) fn new(ws: WebSocketStream<S>, max_stanza_size: usize) -> Self {
        Self {
            ws,
            framer: StanzaFramer::new(max_stanza_size),
        }
    }

    fn frame_message(&mut self, text: &str) -> Inbound {
        let elements = match self.framer.feed(text.as_bytes()) {
            Ok(elements) => elements,
            Err(e) => {
                debug!(error = %e, "Rejected WebSocket message");
                return Inbound::Invalid(e.stream_error());
            }
        };
        if self.framer.buffered_len() > 0 {
            return Inbound::Invalid(
                StreamError::new(StreamErrorCondition::NotWellFormed)
                    .with_text("message does not end with a complete element"),
            );
        }
        Inbound::Elements(elements)
    }
}

#[async_trait]
impl<S> StreamTransport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Inbound, XmppError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => match self.frame_message(&text) {
                    // Whitespace keepalives.
                    Inbound::Elements(elements) if elements.is_empty() => continue,
                    inbound => return Ok(inbound),
                },
                Some(Ok(Message::Binary(_))) => {
                    return Ok(Inbound::Invalid(
                        StreamError::new(StreamErrorCondition::BadFormat).with_text("binary frames are not allowed"),
                    ));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(Inbound::Eof),
                Some(Ok(_)) => continue,
                Some(Err(WsError::Capacity(e))) => {
                    debug!(error = %e, "WebSocket message over the size limit");
                    return Ok(Inbound::Invalid(
                        StreamError::new(StreamErrorCondition::PolicyViolation)
                            .with_text("stanza exceeds the maximum size"),
                    ));
                }
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read error");
                    return Ok(Inbound::Eof);
                }
            }
        }
    }

    async fn send(&mut self, data: &str) -> Result<(), XmppError> {
        self.ws
            .send(Message::Text(data.to_string()))
            .await
            .map_err(|e| XmppError::internal(format!("WebSocket write failed: {}", e)))
    }

    async fn start_tls(&mut self, _acceptor: &TlsAcceptor, _conn_id: u64) -> Result<TlsInfo, XmppError> {
        Err(XmppError::tls("STARTTLS is not available over WebSocket"))
    }

    fn start_compression(&mut self) -> Result<(), XmppError> {
        Err(XmppError::internal("stream compression is not available over WebSocket"))
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "Stream closed".into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// Handle one accepted WebSocket listener connection until it closes.
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
    info!(conn_id, peer = %peer, "WebSocket connection accepted");
    let config = websocket_config(settings.max_stanza_size);

    let result = if settings.direct_tls {
        let Some(acceptor) = settings.acceptor.as_ref() else {
            return Err(XmppError::tls("wss listener without a certificate"));
        };
        let (stream, info) = tls::accept(acceptor, tcp, conn_id).await?;
        let ws = accept_hdr_async_with_config(stream, negotiate_subprotocol, Some(config))
            .await
            .map_err(|e| XmppError::internal(format!("WebSocket handshake failed: {}", e)))?;
        let transport = WebSocketTransport::new(ws, settings.max_stanza_size);
        serve(transport, conn_id, Some(peer), Some(info), ctx, settings, shutdown).await
    } else {
        let ws = accept_hdr_async_with_config(tcp, negotiate_subprotocol, Some(config))
            .await
            .map_err(|e| XmppError::internal(format!("WebSocket handshake failed: {}", e)))?;
        let transport = WebSocketTransport::new(ws, settings.max_stanza_size);
        serve(transport, conn_id, Some(peer), None, ctx, settings, shutdown).await
    };

    info!(
        conn_id,
        total_ms = started.elapsed().as_millis() as u64,
        ok = result.is_ok(),
        "WebSocket connection finished"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_server::auth::StaticCredentialStore;
    use crate::xmpp_server::cluster::NodeId;
    use crate::xmpp_server::config::{CompressionPolicy, ServerConfig, TlsPolicy};
    use crate::xmpp_server::framing::StreamFraming;
    use crate::xmpp_server::negotiation::ListenerPolicy;
    use crate::xmpp_server::routing::{RoutingOptions, RoutingTable};
    use crate::xmpp_server::session::ConnectionKind;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::MaybeTlsStream;

    async fn next_text<S>(ws: &mut WebSocketStream<S>) -> String
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("read error");
            match msg {
                Message::Text(text) => return text.to_string(),
                Message::Close(_) => panic!("closed"),
                _ => continue,
            }
        }
    }

    fn settings() -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings {
            kind: ConnectionKind::Client,
            policy: ListenerPolicy {
                tls: TlsPolicy::Optional,
                tls_available: false,
                compression: CompressionPolicy::Optional,
                framing: StreamFraming::WebSocket,
            },
            acceptor: None,
            direct_tls: false,
            idle_timeout: None,
            keepalive_ping: false,
            max_stanza_size: 64 * 1024,
            outbound_capacity: 64,
            fallback: None,
        })
    }

    /// Serve one WebSocket connection on a fresh local listener.
    async fn spawn_server() -> (SocketAddr, tokio::task::JoinHandle<Result<(), XmppError>>, Arc<AtomicUsize>) {
        let mut config = ServerConfig::default();
        config.server.domain = "example.com".to_string();
        let routing = RoutingTable::new(
            "example.com",
            RoutingOptions {
                node_id: NodeId::new("local"),
                ..Default::default()
            },
        );
        let ctx = Arc::new(ServerContext::new(
            &config,
            Arc::new(StaticCredentialStore::new(HashMap::new())),
            routing,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let active = Arc::new(AtomicUsize::new(0));
        let active_for_task = active.clone();
        let task = tokio::spawn(async move {
            let (shutdown_tx, _) = broadcast::channel(1);
            let shutdown = shutdown_tx.subscribe();
            let (tcp, peer) = listener.accept().await.expect("accept");
            handle_connection(tcp, peer, ctx, settings(), shutdown, active_for_task).await
        });
        (addr, task, active)
    }

    async fn open_stream(addr: SocketAddr) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let mut request = format!("ws://{}", addr).into_client_request().unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("xmpp"));
        let (mut ws, response) = tokio_tungstenite::connect_async(request).await.expect("connect");
        assert_eq!(
            response.headers().get(SEC_WEBSOCKET_PROTOCOL).map(|v| v.as_bytes()),
            Some(&b"xmpp"[..])
        );

        ws.send(Message::Text(
            "<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.com' version='1.0'/>".into(),
        ))
        .await
        .unwrap();
        let open = next_text(&mut ws).await;
        assert!(open.starts_with("<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'"));
        let features = next_text(&mut ws).await;
        assert!(features.starts_with("<stream:features xmlns:stream="));
        assert!(!features.contains("starttls"));
        ws
    }

    #[tokio::test]
    async fn test_open_features_and_close() {
        let (addr, task, active) = spawn_server().await;
        let mut ws = open_stream(addr).await;
        assert_eq!(active.load(Ordering::SeqCst), 1);

        // Whitespace keepalives are ignored.
        ws.send(Message::Text(" \n".into())).await.unwrap();
        ws.send(Message::Text("<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>".into()))
            .await
            .unwrap();
        let close = next_text(&mut ws).await;
        assert_eq!(close, "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>");

        task.await.unwrap().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    async fn assert_rejected(message: &str, condition: &str) {
        let (addr, task, _active) = spawn_server().await;
        let mut ws = open_stream(addr).await;
        ws.send(Message::Text(message.to_string())).await.unwrap();
        let error = next_text(&mut ws).await;
        assert!(error.starts_with("<stream:error"), "{}", error);
        assert!(error.contains(condition), "{}", error);
        let close = next_text(&mut ws).await;
        assert_eq!(close, "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>");
        let _ = task.await.unwrap();
    }

    #[tokio::test]
    async fn test_control_character_is_not_well_formed() {
        assert_rejected("<message><body>\u{1}</body></message>", "<not-well-formed").await;
    }

    #[tokio::test]
    async fn test_illegal_character_reference_is_not_well_formed() {
        assert_rejected("<message><body>&#xFFFE;</body></message>", "<not-well-formed").await;
    }

    #[tokio::test]
    async fn test_partial_element_is_not_well_formed() {
        assert_rejected("<message><body>hi</body>", "<not-well-formed").await;
    }

    #[test]
    fn test_protocol_limits_follow_stanza_size() {
        let config = websocket_config(4096);
        assert_eq!(config.max_message_size, Some(4096));
        assert_eq!(config.max_frame_size, Some(4096));
    }

    #[tokio::test]
    async fn test_oversized_message_ends_stream() {
        let (addr, task, active) = spawn_server().await;
        let mut ws = open_stream(addr).await;
        let body = "a".repeat(70 * 1024);
        // The peer may also drop the socket mid-write.
        let _ = ws.send(Message::Text(format!("<message><body>{}</body></message>", body))).await;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.expect("timed out") {
                Some(Ok(Message::Text(text))) => {
                    assert!(!text.contains("<message"), "{}", text);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            }
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await.expect("server task did not end");
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
