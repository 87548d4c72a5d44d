//! XMPP server core.
//!
//! Accepts client, server-to-server, component, connection-manager and
//! WebSocket streams, negotiates them, and routes stanzas between the
//! resulting sessions.
//!
//! Module layout:
//! - `framing.rs`: incremental stanza framer and stream wrappers per transport
//! - `negotiation.rs`: per-stream state machine (TLS, SASL, bind, handshake)
//! - `routing.rs` / `outgoing.rs`: routing table and pending outbound servers
//! - `connection.rs` / `websocket.rs`: per-connection drivers

pub mod auth;
pub mod cluster;
pub mod compression;
pub mod config;
mod connection;
pub mod error;
pub mod framing;
pub mod jid;
pub mod negotiation;
pub mod outgoing;
pub mod router;
pub mod routing;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod tls;
mod websocket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use auth::{AuthError, CredentialStore, StaticCredentialStore};
pub use cluster::{ClusterTransport, NodeId};
pub use config::{ListenerClass, ServerConfig};
pub use connection::ConnectionSettings;
pub use error::{StreamError, StreamErrorCondition, XmppError};
pub use jid::Jid;
pub use negotiation::ServerContext;
pub use outgoing::RemoteServerConnector;
pub use router::{PacketInterceptor, PacketRejected, PacketRouter};
pub use routing::{RoutingFailure, RoutingFailureHandler, RoutingOptions, RoutingTable};
pub use sasl::MechanismRegistry;
pub use session::{PacketDeliverer, Session};
pub use stanza::Stanza;

use config::TlsPolicy;
use framing::StreamFraming;
use negotiation::ListenerPolicy;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A running (or ready to run) server instance.
///
/// Listeners are bound by `start` and released by `stop`; the routing table
/// and the other shared components outlive restarts.
pub struct XmppServer {
    config: Arc<ServerConfig>,
    context: Arc<ServerContext>,
    /// Bound listener addresses (useful with port 0)
    local_addrs: HashMap<ListenerClass, SocketAddr>,
    /// Accept loop tasks
    tasks: Vec<JoinHandle<()>>,
    /// Shutdown signal
    shutdown_tx: Option<broadcast::Sender<()>>,
    /// Active connection counter (for diagnostics/logging)
    active_connections: Arc<AtomicUsize>,
    /// Receives stanzas for sessions that closed before delivery
    fallback: Option<Arc<dyn PacketDeliverer>>,
}

impl XmppServer {
    /// Server with the in-memory accounts from `[users]`.
    pub fn new(config: ServerConfig) -> Result<Self, XmppError> {
        let credentials = Arc::new(StaticCredentialStore::new(config.users.clone()));
        Self::with_credentials(config, credentials)
    }

    pub fn with_credentials(config: ServerConfig, credentials: Arc<dyn CredentialStore>) -> Result<Self, XmppError> {
        let options = Self::routing_options(&config);
        Self::with_options(config, credentials, options)
    }

    /// Full control over routing, e.g. to attach a cluster transport or a
    /// remote server connector.
    pub fn with_options(
        config: ServerConfig,
        credentials: Arc<dyn CredentialStore>,
        options: RoutingOptions,
    ) -> Result<Self, XmppError> {
        config.validate()?;
        let routing = RoutingTable::new(config.server.domain.clone(), options);
        info!(
            domain = %config.server.domain,
            node = %routing.node_id(),
            "Server initialized"
        );
        let context = Arc::new(ServerContext::new(&config, credentials, routing));
        Ok(Self {
            config: Arc::new(config),
            context,
            local_addrs: HashMap::new(),
            tasks: Vec::new(),
            shutdown_tx: None,
            active_connections: Arc::new(AtomicUsize::new(0)),
            fallback: None,
        })
    }

    /// Routing options derived from configuration, for callers that want to
    /// add a cluster transport or connector before `with_options`.
    pub fn routing_options(config: &ServerConfig) -> RoutingOptions {
        RoutingOptions {
            node_id: config
                .server
                .node_id
                .clone()
                .map(NodeId::new)
                .unwrap_or_else(NodeId::new_random),
            federation_enabled: config.server.federation_enabled,
            anonymous_outbound: config.server.anonymous_outbound,
            cluster: None,
            connector: None,
        }
    }

    /// Deliverer for stanzas to closed sessions on listeners with
    /// `backup_delivery`. Takes effect on the next `start`.
    pub fn set_fallback_deliverer(&mut self, deliverer: Arc<dyn PacketDeliverer>) {
        self.fallback = Some(deliverer);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        self.context.routing()
    }

    pub fn router(&self) -> &PacketRouter {
        &self.context.router
    }

    pub fn mechanisms(&self) -> &MechanismRegistry {
        &self.context.mechanisms
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn local_addr(&self, class: ListenerClass) -> Option<SocketAddr> {
        self.local_addrs.get(&class).copied()
    }

    fn connection_settings(&self, class: ListenerClass) -> Result<ConnectionSettings, XmppError> {
        let listener = self.config.listeners.get(class);
        let tls_wanted = listener.direct_tls || listener.tls_policy != TlsPolicy::Disabled;
        let acceptor = if tls_wanted && self.config.tls.has_certificate() {
            Some(tls::build_acceptor(&self.config.tls, listener.client_cert_policy)?)
        } else {
            if tls_wanted {
                debug!(listener = class.name(), "No certificate configured, STARTTLS will not be offered");
            }
            None
        };
        let framing = match class {
            ListenerClass::WebSocket => StreamFraming::WebSocket,
            _ => StreamFraming::Tcp,
        };

        Ok(ConnectionSettings {
            kind: class.connection_kind(),
            policy: ListenerPolicy::from_config(listener, framing, acceptor.is_some()),
            acceptor,
            direct_tls: listener.direct_tls,
            idle_timeout: listener.idle_timeout(),
            keepalive_ping: listener.keepalive_ping,
            max_stanza_size: self.config.server.max_stanza_size,
            outbound_capacity: self.config.server.max_queued_stanzas,
            fallback: if listener.backup_delivery {
                self.fallback.clone()
            } else {
                None
            },
        })
    }

    /// Bind every enabled listener and start accepting connections.
    pub async fn start(&mut self) -> Result<(), XmppError> {
        if self.shutdown_tx.is_some() {
            return Err(XmppError::internal("server already running"));
        }
        tls::init_crypto_provider();

        // Bind everything first so a failure leaves nothing running.
        let mut bound = Vec::new();
        for class in ListenerClass::ALL {
            let listener_config = self.config.listeners.get(class);
            if !listener_config.enabled {
                continue;
            }
            let settings = Arc::new(self.connection_settings(class)?);
            let listener = TcpListener::bind((listener_config.bind, listener_config.port))
                .await
                .map_err(|e| {
                    XmppError::internal(format!(
                        "failed to bind {} listener on {}:{}: {}",
                        class.name(),
                        listener_config.bind,
                        listener_config.port,
                        e
                    ))
                })?;
            let local_addr = listener.local_addr()?;
            info!(
                listener = class.name(),
                addr = %local_addr,
                direct_tls = settings.direct_tls,
                starttls = settings.policy.tls_available && !settings.direct_tls,
                "Listening"
            );
            bound.push((class, listener, settings, local_addr));
        }
        if bound.is_empty() {
            warn!("No listener enabled");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        for (class, listener, settings, local_addr) in bound {
            self.local_addrs.insert(class, local_addr);
            self.tasks.push(tokio::spawn(accept_loop(
                class,
                listener,
                self.context.clone(),
                settings,
                shutdown_tx.clone(),
                self.active_connections.clone(),
            )));
        }
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    /// Stop accepting and close every stream with `system-shutdown`.
    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            info!(active = self.active_connections(), "Shutting down");
            let _ = shutdown_tx.send(());
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        self.local_addrs.clear();
    }
}

async fn accept_loop(
    class: ListenerClass,
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    settings: Arc<ConnectionSettings>,
    shutdown_tx: broadcast::Sender<()>,
    active_connections: Arc<AtomicUsize>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(listener = class.name(), error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                debug!(listener = class.name(), addr = %addr, "New connection");
                let ctx = ctx.clone();
                let settings = settings.clone();
                let shutdown = shutdown_tx.subscribe();
                let counter = active_connections.clone();

                tokio::spawn(async move {
                    let result = match class {
                        ListenerClass::WebSocket => {
                            websocket::handle_connection(stream, addr, ctx, settings, shutdown, counter).await
                        }
                        _ => connection::handle_connection(stream, addr, ctx, settings, shutdown, counter).await,
                    };
                    if let Err(e) = result {
                        warn!(listener = class.name(), addr = %addr, error = %e, "Connection error");
                    }
                });
            }
            _ = shutdown_rx.recv() => {
                info!(listener = class.name(), "Listener stopped");
                break;
            }
        }
    }
}
