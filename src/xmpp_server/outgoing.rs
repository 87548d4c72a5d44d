//! Pending outbound server connections.
//!
//! Stanzas for a remote domain without a server route are queued here while
//! one connection attempt per domain is in flight. Connection setup itself
//! (DNS, dialing, authentication towards the peer) belongs to a
//! `RemoteServerConnector` supplied by the embedding application.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use super::error::XmppError;
use super::jid::Jid;
use super::routing::{RoutingFailure, RoutingTable};
use super::session::Session;
use super::stanza::Stanza;

#[async_trait]
pub trait RemoteServerConnector: Send + Sync {
    /// Open an authenticated outbound stream from `local_domain` to
    /// `remote_domain` and return its session.
    async fn connect(&self, local_domain: &str, remote_domain: &str) -> Result<Arc<Session>, XmppError>;
}

pub struct OutgoingSessionManager {
    connector: RwLock<Option<Arc<dyn RemoteServerConnector>>>,
    pending: DashMap<String, Vec<Stanza>>,
}

impl OutgoingSessionManager {
    pub fn new(connector: Option<Arc<dyn RemoteServerConnector>>) -> Self {
        Self {
            connector: RwLock::new(connector),
            pending: DashMap::new(),
        }
    }

    pub fn set_connector(&self, connector: Arc<dyn RemoteServerConnector>) {
        *self.connector.write() = Some(connector);
    }

    pub fn has_connector(&self) -> bool {
        self.connector.read().is_some()
    }

    pub fn is_pending(&self, domain: &str) -> bool {
        self.pending.contains_key(domain)
    }

    pub fn pending_domains(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    /// Queue a stanza. Returns true when no attempt was in flight for the
    /// domain, in which case the caller starts one.
    pub(super) fn enqueue(&self, domain: &str, stanza: Stanza) -> bool {
        match self.pending.entry(domain.to_string()) {
            Entry::Occupied(mut queue) => {
                queue.get_mut().push(stanza);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(vec![stanza]);
                true
            }
        }
    }

    pub(super) fn take(&self, domain: &str) -> Vec<Stanza> {
        self.pending
            .remove(domain)
            .map(|(_, queue)| queue)
            .unwrap_or_default()
    }

    /// Run one connection attempt and settle the queue either way.
    pub(super) async fn establish(&self, routing: &Arc<RoutingTable>, domain: &str) {
        let connector = self.connector.read().clone();
        let result = match connector {
            Some(connector) => {
                info!(local = routing.domain(), remote = domain, "Opening outbound server connection");
                connector.connect(routing.domain(), domain).await
            }
            None => Err(XmppError::routing("no remote server connector configured")),
        };

        match result {
            Ok(session) => {
                if session.address().is_none() {
                    if let Ok(address) = Jid::domain_jid(domain) {
                        session.set_address(address);
                    }
                }
                routing.complete_outgoing(domain, session);
            }
            Err(e) => {
                warn!(remote = domain, error = %e, "Outbound server connection failed");
                for stanza in routing.take_pending(domain) {
                    routing.report_failure(&stanza, RoutingFailure::RemoteServerNotFound);
                }
            }
        }
    }
}
