//! Packet router: interception around the routing table.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::error::StanzaErrorCondition;
use super::jid::Jid;
use super::routing::RoutingTable;
use super::session::Session;
use super::stanza::{Element, Stanza};

/// Rejection returned by an interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRejected {
    pub reason: String,
    /// Text delivered to the sender as a headline message.
    pub notification: Option<String>,
}

impl PacketRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            notification: None,
        }
    }

    pub fn with_notification(mut self, text: impl Into<String>) -> Self {
        self.notification = Some(text.into());
        self
    }
}

/// Hook called before (`processed == false`) and after (`processed == true`)
/// a stanza is handled. Only a rejection before handling vetoes it.
///
/// `incoming` is true for stanzas read from the session's peer and false for
/// stanzas about to be written to it.
pub trait PacketInterceptor: Send + Sync {
    fn intercept(
        &self,
        stanza: &Stanza,
        session: &Session,
        incoming: bool,
        processed: bool,
    ) -> Result<(), PacketRejected>;
}

pub struct PacketRouter {
    routing: Arc<RoutingTable>,
    interceptors: RwLock<Vec<Arc<dyn PacketInterceptor>>>,
}

impl PacketRouter {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self {
            routing,
            interceptors: RwLock::new(Vec::new()),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<dyn PacketInterceptor>) -> bool {
        let mut interceptors = self.interceptors.write();
        let before = interceptors.len();
        interceptors.retain(|i| !Arc::ptr_eq(i, interceptor));
        interceptors.len() != before
    }

    pub fn has_interceptors(&self) -> bool {
        !self.interceptors.read().is_empty()
    }

    /// Run the interceptors on a stanza about to be written to `session`.
    /// Returns false when it was rejected and must be dropped.
    pub fn intercept_outgoing(&self, stanza: &Stanza, session: &Session) -> bool {
        let interceptors = self.interceptors.read().clone();
        for interceptor in &interceptors {
            if let Err(rejected) = interceptor.intercept(stanza, session, false, false) {
                info!(
                    conn_id = session.conn_id(),
                    stanza = stanza.local_name(),
                    reason = %rejected.reason,
                    "Outgoing stanza rejected by interceptor"
                );
                return false;
            }
        }
        for interceptor in &interceptors {
            if let Err(rejected) = interceptor.intercept(stanza, session, false, true) {
                debug!(conn_id = session.conn_id(), reason = %rejected.reason, "Post-delivery interceptor objected");
            }
        }
        true
    }

    /// Route a stanza received from `session`.
    pub fn route(&self, stanza: Stanza, session: &Arc<Session>, to: &Jid) {
        let interceptors = self.interceptors.read().clone();

        for interceptor in &interceptors {
            if let Err(rejected) = interceptor.intercept(&stanza, session, true, false) {
                self.reject(&stanza, session, rejected);
                return;
            }
        }

        let routed = if interceptors.is_empty() {
            None
        } else {
            Some(stanza.clone())
        };
        self.routing.route(to, stanza);

        if let Some(stanza) = routed {
            for interceptor in &interceptors {
                if let Err(rejected) = interceptor.intercept(&stanza, session, true, true) {
                    debug!(conn_id = session.conn_id(), reason = %rejected.reason, "Post-routing interceptor objected");
                }
            }
        }
    }

    fn reject(&self, stanza: &Stanza, session: &Session, rejected: PacketRejected) {
        info!(
            conn_id = session.conn_id(),
            stanza = stanza.local_name(),
            reason = %rejected.reason,
            "Stanza rejected by interceptor"
        );
        if let Some(reply) = stanza.error_reply(StanzaErrorCondition::PolicyViolation, Some(&rejected.reason)) {
            session.deliver(&reply);
        }

        let (Some(text), Some(address)) = (rejected.notification, session.address()) else {
            return;
        };
        let notice = Element::new("message")
            .with_attr("type", "headline")
            .with_attr("from", self.routing.domain())
            .with_attr("to", address.to_string())
            .with_child(Element::new("body").with_text(text));
        session.deliver(&Stanza::from_element(notice));
    }
}
