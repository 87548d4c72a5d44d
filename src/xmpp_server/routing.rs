//! Address → session routing.
//!
//! Two layers of state:
//!
//! - **local** routes hold the `Session` objects owned by this process and are
//!   the only ones that can be dereferenced;
//! - **shared** routes record which cluster node owns an address. In a single
//!   node deployment they only ever name this node.
//!
//! Client routes are keyed by full address, with an index from bare address to
//! the full addresses bound under it. Updates to that index happen under a
//! per-bare-address lock so two resources binding at once cannot lose each other.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::cluster::{ClusterTransport, NodeId};
use super::error::StanzaErrorCondition;
use super::jid::Jid;
use super::outgoing::{OutgoingSessionManager, RemoteServerConnector};
use super::session::{ConnectionKind, Session};
use super::stanza::{Stanza, StanzaKind};

const LOCK_STRIPES: usize = 64;

/// Ownership record of a client route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRoute {
    pub node: NodeId,
    pub available: bool,
    pub anonymous: bool,
}

/// Why a stanza could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingFailure {
    /// Nothing is bound to the address.
    NoRoute,
    /// A route exists but is not available for this kind of stanza.
    Unavailable,
    /// No connection to the remote domain could be established.
    RemoteServerNotFound,
    /// The owning cluster node did not accept the stanza.
    ForwardFailed,
    /// Policy forbids the sender from reaching the destination.
    Restricted,
}

impl RoutingFailure {
    pub fn error_condition(&self) -> StanzaErrorCondition {
        match self {
            Self::NoRoute | Self::Unavailable => StanzaErrorCondition::ServiceUnavailable,
            Self::RemoteServerNotFound => StanzaErrorCondition::RemoteServerNotFound,
            Self::ForwardFailed => StanzaErrorCondition::RecipientUnavailable,
            Self::Restricted => StanzaErrorCondition::NotAllowed,
        }
    }
}

/// Hooks invoked for stanzas that no path could deliver.
pub trait RoutingFailureHandler: Send + Sync {
    fn message_failed(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure);
    fn presence_failed(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure);
    fn iq_failed(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure);
}

/// Default hooks: answer the sender with a stanza error, drop presences.
#[derive(Debug, Default)]
pub struct ErrorReplyHandler;

impl ErrorReplyHandler {
    fn reply(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure) {
        let Some(reply) = stanza.error_reply(reason.error_condition(), None) else {
            return;
        };
        match reply.to() {
            Some(Ok(to)) => routing.route(&to, reply),
            _ => debug!("Undeliverable stanza has no usable sender, dropping error reply"),
        }
    }
}

impl RoutingFailureHandler for ErrorReplyHandler {
    fn message_failed(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure) {
        self.reply(routing, stanza, reason);
    }

    fn presence_failed(&self, _routing: &RoutingTable, _stanza: &Stanza, reason: RoutingFailure) {
        debug!(?reason, "Dropping undeliverable presence");
    }

    fn iq_failed(&self, routing: &RoutingTable, stanza: &Stanza, reason: RoutingFailure) {
        self.reply(routing, stanza, reason);
    }
}

/// Construction options for a routing table.
#[derive(Clone)]
pub struct RoutingOptions {
    pub node_id: NodeId,
    pub federation_enabled: bool,
    pub anonymous_outbound: bool,
    pub cluster: Option<Arc<dyn ClusterTransport>>,
    pub connector: Option<Arc<dyn RemoteServerConnector>>,
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            node_id: NodeId::new_random(),
            federation_enabled: true,
            anonymous_outbound: false,
            cluster: None,
            connector: None,
        }
    }
}

/// Striped locks keyed by string.
struct KeyedLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyedLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock()
    }
}

#[derive(Default)]
struct LocalRoutes {
    clients: DashMap<Jid, Arc<Session>>,
    components: DashMap<String, Arc<Session>>,
    servers: DashMap<String, Arc<Session>>,
}

#[derive(Default)]
struct SharedRoutes {
    users: DashMap<Jid, ClientRoute>,
    user_sessions: DashMap<Jid, BTreeSet<Jid>>,
    servers: DashMap<String, NodeId>,
    components: DashMap<String, BTreeSet<NodeId>>,
}

/// Where a stanza for a remote domain goes, decided under the domain lock.
enum RemoteTarget {
    Local(Arc<Session>),
    Node(NodeId),
    Queued,
    Connect,
    Fail(RoutingFailure),
}

pub struct RoutingTable {
    me: Weak<RoutingTable>,
    domain: String,
    node_id: NodeId,
    local: LocalRoutes,
    shared: SharedRoutes,
    user_locks: KeyedLocks,
    domain_locks: KeyedLocks,
    cluster: Option<Arc<dyn ClusterTransport>>,
    failures: RwLock<Arc<dyn RoutingFailureHandler>>,
    outgoing: OutgoingSessionManager,
    federation_enabled: bool,
    anonymous_outbound: bool,
}

impl RoutingTable {
    pub fn new(domain: impl Into<String>, options: RoutingOptions) -> Arc<Self> {
        let domain = domain.into().to_lowercase();
        Arc::new_cyclic(|me| RoutingTable {
            me: me.clone(),
            domain,
            node_id: options.node_id,
            local: LocalRoutes::default(),
            shared: SharedRoutes::default(),
            user_locks: KeyedLocks::new(LOCK_STRIPES),
            domain_locks: KeyedLocks::new(LOCK_STRIPES),
            cluster: options.cluster,
            failures: RwLock::new(Arc::new(ErrorReplyHandler)),
            outgoing: OutgoingSessionManager::new(options.connector),
            federation_enabled: options.federation_enabled,
            anonymous_outbound: options.anonymous_outbound,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn outgoing(&self) -> &OutgoingSessionManager {
        &self.outgoing
    }

    pub fn set_failure_handler(&self, handler: Arc<dyn RoutingFailureHandler>) {
        *self.failures.write() = handler;
    }

    // ---- registration ------------------------------------------------------

    /// Register a route for an authenticated session, by connection class.
    pub fn add_route(&self, kind: ConnectionKind, address: &Jid, session: Arc<Session>) -> bool {
        match kind {
            ConnectionKind::Client => {
                let anonymous = session.is_anonymous();
                self.add_client_route(address, session, anonymous)
            }
            ConnectionKind::Component | ConnectionKind::Multiplexer => {
                self.add_component_route(address.domain(), session)
            }
            ConnectionKind::Server => self.add_server_route(address.domain(), session),
        }
    }

    /// Bind a full address to a local client session. New routes start
    /// unavailable until the session sends available presence. Returns
    /// whether the address was not routed before.
    pub fn add_client_route(&self, address: &Jid, session: Arc<Session>, anonymous: bool) -> bool {
        let bare = address.to_bare();
        let _guard = self.user_locks.lock(&bare.to_string());

        self.local.clients.insert(address.clone(), session);
        let previous = self.shared.users.insert(
            address.clone(),
            ClientRoute {
                node: self.node_id.clone(),
                available: false,
                anonymous,
            },
        );
        let added = previous.is_none();

        if address.is_full() {
            self.index_resource(&bare, address, anonymous);
        }
        debug!(address = %address, anonymous, added, "Added client route");
        added
    }

    fn index_resource(&self, bare: &Jid, address: &Jid, anonymous: bool) {
        if anonymous {
            // Anonymous accounts are single-resource.
            self.shared
                .user_sessions
                .insert(bare.clone(), BTreeSet::from([address.clone()]));
        } else {
            self.shared
                .user_sessions
                .entry(bare.clone())
                .or_default()
                .insert(address.clone());
        }
    }

    pub fn add_component_route(&self, domain: &str, session: Arc<Session>) -> bool {
        let domain = domain.to_lowercase();
        let _guard = self.domain_locks.lock(&domain);
        let added = self.local.components.insert(domain.clone(), session).is_none();
        self.shared
            .components
            .entry(domain.clone())
            .or_default()
            .insert(self.node_id.clone());
        info!(domain = %domain, "Added component route");
        added
    }

    /// Register an outbound server session. The caller holds the domain lock
    /// when flushing queued stanzas, so this only touches the maps.
    pub fn add_server_route(&self, domain: &str, session: Arc<Session>) -> bool {
        let domain = domain.to_lowercase();
        let added = self.local.servers.insert(domain.clone(), session).is_none();
        self.shared.servers.insert(domain.clone(), self.node_id.clone());
        info!(domain = %domain, "Added server route");
        added
    }

    pub fn remove_route(&self, kind: ConnectionKind, address: &Jid) -> bool {
        match kind {
            ConnectionKind::Client => self.remove_client_route(address),
            ConnectionKind::Component | ConnectionKind::Multiplexer => {
                self.remove_component_route(address.domain())
            }
            ConnectionKind::Server => self.remove_server_route(address.domain()),
        }
    }

    /// Remove a client route and prune the bare-address index. Returns whether
    /// a route existed.
    pub fn remove_client_route(&self, address: &Jid) -> bool {
        self.remove_client_route_owned_by(address, None)
    }

    /// Remove a client route only while `session` still owns it.
    pub fn remove_client_route_if(&self, address: &Jid, session: &Arc<Session>) -> bool {
        self.remove_client_route_owned_by(address, Some(session))
    }

    fn remove_client_route_owned_by(&self, address: &Jid, owner: Option<&Arc<Session>>) -> bool {
        let bare = address.to_bare();
        let _guard = self.user_locks.lock(&bare.to_string());
        if let Some(owner) = owner {
            if !Self::is_owner(&self.local.clients, address, owner) {
                debug!(address = %address, "Client route belongs to another session, kept");
                return false;
            }
        }

        let removed = self.shared.users.remove(address).map(|(_, route)| route);
        if let Some(route) = &removed {
            if address.is_full() {
                self.unindex_resource(&bare, address, route.anonymous);
            }
        }
        self.local.clients.remove(address);
        debug!(address = %address, removed = removed.is_some(), "Removed client route");
        removed.is_some()
    }

    fn is_owner<K>(routes: &DashMap<K, Arc<Session>>, key: &K, session: &Arc<Session>) -> bool
    where
        K: Eq + Hash,
    {
        routes.get(key).is_some_and(|s| Arc::ptr_eq(s.value(), session))
    }

    fn unindex_resource(&self, bare: &Jid, address: &Jid, anonymous: bool) {
        if anonymous {
            self.shared.user_sessions.remove(bare);
            return;
        }
        let now_empty = match self.shared.user_sessions.get_mut(bare) {
            Some(mut resources) => {
                resources.remove(address);
                resources.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.shared
                .user_sessions
                .remove_if(bare, |_, resources| resources.is_empty());
        }
    }

    pub fn remove_component_route(&self, domain: &str) -> bool {
        self.remove_component_route_owned_by(domain, None)
    }

    /// Remove a component route only while `session` still owns it.
    pub fn remove_component_route_if(&self, domain: &str, session: &Arc<Session>) -> bool {
        self.remove_component_route_owned_by(domain, Some(session))
    }

    fn remove_component_route_owned_by(&self, domain: &str, owner: Option<&Arc<Session>>) -> bool {
        let domain = domain.to_lowercase();
        let _guard = self.domain_locks.lock(&domain);
        if let Some(owner) = owner {
            if !Self::is_owner(&self.local.components, &domain, owner) {
                return false;
            }
        }
        let removed = self.local.components.remove(&domain).is_some();
        let now_empty = match self.shared.components.get_mut(&domain) {
            Some(mut nodes) => {
                nodes.remove(&self.node_id);
                nodes.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.shared
                .components
                .remove_if(&domain, |_, nodes| nodes.is_empty());
        }
        if removed {
            info!(domain = %domain, "Removed component route");
        }
        removed
    }

    pub fn remove_server_route(&self, domain: &str) -> bool {
        self.remove_server_route_owned_by(domain, None)
    }

    /// Remove a server route only while `session` still owns it.
    pub fn remove_server_route_if(&self, domain: &str, session: &Arc<Session>) -> bool {
        self.remove_server_route_owned_by(domain, Some(session))
    }

    fn remove_server_route_owned_by(&self, domain: &str, owner: Option<&Arc<Session>>) -> bool {
        let domain = domain.to_lowercase();
        let _guard = self.domain_locks.lock(&domain);
        if let Some(owner) = owner {
            if !Self::is_owner(&self.local.servers, &domain, owner) {
                return false;
            }
        }
        let removed = self.local.servers.remove(&domain).is_some();
        self.shared
            .servers
            .remove_if(&domain, |_, node| *node == self.node_id);
        if removed {
            info!(domain = %domain, "Removed server route");
        }
        removed
    }

    /// Drop every route owned by `session`. Called on connection teardown.
    /// Routes that were taken over by another session are left alone.
    pub fn unregister_session(&self, session: &Arc<Session>) -> bool {
        let Some(address) = session.address() else {
            return false;
        };
        match session.kind() {
            ConnectionKind::Client => self.remove_client_route_if(&address, session),
            ConnectionKind::Component | ConnectionKind::Multiplexer => {
                self.remove_component_route_if(address.domain(), session)
            }
            ConnectionKind::Server => self.remove_server_route_if(address.domain(), session),
        }
    }

    /// Record presence availability of a client route. Available routes are
    /// (re)indexed under their bare address.
    pub fn set_route_availability(&self, address: &Jid, available: bool) -> bool {
        let bare = address.to_bare();
        let _guard = self.user_locks.lock(&bare.to_string());
        let anonymous = match self.shared.users.get_mut(address) {
            Some(mut route) => {
                route.available = available;
                route.anonymous
            }
            None => return false,
        };
        if available && address.is_full() {
            self.index_resource(&bare, address, anonymous);
        }
        true
    }

    // ---- cluster ownership ---------------------------------------------------

    pub fn apply_remote_client_route(&self, address: &Jid, node: NodeId, available: bool, anonymous: bool) {
        let bare = address.to_bare();
        let _guard = self.user_locks.lock(&bare.to_string());
        self.shared.users.insert(
            address.clone(),
            ClientRoute {
                node,
                available,
                anonymous,
            },
        );
        if address.is_full() {
            self.index_resource(&bare, address, anonymous);
        }
    }

    pub fn apply_remote_component_route(&self, domain: &str, node: NodeId) {
        let domain = domain.to_lowercase();
        let _guard = self.domain_locks.lock(&domain);
        self.shared.components.entry(domain).or_default().insert(node);
    }

    pub fn apply_remote_server_route(&self, domain: &str, node: NodeId) {
        let domain = domain.to_lowercase();
        let _guard = self.domain_locks.lock(&domain);
        self.shared.servers.insert(domain, node);
    }

    /// Forget every route owned by a node that left the cluster.
    pub fn node_left(&self, node: &NodeId) {
        if *node == self.node_id {
            return;
        }
        let users: Vec<Jid> = self
            .shared
            .users
            .iter()
            .filter(|entry| entry.value().node == *node)
            .map(|entry| entry.key().clone())
            .collect();
        for address in &users {
            self.remove_client_route(address);
        }

        self.shared.servers.retain(|_, owner| owner != node);

        let domains: Vec<String> = self
            .shared
            .components
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for domain in domains {
            let _guard = self.domain_locks.lock(&domain);
            if let Some(mut nodes) = self.shared.components.get_mut(&domain) {
                nodes.remove(node);
            }
            self.shared
                .components
                .remove_if(&domain, |_, nodes| nodes.is_empty());
        }
        info!(node = %node, removed_clients = users.len(), "Removed routes of departed cluster node");
    }

    // ---- queries ---------------------------------------------------------------

    pub fn has_client_route(&self, address: &Jid) -> bool {
        self.shared.users.contains_key(address)
    }

    pub fn has_component_route(&self, domain: &str) -> bool {
        self.shared.components.contains_key(&domain.to_lowercase())
    }

    pub fn has_server_route(&self, domain: &str) -> bool {
        self.shared.servers.contains_key(&domain.to_lowercase())
    }

    /// Whether any kind of route exists for the address.
    pub fn has_route(&self, address: &Jid) -> bool {
        if address.domain() == self.domain {
            if address.is_full() {
                return self.has_client_route(address);
            }
            return self.shared.user_sessions.contains_key(address);
        }
        self.has_component_route(address.domain()) || self.has_server_route(address.domain())
    }

    pub fn is_anonymous_route(&self, address: &Jid) -> bool {
        self.shared
            .users
            .get(address)
            .is_some_and(|route| route.anonymous)
    }

    /// Whether the address is served by a session of this process.
    pub fn is_local_route(&self, address: &Jid) -> bool {
        self.local.clients.contains_key(address)
            || (address.node().is_none() && self.local.components.contains_key(address.domain()))
            || (address.node().is_none() && self.local.servers.contains_key(address.domain()))
    }

    /// Local session bound to a full address.
    pub fn get_client_route(&self, address: &Jid) -> Option<Arc<Session>> {
        self.local.clients.get(address).map(|s| s.value().clone())
    }

    pub fn client_route(&self, address: &Jid) -> Option<ClientRoute> {
        self.shared.users.get(address).map(|r| r.value().clone())
    }

    /// Addresses a stanza to `address` would currently reach. For a local bare
    /// address these are its available resources in a stable order.
    pub fn get_routes(&self, address: &Jid) -> Vec<Jid> {
        if address.domain() == self.domain {
            if address.is_full() {
                return match self.shared.users.get(address) {
                    Some(route) if route.available => vec![address.clone()],
                    _ => Vec::new(),
                };
            }
            let resources = self
                .shared
                .user_sessions
                .get(address)
                .map(|r| r.value().clone())
                .unwrap_or_default();
            return resources
                .into_iter()
                .filter(|full| {
                    self.shared
                        .users
                        .get(full)
                        .is_some_and(|route| route.available)
                })
                .collect();
        }
        if address.is_within(&self.domain) {
            if self.has_component_route(address.domain()) {
                if let Ok(jid) = Jid::domain_jid(address.domain()) {
                    return vec![jid];
                }
            }
            return Vec::new();
        }
        vec![address.clone()]
    }

    /// Every client route in the cluster with its ownership record.
    pub fn client_routes(&self) -> Vec<(Jid, ClientRoute)> {
        let mut routes: Vec<(Jid, ClientRoute)> = self
            .shared
            .users
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    pub fn local_client_sessions(&self) -> Vec<Arc<Session>> {
        self.local
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn server_hostnames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn component_domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .components
            .iter()
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }

    // ---- delivery --------------------------------------------------------------

    /// Route a stanza to `to`. Never fails towards the caller: stanzas that
    /// cannot be delivered are handed to the failure hooks, possibly later when
    /// the path involves another node or a new outbound connection.
    pub fn route(&self, to: &Jid, stanza: Stanza) {
        if to.domain() == self.domain {
            self.route_to_local_domain(to, stanza);
        } else if to.is_within(&self.domain) && self.has_component_route(to.domain()) {
            self.route_to_component(to, stanza);
        } else {
            self.route_to_remote_domain(to, stanza);
        }
    }

    /// Packets generated by the server reach unavailable resources too.
    fn from_server(&self, stanza: &Stanza) -> bool {
        match stanza.from() {
            None => true,
            Some(Ok(from)) => from.node().is_none() && from.domain() == self.domain,
            Some(Err(_)) => false,
        }
    }

    fn route_to_local_domain(&self, to: &Jid, stanza: Stanza) {
        if to.is_bare() {
            self.route_to_bare(to, stanza);
            return;
        }

        let Some(route) = self.client_route(to) else {
            self.report_failure(&stanza, RoutingFailure::NoRoute);
            return;
        };
        if !route.available && stanza.kind() != StanzaKind::Iq && !self.from_server(&stanza) {
            debug!(to = %to, "Route is not available for this stanza");
            self.report_failure(&stanza, RoutingFailure::Unavailable);
            return;
        }

        if let Some(session) = self.get_client_route(to) {
            if !session.deliver(&stanza) {
                self.report_failure(&stanza, RoutingFailure::Unavailable);
            }
            return;
        }

        if route.node == self.node_id {
            // Shared entry without a local session: stale.
            self.report_failure(&stanza, RoutingFailure::NoRoute);
            return;
        }
        self.forward(route.node, to.clone(), stanza, true);
    }

    fn route_to_bare(&self, to: &Jid, stanza: Stanza) {
        match stanza.kind() {
            StanzaKind::Message | StanzaKind::Presence => {}
            _ => {
                self.report_failure(&stanza, RoutingFailure::NoRoute);
                return;
            }
        }
        let resources = self.get_routes(to);
        if resources.is_empty() {
            self.report_failure(&stanza, RoutingFailure::NoRoute);
            return;
        }
        for full in resources {
            match self.get_client_route(&full) {
                Some(session) => {
                    session.deliver(&stanza);
                }
                None => {
                    if let Some(route) = self.client_route(&full) {
                        if route.node != self.node_id {
                            self.forward(route.node, full, stanza.clone(), true);
                        }
                    }
                }
            }
        }
    }

    fn route_to_component(&self, to: &Jid, stanza: Stanza) {
        let domain = to.domain();
        if let Some(session) = self.local.components.get(domain).map(|s| s.value().clone()) {
            if !session.deliver(&stanza) {
                self.report_failure(&stanza, RoutingFailure::Unavailable);
            }
            return;
        }

        let remote = self
            .shared
            .components
            .get(domain)
            .and_then(|nodes| nodes.iter().find(|n| **n != self.node_id).cloned());
        match remote {
            Some(node) => self.forward(node, to.clone(), stanza, false),
            None => self.report_failure(&stanza, RoutingFailure::NoRoute),
        }
    }

    fn route_to_remote_domain(&self, to: &Jid, stanza: Stanza) {
        if !self.anonymous_outbound {
            if let Some(Ok(from)) = stanza.from() {
                if self.is_anonymous_route(&from) {
                    info!(from = %from, to = %to, "Anonymous user may not reach remote domains");
                    self.report_failure(&stanza, RoutingFailure::Restricted);
                    return;
                }
            }
        }

        let domain = to.domain().to_string();
        let (target, stanza) = {
            let _guard = self.domain_locks.lock(&domain);
            let target = if let Some(session) = self.local.servers.get(&domain).map(|s| s.value().clone()) {
                RemoteTarget::Local(session)
            } else if let Some(node) = self
                .shared
                .servers
                .get(&domain)
                .map(|n| n.value().clone())
                .filter(|n| *n != self.node_id)
            {
                RemoteTarget::Node(node)
            } else if !self.federation_enabled {
                RemoteTarget::Fail(RoutingFailure::RemoteServerNotFound)
            } else if !self.outgoing.has_connector() {
                RemoteTarget::Fail(RoutingFailure::RemoteServerNotFound)
            } else if self.outgoing.enqueue(&domain, stanza.clone()) {
                RemoteTarget::Connect
            } else {
                RemoteTarget::Queued
            };
            (target, stanza)
        };

        match target {
            RemoteTarget::Local(session) => {
                if !session.deliver(&stanza) {
                    self.report_failure(&stanza, RoutingFailure::RemoteServerNotFound);
                }
            }
            RemoteTarget::Node(node) => self.forward(node, to.clone(), stanza, false),
            RemoteTarget::Queued => debug!(domain = %domain, "Queued stanza for pending outbound connection"),
            RemoteTarget::Connect => {
                let Some(routing) = self.me.upgrade() else {
                    return;
                };
                let spawned = spawn_detached({
                    let domain = domain.clone();
                    async move {
                        routing.outgoing.establish(&routing, &domain).await;
                    }
                });
                if !spawned {
                    for queued in self.take_pending(&domain) {
                        self.report_failure(&queued, RoutingFailure::RemoteServerNotFound);
                    }
                }
            }
            RemoteTarget::Fail(reason) => self.report_failure(&stanza, reason),
        }
    }

    /// Take the queue of a pending outbound connection under its domain lock.
    pub(super) fn take_pending(&self, domain: &str) -> Vec<Stanza> {
        let _guard = self.domain_locks.lock(domain);
        self.outgoing.take(domain)
    }

    /// Register a freshly connected outbound session and flush what was queued
    /// for it. Delivery happens under the domain lock so newer stanzas cannot
    /// overtake the queue.
    pub(super) fn complete_outgoing(&self, domain: &str, session: Arc<Session>) {
        let _guard = self.domain_locks.lock(domain);
        self.add_server_route(domain, session.clone());
        let queued = self.outgoing.take(domain);
        debug!(domain, queued = queued.len(), "Flushing stanzas queued for outbound connection");
        for stanza in &queued {
            session.deliver(stanza);
        }
    }

    fn forward(&self, node: NodeId, to: Jid, stanza: Stanza, client_route: bool) {
        let (Some(cluster), Some(routing)) = (self.cluster.clone(), self.me.upgrade()) else {
            self.report_failure(&stanza, RoutingFailure::ForwardFailed);
            return;
        };
        let task_stanza = stanza.clone();
        let spawned = spawn_detached(async move {
            if cluster.route_to_node(&node, &to, &task_stanza).await {
                return;
            }
            warn!(node = %node, to = %to, "Cluster node refused stanza");
            if client_route {
                routing.remove_client_route(&to);
            }
            routing.report_failure(&task_stanza, RoutingFailure::ForwardFailed);
        });
        if !spawned {
            self.report_failure(&stanza, RoutingFailure::ForwardFailed);
        }
    }

    /// Deliver to every local client session and, unless `only_local`, to the
    /// other cluster nodes.
    pub fn broadcast(&self, stanza: &Stanza, only_local: bool) {
        for session in self.local_client_sessions() {
            session.deliver(stanza);
        }
        if only_local {
            return;
        }
        if let Some(cluster) = self.cluster.clone() {
            let stanza = stanza.clone();
            spawn_detached(async move {
                cluster.broadcast(&stanza).await;
            });
        }
    }

    /// Dispatch to the failure hook matching the stanza kind.
    pub fn report_failure(&self, stanza: &Stanza, reason: RoutingFailure) {
        let handler = self.failures.read().clone();
        debug!(stanza = stanza.local_name(), ?reason, "Routing failed");
        match stanza.kind() {
            StanzaKind::Message => handler.message_failed(self, stanza, reason),
            StanzaKind::Presence => handler.presence_failed(self, stanza, reason),
            StanzaKind::Iq => handler.iq_failed(self, stanza, reason),
            StanzaKind::Other => debug!("Dropping unroutable non-stanza element"),
        }
    }
}

/// Spawn on the current runtime, if there is one.
fn spawn_detached<F>(future: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => {
            warn!("No async runtime available for background routing work");
            false
        }
    }
}
