//! Cluster seams.
//!
//! The inter-node transport is not part of this crate. The routing table only
//! needs to name nodes and hand stanzas to whatever carries them.

use std::fmt;

use async_trait::async_trait;

use super::jid::Jid;
use super::session::random_token;
use super::stanza::Stanza;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn new_random() -> Self {
        Self(random_token(12).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Deliver a stanza to a route owned by another node. Returns false when
    /// the node no longer knows the route.
    async fn route_to_node(&self, node: &NodeId, to: &Jid, stanza: &Stanza) -> bool;

    /// Hand a stanza to every other node for local broadcast.
    async fn broadcast(&self, stanza: &Stanza);
}
