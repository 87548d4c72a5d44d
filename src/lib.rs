//! Fluux server: the core of an XMPP server.
//!
//! See [`xmpp_server`] for the listener, negotiation and routing pieces.

pub mod xmpp_server;

pub use xmpp_server::{ListenerClass, ServerConfig, XmppError, XmppServer};
