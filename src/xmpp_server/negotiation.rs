//! Stream negotiation.
//!
//! One `StreamNegotiator` per connection turns framed elements into actions
//! for the connection driver: bytes to send, transport upgrades to perform,
//! and when to close. Connection classes differ only by their
//! `StreamProfile`; the state machine is shared.
//!
//! ```text
//! Init ─header─▶ Negotiating(Tls) ─starttls─▶ (restart) ─▶ Negotiating(Auth)
//!                                                   │
//!                        SASL success (client) ◀────┤──▶ handshake / SASL success (others)
//!                                 │                 │
//!                               Bound ─bind─▶ Authenticated ◀┘
//! ```
//!
//! `Closed` is reachable from every state.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::auth::CredentialStore;
use super::config::{CompressionPolicy, ComponentsConfig, ListenerConfig, ServerConfig, TlsPolicy};
use super::error::{SaslFailure, StanzaErrorCondition, StreamError, StreamErrorCondition};
use super::framing::StreamFraming;
use super::jid::Jid;
use super::router::PacketRouter;
use super::routing::RoutingTable;
use super::sasl::{
    decode_payload, encode_payload, AuthIdentity, MechanismRegistry, OfferContext, SaslContext,
    SaslExchange, SaslStep,
};
use super::session::{
    random_token, CompressionState, ConnectionKind, EncryptionState, Session, SessionStatus,
};
use super::stanza::{ns, Element, Stanza, StanzaKind, StreamHeader};
use super::tls::TlsInfo;

const GENERATED_RESOURCE_LEN: usize = 16;

/// Server-wide collaborators shared by every negotiator.
pub struct ServerContext {
    pub domain: String,
    pub mechanisms: MechanismRegistry,
    pub credentials: Arc<dyn CredentialStore>,
    pub router: PacketRouter,
    pub max_auth_retries: u32,
    pub anonymous_login: bool,
    pub components: ComponentsConfig,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, credentials: Arc<dyn CredentialStore>, routing: Arc<RoutingTable>) -> Self {
        Self {
            domain: config.server.domain.clone(),
            mechanisms: MechanismRegistry::new(&config.server.sasl_mechanisms),
            credentials,
            router: PacketRouter::new(routing),
            max_auth_retries: config.server.max_auth_retries,
            anonymous_login: config.server.anonymous_login,
            components: config.components.clone(),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        self.router.routing()
    }
}

/// Listener settings a negotiator honours.
#[derive(Debug, Clone, Copy)]
pub struct ListenerPolicy {
    pub tls: TlsPolicy,
    /// Whether a TLS acceptor exists for this listener.
    pub tls_available: bool,
    pub compression: CompressionPolicy,
    pub framing: StreamFraming,
}

impl ListenerPolicy {
    pub fn from_config(listener: &ListenerConfig, framing: StreamFraming, tls_available: bool) -> Self {
        Self {
            tls: listener.tls_policy,
            tls_available,
            compression: listener.compression_policy,
            framing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCheck {
    /// `to` names the served domain (or a component hosted under it).
    Hosted,
    /// `to` names a new subdomain the peer wants to serve.
    Subdomain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Sasl,
    /// XEP-0114 shared-secret handshake.
    Handshake,
}

/// Per-class capabilities of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamProfile {
    pub namespace: &'static str,
    pub host_check: HostCheck,
    pub allow_missing_to: bool,
    pub auth: AuthStyle,
    pub resource_binding: bool,
    pub requires_version: bool,
}

impl StreamProfile {
    pub fn for_kind(kind: ConnectionKind) -> Self {
        match kind {
            ConnectionKind::Client => Self {
                namespace: ns::CLIENT,
                host_check: HostCheck::Hosted,
                allow_missing_to: false,
                auth: AuthStyle::Sasl,
                resource_binding: true,
                requires_version: true,
            },
            ConnectionKind::Server => Self {
                namespace: ns::SERVER,
                host_check: HostCheck::Hosted,
                allow_missing_to: true,
                auth: AuthStyle::Sasl,
                resource_binding: false,
                requires_version: true,
            },
            ConnectionKind::Component => Self {
                namespace: ns::COMPONENT_ACCEPT,
                host_check: HostCheck::Subdomain,
                allow_missing_to: false,
                auth: AuthStyle::Handshake,
                resource_binding: false,
                requires_version: false,
            },
            ConnectionKind::Multiplexer => Self {
                namespace: ns::MULTIPLEXER,
                host_check: HostCheck::Hosted,
                allow_missing_to: false,
                auth: AuthStyle::Handshake,
                resource_binding: false,
                requires_version: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Tls,
    Auth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Init,
    Negotiating(Phase),
    /// Authenticated identity, resource not bound yet.
    Bound,
    Authenticated,
    Closed,
}

/// What the connection driver must do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    /// Flush, then run the TLS handshake and reset the framer.
    StartTls,
    /// Flush, then compress both directions and reset the framer.
    StartCompression,
    /// Flush and close the transport.
    Close,
}

pub struct StreamNegotiator {
    session: Arc<Session>,
    ctx: Arc<ServerContext>,
    profile: StreamProfile,
    policy: ListenerPolicy,
    state: NegotiationState,
    expecting_header: bool,
    header_sent: bool,
    tls_attempted: bool,
    compression_attempted: bool,
    sasl: Option<SaslExchange>,
    auth_failures: u32,
    peer_certificates: Vec<CertificateDer<'static>>,
    stream_to: Option<String>,
    stream_from: Option<String>,
    pending_ping: Option<String>,
}

fn is(stanza: &Stanza, local_name: &str, namespace: &str) -> bool {
    stanza.local_name() == local_name && stanza.ns() == Some(namespace)
}

impl StreamNegotiator {
    pub fn new(session: Arc<Session>, ctx: Arc<ServerContext>, policy: ListenerPolicy) -> Self {
        let profile = StreamProfile::for_kind(session.kind());
        Self {
            session,
            ctx,
            profile,
            policy,
            state: NegotiationState::Init,
            expecting_header: true,
            header_sent: false,
            tls_attempted: false,
            compression_attempted: false,
            sasl: None,
            auth_failures: 0,
            peer_certificates: Vec::new(),
            stream_to: None,
            stream_from: None,
            pending_ping: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn framing(&self) -> StreamFraming {
        self.policy.framing
    }

    /// Handle one framed element.
    pub fn process(&mut self, element: &str) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        let framing = self.policy.framing;
        if framing.is_stream_open(element) {
            return self.handle_header(element);
        }
        if framing.is_stream_close(element) {
            return self.close();
        }
        if self.expecting_header {
            return self.fail(StreamError::new(StreamErrorCondition::NotWellFormed).with_text("expected stream header"));
        }

        let stanza = match Stanza::parse(element) {
            Ok(stanza) => stanza,
            Err(e) => {
                debug!(conn_id = self.session.conn_id(), error = %e, "Unparseable element");
                return self.fail(StreamError::new(StreamErrorCondition::NotWellFormed));
            }
        };
        self.session.record_received();

        match self.state {
            NegotiationState::Init => self.fail(StreamError::new(StreamErrorCondition::NotWellFormed)),
            NegotiationState::Negotiating(Phase::Tls) => {
                if is(&stanza, "starttls", ns::TLS) {
                    self.handle_starttls()
                } else {
                    info!(
                        conn_id = self.session.conn_id(),
                        element = stanza.local_name(),
                        "Element received before mandatory TLS"
                    );
                    self.fail(StreamError::new(StreamErrorCondition::NotAuthorized))
                }
            }
            NegotiationState::Negotiating(Phase::Auth) => self.handle_pre_auth(stanza),
            NegotiationState::Bound => self.handle_bound(stanza),
            NegotiationState::Authenticated => self.handle_authenticated(stanza),
            NegotiationState::Closed => Vec::new(),
        }
    }

    /// Record a completed TLS handshake.
    /// Stanza queued for the peer by another session. Dropped when an
    /// interceptor rejects it.
    pub fn outgoing(&mut self, raw: String) -> Vec<Action> {
        if self.ctx.router.has_interceptors() {
            if let Ok(stanza) = Stanza::parse(raw.as_str()) {
                if !self.ctx.router.intercept_outgoing(&stanza, &self.session) {
                    return Vec::new();
                }
            }
        }
        vec![Action::Send(raw)]
    }

    pub fn tls_established(&mut self, info: TlsInfo) {
        self.session.set_encryption(EncryptionState::Active {
            protocol: info.protocol,
            cipher: info.cipher,
        });
        self.peer_certificates = info.peer_certificates;
    }

    pub fn compression_established(&mut self) {
        self.session.set_compression(CompressionState::Active);
    }

    /// Keep-alive ping for an idle authenticated client, unless one is
    /// already outstanding.
    pub fn keepalive_ping(&mut self) -> Option<String> {
        if self.state != NegotiationState::Authenticated
            || self.session.kind() != ConnectionKind::Client
            || self.pending_ping.is_some()
        {
            return None;
        }
        let address = self.session.address()?;
        let id = format!("ping-{}", random_token(8));
        let ping = Element::new("iq")
            .with_attr("type", "get")
            .with_attr("id", id.clone())
            .with_attr("from", self.ctx.domain.clone())
            .with_attr("to", address.to_string())
            .with_child(Element::new("ping").with_attr("xmlns", ns::PING));
        self.pending_ping = Some(id);
        Some(ping.to_xml())
    }

    /// Close with a stream error. Our stream header goes first if the peer
    /// has not seen it yet.
    pub fn fail(&mut self, error: StreamError) -> Vec<Action> {
        if self.is_closed() {
            return vec![Action::Close];
        }
        let mut actions = Vec::with_capacity(4);
        if !self.header_sent {
            actions.push(Action::Send(self.policy.framing.open_stream(
                self.profile.namespace,
                &self.ctx.domain,
                &self.session.stream_id(),
                "en",
                Some("1.0"),
            )));
            self.header_sent = true;
        }
        info!(
            conn_id = self.session.conn_id(),
            condition = %error.condition,
            "Closing stream with error"
        );
        actions.push(Action::Send(self.policy.framing.error(&error)));
        actions.push(Action::Send(self.policy.framing.close_stream().to_string()));
        actions.push(Action::Close);
        self.state = NegotiationState::Closed;
        actions
    }

    /// Close the stream without an error.
    pub fn close(&mut self) -> Vec<Action> {
        if self.is_closed() {
            return vec![Action::Close];
        }
        debug!(conn_id = self.session.conn_id(), "Closing stream");
        self.state = NegotiationState::Closed;
        vec![
            Action::Send(self.policy.framing.close_stream().to_string()),
            Action::Close,
        ]
    }

    fn failure_and_close(&mut self, failure: String) -> Vec<Action> {
        self.state = NegotiationState::Closed;
        vec![
            Action::Send(failure),
            Action::Send(self.policy.framing.close_stream().to_string()),
            Action::Close,
        ]
    }

    // ---- stream header -----------------------------------------------------------

    fn tls_pending(&self) -> bool {
        self.policy.tls == TlsPolicy::Required && !self.session.is_encrypted()
    }

    fn handle_header(&mut self, element: &str) -> Vec<Action> {
        if !self.expecting_header {
            return self.fail(StreamError::new(StreamErrorCondition::BadFormat).with_text("unexpected stream restart"));
        }
        self.expecting_header = false;

        let header = match StreamHeader::parse(element) {
            Ok(header) => header,
            Err(condition) => return self.fail(StreamError::new(condition)),
        };

        let requested = header.version_numbers();
        let modern = requested.is_some_and(|(major, _)| major >= 1);
        let lang = header.lang.clone().unwrap_or_else(|| String::from("en"));
        self.session.set_language(&lang);
        self.session
            .set_version(if modern { (1, 0) } else { requested.unwrap_or((0, 0)) });
        let stream_id = self.session.regenerate_stream_id();
        if self.session.status() == SessionStatus::Initializing {
            self.session.set_status(SessionStatus::Negotiating);
        }

        let to = header.to.as_deref().map(str::to_lowercase);
        let reply_from = match (self.profile.host_check, &to) {
            (HostCheck::Subdomain, Some(to)) => to.clone(),
            _ => self.ctx.domain.clone(),
        };
        let mut actions = vec![Action::Send(self.policy.framing.open_stream(
            self.profile.namespace,
            &reply_from,
            &stream_id,
            &lang,
            modern.then_some("1.0"),
        ))];
        self.header_sent = true;

        if let Err(error) = self.check_header(&header, to.as_deref(), modern) {
            actions.extend(self.fail(error));
            return actions;
        }
        self.stream_to = to;
        self.stream_from = header.from.as_deref().map(str::to_lowercase);

        debug!(
            conn_id = self.session.conn_id(),
            kind = %self.session.kind(),
            stream_id = %stream_id,
            "Stream opened"
        );

        if matches!(self.state, NegotiationState::Init | NegotiationState::Negotiating(_)) {
            self.state = if self.tls_pending() {
                NegotiationState::Negotiating(Phase::Tls)
            } else {
                NegotiationState::Negotiating(Phase::Auth)
            };
        }

        if self.profile.auth == AuthStyle::Sasl {
            actions.push(Action::Send(self.features()));
        }
        actions
    }

    fn check_header(&self, header: &StreamHeader, to: Option<&str>, modern: bool) -> Result<(), StreamError> {
        match self.policy.framing {
            StreamFraming::Tcp => {
                if header.prefix() != Some("stream") {
                    return Err(StreamErrorCondition::BadNamespacePrefix.into());
                }
                if header.stream_ns.as_deref() != Some(ns::STREAMS)
                    || header.default_ns.as_deref() != Some(self.profile.namespace)
                {
                    return Err(StreamErrorCondition::InvalidNamespace.into());
                }
            }
            StreamFraming::WebSocket => {
                if header.default_ns.as_deref() != Some(ns::FRAMING) {
                    return Err(StreamErrorCondition::InvalidNamespace.into());
                }
            }
        }

        if self.profile.requires_version && !modern {
            return Err(StreamErrorCondition::UnsupportedVersion.into());
        }

        let domain = self.ctx.domain.as_str();
        let subdomain_suffix = format!(".{}", domain);
        match (to, self.profile.host_check) {
            (None, _) if self.profile.allow_missing_to => Ok(()),
            (None, _) => Err(StreamErrorCondition::HostUnknown.into()),
            (Some(to), HostCheck::Hosted) => {
                let component = to.ends_with(&subdomain_suffix) && self.ctx.routing().has_component_route(to);
                if to == domain || component {
                    Ok(())
                } else {
                    Err(StreamError::new(StreamErrorCondition::HostUnknown).with_text(format!("{} is not served here", to)))
                }
            }
            (Some(to), HostCheck::Subdomain) => {
                if !to.ends_with(&subdomain_suffix) {
                    Err(StreamErrorCondition::HostUnknown.into())
                } else if self.ctx.routing().has_component_route(to) {
                    Err(StreamErrorCondition::Conflict.into())
                } else {
                    Ok(())
                }
            }
        }
    }

    fn offer_context(&self) -> OfferContext {
        OfferContext {
            kind: self.session.kind(),
            encrypted: self.session.is_encrypted(),
            peer_certificate: !self.peer_certificates.is_empty(),
            anonymous_login: self.ctx.anonymous_login,
            password_retrieval: self.ctx.credentials.supports_password_retrieval(),
        }
    }

    fn offers_starttls(&self) -> bool {
        self.policy.framing == StreamFraming::Tcp
            && self.policy.tls_available
            && self.policy.tls != TlsPolicy::Disabled
            && !self.session.is_encrypted()
            && !self.tls_attempted
    }

    fn offers_compression(&self) -> bool {
        self.policy.framing == StreamFraming::Tcp
            && self.policy.compression == CompressionPolicy::Optional
            && !self.session.is_compressed()
            && !self.compression_attempted
    }

    fn features(&self) -> String {
        let mut inner = String::new();
        let compression = format!(
            "<compression xmlns='{}'><method>zlib</method></compression>",
            ns::COMPRESS_FEATURE
        );

        match self.state {
            NegotiationState::Bound | NegotiationState::Authenticated => {
                if self.offers_compression() {
                    inner.push_str(&compression);
                }
                if self.profile.resource_binding && self.state == NegotiationState::Bound {
                    inner.push_str(&format!("<bind xmlns='{}'/>", ns::BIND));
                    inner.push_str(&format!("<session xmlns='{}'><optional/></session>", ns::SESSION));
                }
            }
            _ => {
                if self.offers_starttls() {
                    if self.policy.tls == TlsPolicy::Required {
                        inner.push_str(&format!("<starttls xmlns='{}'><required/></starttls>", ns::TLS));
                    } else {
                        inner.push_str(&format!("<starttls xmlns='{}'/>", ns::TLS));
                    }
                }
                if !self.tls_pending() {
                    let offered = self.ctx.mechanisms.offered(&self.offer_context());
                    if !offered.is_empty() {
                        inner.push_str(&format!("<mechanisms xmlns='{}'>", ns::SASL));
                        for mechanism in offered {
                            inner.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
                        }
                        inner.push_str("</mechanisms>");
                    }
                    if self.offers_compression() {
                        inner.push_str(&compression);
                    }
                }
            }
        }
        self.policy.framing.features(&inner)
    }

    // ---- transport upgrades ----------------------------------------------------------

    fn handle_starttls(&mut self) -> Vec<Action> {
        let refused = self.policy.framing != StreamFraming::Tcp
            || !self.policy.tls_available
            || self.policy.tls == TlsPolicy::Disabled
            || self.session.is_encrypted()
            || self.tls_attempted
            || matches!(self.state, NegotiationState::Bound | NegotiationState::Authenticated);
        if refused {
            info!(conn_id = self.session.conn_id(), "Refusing STARTTLS");
            return self.failure_and_close(format!("<failure xmlns='{}'/>", ns::TLS));
        }

        self.tls_attempted = true;
        self.session.set_encryption(EncryptionState::Handshaking);
        self.expecting_header = true;
        self.header_sent = false;
        vec![
            Action::Send(format!("<proceed xmlns='{}'/>", ns::TLS)),
            Action::StartTls,
        ]
    }

    fn handle_compress(&mut self, stanza: &Stanza) -> Vec<Action> {
        let failure = |condition: &str| format!("<failure xmlns='{}'><{}/></failure>", ns::COMPRESS, condition);

        if self.policy.compression == CompressionPolicy::Disabled
            || self.policy.framing != StreamFraming::Tcp
            || self.session.is_compressed()
            || self.compression_attempted
        {
            info!(conn_id = self.session.conn_id(), "Refusing stream compression");
            return self.failure_and_close(failure("setup-failed"));
        }
        let method = stanza
            .element()
            .child_named("method")
            .map(|m| m.text())
            .unwrap_or_default();
        if method.trim() != "zlib" {
            info!(conn_id = self.session.conn_id(), method = method.trim(), "Unsupported compression method");
            return self.failure_and_close(failure("unsupported-method"));
        }

        self.compression_attempted = true;
        self.expecting_header = true;
        self.header_sent = false;
        vec![
            Action::Send(format!("<compressed xmlns='{}'/>", ns::COMPRESS)),
            Action::StartCompression,
        ]
    }

    // ---- authentication ----------------------------------------------------------------

    fn handle_pre_auth(&mut self, stanza: Stanza) -> Vec<Action> {
        if is(&stanza, "starttls", ns::TLS) {
            return self.handle_starttls();
        }
        if is(&stanza, "compress", ns::COMPRESS) {
            return self.handle_compress(&stanza);
        }

        match self.profile.auth {
            AuthStyle::Sasl if stanza.ns() == Some(ns::SASL) => match stanza.local_name() {
                "auth" => self.handle_auth(&stanza),
                "response" => self.sasl_step(&stanza.element().text()),
                "abort" => self.sasl_failure(SaslFailure::Aborted),
                _ => self.fail(StreamError::new(StreamErrorCondition::UnsupportedStanzaType)),
            },
            AuthStyle::Handshake if stanza.local_name() == "handshake" => self.handle_handshake(&stanza),
            _ if stanza.kind() != StanzaKind::Other => {
                self.fail(StreamError::new(StreamErrorCondition::NotAuthorized))
            }
            _ => self.fail(StreamError::new(StreamErrorCondition::UnsupportedStanzaType)),
        }
    }

    fn handle_auth(&mut self, stanza: &Stanza) -> Vec<Action> {
        let mechanism = stanza.attr("mechanism").unwrap_or_default().to_ascii_uppercase();
        let offered = self.ctx.mechanisms.offered(&self.offer_context());
        if !offered.contains(&mechanism.as_str()) {
            debug!(conn_id = self.session.conn_id(), mechanism = %mechanism, "Mechanism not offered");
            return self.sasl_failure(SaslFailure::InvalidMechanism);
        }
        match SaslExchange::start(&mechanism) {
            Some(exchange) => {
                self.sasl = Some(exchange);
                self.sasl_step(&stanza.element().text())
            }
            None => self.sasl_failure(SaslFailure::InvalidMechanism),
        }
    }

    fn sasl_step(&mut self, text: &str) -> Vec<Action> {
        let Some(mut exchange) = self.sasl.take() else {
            return self.sasl_failure(SaslFailure::MalformedRequest);
        };
        let payload = match decode_payload(text) {
            Ok(payload) => payload,
            Err(failure) => return self.sasl_failure(failure),
        };

        let step = {
            let sasl_ctx = SaslContext {
                domain: &self.ctx.domain,
                credentials: self.ctx.credentials.as_ref(),
                peer_certificates: &self.peer_certificates,
                peer_domain: self.stream_from.as_deref(),
            };
            exchange.step(payload.as_deref(), &sasl_ctx)
        };

        match step {
            SaslStep::Challenge(data) => {
                self.sasl = Some(exchange);
                vec![Action::Send(format!(
                    "<challenge xmlns='{}'>{}</challenge>",
                    ns::SASL,
                    encode_payload(&data)
                ))]
            }
            SaslStep::Success { identity, additional } => {
                self.sasl_success(exchange.mechanism(), identity, additional)
            }
            SaslStep::Failure(failure) => self.sasl_failure(failure),
        }
    }

    fn sasl_success(&mut self, mechanism: &str, identity: AuthIdentity, additional: Option<Vec<u8>>) -> Vec<Action> {
        if !identity.anonymous && self.session.kind() == ConnectionKind::Client {
            if let Some(node) = identity.jid.node() {
                if self.ctx.credentials.is_disabled(node) {
                    return self.sasl_failure(SaslFailure::AccountDisabled);
                }
            }
        }

        info!(
            conn_id = self.session.conn_id(),
            address = %identity.jid,
            mechanism,
            "Authenticated"
        );
        self.auth_failures = 0;
        self.session.set_address(identity.jid);
        self.session.set_anonymous(identity.anonymous);
        if self.profile.resource_binding {
            self.state = NegotiationState::Bound;
        } else {
            self.state = NegotiationState::Authenticated;
            self.session.set_status(SessionStatus::Authenticated);
        }
        self.expecting_header = true;
        self.header_sent = false;

        let success = match additional {
            Some(data) if !data.is_empty() => {
                format!("<success xmlns='{}'>{}</success>", ns::SASL, encode_payload(&data))
            }
            _ => format!("<success xmlns='{}'/>", ns::SASL),
        };
        vec![Action::Send(success)]
    }

    fn sasl_failure(&mut self, failure: SaslFailure) -> Vec<Action> {
        self.sasl = None;
        self.auth_failures += 1;
        let limit = self.ctx.max_auth_retries.max(1);
        debug!(
            conn_id = self.session.conn_id(),
            failure = failure.as_str(),
            attempt = self.auth_failures,
            limit,
            "SASL failure"
        );

        let mut actions = vec![Action::Send(failure.to_xml())];
        if self.auth_failures >= limit {
            warn!(
                conn_id = self.session.conn_id(),
                peer = ?self.session.peer_addr(),
                "Too many authentication failures, closing"
            );
            actions.push(Action::Send(self.policy.framing.close_stream().to_string()));
            actions.push(Action::Close);
            self.state = NegotiationState::Closed;
        }
        actions
    }

    fn handle_handshake(&mut self, stanza: &Stanza) -> Vec<Action> {
        let name = match self.session.kind() {
            ConnectionKind::Multiplexer => self.stream_from.clone(),
            _ => self.stream_to.clone(),
        };
        let Some(name) = name else {
            return self.fail(StreamError::new(StreamErrorCondition::NotAuthorized));
        };
        let Some(secret) = self.ctx.components.secret_for(&name).map(str::to_string) else {
            warn!(conn_id = self.session.conn_id(), name = %name, "No shared secret configured");
            return self.fail(StreamError::new(StreamErrorCondition::NotAuthorized));
        };

        let expected = hex::encode(Sha1::digest(format!("{}{}", self.session.stream_id(), secret).as_bytes()));
        if !stanza.element().text().trim().eq_ignore_ascii_case(&expected) {
            info!(conn_id = self.session.conn_id(), name = %name, "Handshake digest mismatch");
            return self.fail(StreamError::new(StreamErrorCondition::NotAuthorized));
        }
        let Ok(address) = Jid::domain_jid(&name) else {
            return self.fail(StreamError::new(StreamErrorCondition::HostUnknown));
        };

        if self.session.kind() == ConnectionKind::Component {
            let routing = self.ctx.routing().clone();
            if routing.has_component_route(&name) {
                return self.fail(StreamError::new(StreamErrorCondition::Conflict));
            }
            self.session.set_address(address);
            routing.add_component_route(&name, self.session.clone());
        } else {
            self.session.set_address(address);
        }
        self.session.set_status(SessionStatus::Authenticated);
        self.state = NegotiationState::Authenticated;
        info!(conn_id = self.session.conn_id(), name = %name, kind = %self.session.kind(), "Handshake accepted");
        vec![Action::Send(String::from("<handshake/>"))]
    }

    // ---- resource binding -----------------------------------------------------------------

    fn handle_bound(&mut self, stanza: Stanza) -> Vec<Action> {
        if is(&stanza, "starttls", ns::TLS) {
            return self.handle_starttls();
        }
        if is(&stanza, "compress", ns::COMPRESS) {
            return self.handle_compress(&stanza);
        }
        if stanza.kind() == StanzaKind::Iq && stanza.stanza_type() == Some("set") {
            if let Some(bind) = stanza.element().get_child("bind", ns::BIND) {
                return self.handle_bind(&stanza, bind);
            }
            if stanza.element().get_child("session", ns::SESSION).is_some() {
                return self.reply_result(&stanza);
            }
        }
        self.fail(StreamError::new(StreamErrorCondition::NotAuthorized))
    }

    fn handle_bind(&mut self, stanza: &Stanza, bind: &Element) -> Vec<Action> {
        let Some(account) = self.session.address() else {
            return self.fail(StreamError::new(StreamErrorCondition::InternalServerError));
        };
        let resource = bind
            .child_named("resource")
            .map(|r| r.text().trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| random_token(GENERATED_RESOURCE_LEN));
        let full = match account.to_bare().with_resource(&resource) {
            Ok(full) => full,
            Err(e) => {
                debug!(conn_id = self.session.conn_id(), error = %e, "Rejected resource");
                return self.reply_error(stanza, StanzaErrorCondition::BadRequest);
            }
        };

        let routing = self.ctx.routing().clone();
        if let Some(existing) = routing.get_client_route(&full) {
            if !Arc::ptr_eq(&existing, &self.session) {
                info!(
                    conn_id = self.session.conn_id(),
                    replaced = existing.conn_id(),
                    address = %full,
                    "Resource conflict, closing previous session"
                );
                existing.close(Some(StreamError::new(StreamErrorCondition::Conflict)));
                routing.remove_client_route(&full);
            }
        }

        self.session.set_address(full.clone());
        routing.add_client_route(&full, self.session.clone(), self.session.is_anonymous());
        self.session.set_status(SessionStatus::Authenticated);
        self.state = NegotiationState::Authenticated;
        info!(conn_id = self.session.conn_id(), address = %full, "Resource bound");

        let mut reply = Element::new("iq").with_attr("type", "result");
        if let Some(id) = stanza.id() {
            reply.set_attr("id", id);
        }
        let reply = reply.with_child(
            Element::new("bind")
                .with_attr("xmlns", ns::BIND)
                .with_child(Element::new("jid").with_text(full.to_string())),
        );
        vec![Action::Send(reply.to_xml())]
    }

    fn reply_result(&self, stanza: &Stanza) -> Vec<Action> {
        let mut reply = Element::new("iq").with_attr("type", "result");
        if let Some(id) = stanza.id() {
            reply.set_attr("id", id);
        }
        reply.set_attr("from", self.ctx.domain.clone());
        if let Some(from) = stanza.attr("from") {
            reply.set_attr("to", from);
        }
        vec![Action::Send(reply.to_xml())]
    }

    fn reply_error(&self, stanza: &Stanza, condition: StanzaErrorCondition) -> Vec<Action> {
        match stanza.error_reply(condition, None) {
            Some(reply) => vec![Action::Send(reply.into_string())],
            None => Vec::new(),
        }
    }

    // ---- application traffic --------------------------------------------------------------

    fn handle_authenticated(&mut self, stanza: Stanza) -> Vec<Action> {
        if is(&stanza, "starttls", ns::TLS) {
            return self.handle_starttls();
        }
        if is(&stanza, "compress", ns::COMPRESS) {
            return self.handle_compress(&stanza);
        }

        if stanza.kind() == StanzaKind::Iq
            && matches!(stanza.stanza_type(), Some("result") | Some("error"))
            && self.pending_ping.is_some()
            && stanza.id() == self.pending_ping.as_deref()
        {
            self.pending_ping = None;
            return Vec::new();
        }

        if self.session.kind() == ConnectionKind::Multiplexer && stanza.local_name() == "route" {
            let Some(inner) = stanza.element().children().next().cloned() else {
                return Vec::new();
            };
            return self.dispatch(Stanza::from_element(inner));
        }

        if stanza.kind() == StanzaKind::Other {
            return self.fail(StreamError::new(StreamErrorCondition::UnsupportedStanzaType));
        }
        self.dispatch(stanza)
    }

    fn is_server_address(&self, to: Option<&Jid>) -> bool {
        match to {
            None => true,
            Some(to) => to.node().is_none() && to.resource().is_none() && to.domain() == self.ctx.domain,
        }
    }

    fn dispatch(&mut self, mut stanza: Stanza) -> Vec<Action> {
        let Some(address) = self.session.address() else {
            return self.fail(StreamError::new(StreamErrorCondition::InternalServerError));
        };

        match self.session.kind() {
            ConnectionKind::Client => match stanza.from() {
                None => stanza.set_attr("from", &address.to_string()),
                Some(Ok(from)) if from == address || from == address.to_bare() => {}
                _ => return self.fail(StreamError::new(StreamErrorCondition::InvalidFrom)),
            },
            ConnectionKind::Server | ConnectionKind::Component => match stanza.from() {
                Some(Ok(from)) if from.is_within(address.domain()) => {}
                _ => return self.fail(StreamError::new(StreamErrorCondition::InvalidFrom)),
            },
            ConnectionKind::Multiplexer => {}
        }

        let to = match stanza.to() {
            None => None,
            Some(Ok(to)) => Some(to),
            Some(Err(e)) => {
                debug!(conn_id = self.session.conn_id(), error = %e, "Malformed destination");
                return self.reply_error(&stanza, StanzaErrorCondition::JidMalformed);
            }
        };

        match (stanza.kind(), to) {
            (StanzaKind::Presence, None) => {
                if self.session.kind() == ConnectionKind::Client {
                    let available = stanza.stanza_type() != Some("unavailable");
                    self.ctx.routing().set_route_availability(&address, available);
                }
                Vec::new()
            }
            (StanzaKind::Iq, to) if self.is_server_address(to.as_ref()) => self.handle_server_iq(&stanza),
            (StanzaKind::Message, Some(to)) if self.is_server_address(Some(&to)) => {
                debug!(conn_id = self.session.conn_id(), "Dropping message addressed to the server");
                Vec::new()
            }
            (_, Some(to)) => {
                if self.session.kind() == ConnectionKind::Server && !to.is_within(&self.ctx.domain) {
                    debug!(conn_id = self.session.conn_id(), to = %to, "Dropping relay attempt from remote server");
                    return Vec::new();
                }
                self.ctx.router.route(stanza, &self.session, &to);
                Vec::new()
            }
            (_, None) => {
                let sender = match stanza.from() {
                    Some(Ok(from)) => from.to_bare(),
                    _ => address.to_bare(),
                };
                self.ctx.router.route(stanza, &self.session, &sender);
                Vec::new()
            }
        }
    }

    /// IQs addressed to the server itself.
    fn handle_server_iq(&self, stanza: &Stanza) -> Vec<Action> {
        match stanza.stanza_type() {
            Some("get") | Some("set") => {}
            _ => return Vec::new(),
        }
        let element = stanza.element();
        if element.get_child("ping", ns::PING).is_some() || element.get_child("session", ns::SESSION).is_some() {
            return self.reply_result(stanza);
        }
        self.reply_error(stanza, StanzaErrorCondition::ServiceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_server::auth::StaticCredentialStore;
    use crate::xmpp_server::cluster::NodeId;
    use crate::xmpp_server::routing::RoutingOptions;
    use crate::xmpp_server::session::{Outbound, OutboundQueue};
    use base64::prelude::*;
    use std::collections::HashMap;

    const CLIENT_HEADER: &str = "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>";

    fn context_with(configure: impl FnOnce(&mut ServerConfig)) -> Arc<ServerContext> {
        let mut config = ServerConfig::default();
        config.server.domain = "example.com".to_string();
        config.components.secrets.insert("muc.example.com".to_string(), "s3cret".to_string());
        configure(&mut config);
        let credentials = Arc::new(StaticCredentialStore::new(HashMap::from([
            ("juliet".to_string(), "r0m30".to_string()),
            ("romeo".to_string(), "ju1iet".to_string()),
        ])));
        let routing = RoutingTable::new(
            "example.com",
            RoutingOptions {
                node_id: NodeId::new("local"),
                ..Default::default()
            },
        );
        Arc::new(ServerContext::new(&config, credentials, routing))
    }

    fn context() -> Arc<ServerContext> {
        context_with(|_| {})
    }

    fn policy(tls: TlsPolicy) -> ListenerPolicy {
        ListenerPolicy {
            tls,
            tls_available: tls != TlsPolicy::Disabled,
            compression: CompressionPolicy::Optional,
            framing: StreamFraming::Tcp,
        }
    }

    fn negotiator(
        ctx: &Arc<ServerContext>,
        kind: ConnectionKind,
        policy: ListenerPolicy,
    ) -> (StreamNegotiator, OutboundQueue) {
        let (session, rx) = Session::new(1, kind, None, None);
        (StreamNegotiator::new(session, ctx.clone(), policy), rx)
    }

    fn sent(actions: &[Action]) -> String {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn closes(actions: &[Action]) -> bool {
        actions.last() == Some(&Action::Close)
    }

    fn plain_auth(user: &str, password: &str) -> String {
        format!(
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>{}</auth>",
            BASE64_STANDARD.encode(format!("\0{}\0{}", user, password))
        )
    }

    /// Header, PLAIN, restart and bind.
    fn bind_client(n: &mut StreamNegotiator, user: &str, password: &str, resource: &str) -> String {
        n.process(CLIENT_HEADER);
        let success = sent(&n.process(&plain_auth(user, password)));
        assert!(success.starts_with("<success"), "{}", success);
        n.process(CLIENT_HEADER);
        sent(&n.process(&format!(
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>{}</resource></bind></iq>",
            resource
        )))
    }

    #[test]
    fn test_header_gets_features() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Optional));
        let out = sent(&n.process(CLIENT_HEADER));
        assert!(out.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(out.contains("from='example.com'"));
        assert!(out.contains("version='1.0'"));
        assert!(out.contains("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
        assert!(out.contains("<mechanism>SCRAM-SHA-256</mechanism><mechanism>PLAIN</mechanism>"));
        assert!(!out.contains("ANONYMOUS"));
        assert!(!out.contains("EXTERNAL"));
        assert!(out.contains("<method>zlib</method>"));
        assert_eq!(n.state(), NegotiationState::Negotiating(Phase::Auth));
        assert_eq!(n.session().status(), SessionStatus::Negotiating);
    }

    #[test]
    fn test_stream_ids_change_on_restart() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let first = n.session().stream_id();
        n.process(&plain_auth("juliet", "r0m30"));
        n.process(CLIENT_HEADER);
        assert_ne!(first, n.session().stream_id());
    }

    #[test]
    fn test_unknown_host_is_rejected() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Optional));
        let actions = n.process(
            "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='other.org' version='1.0'>",
        );
        let out = sent(&actions);
        assert!(out.starts_with("<?xml"));
        assert!(out.contains("<host-unknown xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(out.ends_with("</stream:stream>"));
        assert!(closes(&actions));
        assert!(n.is_closed());
    }

    #[test]
    fn test_header_namespace_checks() {
        let ctx = context();
        let cases = [
            (
                "<foo:stream xmlns='jabber:client' xmlns:foo='http://etherx.jabber.org/streams' to='example.com' version='1.0'>",
                "bad-namespace-prefix",
            ),
            (
                "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'>",
                "invalid-namespace",
            ),
            (
                "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com'>",
                "unsupported-version",
            ),
            (
                "<stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>",
                "host-unknown",
            ),
        ];
        for (header, condition) in cases {
            let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Optional));
            let actions = n.process(header);
            assert!(sent(&actions).contains(&format!("<{} ", condition)), "{}", header);
            assert!(closes(&actions));
        }
    }

    #[test]
    fn test_server_stream_may_omit_to() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Server, policy(TlsPolicy::Optional));
        let actions = n.process(
            "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' from='remote.org' version='1.0'>",
        );
        let out = sent(&actions);
        assert!(!closes(&actions));
        assert!(out.contains("<starttls"));
        assert!(!out.contains("<mechanisms"));
    }

    #[test]
    fn test_server_external_authenticates_certificate_domain() {
        const SERVER_HEADER: &str = "<stream:stream xmlns='jabber:server' xmlns:stream='http://etherx.jabber.org/streams' from='remote.example.org' to='example.com' version='1.0'>";
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Server, policy(TlsPolicy::Required));
        let issued = crate::xmpp_server::tls::test_certs::TestCa::new().issue("remote.example.org");
        n.tls_established(TlsInfo {
            protocol: "TLSv1.3".to_string(),
            cipher: "TLS13_AES_128_GCM_SHA256".to_string(),
            peer_certificates: vec![issued.der],
        });

        let out = sent(&n.process(SERVER_HEADER));
        assert!(!out.contains("<starttls"));
        assert!(out.contains("<mechanism>EXTERNAL</mechanism>"));

        let out = sent(&n.process("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>=</auth>"));
        assert_eq!(out, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
        assert_eq!(n.state(), NegotiationState::Authenticated);
        assert_eq!(n.session().address(), Some(Jid::domain_jid("remote.example.org").unwrap()));

        let out = sent(&n.process(SERVER_HEADER));
        assert!(!out.contains("<mechanisms"));
    }

    #[test]
    fn test_required_tls_rejects_early_stanzas() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Required));
        let out = sent(&n.process(CLIENT_HEADER));
        assert!(out.contains("<required/>"));
        assert!(!out.contains("<mechanisms"));
        assert_eq!(n.state(), NegotiationState::Negotiating(Phase::Tls));

        let actions = n.process(&plain_auth("juliet", "r0m30"));
        assert!(sent(&actions).contains("<not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(closes(&actions));
        assert!(n.session().address().is_none());
    }

    #[test]
    fn test_starttls_then_restart() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Required));
        n.process(CLIENT_HEADER);
        let actions = n.process("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert_eq!(
            actions,
            vec![
                Action::Send("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>".to_string()),
                Action::StartTls
            ]
        );
        assert_eq!(n.session().encryption(), EncryptionState::Handshaking);

        n.tls_established(TlsInfo {
            protocol: "TLSv1.3".to_string(),
            cipher: "TLS13_AES_128_GCM_SHA256".to_string(),
            peer_certificates: Vec::new(),
        });
        assert!(n.session().is_encrypted());

        let out = sent(&n.process(CLIENT_HEADER));
        assert!(!out.contains("<starttls"));
        assert!(out.contains("<mechanism>PLAIN</mechanism>"));
        assert_eq!(n.state(), NegotiationState::Negotiating(Phase::Auth));

        let actions = n.process("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert!(sent(&actions).starts_with("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
        assert!(closes(&actions));
    }

    #[test]
    fn test_starttls_after_authentication_is_rejected() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Optional));
        n.process(CLIENT_HEADER);
        n.process(&plain_auth("juliet", "r0m30"));
        n.process(CLIENT_HEADER);
        let actions = n.process("<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert!(sent(&actions).starts_with("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
        assert!(closes(&actions));
    }

    #[test]
    fn test_auth_retry_limit() {
        let ctx = context_with(|c| c.server.max_auth_retries = 3);
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        for attempt in 1..=3 {
            let actions = n.process(&plain_auth("juliet", "wrong"));
            assert!(sent(&actions).starts_with("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>"));
            assert_eq!(closes(&actions), attempt == 3, "attempt {}", attempt);
        }
        assert!(n.is_closed());
    }

    #[test]
    fn test_invalid_mechanism_counts_as_failure() {
        let ctx = context_with(|c| c.server.max_auth_retries = 1);
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let actions = n.process("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>");
        assert!(sent(&actions).contains("<invalid-mechanism/>"));
        assert!(closes(&actions));
    }

    #[test]
    fn test_disabled_account() {
        let store = StaticCredentialStore::default();
        store.set_password("juliet", "r0m30");
        store.set_disabled("juliet", true);
        let mut config = ServerConfig::default();
        config.server.domain = "example.com".to_string();
        let routing = RoutingTable::new("example.com", RoutingOptions::default());
        let ctx = Arc::new(ServerContext::new(&config, Arc::new(store), routing));

        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let actions = n.process(&plain_auth("juliet", "r0m30"));
        assert!(sent(&actions).contains("<account-disabled/>"));
        assert!(n.session().address().is_none());
    }

    #[test]
    fn test_plain_challenge_then_response() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let out = sent(&n.process("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'/>"));
        assert_eq!(out, "<challenge xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>=</challenge>");
        let response = format!(
            "<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{}</response>",
            BASE64_STANDARD.encode("\0juliet\0r0m30")
        );
        assert!(sent(&n.process(&response)).starts_with("<success"));
        assert_eq!(n.state(), NegotiationState::Bound);
    }

    #[test]
    fn test_response_without_exchange_is_malformed() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let out = sent(&n.process("<response xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>=</response>"));
        assert!(out.contains("<malformed-request/>"));
    }

    #[test]
    fn test_full_client_flow_and_routing() {
        let ctx = context();
        let (mut juliet, _jrx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        let (mut romeo, mut rrx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));

        juliet.process(CLIENT_HEADER);
        juliet.process(&plain_auth("juliet", "r0m30"));
        let out = sent(&juliet.process(CLIENT_HEADER));
        assert!(out.contains("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"));
        assert!(out.contains("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'><optional/></session>"));
        let out = sent(&juliet.process(
            "<iq type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>balcony</resource></bind></iq>",
        ));
        assert!(out.contains("<jid>juliet@example.com/balcony</jid>"));
        assert!(out.contains("id='b1'"));
        assert_eq!(juliet.state(), NegotiationState::Authenticated);

        let out = bind_client(&mut romeo, "romeo", "ju1iet", "orchard");
        assert!(out.contains("<jid>romeo@example.com/orchard</jid>"));
        romeo.process("<presence/>");
        let routing = ctx.routing();
        assert_eq!(
            routing.get_routes(&Jid::parse("romeo@example.com").unwrap()),
            vec![Jid::parse("romeo@example.com/orchard").unwrap()]
        );

        assert!(juliet
            .process("<message to='romeo@example.com/orchard' id='m1'><body>wherefore</body></message>")
            .is_empty());
        match rrx.try_recv() {
            Ok(Outbound::Stanza(s)) => {
                assert!(s.contains("from='juliet@example.com/balcony'"));
                assert!(s.contains("<body>wherefore</body>"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_generated_resource() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        n.process(&plain_auth("juliet", "r0m30"));
        n.process(CLIENT_HEADER);
        let out = sent(&n.process("<iq type='set' id='b'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>"));
        assert!(out.contains("<jid>juliet@example.com/"));
        let address = n.session().address().unwrap();
        assert_eq!(address.resource().map(str::len), Some(GENERATED_RESOURCE_LEN));
    }

    #[test]
    fn test_bind_conflict_replaces_old_session() {
        let ctx = context();
        let (mut first, mut first_rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        let (mut second, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        bind_client(&mut first, "juliet", "r0m30", "balcony");
        bind_client(&mut second, "juliet", "r0m30", "balcony");

        assert_eq!(
            first_rx.try_recv(),
            Ok(Outbound::Close(Some(StreamError::new(StreamErrorCondition::Conflict))))
        );
        let address = Jid::parse("juliet@example.com/balcony").unwrap();
        let owner = ctx.routing().get_client_route(&address).unwrap();
        assert!(Arc::ptr_eq(&owner, second.session()));
        assert!(!ctx.routing().unregister_session(first.session()));
    }

    #[test]
    fn test_stanza_before_bind_is_rejected() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        n.process(&plain_auth("juliet", "r0m30"));
        n.process(CLIENT_HEADER);
        let actions = n.process("<message to='romeo@example.com'><body>x</body></message>");
        assert!(sent(&actions).contains("<not-authorized xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>"));
        assert!(closes(&actions));
    }

    #[test]
    fn test_spoofed_from_is_invalid() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        bind_client(&mut n, "juliet", "r0m30", "balcony");
        let actions = n.process("<message from='romeo@example.com/orchard' to='nurse@example.com'/>");
        assert!(sent(&actions).contains("<invalid-from "));
        assert!(closes(&actions));
    }

    #[test]
    fn test_malformed_to_gets_error_reply() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        bind_client(&mut n, "juliet", "r0m30", "balcony");
        let actions = n.process("<message to='@bad' id='x'/>");
        let out = sent(&actions);
        assert!(out.contains("<jid-malformed"));
        assert!(out.contains("to='juliet@example.com/balcony'"));
        assert!(!n.is_closed());
    }

    #[test]
    fn test_server_answers_ping_and_session() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        bind_client(&mut n, "juliet", "r0m30", "balcony");
        let out = sent(&n.process("<iq type='get' id='p1' to='example.com'><ping xmlns='urn:xmpp:ping'/></iq>"));
        assert!(out.contains("type='result'"));
        assert!(out.contains("id='p1'"));
        assert!(out.contains("to='juliet@example.com/balcony'"));

        let out = sent(&n.process("<iq type='set' id='s1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>"));
        assert!(out.contains("type='result'"));

        let out = sent(&n.process("<iq type='get' id='v1' to='example.com'><query xmlns='jabber:iq:version'/></iq>"));
        assert!(out.contains("<service-unavailable"));
    }

    #[test]
    fn test_keepalive_ping_result_is_consumed() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        assert!(n.keepalive_ping().is_none());
        bind_client(&mut n, "juliet", "r0m30", "balcony");
        let ping = n.keepalive_ping().unwrap();
        assert!(ping.contains("<ping xmlns='urn:xmpp:ping'/>"));
        assert!(n.keepalive_ping().is_none());

        let ping = Stanza::parse(ping).unwrap();
        let result = format!("<iq type='result' id='{}' to='example.com'/>", ping.id().unwrap());
        assert!(n.process(&result).is_empty());
        assert!(n.keepalive_ping().is_some());
    }

    #[test]
    fn test_presence_updates_availability() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        bind_client(&mut n, "juliet", "r0m30", "balcony");
        let address = Jid::parse("juliet@example.com/balcony").unwrap();
        assert!(!ctx.routing().client_route(&address).unwrap().available);
        n.process("<presence/>");
        assert!(ctx.routing().client_route(&address).unwrap().available);
        n.process("<presence type='unavailable'/>");
        assert!(!ctx.routing().client_route(&address).unwrap().available);
    }

    #[test]
    fn test_compression_negotiation() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let actions = n.process("<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress>");
        assert_eq!(
            actions,
            vec![
                Action::Send("<compressed xmlns='http://jabber.org/protocol/compress'/>".to_string()),
                Action::StartCompression
            ]
        );
        n.compression_established();
        let out = sent(&n.process(CLIENT_HEADER));
        assert!(!out.contains("<compression"));

        let actions = n.process("<compress xmlns='http://jabber.org/protocol/compress'><method>zlib</method></compress>");
        assert!(sent(&actions).contains("<setup-failed/>"));
        assert!(closes(&actions));
    }

    #[test]
    fn test_unsupported_compression_method() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let actions = n.process("<compress xmlns='http://jabber.org/protocol/compress'><method>lzw</method></compress>");
        assert!(sent(&actions).contains("<unsupported-method/>"));
        assert!(closes(&actions));
    }

    fn component_header(to: &str) -> String {
        format!(
            "<stream:stream xmlns='jabber:component:accept' xmlns:stream='http://etherx.jabber.org/streams' to='{}'>",
            to
        )
    }

    #[test]
    fn test_component_handshake() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Component, policy(TlsPolicy::Disabled));
        let out = sent(&n.process(&component_header("muc.example.com")));
        assert!(out.contains("from='muc.example.com'"));
        assert!(!out.contains("<stream:features"));
        assert!(out.ends_with("xml:lang='en'>"));

        let digest = hex::encode(Sha1::digest(format!("{}s3cret", n.session().stream_id()).as_bytes()));
        let actions = n.process(&format!("<handshake>{}</handshake>", digest));
        assert_eq!(actions, vec![Action::Send("<handshake/>".to_string())]);
        assert!(ctx.routing().has_component_route("muc.example.com"));
        assert_eq!(n.state(), NegotiationState::Authenticated);

        let (mut again, _rx2) = negotiator(&ctx, ConnectionKind::Component, policy(TlsPolicy::Disabled));
        let actions = again.process(&component_header("muc.example.com"));
        assert!(sent(&actions).contains("<conflict "));
    }

    #[test]
    fn test_component_bad_handshake() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Component, policy(TlsPolicy::Disabled));
        n.process(&component_header("muc.example.com"));
        let actions = n.process("<handshake>0000</handshake>");
        assert!(sent(&actions).contains("<not-authorized "));
        assert!(!ctx.routing().has_component_route("muc.example.com"));
    }

    #[test]
    fn test_component_must_be_subdomain() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Component, policy(TlsPolicy::Disabled));
        let actions = n.process(&component_header("muc.other.org"));
        assert!(sent(&actions).contains("<host-unknown "));
    }

    #[test]
    fn test_component_traffic_needs_own_from() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Component, policy(TlsPolicy::Disabled));
        n.process(&component_header("muc.example.com"));
        let digest = hex::encode(Sha1::digest(format!("{}s3cret", n.session().stream_id()).as_bytes()));
        n.process(&format!("<handshake>{}</handshake>", digest));

        let actions = n.process("<message from='juliet@example.com' to='romeo@example.com'/>");
        assert!(sent(&actions).contains("<invalid-from "));
    }

    #[test]
    fn test_websocket_framing() {
        let ctx = context();
        let ws = ListenerPolicy {
            tls: TlsPolicy::Optional,
            tls_available: true,
            compression: CompressionPolicy::Optional,
            framing: StreamFraming::WebSocket,
        };
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, ws);
        let actions = n.process("<open xmlns='urn:ietf:params:xml:ns:xmpp-framing' to='example.com' version='1.0'/>");
        assert_eq!(actions.len(), 2);
        let out = sent(&actions);
        assert!(out.starts_with("<open xmlns='urn:ietf:params:xml:ns:xmpp-framing'"));
        assert!(out.contains("<stream:features xmlns:stream='http://etherx.jabber.org/streams'>"));
        assert!(!out.contains("starttls"));
        assert!(!out.contains("compression"));

        let actions = n.process("<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>");
        assert_eq!(
            actions,
            vec![
                Action::Send("<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>".to_string()),
                Action::Close
            ]
        );
    }

    #[test]
    fn test_stream_close() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        n.process(CLIENT_HEADER);
        let actions = n.process("</stream:stream>");
        assert_eq!(
            actions,
            vec![Action::Send("</stream:stream>".to_string()), Action::Close]
        );
        assert!(n.process("<presence/>").is_empty());
    }

    #[test]
    fn test_fail_before_header_sends_header_first() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        let actions = n.fail(StreamError::new(StreamErrorCondition::SystemShutdown));
        let out = sent(&actions);
        assert!(out.starts_with("<?xml version='1.0'?><stream:stream"));
        assert!(out.contains("<system-shutdown "));
    }

    #[test]
    fn test_anonymous_login() {
        let ctx = context_with(|c| c.server.anonymous_login = true);
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        let out = sent(&n.process(CLIENT_HEADER));
        assert!(out.contains("<mechanism>ANONYMOUS</mechanism>"));
        let out = sent(&n.process("<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='ANONYMOUS'/>"));
        assert!(out.starts_with("<success"));
        assert!(n.session().is_anonymous());
        n.process(CLIENT_HEADER);
        n.process("<iq type='set' id='b'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>");
        let address = n.session().address().unwrap();
        assert!(ctx.routing().is_anonymous_route(&address));
    }

    struct DropIq;

    impl crate::xmpp_server::router::PacketInterceptor for DropIq {
        fn intercept(
            &self,
            stanza: &Stanza,
            _session: &Session,
            incoming: bool,
            _processed: bool,
        ) -> Result<(), crate::xmpp_server::router::PacketRejected> {
            if !incoming && stanza.local_name() == "iq" {
                return Err(crate::xmpp_server::router::PacketRejected::new("no iq"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_outgoing_stanzas_pass_interceptors() {
        let ctx = context();
        let (mut n, _rx) = negotiator(&ctx, ConnectionKind::Client, policy(TlsPolicy::Disabled));
        let message = "<message to='juliet@example.com/balcony'><body>hi</body></message>".to_string();
        assert_eq!(n.outgoing(message.clone()), vec![Action::Send(message.clone())]);

        ctx.router.add_interceptor(Arc::new(DropIq));
        assert_eq!(n.outgoing(message.clone()), vec![Action::Send(message)]);
        assert!(n.outgoing("<iq type='get' id='1'/>".to_string()).is_empty());
    }
}
