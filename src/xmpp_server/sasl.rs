//! SASL mechanism negotiation.
//!
//! The set of enabled mechanisms is owned by a `MechanismRegistry` handed to
//! the negotiator at construction; what a given stream is offered is derived
//! from it per connection (class, encryption, peer certificate, backend
//! capabilities). One `SaslExchange` holds the in-flight context of a single
//! authentication attempt and is dropped when the attempt ends.

use std::collections::BTreeSet;

use base64::prelude::*;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::auth::{AuthError, CredentialStore};
use super::error::SaslFailure;
use super::jid::Jid;
use super::session::{random_token, ConnectionKind};
use super::tls::certificate_matches;

type HmacSha256 = Hmac<Sha256>;

/// Mechanisms this server implements, in order of preference.
pub const SUPPORTED_MECHANISMS: [&str; 4] = ["SCRAM-SHA-256", "PLAIN", "EXTERNAL", "ANONYMOUS"];

const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SALT_LEN: usize = 16;
const SCRAM_NONCE_LEN: usize = 24;
const ANONYMOUS_NODE_LEN: usize = 12;

/// Enabled mechanisms, adjustable at runtime by administrative operations.
#[derive(Debug, Default)]
pub struct MechanismRegistry {
    enabled: RwLock<BTreeSet<String>>,
}

/// What a stream looks like when its feature list is built.
#[derive(Debug, Clone, Copy)]
pub struct OfferContext {
    pub kind: ConnectionKind,
    pub encrypted: bool,
    pub peer_certificate: bool,
    pub anonymous_login: bool,
    pub password_retrieval: bool,
}

impl MechanismRegistry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let registry = Self::default();
        for name in names {
            if !registry.add(name.as_ref()) {
                warn!(mechanism = name.as_ref(), "Ignoring unsupported SASL mechanism");
            }
        }
        registry
    }

    /// Enable a mechanism. Returns false for mechanisms this server does not implement.
    pub fn add(&self, name: &str) -> bool {
        let name = name.trim().to_ascii_uppercase();
        if !SUPPORTED_MECHANISMS.contains(&name.as_str()) {
            return false;
        }
        self.enabled.write().insert(name);
        true
    }

    /// Disable a mechanism. Returns whether it was enabled.
    pub fn remove(&self, name: &str) -> bool {
        self.enabled
            .write()
            .remove(&name.trim().to_ascii_uppercase())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.enabled.read().contains(&name.to_ascii_uppercase())
    }

    pub fn enabled(&self) -> Vec<String> {
        self.enabled.read().iter().cloned().collect()
    }

    /// Mechanisms to advertise on a stream, in preference order.
    pub fn offered(&self, offer: &OfferContext) -> Vec<&'static str> {
        let enabled = self.enabled.read();
        SUPPORTED_MECHANISMS
            .iter()
            .copied()
            .filter(|name| enabled.contains(*name))
            .filter(|name| match (*name, offer.kind) {
                // Server streams authenticate with certificates only.
                ("EXTERNAL", ConnectionKind::Server) => offer.encrypted && offer.peer_certificate,
                (_, ConnectionKind::Server) => false,
                ("EXTERNAL", _) => false,
                ("SCRAM-SHA-256", ConnectionKind::Client) => offer.password_retrieval,
                ("ANONYMOUS", ConnectionKind::Client) => offer.anonymous_login,
                ("PLAIN", ConnectionKind::Client) => true,
                _ => false,
            })
            .collect()
    }
}

/// Decode the base64 text of `<auth>`/`<response>`. Empty text means no
/// payload, `=` means an empty one.
pub fn decode_payload(text: &str) -> Result<Option<Vec<u8>>, SaslFailure> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    match compact.as_str() {
        "" => Ok(None),
        "=" => Ok(Some(Vec::new())),
        data => BASE64_STANDARD
            .decode(data)
            .map(Some)
            .map_err(|_| SaslFailure::IncorrectEncoding),
    }
}

pub fn encode_payload(data: &[u8]) -> String {
    if data.is_empty() {
        String::from("=")
    } else {
        BASE64_STANDARD.encode(data)
    }
}

/// Identity established by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthIdentity {
    pub jid: Jid,
    pub anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaslStep {
    Challenge(Vec<u8>),
    Success {
        identity: AuthIdentity,
        additional: Option<Vec<u8>>,
    },
    Failure(SaslFailure),
}

/// Inputs a mechanism may consult.
pub struct SaslContext<'a> {
    pub domain: &'a str,
    pub credentials: &'a dyn CredentialStore,
    pub peer_certificates: &'a [CertificateDer<'static>],
    /// Domain claimed in the peer's stream header (server streams).
    pub peer_domain: Option<&'a str>,
}

/// In-flight state of one authentication attempt.
#[derive(Debug)]
pub enum SaslExchange {
    Plain,
    Anonymous,
    External,
    ScramSha256(ScramExchange),
}

impl SaslExchange {
    pub fn start(mechanism: &str) -> Option<Self> {
        match mechanism {
            "PLAIN" => Some(Self::Plain),
            "ANONYMOUS" => Some(Self::Anonymous),
            "EXTERNAL" => Some(Self::External),
            "SCRAM-SHA-256" => Some(Self::ScramSha256(ScramExchange::default())),
            _ => None,
        }
    }

    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Anonymous => "ANONYMOUS",
            Self::External => "EXTERNAL",
            Self::ScramSha256(_) => "SCRAM-SHA-256",
        }
    }

    /// Feed the next client payload (`None` when `<auth>` carried no initial response).
    pub fn step(&mut self, payload: Option<&[u8]>, ctx: &SaslContext<'_>) -> SaslStep {
        match self {
            Self::Plain => plain(payload, ctx),
            Self::Anonymous => anonymous(ctx),
            Self::External => external(payload, ctx),
            Self::ScramSha256(scram) => scram.step(payload, ctx),
        }
    }
}

fn user_jid(username: &str, ctx: &SaslContext<'_>) -> Result<Jid, SaslFailure> {
    // The authentication identity may be given as a bare address.
    let username = match username.split_once('@') {
        Some((node, domain)) if domain.eq_ignore_ascii_case(ctx.domain) => node,
        Some(_) => return Err(SaslFailure::NotAuthorized),
        None => username,
    };
    Jid::new(Some(username), ctx.domain, None).map_err(|_| SaslFailure::MalformedRequest)
}

fn check_authzid(authzid: &str, jid: &Jid) -> Result<(), SaslFailure> {
    if authzid.is_empty() {
        return Ok(());
    }
    match Jid::parse(authzid) {
        Ok(requested) if requested == *jid => Ok(()),
        _ => Err(SaslFailure::InvalidAuthzid),
    }
}

fn auth_failure(e: AuthError) -> SaslFailure {
    match e {
        AuthError::AccountDisabled => SaslFailure::AccountDisabled,
        AuthError::Temporary(_) => SaslFailure::TemporaryAuthFailure,
        AuthError::NotAuthorized | AuthError::Unsupported => SaslFailure::NotAuthorized,
    }
}

/// RFC 4616: `authzid NUL authcid NUL passwd`.
fn plain(payload: Option<&[u8]>, ctx: &SaslContext<'_>) -> SaslStep {
    let Some(data) = payload else {
        return SaslStep::Challenge(Vec::new());
    };

    let parts: Vec<&[u8]> = data.split(|&b| b == 0).collect();
    if parts.len() != 3 {
        return SaslStep::Failure(SaslFailure::MalformedRequest);
    }
    let (Ok(authzid), Ok(authcid), Ok(password)) = (
        std::str::from_utf8(parts[0]),
        std::str::from_utf8(parts[1]),
        std::str::from_utf8(parts[2]),
    ) else {
        return SaslStep::Failure(SaslFailure::MalformedRequest);
    };

    let jid = match user_jid(authcid, ctx) {
        Ok(jid) => jid,
        Err(f) => return SaslStep::Failure(f),
    };
    if let Err(f) = check_authzid(authzid, &jid) {
        return SaslStep::Failure(f);
    }

    let username = jid.node().unwrap_or_default();
    match ctx.credentials.authenticate(username, password) {
        Ok(()) => SaslStep::Success {
            identity: AuthIdentity {
                jid,
                anonymous: false,
            },
            additional: None,
        },
        Err(e) => {
            debug!(username, error = %e, "PLAIN authentication failed");
            SaslStep::Failure(auth_failure(e))
        }
    }
}

fn anonymous(ctx: &SaslContext<'_>) -> SaslStep {
    let node = random_token(ANONYMOUS_NODE_LEN).to_lowercase();
    match Jid::new(Some(&node), ctx.domain, None) {
        Ok(jid) => SaslStep::Success {
            identity: AuthIdentity {
                jid,
                anonymous: true,
            },
            additional: None,
        },
        Err(_) => SaslStep::Failure(SaslFailure::TemporaryAuthFailure),
    }
}

/// Certificate based authentication of a server peer. The claimed identity
/// (or, when empty, the domain from the stream header) must be one of the
/// identities in the presented certificate.
fn external(payload: Option<&[u8]>, ctx: &SaslContext<'_>) -> SaslStep {
    let Some(data) = payload else {
        return SaslStep::Challenge(Vec::new());
    };
    let Ok(claimed) = std::str::from_utf8(data) else {
        return SaslStep::Failure(SaslFailure::MalformedRequest);
    };

    let identity = if claimed.is_empty() {
        match ctx.peer_domain {
            Some(domain) => domain,
            None => return SaslStep::Failure(SaslFailure::NotAuthorized),
        }
    } else {
        claimed
    };

    let Ok(jid) = Jid::domain_jid(identity) else {
        return SaslStep::Failure(SaslFailure::InvalidAuthzid);
    };
    if let Some(peer_domain) = ctx.peer_domain {
        if !peer_domain.eq_ignore_ascii_case(jid.domain()) {
            return SaslStep::Failure(SaslFailure::InvalidAuthzid);
        }
    }

    let Some(certificate) = ctx.peer_certificates.first() else {
        return SaslStep::Failure(SaslFailure::NotAuthorized);
    };
    if !certificate_matches(certificate, jid.domain()) {
        debug!(identity = jid.domain(), "Peer certificate does not cover claimed identity");
        return SaslStep::Failure(SaslFailure::NotAuthorized);
    }

    SaslStep::Success {
        identity: AuthIdentity {
            jid,
            anonymous: false,
        },
        additional: None,
    }
}

/// RFC 5802 / RFC 7677 server side, without channel binding.
#[derive(Debug, Default)]
pub struct ScramExchange {
    stage: ScramStage,
}

#[derive(Debug, Default)]
enum ScramStage {
    #[default]
    Initial,
    AwaitingFinal(ScramPending),
    Done,
}

#[derive(Debug)]
struct ScramPending {
    jid: Jid,
    gs2_header: String,
    client_first_bare: String,
    server_first: String,
    nonce: String,
    salted_password: [u8; 32],
}

impl ScramExchange {
    fn step(&mut self, payload: Option<&[u8]>, ctx: &SaslContext<'_>) -> SaslStep {
        let Some(data) = payload else {
            return match self.stage {
                ScramStage::Initial => SaslStep::Challenge(Vec::new()),
                _ => SaslStep::Failure(SaslFailure::MalformedRequest),
            };
        };
        let Ok(message) = std::str::from_utf8(data) else {
            return SaslStep::Failure(SaslFailure::MalformedRequest);
        };

        match std::mem::take(&mut self.stage) {
            ScramStage::Initial => match client_first(message, ctx) {
                Ok((pending, challenge)) => {
                    self.stage = ScramStage::AwaitingFinal(pending);
                    SaslStep::Challenge(challenge.into_bytes())
                }
                Err(f) => SaslStep::Failure(f),
            },
            ScramStage::AwaitingFinal(pending) => {
                self.stage = ScramStage::Done;
                client_final(message, pending)
            }
            ScramStage::Done => SaslStep::Failure(SaslFailure::MalformedRequest),
        }
    }
}

/// Attributes of a SCRAM message (`k=value,...`).
fn scram_attributes(message: &str) -> Vec<(char, &str)> {
    message
        .split(',')
        .filter_map(|part| {
            let mut chars = part.chars();
            let key = chars.next()?;
            let value = part.get(key.len_utf8()..)?.strip_prefix('=')?;
            Some((key, value))
        })
        .collect()
}

fn scram_attribute<'a>(attributes: &[(char, &'a str)], key: char) -> Option<&'a str> {
    attributes.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// `saslname` decoding: `=2C` is a comma and `=3D` an equals sign.
fn decode_saslname(name: &str) -> Result<String, SaslFailure> {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(pos) = rest.find('=') {
        out.push_str(&rest[..pos]);
        let escaped = rest.get(pos..pos + 3).ok_or(SaslFailure::MalformedRequest)?;
        match escaped {
            "=2C" => out.push(','),
            "=3D" => out.push('='),
            _ => return Err(SaslFailure::MalformedRequest),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Option<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(data);
    Some(mac.finalize().into_bytes().into())
}

fn client_first(message: &str, ctx: &SaslContext<'_>) -> Result<(ScramPending, String), SaslFailure> {
    // gs2-header = cbind-flag "," [authzid] ","
    let mut parts = message.splitn(3, ',');
    let (Some(cbind), Some(authzid), Some(bare)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(SaslFailure::MalformedRequest);
    };
    if cbind != "n" && cbind != "y" {
        return Err(SaslFailure::MalformedRequest);
    }
    let authzid = match authzid {
        "" => "",
        a => a.strip_prefix("a=").ok_or(SaslFailure::MalformedRequest)?,
    };
    if bare.starts_with("m=") {
        return Err(SaslFailure::MalformedRequest);
    }

    let attributes = scram_attributes(bare);
    let username = scram_attribute(&attributes, 'n').ok_or(SaslFailure::MalformedRequest)?;
    let client_nonce = scram_attribute(&attributes, 'r').ok_or(SaslFailure::MalformedRequest)?;
    if client_nonce.is_empty() {
        return Err(SaslFailure::MalformedRequest);
    }

    let username = decode_saslname(username)?;
    let jid = user_jid(&username, ctx)?;
    check_authzid(&decode_saslname(authzid)?, &jid)?;

    let node = jid.node().unwrap_or_default();
    let password = ctx.credentials.password(node).map_err(auth_failure)?;

    let mut salt = [0u8; SCRAM_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut salted_password = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, SCRAM_ITERATIONS, &mut salted_password);

    let nonce = format!("{}{}", client_nonce, random_token(SCRAM_NONCE_LEN));
    let server_first = format!(
        "r={},s={},i={}",
        nonce,
        BASE64_STANDARD.encode(salt),
        SCRAM_ITERATIONS
    );
    let gs2_len = message.len() - bare.len();

    Ok((
        ScramPending {
            jid,
            gs2_header: message[..gs2_len].to_string(),
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            nonce,
            salted_password,
        },
        server_first,
    ))
}

fn client_final(message: &str, pending: ScramPending) -> SaslStep {
    let Some((without_proof, proof)) = message.rsplit_once(",p=") else {
        return SaslStep::Failure(SaslFailure::MalformedRequest);
    };
    let attributes = scram_attributes(without_proof);

    let expected_binding = BASE64_STANDARD.encode(pending.gs2_header.as_bytes());
    if scram_attribute(&attributes, 'c') != Some(expected_binding.as_str()) {
        return SaslStep::Failure(SaslFailure::MalformedRequest);
    }
    if scram_attribute(&attributes, 'r') != Some(pending.nonce.as_str()) {
        return SaslStep::Failure(SaslFailure::NotAuthorized);
    }
    let Ok(proof) = BASE64_STANDARD.decode(proof) else {
        return SaslStep::Failure(SaslFailure::IncorrectEncoding);
    };
    if proof.len() != 32 {
        return SaslStep::Failure(SaslFailure::NotAuthorized);
    }

    let auth_message = format!(
        "{},{},{}",
        pending.client_first_bare, pending.server_first, without_proof
    );

    let signatures = (|| {
        let client_key = hmac_sha256(&pending.salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let server_key = hmac_sha256(&pending.salted_password, b"Server Key")?;
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;
        Some((stored_key, client_signature, server_signature))
    })();
    let Some((stored_key, client_signature, server_signature)) = signatures else {
        return SaslStep::Failure(SaslFailure::TemporaryAuthFailure);
    };

    let recovered: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(p, s)| p ^ s)
        .collect();
    let recovered_stored: [u8; 32] = Sha256::digest(&recovered).into();
    if recovered_stored != stored_key {
        return SaslStep::Failure(SaslFailure::NotAuthorized);
    }

    SaslStep::Success {
        identity: AuthIdentity {
            jid: pending.jid,
            anonymous: false,
        },
        additional: Some(format!("v={}", BASE64_STANDARD.encode(server_signature)).into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp_server::auth::StaticCredentialStore;
    use std::collections::HashMap;

    fn store() -> StaticCredentialStore {
        StaticCredentialStore::new(HashMap::from([("juliet".to_string(), "r0m30".to_string())]))
    }

    fn ctx<'a>(store: &'a StaticCredentialStore) -> SaslContext<'a> {
        SaslContext {
            domain: "example.com",
            credentials: store,
            peer_certificates: &[],
            peer_domain: None,
        }
    }

    fn offer(kind: ConnectionKind) -> OfferContext {
        OfferContext {
            kind,
            encrypted: false,
            peer_certificate: false,
            anonymous_login: false,
            password_retrieval: true,
        }
    }

    #[test]
    fn test_registry_add_remove() {
        let registry = MechanismRegistry::new(["plain", "BOGUS"]);
        assert_eq!(registry.enabled(), vec!["PLAIN".to_string()]);
        assert!(registry.add("scram-sha-256"));
        assert!(!registry.add("DIGEST-MD5"));
        assert!(registry.remove("PLAIN"));
        assert!(!registry.remove("PLAIN"));
        assert_eq!(registry.enabled(), vec!["SCRAM-SHA-256".to_string()]);
    }

    #[test]
    fn test_offered_mechanisms_are_filtered() {
        let registry = MechanismRegistry::new(SUPPORTED_MECHANISMS);

        assert_eq!(registry.offered(&offer(ConnectionKind::Client)), vec!["SCRAM-SHA-256", "PLAIN"]);

        let mut no_retrieval = offer(ConnectionKind::Client);
        no_retrieval.password_retrieval = false;
        no_retrieval.anonymous_login = true;
        assert_eq!(registry.offered(&no_retrieval), vec!["PLAIN", "ANONYMOUS"]);

        let plain_server = offer(ConnectionKind::Server);
        assert!(registry.offered(&plain_server).is_empty());

        let mut tls_server = offer(ConnectionKind::Server);
        tls_server.encrypted = true;
        tls_server.peer_certificate = true;
        assert_eq!(registry.offered(&tls_server), vec!["EXTERNAL"]);

        assert!(registry.offered(&offer(ConnectionKind::Component)).is_empty());
    }

    #[test]
    fn test_payload_decoding() {
        assert_eq!(decode_payload(""), Ok(None));
        assert_eq!(decode_payload("="), Ok(Some(Vec::new())));
        assert_eq!(decode_payload(" aGk=\n"), Ok(Some(b"hi".to_vec())));
        assert_eq!(decode_payload("not base64!"), Err(SaslFailure::IncorrectEncoding));
        assert_eq!(encode_payload(b""), "=");
    }

    #[test]
    fn test_plain_success_and_failure() {
        let store = store();
        let ctx = ctx(&store);

        let mut exchange = SaslExchange::start("PLAIN").unwrap();
        match exchange.step(Some(b"\0juliet\0r0m30"), &ctx) {
            SaslStep::Success { identity, .. } => {
                assert_eq!(identity.jid.to_string(), "juliet@example.com");
                assert!(!identity.anonymous);
            }
            other => panic!("unexpected step {:?}", other),
        }

        let mut exchange = SaslExchange::start("PLAIN").unwrap();
        assert_eq!(
            exchange.step(Some(b"\0juliet\0wrong"), &ctx),
            SaslStep::Failure(SaslFailure::NotAuthorized)
        );
        assert_eq!(
            exchange.step(Some(b"juliet"), &ctx),
            SaslStep::Failure(SaslFailure::MalformedRequest)
        );
        assert_eq!(
            exchange.step(Some(b"romeo@example.com\0juliet\0r0m30"), &ctx),
            SaslStep::Failure(SaslFailure::InvalidAuthzid)
        );
    }

    #[test]
    fn test_plain_without_initial_response_challenges() {
        let store = store();
        let mut exchange = SaslExchange::start("PLAIN").unwrap();
        assert_eq!(exchange.step(None, &ctx(&store)), SaslStep::Challenge(Vec::new()));
    }

    #[test]
    fn test_anonymous_generates_identity() {
        let store = store();
        let mut exchange = SaslExchange::start("ANONYMOUS").unwrap();
        match exchange.step(None, &ctx(&store)) {
            SaslStep::Success { identity, .. } => {
                assert!(identity.anonymous);
                assert_eq!(identity.jid.domain(), "example.com");
                assert_eq!(identity.jid.node().map(str::len), Some(ANONYMOUS_NODE_LEN));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_external_requires_certificate() {
        let store = store();
        let ctx = SaslContext {
            domain: "example.com",
            credentials: &store,
            peer_certificates: &[],
            peer_domain: Some("remote.example.org"),
        };
        let mut exchange = SaslExchange::start("EXTERNAL").unwrap();
        assert_eq!(exchange.step(None, &ctx), SaslStep::Challenge(Vec::new()));
        assert_eq!(
            exchange.step(Some(b""), &ctx),
            SaslStep::Failure(SaslFailure::NotAuthorized)
        );
        assert_eq!(
            exchange.step(Some(b"other.example.org"), &ctx),
            SaslStep::Failure(SaslFailure::InvalidAuthzid)
        );
    }

    #[test]
    fn test_external_accepts_certificate_identity() {
        let store = store();
        let issued = crate::xmpp_server::tls::test_certs::TestCa::new().issue("remote.example.org");
        let certificates = [issued.der];
        let ctx = SaslContext {
            domain: "example.com",
            credentials: &store,
            peer_certificates: &certificates,
            peer_domain: Some("remote.example.org"),
        };

        for payload in [&b""[..], &b"remote.example.org"[..]] {
            let mut exchange = SaslExchange::start("EXTERNAL").unwrap();
            match exchange.step(Some(payload), &ctx) {
                SaslStep::Success { identity, additional } => {
                    assert_eq!(identity.jid, Jid::domain_jid("remote.example.org").unwrap());
                    assert!(!identity.anonymous);
                    assert_eq!(additional, None);
                }
                other => panic!("unexpected step {:?}", other),
            }
        }

        let ctx = SaslContext {
            peer_domain: Some("other.example.org"),
            ..ctx
        };
        let mut exchange = SaslExchange::start("EXTERNAL").unwrap();
        assert_eq!(
            exchange.step(Some(b""), &ctx),
            SaslStep::Failure(SaslFailure::NotAuthorized)
        );
    }

    #[test]
    fn test_saslname_decoding() {
        assert_eq!(decode_saslname("a=2Cb=3Dc").as_deref(), Ok("a,b=c"));
        assert_eq!(decode_saslname("bad=XX"), Err(SaslFailure::MalformedRequest));
    }

    /// Client side of SCRAM-SHA-256 for a given server-first message.
    pub(crate) fn scram_client_final(
        password: &str,
        client_first_bare: &str,
        server_first: &str,
    ) -> (String, [u8; 32]) {
        let attributes = scram_attributes(server_first);
        let nonce = scram_attribute(&attributes, 'r').unwrap();
        let salt = BASE64_STANDARD
            .decode(scram_attribute(&attributes, 's').unwrap())
            .unwrap();
        let iterations: u32 = scram_attribute(&attributes, 'i').unwrap().parse().unwrap();

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted);
        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
        let client_key = hmac_sha256(&salted, b"Client Key").unwrap();
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes()).unwrap();
        let proof: Vec<u8> = client_key.iter().zip(signature.iter()).map(|(a, b)| a ^ b).collect();
        let server_key = hmac_sha256(&salted, b"Server Key").unwrap();
        let server_signature = hmac_sha256(&server_key, auth_message.as_bytes()).unwrap();
        (
            format!("{},p={}", without_proof, BASE64_STANDARD.encode(proof)),
            server_signature,
        )
    }

    #[test]
    fn test_scram_sha256_exchange() {
        let store = store();
        let ctx = ctx(&store);
        let mut exchange = SaslExchange::start("SCRAM-SHA-256").unwrap();

        let client_first_bare = "n=juliet,r=fyko+d2lbbFgONRv9qkxdawL";
        let server_first = match exchange.step(Some(format!("n,,{}", client_first_bare).as_bytes()), &ctx) {
            SaslStep::Challenge(data) => String::from_utf8(data).unwrap(),
            other => panic!("unexpected step {:?}", other),
        };
        assert!(server_first.starts_with("r=fyko+d2lbbFgONRv9qkxdawL"));
        assert!(server_first.ends_with(",i=4096"));

        let (client_final, server_signature) =
            scram_client_final("r0m30", client_first_bare, &server_first);
        match exchange.step(Some(client_final.as_bytes()), &ctx) {
            SaslStep::Success { identity, additional } => {
                assert_eq!(identity.jid.to_string(), "juliet@example.com");
                let expected = format!("v={}", BASE64_STANDARD.encode(server_signature));
                assert_eq!(additional, Some(expected.into_bytes()));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_scram_wrong_password() {
        let store = store();
        let ctx = ctx(&store);
        let mut exchange = SaslExchange::start("SCRAM-SHA-256").unwrap();
        let client_first_bare = "n=juliet,r=abcdef";
        let server_first = match exchange.step(Some(format!("n,,{}", client_first_bare).as_bytes()), &ctx) {
            SaslStep::Challenge(data) => String::from_utf8(data).unwrap(),
            other => panic!("unexpected step {:?}", other),
        };
        let (client_final, _) = scram_client_final("wrong", client_first_bare, &server_first);
        assert_eq!(
            exchange.step(Some(client_final.as_bytes()), &ctx),
            SaslStep::Failure(SaslFailure::NotAuthorized)
        );
    }

    #[test]
    fn test_scram_rejects_channel_binding_and_unknown_user() {
        let store = store();
        let ctx = ctx(&store);
        let mut exchange = SaslExchange::start("SCRAM-SHA-256").unwrap();
        assert_eq!(
            exchange.step(Some(b"p=tls-unique,,n=juliet,r=abc"), &ctx),
            SaslStep::Failure(SaslFailure::MalformedRequest)
        );
        let mut exchange = SaslExchange::start("SCRAM-SHA-256").unwrap();
        assert_eq!(
            exchange.step(Some(b"n,,n=romeo,r=abc"), &ctx),
            SaslStep::Failure(SaslFailure::NotAuthorized)
        );
    }
}
