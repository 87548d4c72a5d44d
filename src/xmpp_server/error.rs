//! Error taxonomy for the server core.
//!
//! Three families of failures are kept apart:
//! - stream errors (`<stream:error>`), terminal for the session that raises them
//! - stanza errors, replied to the sender without touching its connection
//! - SASL failures, reported inside `<failure/>` and retried up to a limit

use std::fmt;

use thiserror::Error;

use super::stanza::{escape, ns};

/// Conditions carried by a `<stream:error>` element (RFC 6120 §4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    BadFormat,
    BadNamespacePrefix,
    Conflict,
    ConnectionTimeout,
    HostUnknown,
    InternalServerError,
    InvalidFrom,
    InvalidNamespace,
    InvalidXml,
    NotAuthorized,
    NotWellFormed,
    PolicyViolation,
    SystemShutdown,
    UnsupportedStanzaType,
    UnsupportedVersion,
}

impl StreamErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::BadNamespacePrefix => "bad-namespace-prefix",
            Self::Conflict => "conflict",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidFrom => "invalid-from",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::SystemShutdown => "system-shutdown",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream-level error: a condition plus optional human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Inner content of the `<stream:error>` element (condition and text).
    pub fn condition_xml(&self) -> String {
        let mut out = format!(
            "<{} xmlns='{}'/>",
            self.condition.as_str(),
            ns::STREAM_ERRORS
        );
        if let Some(text) = &self.text {
            out.push_str(&format!(
                "<text xmlns='{}' xml:lang='en'>{}</text>",
                ns::STREAM_ERRORS,
                escape(text)
            ));
        }
        out
    }

    /// Serialized `<stream:error>` as sent on a TCP stream.
    pub fn to_xml(&self) -> String {
        format!("<stream:error>{}</stream:error>", self.condition_xml())
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({})", self.condition, text),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<StreamErrorCondition> for StreamError {
    fn from(condition: StreamErrorCondition) -> Self {
        Self::new(condition)
    }
}

/// Conditions used for per-stanza error replies (RFC 6120 §8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    BadRequest,
    Conflict,
    InternalServerError,
    ItemNotFound,
    JidMalformed,
    NotAllowed,
    PolicyViolation,
    RecipientUnavailable,
    RemoteServerNotFound,
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAllowed => "not-allowed",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// Value of the `type` attribute on the `<error/>` element.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest | Self::JidMalformed => "modify",
            Self::InternalServerError | Self::RecipientUnavailable => "wait",
            Self::PolicyViolation => "modify",
            _ => "cancel",
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SASL failure conditions (RFC 6120 §6.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslFailure {
    Aborted,
    AccountDisabled,
    IncorrectEncoding,
    InvalidAuthzid,
    InvalidMechanism,
    MalformedRequest,
    NotAuthorized,
    TemporaryAuthFailure,
}

impl SaslFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::AccountDisabled => "account-disabled",
            Self::IncorrectEncoding => "incorrect-encoding",
            Self::InvalidAuthzid => "invalid-authzid",
            Self::InvalidMechanism => "invalid-mechanism",
            Self::MalformedRequest => "malformed-request",
            Self::NotAuthorized => "not-authorized",
            Self::TemporaryAuthFailure => "temporary-auth-failure",
        }
    }

    pub fn to_xml(&self) -> String {
        format!("<failure xmlns='{}'><{}/></failure>", ns::SASL, self.as_str())
    }
}

impl fmt::Display for SaslFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the incremental stanza framer. All of them are fatal to the
/// connection that fed the offending bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("not well-formed: {0}")]
    NotWellFormed(String),
    #[error("stanza exceeds maximum buffered size of {limit} bytes")]
    SizeExceeded { limit: usize },
    #[error("framer aborted by an earlier error")]
    Aborted,
}

impl FramingError {
    /// Stream error sent to the peer before the connection is closed.
    pub fn stream_error(&self) -> StreamError {
        match self {
            Self::SizeExceeded { limit } => StreamError::new(StreamErrorCondition::PolicyViolation)
                .with_text(format!("Stanza larger than {} bytes", limit)),
            Self::NotWellFormed(_) | Self::Aborted => {
                StreamError::new(StreamErrorCondition::NotWellFormed)
            }
        }
    }
}

/// Top-level error type of the server core.
#[derive(Debug, Error)]
pub enum XmppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("invalid address: {0}")]
    Jid(#[from] super::jid::JidError),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl XmppError {
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    pub fn xml(msg: impl Into<String>) -> Self {
        Self::Xml(msg.into())
    }

    pub fn routing(msg: impl Into<String>) -> Self {
        Self::Routing(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<quick_xml::Error> for XmppError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e.to_string())
    }
}

impl From<rustls::Error> for XmppError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}
