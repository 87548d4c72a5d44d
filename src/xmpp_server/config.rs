//! Server configuration, loaded from a TOML file.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! plaintext client listener on port 5222 for `localhost`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use super::framing::DEFAULT_MAX_STANZA_SIZE;
use super::jid::Jid;
use super::session::{ConnectionKind, DEFAULT_OUTBOUND_CAPACITY};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transport encryption policy of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    Disabled,
    Optional,
    Required,
}

/// Whether peers are asked for a certificate during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCertPolicy {
    Disabled,
    Wanted,
    Needed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionPolicy {
    Disabled,
    Optional,
}

/// Listener classes. WebSocket listeners carry client streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerClass {
    Client,
    Server,
    Component,
    Multiplexer,
    WebSocket,
}

impl ListenerClass {
    pub const ALL: [ListenerClass; 5] = [
        ListenerClass::Client,
        ListenerClass::Server,
        ListenerClass::Component,
        ListenerClass::Multiplexer,
        ListenerClass::WebSocket,
    ];

    pub fn connection_kind(&self) -> ConnectionKind {
        match self {
            Self::Client | Self::WebSocket => ConnectionKind::Client,
            Self::Server => ConnectionKind::Server,
            Self::Component => ConnectionKind::Component,
            Self::Multiplexer => ConnectionKind::Multiplexer,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Component => "component",
            Self::Multiplexer => "multiplexer",
            Self::WebSocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub enabled: bool,
    pub bind: IpAddr,
    pub port: u16,
    /// TLS handshake before the stream header (legacy "old SSL" ports).
    pub direct_tls: bool,
    pub tls_policy: TlsPolicy,
    pub client_cert_policy: ClientCertPolicy,
    pub compression_policy: CompressionPolicy,
    pub idle_timeout_secs: u64,
    pub keepalive_ping: bool,
    /// Hand stanzas for closed sessions to the fallback deliverer.
    pub backup_delivery: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            direct_tls: false,
            tls_policy: TlsPolicy::Optional,
            client_cert_policy: ClientCertPolicy::Disabled,
            compression_policy: CompressionPolicy::Disabled,
            idle_timeout_secs: 360,
            keepalive_ping: true,
            backup_delivery: false,
        }
    }
}

impl ListenerConfig {
    fn for_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// `None` disables the idle timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenersConfig {
    pub client: ListenerConfig,
    pub server: ListenerConfig,
    pub component: ListenerConfig,
    pub multiplexer: ListenerConfig,
    pub websocket: ListenerConfig,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            client: ListenerConfig {
                enabled: true,
                backup_delivery: true,
                ..ListenerConfig::for_port(5222)
            },
            server: ListenerConfig {
                keepalive_ping: false,
                ..ListenerConfig::for_port(5269)
            },
            component: ListenerConfig {
                tls_policy: TlsPolicy::Disabled,
                keepalive_ping: false,
                ..ListenerConfig::for_port(5275)
            },
            multiplexer: ListenerConfig {
                tls_policy: TlsPolicy::Disabled,
                keepalive_ping: false,
                ..ListenerConfig::for_port(5262)
            },
            websocket: ListenerConfig {
                tls_policy: TlsPolicy::Disabled,
                backup_delivery: true,
                ..ListenerConfig::for_port(5280)
            },
        }
    }
}

impl ListenersConfig {
    pub fn get(&self, class: ListenerClass) -> &ListenerConfig {
        match class {
            ListenerClass::Client => &self.client,
            ListenerClass::Server => &self.server,
            ListenerClass::Component => &self.component,
            ListenerClass::Multiplexer => &self.multiplexer,
            ListenerClass::WebSocket => &self.websocket,
        }
    }

    pub fn get_mut(&mut self, class: ListenerClass) -> &mut ListenerConfig {
        match class {
            ListenerClass::Client => &mut self.client,
            ListenerClass::Server => &mut self.server,
            ListenerClass::Component => &mut self.component,
            ListenerClass::Multiplexer => &mut self.multiplexer,
            ListenerClass::WebSocket => &mut self.websocket,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub domain: String,
    /// Cluster node identifier; generated when absent.
    pub node_id: Option<String>,
    pub worker_threads: usize,
    pub max_stanza_size: usize,
    /// Stanzas waiting for a slow peer before its session is closed.
    pub max_queued_stanzas: usize,
    pub max_auth_retries: u32,
    pub anonymous_login: bool,
    pub sasl_mechanisms: Vec<String>,
    pub federation_enabled: bool,
    /// Let anonymous users send stanzas to remote domains.
    pub anonymous_outbound: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            domain: String::from("localhost"),
            node_id: None,
            worker_threads: 4,
            max_stanza_size: DEFAULT_MAX_STANZA_SIZE,
            max_queued_stanzas: DEFAULT_OUTBOUND_CAPACITY,
            max_auth_retries: 3,
            anonymous_login: false,
            sasl_mechanisms: vec![
                "PLAIN".to_string(),
                "SCRAM-SHA-256".to_string(),
                "ANONYMOUS".to_string(),
                "EXTERNAL".to_string(),
            ],
            federation_enabled: true,
            anonymous_outbound: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert_chain: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    /// CA bundle for peer certificates; native roots when absent.
    pub client_ca: Option<PathBuf>,
    /// Accepted protocol names (`TLSv1.2`, `TLSv1.3`); empty means all.
    pub protocols: Vec<String>,
    pub rejected_protocols: Vec<String>,
    /// Accepted cipher suite names (e.g. `TLS13_AES_256_GCM_SHA384`); empty means all.
    pub cipher_suites: Vec<String>,
    pub rejected_cipher_suites: Vec<String>,
}

impl TlsConfig {
    pub fn has_certificate(&self) -> bool {
        self.cert_chain.is_some() && self.private_key.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ComponentsConfig {
    pub default_secret: Option<String>,
    /// Shared secrets keyed by component subdomain or multiplexer name.
    pub secrets: HashMap<String, String>,
}

impl ComponentsConfig {
    pub fn secret_for(&self, name: &str) -> Option<&str> {
        self.secrets
            .get(name)
            .or(self.default_secret.as_ref())
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub tls: TlsConfig,
    pub listeners: ListenersConfig,
    pub components: ComponentsConfig,
    /// Accounts for the bundled in-memory credential store.
    pub users: HashMap<String, String>,
}

impl ServerConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let domain = Jid::domain_jid(&self.server.domain)
            .map_err(|e| ConfigError::Invalid(format!("server.domain: {}", e)))?;
        if domain.to_string() != self.server.domain {
            return Err(ConfigError::Invalid(format!(
                "server.domain must be lowercase: {}",
                self.server.domain
            )));
        }
        if self.server.max_stanza_size < 1024 {
            return Err(ConfigError::Invalid(
                "server.max_stanza_size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.server.max_queued_stanzas == 0 {
            return Err(ConfigError::Invalid(
                "server.max_queued_stanzas must be positive".to_string(),
            ));
        }
        if self.server.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "server.worker_threads must be positive".to_string(),
            ));
        }

        let tls_sources = [&self.tls.cert_chain, &self.tls.private_key];
        if tls_sources.iter().filter(|p| p.is_some()).count() == 1 {
            return Err(ConfigError::Invalid(
                "tls.cert_chain and tls.private_key must be set together".to_string(),
            ));
        }

        for class in ListenerClass::ALL {
            let listener = self.listeners.get(class);
            if !listener.enabled {
                continue;
            }
            let needs_cert = listener.direct_tls || listener.tls_policy == TlsPolicy::Required;
            if needs_cert && !self.tls.has_certificate() {
                return Err(ConfigError::Invalid(format!(
                    "listeners.{} requires TLS but no certificate is configured",
                    class.name()
                )));
            }
        }
        Ok(())
    }
}
