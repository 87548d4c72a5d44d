//! TLS acceptors for STARTTLS and direct TLS listeners.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ProtocolVersion, RootCertStore, ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use super::config::{ClientCertPolicy, TlsConfig};
use super::error::XmppError;

/// Initialize rustls crypto provider (must be called once at startup)
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// What the handshake negotiated.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub protocol: String,
    pub cipher: String,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TlsInfo {
    pub fn from_connection(conn: &rustls::ServerConnection) -> Self {
        Self {
            protocol: conn
                .protocol_version()
                .map(protocol_name)
                .unwrap_or_default(),
            cipher: conn
                .negotiated_cipher_suite()
                .map(|s| cipher_suite_name(&s))
                .unwrap_or_default(),
            peer_certificates: conn
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default(),
        }
    }
}

pub fn protocol_name(version: ProtocolVersion) -> String {
    match version {
        ProtocolVersion::TLSv1_2 => String::from("TLSv1.2"),
        ProtocolVersion::TLSv1_3 => String::from("TLSv1.3"),
        other => format!("{:?}", other),
    }
}

pub fn cipher_suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

/// Accept/reject name lists: an empty accept list admits everything.
fn name_allowed(name: &str, accepted: &[String], rejected: &[String]) -> bool {
    let admitted = accepted.is_empty() || accepted.iter().any(|a| a.eq_ignore_ascii_case(name));
    admitted && !rejected.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn protocol_versions(config: &TlsConfig) -> Result<Vec<&'static SupportedProtocolVersion>, XmppError> {
    let versions: Vec<&'static SupportedProtocolVersion> = rustls::ALL_VERSIONS
        .iter()
        .copied()
        .filter(|v| {
            name_allowed(
                &protocol_name(v.version),
                &config.protocols,
                &config.rejected_protocols,
            )
        })
        .collect();
    if versions.is_empty() {
        return Err(XmppError::tls("no TLS protocol version left after filtering"));
    }
    Ok(versions)
}

fn filtered_provider(config: &TlsConfig) -> Result<CryptoProvider, XmppError> {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites.retain(|suite| {
        name_allowed(
            &cipher_suite_name(suite),
            &config.cipher_suites,
            &config.rejected_cipher_suites,
        )
    });
    if provider.cipher_suites.is_empty() {
        return Err(XmppError::tls("no cipher suite left after filtering"));
    }
    Ok(provider)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, XmppError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| XmppError::tls(format!("failed to open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, XmppError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| XmppError::tls(format!("failed to read {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(XmppError::tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, XmppError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| XmppError::tls(format!("failed to read {}: {}", path.display(), e)))?
        .ok_or_else(|| XmppError::tls(format!("no private key in {}", path.display())))
}

fn load_roots(config: &TlsConfig) -> Result<RootCertStore, XmppError> {
    let mut roots = RootCertStore::empty();
    if let Some(ca) = &config.client_ca {
        for cert in load_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| XmppError::tls(format!("Failed to add CA cert: {}", e)))?;
        }
        return Ok(roots);
    }

    let native_certs = rustls_native_certs::load_native_certs();
    if !native_certs.errors.is_empty() {
        warn!(errors = native_certs.errors.len(), "Some system root certificates could not be loaded");
    }
    let (added, ignored) = roots.add_parsable_certificates(native_certs.certs);
    debug!(added, ignored, "Loaded system root certificates for peer verification");
    if roots.is_empty() {
        return Err(XmppError::tls(
            "No system root certificates found and no tls.client_ca configured",
        ));
    }
    Ok(roots)
}

/// Build the acceptor for a listener.
pub fn build_acceptor(config: &TlsConfig, client_certs: ClientCertPolicy) -> Result<TlsAcceptor, XmppError> {
    let (Some(cert_path), Some(key_path)) = (&config.cert_chain, &config.private_key) else {
        return Err(XmppError::tls("no certificate configured"));
    };
    let chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(filtered_provider(config)?);
    let versions = protocol_versions(config)?;
    let builder = ServerConfig::builder_with_provider(provider.clone()).with_protocol_versions(&versions)?;

    let server_config = match client_certs {
        ClientCertPolicy::Disabled => builder.with_no_client_auth().with_single_cert(chain, key)?,
        ClientCertPolicy::Wanted | ClientCertPolicy::Needed => {
            let roots = Arc::new(load_roots(config)?);
            let mut verifier = WebPkiClientVerifier::builder_with_provider(roots, provider);
            if client_certs == ClientCertPolicy::Wanted {
                verifier = verifier.allow_unauthenticated();
            }
            let verifier = verifier
                .build()
                .map_err(|e| XmppError::tls(format!("client certificate verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)?
        }
    };

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Run the server side of a TLS handshake.
pub async fn accept(
    acceptor: &TlsAcceptor,
    tcp: TcpStream,
    conn_id: u64,
) -> Result<(TlsStream<TcpStream>, TlsInfo), XmppError> {
    let stream = acceptor.accept(tcp).await.map_err(|e| {
        let detail = e.to_string();
        let classification = if detail.contains("ertificate") {
            "certificate_error"
        } else if detail.contains("reset") || detail.contains("eof") {
            "connection_reset"
        } else {
            "other"
        };
        error!(conn_id, error = %e, error_class = classification, "TLS handshake failed");
        XmppError::tls(format!("TLS handshake failed ({}): {}", classification, e))
    })?;
    let info = TlsInfo::from_connection(stream.get_ref().1);
    debug!(
        conn_id,
        protocol = %info.protocol,
        cipher = %info.cipher,
        peer_certs = info.peer_certificates.len(),
        "TLS established"
    );
    Ok((stream, info))
}

/// Whether `cert` is valid for the DNS identity `domain`.
pub fn certificate_matches(cert: &CertificateDer<'_>, domain: &str) -> bool {
    let Ok(name) = ServerName::try_from(domain.to_string()) else {
        return false;
    };
    match webpki::EndEntityCert::try_from(cert) {
        Ok(end_entity) => end_entity.verify_is_valid_for_subject_name(&name).is_ok(),
        Err(e) => {
            debug!(error = ?e, "Unparseable peer certificate");
            false
        }
    }
}
