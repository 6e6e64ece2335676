//! TLS server configuration for the HTTPS listener.
//!
//! Certificate selection happens per-connection, driven by the client's SNI: the on-the-fly
//! [`CertificateAuthority`] already implements [`ResolvesServerCert`] directly (see `ca.rs`).
//! [`SniCertResolver`] only adds one thing on top of that: if an externally-issued certificate
//! was configured for the admin hostname, that certificate takes precedence for that one name,
//! and every other SNI still falls through to the CA.

use std::io::Cursor;
use std::sync::{Arc, Once};

use anyhow::Context as _;
use camino::Utf8Path;
use rustls::ServerConfig;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::CertificateDer;
use tracing::warn;

use crate::ca::CertificateAuthority;

static CRYPTO_PROVIDER: Once = Once::new();

/// Installs the process-wide default crypto provider. Idempotent: safe to call from every
/// listener's setup path, only the first call takes effect.
pub fn install_default_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A certificate pinned to one hostname, bypassing the CA entirely. Used for the configured
/// admin hostname when an operator supplies their own publicly-trusted certificate rather than
/// relying on the intercepting CA (which browsers do not trust out of the box).
#[derive(Clone)]
pub struct AdminCertOverride {
    pub hostname: String,
    pub certified_key: Arc<CertifiedKey>,
}

/// Loads a PEM certificate chain and private key from disk. Keys may be PKCS#8 or SEC1 ECDSA;
/// `rustls_pemfile::private_key` auto-detects the encoding.
pub fn load_external_cert(cert_path: &Utf8Path, key_path: &Utf8Path) -> anyhow::Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(cert_path).with_context(|| format!("reading {cert_path}"))?;
    let key_pem = std::fs::read(key_path).with_context(|| format!("reading {key_path}"))?;

    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(&cert_pem))
        .collect::<Result<_, _>>()
        .context("invalid PEM certificate chain")?;

    if chain.is_empty() {
        anyhow::bail!("no certificates found in {cert_path}");
    }

    let key = rustls_pemfile::private_key(&mut Cursor::new(&key_pem))
        .context("invalid PEM private key")?
        .context("no private key found")?;

    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).context("unsupported private key type")?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Resolves TLS server certificates for the HTTPS listener: admin-hostname override first,
/// CA-minted leaf for everything else.
pub struct SniCertResolver {
    ca: CertificateAuthority,
    admin_override: Option<AdminCertOverride>,
}

impl SniCertResolver {
    pub fn new(ca: CertificateAuthority, admin_override: Option<AdminCertOverride>) -> Self {
        Self { ca, admin_override }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if let Some(admin) = &self.admin_override
            && let Some(requested) = client_hello.server_name()
            && requested.eq_ignore_ascii_case(&admin.hostname)
        {
            return Some(Arc::clone(&admin.certified_key));
        }

        match self.ca.resolve(client_hello) {
            Some(key) => Some(key),
            None => {
                warn!("TLS certificate resolution failed, handshake will abort");
                None
            }
        }
    }
}

/// Builds the single `ServerConfig` shared by every accepted HTTPS connection. The resolver
/// itself is where the per-SNI behavior lives; the config is otherwise static.
pub fn build_server_config(resolver: Arc<SniCertResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_override_matches_case_insensitively() {
        // Construction-only smoke test: resolving requires a live ClientHello, which rustls
        // does not expose a public constructor for outside of an actual handshake.
        let _ = SniCertResolver::new;
    }
}
