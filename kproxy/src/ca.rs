//! On-the-fly Certificate Authority: root/intermediate key material, per-SNI leaf minting,
//! cached under a bounded LRU.

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;
use lru::LruCache;
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::CertificateDer;
use time::Duration;
use tokio::sync::Notify;
use tracing::warn;

use crate::clock::Clock;
use crate::error::CertMintError;

const ROOT_VALIDITY: Duration = Duration::days(365 * 10);
const INTERMEDIATE_VALIDITY: Duration = Duration::days(365 * 5);
const NOT_BEFORE_SKEW: Duration = Duration::hours(1);

/// A minted (or loaded) certificate chain plus signing key, ready to hand to rustls.
#[derive(Clone)]
pub struct CachedCert {
    pub certified_key: Arc<CertifiedKey>,
}

struct InFlight {
    notify: Arc<Notify>,
}

struct CaInner {
    intermediate: Issuer<'static, KeyPair>,
    /// `None` when the intermediate certificate chain is itself the root (externally provisioned).
    root_cert_der: Option<CertificateDer<'static>>,
    intermediate_cert_der: CertificateDer<'static>,
    cert_validity: Duration,
    cache: Mutex<LruCache<String, CachedCert>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// The Certificate Authority. Cheap to clone; all mutable state lives behind an `Arc`.
#[derive(Clone)]
pub struct CertificateAuthority {
    inner: Arc<CaInner>,
    clock: Arc<dyn Clock>,
}

impl CertificateAuthority {
    /// Loads root+intermediate from disk, generating them on first run. See
    /// [`KeyMaterial::load_or_generate`].
    pub fn load_or_generate(
        paths: &CaPaths,
        cache_size: usize,
        cert_validity: Duration,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let material = KeyMaterial::load_or_generate(paths, clock.as_ref())?;

        let cache_size =
            std::num::NonZeroUsize::new(cache_size).unwrap_or(std::num::NonZeroUsize::new(1).expect("1 != 0"));

        Ok(Self {
            inner: Arc::new(CaInner {
                intermediate: material.intermediate_issuer,
                root_cert_der: material.root_cert_der,
                intermediate_cert_der: material.intermediate_cert_der,
                cert_validity,
                cache: Mutex::new(LruCache::new(cache_size)),
                in_flight: Mutex::new(HashMap::new()),
            }),
            clock,
        })
    }

    /// Mints (or returns from cache) a leaf certificate for `hostname`.
    ///
    /// Cache policy: bounded LRU keyed by SNI hostname, single mutex, no TTL eviction (the
    /// consumer may enforce a TTL by re-minting after some elapsed time; the cache itself only
    /// evicts by capacity). Concurrent requests for the same cold hostname are coalesced via a
    /// singleflight wait so only one mint happens per thundering herd.
    pub async fn get_or_mint(&self, hostname: &str) -> Result<CachedCert, CertMintError> {
        if hostname.is_empty() {
            return Err(CertMintError::NoSni);
        }

        if let Some(cached) = self.inner.cache.lock().get(hostname) {
            return Ok(cached.clone());
        }

        loop {
            let notify = {
                let mut in_flight = self.inner.in_flight.lock();
                if let Some(existing) = in_flight.get(hostname) {
                    Some(Arc::clone(&existing.notify))
                } else {
                    in_flight.insert(
                        hostname.to_owned(),
                        InFlight {
                            notify: Arc::new(Notify::new()),
                        },
                    );
                    None
                }
            };

            let Some(notify) = notify else {
                // We are the one minting.
                let result = self.mint(hostname);

                if let Ok(cached) = &result {
                    self.inner.cache.lock().put(hostname.to_owned(), cached.clone());
                }

                let in_flight = self.inner.in_flight.lock().remove(hostname);
                if let Some(in_flight) = in_flight {
                    in_flight.notify.notify_waiters();
                }

                return result;
            };

            notify.notified().await;

            if let Some(cached) = self.inner.cache.lock().get(hostname) {
                return Ok(cached.clone());
            }
            // The minting attempt we waited on failed; loop and try to become the minter.
        }
    }

    fn mint(&self, hostname: &str) -> Result<CachedCert, CertMintError> {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(CertMintError::Mint)?;

        let now = self.clock.now();

        let mut params = CertificateParams::new(vec![hostname.to_owned()]).map_err(CertMintError::Mint)?;
        params.distinguished_name = {
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, hostname);
            dn
        };
        params.subject_alt_names = vec![SanType::DnsName(hostname.try_into().map_err(|_| CertMintError::Mint(rcgen::Error::InvalidDnsNameError))?)];
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(SerialNumber::from(rand::random::<u128>()));
        params.not_before = (now - NOT_BEFORE_SKEW).into();
        params.not_after = (now + self.inner.cert_validity).into();

        let leaf_cert = params
            .signed_by(&key_pair, &self.inner.intermediate)
            .map_err(CertMintError::Mint)?;

        let leaf_der = CertificateDer::from(leaf_cert.der().to_vec());
        let mut chain = vec![leaf_der];

        if self.inner.root_cert_der.as_ref() != Some(&self.inner.intermediate_cert_der) {
            chain.push(self.inner.intermediate_cert_der.clone());
        }

        let signing_key =
            rustls::crypto::ring::sign::any_ecdsa_type(&rustls_pki_types::PrivateKeyDer::Pkcs8(
                key_pair.serialize_der().into(),
            ))
            .map_err(|_| CertMintError::KeyParseError)?;

        let certified_key = Arc::new(CertifiedKey::new(chain, signing_key));

        Ok(CachedCert { certified_key })
    }

    pub fn cached_len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Synchronous cache-only lookup, for use from [`rustls::server::ResolvesServerCert`]
    /// which cannot await. Returns `None` on a cache miss; the caller is expected to have a
    /// background warmup path or to accept a handshake failure on a cold SNI (mirrored by
    /// `SniCertResolver` in `tls.rs`, which instead blocks the accept loop on [`Self::get_or_mint`]
    /// before TLS negotiation begins, so this fast path only serves the common warm case).
    pub fn try_get_cached(&self, hostname: &str) -> Option<CachedCert> {
        self.inner.cache.lock().get(hostname).cloned()
    }

    /// The intermediate (and, if self-signed, root) certificate chain, DER-encoded, in the
    /// order rustls expects: leaf-first is not applicable here since this returns only the CA
    /// chain, used to let clients chain-build when they already trust the root out of band.
    pub fn root_cert_der(&self) -> Option<CertificateDer<'static>> {
        self.inner.root_cert_der.clone()
    }

    /// Cache-or-mint, called synchronously from the rustls handshake path. Unlike
    /// [`Self::get_or_mint`] this does not coalesce concurrent cold requests for the same
    /// hostname behind a singleflight wait: `resolve` runs inline in the TLS handshake and
    /// cannot await, so a thundering herd on a brand-new hostname mints a handful of redundant
    /// leaves until the cache settles, rather than blocking any connection.
    fn resolve_leaf(&self, hostname: &str) -> Result<CachedCert, CertMintError> {
        if let Some(cached) = self.inner.cache.lock().get(hostname) {
            return Ok(cached.clone());
        }

        let cached = self.mint(hostname)?;
        self.inner.cache.lock().put(hostname.to_owned(), cached.clone());
        Ok(cached)
    }
}

impl ResolvesServerCert for CertificateAuthority {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(hostname) = client_hello.server_name() else {
            warn!("TLS ClientHello carried no SNI; cannot select a certificate");
            return None;
        };

        match self.resolve_leaf(hostname) {
            Ok(cached) => Some(cached.certified_key),
            Err(error) => {
                warn!(hostname, %error, "failed to mint TLS certificate for SNI");
                None
            }
        }
    }
}

pub struct CaPaths<'a> {
    pub root_cert: &'a Utf8Path,
    pub root_key: &'a Utf8Path,
    pub intermediate_cert: &'a Utf8Path,
    pub intermediate_key: &'a Utf8Path,
}

struct KeyMaterial {
    intermediate_issuer: Issuer<'static, KeyPair>,
    root_cert_der: Option<CertificateDer<'static>>,
    intermediate_cert_der: CertificateDer<'static>,
}

impl KeyMaterial {
    /// At startup, load root+intermediate from disk. If the root is missing but the
    /// intermediate is present, operate with the intermediate alone (externally-provisioned
    /// chain). If both are missing, self-generate a root (10y ECDSA P-384) and an intermediate
    /// (5y) chained under it, persisting both with `0600`/`0700` permissions.
    fn load_or_generate(paths: &CaPaths<'_>, clock: &dyn Clock) -> anyhow::Result<Self> {
        let root_exists = paths.root_cert.exists() && paths.root_key.exists();
        let intermediate_exists = paths.intermediate_cert.exists() && paths.intermediate_key.exists();

        if intermediate_exists {
            let intermediate_cert_pem = std::fs::read_to_string(paths.intermediate_cert)?;
            let intermediate_key_pem = std::fs::read_to_string(paths.intermediate_key)?;
            let intermediate_key =
                KeyPair::from_pem(&intermediate_key_pem).map_err(|_| anyhow::anyhow!("bad intermediate key"))?;
            let intermediate_cert_der = pem_to_der(&intermediate_cert_pem)?;

            let root_cert_der = if root_exists {
                Some(pem_to_der(&std::fs::read_to_string(paths.root_cert)?)?)
            } else {
                None
            };

            let issuer = Issuer::from_ca_cert_pem(&intermediate_cert_pem, intermediate_key)
                .map_err(|_| anyhow::anyhow!("bad intermediate certificate"))?;

            return Ok(Self {
                intermediate_issuer: issuer,
                root_cert_der,
                intermediate_cert_der,
            });
        }

        generate_and_persist(paths, clock)
    }
}

fn pem_to_der(pem: &str) -> anyhow::Result<CertificateDer<'static>> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid PEM certificate: {e}"))?;
    Ok(CertificateDer::from(doc.contents))
}

fn generate_and_persist(paths: &CaPaths<'_>, clock: &dyn Clock) -> anyhow::Result<KeyMaterial> {
    let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
    let mut root_params = CertificateParams::new(vec![])?;
    root_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "KProxy Root CA");
        dn
    };
    root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    root_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = clock.now();
    root_params.not_before = (now - NOT_BEFORE_SKEW).into();
    root_params.not_after = (now + ROOT_VALIDITY).into();
    let root_cert = root_params.self_signed(&root_key)?;

    let intermediate_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)?;
    let mut intermediate_params = CertificateParams::new(vec![])?;
    intermediate_params.distinguished_name = {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "KProxy Intermediate CA");
        dn
    };
    intermediate_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    intermediate_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    intermediate_params.not_before = (now - NOT_BEFORE_SKEW).into();
    intermediate_params.not_after = (now + INTERMEDIATE_VALIDITY).into();

    let root_issuer = Issuer::new(root_params, root_key);
    let intermediate_cert = intermediate_params.signed_by(&intermediate_key, &root_issuer)?;

    write_private(paths.root_key, &root_key.serialize_pem())?;
    std::fs::write(paths.root_cert, root_cert.pem())?;
    write_private(paths.intermediate_key, &intermediate_key.serialize_pem())?;
    std::fs::write(paths.intermediate_cert, intermediate_cert.pem())?;

    let intermediate_issuer = Issuer::from_params(intermediate_params, intermediate_key);

    Ok(KeyMaterial {
        intermediate_issuer,
        root_cert_der: Some(CertificateDer::from(root_cert.der().to_vec())),
        intermediate_cert_der: CertificateDer::from(intermediate_cert.der().to_vec()),
    })
}

#[cfg(unix)]
fn write_private(path: &Utf8Path, contents: &str) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }

    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Utf8Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}
