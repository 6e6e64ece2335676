//! Configuration loading and hot-reload.
//!
//! Mirrors the split used throughout this codebase's configuration layer: [`dto::ConfFile`] is
//! the raw, round-trippable YAML document (every field defaulted at the serde layer so a near-
//! empty file is a valid one); [`Conf::from_conf_file`] turns it into the validated, immutable
//! runtime configuration, resolving paths and loading key material along the way; [`ConfHandle`]
//! holds the current `Conf` behind a lock and notifies waiters when `SIGHUP` swaps in a new one.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::warn;

use crate::ca::{CaPaths, CertificateAuthority};
use crate::dns::DnsConfig;
use crate::error::ConfigError;
use crate::policy::evaluator::PolicySource;
use crate::proxy::response_mod::ResponseModConfig;
use crate::tls::{AdminCertOverride, load_external_cert};

/// Where KProxy keeps generated key material and default file paths when the config doesn't
/// override them. Resolved once at startup; never re-read.
fn default_data_dir() -> Utf8PathBuf {
    if let Ok(dir) = std::env::var("KPROXY_DATA_DIR") {
        return Utf8PathBuf::from(dir);
    }

    if cfg!(unix) {
        Utf8PathBuf::from("/var/lib/kproxy")
    } else {
        Utf8PathBuf::from("./kproxy-data")
    }
}

/// Raw, `serde`-derived configuration document. Every field has a default so a file that
/// specifies only the sections it cares about still parses.
pub mod dto {
    use super::*;

    fn default_true() -> bool {
        true
    }

    fn default_dns_port() -> u16 {
        53
    }

    fn default_http_port() -> u16 {
        8080
    }

    fn default_https_port() -> u16 {
        8443
    }

    fn default_admin_domain() -> String {
        "admin.kproxy.local".to_owned()
    }

    fn default_bind_address() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn default_proxy_ip() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 100)
    }

    /// Listener ports and the address devices are steered to via DNS intercept.
    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct ServerSection {
        /// Port the embedded DNS server listens on. Default `53`.
        pub dns_port: u16,
        /// Serve DNS over UDP. Default `true`.
        pub dns_enable_udp: bool,
        /// Serve DNS over TCP, for truncated/large responses. Default `true`.
        pub dns_enable_tcp: bool,
        /// Plain HTTP proxy listener port. Default `8080`.
        pub http_port: u16,
        /// TLS-terminating HTTPS proxy listener port. Default `8443`. Must differ from
        /// `http_port`.
        pub https_port: u16,
        /// Hostname that, once DNS-intercepted, serves the admin surface (out of scope here;
        /// named so the proxy can route to it and mint/pin a certificate for it).
        pub admin_domain: String,
        /// Port for the Prometheus metrics sink. `None` disables it. Out of scope: stored only
        /// so the external metrics collaborator has a port to bind to.
        pub metrics_port: Option<u16>,
        /// Interface address every listener binds to. Default unspecified (all interfaces).
        pub bind_address: IpAddr,
        /// The address handed back to clients in intercepted A records; must be an address this
        /// host actually answers the proxy ports on.
        pub proxy_ip: Ipv4Addr,
    }

    impl Default for ServerSection {
        fn default() -> Self {
            Self {
                dns_port: default_dns_port(),
                dns_enable_udp: default_true(),
                dns_enable_tcp: default_true(),
                http_port: default_http_port(),
                https_port: default_https_port(),
                admin_domain: default_admin_domain(),
                metrics_port: None,
                bind_address: default_bind_address(),
                proxy_ip: default_proxy_ip(),
            }
        }
    }

    fn default_upstream_timeout_ms() -> u64 {
        2_000
    }

    fn default_intercept_ttl() -> u32 {
        60
    }

    fn default_block_ttl() -> u32 {
        300
    }

    /// DNS decision TTLs and upstream resolution for the BYPASS path.
    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct DnsSection {
        /// Upstream recursive resolvers consulted for bypassed domains, tried in order.
        /// Default: Cloudflare and Google public resolvers.
        pub upstream_servers: Vec<IpAddr>,
        /// TTL, in seconds, on an INTERCEPT answer. Default `60`: short enough that a later
        /// directory change (device re-profiled, rule edited) takes effect quickly.
        pub intercept_ttl: u32,
        /// Caps every record TTL returned on the BYPASS path, in seconds. `0` disables capping.
        pub bypass_ttl_cap: u32,
        /// TTL, in seconds, on a BLOCK (sinkhole) answer. Default `300`.
        pub block_ttl: u32,
        /// Per-upstream-server query timeout, in milliseconds. Default `2000`.
        pub upstream_timeout_ms: u64,
        /// Domain patterns that bypass policy evaluation entirely, both at the DNS and proxy
        /// layers (e.g. captive-portal probes, OS update hosts). Merged with any
        /// `bypass_patterns` declared in the directory documents.
        pub global_bypass: Vec<String>,
    }

    impl Default for DnsSection {
        fn default() -> Self {
            Self {
                upstream_servers: vec![
                    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
                    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                ],
                intercept_ttl: default_intercept_ttl(),
                bypass_ttl_cap: 0,
                block_ttl: default_block_ttl(),
                upstream_timeout_ms: default_upstream_timeout_ms(),
                global_bypass: Vec::new(),
            }
        }
    }

    /// DHCP lease serving. Out of scope collaborator (§1); these keys are accepted and stored
    /// but no DHCP server runs in this repository.
    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub struct DhcpSection {
        pub enabled: bool,
        pub interface: Option<String>,
        pub range_start: Option<IpAddr>,
        pub range_end: Option<IpAddr>,
        pub lease_seconds: Option<u64>,
    }

    fn default_cert_cache_size() -> usize {
        4096
    }

    fn default_cert_cache_ttl_secs() -> u64 {
        7 * 24 * 3600
    }

    fn default_cert_validity_secs() -> i64 {
        365 * 24 * 3600
    }

    /// Certificate authority key material and leaf-minting cache parameters.
    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct TlsSection {
        /// Root CA certificate PEM path. Default `<data_dir>/ca/root.pem`. Generated on first
        /// run if absent.
        pub ca_cert: Option<Utf8PathBuf>,
        pub ca_key: Option<Utf8PathBuf>,
        /// Intermediate CA certificate PEM path. Default `<data_dir>/ca/intermediate.pem`.
        pub intermediate_cert: Option<Utf8PathBuf>,
        pub intermediate_key: Option<Utf8PathBuf>,
        /// Maximum number of minted leaf certificates kept in the LRU cache. Default `4096`.
        pub cert_cache_size: usize,
        /// Soft re-mint interval for a cached leaf, in seconds. Default 7 days. The cache itself
        /// only evicts by capacity (see `ca.rs`); this value is advisory for a future background
        /// warmup/refresh pass and is not yet enforced.
        pub cert_cache_ttl_secs: u64,
        /// Validity period stamped on every minted leaf, in seconds. Default 365 days.
        pub cert_validity_secs: i64,
        /// Out of scope: whether an external ACME client should be provisioning a publicly
        /// trusted certificate for `admin_domain` in front of this gateway. Stored only.
        pub use_lets_encrypt: bool,
        /// Externally-issued certificate pinned to `admin_domain`, bypassing the CA. Requires
        /// both fields set, or neither.
        pub admin_cert: Option<Utf8PathBuf>,
        pub admin_key: Option<Utf8PathBuf>,
    }

    impl Default for TlsSection {
        fn default() -> Self {
            Self {
                ca_cert: None,
                ca_key: None,
                intermediate_cert: None,
                intermediate_key: None,
                cert_cache_size: default_cert_cache_size(),
                cert_cache_ttl_secs: default_cert_cache_ttl_secs(),
                cert_validity_secs: default_cert_validity_secs(),
                use_lets_encrypt: false,
                admin_cert: None,
                admin_key: None,
            }
        }
    }

    fn default_storage_type() -> String {
        "memory".to_owned()
    }

    /// Persistence backend selection for usage counters/sessions (§4.3). Only `memory` ships;
    /// `redis` is a recognized key reserved for a drop-in `UsageStore` implementation that is
    /// out of scope here.
    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct StorageSection {
        #[serde(rename = "type")]
        pub kind: String,
        pub redis: RedisSection,
    }

    impl Default for StorageSection {
        fn default() -> Self {
            Self {
                kind: default_storage_type(),
                redis: RedisSection::default(),
            }
        }
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub struct RedisSection {
        pub url: Option<String>,
    }

    fn default_log_level() -> String {
        "info".to_owned()
    }

    fn default_log_format() -> String {
        "compact".to_owned()
    }

    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct LoggingSection {
        /// `tracing_subscriber` `EnvFilter` directive string. Default `"info"`.
        pub level: String,
        /// Either `"compact"` or `"json"`. Default `"compact"`.
        pub format: String,
    }

    impl Default for LoggingSection {
        fn default() -> Self {
            Self {
                level: default_log_level(),
                format: default_log_format(),
            }
        }
    }

    fn default_action() -> String {
        "block".to_owned()
    }

    fn default_arp_cache_ttl_secs() -> u64 {
        30
    }

    fn default_opa_policy_source() -> String {
        "directory".to_owned()
    }

    fn default_opa_http_timeout_secs() -> u64 {
        5
    }

    fn default_opa_http_retries() -> u32 {
        3
    }

    /// Device directory location and the external policy evaluator wiring (§4.2, §6).
    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct PolicySection {
        /// Action applied when a device is known but matches no rule and its profile has no
        /// `default_action`. Recorded for completeness; per-profile `default_action` (set in the
        /// directory documents) is what actually governs evaluation today.
        pub default_action: String,
        /// Legacy alias for `default_action == "allow"`. If set, overrides `default_action`.
        pub default_allow: Option<bool>,
        /// Resolve `client_mac` via the kernel ARP table for device matching. Default `true`.
        pub use_mac_address: bool,
        /// TTL on cached ARP entries, in seconds. Default `30`.
        pub arp_cache_ttl_secs: u64,
        /// `"directory"` to compile policy from YAML files in `opa_policy_dir`, or `"http"` to
        /// fetch from `opa_policy_urls`.
        pub opa_policy_source: String,
        /// Directory scanned for `*.yaml` policy documents when `opa_policy_source = "directory"`.
        /// Default `<data_dir>/policy`.
        pub opa_policy_dir: Option<Utf8PathBuf>,
        /// URLs fetched for policy documents when `opa_policy_source = "http"`.
        pub opa_policy_urls: Vec<String>,
        /// Per-request timeout for HTTP-sourced policy fetches, in seconds. Default `5`.
        pub opa_http_timeout_secs: u64,
        /// Bounded retry count for HTTP-sourced policy fetches. Default `3`.
        pub opa_http_retries: u32,
    }

    impl Default for PolicySection {
        fn default() -> Self {
            Self {
                default_action: default_action(),
                default_allow: None,
                use_mac_address: default_true(),
                arp_cache_ttl_secs: default_arp_cache_ttl_secs(),
                opa_policy_source: default_opa_policy_source(),
                opa_policy_dir: None,
                opa_policy_urls: Vec::new(),
                opa_http_timeout_secs: default_opa_http_timeout_secs(),
                opa_http_retries: default_opa_http_retries(),
            }
        }
    }

    fn default_inactivity_timeout_secs() -> u64 {
        300
    }

    fn default_min_session_duration_secs() -> u64 {
        30
    }

    fn default_daily_reset_time() -> String {
        "00:00".to_owned()
    }

    #[derive(Debug, Deserialize)]
    #[serde(default)]
    pub struct UsageTrackingSection {
        /// Gap, in seconds, past which a device's activity in a category is considered a new
        /// session rather than a continuation. Default `300` (5 minutes).
        pub inactivity_timeout_secs: u64,
        /// Minimum session length, in seconds, before it counts toward the daily total.
        /// Default `30`.
        pub min_session_duration_secs: u64,
        /// Local time-of-day, `"HH:MM"`, at which daily counters reset. Default `"00:00"`.
        pub daily_reset_time: String,
    }

    impl Default for UsageTrackingSection {
        fn default() -> Self {
            Self {
                inactivity_timeout_secs: default_inactivity_timeout_secs(),
                min_session_duration_secs: default_min_session_duration_secs(),
                daily_reset_time: default_daily_reset_time(),
            }
        }
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub struct ResponseModificationSection {
        pub enabled: bool,
        pub disabled_hosts: Vec<String>,
        pub allowed_content_types: Vec<String>,
    }

    /// The full raw document. Unrecognized top-level keys are captured in `rest` and warned
    /// about rather than rejected, so an operator's typo doesn't refuse to start the gateway.
    #[derive(Debug, Deserialize, Default)]
    #[serde(default)]
    pub struct ConfFile {
        pub server: ServerSection,
        pub dns: DnsSection,
        pub dhcp: DhcpSection,
        pub tls: TlsSection,
        pub storage: StorageSection,
        pub logging: LoggingSection,
        pub policy: PolicySection,
        pub usage_tracking: UsageTrackingSection,
        pub response_modification: ResponseModificationSection,
        #[serde(flatten)]
        pub rest: serde_yaml::Mapping,
    }
}

/// The storage backend this instance is validated to run against. Only `InMemory` ships; a
/// config naming anything else fails to load (§6 `storage.type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    InMemory,
}

/// Resolved policy-evaluator wiring: where to load the external rule documents from.
pub struct PolicyConfig {
    pub source: PolicySource,
    pub default_allow: bool,
}

/// Resolved, validated runtime configuration. Built once from a [`dto::ConfFile`] by
/// [`Conf::from_conf_file`]; every field here is ready to hand to the task that consumes it,
/// with no further defaulting or path resolution needed.
pub struct Conf {
    pub data_dir: Utf8PathBuf,
    pub bind_address: IpAddr,
    pub dns_bind_address: SocketAddr,
    pub http_bind_address: SocketAddr,
    pub https_bind_address: SocketAddr,
    pub dns_enable_udp: bool,
    pub dns_enable_tcp: bool,
    pub admin_domain: String,
    pub metrics_port: Option<u16>,
    pub dns: DnsConfig,
    pub upstream_servers: Vec<IpAddr>,
    pub global_bypass: Vec<String>,
    pub ca: CertificateAuthority,
    pub admin_override: Option<AdminCertOverride>,
    pub cert_validity_secs: i64,
    pub storage: StorageKind,
    pub log_dir: Utf8PathBuf,
    pub log_level: String,
    pub log_format: String,
    pub policy: PolicyConfig,
    pub use_mac_address: bool,
    pub arp_cache_ttl: Duration,
    pub inactivity_timeout: Duration,
    pub min_session_duration: Duration,
    pub daily_reset_minute: u32,
    pub response_mod: ResponseModConfig,
}

fn parse_daily_reset_time(raw: &str) -> Result<u32, ConfigError> {
    let (hour, minute) = raw
        .split_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("usage_tracking.daily_reset_time must be HH:MM, got {raw:?}")))?;

    let hour: u32 = hour
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid hour in daily_reset_time {raw:?}")))?;
    let minute: u32 = minute
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid minute in daily_reset_time {raw:?}")))?;

    if hour >= 24 || minute >= 60 {
        return Err(ConfigError::Invalid(format!("daily_reset_time out of range: {raw:?}")));
    }

    Ok(hour * 60 + minute)
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile, data_dir: &Utf8Path) -> Result<Self, ConfigError> {
        for key in conf_file.rest.keys() {
            warn!(?key, "unrecognized configuration key, ignoring");
        }

        if conf_file.server.http_port == conf_file.server.https_port {
            return Err(ConfigError::Invalid("server.http_port and server.https_port must differ".to_owned()));
        }

        let storage = match conf_file.storage.kind.as_str() {
            "memory" => StorageKind::InMemory,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported storage.type {other:?}: only \"memory\" ships with this build"
                )));
            }
        };

        let ca_dir = data_dir.join("ca");
        let root_cert = conf_file.tls.ca_cert.clone().unwrap_or_else(|| ca_dir.join("root.pem"));
        let root_key = conf_file.tls.ca_key.clone().unwrap_or_else(|| ca_dir.join("root.key.pem"));
        let intermediate_cert = conf_file.tls.intermediate_cert.clone().unwrap_or_else(|| ca_dir.join("intermediate.pem"));
        let intermediate_key = conf_file.tls.intermediate_key.clone().unwrap_or_else(|| ca_dir.join("intermediate.key.pem"));
        let ca_paths = CaPaths {
            root_cert: &root_cert,
            root_key: &root_key,
            intermediate_cert: &intermediate_cert,
            intermediate_key: &intermediate_key,
        };

        let cert_validity = time::Duration::seconds(conf_file.tls.cert_validity_secs);
        let clock: Arc<dyn crate::clock::Clock> = Arc::new(crate::clock::SystemClock);

        let ca = CertificateAuthority::load_or_generate(&ca_paths, conf_file.tls.cert_cache_size, cert_validity, clock)
            .map_err(|source| ConfigError::Invalid(format!("failed to load or generate certificate authority: {source:#}")))?;

        let admin_override = match (&conf_file.tls.admin_cert, &conf_file.tls.admin_key) {
            (Some(cert), Some(key)) => {
                let certified_key = load_external_cert(cert, key)
                    .map_err(|source| ConfigError::Invalid(format!("failed to load admin certificate: {source:#}")))?;
                Some(AdminCertOverride {
                    hostname: conf_file.server.admin_domain.clone(),
                    certified_key,
                })
            }
            (None, None) => None,
            _ => {
                return Err(ConfigError::Invalid(
                    "tls.admin_cert and tls.admin_key must both be set, or neither".to_owned(),
                ));
            }
        };

        let policy_dir = conf_file.policy.opa_policy_dir.clone().unwrap_or_else(|| data_dir.join("policy"));

        let source = match conf_file.policy.opa_policy_source.as_str() {
            "http" => {
                if conf_file.policy.opa_policy_urls.is_empty() {
                    return Err(ConfigError::Invalid(
                        "policy.opa_policy_source is \"http\" but policy.opa_policy_urls is empty".to_owned(),
                    ));
                }
                PolicySource::HttpUrls {
                    urls: conf_file.policy.opa_policy_urls.clone(),
                    timeout: Duration::from_secs(conf_file.policy.opa_http_timeout_secs),
                    retries: conf_file.policy.opa_http_retries,
                }
            }
            "directory" => PolicySource::Directory(policy_dir),
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unrecognized policy.opa_policy_source {other:?}: expected \"directory\" or \"http\""
                )));
            }
        };

        let default_allow = conf_file
            .policy
            .default_allow
            .unwrap_or_else(|| conf_file.policy.default_action.eq_ignore_ascii_case("allow"));

        let daily_reset_minute = parse_daily_reset_time(&conf_file.usage_tracking.daily_reset_time)?;

        let bind_ip = conf_file.server.bind_address;

        Ok(Self {
            data_dir: data_dir.to_owned(),
            bind_address: bind_ip,
            dns_bind_address: SocketAddr::new(bind_ip, conf_file.server.dns_port),
            http_bind_address: SocketAddr::new(bind_ip, conf_file.server.http_port),
            https_bind_address: SocketAddr::new(bind_ip, conf_file.server.https_port),
            dns_enable_udp: conf_file.dns.dns_enable_udp,
            dns_enable_tcp: conf_file.dns.dns_enable_tcp,
            admin_domain: conf_file.server.admin_domain.clone(),
            metrics_port: conf_file.server.metrics_port,
            dns: DnsConfig {
                proxy_ip: conf_file.server.proxy_ip,
                intercept_ttl: conf_file.dns.intercept_ttl,
                block_ttl: conf_file.dns.block_ttl,
                bypass_ttl_cap: (conf_file.dns.bypass_ttl_cap != 0).then_some(conf_file.dns.bypass_ttl_cap),
                upstream_timeout: Duration::from_millis(conf_file.dns.upstream_timeout_ms),
            },
            upstream_servers: conf_file.dns.upstream_servers.clone(),
            global_bypass: conf_file.dns.global_bypass.clone(),
            ca,
            admin_override,
            cert_validity_secs: conf_file.tls.cert_validity_secs,
            storage,
            log_dir: data_dir.join("logs"),
            log_level: conf_file.logging.level.clone(),
            log_format: conf_file.logging.format.clone(),
            policy: PolicyConfig { source, default_allow },
            use_mac_address: conf_file.policy.use_mac_address,
            arp_cache_ttl: Duration::from_secs(conf_file.policy.arp_cache_ttl_secs),
            inactivity_timeout: Duration::from_secs(conf_file.usage_tracking.inactivity_timeout_secs),
            min_session_duration: Duration::from_secs(conf_file.usage_tracking.min_session_duration_secs),
            daily_reset_minute,
            response_mod: ResponseModConfig {
                enabled: conf_file.response_modification.enabled,
                disabled_hosts: conf_file.response_modification.disabled_hosts.iter().cloned().collect::<HashSet<_>>(),
                allowed_content_types: conf_file.response_modification.allowed_content_types.clone(),
            },
        })
    }
}

/// Reads and parses the YAML configuration file at `path`.
pub fn read_conf_file(path: &Utf8Path) -> Result<dto::ConfFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    Ok(serde_yaml::from_str(&contents)?)
}

struct ConfHandleInner {
    conf: RwLock<Arc<Conf>>,
    conf_file: RwLock<Arc<dto::ConfFile>>,
    data_dir: Utf8PathBuf,
    config_path: Utf8PathBuf,
    reload_notify: Notify,
}

/// Shared, hot-swappable configuration handle. `SIGHUP` re-reads and re-validates the file on
/// disk and swaps both the raw document and the derived [`Conf`] in one step; readers always
/// see either the old or the new configuration, never a partially-updated one.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

impl ConfHandle {
    /// Loads `config_path`, validates it, and resolves `data_dir` (falling back to the
    /// platform default if the config does not specify one).
    pub fn load(config_path: &Utf8Path, data_dir: Option<Utf8PathBuf>) -> Result<Self, ConfigError> {
        let conf_file = read_conf_file(config_path)?;
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let conf = Conf::from_conf_file(&conf_file, &data_dir)?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: RwLock::new(Arc::new(conf)),
                conf_file: RwLock::new(Arc::new(conf_file)),
                data_dir,
                config_path: config_path.to_owned(),
                reload_notify: Notify::new(),
            }),
        })
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner.conf.read())
    }

    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        Arc::clone(&self.inner.conf_file.read())
    }

    /// Resolves once the next successful reload completes.
    pub async fn change_notified(&self) {
        self.inner.reload_notify.notified().await;
    }

    /// Re-reads and re-validates the config file from disk, swapping it in on success. On
    /// failure the previous configuration remains active and the error is returned for the
    /// caller to log; this mirrors the policy evaluator's reload contract (old program retained).
    pub fn reload(&self) -> Result<(), ConfigError> {
        let conf_file = read_conf_file(&self.inner.config_path)?;
        let conf = Conf::from_conf_file(&conf_file, &self.inner.data_dir)?;

        *self.inner.conf.write() = Arc::new(conf);
        *self.inner.conf_file.write() = Arc::new(conf_file);
        self.inner.reload_notify.notify_waiters();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_conf_file() -> dto::ConfFile {
        serde_yaml::from_str("server:\n  proxy_ip: 192.168.1.100\n").unwrap()
    }

    #[test]
    fn defaults_fill_an_empty_document() {
        let conf_file: dto::ConfFile = serde_yaml::from_str("{}").unwrap();
        assert_eq!(conf_file.server.dns_port, 53);
        assert_eq!(conf_file.server.http_port, 8080);
        assert_eq!(conf_file.policy.opa_policy_source, "directory");
        assert_eq!(conf_file.usage_tracking.daily_reset_time, "00:00");
    }

    #[test]
    fn identical_http_and_https_ports_are_rejected() {
        let mut conf_file = minimal_conf_file();
        conf_file.server.https_port = conf_file.server.http_port;
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        let error = Conf::from_conf_file(&conf_file, &data_dir).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn unsupported_storage_backend_is_rejected() {
        let mut conf_file = minimal_conf_file();
        conf_file.storage.kind = "redis".to_owned();
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        let error = Conf::from_conf_file(&conf_file, &data_dir).unwrap_err();
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn generates_ca_material_on_first_load() {
        let conf_file = minimal_conf_file();
        let dir = tempfile::tempdir().unwrap();
        let data_dir = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        let conf = Conf::from_conf_file(&conf_file, &data_dir).unwrap();
        assert!(conf.ca.root_cert_der().is_some());
        assert!(data_dir.join("ca").join("root.pem").exists());
    }

    #[test]
    fn daily_reset_time_parses_hhmm() {
        assert_eq!(parse_daily_reset_time("00:00").unwrap(), 0);
        assert_eq!(parse_daily_reset_time("16:30").unwrap(), 16 * 60 + 30);
        assert!(parse_daily_reset_time("24:00").is_err());
        assert!(parse_daily_reset_time("nope").is_err());
    }
}
