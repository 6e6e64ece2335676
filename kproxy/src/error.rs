//! Typed error taxonomy for the request-time pipeline.
//!
//! These never unwind through a request: each layer matches on its concrete error type and
//! converts it into a degraded decision or a synthetic response. Only startup failures use
//! `anyhow` directly.

use std::net::IpAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration file at {path}")]
    Read {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("invalid YAML configuration")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyCompileError {
    #[error("no policy sources found in {0}")]
    NoSources(String),
    #[error("failed to read policy source {path}")]
    Read {
        path: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to fetch policy source {url}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("policy source is not well-formed: {0}")]
    Syntax(String),
}

#[derive(Debug, thiserror::Error)]
#[error("policy reload failed, previous program retained: {0}")]
pub struct PolicyReloadError(#[from] pub PolicyCompileError);

#[derive(Debug, thiserror::Error)]
#[error("evaluator returned an unrecognized action string: {0:?}")]
pub struct PolicyContractError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamDnsError {
    #[error("upstream {server} timed out")]
    Timeout { server: IpAddr },
    #[error("upstream {server} failed")]
    Failed {
        server: IpAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("every configured upstream resolver failed")]
    AllFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamHttpError {
    #[error("failed to connect to origin")]
    Connect(#[source] reqwest::Error),
    #[error("origin request timed out")]
    Timeout,
    #[error("origin connection failed mid-stream")]
    Io(#[source] reqwest::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CertMintError {
    #[error("TLS ClientHello did not carry an SNI hostname")]
    NoSni,
    #[error("certificate authority key material could not be parsed as PKCS8 or SEC1 ECDSA")]
    KeyParseError,
    #[error("failed to mint leaf certificate")]
    Mint(#[source] rcgen::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}
