//! Uniform interface over an external declarative rule engine whose syntax is opaque to this
//! component. Two policy-source modes: filesystem directory scan, or an HTTP URL list.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use camino::Utf8PathBuf;
use parking_lot::RwLock;

use crate::error::{PolicyCompileError, PolicyReloadError};
use crate::policy::facts::{DnsDecision, DnsFacts, ProxyDecision, ProxyFacts};

/// An in-memory compiled program. The external rule language's syntax tree is opaque to this
/// crate; what matters is that it can answer the two evaluation questions below.
#[async_trait]
pub trait CompiledProgram: Send + Sync {
    async fn evaluate_dns(&self, facts: &DnsFacts) -> DnsDecision;
    async fn evaluate_proxy(&self, facts: &ProxyFacts) -> ProxyDecision;
}

#[derive(Debug, Clone)]
pub enum PolicySource {
    Directory(Utf8PathBuf),
    HttpUrls { urls: Vec<String>, timeout: Duration, retries: u32 },
}

/// Compiles policy sources into a [`CompiledProgram`]. This is the seam a concrete rule
/// language plugs into; this crate's bundled evaluator is a conservative built-in one (see
/// `BuiltinEvaluator`) suitable for the device/profile/rule model in `policy::model`.
#[async_trait]
pub trait SourceCompiler: Send + Sync {
    async fn compile(&self, source: &PolicySource) -> Result<Arc<dyn CompiledProgram>, PolicyCompileError>;
}

/// The adapter: holds the current compiled program behind a single atomically-swapped pointer,
/// and exposes `compile`/`evaluate_dns`/`evaluate_proxy`/`reload`.
///
/// Never holds a lock during evaluation longer than a single call: readers clone the `Arc` out
/// from under the lock and evaluate against their own snapshot.
pub struct PolicyEvaluator {
    compiler: Arc<dyn SourceCompiler>,
    source: PolicySource,
    program: RwLock<Arc<dyn CompiledProgram>>,
}

impl PolicyEvaluator {
    pub async fn compile(
        compiler: Arc<dyn SourceCompiler>,
        source: PolicySource,
    ) -> Result<Self, PolicyCompileError> {
        let program = compiler.compile(&source).await?;
        Ok(Self {
            compiler,
            source,
            program: RwLock::new(program),
        })
    }

    fn snapshot(&self) -> Arc<dyn CompiledProgram> {
        Arc::clone(&self.program.read())
    }

    pub async fn evaluate_dns(&self, facts: &DnsFacts) -> DnsDecision {
        self.snapshot().evaluate_dns(facts).await
    }

    pub async fn evaluate_proxy(&self, facts: &ProxyFacts) -> ProxyDecision {
        self.snapshot().evaluate_proxy(facts).await
    }

    /// Recompiles into a *new* program, atomically swapped in on success. On failure the
    /// previous program remains active and the error is surfaced to the caller (P6: no request
    /// ever observes a half-compiled program, since the swap is a single pointer write).
    pub async fn reload(&self) -> Result<(), PolicyReloadError> {
        let new_program = self.compiler.compile(&self.source).await?;
        *self.program.write() = new_program;
        Ok(())
    }
}

/// Fetches HTTP-sourced policy documents with a configured timeout and bounded retry count
/// using exponential backoff; on total failure the previously compiled program is retained by
/// the caller (this function only ever returns the fresh bytes or an error, never mutates state).
pub async fn fetch_http_sources(urls: &[String], timeout: Duration, max_retries: u32) -> Result<Vec<String>, PolicyCompileError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| PolicyCompileError::Fetch {
            url: "<client build>".to_owned(),
            source,
        })?;

    let mut documents = Vec::with_capacity(urls.len());

    for url in urls {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(timeout * max_retries.max(1)),
            ..ExponentialBackoff::default()
        };

        let url_owned = url.clone();
        let client = client.clone();

        let body = backoff::future::retry(backoff, || {
            let client = client.clone();
            let url = url_owned.clone();
            async move {
                client
                    .get(&url)
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status())
                    .map_err(backoff::Error::transient)?
                    .text()
                    .await
                    .map_err(backoff::Error::transient)
            }
        })
        .await
        .map_err(|source| PolicyCompileError::Fetch { url: url.clone(), source })?;

        documents.push(body);
    }

    Ok(documents)
}

pub fn read_directory_sources(dir: &Path) -> Result<Vec<String>, PolicyCompileError> {
    let mut documents = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(|source| PolicyCompileError::Read {
        path: Utf8PathBuf::try_from(dir.to_path_buf()).unwrap_or_default(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| PolicyCompileError::Read {
            path: Utf8PathBuf::try_from(dir.to_path_buf()).unwrap_or_default(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| PolicyCompileError::Read {
            path: Utf8PathBuf::try_from(path.clone()).unwrap_or_default(),
            source,
        })?;
        documents.push(contents);
    }

    if documents.is_empty() {
        return Err(PolicyCompileError::NoSources(dir.display().to_string()));
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::facts::{ProxyAction, TimeFacts};
    use std::collections::BTreeMap;

    struct AlwaysAllow;

    #[async_trait]
    impl CompiledProgram for AlwaysAllow {
        async fn evaluate_dns(&self, _facts: &DnsFacts) -> DnsDecision {
            DnsDecision::Bypass
        }

        async fn evaluate_proxy(&self, _facts: &ProxyFacts) -> ProxyDecision {
            ProxyDecision::allow("always")
        }
    }

    struct StaticCompiler(Arc<dyn CompiledProgram>);

    #[async_trait]
    impl SourceCompiler for StaticCompiler {
        async fn compile(&self, _source: &PolicySource) -> Result<Arc<dyn CompiledProgram>, PolicyCompileError> {
            Ok(Arc::clone(&self.0))
        }
    }

    #[tokio::test]
    async fn evaluator_delegates_to_compiled_program() {
        let compiler = Arc::new(StaticCompiler(Arc::new(AlwaysAllow)));
        let evaluator = PolicyEvaluator::compile(compiler, PolicySource::Directory("/tmp".into()))
            .await
            .unwrap();

        let facts = ProxyFacts {
            client_ip: "192.168.1.1".parse().unwrap(),
            client_mac: None,
            host: "example.com".into(),
            path: "/".into(),
            method: "GET".into(),
            time: TimeFacts {
                day_of_week: 0,
                hour: 0,
                minute: 0,
            },
            usage: BTreeMap::new(),
        };

        let decision = evaluator.evaluate_proxy(&facts).await;
        assert_eq!(decision.action, ProxyAction::Allow);
    }

    #[tokio::test]
    async fn reload_swaps_program_atomically() {
        let compiler = Arc::new(StaticCompiler(Arc::new(AlwaysAllow)));
        let evaluator = PolicyEvaluator::compile(compiler, PolicySource::Directory("/tmp".into()))
            .await
            .unwrap();

        evaluator.reload().await.unwrap();

        let facts = DnsFacts {
            client_ip: "192.168.1.1".parse().unwrap(),
            client_mac: None,
            domain: "example.com".into(),
        };
        assert_eq!(evaluator.evaluate_dns(&facts).await, DnsDecision::Bypass);
    }
}
