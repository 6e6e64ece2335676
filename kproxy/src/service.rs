//! Process lifecycle: wiring every subsystem together, running until a shutdown signal, and
//! tearing listeners down within a bounded deadline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use kproxy_task::{ChildTask, ShutdownHandle, ShutdownSignal, Task, spawn_task};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::arp::ArpCache;
use crate::clock::SystemClock;
use crate::config::{Conf, ConfHandle};
use crate::directory::{self, ParsedDirectory};
use crate::dns::DnsServerTask;
use crate::dns::handler::{DnsConfig, DnsHandler};
use crate::dns::upstream::UpstreamResolvers;
use crate::domain_matcher::DomainPattern;
use crate::log::KProxyLog;
use crate::policy::PolicyEngine;
use crate::policy::builtin::DirectoryCompiler;
use crate::policy::evaluator::{PolicyEvaluator, PolicySource, fetch_http_sources, read_directory_sources};
use crate::policy::model::BypassPatterns;
use crate::proxy::response_mod::ResponseModConfig;
use crate::proxy::{HttpListenerTask, HttpsListenerTask, ProxyState};
use crate::tls::{SniCertResolver, build_server_config, install_default_crypto_provider};
use crate::usage::store::InMemoryUsageStore;
use crate::usage::tracker::{DailyResetTask, UsageTracker};

/// §3: daily usage counters are pruned after ~90 days.
const USAGE_RETENTION_DAYS: i64 = 90;

/// Deadline a single policy evaluation inside the proxy request path is allowed to run before
/// the request falls back to the synthetic "policy unavailable" block.
const POLICY_EVAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for the upstream leg of an allowed proxy request.
const PROXY_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful shutdown waits for every task to drain before they are aborted by
/// dropping their [`ChildTask`] handles.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

type Tasks = Vec<ChildTask<anyhow::Result<()>>>;

/// Runs kproxy until `SIGINT`/`SIGTERM` requests a shutdown. `SIGHUP` re-reads the configuration
/// file and recompiles the policy evaluator in place; a failed reload leaves the previous
/// configuration and program active and only logs the error ("SIGHUP triggers policy reload.
/// SIGINT/SIGTERM trigger graceful shutdown.").
pub async fn run(conf_handle: ConfHandle) -> anyhow::Result<()> {
    install_default_crypto_provider();

    let conf = conf_handle.get_conf();

    let _logger_guard =
        kproxy_log::init::<KProxyLog>(&conf.log_dir, &conf.log_level, None).context("failed to setup logger")?;

    info!(version = env!("CARGO_PKG_VERSION"), "kproxy starting");

    let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();
    let mut tasks = spawn_tasks(&conf_handle, &conf, shutdown_signal.clone()).await?;

    tasks.push(spawn_task(
        kproxy_log::LogDeleterTask::<KProxyLog>::new(conf.log_dir.clone()),
        shutdown_signal,
    ));

    wait_for_shutdown_signal(&conf_handle).await;

    info!("shutting down");
    shutdown_handle.signal();

    tokio::select! {
        () = shutdown_handle.all_closed() => {
            info!("all tasks closed gracefully");
        }
        () = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD) => {
            warn!("some tasks did not terminate in time, forcing shutdown");
        }
    }

    drop(tasks);

    Ok(())
}

/// Blocks until `SIGINT` or `SIGTERM` is received. `SIGHUP` triggers a configuration reload and
/// loops back to waiting.
async fn wait_for_shutdown_signal(conf_handle: &ConfHandle) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "failed to install SIGINT handler");
            return;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, "failed to install SIGHUP handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                return;
            }
            _ = sighup.recv() => {
                info!("received SIGHUP, reloading configuration");
                if let Err(error) = conf_handle.reload() {
                    warn!(error = format!("{error:#}"), "configuration reload failed, keeping previous configuration");
                } else {
                    info!("configuration reloaded");
                }
            }
        }
    }
}

/// Loads the device/profile directory from whichever source the policy section names. The exact
/// same documents are handed to [`DirectoryCompiler`] to build the evaluator program; parsing
/// happens twice because the two consumers need different shapes (see `directory.rs`).
async fn load_directory(source: &PolicySource) -> anyhow::Result<ParsedDirectory> {
    let documents = match source {
        PolicySource::Directory(dir) => read_directory_sources(dir.as_std_path())?,
        PolicySource::HttpUrls { urls, timeout, retries } => fetch_http_sources(urls, *timeout, *retries).await?,
    };

    directory::parse_directory_documents(&documents)
}

fn combined_bypass_patterns(conf: &Conf, parsed: &ParsedDirectory) -> BypassPatterns {
    let mut patterns = parsed.bypass_patterns.0.clone();
    patterns.extend(conf.global_bypass.iter().map(|raw| DomainPattern::compile(raw)));
    BypassPatterns(patterns)
}

fn register<T>(tasks: &mut Tasks, task: T, shutdown_signal: ShutdownSignal)
where
    T: Task<Output = anyhow::Result<()>> + 'static,
{
    tasks.push(spawn_task(task, shutdown_signal));
}

async fn spawn_tasks(conf_handle: &ConfHandle, conf: &Arc<Conf>, shutdown_signal: ShutdownSignal) -> anyhow::Result<Tasks> {
    let mut tasks = Tasks::new();

    let parsed_directory = load_directory(&conf.policy.source)
        .await
        .context("failed to load the device/profile directory")?;
    let bypass_patterns = combined_bypass_patterns(conf, &parsed_directory);

    let evaluator = PolicyEvaluator::compile(Arc::new(DirectoryCompiler), conf.policy.source.clone())
        .await
        .context("failed to compile the policy evaluator")?;

    let clock = Arc::new(SystemClock);

    let policy = Arc::new(PolicyEngine::new(
        parsed_directory.directory,
        bypass_patterns,
        conf.admin_domain.clone(),
        evaluator,
        clock.clone(),
    ));

    let store = Arc::new(InMemoryUsageStore::new());
    let tracker = Arc::new(UsageTracker::new(
        store,
        clock.clone(),
        conf.inactivity_timeout,
        conf.min_session_duration,
        USAGE_RETENTION_DAYS,
    ));
    policy.set_usage_tracker(Arc::clone(&tracker));

    register(
        &mut tasks,
        DailyResetTask {
            tracker,
            clock,
            daily_reset_minute: conf.daily_reset_minute,
        },
        shutdown_signal.clone(),
    );

    register(
        &mut tasks,
        ConfigReloadTask {
            conf_handle: conf_handle.clone(),
            policy: Arc::clone(&policy),
        },
        shutdown_signal.clone(),
    );

    spawn_dns(conf, Arc::clone(&policy), &mut tasks, shutdown_signal.clone());
    spawn_proxy(conf, policy, &mut tasks, shutdown_signal)?;

    Ok(tasks)
}

fn spawn_dns(conf: &Conf, policy: Arc<PolicyEngine>, tasks: &mut Tasks, shutdown_signal: ShutdownSignal) {
    let upstream = Arc::new(UpstreamResolvers::new(&conf.upstream_servers, conf.dns.upstream_timeout));

    let handler = DnsHandler {
        policy,
        upstream,
        config: DnsConfig {
            proxy_ip: conf.dns.proxy_ip,
            intercept_ttl: conf.dns.intercept_ttl,
            block_ttl: conf.dns.block_ttl,
            bypass_ttl_cap: conf.dns.bypass_ttl_cap,
            upstream_timeout: conf.dns.upstream_timeout,
        },
    };

    register(
        tasks,
        DnsServerTask {
            bind_address: conf.dns_bind_address,
            enable_udp: conf.dns_enable_udp,
            enable_tcp: conf.dns_enable_tcp,
            handler,
        },
        shutdown_signal,
    );
}

fn spawn_proxy(conf: &Conf, policy: Arc<PolicyEngine>, tasks: &mut Tasks, shutdown_signal: ShutdownSignal) -> anyhow::Result<()> {
    let arp = conf.use_mac_address.then(|| Arc::new(ArpCache::new(conf.arp_cache_ttl)));

    let http_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(PROXY_UPSTREAM_TIMEOUT)
        .build()
        .context("failed to build the upstream HTTP client")?;

    let response_mod = ResponseModConfig {
        enabled: conf.response_mod.enabled,
        disabled_hosts: conf.response_mod.disabled_hosts.clone(),
        allowed_content_types: conf.response_mod.allowed_content_types.clone(),
    };

    let state = Arc::new(ProxyState {
        policy,
        arp,
        use_mac_address: conf.use_mac_address,
        response_mod,
        http_client,
        policy_eval_timeout: POLICY_EVAL_TIMEOUT,
        upstream_timeout: PROXY_UPSTREAM_TIMEOUT,
    });

    register(
        tasks,
        HttpListenerTask {
            bind_address: conf.http_bind_address,
            state: Arc::clone(&state),
        },
        shutdown_signal.clone(),
    );

    let resolver = Arc::new(SniCertResolver::new(conf.ca.clone(), conf.admin_override.clone()));
    let server_config = build_server_config(resolver);

    register(
        tasks,
        HttpsListenerTask {
            bind_address: conf.https_bind_address,
            state,
            server_config,
        },
        shutdown_signal,
    );

    Ok(())
}

/// Watches [`ConfHandle::change_notified`] and, on every configuration reload, re-scans the
/// policy directory/HTTP sources and recompiles the evaluator. A failed reload never tears down
/// the currently active directory or program: both [`PolicyEngine::replace_directory`] and
/// [`PolicyEngine::reload`] leave the previous snapshot in place on error.
struct ConfigReloadTask {
    conf_handle: ConfHandle,
    policy: Arc<PolicyEngine>,
}

#[async_trait::async_trait]
impl Task for ConfigReloadTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "config-reload";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                () = self.conf_handle.change_notified() => {
                    info!("configuration change detected, reloading policy directory and evaluator");
                    self.reload_once().await;
                }
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

impl ConfigReloadTask {
    async fn reload_once(&self) {
        let conf = self.conf_handle.get_conf();

        match load_directory(&conf.policy.source).await {
            Ok(parsed) => {
                let bypass = combined_bypass_patterns(&conf, &parsed);
                self.policy.replace_directory(parsed.directory);
                self.policy.replace_bypass_patterns(bypass);
            }
            Err(error) => {
                warn!(error = format!("{error:#}"), "failed to reload device/profile directory, keeping previous one");
            }
        }

        if let Err(error) = self.policy.reload().await {
            warn!(error = format!("{error:#}"), "policy evaluator reload failed, keeping previous program");
        }
    }
}
