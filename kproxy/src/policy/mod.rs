pub mod builtin;
pub mod evaluator;
pub mod facts;
pub mod model;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::clock::Clock;
use crate::error::PolicyContractError;
use crate::usage::tracker::UsageTracker;
use evaluator::PolicyEvaluator;
use facts::{DnsDecision, DnsFacts, ProxyAction, ProxyDecision, ProxyFacts, TimeFacts, UsageSnapshot};
use model::{BypassPatterns, DeviceDirectory};

/// A single incoming HTTP(S) request, as seen by the proxy listener, before policy evaluation.
pub struct ProxyRequest {
    pub client_ip: IpAddr,
    pub client_mac: Option<String>,
    pub host: String,
    pub path: String,
    pub method: String,
}

/// Gathers request facts, invokes the evaluator, interprets the decision, and updates the usage
/// tracker. The two entry points used by the listeners are `get_dns_action` and `evaluate`.
pub struct PolicyEngine {
    directory: RwLock<Arc<DeviceDirectory>>,
    bypass_patterns: RwLock<Arc<BypassPatterns>>,
    admin_hostname: String,
    evaluator: PolicyEvaluator,
    /// Injected after construction to break the cyclic dependency between the tracker and the
    /// engine (§9): the tracker depends only on the store, the engine consumes the tracker as an
    /// interface.
    usage_tracker: RwLock<Option<Arc<UsageTracker>>>,
    clock: RwLock<Arc<dyn Clock>>,
}

impl PolicyEngine {
    pub fn new(
        directory: DeviceDirectory,
        bypass_patterns: BypassPatterns,
        admin_hostname: String,
        evaluator: PolicyEvaluator,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            directory: RwLock::new(Arc::new(directory)),
            bypass_patterns: RwLock::new(Arc::new(bypass_patterns)),
            admin_hostname,
            evaluator,
            usage_tracker: RwLock::new(None),
            clock: RwLock::new(clock),
        }
    }

    pub fn set_usage_tracker(&self, tracker: Arc<UsageTracker>) {
        *self.usage_tracker.write() = Some(tracker);
    }

    /// Injects a virtual wall-clock source, for testing and for the interactive "check" surface.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.write() = clock;
    }

    pub fn replace_directory(&self, directory: DeviceDirectory) {
        *self.directory.write() = Arc::new(directory);
    }

    pub fn replace_bypass_patterns(&self, patterns: BypassPatterns) {
        *self.bypass_patterns.write() = Arc::new(patterns);
    }

    /// True when `host` is globally bypassed, i.e. the proxy should tunnel it untouched rather
    /// than terminate TLS and run it through `evaluate`. Used by the CONNECT handler, which must
    /// decide before any TLS handshake happens and therefore cannot wait for a full policy
    /// evaluation keyed on device identity.
    pub fn is_global_bypass(&self, host: &str) -> bool {
        self.bypass_patterns.read().matches(host)
    }

    /// §4.6 `get-dns-action`.
    pub async fn get_dns_action(
        &self,
        client_ip: IpAddr,
        client_mac: Option<&str>,
        domain: &str,
    ) -> Result<DnsDecision, PolicyContractError> {
        if domain.eq_ignore_ascii_case(&self.admin_hostname) {
            return Ok(DnsDecision::Intercept);
        }

        if self.bypass_patterns.read().matches(domain) {
            return Ok(DnsDecision::Bypass);
        }

        let facts = DnsFacts {
            client_ip,
            client_mac: client_mac.map(str::to_owned),
            domain: domain.to_owned(),
        };

        Ok(self.evaluator.evaluate_dns(&facts).await)
    }

    /// §4.6 `evaluate`.
    pub async fn evaluate(&self, request: ProxyRequest) -> ProxyDecision {
        let directory = self.directory.read().clone();

        let Some(device) = directory.find_device(request.client_ip, request.client_mac.as_deref()) else {
            return ProxyDecision::block("unknown device", "unknown_device");
        };

        let Some(profile) = directory.profile_for(device) else {
            return ProxyDecision::block("profile not configured", "config_error");
        };

        let clock = self.clock.read().clone();
        let day_of_week = clock.day_of_week();
        let minute_of_day = clock.minute_of_day();

        if !profile.within_allowed_time(day_of_week, minute_of_day) {
            return ProxyDecision::block("outside allowed hours", "time_restriction");
        }

        let mut usage = BTreeMap::new();
        if let Some(tracker) = self.usage_tracker.read().clone() {
            for category in profile.categories() {
                let minutes = tracker.today_minutes(&device.id, category).await;
                usage.insert(category.to_owned(), UsageSnapshot { today_minutes: minutes });
            }
        }

        let facts = ProxyFacts {
            client_ip: request.client_ip,
            client_mac: request.client_mac.clone(),
            host: request.host.clone(),
            path: request.path.clone(),
            method: request.method.clone(),
            time: TimeFacts {
                day_of_week,
                hour: u8::try_from(minute_of_day / 60).unwrap_or(23),
                minute: u8::try_from(minute_of_day % 60).unwrap_or(59),
            },
            usage: usage.clone(),
        };

        let mut decision = self.evaluator.evaluate_proxy(&facts).await;

        match decision.action {
            ProxyAction::Allow => {
                if let (Some(category), Some(tracker)) = (&decision.category, self.usage_tracker.read().clone()) {
                    tracker.record_activity(&device.id, category).await;
                }
            }
            ProxyAction::Block => {
                if decision.inject_timer {
                    if let Some(limit_id) = &decision.usage_limit_id {
                        if let Some(limit) = profile.usage_limit_for(limit_id) {
                            let used = usage.get(limit_id).map(|u| u.today_minutes).unwrap_or(0);
                            decision.time_remaining_minutes = Some(limit.daily_minutes.saturating_sub(used));
                        }
                    }
                }
            }
        }

        decision
    }

    /// Re-runs evaluator compile; keeps the previous program on failure, surfaces the error.
    pub async fn reload(&self) -> anyhow::Result<()> {
        self.evaluator.reload().await.map_err(anyhow::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::domain_matcher::{DomainPattern, Identifier};
    use crate::policy::evaluator::{CompiledProgram, PolicySource, SourceCompiler};
    use crate::policy::model::{Action, Device, Profile, Rule, TimeWindow};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::SystemTime;
    use time::macros::datetime;

    struct AllowEverything;

    #[async_trait]
    impl CompiledProgram for AllowEverything {
        async fn evaluate_dns(&self, _facts: &DnsFacts) -> DnsDecision {
            DnsDecision::Block
        }

        async fn evaluate_proxy(&self, _facts: &ProxyFacts) -> ProxyDecision {
            let mut decision = ProxyDecision::allow("ok");
            decision.category = Some("entertainment".into());
            decision
        }
    }

    struct StaticCompiler;

    #[async_trait]
    impl SourceCompiler for StaticCompiler {
        async fn compile(&self, _source: &PolicySource) -> Result<Arc<dyn CompiledProgram>, crate::error::PolicyCompileError> {
            Ok(Arc::new(AllowEverything))
        }
    }

    async fn engine_with_device() -> PolicyEngine {
        let evaluator = PolicyEvaluator::compile(Arc::new(StaticCompiler), PolicySource::Directory("/tmp".into()))
            .await
            .unwrap();

        let mut profiles = HashMap::new();
        profiles.insert(
            "kids".to_owned(),
            Profile {
                id: "kids".into(),
                rules: vec![Rule {
                    id: "r1".into(),
                    domains: vec![DomainPattern::compile("youtube.com")],
                    paths: vec![],
                    action: Action::Allow,
                    category: Some("entertainment".into()),
                    inject_timer: true,
                }],
                time_windows: vec![TimeWindow {
                    days_of_week: vec![1],
                    start_minute: 16 * 60,
                    end_minute: 18 * 60,
                }],
                usage_limits: vec![],
                default_action: Action::Block,
            },
        );

        let directory = DeviceDirectory {
            devices: vec![Device {
                id: "dev1".into(),
                display_name: "kid-laptop".into(),
                identifiers: vec![Identifier::Ip("192.168.2.10".parse().unwrap())],
                profile_id: "kids".into(),
                active: true,
                created_at: SystemTime::now(),
                updated_at: SystemTime::now(),
            }],
            profiles,
        };

        let clock = Arc::new(FixedClock::new(datetime!(2024-01-02 16:30:00 UTC))); // Tuesday

        PolicyEngine::new(directory, BypassPatterns::default(), "admin.kproxy.local".into(), evaluator, clock)
    }

    #[tokio::test]
    async fn unknown_device_is_blocked() {
        let engine = engine_with_device().await;
        let decision = engine
            .evaluate(ProxyRequest {
                client_ip: "10.99.99.5".parse().unwrap(),
                client_mac: None,
                host: "youtube.com".into(),
                path: "/".into(),
                method: "GET".into(),
            })
            .await;
        assert_eq!(decision.usage_limit_id.is_none() && decision.reason == "unknown device", true);
    }

    #[tokio::test]
    async fn known_device_within_window_is_allowed() {
        let engine = engine_with_device().await;
        let decision = engine
            .evaluate(ProxyRequest {
                client_ip: "192.168.2.10".parse().unwrap(),
                client_mac: None,
                host: "youtube.com".into(),
                path: "/".into(),
                method: "GET".into(),
            })
            .await;
        assert_eq!(decision.action, ProxyAction::Allow);
    }

    #[tokio::test]
    async fn admin_hostname_intercepts() {
        let engine = engine_with_device().await;
        let decision = engine
            .get_dns_action("192.168.2.10".parse().unwrap(), None, "admin.kproxy.local")
            .await
            .unwrap();
        assert_eq!(decision, DnsDecision::Intercept);
    }
}
