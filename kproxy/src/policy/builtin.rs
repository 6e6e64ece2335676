//! The bundled rule interpreter: the conservative, always-available implementation of
//! [`SourceCompiler`]/[`CompiledProgram`] that interprets the device/profile/rule model from
//! `policy::model` directly, rather than delegating to an external process.
//!
//! This is one conforming evaluator among possibly many (§4.2 treats the evaluator as a trait
//! object boundary); it exists so the repository is runnable without standing up a separate rule
//! engine, and is what `config.rs` wires up by default.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::directory::parse_directory_documents;
use crate::error::PolicyCompileError;
use crate::policy::evaluator::{CompiledProgram, PolicySource, SourceCompiler, fetch_http_sources, read_directory_sources};
use crate::policy::facts::{DnsDecision, DnsFacts, ProxyDecision, ProxyFacts};
use crate::policy::model::{Action, Device, DeviceDirectory, Profile};

pub struct DirectoryCompiler;

#[async_trait]
impl SourceCompiler for DirectoryCompiler {
    async fn compile(&self, source: &PolicySource) -> Result<std::sync::Arc<dyn CompiledProgram>, PolicyCompileError> {
        let documents = match source {
            PolicySource::Directory(dir) => read_directory_sources(dir.as_std_path())?,
            PolicySource::HttpUrls { urls, timeout, retries } => fetch_http_sources(urls, *timeout, *retries).await?,
        };

        let parsed = parse_directory_documents(&documents).map_err(|source| PolicyCompileError::Syntax(source.to_string()))?;

        Ok(std::sync::Arc::new(BuiltinProgram {
            directory: parsed.directory,
        }))
    }
}

struct BuiltinProgram {
    directory: DeviceDirectory,
}

fn device_and_profile<'a>(directory: &'a DeviceDirectory, client_ip: IpAddr, client_mac: Option<&str>) -> Option<(&'a Device, &'a Profile)> {
    let device = directory.find_device(client_ip, client_mac)?;
    let profile = directory.profile_for(device)?;
    Some((device, profile))
}

#[async_trait]
impl CompiledProgram for BuiltinProgram {
    async fn evaluate_dns(&self, facts: &DnsFacts) -> DnsDecision {
        // Rules scoped to a path never apply to a bare domain lookup; only domain-only rules are
        // consulted here, with `""` never satisfying a non-empty path pattern.
        let Some((_, profile)) = device_and_profile(&self.directory, facts.client_ip, facts.client_mac.as_deref()) else {
            return DnsDecision::Block;
        };

        let action = profile
            .rules
            .iter()
            .find(|rule| rule.matches(&facts.domain, ""))
            .map_or(profile.default_action, |rule| rule.action);

        match action {
            Action::Allow => DnsDecision::Intercept,
            Action::Bypass => DnsDecision::Bypass,
            Action::Block => DnsDecision::Block,
        }
    }

    async fn evaluate_proxy(&self, facts: &ProxyFacts) -> ProxyDecision {
        let Some((_, profile)) = device_and_profile(&self.directory, facts.client_ip, facts.client_mac.as_deref()) else {
            return ProxyDecision::block("unknown device", "unknown_device");
        };

        let matched = profile.rules.iter().find(|rule| rule.matches(&facts.host, &facts.path));

        let (action, matched_rule_id, category, inject_timer) = match matched {
            Some(rule) => (rule.action, Some(rule.id.clone()), rule.category.clone(), rule.inject_timer),
            None => (profile.default_action, None, None, false),
        };

        if matches!(action, Action::Allow | Action::Bypass) {
            if let Some(category) = &category {
                if let Some(limit) = profile.usage_limit_for(category) {
                    let used = facts.usage.get(category).map_or(0, |u| u.today_minutes);
                    if used >= limit.daily_minutes {
                        let mut decision = ProxyDecision::block("daily usage limit reached", "usage_limit_reached");
                        decision.matched_rule_id = matched_rule_id;
                        decision.category = Some(category.clone());
                        decision.inject_timer = limit.inject_timer;
                        decision.usage_limit_id = Some(category.clone());
                        return decision;
                    }
                }
            }

            let mut decision = ProxyDecision::allow(matched_rule_id.as_deref().map_or("default allow", |_| "rule matched"));
            decision.matched_rule_id = matched_rule_id;
            decision.category = category;
            decision.inject_timer = inject_timer;
            return decision;
        }

        let mut decision = ProxyDecision::block(
            matched_rule_id.as_deref().map_or("blocked by default", |_| "blocked by rule"),
            "rule_blocked",
        );
        decision.matched_rule_id = matched_rule_id;
        decision.usage_limit_id = category.clone();
        decision.category = category;
        decision.inject_timer = inject_timer;
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_matcher::{DomainPattern, Identifier};
    use crate::policy::facts::{ProxyAction, TimeFacts, UsageSnapshot};
    use crate::policy::model::{Rule, UsageLimit};
    use std::collections::{BTreeMap, HashMap};
    use std::time::SystemTime;

    fn directory_with_rule(rule: Rule, usage_limits: Vec<UsageLimit>) -> DeviceDirectory {
        let mut profiles = HashMap::new();
        profiles.insert(
            "kids".to_owned(),
            Profile {
                id: "kids".into(),
                rules: vec![rule],
                time_windows: vec![],
                usage_limits,
                default_action: Action::Block,
            },
        );

        DeviceDirectory {
            devices: vec![Device {
                id: "dev1".into(),
                display_name: "laptop".into(),
                identifiers: vec![Identifier::Ip("192.168.2.10".parse().unwrap())],
                profile_id: "kids".into(),
                active: true,
                created_at: SystemTime::now(),
                updated_at: SystemTime::now(),
            }],
            profiles,
        }
    }

    fn proxy_facts(usage_minutes: u32, category: &str) -> ProxyFacts {
        let mut usage = BTreeMap::new();
        usage.insert(category.to_owned(), UsageSnapshot { today_minutes: usage_minutes });
        ProxyFacts {
            client_ip: "192.168.2.10".parse().unwrap(),
            client_mac: None,
            host: "youtube.com".into(),
            path: "/".into(),
            method: "GET".into(),
            time: TimeFacts { day_of_week: 2, hour: 16, minute: 0 },
            usage,
        }
    }

    #[tokio::test]
    async fn matched_allow_rule_without_limit_passes_through() {
        let rule = Rule {
            id: "r1".into(),
            domains: vec![DomainPattern::compile("youtube.com")],
            paths: vec![],
            action: Action::Allow,
            category: Some("entertainment".into()),
            inject_timer: true,
        };
        let program = BuiltinProgram { directory: directory_with_rule(rule, vec![]) };

        let decision = program.evaluate_proxy(&proxy_facts(0, "entertainment")).await;
        assert_eq!(decision.action, ProxyAction::Allow);
        assert_eq!(decision.matched_rule_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn allow_rule_is_blocked_once_daily_limit_is_reached() {
        let rule = Rule {
            id: "r1".into(),
            domains: vec![DomainPattern::compile("youtube.com")],
            paths: vec![],
            action: Action::Allow,
            category: Some("entertainment".into()),
            inject_timer: true,
        };
        let limits = vec![UsageLimit {
            category: "entertainment".into(),
            daily_minutes: 30,
            inject_timer: true,
        }];
        let program = BuiltinProgram { directory: directory_with_rule(rule, limits) };

        let decision = program.evaluate_proxy(&proxy_facts(30, "entertainment")).await;
        assert_eq!(decision.action, ProxyAction::Block);
        assert_eq!(decision.usage_limit_id.as_deref(), Some("entertainment"));
    }

    #[tokio::test]
    async fn unmatched_host_falls_back_to_profile_default() {
        let rule = Rule {
            id: "r1".into(),
            domains: vec![DomainPattern::compile("youtube.com")],
            paths: vec![],
            action: Action::Allow,
            category: None,
            inject_timer: false,
        };
        let program = BuiltinProgram { directory: directory_with_rule(rule, vec![]) };

        let mut facts = proxy_facts(0, "entertainment");
        facts.host = "unknown-site.example".into();
        let decision = program.evaluate_proxy(&facts).await;
        assert_eq!(decision.action, ProxyAction::Block);
        assert!(decision.matched_rule_id.is_none());
    }

    #[tokio::test]
    async fn dns_facts_ignore_path_scoped_rules() {
        let rule = Rule {
            id: "r1".into(),
            domains: vec![DomainPattern::compile("youtube.com")],
            paths: vec![crate::domain_matcher::PathPattern::compile("/watch")],
            action: Action::Allow,
            category: None,
            inject_timer: false,
        };
        let program = BuiltinProgram { directory: directory_with_rule(rule, vec![]) };

        let decision = program
            .evaluate_dns(&DnsFacts {
                client_ip: "192.168.2.10".parse().unwrap(),
                client_mac: None,
                domain: "youtube.com".into(),
            })
            .await;
        // The rule's path pattern never matches the empty path used for DNS, so the
        // profile's default action applies instead.
        assert_eq!(decision, DnsDecision::Block);
    }
}
