//! YAML (de)serialization for the device/profile/rule directory.
//!
//! This is the one declarative document an operator (or the out-of-scope admin API) authors by
//! hand. It is parsed twice, for two different consumers: [`crate::config`] loads it once at
//! startup to seed [`crate::policy::PolicyEngine`]'s fast device/profile/time-window pre-checks,
//! and [`crate::policy::builtin::DirectoryCompiler`] compiles the same documents into the
//! [`crate::policy::evaluator::CompiledProgram`] that actually decides allow/block per rule.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::Deserialize;

use crate::domain_matcher::{DomainPattern, Identifier, PathPattern};
use crate::policy::model::{Action, BypassPatterns, Device, DeviceDirectory, Profile, Rule, TimeWindow, UsageLimit};

fn default_true() -> bool {
    true
}

fn default_block_action() -> Action {
    Action::Block
}

#[derive(Debug, Deserialize)]
struct DeviceDto {
    id: String,
    #[serde(default)]
    display_name: String,
    identifiers: Vec<String>,
    profile_id: String,
    #[serde(default = "default_true")]
    active: bool,
}

#[derive(Debug, Deserialize)]
struct RuleDto {
    id: String,
    #[serde(default)]
    domains: Vec<String>,
    #[serde(default)]
    paths: Vec<String>,
    action: Action,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    inject_timer: bool,
}

#[derive(Debug, Deserialize)]
struct TimeWindowDto {
    days_of_week: Vec<u8>,
    start_minute: u32,
    end_minute: u32,
}

#[derive(Debug, Deserialize)]
struct UsageLimitDto {
    category: String,
    daily_minutes: u32,
    #[serde(default)]
    inject_timer: bool,
}

#[derive(Debug, Deserialize)]
struct ProfileDto {
    id: String,
    #[serde(default)]
    rules: Vec<RuleDto>,
    #[serde(default)]
    time_windows: Vec<TimeWindowDto>,
    #[serde(default)]
    usage_limits: Vec<UsageLimitDto>,
    #[serde(default = "default_block_action")]
    default_action: Action,
}

#[derive(Debug, Deserialize, Default)]
struct DirectoryDocument {
    #[serde(default)]
    devices: Vec<DeviceDto>,
    #[serde(default)]
    profiles: Vec<ProfileDto>,
    #[serde(default)]
    bypass_patterns: Vec<String>,
}

/// The result of parsing one or more directory documents: devices/profiles merge across
/// documents (later documents can add devices or profiles, but a repeated profile id
/// overwrites the earlier one), and bypass patterns concatenate.
pub struct ParsedDirectory {
    pub directory: DeviceDirectory,
    pub bypass_patterns: BypassPatterns,
}

pub fn parse_directory_documents(documents: &[String]) -> anyhow::Result<ParsedDirectory> {
    let mut devices = Vec::new();
    let mut profiles = HashMap::new();
    let mut bypass_patterns = Vec::new();

    for document in documents {
        let parsed: DirectoryDocument = serde_yaml::from_str(document)?;

        for device in parsed.devices {
            let identifiers = device.identifiers.iter().filter_map(|raw| Identifier::classify(raw)).collect();
            let now = SystemTime::now();
            devices.push(Device {
                id: device.id,
                display_name: device.display_name,
                identifiers,
                profile_id: device.profile_id,
                active: device.active,
                created_at: now,
                updated_at: now,
            });
        }

        for profile in parsed.profiles {
            let rules = profile
                .rules
                .into_iter()
                .map(|rule| Rule {
                    id: rule.id,
                    domains: rule.domains.iter().map(|d| DomainPattern::compile(d)).collect(),
                    paths: rule.paths.iter().map(|p| PathPattern::compile(p)).collect(),
                    action: rule.action,
                    category: rule.category,
                    inject_timer: rule.inject_timer,
                })
                .collect();

            let time_windows = profile
                .time_windows
                .into_iter()
                .map(|w| TimeWindow {
                    days_of_week: w.days_of_week,
                    start_minute: w.start_minute,
                    end_minute: w.end_minute,
                })
                .collect();

            let usage_limits = profile
                .usage_limits
                .into_iter()
                .map(|l| UsageLimit {
                    category: l.category,
                    daily_minutes: l.daily_minutes,
                    inject_timer: l.inject_timer,
                })
                .collect();

            profiles.insert(
                profile.id.clone(),
                Profile {
                    id: profile.id,
                    rules,
                    time_windows,
                    usage_limits,
                    default_action: profile.default_action,
                },
            );
        }

        bypass_patterns.extend(parsed.bypass_patterns.iter().map(|p| DomainPattern::compile(p)));
    }

    Ok(ParsedDirectory {
        directory: DeviceDirectory { devices, profiles },
        bypass_patterns: BypassPatterns(bypass_patterns),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
devices:
  - id: dev1
    display_name: kid-laptop
    identifiers: ["192.168.2.10"]
    profile_id: kids
profiles:
  - id: kids
    default_action: block
    rules:
      - id: r1
        domains: ["youtube.com"]
        action: allow
        category: entertainment
        inject_timer: true
bypass_patterns: ["*.windowsupdate.com"]
"#;
        let parsed = parse_directory_documents(&[yaml.to_owned()]).unwrap();
        assert_eq!(parsed.directory.devices.len(), 1);
        assert!(parsed.directory.profiles.contains_key("kids"));
        assert!(parsed.bypass_patterns.matches("update.windowsupdate.com"));
    }

    #[test]
    fn merges_across_multiple_documents() {
        let first = r#"
devices:
  - id: dev1
    identifiers: ["192.168.2.10"]
    profile_id: kids
profiles: []
"#;
        let second = r#"
devices: []
profiles:
  - id: kids
    default_action: allow
"#;
        let parsed = parse_directory_documents(&[first.to_owned(), second.to_owned()]).unwrap();
        assert_eq!(parsed.directory.devices.len(), 1);
        assert!(parsed.directory.profiles.contains_key("kids"));
    }
}
