//! The declarative data model: devices, profiles, rules, time windows, usage limits.
//!
//! These are written by the admin plane and read by the policy engine; the core pipeline never
//! mutates them. Reloadable on an explicit signal, swapped in atomically (see `policy::evaluator`).

use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::domain_matcher::{DomainPattern, Identifier, PathPattern};

pub type DeviceId = String;
pub type ProfileId = String;
pub type RuleId = String;
pub type Category = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
    Bypass,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub id: DeviceId,
    pub display_name: String,
    pub identifiers: Vec<Identifier>,
    pub profile_id: ProfileId,
    pub active: bool,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Device {
    /// Matches an incoming request against this device's identifiers, in priority order
    /// (link-layer, exact IP, CIDR). Returns the first identifier that matches (I1: at most one
    /// identifier is ever consulted per request because iteration stops at the first hit).
    pub fn matches(&self, client_ip: IpAddr, client_mac: Option<&str>) -> bool {
        let mut sorted: Vec<&Identifier> = self.identifiers.iter().collect();
        sorted.sort_by_key(|id| crate::domain_matcher::identifier_priority(id));
        sorted
            .into_iter()
            .any(|id| crate::domain_matcher::identifier_matches(id, client_ip, client_mac))
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: RuleId,
    pub domains: Vec<DomainPattern>,
    pub paths: Vec<PathPattern>,
    pub action: Action,
    pub category: Option<Category>,
    pub inject_timer: bool,
}

impl Rule {
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = self.domains.iter().any(|p| p.matches(host));
        let path_ok = self.paths.is_empty() || self.paths.iter().any(|p| p.matches(path));
        host_ok && path_ok
    }
}

/// A half-open `[start, end)` interval in minutes-of-day, valid on a set of days-of-week.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    pub days_of_week: Vec<u8>,
    pub start_minute: u32,
    pub end_minute: u32,
}

impl TimeWindow {
    pub fn contains(&self, day_of_week: u8, minute_of_day: u32) -> bool {
        self.days_of_week.contains(&day_of_week) && minute_of_day >= self.start_minute && minute_of_day < self.end_minute
    }
}

#[derive(Debug, Clone)]
pub struct UsageLimit {
    pub category: Category,
    pub daily_minutes: u32,
    pub inject_timer: bool,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: ProfileId,
    pub rules: Vec<Rule>,
    pub time_windows: Vec<TimeWindow>,
    pub usage_limits: Vec<UsageLimit>,
    pub default_action: Action,
}

impl Profile {
    pub fn within_allowed_time(&self, day_of_week: u8, minute_of_day: u32) -> bool {
        self.time_windows.is_empty() || self.time_windows.iter().any(|w| w.contains(day_of_week, minute_of_day))
    }

    pub fn usage_limit_for(&self, category: &str) -> Option<&UsageLimit> {
        self.usage_limits.iter().find(|l| l.category == category)
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.usage_limits.iter().map(|l| l.category.as_str())
    }
}

/// A global list of domain patterns that always bypass the proxy regardless of profile.
#[derive(Debug, Clone, Default)]
pub struct BypassPatterns(pub Vec<DomainPattern>);

impl BypassPatterns {
    pub fn matches(&self, host: &str) -> bool {
        self.0.iter().any(|p| p.matches(host))
    }
}

/// The full reloadable declarative snapshot: devices, profiles and global bypass patterns.
#[derive(Debug, Clone, Default)]
pub struct DeviceDirectory {
    pub devices: Vec<Device>,
    pub profiles: std::collections::HashMap<ProfileId, Profile>,
}

impl DeviceDirectory {
    pub fn find_device(&self, client_ip: IpAddr, client_mac: Option<&str>) -> Option<&Device> {
        self.devices
            .iter()
            .filter(|d| d.active)
            .find(|d| d.matches(client_ip, client_mac))
    }

    pub fn profile_for(&self, device: &Device) -> Option<&Profile> {
        self.profiles.get(&device.profile_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn device(identifiers: Vec<Identifier>) -> Device {
        Device {
            id: "d1".into(),
            display_name: "laptop".into(),
            identifiers,
            profile_id: "kids".into(),
            active: true,
            created_at: SystemTime::now(),
            updated_at: SystemTime::now(),
        }
    }

    #[test]
    fn device_matches_by_ip() {
        let ip: IpAddr = "192.168.2.10".parse().unwrap();
        let d = device(vec![Identifier::Ip(ip)]);
        assert!(d.matches(ip, None));
        assert!(!d.matches("192.168.2.11".parse().unwrap(), None));
    }

    #[test]
    fn device_prefers_mac_over_ip_when_both_present() {
        let ip: IpAddr = "192.168.2.10".parse().unwrap();
        let d = device(vec![
            Identifier::Ip(ip),
            Identifier::LinkLayer("aa:bb:cc:dd:ee:ff".into()),
        ]);
        // Matching succeeds via either; priority only affects which identifier is consulted
        // first, not the final match/no-match outcome for a single device.
        assert!(d.matches(ip, Some("aa:bb:cc:dd:ee:ff")));
    }

    #[test]
    fn time_window_half_open_interval() {
        let window = TimeWindow {
            days_of_week: vec![1],
            start_minute: 16 * 60,
            end_minute: 18 * 60,
        };
        assert!(window.contains(1, 16 * 60));
        assert!(!window.contains(1, 18 * 60));
        assert!(!window.contains(0, 16 * 60 + 30));
    }

    #[test]
    fn profile_with_no_windows_is_always_allowed() {
        let profile = Profile {
            id: "p".into(),
            rules: vec![],
            time_windows: vec![],
            usage_limits: vec![],
            default_action: Action::Block,
        };
        assert!(profile.within_allowed_time(3, 180));
    }
}
