//! Stable nominal record types exchanged between the engine and the evaluator adapter.
//!
//! The external rule engine is opaque and typically string-keyed; these types are the one place
//! that boundary is crossed. Everything upstream of `policy::evaluator` works with these types,
//! never with the evaluator's own document shape.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;

use crate::policy::model::Category;

/// The minimal record of request attributes submitted to the evaluator for a DNS query.
#[derive(Debug, Clone, Serialize)]
pub struct DnsFacts {
    pub client_ip: IpAddr,
    pub client_mac: Option<String>,
    pub domain: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsDecision {
    Intercept,
    Bypass,
    Block,
}

impl DnsDecision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "INTERCEPT" => Some(Self::Intercept),
            "BYPASS" => Some(Self::Bypass),
            "BLOCK" => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeFacts {
    pub day_of_week: u8,
    pub hour: u8,
    pub minute: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub today_minutes: u32,
}

/// The minimal record of request attributes submitted to the evaluator for an HTTP(S) request.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyFacts {
    pub client_ip: IpAddr,
    pub client_mac: Option<String>,
    pub host: String,
    pub path: String,
    pub method: String,
    pub time: TimeFacts,
    pub usage: BTreeMap<Category, UsageSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAction {
    Allow,
    Block,
}

/// `{action, reason, block-page, matched-rule-id, category, inject-timer,
/// time-remaining-minutes, usage-limit-id}`, per §4.2.
#[derive(Debug, Clone)]
pub struct ProxyDecision {
    pub action: ProxyAction,
    pub reason: String,
    pub block_page: Option<String>,
    pub matched_rule_id: Option<String>,
    pub category: Option<Category>,
    pub inject_timer: bool,
    pub time_remaining_minutes: Option<u32>,
    pub usage_limit_id: Option<String>,
}

impl ProxyDecision {
    pub fn block(reason: impl Into<String>, block_page: impl Into<String>) -> Self {
        Self {
            action: ProxyAction::Block,
            reason: reason.into(),
            block_page: Some(block_page.into()),
            matched_rule_id: None,
            category: None,
            inject_timer: false,
            time_remaining_minutes: None,
            usage_limit_id: None,
        }
    }

    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            action: ProxyAction::Allow,
            reason: reason.into(),
            block_page: None,
            matched_rule_id: None,
            category: None,
            inject_timer: false,
            time_remaining_minutes: None,
            usage_limit_id: None,
        }
    }
}
