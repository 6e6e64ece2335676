//! Hostname, path and CIDR matching used by rule evaluation and the device map.
//!
//! Three hostname pattern forms coexist, chosen by lexical shape: exact, wildcard (`*`/`**`),
//! and suffix (leading `.`). All comparisons are case-insensitive.

use std::net::IpAddr;
use std::str::FromStr;

use ipnetwork::IpNetwork;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Suffix(String),
    Wildcard(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`, matches exactly one label.
    Single,
    /// `**`, matches zero or more labels.
    Multi,
}

/// A compiled domain pattern, ready for repeated matching against candidate hostnames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPattern {
    pattern: Pattern,
}

impl DomainPattern {
    pub fn compile(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();

        let pattern = if lower.is_empty() {
            Pattern::Exact(String::new())
        } else if let Some(rest) = lower.strip_prefix('.') {
            Pattern::Suffix(rest.to_owned())
        } else if lower.contains('*') {
            Pattern::Wildcard(lower.split('.').map(Segment::compile).collect())
        } else {
            Pattern::Exact(lower)
        };

        Self { pattern }
    }

    /// Empty patterns never match.
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let host = host.trim_end_matches('.');

        match &self.pattern {
            Pattern::Exact(exact) => !exact.is_empty() && host == exact,
            Pattern::Suffix(suffix) => {
                !suffix.is_empty() && (host == suffix || host.ends_with(&format!(".{suffix}")))
            }
            Pattern::Wildcard(segments) => match_segments(segments, &host.split('.').collect::<Vec<_>>()),
        }
    }
}

impl Segment {
    fn compile(raw: &str) -> Self {
        match raw {
            "*" => Segment::Single,
            "**" => Segment::Multi,
            literal => Segment::Literal(literal.to_owned()),
        }
    }
}

fn match_segments(pattern: &[Segment], labels: &[&str]) -> bool {
    match (pattern.first(), labels.first()) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) if !matches!(pattern.first(), Some(Segment::Multi)) => false,
        (Some(Segment::Multi), _) => {
            // `**` consumes zero or more labels: try every split point.
            (0..=labels.len()).any(|skip| match_segments(&pattern[1..], &labels[skip..]))
        }
        (Some(Segment::Single), Some(_)) => match_segments(&pattern[1..], &labels[1..]),
        (Some(Segment::Literal(lit)), Some(label)) if lit == label => match_segments(&pattern[1..], &labels[1..]),
        _ => false,
    }
}

/// Prefix variant of [`match_segments`]: succeeds as soon as the pattern is exhausted, regardless
/// of any label segments remaining in `labels`. Used by [`PathPattern`], where a pattern like
/// `/api/v1` must match `/api/v1/users` as a prefix rather than requiring an exact segment count.
fn match_segments_prefix(pattern: &[Segment], labels: &[&str]) -> bool {
    match (pattern.first(), labels.first()) {
        (None, _) => true,
        (Some(_), None) if !matches!(pattern.first(), Some(Segment::Multi)) => false,
        (Some(Segment::Multi), _) => {
            // `**` consumes zero or more labels: try every split point.
            (0..=labels.len()).any(|skip| match_segments_prefix(&pattern[1..], &labels[skip..]))
        }
        (Some(Segment::Single), Some(_)) => match_segments_prefix(&pattern[1..], &labels[1..]),
        (Some(Segment::Literal(lit)), Some(label)) if lit == label => {
            match_segments_prefix(&pattern[1..], &labels[1..])
        }
        _ => false,
    }
}

/// Path glob layered on top of the hostname matcher: empty, or containing `*`, matches anything;
/// otherwise a prefix match with `*` (single segment) / `**` (multi segment) semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    segments: Option<Vec<Segment>>,
}

impl PathPattern {
    pub fn compile(raw: &str) -> Self {
        if raw.is_empty() {
            return Self { segments: None };
        }

        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Self { segments: None };
        }

        let segments = trimmed.split('/').map(Segment::compile).collect();
        Self {
            segments: Some(segments),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        let Some(segments) = &self.segments else {
            return true;
        };
        let path_segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
        match_segments_prefix(segments, &path_segments)
    }
}

/// How a device identifier is classified, per §4.1: link-layer when it contains five colons and
/// six hex groups, CIDR when it contains a slash, otherwise a bare IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    LinkLayer(String),
    Cidr(IpNetwork),
    Ip(IpAddr),
}

impl Identifier {
    pub fn classify(raw: &str) -> Option<Self> {
        if is_mac_address(raw) {
            return Some(Identifier::LinkLayer(raw.to_ascii_lowercase()));
        }

        if raw.contains('/') {
            return IpNetwork::from_str(raw).ok().map(Identifier::Cidr);
        }

        IpAddr::from_str(raw).ok().map(Identifier::Ip)
    }
}

fn is_mac_address(raw: &str) -> bool {
    raw.matches(':').count() == 5 && raw.split(':').all(|group| group.len() == 2 && group.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Identifier match priority: link-layer address first, exact IP second, CIDR range third.
pub fn identifier_matches(identifier: &Identifier, client_ip: IpAddr, client_mac: Option<&str>) -> bool {
    match identifier {
        Identifier::LinkLayer(mac) => client_mac.is_some_and(|m| m.eq_ignore_ascii_case(mac)),
        Identifier::Ip(ip) => *ip == client_ip,
        Identifier::Cidr(net) => net.contains(client_ip),
    }
}

/// Priority rank used to pick the first match across a device's identifier list: lower is
/// higher priority. Ties are impossible by construction (P5) because each kind is tried in turn
/// and the first match wins, never a comparison between kinds.
pub fn identifier_priority(identifier: &Identifier) -> u8 {
    match identifier {
        Identifier::LinkLayer(_) => 0,
        Identifier::Ip(_) => 1,
        Identifier::Cidr(_) => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("example.com", "example.com", true)]
    #[case("EXAMPLE.com", "example.com", true)]
    #[case("example.com", "other.com", false)]
    #[case("", "example.com", false)]
    fn exact_pattern(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(DomainPattern::compile(pattern).matches(host), expected);
    }

    #[rstest]
    #[case("*.example.com", "api.example.com", true)]
    #[case("*.example.com", "deep.api.example.com", false)]
    #[case("*.example.com", "example.com", false)]
    #[case("**.example.com", "deep.api.example.com", true)]
    #[case("**.example.com", "example.com", true)]
    fn wildcard_pattern(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(DomainPattern::compile(pattern).matches(host), expected);
    }

    #[rstest]
    #[case(".example.com", "example.com", true)]
    #[case(".example.com", "a.example.com", true)]
    #[case(".example.com", "notexample.com", false)]
    fn suffix_pattern(#[case] pattern: &str, #[case] host: &str, #[case] expected: bool) {
        assert_eq!(DomainPattern::compile(pattern).matches(host), expected);
    }

    #[test]
    fn empty_path_matches_anything() {
        assert!(PathPattern::compile("").matches("/anything/at/all"));
    }

    #[test]
    fn path_prefix_with_single_segment_glob() {
        let pattern = PathPattern::compile("/api/*/users");
        assert!(pattern.matches("/api/v1/users"));
        assert!(!pattern.matches("/api/v1/v2/users"));
    }

    #[test]
    fn path_literal_prefix_without_trailing_glob_matches_deeper_paths() {
        let pattern = PathPattern::compile("/api/v1");
        assert!(pattern.matches("/api/v1"));
        assert!(pattern.matches("/api/v1/users"));
        assert!(!pattern.matches("/api/v2"));
    }

    #[test]
    fn path_multi_segment_glob() {
        let pattern = PathPattern::compile("/api/**");
        assert!(pattern.matches("/api/v1/users/42"));
    }

    #[rstest]
    #[case("aa:bb:cc:dd:ee:ff")]
    #[case("00:11:22:33:44:55")]
    fn classifies_link_layer(#[case] raw: &str) {
        assert_eq!(Identifier::classify(raw), Some(Identifier::LinkLayer(raw.to_owned())));
    }

    #[test]
    fn classifies_cidr() {
        assert!(matches!(Identifier::classify("192.168.1.0/24"), Some(Identifier::Cidr(_))));
    }

    #[test]
    fn classifies_plain_ip() {
        assert!(matches!(Identifier::classify("192.168.1.10"), Some(Identifier::Ip(_))));
    }

    #[test]
    fn priority_orders_mac_before_ip_before_cidr() {
        assert!(identifier_priority(&Identifier::LinkLayer("x".into())) < identifier_priority(&Identifier::Ip("10.0.0.1".parse().unwrap())));
        assert!(
            identifier_priority(&Identifier::Ip("10.0.0.1".parse().unwrap()))
                < identifier_priority(&Identifier::Cidr("10.0.0.0/8".parse().unwrap()))
        );
    }
}
