use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Whether a hostname falls under an operator-controlled public domain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DomainClass {
    Public,
    Custom,
}

/// A configured public-domain pattern.
///
/// `*.example.com` matches `example.com` itself and every name below it;
/// any other pattern matches a single hostname exactly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum DomainPattern {
    Exact(String),
    Wildcard { base: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidPattern {
    #[error("domain pattern must not be empty")]
    Empty,

    #[error("wildcard pattern {0:?} has no base domain")]
    MissingBase(String),

    #[error("domain pattern {0:?} may only use '*' as a leading '*.' label")]
    EmbeddedWildcard(String),
}

/// Classifies `host` against `patterns`. The first matching pattern wins; a
/// host matching no pattern is custom.
pub fn classify(host: &str, patterns: &[DomainPattern]) -> DomainClass {
    if patterns.iter().any(|p| p.matches(host)) {
        DomainClass::Public
    } else {
        DomainClass::Custom
    }
}

/// Returns true for names that only resolve inside the cluster: bare service
/// names, `*.svc`/`*.cluster.local` names and anything under `.internal`.
/// These never take part in ownership or CNAME checks.
pub fn is_internal_host(host: &str) -> bool {
    let host = host.trim_end_matches('.');
    if host.is_empty() || !host.contains('.') {
        return true;
    }
    let host = host.strip_prefix("*.").unwrap_or(host);
    ["svc", "cluster.local", "internal"]
        .iter()
        .any(|suffix| host.eq_ignore_ascii_case(suffix) || has_label_suffix(host, suffix))
}

/// True when `host` is strictly below `base`, i.e. ends with `.<base>`.
pub(crate) fn has_label_suffix(host: &str, base: &str) -> bool {
    let (h, b) = (host.as_bytes(), base.as_bytes());
    h.len() > b.len()
        && h[h.len() - b.len() - 1] == b'.'
        && h[h.len() - b.len()..].eq_ignore_ascii_case(b)
}

// === impl DomainPattern ===

impl DomainPattern {
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.');
        match self {
            Self::Exact(name) => host.eq_ignore_ascii_case(name),
            Self::Wildcard { base } => {
                host.eq_ignore_ascii_case(base) || has_label_suffix(host, base)
            }
        }
    }

    /// The registrable domain the pattern covers, without any wildcard.
    pub fn base(&self) -> &str {
        match self {
            Self::Exact(name) => name,
            Self::Wildcard { base } => base,
        }
    }
}

impl FromStr for DomainPattern {
    type Err = InvalidPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches('.');
        if s.is_empty() {
            return Err(InvalidPattern::Empty);
        }
        let (wildcard, name) = match s.strip_prefix("*.") {
            Some(base) => (true, base),
            None if s == "*" => return Err(InvalidPattern::MissingBase(s.to_string())),
            None => (false, s),
        };
        if name.is_empty() {
            return Err(InvalidPattern::MissingBase(s.to_string()));
        }
        if name.contains('*') {
            return Err(InvalidPattern::EmbeddedWildcard(s.to_string()));
        }
        let name = name.to_ascii_lowercase();
        Ok(if wildcard {
            Self::Wildcard { base: name }
        } else {
            Self::Exact(name)
        })
    }
}

impl TryFrom<String> for DomainPattern {
    type Error = InvalidPattern;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DomainPattern> for String {
    fn from(p: DomainPattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => name.fmt(f),
            Self::Wildcard { base } => write!(f, "*.{base}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn patterns(ps: &[&str]) -> Vec<DomainPattern> {
        ps.iter().map(|p| p.parse().unwrap()).collect()
    }

    #[rstest]
    #[case("a.b.example.com", &["*.example.com"], DomainClass::Public)]
    #[case("example.com", &["*.example.com"], DomainClass::Public)]
    #[case("example.org", &["*.example.com"], DomainClass::Custom)]
    #[case("notexample.com", &["*.example.com"], DomainClass::Custom)]
    #[case("Demo.Cloud.Sealos.IO", &["*.cloud.sealos.io"], DomainClass::Public)]
    #[case("demo.cloud.sealos.io.", &["*.cloud.sealos.io"], DomainClass::Public)]
    #[case("api.example.com", &["api.example.com"], DomainClass::Public)]
    #[case("www.api.example.com", &["api.example.com"], DomainClass::Custom)]
    #[case("app.custom.com", &["other.io", "*.custom.com"], DomainClass::Public)]
    #[case("anything", &[], DomainClass::Custom)]
    #[case("", &["*.example.com"], DomainClass::Custom)]
    fn classifies(#[case] host: &str, #[case] ps: &[&str], #[case] expected: DomainClass) {
        assert_eq!(classify(host, &patterns(ps)), expected);
    }

    #[test]
    fn classify_is_deterministic() {
        let ps = patterns(&["*.cloud.sealos.io", "sealos.run"]);
        for host in ["a.cloud.sealos.io", "sealos.run", "x.y", "ünïcode.example", "..", "*"] {
            let first = classify(host, &ps);
            for _ in 0..4 {
                assert_eq!(classify(host, &ps), first, "{host}");
            }
        }
    }

    #[rstest]
    #[case("", InvalidPattern::Empty)]
    #[case("*.", InvalidPattern::MissingBase("*".to_string()))]
    #[case("*", InvalidPattern::MissingBase("*".to_string()))]
    #[case("a.*.example.com", InvalidPattern::EmbeddedWildcard("a.*.example.com".to_string()))]
    fn rejects_bad_patterns(#[case] input: &str, #[case] expected: InvalidPattern) {
        assert_eq!(input.parse::<DomainPattern>(), Err(expected));
    }

    #[test]
    fn pattern_display_round_trips() {
        for p in ["*.cloud.sealos.io", "api.example.com"] {
            assert_eq!(p.parse::<DomainPattern>().unwrap().to_string(), p);
        }
    }

    #[rstest]
    #[case("demo", true)]
    #[case("demo.ns-demo.svc", true)]
    #[case("demo.ns-demo.svc.cluster.local", true)]
    #[case("db.internal", true)]
    #[case("*.internal", true)]
    #[case("demo.cloud.sealos.io", false)]
    #[case("internal.example.com", false)]
    fn internal_hosts(#[case] host: &str, #[case] internal: bool) {
        assert_eq!(is_internal_host(host), internal, "{host}");
    }
}
