//! Pure validators for hostnames, IPs, URL paths, ports, annotation names,
//! and label selectors.
//!
//! Everything here is side-effect free; the regular expressions are compiled
//! once and shared.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])\.)*([A-Za-z0-9]|[A-Za-z0-9][A-Za-z0-9\-]*[A-Za-z0-9])$",
    )
    .expect("hostname regex is valid")
});

static IP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])\.){3}([0-9]|[1-9][0-9]|1[0-9]{2}|2[0-4][0-9]|25[0-5])$",
    )
    .expect("ip regex is valid")
});

static PATH_SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9\-._~!$&'()*+,;=:@]|%[0-9A-Fa-f]{2}$").expect("path segment regex is valid")
});

// Kubernetes qualified names: an optional DNS-1123 subdomain prefix followed
// by '/' and a name part.
static QUALIFIED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9._-]*[A-Za-z0-9])?$").expect("qualified name regex is valid")
});

static DNS_SUBDOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$")
        .expect("dns subdomain regex is valid")
});

/// True when `port` is a usable TCP port (1..=65535)
pub fn is_valid_port(port: i64) -> bool {
    (1..=65535).contains(&port)
}

/// True when `host` is a syntactically valid DNS hostname
pub fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty() && host.len() <= 253 && HOSTNAME_RE.is_match(host)
}

/// True when `host` is a dotted-quad IPv4 address
pub fn is_valid_ip(host: &str) -> bool {
    IP_RE.is_match(host)
}

/// True when `host` is routable as either a hostname or an IP literal
pub fn is_valid_host(host: &str) -> bool {
    is_valid_hostname(host) || is_valid_ip(host)
}

/// Validate a URL path used in routing annotations.
///
/// Splits on `/` and checks each segment against the pchar set; a leading or
/// trailing empty segment is allowed, the empty path is not.
pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }

    let segments: Vec<&str> = path.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        if (i == 0 || i == segments.len() - 1) && segment.is_empty() {
            continue;
        }
        if !PATH_SEGMENT_RE.is_match(segment) {
            return false;
        }
    }

    true
}

/// Validate a Kubernetes annotation name (qualified name with an optional
/// DNS subdomain prefix), matching the API server's own rules.
pub fn validate_annotation_name(name: &str) -> Result<(), String> {
    let lowered = name.to_lowercase();
    let (prefix, base) = match lowered.split_once('/') {
        Some((prefix, base)) => (Some(prefix), base),
        None => (None, lowered.as_str()),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN_RE.is_match(prefix) {
            return Err(format!("invalid annotation name: {name} has a malformed prefix"));
        }
    }

    if base.is_empty() || base.len() > 63 || base.contains('/') || !QUALIFIED_NAME_RE.is_match(base) {
        return Err(format!("invalid annotation name: {name}"));
    }

    Ok(())
}

/// One requirement of an equality-based label selector
#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    Exists(String),
    NotExists(String),
}

/// A parsed equality-based label selector.
///
/// Supports `k=v`, `k==v`, `k!=v`, bare-key existence, `!k` absence, and
/// comma-separated conjunctions. Set-based expressions (`in`, `notin`) are
/// rejected at parse time; the raw selector string is still handed to the
/// API server verbatim for server-side filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// Parse a selector string; the empty selector matches everything
    pub fn parse(selector: &str) -> Result<Self, String> {
        let mut requirements = Vec::new();

        for term in selector.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }

            if term.contains(" in ") || term.contains(" notin ") {
                return Err(format!(
                    "has an invalid label selector: {selector} (set-based expressions are not supported)"
                ));
            }

            let requirement = if let Some((key, value)) = term.split_once("!=") {
                Requirement::NotEq(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once("==") {
                Requirement::Eq(key.trim().to_string(), value.trim().to_string())
            } else if let Some((key, value)) = term.split_once('=') {
                Requirement::Eq(key.trim().to_string(), value.trim().to_string())
            } else if let Some(key) = term.strip_prefix('!') {
                Requirement::NotExists(key.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };

            let key = match &requirement {
                Requirement::Eq(k, _)
                | Requirement::NotEq(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k) => k,
            };
            if key.is_empty() {
                return Err(format!("has an invalid label selector: {selector}"));
            }

            requirements.push(requirement);
        }

        Ok(Self { requirements })
    }

    /// True when every requirement holds for the given label map
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|requirement| match requirement {
            Requirement::Eq(key, value) => labels.get(key).map(String::as_str) == Some(value),
            Requirement::NotEq(key, value) => labels.get(key).map(String::as_str) != Some(value),
            Requirement::Exists(key) => labels.contains_key(key),
            Requirement::NotExists(key) => !labels.contains_key(key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn valid_hostnames_pass() {
        for host in ["api.ex.net", "ex.net", "localhost", "a-b.c-d.net", "3com.example"] {
            assert!(is_valid_hostname(host), "{host} should be valid");
        }
    }

    #[test]
    fn invalid_hostnames_fail() {
        for host in ["", "-api.ex.net", "api-.ex.net", "api..ex.net", "api ex.net"] {
            assert!(!is_valid_hostname(host), "{host} should be invalid");
        }
    }

    #[test]
    fn ip_literals() {
        assert!(is_valid_ip("1.2.3.4"));
        assert!(is_valid_ip("255.255.255.255"));
        assert!(!is_valid_ip("256.1.1.1"));
        assert!(!is_valid_ip("1.2.3"));
        assert!(!is_valid_ip("01.2.3.4"));
    }

    #[test]
    fn path_validation() {
        for path in ["/test/%2a/aa/a", "/foo/", "=/foo", "~bar$", "/", "/users"] {
            assert!(is_valid_path(path), "{path} should be valid");
        }
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("["));
    }

    #[test]
    fn port_range() {
        assert!(is_valid_port(1));
        assert!(is_valid_port(80));
        assert!(is_valid_port(65535));
        assert!(!is_valid_port(0));
        assert!(!is_valid_port(65536));
        assert!(!is_valid_port(-1));
    }

    #[test]
    fn annotation_names() {
        assert!(validate_annotation_name("github.com/30x.dispatcher.hosts").is_ok());
        assert!(validate_annotation_name("simple-name").is_ok());
        assert!(validate_annotation_name("").is_err());
        assert!(validate_annotation_name("-leading.dash/name").is_err());
        assert!(validate_annotation_name("too/many/slashes").is_err());
    }

    #[test]
    fn selector_equality_match() {
        let selector = LabelSelector::parse("github.com/30x.dispatcher.routable=true")
            .expect("selector parses");

        assert!(selector.matches(&labels(&[("github.com/30x.dispatcher.routable", "true")])));
        assert!(!selector.matches(&labels(&[("github.com/30x.dispatcher.routable", "false")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn selector_conjunction_and_negation() {
        let selector = LabelSelector::parse("routable=true,tier!=db,!legacy").expect("selector parses");

        assert!(selector.matches(&labels(&[("routable", "true"), ("tier", "web")])));
        assert!(selector.matches(&labels(&[("routable", "true")])));
        assert!(!selector.matches(&labels(&[("routable", "true"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[("routable", "true"), ("legacy", "1")])));
    }

    #[test]
    fn selector_bare_key_is_existence() {
        let selector = LabelSelector::parse("routable").expect("selector parses");
        assert!(selector.matches(&labels(&[("routable", "anything")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn selector_empty_matches_everything() {
        let selector = LabelSelector::parse("").expect("selector parses");
        assert!(selector.matches(&labels(&[])));
    }

    #[test]
    fn selector_rejects_set_based() {
        assert!(LabelSelector::parse("tier in (web, db)").is_err());
        assert!(LabelSelector::parse("tier notin (db)").is_err());
    }
}
