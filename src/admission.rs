//! Host admission gate
//! Decides whether a decrypted request targets a host we are willing to relay

use hyper::header::HOST;
use hyper::Request;

/// Built-in allow-list, in evaluation order
pub const DEFAULT_SUFFIXES: &[&str] = &[
    "mobage.jp",
    "mbga.jp",
    "gree.net",
    "granbluefantasy.jp",
    // literal address, tested as a plain string suffix like the others
    "203.104.248.14",
];

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self == Admission::Allow
    }
}

/// How a hostname is compared against a suffix entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuffixMatch {
    /// Plain string suffix: `evilgree.net` matches `gree.net`
    #[default]
    Bare,
    /// The suffix must be the whole name or be preceded by a `.`
    DotBoundary,
}

/// Fixed, non-empty list of hostname suffixes
#[derive(Debug, Clone, Copy)]
pub struct AllowList {
    entries: &'static [&'static str],
}

impl AllowList {
    /// The compiled-in list
    pub const fn builtin() -> Self {
        Self {
            entries: DEFAULT_SUFFIXES,
        }
    }

    pub fn entries(&self) -> &'static [&'static str] {
        self.entries
    }

    /// Return the first entry that matches `hostname`.
    /// `hostname` must already be lowercased.
    fn find(&self, hostname: &str, mode: SuffixMatch) -> Option<&'static str> {
        self.entries
            .iter()
            .copied()
            .find(|entry| Self::matches(hostname, entry, mode))
    }

    fn matches(hostname: &str, entry: &str, mode: SuffixMatch) -> bool {
        match mode {
            SuffixMatch::Bare => hostname.ends_with(entry),
            SuffixMatch::DotBoundary => {
                hostname == entry
                    || hostname
                        .strip_suffix(entry)
                        .is_some_and(|rest| rest.ends_with('.'))
            }
        }
    }
}

impl Default for AllowList {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Stateless admission gate over an [`AllowList`]
#[derive(Debug, Clone, Copy, Default)]
pub struct HostGate {
    allow_list: AllowList,
    mode: SuffixMatch,
}

impl HostGate {
    pub fn new(allow_list: AllowList, mode: SuffixMatch) -> Self {
        Self { allow_list, mode }
    }

    /// Decide whether `request_host` may be relayed.
    ///
    /// The host is matched without its port, ignoring ASCII case. A trailing
    /// root dot is kept, so `gree.net.` does not end with `gree.net`. An
    /// empty host is always denied.
    pub fn admit(&self, request_host: &str) -> Admission {
        self.matching_entry(request_host)
            .map_or(Admission::Deny, |_| Admission::Allow)
    }

    /// The allow-list entry that admits `request_host`, if any
    pub fn matching_entry(&self, request_host: &str) -> Option<&'static str> {
        let hostname = normalize(strip_port(request_host));
        if hostname.is_empty() {
            return None;
        }
        self.allow_list.find(&hostname, self.mode)
    }
}

/// Effective target host of a request, port included.
///
/// The authority of the request target wins; origin-form requests fall back
/// to the `Host` header. Returns an empty string when neither is usable.
pub fn effective_host<T>(req: &Request<T>) -> String {
    if let Some(authority) = req.uri().authority() {
        if !authority.host().is_empty() {
            return match authority.port() {
                Some(port) => format!("{}:{}", authority.host(), port),
                None => authority.host().to_string(),
            };
        }
    }

    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

/// Hostname portion of `host[:port]`. IPv6 literals lose their brackets.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }

    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn normalize(hostname: &str) -> String {
    hostname.to_ascii_lowercase()
}
