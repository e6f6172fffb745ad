//! Rate-limit subject identity and the startup whitelist.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Sentinel client identity for the aggregate bucket shared by all clients.
pub(crate) const GLOBAL_CLIENT: &str = "*";

/// Identifies a rate-limit subject: a normalized client address, optionally
/// combined with the endpoint path. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    client: Arc<str>,
    endpoint: Option<Arc<str>>,
}

impl RateKey {
    /// Key for a client's default bucket.
    pub fn client(addr: &str) -> Self {
        Self { client: normalize(addr), endpoint: None }
    }

    /// Key scoped to a client and an endpoint path, for per-endpoint buckets.
    pub fn endpoint(addr: &str, path: &str) -> Self {
        Self { client: normalize(addr), endpoint: Some(Arc::from(path)) }
    }

    /// Sentinel key for the aggregate ceiling across all clients.
    pub fn global() -> Self {
        Self { client: Arc::from(GLOBAL_CLIENT), endpoint: None }
    }

    /// The normalized client address.
    pub fn client_addr(&self) -> &str {
        &self.client
    }

    /// The endpoint component, if this key is endpoint-scoped.
    pub fn endpoint_path(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub(crate) fn is_global(&self) -> bool {
        &*self.client == GLOBAL_CLIENT
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(path) => write!(f, "{}:{}", self.client, path),
            None => write!(f, "{}", self.client),
        }
    }
}

fn normalize(addr: &str) -> Arc<str> {
    Arc::from(addr.trim().to_ascii_lowercase().as_str())
}

/// Addresses exempt from all limiting.
///
/// Entries ending in `*` match as prefixes (`10.0.*` covers the subnet);
/// everything else matches exactly. Loaded once at startup and read-only at
/// request time.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl Whitelist {
    /// Build a whitelist from configured entries.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut prefixes = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_suffix('*') {
                Some(prefix) if !prefix.is_empty() => prefixes.push(prefix.to_string()),
                _ => {
                    exact.insert(entry);
                }
            }
        }
        Self { exact, prefixes }
    }

    /// Whether the address is exempt from limiting.
    pub fn contains(&self, addr: &str) -> bool {
        let addr = addr.trim().to_ascii_lowercase();
        if self.exact.contains(&addr) {
            return true;
        }
        self.prefixes.iter().any(|p| addr.starts_with(p.as_str()))
    }

    /// Number of configured entries.
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    /// True when no entries are configured.
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}
