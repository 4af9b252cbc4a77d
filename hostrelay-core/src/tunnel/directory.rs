//! Bidirectional host ⇄ identifier directory

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
struct Indices {
    by_host: HashMap<String, String>,
    by_identifier: HashMap<String, String>,
}

/// Maps public hostnames to client identifiers and back.
///
/// Both indices sit behind one lock, so every observer sees a bijection:
/// a host maps to at most one identifier and vice versa. Hostnames are
/// case-insensitive and stored lowercased.
#[derive(Debug, Default)]
pub struct HostDirectory {
    inner: Mutex<Indices>,
}

fn normalize_host(host: &str) -> String {
    host.to_ascii_lowercase()
}

impl HostDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `host ⇄ identifier`, dropping any mapping that used either key.
    pub fn add_host(&self, host: &str, identifier: &str) {
        let host = normalize_host(host);
        let mut inner = self.inner.lock();

        if let Some(old_identifier) = inner.by_host.remove(&host) {
            inner.by_identifier.remove(&old_identifier);
        }
        if let Some(old_host) = inner.by_identifier.remove(identifier) {
            inner.by_host.remove(&old_host);
        }

        inner.by_host.insert(host.clone(), identifier.to_string());
        inner.by_identifier.insert(identifier.to_string(), host.clone());
        debug!(host = %host, identifier, "Virtual host added");
    }

    /// Remove `host` and its identifier from both directions.
    pub fn delete_host(&self, host: &str) -> Option<String> {
        let host = normalize_host(host);
        let mut inner = self.inner.lock();
        let identifier = inner.by_host.remove(&host)?;
        inner.by_identifier.remove(&identifier);
        debug!(host = %host, identifier, "Virtual host deleted");
        Some(identifier)
    }

    pub fn get_identifier(&self, host: &str) -> Option<String> {
        self.inner.lock().by_host.get(&normalize_host(host)).cloned()
    }

    pub fn get_host(&self, identifier: &str) -> Option<String> {
        self.inner.lock().by_identifier.get(identifier).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
