//! Module cache - decoded server lists per module key

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::seq::IndexedRandom;

/// `true` when the '/'-segments of `query` appear as a contiguous run of the
/// segments of `key`.
///
/// `storage` matches `storage` and `storage/BCS-1`, but not `backup-storage`.
#[must_use]
pub fn key_matches(key: &str, query: &str) -> bool {
    let query: Vec<&str> = query.split('/').filter(|s| !s.is_empty()).collect();
    if query.is_empty() {
        return false;
    }
    let key: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    key.windows(query.len()).any(|w| w == query.as_slice())
}

/// Map of module key (`module` or `module/cluster`) to decoded descriptors.
///
/// Last writer wins per key. An entry with no servers is kept so that
/// consumers observe a module going empty.
pub struct ModuleCache<T> {
    inner: RwLock<HashMap<String, Vec<T>>>,
}

impl<T> std::fmt::Debug for ModuleCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        let mut modules: Vec<&String> = inner.keys().collect();
        modules.sort();
        f.debug_struct("ModuleCache")
            .field("modules", &modules)
            .finish()
    }
}

impl<T> Default for ModuleCache<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ModuleCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the servers of `key`.
    pub fn store(&self, key: &str, servers: Vec<T>) {
        self.inner.write().insert(key.to_owned(), servers);
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    /// `true` when `key` is cached with at least one server.
    #[must_use]
    pub fn has_servers(&self, key: &str) -> bool {
        self.inner.read().get(key).is_some_and(|servers| !servers.is_empty())
    }

    /// Servers of every entry whose key matches `query`, in key order.
    #[must_use]
    pub fn matching(&self, query: &str) -> Vec<T> {
        let inner = self.inner.read();
        let mut entries: Vec<(&String, &Vec<T>)> = inner
            .iter()
            .filter(|(k, _)| key_matches(k, query))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .flat_map(|(_, servers)| servers.iter().cloned())
            .collect()
    }

    /// Uniformly random server of the exact `key`.
    #[must_use]
    pub fn random(&self, key: &str) -> Option<T> {
        self.inner
            .read()
            .get(key)
            .and_then(|servers| servers.choose(&mut rand::rng()).cloned())
    }

    /// Snapshot of the cached keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}
