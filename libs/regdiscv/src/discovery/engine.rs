use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cache::ModuleCache;
use super::codec::CodecRegistry;
use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::path;
use crate::service::RegDiscv;
use crate::types::ServerInfo;

const FATAL_BUFFER: usize = 16;

/// What to walk and which paths are critical.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    /// Root of the registration tree, e.g. `/bcs/services/endpoints`.
    pub base_path: String,
    /// When set, only these module names below the base path are walked.
    pub module_filter: Option<Vec<String>>,
    /// Modules whose watch failures are reported on the fatal channel
    /// instead of being restarted.
    pub critical_modules: Vec<String>,
}

impl DiscoveryOptions {
    #[must_use]
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_module_filter<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.module_filter = Some(modules.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_critical_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_modules = modules.into_iter().map(Into::into).collect();
        self
    }
}

/// A watch on a critical path failed terminally; its task has stopped.
///
/// The host decides whether to shut down.
#[derive(Debug, Clone)]
pub struct DiscoveryFatal {
    pub path: String,
    pub error: Error,
}

struct EventCallback(Box<dyn Fn(&str) + Send + Sync>);

struct Engine<T> {
    regdiscv: RegDiscv,
    opts: DiscoveryOptions,
    codecs: CodecRegistry<T>,
    cache: ModuleCache<T>,
    watched: Mutex<HashSet<String>>,
    callback: ArcSwapOption<EventCallback>,
}

/// Walks the registration tree below a base path and keeps a typed server
/// list per module up to date.
///
/// Leaf paths (those whose children carry payloads) become cache entries
/// keyed by their path relative to the base, e.g. `storage` or
/// `mesosdriver/BCS-K8S-001`.
pub struct ModuleDiscovery<T = ServerInfo> {
    inner: Arc<Engine<T>>,
}

impl<T> Clone for ModuleDiscovery<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for ModuleDiscovery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleDiscovery")
            .field("base_path", &self.inner.opts.base_path)
            .field("cache", &self.inner.cache)
            .field("watched", &self.inner.watched.lock().len())
            .finish_non_exhaustive()
    }
}

impl<T> ModuleDiscovery<T>
where
    T: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(regdiscv: RegDiscv, opts: DiscoveryOptions, codecs: CodecRegistry<T>) -> Self {
        Self {
            inner: Arc::new(Engine {
                regdiscv,
                opts,
                codecs,
                cache: ModuleCache::new(),
                watched: Mutex::new(HashSet::new()),
                callback: ArcSwapOption::empty(),
            }),
        }
    }

    /// Walk the tree once and start watching every visited path.
    ///
    /// Returns the channel on which terminal failures of critical paths are
    /// reported. Watches stop when `cancel` fires.
    ///
    /// # Errors
    /// Returns the listing error if the base path cannot be read.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<mpsc::Receiver<DiscoveryFatal>> {
        let (fatal_tx, fatal_rx) = mpsc::channel(FATAL_BUFFER);
        let base = self.inner.opts.base_path.clone();
        self.inner.walk(&base, cancel, &fatal_tx).await?;
        tracing::info!(
            base_path = %base,
            modules = self.inner.cache.keys().len(),
            "module discovery started"
        );
        Ok(fatal_rx)
    }

    /// Servers of every cached module key matching `key`.
    ///
    /// `key` is a module name or `module/cluster`; matching is per path
    /// segment.
    ///
    /// # Errors
    /// `Error::NotFound` when nothing matches or the matched entries are empty.
    pub fn get_module_servers(&self, key: &str) -> Result<Vec<T>> {
        let servers = self.inner.cache.matching(key);
        if servers.is_empty() {
            return Err(Error::NotFound(key.to_owned()));
        }
        Ok(servers)
    }

    /// A uniformly random server of exactly `key`.
    ///
    /// # Errors
    /// `Error::NotFound` when the key is unknown or has no servers.
    pub fn get_rand_module_server(&self, key: &str) -> Result<T> {
        self.inner
            .cache
            .random(key)
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    /// Install the callback invoked with the module key after every cache
    /// update. Replaces any previous callback.
    pub fn register_event_func<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner
            .callback
            .store(Some(Arc::new(EventCallback(Box::new(callback)))));
    }

    /// Cached module keys, sorted.
    #[must_use]
    pub fn modules(&self) -> Vec<String> {
        self.inner.cache.keys()
    }
}

impl<T> Engine<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn is_base(&self, p: &str) -> bool {
        p.trim_end_matches('/') == self.opts.base_path.trim_end_matches('/')
    }

    fn is_critical(&self, p: &str) -> bool {
        if self.is_base(p) {
            return true;
        }
        path::relative_to(p, &self.opts.base_path)
            .and_then(|rel| rel.split('/').next())
            .is_some_and(|module| self.opts.critical_modules.iter().any(|m| m == module))
    }

    fn allows_module(&self, module: &str) -> bool {
        self.opts
            .module_filter
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|m| m == module))
    }

    fn update(&self, key: &str, payloads: &[String]) {
        let servers = self.codecs.decode_all(key, payloads);
        tracing::debug!(module = %key, servers = servers.len(), "module servers updated");
        self.cache.store(key, servers);
        if let Some(cb) = self.callback.load_full() {
            (cb.0)(key);
        }
    }

    /// Empty every cached key below the directory `dir` (relative to the
    /// base) that no longer lies under one of its `children`.
    fn evict_missing(&self, dir: &str, children: &[String]) {
        let listed: Vec<String> = children
            .iter()
            .map(|c| if dir.is_empty() { c.clone() } else { format!("{dir}/{c}") })
            .collect();
        for key in self.cache.keys() {
            if key == dir || !is_under(&key, dir) || listed.iter().any(|c| is_under(&key, c)) {
                continue;
            }
            if self.cache.has_servers(&key) {
                tracing::info!(module = %key, "module path removed, clearing servers");
                self.update(&key, &[]);
            }
        }
    }

    /// Visit `root` and everything below it.
    ///
    /// Only a failure to list `root` itself is returned; failures deeper in
    /// the tree are logged and skipped.
    async fn walk(
        self: &Arc<Self>,
        root: &str,
        cancel: &CancellationToken,
        fatal: &mpsc::Sender<DiscoveryFatal>,
    ) -> Result<()> {
        let mut pending = vec![root.to_owned()];
        while let Some(current) = pending.pop() {
            if cancel.is_cancelled() {
                break;
            }
            let listing = self.regdiscv.discover_nodes_v2(&current).await;
            if let Some(err) = listing.err {
                if current == root {
                    return Err(err);
                }
                tracing::debug!(path = %current, error = %err, "skipping unreadable path");
                continue;
            }
            self.spawn_watch(&current, &listing.nodes, cancel, fatal);

            let key = path::relative_to(&current, &self.opts.base_path).unwrap_or_default();
            if !key.is_empty() {
                if !listing.server.is_empty() {
                    self.update(key, &listing.server);
                    continue;
                }
                if self.cache.contains(key) {
                    self.update(key, &[]);
                }
            }

            self.evict_missing(key, &listing.nodes);

            let filtered = self.is_base(&current);
            for child in listing.nodes {
                if filtered && !self.allows_module(&child) {
                    continue;
                }
                pending.push(path::join(&current, &child));
            }
        }
        Ok(())
    }

    fn spawn_watch(
        self: &Arc<Self>,
        p: &str,
        seen: &[String],
        cancel: &CancellationToken,
        fatal: &mpsc::Sender<DiscoveryFatal>,
    ) {
        if !self.watched.lock().insert(p.to_owned()) {
            return;
        }
        tracing::debug!(path = %p, "watching path");
        let mut seen = seen.to_vec();
        seen.sort();
        tokio::spawn(Arc::clone(self).watch_path(
            p.to_owned(),
            seen,
            cancel.clone(),
            fatal.clone(),
        ));
    }

    /// Re-walk `p` on every change. Terminal watch errors go to the fatal
    /// channel for critical paths; other paths restart the watch after a
    /// backoff delay.
    ///
    /// `seen` holds the sorted child names the spawning walk already
    /// processed; a first event listing the same children is not re-walked.
    fn watch_path(
        self: Arc<Self>,
        p: String,
        seen: Vec<String>,
        cancel: CancellationToken,
        fatal: mpsc::Sender<DiscoveryFatal>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut backoff = Backoff::new(self.regdiscv.config().retry.clone());
            let mut seen = Some(seen);
            loop {
                let mut events = self.regdiscv.discover(&p);
                let failure = loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return,
                        ev = events.recv() => ev,
                    };
                    let Some(ev) = next else { break None };
                    if let Some(err) = ev.err {
                        break Some(err);
                    }
                    backoff.reset();
                    if let Some(initial) = seen.take() {
                        let mut nodes = ev.nodes;
                        nodes.sort();
                        if nodes == initial {
                            continue;
                        }
                    }
                    if let Err(e) = self.walk(&p, &cancel, &fatal).await {
                        tracing::debug!(path = %p, error = %e, "re-walk failed");
                    }
                };
                let Some(error) = failure else {
                    // discover loop ended without an error: service stopped
                    return;
                };

                if self.is_critical(&p) {
                    tracing::error!(path = %p, error = %error, "watch on critical path failed");
                    let report = DiscoveryFatal {
                        path: p.clone(),
                        error,
                    };
                    if fatal.send(report).await.is_err() {
                        tracing::warn!(path = %p, "fatal channel closed, dropping report");
                    }
                    return;
                }

                tracing::warn!(path = %p, error = %error, "watch failed, restarting after backoff");
                if !backoff.wait(&cancel).await {
                    return;
                }
            }
        })
    }
}

/// `true` when the cache key `key` equals `prefix` or lies below it.
fn is_under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_below_a_directory() {
        assert!(is_under("storage", ""));
        assert!(is_under("mesosdriver/BCS-1", "mesosdriver"));
        assert!(is_under("mesosdriver", "mesosdriver"));
        assert!(!is_under("mesosdriver-backup", "mesosdriver"));
        assert!(!is_under("storage", "mesosdriver"));
    }
}
