//! In-process coordination service.
//!
//! Implements the [`CoordinationClient`] contract over a shared in-memory tree
//! so that a single process (or a test) can run the substrate without an
//! external ensemble. Several sessions can be opened against one tree; each
//! session owns its ephemeral nodes and watches.
//!
//! Besides the client contract the coordinator exposes administrative hooks
//! used to simulate failures: session expiry, availability toggling and
//! injected listing errors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{CoordError, CoordinationClient, CreateMode, WatchEvent, WatchEventKind, WatchSignal};
use crate::path;

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: i32,
    owner: Option<SessionId>,
    /// Next counter handed out to sequential children.
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            owner,
            next_sequence: 1,
        }
    }
}

struct PendingWatch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<PendingWatch>>,
    exist_watches: HashMap<String, Vec<PendingWatch>>,
    live_sessions: HashSet<SessionId>,
    injected: HashMap<String, CoordError>,
}

impl Tree {
    fn new() -> Self {
        let mut tree = Self::default();
        tree.nodes.insert("/".to_owned(), Node::new(Vec::new(), None));
        tree
    }

    fn children_of(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_owned()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn fire(watches: &mut HashMap<String, Vec<PendingWatch>>, path: &str, kind: WatchEventKind) {
        if let Some(list) = watches.remove(path) {
            for w in list {
                // receiver may be gone already; nothing to notify then
                if w
                    .tx
                    .send(WatchEvent {
                        kind,
                        path: path.to_owned(),
                    })
                    .is_err()
                {
                    tracing::trace!(path, "watch receiver dropped before firing");
                }
            }
        }
    }

    fn on_created(&mut self, created: &str) {
        Self::fire(&mut self.exist_watches, created, WatchEventKind::NodeCreated);
        if let Some(parent) = path::parent(created) {
            Self::fire(
                &mut self.child_watches,
                parent,
                WatchEventKind::NodeChildrenChanged,
            );
        }
    }

    fn remove_node(&mut self, target: &str) {
        self.nodes.remove(target);
        Self::fire(&mut self.exist_watches, target, WatchEventKind::NodeDeleted);
        Self::fire(&mut self.child_watches, target, WatchEventKind::NodeDeleted);
        if let Some(parent) = path::parent(target) {
            Self::fire(
                &mut self.child_watches,
                parent,
                WatchEventKind::NodeChildrenChanged,
            );
        }
    }

    fn end_session(&mut self, session: SessionId) -> usize {
        self.live_sessions.remove(&session);

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for p in &owned {
            self.remove_node(p);
        }

        for watches in [&mut self.child_watches, &mut self.exist_watches] {
            for list in watches.values_mut() {
                let (closed, kept): (Vec<_>, Vec<_>) =
                    list.drain(..).partition(|w| w.session == session);
                *list = kept;
                for w in closed {
                    drop(w.tx);
                }
            }
            watches.retain(|_, list| !list.is_empty());
        }

        owned.len()
    }
}

struct Shared {
    tree: Mutex<Tree>,
    available: AtomicBool,
    next_session: AtomicU64,
}

/// Shared in-memory coordination tree.
///
/// Cheap to clone; clones refer to the same tree.
#[derive(Clone)]
pub struct InMemoryCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.shared.tree.lock();
        f.debug_struct("InMemoryCoordinator")
            .field("nodes", &tree.nodes.len())
            .field("sessions", &tree.live_sessions.len())
            .field("available", &self.shared.available.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree::new()),
                available: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new, not yet connected session against this tree.
    #[must_use]
    pub fn session(&self) -> InMemorySession {
        InMemorySession {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_session.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Expire a session as the service would after a missed heartbeat.
    ///
    /// Returns the number of ephemeral nodes removed.
    pub fn expire_session(&self, session: u64) -> usize {
        let removed = self.shared.tree.lock().end_session(session);
        tracing::debug!(session, removed, "in-memory session expired");
        removed
    }

    /// Make the service (un)reachable for every session.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make every children listing of `path` fail with `err` until cleared.
    pub fn inject_children_error(&self, path: &str, err: CoordError) {
        self.shared
            .tree
            .lock()
            .injected
            .insert(path.to_owned(), err);
    }

    pub fn clear_injected_error(&self, path: &str) {
        self.shared.tree.lock().injected.remove(path);
    }

    /// Remove a node (and its subtree) regardless of ownership.
    ///
    /// Returns `false` when the node did not exist.
    pub fn remove(&self, target: &str) -> bool {
        let mut tree = self.shared.tree.lock();
        if !tree.nodes.contains_key(target) {
            return false;
        }
        let prefix = format!("{target}/");
        let mut doomed: Vec<String> = tree
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        // deepest first so parents observe child removals in order
        doomed.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for p in doomed {
            tree.remove_node(&p);
        }
        tree.remove_node(target);
        true
    }

    #[must_use]
    pub fn exists(&self, target: &str) -> bool {
        self.shared.tree.lock().nodes.contains_key(target)
    }

    /// Child names of `parent`, in name order.
    #[must_use]
    pub fn children(&self, parent: &str) -> Vec<String> {
        self.shared.tree.lock().children_of(parent)
    }

    /// Number of armed watches, for leak checks.
    #[must_use]
    pub fn pending_watches(&self) -> usize {
        let tree = self.shared.tree.lock();
        [&tree.child_watches, &tree.exist_watches]
            .into_iter()
            .flat_map(HashMap::values)
            .flatten()
            .filter(|w| !w.tx.is_closed())
            .count()
    }
}

/// One session against an [`InMemoryCoordinator`].
pub struct InMemorySession {
    shared: Arc<Shared>,
    id: SessionId,
}

impl std::fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySession")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl InMemorySession {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check_live(&self, tree: &Tree) -> Result<(), CoordError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss(
                "coordination service unavailable".to_owned(),
            ));
        }
        if !tree.live_sessions.contains(&self.id) {
            return Err(CoordError::ConnectionLoss(format!(
                "session {} is not connected",
                self.id
            )));
        }
        Ok(())
    }

    fn arm(
        &self,
        watches: &mut HashMap<String, Vec<PendingWatch>>,
        target: &str,
    ) -> WatchSignal {
        // signals dropped before firing, e.g. an exists watch on a path that
        // is never created again
        watches.retain(|_, list| {
            list.retain(|w| !w.tx.is_closed());
            !list.is_empty()
        });
        let (tx, signal) = WatchSignal::channel(target);
        watches.entry(target.to_owned()).or_default().push(PendingWatch {
            session: self.id,
            tx,
        });
        signal
    }
}

fn validate(target: &str) -> Result<(), CoordError> {
    if !target.starts_with('/') || (target.len() > 1 && target.ends_with('/')) {
        return Err(CoordError::Other(format!("invalid path: {target}")));
    }
    Ok(())
}

#[async_trait]
impl CoordinationClient for InMemorySession {
    async fn connect(&self) -> Result<(), CoordError> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(CoordError::ConnectionLoss(
                "coordination service unavailable".to_owned(),
            ));
        }
        self.shared.tree.lock().live_sessions.insert(self.id);
        Ok(())
    }

    async fn close(&self) {
        let removed = self.shared.tree.lock().end_session(self.id);
        tracing::debug!(session = self.id, removed, "in-memory session closed");
    }

    async fn create(
        &self,
        target: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        validate(target)?;
        let mut tree = self.shared.tree.lock();
        self.check_live(&tree)?;

        let parent = path::parent(target)
            .ok_or_else(|| CoordError::NodeExists(target.to_owned()))?
            .to_owned();
        let actual = {
            let parent_node = tree
                .nodes
                .get_mut(&parent)
                .ok_or_else(|| CoordError::NoNode(parent.clone()))?;
            if parent_node.owner.is_some() {
                return Err(CoordError::Other(format!(
                    "ephemeral node {parent} cannot have children"
                )));
            }
            if mode == CreateMode::EphemeralSequential {
                let seq = parent_node.next_sequence;
                parent_node.next_sequence += 1;
                format!("{target}{seq:010}")
            } else {
                target.to_owned()
            }
        };

        if tree.nodes.contains_key(&actual) {
            return Err(CoordError::NodeExists(actual));
        }
        let owner = mode.is_ephemeral().then_some(self.id);
        tree.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
        tree.on_created(&actual);
        Ok(actual)
    }

    async fn get(&self, target: &str) -> Result<Vec<u8>, CoordError> {
        let tree = self.shared.tree.lock();
        self.check_live(&tree)?;
        tree.nodes
            .get(target)
            .map(|n| n.data.clone())
            .ok_or_else(|| CoordError::NoNode(target.to_owned()))
    }

    async fn children(&self, target: &str) -> Result<Vec<String>, CoordError> {
        let tree = self.shared.tree.lock();
        self.check_live(&tree)?;
        if let Some(err) = tree.injected.get(target) {
            return Err(err.clone());
        }
        if !tree.nodes.contains_key(target) {
            return Err(CoordError::NoNode(target.to_owned()));
        }
        Ok(tree.children_of(target))
    }

    async fn children_w(&self, target: &str) -> Result<(Vec<String>, WatchSignal), CoordError> {
        let mut tree = self.shared.tree.lock();
        self.check_live(&tree)?;
        if let Some(err) = tree.injected.get(target) {
            return Err(err.clone());
        }
        if !tree.nodes.contains_key(target) {
            return Err(CoordError::NoNode(target.to_owned()));
        }
        let children = tree.children_of(target);
        let signal = self.arm(&mut tree.child_watches, target);
        Ok((children, signal))
    }

    async fn exists_w(&self, target: &str) -> Result<(bool, WatchSignal), CoordError> {
        let mut tree = self.shared.tree.lock();
        self.check_live(&tree)?;
        let exists = tree.nodes.contains_key(target);
        let signal = self.arm(&mut tree.exist_watches, target);
        Ok((exists, signal))
    }

    async fn delete(&self, target: &str, version: i32) -> Result<(), CoordError> {
        let mut tree = self.shared.tree.lock();
        self.check_live(&tree)?;
        let node = tree
            .nodes
            .get(target)
            .ok_or_else(|| CoordError::NoNode(target.to_owned()))?;
        if version != -1 && node.version != version {
            return Err(CoordError::BadVersion(target.to_owned()));
        }
        if !tree.children_of(target).is_empty() {
            return Err(CoordError::NotEmpty(target.to_owned()));
        }
        tree.remove_node(target);
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    async fn connected(coord: &InMemoryCoordinator) -> InMemorySession {
        let s = coord.session();
        s.connect().await.unwrap();
        s
    }

    #[tokio::test]
    async fn sequential_nodes_get_increasing_suffixes() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        s.create("/election", b"", CreateMode::Persistent)
            .await
            .unwrap();

        let a = s
            .create("/election/node-", b"a", CreateMode::EphemeralSequential)
            .await
            .unwrap();
        let b = s
            .create("/election/node-", b"b", CreateMode::EphemeralSequential)
            .await
            .unwrap();

        assert_eq!(a, "/election/node-0000000001");
        assert_eq!(b, "/election/node-0000000002");
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        let err = s
            .create("/missing/child", b"x", CreateMode::Ephemeral)
            .await
            .unwrap_err();
        assert_eq!(err, CoordError::NoNode("/missing".to_owned()));
    }

    #[tokio::test]
    async fn child_watch_fires_on_create_and_delete() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        s.create("/root", b"", CreateMode::Persistent).await.unwrap();

        let (children, watch) = s.children_w("/root").await.unwrap();
        assert!(children.is_empty());
        s.create("/root/a", b"1", CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(
            watch.fired().await.kind,
            WatchEventKind::NodeChildrenChanged
        );

        let (children, watch) = s.children_w("/root").await.unwrap();
        assert_eq!(children, vec!["a"]);
        s.delete("/root/a", -1).await.unwrap();
        assert_eq!(
            watch.fired().await.kind,
            WatchEventKind::NodeChildrenChanged
        );
    }

    #[tokio::test]
    async fn session_expiry_removes_ephemerals_and_fires_exists_watch() {
        let coord = InMemoryCoordinator::new();
        let owner = connected(&coord).await;
        let observer = connected(&coord).await;
        owner
            .create("/root", b"", CreateMode::Persistent)
            .await
            .unwrap();
        owner
            .create("/root/e", b"x", CreateMode::Ephemeral)
            .await
            .unwrap();

        let (exists, watch) = observer.exists_w("/root/e").await.unwrap();
        assert!(exists);

        assert_eq!(coord.expire_session(owner.id()), 1);
        assert_eq!(watch.fired().await.kind, WatchEventKind::NodeDeleted);
        assert!(coord.exists("/root"));
        assert!(!coord.exists("/root/e"));
    }

    #[tokio::test]
    async fn closing_a_session_releases_its_watches() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        let (_, watch) = s.children_w("/").await.unwrap();
        assert_eq!(coord.pending_watches(), 1);

        s.close().await;
        assert_eq!(watch.fired().await.kind, WatchEventKind::SessionClosed);
        assert_eq!(coord.pending_watches(), 0);
    }

    #[tokio::test]
    async fn dropped_exists_watches_on_missing_nodes_are_released() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        for i in 0..5 {
            let (exists, watch) = s.exists_w(&format!("/gone-{i}")).await.unwrap();
            assert!(!exists);
            drop(watch);
        }
        assert_eq!(coord.pending_watches(), 0);

        let (_, _live) = s.exists_w("/other").await.unwrap();
        assert_eq!(coord.pending_watches(), 1);
        let tree = coord.shared.tree.lock();
        assert_eq!(tree.exist_watches.len(), 1);
        assert!(tree.exist_watches.contains_key("/other"));
    }

    #[tokio::test]
    async fn unavailable_service_reports_connection_loss() {
        let coord = InMemoryCoordinator::new();
        coord.set_available(false);
        let s = coord.session();
        assert!(matches!(
            s.connect().await,
            Err(CoordError::ConnectionLoss(_))
        ));
    }

    #[tokio::test]
    async fn injected_errors_only_affect_listing() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        s.create("/root", b"", CreateMode::Persistent).await.unwrap();
        coord.inject_children_error("/root", CoordError::Other("denied".to_owned()));

        assert_eq!(
            s.children_w("/root").await.unwrap_err(),
            CoordError::Other("denied".to_owned())
        );
        assert!(s.get("/root").await.is_ok());

        coord.clear_injected_error("/root");
        assert!(s.children("/root").await.is_ok());
    }

    #[tokio::test]
    async fn delete_checks_version_and_children() {
        let coord = InMemoryCoordinator::new();
        let s = connected(&coord).await;
        s.create("/root", b"", CreateMode::Persistent).await.unwrap();
        s.create("/root/a", b"", CreateMode::Persistent)
            .await
            .unwrap();

        assert_eq!(
            s.delete("/root", -1).await.unwrap_err(),
            CoordError::NotEmpty("/root".to_owned())
        );
        assert_eq!(
            s.delete("/root/a", 3).await.unwrap_err(),
            CoordError::BadVersion("/root/a".to_owned())
        );
        s.delete("/root/a", 0).await.unwrap();
        assert!(coord.remove("/root"));
        assert!(!coord.remove("/root"));
    }
}
