//! Coordination service contract consumed by the registration layer.
//!
//! The coordination service is a hierarchical store with ephemeral and
//! sequential nodes and one-shot watches (`ZooKeeper` semantics). Only the
//! subset of operations the substrate needs is modelled here; a local
//! in-process implementation lives in [`memory`].

use async_trait::async_trait;
use tokio::sync::oneshot;

pub mod memory;

pub use memory::{InMemoryCoordinator, InMemorySession};

/// Node creation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the owning session ends.
    Ephemeral,
    /// Ephemeral, with a 10-digit counter appended to the name.
    EphemeralSequential,
}

impl CreateMode {
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        !matches!(self, Self::Persistent)
    }
}

/// Errors reported by a coordination client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// The node does not exist. Discovery loops treat this as transient.
    #[error("node does not exist: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("version mismatch on {0}")]
    BadVersion(String),

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("coordination error: {0}")]
    Other(String),
}

/// What caused a watch to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
    /// The session owning the watch went away before the watch fired.
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

/// One-shot watch handle. Fires once; re-arm by calling the watching
/// operation again.
#[derive(Debug)]
pub struct WatchSignal {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl WatchSignal {
    /// Create a linked sender/signal pair for `path`.
    #[must_use]
    pub fn channel(path: &str) -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                path: path.to_owned(),
                rx,
            },
        )
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait until the watch fires.
    ///
    /// A dropped sender is reported as [`WatchEventKind::SessionClosed`].
    pub async fn fired(self) -> WatchEvent {
        let path = self.path;
        self.rx.await.unwrap_or(WatchEvent {
            kind: WatchEventKind::SessionClosed,
            path,
        })
    }
}

/// Client of a hierarchical coordination service.
///
/// One client corresponds to one session: ephemeral nodes created through it
/// disappear when the session is closed or expires.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Establish the session.
    async fn connect(&self) -> Result<(), CoordError>;

    /// Close the session, removing its ephemeral nodes.
    async fn close(&self);

    /// Create a node and return its actual path.
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode)
    -> Result<String, CoordError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, CoordError>;

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// List children and arm a watch that fires when the child set changes
    /// or the node is deleted.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, WatchSignal), CoordError>;

    /// Check existence and arm a watch that fires on creation, deletion or
    /// data change of `path`.
    async fn exists_w(&self, path: &str) -> Result<(bool, WatchSignal), CoordError>;

    /// Delete a node. `version == -1` matches any version.
    async fn delete(&self, path: &str, version: i32) -> Result<(), CoordError>;
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_sender_reports_session_closed() {
        let (tx, signal) = WatchSignal::channel("/a");
        drop(tx);
        let ev = signal.fired().await;
        assert_eq!(ev.kind, WatchEventKind::SessionClosed);
        assert_eq!(ev.path, "/a");
    }

    #[tokio::test]
    async fn signal_delivers_event() {
        let (tx, signal) = WatchSignal::channel("/a");
        tx.send(WatchEvent {
            kind: WatchEventKind::NodeDeleted,
            path: "/a".to_owned(),
        })
        .unwrap();
        assert_eq!(signal.fired().await.kind, WatchEventKind::NodeDeleted);
    }
}
