//! Registration and discovery over a [`CoordinationClient`].
//!
//! [`RegDiscv`] owns one coordination session and a root cancellation token.
//! Every background loop it spawns (self-healing registrations, discovery
//! watches, service-state subscriptions) runs on a child of that token and
//! exits on `stop()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::RegDiscvConfig;
use crate::coordination::{CoordError, CoordinationClient, CreateMode};
use crate::error::{Error, Result};
use crate::path;

pub mod event;
pub mod state_queue;

pub use event::{DiscoverEvent, ServiceState};
pub use state_queue::{StateReceiver, StateSender, state_queue};

/// How a self-healing registration names its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Plain ephemeral node at the exact key.
    Ephemeral,
    /// Ephemeral-sequential node; the key is used as name prefix.
    Sequential,
}

impl From<RegisterMode> for CreateMode {
    fn from(mode: RegisterMode) -> Self {
        match mode {
            RegisterMode::Ephemeral => Self::Ephemeral,
            RegisterMode::Sequential => Self::EphemeralSequential,
        }
    }
}

struct Inner {
    client: Arc<dyn CoordinationClient>,
    cfg: RegDiscvConfig,
    cancel: CancellationToken,
    started: AtomicBool,
}

/// Registration/discovery service bound to one coordination session.
///
/// Cheap to clone; clones share the session and the root token.
#[derive(Clone)]
pub struct RegDiscv {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RegDiscv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegDiscv")
            .field("hosts", &self.inner.cfg.hosts)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RegDiscv {
    #[must_use]
    pub fn new(client: Arc<dyn CoordinationClient>, cfg: RegDiscvConfig) -> Self {
        Self::with_cancel(client, cfg, &CancellationToken::new())
    }

    /// Create a service whose root token is a child of `parent`.
    #[must_use]
    pub fn with_cancel(
        client: Arc<dyn CoordinationClient>,
        cfg: RegDiscvConfig,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                cfg,
                cancel: parent.child_token(),
                started: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RegDiscvConfig {
        &self.inner.cfg
    }

    /// A token cancelled when this service stops.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.child_token()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }

    /// Connect the coordination session.
    ///
    /// # Errors
    /// `Error::Connection` if the coordination service is unreachable,
    /// `Error::NotStarted` if the service was already stopped.
    pub async fn start(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::NotStarted);
        }
        if self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.client.connect().await.map_err(|e| match e {
            CoordError::ConnectionLoss(msg) => Error::Connection(msg),
            other => Error::Connection(other.to_string()),
        })?;
        self.inner.started.store(true, Ordering::SeqCst);
        tracing::info!(hosts = ?self.inner.cfg.hosts, "registration service started");
        Ok(())
    }

    /// Cancel every background loop and close the session.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        if self.inner.started.swap(false, Ordering::SeqCst) {
            self.inner.client.close().await;
            tracing::info!("registration service stopped");
        }
    }

    /// Register `data` as a plain ephemeral node at `key`.
    ///
    /// Missing parents are created as persistent nodes.
    ///
    /// # Errors
    /// `Error::NotStarted`, `Error::Connection` or `Error::Write`.
    pub async fn register(&self, key: &str, data: &[u8]) -> Result<String> {
        self.inner.create(key, data, CreateMode::Ephemeral).await
    }

    /// Register `data` as an ephemeral-sequential node named `{prefix}NNNNNNNNNN`.
    ///
    /// # Errors
    /// `Error::NotStarted`, `Error::Connection` or `Error::Write`.
    pub async fn register_sequential(&self, prefix: &str, data: &[u8]) -> Result<String> {
        self.inner
            .create(prefix, data, CreateMode::EphemeralSequential)
            .await
    }

    /// Keep `data` registered at `key` in the background.
    ///
    /// The node is re-created whenever it disappears. Failures are logged and
    /// retried with backoff; nothing is reported to the caller.
    #[must_use]
    pub fn register_and_watch(
        &self,
        key: &str,
        data: Vec<u8>,
        mode: RegisterMode,
    ) -> RegistrationHandle {
        let cancel = self.inner.cancel.child_token();
        let (path_tx, path_rx) = watch::channel(None);
        let registration = Registration {
            inner: Arc::clone(&self.inner),
            key: key.to_owned(),
            data,
            mode,
            path_tx,
            cancel: cancel.clone(),
            backoff: Backoff::new(self.inner.cfg.retry.clone()),
        };
        let task = tokio::spawn(registration.run());
        RegistrationHandle {
            path: path_rx,
            cancel,
            task,
        }
    }

    /// Watch the children of `key`.
    ///
    /// Emits one [`DiscoverEvent`] per change with the sequence-ordered
    /// payloads. A missing node is retried silently; any other listing error
    /// is delivered once in `err` and ends the stream.
    #[must_use]
    pub fn discover(&self, key: &str) -> mpsc::Receiver<DiscoverEvent> {
        let (tx, rx) = mpsc::channel(self.inner.cfg.event_buffer.max(1));
        tokio::spawn(discover_loop(
            Arc::clone(&self.inner),
            key.to_owned(),
            tx,
            self.inner.cancel.child_token(),
        ));
        rx
    }

    /// One-shot, sequence-ordered listing of `key`. Errors are reported in
    /// the event.
    pub async fn discover_nodes(&self, key: &str) -> DiscoverEvent {
        match self.inner.client.children(key).await {
            Ok(children) => self.inner.ordered_event(key, children).await,
            Err(e) => DiscoverEvent::failed(key, Error::watch(key, e)),
        }
    }

    /// One-shot listing of every child of `key` that carries a payload, in
    /// child-name order. Errors are reported in the event.
    pub async fn discover_nodes_v2(&self, key: &str) -> DiscoverEvent {
        match self.inner.client.children(key).await {
            Ok(children) => self.inner.full_event(key, children).await,
            Err(e) => DiscoverEvent::failed(key, Error::watch(key, e)),
        }
    }

    /// Follow the rank of `my_payload` among the sequential children of `key`.
    ///
    /// The returned queue keeps the newest states; when it is over half full
    /// the oldest buffered state is dropped.
    #[must_use]
    pub fn watch_service_state(&self, key: &str, my_payload: &str) -> StateReceiver<ServiceState> {
        let (tx, rx) = state_queue(self.inner.cfg.state_buffer);
        let this = self.clone();
        let key = key.to_owned();
        let mine = my_payload.to_owned();
        let cancel = self.inner.cancel.child_token();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(this.inner.cfg.retry.clone());
            'subscribe: loop {
                let mut events = this.discover(&key);
                loop {
                    let next = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break 'subscribe,
                        () = tx.closed() => break 'subscribe,
                        ev = events.recv() => ev,
                    };
                    let Some(ev) = next else { break };
                    if let Some(err) = ev.err {
                        tracing::warn!(path = %key, error = %err, "service state watch failed, resubscribing");
                        break;
                    }
                    backoff.reset();
                    let state = ServiceState::new(ev.server, &mine);
                    tracing::debug!(
                        path = %key,
                        position = state.my_position,
                        count = state.node_count,
                        "service state changed"
                    );
                    if tx.push(state) {
                        tracing::debug!(path = %key, "service state queue over half full, dropped oldest");
                    }
                    if tx.is_closed() {
                        break 'subscribe;
                    }
                }
                if !backoff.wait(&cancel).await {
                    break;
                }
            }
            tracing::debug!(path = %key, "service state subscription ended");
        });
        rx
    }
}

impl Inner {
    async fn create(&self, key: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        if !self.started.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return Err(Error::NotStarted);
        }
        self.ensure_parents(key).await?;
        let actual = self
            .client
            .create(key, data, mode)
            .await
            .map_err(|e| Error::write(key, e))?;
        tracing::info!(path = %actual, ?mode, "registered node");
        Ok(actual)
    }

    async fn ensure_parents(&self, key: &str) -> Result<()> {
        let mut missing = Vec::new();
        let mut cur = path::parent(key);
        while let Some(p) = cur {
            if p == "/" {
                break;
            }
            missing.push(p.to_owned());
            cur = path::parent(p);
        }
        for p in missing.iter().rev() {
            match self.client.create(p, &[], CreateMode::Persistent).await {
                Ok(_) | Err(CoordError::NodeExists(_)) => {}
                Err(e) => return Err(Error::write(p.clone(), e)),
            }
        }
        Ok(())
    }

    async fn reconnect(&self) {
        if !self.started.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }
        if let Err(e) = self.client.connect().await {
            tracing::warn!(error = %e, "coordination reconnect failed");
        }
    }

    async fn payload(&self, parent: &str, child: &str) -> Option<String> {
        let full = path::join(parent, child);
        let data = match self.client.get(&full).await {
            Ok(data) => data,
            // removed between listing and read
            Err(CoordError::NoNode(_)) => return None,
            Err(e) => {
                tracing::warn!(path = %full, error = %e, "failed to read payload");
                return None;
            }
        };
        if data.is_empty() {
            return None;
        }
        String::from_utf8(data)
            .inspect_err(|e| tracing::warn!(path = %full, error = %e, "dropping non-utf8 payload"))
            .ok()
    }

    /// Sequence-ordered view: children without a counter are left out of
    /// `server`.
    async fn ordered_event(&self, key: &str, children: Vec<String>) -> DiscoverEvent {
        let ordered = path::order_by_sequence(&children);
        self.snapshot(key, children, &ordered).await
    }

    /// Full view in child-name order.
    async fn full_event(&self, key: &str, children: Vec<String>) -> DiscoverEvent {
        let mut sorted = children.clone();
        sorted.sort();
        self.snapshot(key, children, &sorted).await
    }

    async fn snapshot(&self, key: &str, nodes: Vec<String>, read: &[String]) -> DiscoverEvent {
        let mut server = Vec::with_capacity(read.len());
        for child in read {
            if let Some(p) = self.payload(key, child).await {
                server.push(p);
            }
        }
        DiscoverEvent {
            key: key.to_owned(),
            nodes,
            server,
            err: None,
        }
    }
}

async fn discover_loop(
    inner: Arc<Inner>,
    key: String,
    tx: mpsc::Sender<DiscoverEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(inner.cfg.retry.clone());
    loop {
        let listed = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = tx.closed() => break,
            r = inner.client.children_w(&key) => r,
        };

        match listed {
            Ok((children, signal)) => {
                backoff.reset();
                let event = inner.ordered_event(&key, children).await;
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = tx.send(event) => if sent.is_err() { break },
                }
                let fired = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tx.closed() => break,
                    ev = signal.fired() => ev,
                };
                tracing::trace!(path = %key, kind = ?fired.kind, "children watch fired");
            }
            Err(CoordError::NoNode(_)) => {
                tracing::debug!(path = %key, "watched node does not exist yet, retrying");
                if !backoff.wait(&cancel).await {
                    break;
                }
            }
            Err(CoordError::ConnectionLoss(msg)) => {
                tracing::warn!(path = %key, error = %msg, "connection lost while watching, retrying");
                inner.reconnect().await;
                if !backoff.wait(&cancel).await {
                    break;
                }
            }
            Err(e) => {
                tracing::error!(path = %key, error = %e, "children watch failed");
                if !cancel.is_cancelled()
                    && tx
                        .send(DiscoverEvent::failed(&key, Error::watch(&key, e)))
                        .await
                        .is_err()
                {
                    tracing::debug!(path = %key, "discover receiver dropped before error delivery");
                }
                break;
            }
        }
    }
    tracing::debug!(path = %key, "discover loop exited");
}

enum RegStep {
    Create,
    Watch(String),
    /// Watching failed after the node was created: remove it before
    /// registering again.
    Cleanup(String),
    Wait,
}

/// State machine behind [`RegDiscv::register_and_watch`].
struct Registration {
    inner: Arc<Inner>,
    key: String,
    data: Vec<u8>,
    mode: RegisterMode,
    path_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    backoff: Backoff,
}

impl Registration {
    async fn run(mut self) {
        let mut step = RegStep::Create;
        while !self.cancel.is_cancelled() {
            let next = match step {
                RegStep::Create => Some(self.create().await),
                RegStep::Watch(actual) => self.watch(actual).await,
                RegStep::Cleanup(actual) => self.cleanup(actual).await,
                RegStep::Wait => self
                    .backoff
                    .wait(&self.cancel)
                    .await
                    .then_some(RegStep::Create),
            };
            let Some(next) = next else { break };
            step = next;
        }
        self.deregister().await;
    }

    async fn create(&self) -> RegStep {
        match self.inner.create(&self.key, &self.data, self.mode.into()).await {
            Ok(actual) => {
                self.path_tx.send_replace(Some(actual.clone()));
                RegStep::Watch(actual)
            }
            Err(e) => {
                // an existing node is left alone; it goes away with its session
                tracing::warn!(path = %self.key, error = %e, "registration failed, will retry");
                if matches!(e, Error::Connection(_)) {
                    self.inner.reconnect().await;
                }
                RegStep::Wait
            }
        }
    }

    /// `None` when cancelled while waiting on the watch.
    async fn watch(&mut self, actual: String) -> Option<RegStep> {
        match self.inner.client.exists_w(&actual).await {
            Ok((true, signal)) => {
                self.backoff.reset();
                let fired = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return None,
                    ev = signal.fired() => ev,
                };
                tracing::debug!(path = %actual, kind = ?fired.kind, "registration watch fired");
                Some(RegStep::Watch(actual))
            }
            Ok((false, _)) => {
                tracing::warn!(path = %actual, "registration node disappeared, re-registering");
                self.path_tx.send_replace(None);
                Some(RegStep::Wait)
            }
            Err(e) => {
                tracing::warn!(path = %actual, error = %e, "registration watch failed");
                if matches!(e, CoordError::ConnectionLoss(_)) {
                    self.inner.reconnect().await;
                }
                Some(RegStep::Cleanup(actual))
            }
        }
    }

    /// Stays in `Cleanup` until the stale node is gone so that a caller
    /// never holds two live registrations. `None` when cancelled.
    async fn cleanup(&mut self, actual: String) -> Option<RegStep> {
        match self.inner.client.delete(&actual, -1).await {
            Ok(()) | Err(CoordError::NoNode(_)) => {
                self.path_tx.send_replace(None);
                Some(RegStep::Wait)
            }
            Err(e) => {
                tracing::warn!(path = %actual, error = %e, "failed to remove stale registration, retrying");
                if matches!(e, CoordError::ConnectionLoss(_)) {
                    self.inner.reconnect().await;
                }
                self.backoff
                    .wait(&self.cancel)
                    .await
                    .then_some(RegStep::Cleanup(actual))
            }
        }
    }

    async fn deregister(self) {
        if let Some(actual) = self.path_tx.send_replace(None)
            && self.inner.started.load(Ordering::SeqCst)
            && let Err(e) = self.inner.client.delete(&actual, -1).await
        {
            tracing::debug!(path = %actual, error = %e, "deregistration failed");
        }
        tracing::debug!(path = %self.key, "registration loop exited");
    }
}

/// Handle of a background registration started by
/// [`RegDiscv::register_and_watch`].
#[derive(Debug)]
pub struct RegistrationHandle {
    path: watch::Receiver<Option<String>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    /// Path of the live node, `None` while (re-)registering.
    #[must_use]
    pub fn current_path(&self) -> Option<String> {
        self.path.borrow().clone()
    }

    /// Receiver notified each time the registered path changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.path.clone()
    }

    /// Stop re-registering and remove the node.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "registration task panicked");
        }
    }
}
