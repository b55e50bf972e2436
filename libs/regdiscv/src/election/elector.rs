use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::role::{Role, RoleState, Transition, compute_role};
use crate::error::{Error, Result};
use crate::path;
use crate::service::{RegDiscv, RegisterMode};
use crate::types::ServerInfo;

/// Name prefix of candidate nodes below the election path.
pub const CANDIDATE_PREFIX: &str = "node-";

/// Hooks invoked on leadership edges.
///
/// Both run on the elector task and should return quickly; long-running
/// leader work belongs in a task that watches the `stop` token.
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Became leader. `stop` is cancelled as soon as leadership is lost or
    /// the elector shuts down.
    fn on_started_leading(&self, stop: CancellationToken);

    /// Lost leadership.
    fn on_stopped_leading(&self);
}

/// Payload registered by a candidate.
///
/// The id makes the payload unique so that an elector recognises its own
/// node even when several candidates share an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: Uuid,
    #[serde(flatten)]
    pub server: ServerInfo,
}

impl Candidate {
    #[must_use]
    pub fn new(server: ServerInfo) -> Self {
        Self {
            id: Uuid::now_v7(),
            server,
        }
    }

    /// JSON payload to register.
    ///
    /// # Errors
    /// Returns `Error::Decode` if serialization fails.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Decode {
            module: "candidate".to_owned(),
            message: e.to_string(),
        })
    }
}

/// Leader election over ephemeral-sequential registrations.
///
/// The candidate with the lowest sequence number below the election path is
/// the leader; everyone else registered is a slave.
pub struct LeaderElector<C> {
    regdiscv: RegDiscv,
    election_path: String,
    payload: String,
    callbacks: Arc<C>,
    role_tx: watch::Sender<Role>,
}

impl<C> std::fmt::Debug for LeaderElector<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("election_path", &self.election_path)
            .field("role", &*self.role_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl<C: LeaderCallbacks> LeaderElector<C> {
    /// `payload` must be unique among the candidates of `election_path`.
    #[must_use]
    pub fn new(
        regdiscv: RegDiscv,
        election_path: impl Into<String>,
        payload: impl Into<String>,
        callbacks: Arc<C>,
    ) -> Self {
        let (role_tx, _) = watch::channel(Role::Nobody);
        Self {
            regdiscv,
            election_path: election_path.into(),
            payload: payload.into(),
            callbacks,
            role_tx,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    /// Receiver notified on every role change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Take part in the election until `cancel` fires or the registration
    /// service stops.
    ///
    /// On exit the candidate node is removed and, if leading, leadership is
    /// given up.
    pub async fn run(&self, cancel: &CancellationToken) {
        let prefix = path::join(&self.election_path, CANDIDATE_PREFIX);
        let registration = self.regdiscv.register_and_watch(
            &prefix,
            self.payload.as_bytes().to_vec(),
            RegisterMode::Sequential,
        );
        let mut states = self
            .regdiscv
            .watch_service_state(&self.election_path, &self.payload);
        let mut roles = RoleState::new();
        tracing::info!(election_path = %self.election_path, "joined election");

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                state = states.recv() => state,
            };
            let Some(state) = next else { break };
            let role = compute_role(state.my_position);
            tracing::debug!(
                election_path = %self.election_path,
                position = state.my_position,
                candidates = state.node_count,
                %role,
                "election state"
            );
            self.apply(&mut roles, role, cancel);
        }

        self.apply(&mut roles, Role::Nobody, cancel);
        registration.shutdown().await;
        tracing::info!(election_path = %self.election_path, "left election");
    }

    fn apply(&self, roles: &mut RoleState, next: Role, cancel: &CancellationToken) {
        let prev = roles.role();
        match roles.apply(next, cancel) {
            Transition::StartedLeading(stop) => {
                tracing::info!(election_path = %self.election_path, "started leading");
                self.callbacks.on_started_leading(stop);
            }
            Transition::StoppedLeading => {
                tracing::warn!(election_path = %self.election_path, %next, "stopped leading");
                self.callbacks.on_stopped_leading();
            }
            Transition::Unchanged => {}
        }
        if prev != next {
            self.role_tx.send_replace(next);
        }
    }
}
