//! Leader election derived from the order of ephemeral-sequential
//! registrations.

mod elector;
pub mod role;

pub use elector::{CANDIDATE_PREFIX, Candidate, LeaderCallbacks, LeaderElector};
pub use role::{Role, RoleState, Transition, compute_role};
