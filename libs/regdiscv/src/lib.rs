#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Service registration, module discovery and leader election
//!
//! This library lets platform components find each other through a
//! hierarchical coordination service with ephemeral and sequential nodes:
//! - [`RegDiscv`] registers payloads (optionally self-healing) and watches
//!   the children of a path
//! - [`ModuleDiscovery`] walks the registration tree and keeps a typed server
//!   list per module
//! - [`LeaderElector`] ranks ephemeral-sequential candidates and drives the
//!   leader/slave role
//!
//! The coordination service is consumed through [`CoordinationClient`];
//! [`InMemoryCoordinator`] provides an in-process implementation.

pub mod backoff;
pub mod config;
pub mod coordination;
pub mod discovery;
pub mod election;
pub mod error;
pub mod path;
pub mod service;
pub mod types;

pub use backoff::Backoff;
pub use config::{BackoffConfig, RegDiscvConfig};
pub use coordination::{
    CoordError, CoordinationClient, CreateMode, InMemoryCoordinator, InMemorySession, WatchEvent,
    WatchEventKind, WatchSignal,
};
pub use discovery::{CodecRegistry, DiscoveryFatal, DiscoveryOptions, ModuleDiscovery};
pub use election::{Candidate, LeaderCallbacks, LeaderElector, Role, compute_role};
pub use error::{Error, Result};
pub use service::{
    DiscoverEvent, RegDiscv, RegisterMode, RegistrationHandle, ServiceState, StateReceiver,
};
pub use types::ServerInfo;
