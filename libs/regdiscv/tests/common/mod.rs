#![allow(dead_code)]

//! Shared fixtures for the integration tests.

use std::sync::Arc;
use std::time::Duration;

use regdiscv::{
    BackoffConfig, CoordinationClient, CreateMode, InMemoryCoordinator, InMemorySession, RegDiscv,
    RegDiscvConfig,
};

pub const RETRY_MS: u64 = 50;

pub fn fast_config() -> RegDiscvConfig {
    RegDiscvConfig {
        retry: BackoffConfig::fixed(RETRY_MS),
        ..RegDiscvConfig::default()
    }
}

/// A started service on its own session. Returns the session id so tests can
/// expire it.
pub async fn started(coord: &InMemoryCoordinator, cfg: RegDiscvConfig) -> (RegDiscv, u64) {
    let session = coord.session();
    let id = session.id();
    let svc = RegDiscv::new(Arc::new(session), cfg);
    svc.start().await.expect("start");
    (svc, id)
}

/// Connected administrative session for shaping the tree directly.
pub async fn admin(coord: &InMemoryCoordinator) -> InMemorySession {
    let session = coord.session();
    session.connect().await.expect("admin connect");
    session
}

/// Create `path` and its parents as persistent nodes.
pub async fn mkdirs(session: &InMemorySession, path: &str) {
    let mut cur = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        cur.push('/');
        cur.push_str(segment);
        match session.create(&cur, &[], CreateMode::Persistent).await {
            Ok(_) | Err(regdiscv::CoordError::NodeExists(_)) => {}
            Err(e) => panic!("mkdirs {cur}: {e}"),
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn server_json(ip: &str, port: u16) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({ "ip": ip, "port": port })).expect("json")
}
