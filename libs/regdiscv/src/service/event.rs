use crate::error::Error;

/// Snapshot of a watched path, emitted once per watch fire.
///
/// Always carries the full current child set, never a diff.
#[derive(Debug, Clone, Default)]
pub struct DiscoverEvent {
    /// Watched path.
    pub key: String,
    /// Raw child names, in the order the coordination service listed them.
    pub nodes: Vec<String>,
    /// Payloads of the children that carry one.
    pub server: Vec<String>,
    /// Set when the watch failed; the emitting loop has stopped.
    pub err: Option<Error>,
}

impl DiscoverEvent {
    pub(crate) fn failed(key: &str, err: Error) -> Self {
        Self {
            key: key.to_owned(),
            err: Some(err),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// Rank of one payload among the sequence-ordered siblings of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub node_count: usize,
    pub node_payloads: Vec<String>,
    /// Index of our payload in `node_payloads`, `-1` when absent.
    pub my_position: i64,
}

impl ServiceState {
    #[must_use]
    pub fn new(node_payloads: Vec<String>, mine: &str) -> Self {
        let my_position = node_payloads
            .iter()
            .position(|p| p == mine)
            .and_then(|idx| i64::try_from(idx).ok())
            .unwrap_or(-1);
        Self {
            node_count: node_payloads.len(),
            node_payloads,
            my_position,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn position_of_own_payload() {
        let payloads = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        let state = ServiceState::new(payloads.clone(), "b");
        assert_eq!(state.node_count, 3);
        assert_eq!(state.my_position, 1);

        assert_eq!(ServiceState::new(payloads, "zz").my_position, -1);
        assert_eq!(ServiceState::new(Vec::new(), "a").my_position, -1);
    }
}
