use tokio_util::sync::CancellationToken;

/// Role of an elector derived from its rank among the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Not registered (or not visible) in the candidate list.
    #[default]
    Nobody,
    Slave,
    Leader,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nobody => "nobody",
            Self::Slave => "slave",
            Self::Leader => "leader",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role for a candidate at `position` in the sequence-ordered list.
#[must_use]
pub fn compute_role(position: i64) -> Role {
    match position {
        0 => Role::Leader,
        p if p > 0 => Role::Slave,
        _ => Role::Nobody,
    }
}

/// Edge produced by [`RoleState::apply`].
#[derive(Debug)]
pub enum Transition {
    /// Entered `Leader`; the token is cancelled when leadership ends.
    StartedLeading(CancellationToken),
    /// Left `Leader`.
    StoppedLeading,
    /// No leadership change.
    Unchanged,
}

/// Current role plus the token handed to the leader callback.
#[derive(Debug, Default)]
pub struct RoleState {
    role: Role,
    leading: Option<CancellationToken>,
}

impl RoleState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Move to `next`. Leaving `Leader` cancels the leadership token before
    /// returning.
    pub fn apply(&mut self, next: Role, parent: &CancellationToken) -> Transition {
        let prev = std::mem::replace(&mut self.role, next);
        match (prev == Role::Leader, next == Role::Leader) {
            (false, true) => {
                let token = parent.child_token();
                self.leading = Some(token.clone());
                Transition::StartedLeading(token)
            }
            (true, false) => {
                if let Some(token) = self.leading.take() {
                    token.cancel();
                }
                Transition::StoppedLeading
            }
            _ => Transition::Unchanged,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn role_from_position() {
        assert_eq!(compute_role(0), Role::Leader);
        assert_eq!(compute_role(1), Role::Slave);
        assert_eq!(compute_role(42), Role::Slave);
        assert_eq!(compute_role(-1), Role::Nobody);
        assert_eq!(compute_role(-5), Role::Nobody);
    }

    #[test]
    fn transitions_fire_only_on_leader_edges() {
        let parent = CancellationToken::new();
        let mut state = RoleState::new();
        assert_eq!(state.role(), Role::Nobody);

        assert!(matches!(state.apply(Role::Slave, &parent), Transition::Unchanged));
        let Transition::StartedLeading(token) = state.apply(Role::Leader, &parent) else {
            panic!("expected leadership start");
        };
        assert!(matches!(state.apply(Role::Leader, &parent), Transition::Unchanged));
        assert!(!token.is_cancelled());

        assert!(matches!(state.apply(Role::Slave, &parent), Transition::StoppedLeading));
        assert!(token.is_cancelled());
        assert!(matches!(state.apply(Role::Nobody, &parent), Transition::Unchanged));
    }

    #[test]
    fn parent_cancellation_reaches_leader_token() {
        let parent = CancellationToken::new();
        let mut state = RoleState::new();
        let Transition::StartedLeading(token) = state.apply(Role::Leader, &parent) else {
            panic!("expected leadership start");
        };
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
