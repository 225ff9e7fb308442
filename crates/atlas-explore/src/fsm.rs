//! Exploration phases and their legal transitions.
//!
//! ```text
//! Idle         → Locating | Testing | Completed
//! Locating     → Analyzing | Deciding | Error
//! Analyzing    → Deciding | Error
//! Deciding     → Acting | Backtracking | Completed | Error
//! Acting       → Reflecting | Error
//! Reflecting   → Locating | Deciding | Backtracking | Error
//! Backtracking → Locating | Deciding | Completed | Error
//! Testing      → Teleporting | Completed | Error
//! Teleporting  → Testing | Completed | Error
//! Error        → Idle | Completed
//! Completed    (terminal)
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Resolve the page the browser shows to a node.
    Locating,
    /// Ask page understanding for tasks on a new node.
    Analyzing,
    /// Pick the next task for the current node.
    Deciding,
    Acting,
    /// Judge whether the last action changed state.
    Reflecting,
    Backtracking,
    Testing,
    Teleporting,
    Completed,
    Error,
}

impl Phase {
    pub const ALL: [Phase; 11] = [
        Phase::Idle,
        Phase::Locating,
        Phase::Analyzing,
        Phase::Deciding,
        Phase::Acting,
        Phase::Reflecting,
        Phase::Backtracking,
        Phase::Testing,
        Phase::Teleporting,
        Phase::Completed,
        Phase::Error,
    ];

    /// Phases reachable from `self` through [`ExplorerFsm::transition`].
    pub fn successors(self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Idle => &[Locating, Testing, Completed],
            Locating => &[Analyzing, Deciding, Error],
            Analyzing => &[Deciding, Error],
            Deciding => &[Acting, Backtracking, Completed, Error],
            Acting => &[Reflecting, Error],
            Reflecting => &[Locating, Deciding, Backtracking, Error],
            Backtracking => &[Locating, Deciding, Completed, Error],
            Testing => &[Teleporting, Completed, Error],
            Teleporting => &[Testing, Completed, Error],
            Error => &[Idle, Completed],
            Completed => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        self == Phase::Completed
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locating => "locating",
            Self::Analyzing => "analyzing",
            Self::Deciding => "deciding",
            Self::Acting => "acting",
            Self::Reflecting => "reflecting",
            Self::Backtracking => "backtracking",
            Self::Testing => "testing",
            Self::Teleporting => "teleporting",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// An attempted transition that is not in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid phase transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    /// Set when the transition bypassed the table (see [`ExplorerFsm::terminate`]).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The phase state machine of one exploration session.
#[derive(Debug, Clone)]
pub struct ExplorerFsm {
    current: Phase,
    previous: Option<Phase>,
    history: Vec<TransitionRecord>,
    history_limit: Option<usize>,
}

impl ExplorerFsm {
    pub fn new() -> Self {
        Self {
            current: Phase::Idle,
            previous: None,
            history: Vec::new(),
            history_limit: None,
        }
    }

    /// Keep only the most recent `limit` transitions.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn previous(&self) -> Option<Phase> {
        self.previous
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn can_transition(&self, to: Phase) -> bool {
        self.current.successors().contains(&to)
    }

    /// Move to `to` if the table allows it. A rejected transition leaves
    /// the machine untouched.
    pub fn transition(&mut self, to: Phase) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            tracing::warn!(from = %self.current, to = %to, "rejected phase transition");
            return Err(InvalidTransition {
                from: self.current,
                to,
            });
        }
        tracing::debug!(from = %self.current, to = %to, "phase transition");
        self.record(to, false, None);
        Ok(())
    }

    /// Force `Completed` from any non-terminal phase, e.g. when a bound is
    /// reached mid-cycle. Returns `false` if already completed.
    pub fn terminate(&mut self, reason: &str) -> bool {
        if self.current.is_terminal() {
            return false;
        }
        tracing::debug!(from = %self.current, reason, "forced completion");
        self.record(Phase::Completed, true, Some(reason.to_string()));
        true
    }

    /// Back to `Idle` with an empty history.
    pub fn reset(&mut self) {
        self.current = Phase::Idle;
        self.previous = None;
        self.history.clear();
    }

    fn record(&mut self, to: Phase, forced: bool, reason: Option<String>) {
        self.history.push(TransitionRecord {
            from: self.current,
            to,
            at: Utc::now(),
            forced,
            reason,
        });
        if let Some(limit) = self.history_limit {
            let excess = self.history.len().saturating_sub(limit);
            self.history.drain(..excess);
        }
        self.previous = Some(self.current);
        self.current = to;
    }
}

impl Default for ExplorerFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle() {
        let fsm = ExplorerFsm::new();
        assert_eq!(fsm.current(), Phase::Idle);
        assert_eq!(fsm.previous(), None);
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_rejects_idle_to_acting() {
        let mut fsm = ExplorerFsm::new();
        let err = fsm.transition(Phase::Acting).unwrap_err();
        assert_eq!(
            err,
            InvalidTransition {
                from: Phase::Idle,
                to: Phase::Acting
            }
        );
        assert_eq!(fsm.current(), Phase::Idle);
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_exploration_cycle() {
        let mut fsm = ExplorerFsm::new();
        for phase in [
            Phase::Locating,
            Phase::Analyzing,
            Phase::Deciding,
            Phase::Acting,
            Phase::Reflecting,
            Phase::Locating,
            Phase::Deciding,
            Phase::Backtracking,
            Phase::Completed,
        ] {
            fsm.transition(phase).unwrap();
        }
        assert_eq!(fsm.previous(), Some(Phase::Backtracking));
        assert_eq!(fsm.history().len(), 9);
        assert!(fsm.history().iter().all(|r| !r.forced));
    }

    #[test]
    fn test_completed_has_no_exits() {
        for to in Phase::ALL {
            let mut fsm = ExplorerFsm::new();
            fsm.transition(Phase::Completed).unwrap();
            assert!(fsm.transition(to).is_err(), "completed -> {to}");
        }
    }

    #[test]
    fn test_error_recovers_to_idle() {
        let mut fsm = ExplorerFsm::new();
        fsm.transition(Phase::Locating).unwrap();
        fsm.transition(Phase::Error).unwrap();
        assert!(!fsm.can_transition(Phase::Locating));
        fsm.transition(Phase::Idle).unwrap();
        fsm.transition(Phase::Locating).unwrap();
    }

    #[test]
    fn test_testing_and_teleporting_alternate() {
        let mut fsm = ExplorerFsm::new();
        fsm.transition(Phase::Testing).unwrap();
        fsm.transition(Phase::Teleporting).unwrap();
        fsm.transition(Phase::Testing).unwrap();
        assert!(fsm.transition(Phase::Acting).is_err());
        fsm.transition(Phase::Completed).unwrap();
    }

    #[test]
    fn test_terminate_is_forced_and_recorded() {
        let mut fsm = ExplorerFsm::new();
        fsm.transition(Phase::Locating).unwrap();
        fsm.transition(Phase::Analyzing).unwrap();
        assert!(!fsm.can_transition(Phase::Completed));

        assert!(fsm.terminate("node limit"));
        assert_eq!(fsm.current(), Phase::Completed);
        let last = fsm.history().last().unwrap();
        assert!(last.forced);
        assert_eq!(last.reason.as_deref(), Some("node limit"));
        assert!(!fsm.terminate("again"));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut fsm = ExplorerFsm::new();
        fsm.transition(Phase::Locating).unwrap();
        fsm.reset();
        assert_eq!(fsm.current(), Phase::Idle);
        assert_eq!(fsm.previous(), None);
        assert!(fsm.history().is_empty());
    }

    #[test]
    fn test_history_limit_keeps_latest() {
        let mut fsm = ExplorerFsm::new().with_history_limit(2);
        fsm.transition(Phase::Locating).unwrap();
        fsm.transition(Phase::Analyzing).unwrap();
        fsm.transition(Phase::Deciding).unwrap();
        let tos: Vec<Phase> = fsm.history().iter().map(|r| r.to).collect();
        assert_eq!(tos, vec![Phase::Analyzing, Phase::Deciding]);
    }
}
