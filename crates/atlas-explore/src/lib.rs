//! The exploration engine: a phase state machine driving the browser,
//! page-understanding and trajectory-judgment collaborators over an atlas.

use std::time::Duration;

pub mod collaborator;
pub mod fsm;
pub mod limits;
pub mod orchestrator;

pub use collaborator::{
    Browser, Collaborators, IntentContext, PageAnalyzer, Trajectory, TrajectoryJudge,
};
pub use fsm::{ExplorerFsm, InvalidTransition, Phase, TransitionRecord};
pub use limits::{ExplorationLimits, StopReason};
pub use orchestrator::{CancelHandle, Explorer, RunResult};

/// A collaborator call failed or did not finish in time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{collaborator} failed: {message}")]
    Failed {
        collaborator: &'static str,
        message: String,
    },

    #[error("{collaborator} timed out during {operation} after {after:?}")]
    Timeout {
        collaborator: &'static str,
        operation: &'static str,
        after: Duration,
    },
}

impl CollaboratorError {
    pub fn failed(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            collaborator,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExploreError {
    #[error(transparent)]
    Store(#[from] atlas_store::StoreError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("No replay script for action '{action}' out of {node_id}")]
    MissingScript { node_id: String, action: String },

    #[error("Arrived at {actual} instead of {expected}")]
    WrongDestination { expected: String, actual: String },

    #[error("No current state in phase {0}")]
    NoCurrentState(Phase),

    #[error("Exploration loop cannot run in phase {0}")]
    UnexpectedPhase(Phase),
}

pub type Result<T> = std::result::Result<T, ExploreError>;
