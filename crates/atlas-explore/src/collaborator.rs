//! Interfaces to the parts of exploration that live outside the engine.
//!
//! The engine only ever talks to these traits. Backends (a real browser
//! driver, a vision model, test stubs) implement them; the orchestrator
//! bounds every call with the configured timeouts.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use atlas_ir::types::{AnalysisReport, ExecutionOutcome, PageSnapshot, Task, TrajectoryLabel};

use crate::CollaboratorError;

/// Where and why an intent is executed.
#[derive(Debug, Clone)]
pub struct IntentContext {
    pub node_id: String,
    pub url: String,
    pub task: Task,
}

/// Everything the trajectory judge sees about one executed action.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub screenshot_before: Option<String>,
    pub action_description: String,
    pub screenshot_after: Option<String>,
    pub dom_before: String,
    pub dom_after: String,
}

/// Browser automation driver.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), CollaboratorError>;

    async fn page_snapshot(&self) -> Result<PageSnapshot, CollaboratorError>;

    /// Capture the page and return a reference to the image.
    async fn screenshot(&self) -> Result<String, CollaboratorError>;

    /// Carry out `intent`. A reported failure is still an `Ok` outcome;
    /// `Err` means the driver itself broke.
    async fn execute_intent(
        &self,
        intent: &str,
        context: &IntentContext,
    ) -> Result<ExecutionOutcome, CollaboratorError>;

    /// Persist a replay script for the last executed action at `path`.
    async fn save_script(&self, path: &Path, label: &TrajectoryLabel) -> Result<(), CollaboratorError>;

    /// Browser history back.
    async fn go_back(&self) -> Result<(), CollaboratorError>;

    /// Replay a script previously written by [`save_script`](Browser::save_script).
    async fn replay_script(&self, path: &Path) -> Result<(), CollaboratorError>;
}

/// Page understanding: proposes frontier tasks and test ideas.
#[async_trait]
pub trait PageAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        screenshot: &str,
        dom_summary: &str,
        url: &str,
    ) -> Result<AnalysisReport, CollaboratorError>;
}

/// Trajectory judgment: did an action produce a meaningful state change?
#[async_trait]
pub trait TrajectoryJudge: Send + Sync {
    async fn label(&self, trajectory: &Trajectory) -> Result<TrajectoryLabel, CollaboratorError>;
}

/// The three collaborators of one session.
#[derive(Clone)]
pub struct Collaborators {
    pub browser: Arc<dyn Browser>,
    pub analyzer: Arc<dyn PageAnalyzer>,
    pub judge: Arc<dyn TrajectoryJudge>,
}

/// Run a collaborator call under a deadline. Timing out is an error, never
/// a retry.
pub(crate) async fn bounded<T>(
    collaborator: &'static str,
    operation: &'static str,
    after: Duration,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(collaborator, operation, ?after, "collaborator call timed out");
            Err(CollaboratorError::Timeout {
                collaborator,
                operation,
                after,
            })
        }
    }
}
