//! The exploration loop.
//!
//! One [`Explorer`] drives one browser session. Each loop iteration first
//! checks cancellation and the configured bounds, then runs the handler of
//! the current phase, which performs at most one step of collaborator work
//! and moves the FSM on. Any error escalates to `Error` and ends the run;
//! [`Explorer::run`] still returns the statistics accumulated so far.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use atlas_ir::types::{ExecutionOutcome, Metadata, PageSnapshot, QueueItem, Task, TestIdea};
use atlas_store::fingerprint::{dom_fingerprint, edge_action_name};
use atlas_store::{Atlas, StoreError};

use crate::collaborator::{bounded, Collaborators, IntentContext, Trajectory};
use crate::fsm::{ExplorerFsm, Phase, TransitionRecord};
use crate::limits::{ExplorationLimits, ResourceChecker, StopReason};
use crate::{ExploreError, Result};

/// Cooperative stop signal, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one run. Always produced, even when the run failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub total_nodes: u64,
    pub total_edges: u64,
    pub max_depth_reached: u32,
    pub atlas_path: PathBuf,
    pub errors: Vec<String>,
    pub stop_reason: StopReason,
    pub final_phase: Phase,
    pub iterations: u64,
    /// Distinct nodes this run resolved.
    pub nodes_visited: u64,
    pub tasks_executed: u64,
    pub meaningful_actions: u64,
    pub elapsed_secs: f64,
    pub history: Vec<TransitionRecord>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The node the browser is showing, as last resolved.
struct CurrentState {
    node_id: String,
    snapshot: PageSnapshot,
    screenshot: String,
}

struct ActiveTask {
    source: String,
    task: Task,
    outcome: Option<ExecutionOutcome>,
}

/// An edge judged meaningful whose target is not resolved yet.
#[derive(Debug)]
struct PendingEdge {
    source: String,
    action: String,
}

pub struct Explorer {
    atlas: Atlas,
    collaborators: Collaborators,
    start_url: String,
    limits: ExplorationLimits,
    fsm: ExplorerFsm,
    cancel: CancelHandle,
    current: Option<CurrentState>,
    /// Node ids from the root to the current node.
    trail: Vec<String>,
    pending_edge: Option<PendingEdge>,
    /// Ancestor the last backtrack stepped the browser back to.
    backtrack_target: Option<String>,
    active: Option<ActiveTask>,
    visited: HashSet<String>,
    iterations: u64,
    tasks_executed: u64,
    meaningful_actions: u64,
}

impl Explorer {
    pub fn new(
        atlas: Atlas,
        collaborators: Collaborators,
        start_url: impl Into<String>,
        limits: ExplorationLimits,
    ) -> Self {
        Self {
            atlas,
            collaborators,
            start_url: start_url.into(),
            limits,
            fsm: ExplorerFsm::new(),
            cancel: CancelHandle::new(),
            current: None,
            trail: Vec::new(),
            pending_edge: None,
            backtrack_target: None,
            active: None,
            visited: HashSet::new(),
            iterations: 0,
            tasks_executed: 0,
            meaningful_actions: 0,
        }
    }

    /// Share an externally owned cancel signal.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_fsm(mut self, fsm: ExplorerFsm) -> Self {
        self.fsm = fsm;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        self.fsm.current()
    }

    pub fn fsm(&self) -> &ExplorerFsm {
        &self.fsm
    }

    pub fn atlas(&self) -> &Atlas {
        &self.atlas
    }

    /// Explore from the start URL until nothing is left, a bound is hit,
    /// the run is cancelled or something fails.
    pub async fn run(&mut self) -> RunResult {
        self.fsm.reset();
        self.current = None;
        self.trail.clear();
        self.pending_edge = None;
        self.backtrack_target = None;
        self.active = None;
        self.visited.clear();
        self.iterations = 0;
        self.tasks_executed = 0;
        self.meaningful_actions = 0;

        let checker = ResourceChecker::new(self.limits.clone());
        let mut errors = Vec::new();
        tracing::info!(
            start_url = %self.start_url,
            atlas = %self.atlas.root().display(),
            "exploration started"
        );

        let stop_reason = match self.start().await {
            Err(e) => self.fail(e, &mut errors),
            Ok(()) => loop {
                if self.fsm.current() == Phase::Completed {
                    break StopReason::Completed;
                }
                if self.cancel.is_cancelled() {
                    self.fsm.terminate("cancelled");
                    break StopReason::Cancelled;
                }
                if let Some(reason) = checker.check(self.iterations, self.visited.len() as u64) {
                    self.fsm.terminate(&reason.to_string());
                    break reason;
                }
                self.iterations += 1;
                if let Err(e) = self.step().await {
                    break self.fail(e, &mut errors);
                }
            },
        };

        let stats = self.atlas.registry.statistics();
        let result = RunResult {
            total_nodes: stats.total_nodes,
            total_edges: stats.total_edges,
            max_depth_reached: stats.max_depth,
            atlas_path: self.atlas.root().to_path_buf(),
            errors,
            stop_reason,
            final_phase: self.fsm.current(),
            iterations: self.iterations,
            nodes_visited: self.visited.len() as u64,
            tasks_executed: self.tasks_executed,
            meaningful_actions: self.meaningful_actions,
            elapsed_secs: checker.elapsed_secs(),
            history: self.fsm.history().to_vec(),
        };
        tracing::info!(
            stop_reason = %result.stop_reason,
            nodes = result.total_nodes,
            edges = result.total_edges,
            max_depth = result.max_depth_reached,
            iterations = result.iterations,
            "exploration finished"
        );
        result
    }

    async fn start(&mut self) -> Result<()> {
        self.fsm.transition(Phase::Locating)?;
        bounded(
            "browser",
            "navigate",
            self.limits.page_load_timeout(),
            self.collaborators.browser.navigate(&self.start_url),
        )
        .await?;
        Ok(())
    }

    fn fail(&mut self, error: ExploreError, errors: &mut Vec<String>) -> StopReason {
        let phase = self.fsm.current();
        tracing::warn!(phase = %phase, error = %error, "exploration failed");
        errors.push(format!("{phase}: {error}"));
        if let Err(e) = self.fsm.transition(Phase::Error) {
            tracing::debug!(error = %e, "no error transition from current phase");
        }
        StopReason::Failed
    }

    async fn step(&mut self) -> Result<()> {
        match self.fsm.current() {
            Phase::Locating => self.locate().await,
            Phase::Analyzing => self.analyze().await,
            Phase::Deciding => self.decide(),
            Phase::Acting => self.act().await,
            Phase::Reflecting => self.reflect().await,
            Phase::Backtracking => self.backtrack().await,
            phase => Err(ExploreError::UnexpectedPhase(phase)),
        }
    }

    async fn locate(&mut self) -> Result<()> {
        let timeout = self.limits.page_load_timeout();
        let browser = &self.collaborators.browser;
        let snapshot = bounded("browser", "page_snapshot", timeout, browser.page_snapshot()).await?;
        let screenshot = bounded("browser", "screenshot", timeout, browser.screenshot()).await?;
        let fingerprint = snapshot_fingerprint(&snapshot);

        // Browser history can be deeper than the trail, so stepping back may
        // miss the ancestor. Fall back to replaying its recorded path.
        if let Some(expected) = self.backtrack_target.take() {
            let landed = self.atlas.registry.lookup(&snapshot.url, &fingerprint);
            if landed.as_deref() != Some(expected.as_str()) {
                tracing::warn!(
                    expected = %expected,
                    landed = ?landed,
                    "back navigation missed the ancestor, replaying its path"
                );
                self.replay_path(&expected).await?;
                return Ok(());
            }
        }

        let mut metadata = Metadata::new();
        if !snapshot.title.is_empty() {
            metadata.insert("title".into(), snapshot.title.clone().into());
        }
        let state = self.atlas.registry.ensure_state(
            &snapshot.url,
            &fingerprint,
            Some(&screenshot),
            metadata,
        )?;

        if let Some(edge) = self.pending_edge.take() {
            self.finalize_edge(edge, &state.node_id)?;
        }

        match self.trail.iter().position(|id| *id == state.node_id) {
            Some(pos) => self.trail.truncate(pos + 1),
            None => self.trail.push(state.node_id.clone()),
        }
        self.visited.insert(state.node_id.clone());
        tracing::debug!(
            node_id = %state.node_id,
            is_new = state.is_new,
            trail = self.trail.len(),
            "located state"
        );

        let next = if state.is_new {
            Phase::Analyzing
        } else {
            Phase::Deciding
        };
        self.current = Some(CurrentState {
            node_id: state.node_id,
            snapshot,
            screenshot,
        });
        self.fsm.transition(next)?;
        Ok(())
    }

    fn finalize_edge(&self, edge: PendingEdge, target: &str) -> Result<()> {
        if edge.source == target {
            tracing::debug!(node_id = target, action = %edge.action, "action stayed on its source state");
            return Ok(());
        }
        match self.atlas.edges.link_state(&edge.source, &edge.action, target) {
            Ok(_) => Ok(()),
            Err(StoreError::UnknownNode(id)) => {
                tracing::warn!(node_id = %id, action = %edge.action, "dropping edge to unknown node");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn analyze(&mut self) -> Result<()> {
        let current = self
            .current
            .as_ref()
            .ok_or(ExploreError::NoCurrentState(Phase::Analyzing))?;
        let report = bounded(
            "analyzer",
            "analyze",
            self.limits.page_load_timeout(),
            self.collaborators.analyzer.analyze(
                &current.screenshot,
                &current.snapshot.dom_summary,
                &current.snapshot.url,
            ),
        )
        .await?;
        let node_id = current.node_id.clone();

        if !report.summary.is_empty() {
            self.atlas.registry.set_summary(&node_id, &report.summary)?;
        }
        let tasks = report.frontier_tasks.len();
        let ideas = report.test_ideas.len();
        let items: Vec<QueueItem> = report
            .frontier_tasks
            .into_iter()
            .map(QueueItem::from)
            .chain(report.test_ideas.into_iter().map(QueueItem::from))
            .collect();
        self.atlas.queue.push(&node_id, items)?;
        tracing::info!(node_id = %node_id, tasks, ideas, "analyzed state");

        self.fsm.transition(Phase::Deciding)?;
        Ok(())
    }

    fn decide(&mut self) -> Result<()> {
        let node_id = self
            .current
            .as_ref()
            .map(|c| c.node_id.clone())
            .ok_or(ExploreError::NoCurrentState(Phase::Deciding))?;

        if self.depth_of(&node_id)? >= self.limits.max_depth {
            tracing::debug!(node_id = %node_id, "depth bound reached, not expanding");
            self.fsm.transition(Phase::Backtracking)?;
            return Ok(());
        }

        match self.atlas.queue.pop(&node_id, Some(1))?.into_iter().next() {
            Some(task) => {
                tracing::debug!(node_id = %node_id, task = %task.id, intent = %task.intent(), "selected task");
                self.active = Some(ActiveTask {
                    source: node_id,
                    task,
                    outcome: None,
                });
                self.fsm.transition(Phase::Acting)?;
            }
            None => self.fsm.transition(Phase::Backtracking)?,
        }
        Ok(())
    }

    async fn act(&mut self) -> Result<()> {
        let (current, active) = match (&self.current, &self.active) {
            (Some(current), Some(active)) => (current, active),
            _ => return Err(ExploreError::NoCurrentState(Phase::Acting)),
        };
        let context = IntentContext {
            node_id: active.source.clone(),
            url: current.snapshot.url.clone(),
            task: active.task.clone(),
        };
        let outcome = bounded(
            "browser",
            "execute_intent",
            self.limits.action_timeout(),
            self.collaborators
                .browser
                .execute_intent(&active.task.intent(), &context),
        )
        .await?;

        if !outcome.success {
            tracing::debug!(
                task = %context.task.id,
                error = outcome.error.as_deref().unwrap_or(""),
                "action reported failure"
            );
        }
        self.tasks_executed += 1;
        if let Some(active) = self.active.as_mut() {
            active.outcome = Some(outcome);
        }
        self.fsm.transition(Phase::Reflecting)?;
        Ok(())
    }

    async fn reflect(&mut self) -> Result<()> {
        let active = self
            .active
            .take()
            .ok_or(ExploreError::NoCurrentState(Phase::Reflecting))?;
        let current = self
            .current
            .as_ref()
            .ok_or(ExploreError::NoCurrentState(Phase::Reflecting))?;
        let outcome = active.outcome.unwrap_or_default();

        let trajectory = Trajectory {
            screenshot_before: outcome
                .screenshot_before
                .clone()
                .or_else(|| Some(current.screenshot.clone())),
            action_description: active.task.intent(),
            screenshot_after: outcome.screenshot_after.clone(),
            dom_before: if outcome.dom_before.is_empty() {
                current.snapshot.dom_summary.clone()
            } else {
                outcome.dom_before.clone()
            },
            dom_after: outcome.dom_after.clone(),
        };
        let label = bounded(
            "judge",
            "label",
            self.limits.page_load_timeout(),
            self.collaborators.judge.label(&trajectory),
        )
        .await?;
        self.atlas
            .queue
            .complete(&active.source, &active.task.id, outcome.success)?;

        if !label.is_meaningful {
            tracing::debug!(task = %active.task.id, "action judged not meaningful");
            self.fsm.transition(Phase::Deciding)?;
            return Ok(());
        }

        self.meaningful_actions += 1;
        let identity = active.task.action_identity();
        let action_name = edge_action_name(&active.task.action_name(), &identity);
        let script_name = if label.script_name.trim().is_empty() {
            action_name.clone()
        } else {
            edge_action_name(&label.script_name, &identity)
        };
        let script_path = self.atlas.registry.script_path(&active.source, &script_name)?;
        bounded(
            "browser",
            "save_script",
            self.limits.action_timeout(),
            self.collaborators.browser.save_script(&script_path, &label),
        )
        .await?;
        self.atlas
            .registry
            .record_script(&active.source, &action_name, &script_name)?;
        tracing::debug!(
            source = %active.source,
            action = %action_name,
            label = %label.semantic_label,
            confidence = label.confidence,
            "meaningful action"
        );

        self.pending_edge = Some(PendingEdge {
            source: active.source,
            action: action_name,
        });
        self.fsm.transition(Phase::Locating)?;
        Ok(())
    }

    /// Unwind the trail to the nearest ancestor that still has work,
    /// stepping the browser back once per level. Completes when none has.
    async fn backtrack(&mut self) -> Result<()> {
        let mut target = None;
        for (pos, node_id) in self.trail.iter().enumerate().rev().skip(1) {
            if self.is_expandable(node_id)? {
                target = Some(pos);
                break;
            }
        }
        let Some(pos) = target else {
            tracing::info!(trail = self.trail.len(), "nothing left to explore");
            self.fsm.transition(Phase::Completed)?;
            return Ok(());
        };

        let levels = self.trail.len() - 1 - pos;
        for _ in 0..levels {
            bounded(
                "browser",
                "go_back",
                self.limits.page_load_timeout(),
                self.collaborators.browser.go_back(),
            )
            .await?;
        }
        self.trail.truncate(pos + 1);
        self.current = None;
        self.backtrack_target = Some(self.trail[pos].clone());
        tracing::debug!(node_id = %self.trail[pos], levels, "backtracked");
        self.fsm.transition(Phase::Locating)?;
        Ok(())
    }

    fn is_expandable(&self, node_id: &str) -> Result<bool> {
        Ok(self.depth_of(node_id)? < self.limits.max_depth
            && self.atlas.queue.pending_count(node_id)? > 0)
    }

    /// Registry depth, or the trail position for nodes not linked yet.
    fn depth_of(&self, node_id: &str) -> Result<u32> {
        Ok(match self.atlas.registry.depth_of(node_id)? {
            Some(depth) => depth,
            None => self
                .trail
                .iter()
                .position(|id| id == node_id)
                .unwrap_or(self.trail.len()) as u32,
        })
    }

    /// Navigate to a known node by replaying the recorded path from the
    /// start URL, then return its test ideas.
    ///
    /// Drives `Testing → Teleporting → Testing`; any failure leaves the
    /// FSM in `Error`.
    pub async fn teleport(&mut self, node_id: &str) -> Result<Vec<TestIdea>> {
        if self.fsm.current() != Phase::Testing {
            self.fsm.transition(Phase::Testing)?;
        }
        match self.teleport_to(node_id).await {
            Ok(ideas) => Ok(ideas),
            Err(e) => {
                tracing::warn!(node_id, error = %e, "teleport failed");
                if let Err(t) = self.fsm.transition(Phase::Error) {
                    tracing::debug!(error = %t, "no error transition from current phase");
                }
                Err(e)
            }
        }
    }

    async fn teleport_to(&mut self, node_id: &str) -> Result<Vec<TestIdea>> {
        self.fsm.transition(Phase::Teleporting)?;
        let hops = self.replay_path(node_id).await?;

        let snapshot = bounded(
            "browser",
            "page_snapshot",
            self.limits.page_load_timeout(),
            self.collaborators.browser.page_snapshot(),
        )
        .await?;
        let arrived = self.atlas.registry.ensure_state(
            &snapshot.url,
            &snapshot_fingerprint(&snapshot),
            None,
            Metadata::new(),
        )?;
        if arrived.node_id != node_id {
            return Err(ExploreError::WrongDestination {
                expected: node_id.to_string(),
                actual: arrived.node_id,
            });
        }

        tracing::info!(node_id, hops, "teleported");
        self.fsm.transition(Phase::Testing)?;
        Ok(self.atlas.queue.test_ideas(node_id)?)
    }

    /// Navigate to the start URL and replay the recorded scripts leading to
    /// `node_id`. Returns the number of hops replayed.
    async fn replay_path(&self, node_id: &str) -> Result<usize> {
        let path = self.atlas.registry.get_path_to_node(node_id)?;
        let browser = &self.collaborators.browser;

        bounded(
            "browser",
            "navigate",
            self.limits.page_load_timeout(),
            browser.navigate(&self.start_url),
        )
        .await?;
        let mut hops = 0;
        for step in &path {
            let Some(action) = &step.action else {
                continue;
            };
            let script = step
                .script_reference
                .as_ref()
                .ok_or_else(|| ExploreError::MissingScript {
                    node_id: step.node_id.clone(),
                    action: action.clone(),
                })?;
            bounded(
                "browser",
                "replay_script",
                self.limits.action_timeout(),
                browser.replay_script(script),
            )
            .await?;
            hops += 1;
        }
        Ok(hops)
    }
}

/// The driver's fingerprint, or one computed from the DOM summary.
fn snapshot_fingerprint(snapshot: &PageSnapshot) -> String {
    match &snapshot.dom_fingerprint {
        Some(fp) if !fp.is_empty() => fp.clone(),
        _ => dom_fingerprint(&snapshot.dom_summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        assert!(!clone.is_cancelled());
        handle.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_snapshot_fingerprint_prefers_driver_value() {
        let mut snapshot = PageSnapshot {
            url: "https://app.test/".into(),
            dom_summary: "<body/>".into(),
            title: String::new(),
            dom_fingerprint: Some("driver-fp".into()),
        };
        assert_eq!(snapshot_fingerprint(&snapshot), "driver-fp");

        snapshot.dom_fingerprint = Some(String::new());
        assert_eq!(snapshot_fingerprint(&snapshot), dom_fingerprint("<body/>"));
    }
}
