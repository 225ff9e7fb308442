//! Run analytics.
//!
//! Aggregates what a finished run did: how often each phase was entered,
//! how many actions turned out meaningful, how quickly the graph grew.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use atlas_explore::{Phase, RunResult, StopReason, TransitionRecord};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunAnalytics {
    /// Times each phase was entered, keyed by phase name.
    pub phase_visits: BTreeMap<String, u64>,
    /// Transitions that bypassed the table (bound or cancel).
    pub forced_transitions: u64,
    pub iterations: u64,
    pub tasks_executed: u64,
    pub meaningful_actions: u64,
    pub nodes_visited: u64,
    pub total_nodes: u64,
    pub total_edges: u64,
    pub max_depth: u32,
    pub elapsed_secs: f64,
    pub errors: usize,
    pub stop_reason: Option<StopReason>,
    pub final_phase: Option<Phase>,
}

impl RunAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_run(result: &RunResult) -> Self {
        let mut analytics = Self {
            iterations: result.iterations,
            tasks_executed: result.tasks_executed,
            meaningful_actions: result.meaningful_actions,
            nodes_visited: result.nodes_visited,
            total_nodes: result.total_nodes,
            total_edges: result.total_edges,
            max_depth: result.max_depth_reached,
            elapsed_secs: result.elapsed_secs,
            errors: result.errors.len(),
            stop_reason: Some(result.stop_reason),
            final_phase: Some(result.final_phase),
            ..Self::default()
        };
        for record in &result.history {
            analytics.record_transition(record);
        }
        analytics
    }

    pub fn record_transition(&mut self, record: &TransitionRecord) {
        *self.phase_visits.entry(record.to.to_string()).or_insert(0) += 1;
        if record.forced {
            self.forced_transitions += 1;
        }
    }

    pub fn visits(&self, phase: Phase) -> u64 {
        self.phase_visits
            .get(&phase.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Share of executed actions judged meaningful (0.0-1.0).
    pub fn meaningful_ratio(&self) -> f64 {
        if self.tasks_executed == 0 {
            0.0
        } else {
            self.meaningful_actions as f64 / self.tasks_executed as f64
        }
    }

    /// Distinct nodes resolved per loop iteration.
    pub fn nodes_per_iteration(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.nodes_visited as f64 / self.iterations as f64
        }
    }

    pub fn summary(&self) -> AnalyticsSummary {
        AnalyticsSummary {
            iterations: self.iterations,
            tasks_executed: self.tasks_executed,
            meaningful_ratio: self.meaningful_ratio(),
            nodes_per_iteration: self.nodes_per_iteration(),
            total_nodes: self.total_nodes,
            total_edges: self.total_edges,
            max_depth: self.max_depth,
            backtracks: self.visits(Phase::Backtracking),
            elapsed_secs: self.elapsed_secs,
            stop_reason: self.stop_reason,
        }
    }
}

/// Compact analytics summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub iterations: u64,
    pub tasks_executed: u64,
    pub meaningful_ratio: f64,
    pub nodes_per_iteration: f64,
    pub total_nodes: u64,
    pub total_edges: u64,
    pub max_depth: u32,
    pub backtracks: u64,
    pub elapsed_secs: f64,
    pub stop_reason: Option<StopReason>,
}
