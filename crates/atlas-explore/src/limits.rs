//! Exploration bounds.
//!
//! Hitting a bound is a normal way for a run to end: the engine stops,
//! forces `Completed` and reports what it found so far.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplorationLimits {
    /// Maximum loop iterations (one phase handler per iteration).
    pub max_iterations: u64,
    /// Stop once the atlas holds this many nodes.
    pub max_nodes: u64,
    /// Nodes at this depth or deeper are not expanded.
    pub max_depth: u32,
    /// Bound on executing one task in the browser.
    pub action_timeout_secs: u64,
    /// Bound on navigation, snapshots and model calls.
    pub page_load_timeout_secs: u64,
    /// Maximum wall-clock seconds before forced stop.
    pub max_wall_secs: u64,
}

impl ExplorationLimits {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }
}

impl Default for ExplorationLimits {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            max_nodes: 100,
            max_depth: 10,
            action_timeout_secs: 30,
            page_load_timeout_secs: 60,
            max_wall_secs: 3600, // 1 hour
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left to explore.
    Completed,
    IterationLimit,
    NodeLimit,
    WallTime,
    Cancelled,
    /// A collaborator or the atlas failed; see the run's errors.
    Failed,
}

impl StopReason {
    /// Whether the run ended because of a configured bound.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::IterationLimit | Self::NodeLimit | Self::WallTime)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::IterationLimit => write!(f, "iteration limit reached"),
            Self::NodeLimit => write!(f, "node limit reached"),
            Self::WallTime => write!(f, "wall-time limit reached"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Check progress against limits.
pub struct ResourceChecker {
    limits: ExplorationLimits,
    start_time: Instant,
}

impl ResourceChecker {
    pub fn new(limits: ExplorationLimits) -> Self {
        Self {
            limits,
            start_time: Instant::now(),
        }
    }

    /// `None` while every bound holds, otherwise the first one hit.
    pub fn check(&self, iterations: u64, nodes: u64) -> Option<StopReason> {
        if self.wall_time_exceeded() {
            return Some(StopReason::WallTime);
        }
        if iterations >= self.limits.max_iterations {
            return Some(StopReason::IterationLimit);
        }
        if nodes >= self.limits.max_nodes {
            return Some(StopReason::NodeLimit);
        }
        None
    }

    pub fn wall_time_exceeded(&self) -> bool {
        self.start_time.elapsed().as_secs() >= self.limits.max_wall_secs
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    pub fn limits(&self) -> &ExplorationLimits {
        &self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExplorationLimits::default();
        assert_eq!(limits.max_iterations, 500);
        assert_eq!(limits.max_nodes, 100);
        assert_eq!(limits.max_depth, 10);
        assert_eq!(limits.action_timeout(), Duration::from_secs(30));
        assert_eq!(limits.page_load_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_checker_all_ok() {
        let checker = ResourceChecker::new(ExplorationLimits::default());
        assert!(checker.check(10, 5).is_none());
    }

    #[test]
    fn test_iteration_limit() {
        let checker = ResourceChecker::new(ExplorationLimits {
            max_iterations: 100,
            ..Default::default()
        });
        assert_eq!(checker.check(100, 0), Some(StopReason::IterationLimit));
    }

    #[test]
    fn test_node_limit() {
        let checker = ResourceChecker::new(ExplorationLimits {
            max_nodes: 3,
            ..Default::default()
        });
        assert_eq!(checker.check(0, 2), None);
        assert_eq!(checker.check(0, 3), Some(StopReason::NodeLimit));
    }

    #[test]
    fn test_zero_wall_time_stops_immediately() {
        let checker = ResourceChecker::new(ExplorationLimits {
            max_wall_secs: 0,
            ..Default::default()
        });
        assert_eq!(checker.check(0, 0), Some(StopReason::WallTime));
        assert!(StopReason::WallTime.is_bound());
        assert!(!StopReason::Cancelled.is_bound());
    }

    #[test]
    fn test_partial_limits_deserialize_with_defaults() {
        let limits: ExplorationLimits = serde_json::from_str(r#"{"max_nodes": 7}"#).unwrap();
        assert_eq!(limits.max_nodes, 7);
        assert_eq!(limits.max_iterations, 500);
    }
}
