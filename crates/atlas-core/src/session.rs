//! Session management.
//!
//! A session is one configured exploration run. The manager hands out ids,
//! caps how many sessions may be active at once, shares one [`Atlas`] per
//! atlas root between sessions and keeps each finished run's result and
//! analytics until the session is removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use atlas_explore::{CancelHandle, Collaborators, Explorer, RunResult, StopReason};
use atlas_store::{Atlas, StoreError};

use crate::analytics::{AnalyticsSummary, RunAnalytics};
use crate::config::{ConfigError, RunConfig};

/// Default cap on sessions that are registered or running.
pub const DEFAULT_MAX_SESSIONS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session limit exceeded: {current}/{max}")]
    LimitExceeded { current: usize, max: usize },

    #[error("Session {id} is {state:?}")]
    InvalidState { id: String, state: SessionState },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Registered,
    Running,
    /// The run ended without errors (drained, or stopped by a bound).
    Finished,
    /// The run ended in the error phase.
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Registered | SessionState::Running)
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub id: String,
    pub config: RunConfig,
    pub state: SessionState,
    pub result: Option<RunResult>,
    pub analytics: Option<AnalyticsSummary>,
}

struct Session {
    config: RunConfig,
    atlas: Atlas,
    state: SessionState,
    cancel: CancelHandle,
    result: Option<RunResult>,
    analytics: Option<RunAnalytics>,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    atlases: Mutex<HashMap<PathBuf, Atlas>>,
    next_id: Mutex<u64>,
    max_sessions: usize,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_max_sessions(DEFAULT_MAX_SESSIONS)
    }

    pub fn with_max_sessions(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            atlases: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            max_sessions,
        }
    }

    /// Validate `config`, open (or reuse) its atlas and register a session.
    pub fn register(&self, config: RunConfig) -> Result<String> {
        config.validate()?;

        let mut sessions = lock(&self.sessions);
        let current = sessions.values().filter(|s| s.state.is_active()).count();
        if current >= self.max_sessions {
            return Err(SessionError::LimitExceeded {
                current,
                max: self.max_sessions,
            });
        }

        let atlas = self.atlas_for_root(&config)?;

        let id = {
            let mut next = lock(&self.next_id);
            let id = format!("run-{:04}", *next);
            *next += 1;
            id
        };

        tracing::info!(
            session = %id,
            start_url = %config.start_url,
            atlas_root = %config.atlas_root.display(),
            "session registered"
        );
        sessions.insert(
            id.clone(),
            Session {
                config,
                atlas,
                state: SessionState::Registered,
                cancel: CancelHandle::new(),
                result: None,
                analytics: None,
            },
        );
        Ok(id)
    }

    /// Atlases are keyed by root. The first session to open a root fixes
    /// its edge strategy.
    fn atlas_for_root(&self, config: &RunConfig) -> Result<Atlas> {
        let mut atlases = lock(&self.atlases);
        if let Some(atlas) = atlases.get(&config.atlas_root) {
            return Ok(atlas.clone());
        }
        let atlas = Atlas::open(config.atlas_root.clone(), config.edge_strategy)?;
        atlases.insert(config.atlas_root.clone(), atlas.clone());
        Ok(atlas)
    }

    /// The shared atlas opened for `root`, if any session uses it.
    pub fn atlas(&self, root: &Path) -> Option<Atlas> {
        lock(&self.atlases).get(root).cloned()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        lock(&self.sessions).get(id).map(|s| SessionStatus {
            id: id.to_string(),
            config: s.config.clone(),
            state: s.state,
            result: s.result.clone(),
            analytics: s.analytics.as_ref().map(RunAnalytics::summary),
        })
    }

    pub fn analytics(&self, id: &str) -> Option<RunAnalytics> {
        lock(&self.sessions)
            .get(id)
            .and_then(|s| s.analytics.clone())
    }

    pub fn list(&self) -> Vec<(String, SessionState)> {
        let mut all: Vec<_> = lock(&self.sessions)
            .iter()
            .map(|(id, s)| (id.clone(), s.state))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn active_count(&self) -> usize {
        lock(&self.sessions)
            .values()
            .filter(|s| s.state.is_active())
            .count()
    }

    /// Run a registered session to completion with `collaborators`.
    pub async fn run(&self, id: &str, collaborators: Collaborators) -> Result<RunResult> {
        let (config, atlas, cancel) = {
            let mut sessions = lock(&self.sessions);
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            if session.state != SessionState::Registered {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    state: session.state,
                });
            }
            session.state = SessionState::Running;
            (
                session.config.clone(),
                session.atlas.clone(),
                session.cancel.clone(),
            )
        };

        tracing::info!(session = %id, "session started");
        let mut explorer = Explorer::new(atlas, collaborators, config.start_url, config.limits)
            .with_cancel(cancel);
        let result = explorer.run().await;
        let analytics = RunAnalytics::from_run(&result);

        let state = if result.stop_reason == StopReason::Cancelled {
            SessionState::Cancelled
        } else if result.is_success() {
            SessionState::Finished
        } else {
            SessionState::Failed
        };
        tracing::info!(
            session = %id,
            ?state,
            stop_reason = %result.stop_reason,
            nodes = result.total_nodes,
            edges = result.total_edges,
            "session ended"
        );

        if let Some(session) = lock(&self.sessions).get_mut(id) {
            session.state = state;
            session.result = Some(result.clone());
            session.analytics = Some(analytics);
        }
        Ok(result)
    }

    /// Request cancellation. A registered session is cancelled at once; a
    /// running one stops at its next iteration boundary.
    pub fn cancel(&self, id: &str) -> Result<SessionState> {
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        match session.state {
            SessionState::Registered => {
                session.cancel.cancel();
                session.state = SessionState::Cancelled;
            }
            SessionState::Running => session.cancel.cancel(),
            state => {
                return Err(SessionError::InvalidState {
                    id: id.to_string(),
                    state,
                })
            }
        }
        tracing::info!(session = %id, state = ?session.state, "session cancel requested");
        Ok(session.state)
    }

    /// Forget a session that is not running. The shared atlas is released
    /// once no remaining session uses its root.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let state = sessions
            .get(id)
            .map(|s| s.state)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        if state == SessionState::Running {
            return Err(SessionError::InvalidState {
                id: id.to_string(),
                state,
            });
        }
        let Some(removed) = sessions.remove(id) else {
            return Err(SessionError::NotFound(id.to_string()));
        };

        let root = removed.config.atlas_root;
        if !sessions.values().any(|s| s.config.atlas_root == root) {
            lock(&self.atlases).remove(&root);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
