//! Embedding surface for the atlas explorer: run configuration, session
//! management and run analytics on top of the exploration engine.

pub mod analytics;
pub mod config;
pub mod session;

pub use analytics::{AnalyticsSummary, RunAnalytics};
pub use config::{ConfigError, RunConfig};
pub use session::{SessionError, SessionManager, SessionState, SessionStatus};
