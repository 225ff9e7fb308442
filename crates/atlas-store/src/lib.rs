//! The on-disk atlas: a deduplicated state graph persisted as a directory
//! hierarchy.
//!
//! ```text
//! <atlas_root>/
//!   index.json                 root ledger (nodes, statistics)
//!   <node_id>/
//!     meta.json                node metadata, visit counter
//!     links/                   outgoing edges (symlinks or _links.json)
//!     scripts/                 replay scripts and _scripts.json manifest
//!     todos/ processing/ completed/
//! ```
//!
//! [`StateRegistry`] owns the index, [`EdgeLinker`] owns edge artifacts and
//! [`TaskQueue`] owns the task collections. Nothing else writes under the
//! atlas root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod edge;
pub mod fingerprint;
mod fsutil;
pub mod queue;
pub mod registry;

pub use edge::{EdgeLinker, EdgeStrategy};
pub use queue::{TaskQueue, TodoOutcome, TodoRequest};
pub use registry::{EnsuredState, StateRegistry};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node unreachable from root: {0}")]
    Unreachable(String),

    /// The platform or permissions refused a native link. Never surfaced by
    /// [`EdgeLinker`], which falls back to the JSON edge store.
    #[error("Link creation denied at {}: {source}", link.display())]
    LinkCreationDenied {
        link: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The three owners of one atlas root, opened together and shared.
#[derive(Clone)]
pub struct Atlas {
    pub registry: Arc<StateRegistry>,
    pub edges: Arc<EdgeLinker>,
    pub queue: Arc<TaskQueue>,
}

impl Atlas {
    pub fn open(root: impl Into<PathBuf>, strategy: EdgeStrategy) -> Result<Self> {
        let registry = Arc::new(StateRegistry::open(root)?);
        Ok(Self {
            edges: Arc::new(EdgeLinker::new(registry.clone(), strategy)),
            queue: Arc::new(TaskQueue::new(registry.clone())),
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        self.registry.root()
    }
}
