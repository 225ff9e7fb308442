//! Directed, named edges between state nodes.
//!
//! An edge `source --[action]--> target` lives in the source node's
//! `links/` directory, either as a symlink `action_<name>` pointing at the
//! target directory or as an entry in `links/_links.json`. The strategy is
//! picked once when the [`EdgeLinker`] is built; if the platform later
//! refuses a symlink the linker switches to the JSON store for good.
//! Readers always merge both forms.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::fingerprint::sanitize_action_name;
use crate::fsutil::{create_dir, io_err, lock, read_json_opt, write_json_atomic};
use crate::registry::{StateRegistry, LINKS_DIR};
use crate::{Result, StoreError};

pub const LINK_PREFIX: &str = "action_";
pub const LINKS_MANIFEST: &str = "_links.json";

/// How edges are materialized on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeStrategy {
    /// Test the atlas root for symlink support.
    #[default]
    Auto,
    Symlink,
    Json,
}

/// An outgoing edge as read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Sanitized action name.
    pub action: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Created,
    AlreadyExists,
}

/// A way of writing one edge artifact.
pub trait EdgeStore: Send {
    fn name(&self) -> &'static str;

    /// Create the edge `action` in `links_dir` pointing at `target_rel`
    /// (relative to `links_dir`).
    fn create(&self, links_dir: &Path, action: &str, target_rel: &Path) -> Result<LinkOutcome>;
}

/// Edges as filesystem symlinks.
pub struct SymlinkEdgeStore;

impl EdgeStore for SymlinkEdgeStore {
    fn name(&self) -> &'static str {
        "symlink"
    }

    fn create(&self, links_dir: &Path, action: &str, target_rel: &Path) -> Result<LinkOutcome> {
        let link = links_dir.join(format!("{LINK_PREFIX}{action}"));
        match make_dir_symlink(target_rel, &link) {
            Ok(()) => Ok(LinkOutcome::Created),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(LinkOutcome::AlreadyExists),
            Err(source) => Err(StoreError::LinkCreationDenied { link, source }),
        }
    }
}

/// Edges as entries of `links/_links.json`.
pub struct JsonEdgeStore;

impl EdgeStore for JsonEdgeStore {
    fn name(&self) -> &'static str {
        "json"
    }

    fn create(&self, links_dir: &Path, action: &str, target_rel: &Path) -> Result<LinkOutcome> {
        let manifest_path = links_dir.join(LINKS_MANIFEST);
        let mut manifest: BTreeMap<String, String> =
            read_json_opt(&manifest_path)?.unwrap_or_default();
        if manifest.contains_key(action) {
            return Ok(LinkOutcome::AlreadyExists);
        }
        manifest.insert(
            action.to_string(),
            target_rel.to_string_lossy().replace('\\', "/"),
        );
        write_json_atomic(&manifest_path, &manifest)?;
        Ok(LinkOutcome::Created)
    }
}

#[cfg(unix)]
fn make_dir_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_dir_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(not(any(unix, windows)))]
fn make_dir_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

/// Check whether symlinks can be created under `dir`.
pub fn symlinks_supported(dir: &Path) -> bool {
    let check = dir.join(".symlink_check");
    let _ = std::fs::remove_file(&check);
    let supported = make_dir_symlink(Path::new("."), &check).is_ok();
    let _ = std::fs::remove_file(&check);
    supported
}

/// Last path component of a link target, i.e. the target node id.
fn target_node_id(target: &Path) -> Option<String> {
    target
        .components()
        .last()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .filter(|s| !s.is_empty() && s != "." && s != "..")
}

/// List the edges in a `links/` directory, whichever store wrote them.
/// Sorted by action; when both forms name the same action the symlink wins.
pub fn read_edges(links_dir: &Path) -> Result<Vec<Edge>> {
    let mut edges: BTreeMap<String, String> = BTreeMap::new();

    let manifest: Option<BTreeMap<String, String>> =
        read_json_opt(&links_dir.join(LINKS_MANIFEST))?;
    for (action, target) in manifest.unwrap_or_default() {
        if let Some(node) = target_node_id(Path::new(&target)) {
            edges.insert(action, node);
        }
    }

    let entries = match std::fs::read_dir(links_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(to_edges(edges)),
        Err(e) => return Err(io_err(links_dir)(e)),
    };
    for entry in entries {
        let entry = entry.map_err(io_err(links_dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(action) = name.strip_prefix(LINK_PREFIX) else {
            continue;
        };
        let path = entry.path();
        let Ok(target) = std::fs::read_link(&path) else {
            continue;
        };
        if let Some(node) = target_node_id(&target) {
            edges.insert(action.to_string(), node);
        }
    }

    Ok(to_edges(edges))
}

fn to_edges(map: BTreeMap<String, String>) -> Vec<Edge> {
    map.into_iter()
        .map(|(action, target)| Edge { action, target })
        .collect()
}

/// Creates edges between registered nodes.
pub struct EdgeLinker {
    registry: Arc<StateRegistry>,
    store: Mutex<Box<dyn EdgeStore>>,
}

impl EdgeLinker {
    pub fn new(registry: Arc<StateRegistry>, strategy: EdgeStrategy) -> Self {
        let store: Box<dyn EdgeStore> = match strategy {
            EdgeStrategy::Symlink => Box::new(SymlinkEdgeStore),
            EdgeStrategy::Json => Box::new(JsonEdgeStore),
            EdgeStrategy::Auto if symlinks_supported(registry.root()) => {
                Box::new(SymlinkEdgeStore)
            }
            EdgeStrategy::Auto => Box::new(JsonEdgeStore),
        };
        Self::with_store(registry, store)
    }

    /// A linker over a specific store. A store that refuses links is still
    /// replaced by the JSON store on first refusal.
    pub fn with_store(registry: Arc<StateRegistry>, store: Box<dyn EdgeStore>) -> Self {
        tracing::debug!(store = store.name(), "edge store selected");
        Self {
            registry,
            store: Mutex::new(store),
        }
    }

    /// Name of the store currently in use.
    pub fn store_name(&self) -> &'static str {
        lock(&self.store).name()
    }

    /// Connect `source --[action_name]--> target`.
    ///
    /// Both nodes must exist. Linking an existing `(source, action)` pair
    /// again is a successful no-op, even if the target differs.
    pub fn link_state(
        &self,
        source: &str,
        action_name: &str,
        target: &str,
    ) -> Result<LinkOutcome> {
        let links_dir = self.registry.node_path(source)?.join(LINKS_DIR);
        self.registry.node_path(target)?;
        let action = sanitize_action_name(action_name);

        let mut store = lock(&self.store);
        if let Some(existing) = read_edges(&links_dir)?
            .into_iter()
            .find(|e| e.action == action)
        {
            if existing.target != target {
                tracing::warn!(
                    source,
                    action = %action,
                    existing = %existing.target,
                    requested = target,
                    "edge already points elsewhere, keeping it"
                );
            }
            return Ok(LinkOutcome::AlreadyExists);
        }

        create_dir(&links_dir)?;
        let target_rel: PathBuf = ["..", "..", target].iter().collect();
        let outcome = match store.create(&links_dir, &action, &target_rel) {
            Err(StoreError::LinkCreationDenied { link, source: err }) => {
                tracing::warn!(
                    link = %link.display(),
                    error = %err,
                    "native link refused, switching to JSON edge store"
                );
                *store = Box::new(JsonEdgeStore);
                store.create(&links_dir, &action, &target_rel)?
            }
            other => other?,
        };

        if outcome == LinkOutcome::Created {
            self.registry.record_edge(source, target)?;
            tracing::info!(source, action = %action, target, store = store.name(), "linked states");
        }
        Ok(outcome)
    }

    /// Outgoing edges of a node.
    pub fn edges_from(&self, node_id: &str) -> Result<Vec<Edge>> {
        read_edges(&self.registry.node_path(node_id)?.join(LINKS_DIR))
    }
}
