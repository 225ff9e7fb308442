//! Content-addressable registry of state nodes.
//!
//! The registry is the only writer of `index.json`. The index is loaded
//! once when the registry is opened, kept behind a single mutex, and
//! flushed after every mutation so a crash never loses more than the
//! operation in flight.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use atlas_ir::types::{
    ExplorationIndex, IndexEntry, Metadata, NodeMeta, PathStep, Statistics, ROOT_NODE_ID,
};
use chrono::Utc;

use crate::edge::read_edges;
use crate::fingerprint::{node_id_for, sanitize_action_name, state_hash, NODE_ID_HASH_LEN};
use crate::fsutil::{create_dir, lock, read_json, read_json_opt, write_json_atomic};
use crate::{Result, StoreError};

pub const INDEX_FILE: &str = "index.json";
pub const META_FILE: &str = "meta.json";
pub const LINKS_DIR: &str = "links";
pub const SCRIPTS_DIR: &str = "scripts";
pub const SCRIPTS_MANIFEST: &str = "_scripts.json";
pub const TODOS_DIR: &str = "todos";
pub const PROCESSING_DIR: &str = "processing";
pub const COMPLETED_DIR: &str = "completed";

/// Subdirectories created for every node.
const NODE_SKELETON: [&str; 5] = [
    LINKS_DIR,
    SCRIPTS_DIR,
    TODOS_DIR,
    PROCESSING_DIR,
    COMPLETED_DIR,
];

/// Keys of [`NodeMeta`] that caller metadata may not overwrite.
const RESERVED_META_KEYS: [&str; 6] = [
    "id",
    "url",
    "dom_fingerprint",
    "screenshot",
    "created_at",
    "visited_count",
];

/// Result of [`StateRegistry::ensure_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredState {
    pub node_id: String,
    pub node_path: PathBuf,
    pub is_new: bool,
}

/// Maps `(url, dom_fingerprint)` to durable node directories.
pub struct StateRegistry {
    root: PathBuf,
    index: Mutex<ExplorationIndex>,
}

/// Edges on disk between indexed nodes. An edge artifact is written before
/// the index counts it, so this is the authority after a crash.
fn count_edges(root: &Path, index: &ExplorationIndex) -> Result<u64> {
    let mut total = 0u64;
    for entry in index.nodes.values() {
        let edges = read_edges(&root.join(&entry.path).join(LINKS_DIR))?;
        total += edges.iter().filter(|e| index.contains(&e.target)).count() as u64;
    }
    Ok(total)
}

impl StateRegistry {
    /// Open the atlas at `root`, creating it if needed, and load its index.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_dir(&root)?;

        let index_path = root.join(INDEX_FILE);
        let index = match read_json_opt::<ExplorationIndex>(&index_path)? {
            Some(mut index) => {
                tracing::debug!(
                    root = %root.display(),
                    nodes = index.nodes.len(),
                    "loaded exploration index"
                );
                let counted = count_edges(&root, &index)?;
                if counted != index.statistics.total_edges {
                    tracing::warn!(
                        recorded = index.statistics.total_edges,
                        counted,
                        "edge count out of step with links on disk, correcting"
                    );
                    index.statistics.total_edges = counted;
                    index.touch();
                    write_json_atomic(&index_path, &index)?;
                }
                index
            }
            None => {
                let index = ExplorationIndex::new();
                write_json_atomic(&index_path, &index)?;
                tracing::info!(root = %root.display(), "created new atlas");
                index
            }
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a state to its node, creating the node on first sight.
    ///
    /// Repeated calls for the same `(url, dom_fingerprint)` return the same
    /// id and only bump the node's `visited_count`.
    pub fn ensure_state(
        &self,
        url: &str,
        dom_fingerprint: &str,
        screenshot: Option<&str>,
        metadata: Metadata,
    ) -> Result<EnsuredState> {
        let hash = state_hash(url, dom_fingerprint);
        let mut index = lock(&self.index);

        if let Some(node_id) = index.find_by_hash(&hash).map(str::to_owned) {
            let node_path = self.node_dir(&index, &node_id)?;
            let meta_path = node_path.join(META_FILE);
            let mut meta: NodeMeta = read_json(&meta_path)?;
            meta.visited_count += 1;
            write_json_atomic(&meta_path, &meta)?;
            tracing::debug!(node_id = %node_id, visits = meta.visited_count, "revisited state");
            return Ok(EnsuredState {
                node_id,
                node_path,
                is_new: false,
            });
        }

        let node_id = if index.root_node.is_none() {
            ROOT_NODE_ID.to_string()
        } else {
            unused_node_id(&index, &hash)
        };
        let node_path = self.root.join(&node_id);
        for dir in NODE_SKELETON {
            create_dir(&node_path.join(dir))?;
        }

        let now = Utc::now();
        let mut metadata = metadata;
        for key in RESERVED_META_KEYS {
            metadata.remove(key);
        }
        let meta = NodeMeta {
            id: node_id.clone(),
            url: url.to_string(),
            dom_fingerprint: dom_fingerprint.to_string(),
            screenshot: screenshot.map(str::to_owned),
            created_at: now,
            visited_count: 1,
            metadata,
        };
        write_json_atomic(&node_path.join(META_FILE), &meta)?;

        let is_root = index.root_node.is_none();
        index.nodes.insert(
            node_id.clone(),
            IndexEntry {
                path: node_id.clone(),
                url: url.to_string(),
                summary: String::new(),
                created_at: now,
                state_hash: hash,
                depth: is_root.then_some(0),
            },
        );
        if is_root {
            index.root_node = Some(node_id.clone());
        }
        index.statistics.total_nodes += 1;
        self.flush_locked(&mut index)?;

        tracing::info!(node_id = %node_id, url, "registered new state");
        Ok(EnsuredState {
            node_id,
            node_path,
            is_new: true,
        })
    }

    /// The node already registered for `(url, dom_fingerprint)`, if any.
    /// Never creates a node or counts a visit.
    pub fn lookup(&self, url: &str, dom_fingerprint: &str) -> Option<String> {
        let hash = state_hash(url, dom_fingerprint);
        lock(&self.index).find_by_hash(&hash).map(str::to_owned)
    }

    /// Reconstruct a replayable path from the root to `target` by
    /// breadth-first search over the persisted edges.
    pub fn get_path_to_node(&self, target: &str) -> Result<Vec<PathStep>> {
        let index = self.index_snapshot();
        if !index.contains(target) {
            return Err(StoreError::UnknownNode(target.to_string()));
        }
        let root = index
            .root_node
            .clone()
            .ok_or_else(|| StoreError::Unreachable(target.to_string()))?;

        // node -> (parent, action taken out of the parent)
        let mut parents: HashMap<String, (String, String)> = HashMap::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(root.clone());
        queue.push_back(root.clone());

        while let Some(current) = queue.pop_front() {
            if current == target {
                break;
            }
            let Some(entry) = index.entry(&current) else {
                continue;
            };
            let links_dir = self.root.join(&entry.path).join(LINKS_DIR);
            for edge in read_edges(&links_dir)? {
                if !index.contains(&edge.target) || visited.contains(&edge.target) {
                    continue;
                }
                visited.insert(edge.target.clone());
                parents.insert(edge.target.clone(), (current.clone(), edge.action));
                queue.push_back(edge.target);
            }
        }

        if !visited.contains(target) {
            return Err(StoreError::Unreachable(target.to_string()));
        }

        let mut steps = vec![PathStep {
            node_id: target.to_string(),
            action: None,
            script_reference: None,
        }];
        let mut cursor = target.to_string();
        while let Some((parent, action)) = parents.get(&cursor) {
            let script_reference = self.script_for(&index, parent, action)?;
            steps.push(PathStep {
                node_id: parent.clone(),
                action: Some(action.clone()),
                script_reference,
            });
            cursor = parent.clone();
        }
        steps.reverse();
        Ok(steps)
    }

    /// Record a traversed edge: bump the edge counter and propagate depth.
    pub(crate) fn record_edge(&self, source: &str, target: &str) -> Result<()> {
        let mut guard = lock(&self.index);
        let index = &mut *guard;
        let source_depth = index
            .entry(source)
            .ok_or_else(|| StoreError::UnknownNode(source.to_string()))?
            .depth;
        let target_entry = index
            .nodes
            .get_mut(target)
            .ok_or_else(|| StoreError::UnknownNode(target.to_string()))?;

        if let Some(depth) = source_depth.map(|d| d + 1) {
            if target_entry.depth.map_or(true, |current| depth < current) {
                target_entry.depth = Some(depth);
                index.statistics.max_depth = index.statistics.max_depth.max(depth);
            }
        }
        index.statistics.total_edges += 1;
        self.flush_locked(index)
    }

    /// Store the page-understanding summary for a node.
    pub fn set_summary(&self, node_id: &str, summary: &str) -> Result<()> {
        let mut guard = lock(&self.index);
        let index = &mut *guard;
        let entry = index
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::UnknownNode(node_id.to_string()))?;
        entry.summary = summary.to_string();
        self.flush_locked(index)
    }

    /// Where the browser should save the replay script `script_name` for
    /// an action taken out of `node_id`.
    pub fn script_path(&self, node_id: &str, script_name: &str) -> Result<PathBuf> {
        let node_path = self.node_path(node_id)?;
        Ok(node_path
            .join(SCRIPTS_DIR)
            .join(format!("{}.json", sanitize_action_name(script_name))))
    }

    /// Register `script_name` as the replay script for `action_name` in the
    /// node's script manifest.
    pub fn record_script(&self, node_id: &str, action_name: &str, script_name: &str) -> Result<()> {
        let index = lock(&self.index);
        let manifest_path = self
            .node_dir(&index, node_id)?
            .join(SCRIPTS_DIR)
            .join(SCRIPTS_MANIFEST);
        let mut manifest: BTreeMap<String, String> =
            read_json_opt(&manifest_path)?.unwrap_or_default();
        manifest.insert(
            sanitize_action_name(action_name),
            format!("{}.json", sanitize_action_name(script_name)),
        );
        write_json_atomic(&manifest_path, &manifest)
    }

    pub fn node_path(&self, node_id: &str) -> Result<PathBuf> {
        let index = lock(&self.index);
        self.node_dir(&index, node_id)
    }

    pub fn node_meta(&self, node_id: &str) -> Result<NodeMeta> {
        read_json(&self.node_path(node_id)?.join(META_FILE))
    }

    pub fn contains(&self, node_id: &str) -> bool {
        lock(&self.index).contains(node_id)
    }

    pub fn depth_of(&self, node_id: &str) -> Result<Option<u32>> {
        lock(&self.index)
            .entry(node_id)
            .map(|e| e.depth)
            .ok_or_else(|| StoreError::UnknownNode(node_id.to_string()))
    }

    pub fn root_node(&self) -> Option<String> {
        lock(&self.index).root_node.clone()
    }

    pub fn statistics(&self) -> Statistics {
        lock(&self.index).statistics.clone()
    }

    /// A copy of the current index.
    pub fn index_snapshot(&self) -> ExplorationIndex {
        lock(&self.index).clone()
    }

    /// Write the index to disk.
    pub fn flush(&self) -> Result<()> {
        let mut index = lock(&self.index);
        self.flush_locked(&mut index)
    }

    fn flush_locked(&self, index: &mut ExplorationIndex) -> Result<()> {
        index.touch();
        write_json_atomic(&self.root.join(INDEX_FILE), index)
    }

    fn node_dir(&self, index: &ExplorationIndex, node_id: &str) -> Result<PathBuf> {
        index
            .entry(node_id)
            .map(|e| self.root.join(&e.path))
            .ok_or_else(|| StoreError::UnknownNode(node_id.to_string()))
    }

    fn script_for(
        &self,
        index: &ExplorationIndex,
        node_id: &str,
        action: &str,
    ) -> Result<Option<PathBuf>> {
        let scripts_dir = self.node_dir(index, node_id)?.join(SCRIPTS_DIR);
        let manifest: Option<BTreeMap<String, String>> =
            read_json_opt(&scripts_dir.join(SCRIPTS_MANIFEST))?;
        Ok(manifest
            .and_then(|m| m.get(action).cloned())
            .map(|file| scripts_dir.join(file)))
    }
}

/// Hash-derived id, lengthened on the (unlikely) prefix collision.
fn unused_node_id(index: &ExplorationIndex, hash: &str) -> String {
    let mut id = node_id_for(hash);
    let mut len = NODE_ID_HASH_LEN;
    while index.contains(&id) && len < hash.len() {
        len = (len + 4).min(hash.len());
        id = format!("node_{}", &hash[..len]);
    }
    id
}
