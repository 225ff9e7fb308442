use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier reserved for the first node discovered in an atlas.
pub const ROOT_NODE_ID: &str = "root";

/// Format version written into `index.json`.
pub const INDEX_VERSION: &str = "1.0";

/// Free-form key/value metadata attached to nodes and tasks.
pub type Metadata = Map<String, Value>;

fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ── Tasks ────────────────────────────────────────────────────────────

/// What a frontier task does to its target element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    Type,
    Submit,
    Navigate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Click => write!(f, "click"),
            Self::Type => write!(f, "type"),
            Self::Submit => write!(f, "submit"),
            Self::Navigate => write!(f, "navigate"),
        }
    }
}

/// Lifecycle of a task record. The directory holding the record is
/// authoritative; this field mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A unit of exploration work attached to a state node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "new_record_id")]
    pub id: String,
    /// Locator of the target element.
    #[serde(default)]
    pub selector: String,
    pub action: ActionKind,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_destructive: bool,
    /// Action parameters, e.g. `{"text": "..."}` for `type` or `{"url": "..."}` for `navigate`.
    #[serde(default)]
    pub parameters: Metadata,
    #[serde(default)]
    pub status: TaskStatus,
    /// Human-readable intent, used when describing the action to the judge.
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(selector: impl Into<String>, action: ActionKind) -> Self {
        Self {
            id: new_record_id(),
            selector: selector.into(),
            action,
            priority: 0,
            is_destructive: false,
            parameters: Metadata::new(),
            status: TaskStatus::Pending,
            description: String::new(),
            created_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    /// A short description of the action, e.g. `click #login`.
    pub fn intent(&self) -> String {
        if self.description.is_empty() {
            format!("{} {}", self.action, self.selector)
        } else {
            self.description.clone()
        }
    }

    /// Readable base name for the edge this task creates when judged
    /// meaningful. Not unique: `#a.b` and `#a b` read the same once
    /// sanitized, so stores pair it with [`action_identity`](Self::action_identity).
    pub fn action_name(&self) -> String {
        format!("{}_{}", self.action, self.selector)
    }

    /// What distinguishes this action from any other on the same page: the
    /// kind, the exact selector and the parameters.
    pub fn action_identity(&self) -> String {
        let parameters = serde_json::to_string(&self.parameters).unwrap_or_default();
        format!("{}\n{}\n{}", self.action, self.selector, parameters)
    }
}

/// Category of a deferred test proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Boundary,
    Injection,
    Security,
    Permission,
    Performance,
}

/// A deferred, non-navigational test proposal. Stored next to tasks but
/// never executed by the exploration loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestIdea {
    #[serde(default = "new_record_id")]
    pub id: String,
    pub category: TestCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub details: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TestIdea {
    pub fn new(category: TestCategory, description: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            category,
            description: description.into(),
            target: None,
            details: Metadata::new(),
            created_at: None,
        }
    }
}

/// One record in a node's task collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueItem {
    Task(Task),
    TestIdea(TestIdea),
}

impl QueueItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Task(t) => &t.id,
            Self::TestIdea(i) => &i.id,
        }
    }
}

impl From<Task> for QueueItem {
    fn from(task: Task) -> Self {
        Self::Task(task)
    }
}

impl From<TestIdea> for QueueItem {
    fn from(idea: TestIdea) -> Self {
        Self::TestIdea(idea)
    }
}

// ── Nodes and the index ──────────────────────────────────────────────

/// Contents of `<node_id>/meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    pub id: String,
    pub url: String,
    pub dom_fingerprint: String,
    #[serde(default)]
    pub screenshot: Option<String>,
    pub created_at: DateTime<Utc>,
    pub visited_count: u64,
    /// Caller-supplied metadata, flattened into the record.
    #[serde(flatten)]
    pub metadata: Metadata,
}

/// Per-node entry in `index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Node directory, relative to the atlas root.
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    /// Content hash of `(url, dom_fingerprint)`.
    pub state_hash: String,
    /// Shortest known distance from the root; `None` until the node is linked.
    #[serde(default)]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_nodes: u64,
    pub total_edges: u64,
    pub max_depth: u32,
}

/// The root ledger of an atlas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationIndex {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub root_node: Option<String>,
    pub nodes: BTreeMap<String, IndexEntry>,
    pub statistics: Statistics,
}

impl ExplorationIndex {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: INDEX_VERSION.to_string(),
            created_at: now,
            updated_at: now,
            root_node: None,
            nodes: BTreeMap::new(),
            statistics: Statistics::default(),
        }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn entry(&self, node_id: &str) -> Option<&IndexEntry> {
        self.nodes.get(node_id)
    }

    /// Find the node registered for a state hash.
    pub fn find_by_hash(&self, state_hash: &str) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, entry)| entry.state_hash == state_hash)
            .map(|(id, _)| id.as_str())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for ExplorationIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// One hop of a replayable path from the root.
///
/// `action` is the edge taken out of `node_id`; the final step names the
/// target and has no action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub node_id: String,
    pub action: Option<String>,
    pub script_reference: Option<PathBuf>,
}

// ── Collaborator payloads ────────────────────────────────────────────

/// What the browser reports about the page it is showing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub dom_summary: String,
    #[serde(default)]
    pub title: String,
    /// Digest supplied by the driver; computed from `dom_summary` when absent.
    #[serde(default)]
    pub dom_fingerprint: Option<String>,
}

/// Output of the page-understanding step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub frontier_tasks: Vec<Task>,
    #[serde(default)]
    pub test_ideas: Vec<TestIdea>,
}

/// Result of executing one task in the browser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub screenshot_before: Option<String>,
    #[serde(default)]
    pub screenshot_after: Option<String>,
    #[serde(default)]
    pub dom_before: String,
    #[serde(default)]
    pub dom_after: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// Verdict of the trajectory-judgment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryLabel {
    pub is_meaningful: bool,
    #[serde(default)]
    pub semantic_label: String,
    #[serde(default)]
    pub script_name: String,
    #[serde(default)]
    pub confidence: f64,
}
