//! Per-node task collections.
//!
//! Every task or test idea is one JSON file. The directory holding it is
//! authoritative for its lifecycle:
//!
//! ```text
//! todos/       pending tasks and all test ideas
//! processing/  tasks handed out by pop, not yet finished
//! completed/   finished tasks (status completed or failed)
//! ```
//!
//! Files are named `{seq:08}_{task|idea}_{id}.json`. The sequence number
//! gives arrival order and is unique per node across all three
//! directories. Moving between directories is a single `rename`, so a
//! record is never in two places and never in none.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use atlas_ir::types::{QueueItem, Task, TaskStatus, TestIdea};
use chrono::Utc;

use crate::fingerprint::sanitize_action_name;
use crate::fsutil::{io_err, lock, read_json, write_json_atomic};
use crate::registry::{StateRegistry, COMPLETED_DIR, PROCESSING_DIR, TODOS_DIR};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Task,
    Idea,
}

impl RecordKind {
    fn of(item: &QueueItem) -> Self {
        match item {
            QueueItem::Task(_) => Self::Task,
            QueueItem::TestIdea(_) => Self::Idea,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Idea => "idea",
        }
    }
}

#[derive(Debug)]
struct RecordFile {
    seq: u64,
    kind: RecordKind,
    path: PathBuf,
}

fn parse_record_name(name: &str) -> Option<(u64, RecordKind)> {
    let stem = name.strip_suffix(".json")?;
    let mut parts = stem.splitn(3, '_');
    let seq = parts.next()?.parse().ok()?;
    let kind = match parts.next()? {
        "task" => RecordKind::Task,
        "idea" => RecordKind::Idea,
        _ => return None,
    };
    Some((seq, kind))
}

/// Record files in `dir`, in arrival order. A missing directory is empty;
/// temp files and foreign names are ignored.
fn list_records(dir: &Path) -> Result<Vec<RecordFile>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir)(e)),
    };
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((seq, kind)) = parse_record_name(&name) {
            records.push(RecordFile {
                seq,
                kind,
                path: entry.path(),
            });
        }
    }
    records.sort_by_key(|r| r.seq);
    Ok(records)
}

/// Read a record, logging and skipping it if it is corrupt.
fn read_record(path: &Path) -> Option<QueueItem> {
    match read_json::<QueueItem>(path) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable task record");
            None
        }
    }
}

fn move_record(from: &Path, to_dir: &Path) -> Result<PathBuf> {
    let file_name = from.file_name().unwrap_or_default();
    let to = to_dir.join(file_name);
    std::fs::rename(from, &to).map_err(io_err(from))?;
    Ok(to)
}

/// Request form of [`TaskQueue::manage_todos`].
#[derive(Debug, Clone)]
pub enum TodoRequest {
    Push(Vec<QueueItem>),
    /// Pop up to `limit` tasks; `None` pops every pending task.
    Pop { limit: Option<usize> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TodoOutcome {
    Pushed(usize),
    Popped(Vec<Task>),
}

/// Owns the task files of every node in one atlas.
pub struct TaskQueue {
    registry: Arc<StateRegistry>,
    lock: Mutex<()>,
}

impl TaskQueue {
    pub fn new(registry: Arc<StateRegistry>) -> Self {
        Self {
            registry,
            lock: Mutex::new(()),
        }
    }

    /// Single entry point over [`push`](Self::push) and [`pop`](Self::pop).
    pub fn manage_todos(&self, node_id: &str, request: TodoRequest) -> Result<TodoOutcome> {
        match request {
            TodoRequest::Push(items) => self.push(node_id, items).map(TodoOutcome::Pushed),
            TodoRequest::Pop { limit } => self.pop(node_id, limit).map(TodoOutcome::Popped),
        }
    }

    /// Store tasks and test ideas as pending records. Tasks are reset to
    /// `pending` and missing creation times are stamped.
    pub fn push(&self, node_id: &str, items: Vec<QueueItem>) -> Result<usize> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        let todos = node_path.join(TODOS_DIR);
        let mut seq = next_seq(&node_path)?;
        let now = Utc::now();

        let count = items.len();
        for mut item in items {
            match &mut item {
                QueueItem::Task(task) => {
                    task.status = TaskStatus::Pending;
                    task.created_at.get_or_insert(now);
                }
                QueueItem::TestIdea(idea) => {
                    idea.created_at.get_or_insert(now);
                }
            }
            let file = format!(
                "{seq:08}_{}_{}.json",
                RecordKind::of(&item).tag(),
                sanitize_action_name(item.id())
            );
            write_json_atomic(&todos.join(file), &item)?;
            seq += 1;
        }

        tracing::debug!(node_id, count, "pushed todos");
        Ok(count)
    }

    /// Hand out pending tasks, highest priority first and in arrival order
    /// within a priority. Each handed-out record is renamed into
    /// `processing/` before its status is rewritten, so a crash in between
    /// leaves it recoverable there.
    pub fn pop(&self, node_id: &str, limit: Option<usize>) -> Result<Vec<Task>> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        let processing = node_path.join(PROCESSING_DIR);

        let mut pending: Vec<(u64, PathBuf, Task)> = Vec::new();
        for record in list_records(&node_path.join(TODOS_DIR))? {
            if record.kind != RecordKind::Task {
                continue;
            }
            if let Some(QueueItem::Task(task)) = read_record(&record.path) {
                pending.push((record.seq, record.path, task));
            }
        }
        pending.sort_by(|a, b| b.2.priority.cmp(&a.2.priority).then(a.0.cmp(&b.0)));
        pending.truncate(limit.unwrap_or(usize::MAX));

        let mut popped = Vec::with_capacity(pending.len());
        for (_, path, mut task) in pending {
            let moved = move_record(&path, &processing)?;
            task.status = TaskStatus::Processing;
            write_json_atomic(&moved, &QueueItem::Task(task.clone()))?;
            popped.push(task);
        }

        tracing::debug!(node_id, count = popped.len(), "popped todos");
        Ok(popped)
    }

    /// Move a processing task to `completed/` with status `completed` or
    /// `failed`. Returns `false` if the task is not in processing.
    pub fn complete(&self, node_id: &str, task_id: &str, succeeded: bool) -> Result<bool> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);

        for record in list_records(&node_path.join(PROCESSING_DIR))? {
            let Some(QueueItem::Task(mut task)) = read_record(&record.path) else {
                continue;
            };
            if task.id != task_id {
                continue;
            }
            let moved = move_record(&record.path, &node_path.join(COMPLETED_DIR))?;
            task.status = if succeeded {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            write_json_atomic(&moved, &QueueItem::Task(task))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Return every processing record of a node to pending. Used after a
    /// crash left tasks handed out but never finished.
    pub fn requeue_processing(&self, node_id: &str) -> Result<usize> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        let todos = node_path.join(TODOS_DIR);

        let mut count = 0;
        for record in list_records(&node_path.join(PROCESSING_DIR))? {
            let moved = move_record(&record.path, &todos)?;
            if let Some(QueueItem::Task(mut task)) = read_record(&moved) {
                task.status = TaskStatus::Pending;
                write_json_atomic(&moved, &QueueItem::Task(task))?;
            }
            count += 1;
        }
        if count > 0 {
            tracing::info!(node_id, count, "requeued orphaned tasks");
        }
        Ok(count)
    }

    pub fn pending_count(&self, node_id: &str) -> Result<usize> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        Ok(list_records(&node_path.join(TODOS_DIR))?
            .iter()
            .filter(|r| r.kind == RecordKind::Task)
            .count())
    }

    /// Tasks currently handed out.
    pub fn processing(&self, node_id: &str) -> Result<Vec<Task>> {
        self.tasks_in(node_id, PROCESSING_DIR)
    }

    pub fn completed(&self, node_id: &str) -> Result<Vec<Task>> {
        self.tasks_in(node_id, COMPLETED_DIR)
    }

    /// Deferred test ideas stored for a node, in arrival order.
    pub fn test_ideas(&self, node_id: &str) -> Result<Vec<TestIdea>> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        Ok(list_records(&node_path.join(TODOS_DIR))?
            .into_iter()
            .filter(|r| r.kind == RecordKind::Idea)
            .filter_map(|r| match read_record(&r.path) {
                Some(QueueItem::TestIdea(idea)) => Some(idea),
                _ => None,
            })
            .collect())
    }

    fn tasks_in(&self, node_id: &str, dir: &str) -> Result<Vec<Task>> {
        let node_path = self.registry.node_path(node_id)?;
        let _guard = lock(&self.lock);
        Ok(list_records(&node_path.join(dir))?
            .into_iter()
            .filter_map(|r| match read_record(&r.path) {
                Some(QueueItem::Task(task)) => Some(task),
                _ => None,
            })
            .collect())
    }
}

/// One past the highest sequence number used anywhere in the node.
fn next_seq(node_path: &Path) -> Result<u64> {
    let mut max = None;
    for dir in [TODOS_DIR, PROCESSING_DIR, COMPLETED_DIR] {
        if let Some(last) = list_records(&node_path.join(dir))?.last() {
            max = max.max(Some(last.seq));
        }
    }
    Ok(max.map_or(0, |m| m + 1))
}
