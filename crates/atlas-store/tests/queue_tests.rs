use std::sync::Arc;

use atlas_ir::types::{ActionKind, Metadata, QueueItem, Task, TaskStatus, TestCategory, TestIdea};
use atlas_store::{StateRegistry, StoreError, TaskQueue, TodoOutcome, TodoRequest};

fn setup() -> (tempfile::TempDir, Arc<StateRegistry>, TaskQueue, String) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(StateRegistry::open(dir.path()).unwrap());
    let node = registry
        .ensure_state("https://app.test/", "root", None, Metadata::new())
        .unwrap()
        .node_id;
    let queue = TaskQueue::new(registry.clone());
    (dir, registry, queue, node)
}

fn task(selector: &str, priority: i32) -> QueueItem {
    Task::new(selector, ActionKind::Click)
        .with_priority(priority)
        .into()
}

fn selectors(tasks: &[Task]) -> Vec<&str> {
    tasks.iter().map(|t| t.selector.as_str()).collect()
}

fn files_in(registry: &StateRegistry, node: &str, dir: &str) -> usize {
    std::fs::read_dir(registry.node_path(node).unwrap().join(dir))
        .unwrap()
        .count()
}

#[test]
fn test_pop_orders_by_priority_then_arrival() {
    let (_dir, _registry, queue, node) = setup();
    let pushed = queue
        .manage_todos(
            &node,
            TodoRequest::Push(vec![
                task("#low", 1),
                task("#high-a", 5),
                task("#mid", 3),
                task("#high-b", 5),
            ]),
        )
        .unwrap();
    assert_eq!(pushed, TodoOutcome::Pushed(4));

    let TodoOutcome::Popped(tasks) = queue
        .manage_todos(&node, TodoRequest::Pop { limit: None })
        .unwrap()
    else {
        panic!("expected popped tasks");
    };
    assert_eq!(selectors(&tasks), vec!["#high-a", "#high-b", "#mid", "#low"]);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Processing));
}

#[test]
fn test_ties_preserve_push_order_across_pushes() {
    let (_dir, _registry, queue, node) = setup();
    queue.push(&node, vec![task("#a", 0), task("#b", 0)]).unwrap();
    queue.push(&node, vec![task("#c", 0)]).unwrap();

    let first = queue.pop(&node, Some(1)).unwrap();
    assert_eq!(selectors(&first), vec!["#a"]);
    let rest = queue.pop(&node, None).unwrap();
    assert_eq!(selectors(&rest), vec!["#b", "#c"]);
}

#[test]
fn test_popped_tasks_move_to_processing_once() {
    let (_dir, registry, queue, node) = setup();
    queue.push(&node, vec![task("#x", 2), task("#y", 1)]).unwrap();

    let popped = queue.pop(&node, None).unwrap();
    assert_eq!(popped.len(), 2);
    assert!(queue.pop(&node, None).unwrap().is_empty());
    assert_eq!(queue.pending_count(&node).unwrap(), 0);

    assert_eq!(files_in(&registry, &node, "todos"), 0);
    let processing = queue.processing(&node).unwrap();
    assert_eq!(selectors(&processing), vec!["#x", "#y"]);
}

#[test]
fn test_empty_pop_is_not_an_error() {
    let (_dir, _registry, queue, node) = setup();
    assert!(queue.pop(&node, None).unwrap().is_empty());
}

#[test]
fn test_push_defaults_status_and_timestamp() {
    let (_dir, _registry, queue, node) = setup();
    let mut done = Task::new("#done", ActionKind::Submit);
    done.status = TaskStatus::Completed;
    queue.push(&node, vec![done.into()]).unwrap();

    let popped = queue.pop(&node, None).unwrap();
    assert_eq!(popped.len(), 1);
    assert!(popped[0].created_at.is_some());
}

#[test]
fn test_test_ideas_are_stored_but_never_popped() {
    let (_dir, _registry, queue, node) = setup();
    let idea = TestIdea::new(TestCategory::Injection, "SQL in the search box");
    queue
        .push(&node, vec![idea.clone().into(), task("#search", 1)])
        .unwrap();

    assert_eq!(queue.pending_count(&node).unwrap(), 1);
    let popped = queue.pop(&node, None).unwrap();
    assert_eq!(selectors(&popped), vec!["#search"]);
    assert!(queue.pop(&node, None).unwrap().is_empty());

    let ideas = queue.test_ideas(&node).unwrap();
    assert_eq!(ideas.len(), 1);
    assert_eq!(ideas[0].id, idea.id);
    assert_eq!(ideas[0].category, TestCategory::Injection);
}

#[test]
fn test_complete_moves_to_completed() {
    let (_dir, registry, queue, node) = setup();
    queue.push(&node, vec![task("#ok", 1), task("#bad", 0)]).unwrap();
    let popped = queue.pop(&node, None).unwrap();

    assert!(queue.complete(&node, &popped[0].id, true).unwrap());
    assert!(queue.complete(&node, &popped[1].id, false).unwrap());
    assert!(!queue.complete(&node, "no-such-task", true).unwrap());

    assert_eq!(files_in(&registry, &node, "processing"), 0);
    let completed = queue.completed(&node).unwrap();
    let statuses: Vec<TaskStatus> = completed.iter().map(|t| t.status).collect();
    assert_eq!(statuses, vec![TaskStatus::Completed, TaskStatus::Failed]);
}

#[test]
fn test_popped_task_survives_crash_and_can_be_requeued() {
    let dir = tempfile::tempdir().unwrap();
    let node = {
        let registry = Arc::new(StateRegistry::open(dir.path()).unwrap());
        let node = registry
            .ensure_state("https://app.test/", "root", None, Metadata::new())
            .unwrap()
            .node_id;
        let queue = TaskQueue::new(registry);
        queue.push(&node, vec![task("#checkout", 9)]).unwrap();
        assert_eq!(queue.pop(&node, None).unwrap().len(), 1);
        // Process dies before the task is executed.
        node
    };

    let registry = Arc::new(StateRegistry::open(dir.path()).unwrap());
    let queue = TaskQueue::new(registry);
    let orphaned = queue.processing(&node).unwrap();
    assert_eq!(selectors(&orphaned), vec!["#checkout"]);

    assert_eq!(queue.requeue_processing(&node).unwrap(), 1);
    assert!(queue.processing(&node).unwrap().is_empty());
    let popped = queue.pop(&node, None).unwrap();
    assert_eq!(popped[0].id, orphaned[0].id);
}

#[test]
fn test_corrupt_record_is_skipped() {
    let (_dir, registry, queue, node) = setup();
    queue.push(&node, vec![task("#good", 0)]).unwrap();
    let todos = registry.node_path(&node).unwrap().join("todos");
    std::fs::write(todos.join("00000099_task_broken.json"), "{ not json").unwrap();

    let popped = queue.pop(&node, None).unwrap();
    assert_eq!(selectors(&popped), vec!["#good"]);
    assert!(todos.join("00000099_task_broken.json").exists());
}

#[test]
fn test_unknown_node() {
    let (_dir, _registry, queue, _node) = setup();
    assert!(matches!(
        queue.push("node_ghost", vec![task("#a", 0)]),
        Err(StoreError::UnknownNode(_))
    ));
    assert!(matches!(
        queue.pop("node_ghost", None),
        Err(StoreError::UnknownNode(_))
    ));
}
