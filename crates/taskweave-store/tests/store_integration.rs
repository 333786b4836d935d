#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use taskweave_core::{Task, TaskStatus, TaskType};
use taskweave_store::{SqliteStore, TaskFilter, TaskStore};

// ---------------------------------------------------------------------------
// Concurrent inserts from many tasks all get distinct, gap-free keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_inserts_get_unique_keys() {
    let store: Arc<dyn TaskStore> = Arc::new(SqliteStore::open_in_memory().unwrap());

    let mut handles = Vec::new();
    for i in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert(&Task::new(format!("task {i}"), "d", TaskType::General))
                .await
                .unwrap()
                .key
        }));
    }

    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap());
    }
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 16);
    assert_eq!(keys.first().map(String::as_str), Some("TASK-0001"));
    assert_eq!(keys.last().map(String::as_str), Some("TASK-0016"));
}

// ---------------------------------------------------------------------------
// Full record survives a write/read cycle, blobs included
// ---------------------------------------------------------------------------

#[tokio::test]
async fn task_blobs_survive_storage() {
    let store = SqliteStore::open_in_memory().unwrap();
    let mut task = Task::new("Write tests", "cover the parser", TaskType::Validation)
        .with_dependencies(vec!["TASK-0042".to_string()])
        .with_input("working_path", serde_json::json!("./parser"));
    task.blocks = vec!["TASK-0050".to_string()];
    task.artifacts = vec!["artifact-1".to_string()];
    task.metadata
        .insert("errors".to_string(), serde_json::json!(["flaky fixture"]));
    task.status = TaskStatus::Blocked;

    let stored = store.insert(&task).await.unwrap();
    let back = store.get(stored.id).await.unwrap().unwrap();

    assert_eq!(back.dependencies, vec!["TASK-0042".to_string()]);
    assert_eq!(back.blocks, vec!["TASK-0050".to_string()]);
    assert_eq!(back.working_path(), Some("./parser"));
    assert_eq!(back.reported_errors(), vec!["flaky fixture".to_string()]);
    assert_eq!(back.status, TaskStatus::Blocked);
    assert_eq!(back.readiness_criteria, task.readiness_criteria);

    let blocked = store.list(&TaskFilter::status(TaskStatus::Blocked)).await.unwrap();
    assert_eq!(blocked.len(), 1);
}
