#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use taskweave_core::*;

// ---------------------------------------------------------------------------
// 1. Task survives a JSON round trip with nested records intact
// ---------------------------------------------------------------------------

#[test]
fn task_serialization_keeps_review_and_metadata() {
    let mut task = Task::new("Review auth", "Check the JWT module", TaskType::Review)
        .with_priority(5)
        .with_input("working_path", serde_json::json!("./services/auth"));
    task.review = Some(ReviewRecord {
        reviewer: "reviewer".to_string(),
        status: ReviewStatus::ChangesRequested,
        comments: vec!["missing expiry check".to_string()],
    });
    task.metadata
        .insert("created_files".to_string(), serde_json::json!(["src/jwt.rs"]));

    let json = serde_json::to_string(&task).unwrap();
    let back: Task = serde_json::from_str(&json).unwrap();

    assert_eq!(back, task);
    assert_eq!(back.working_path(), Some("./services/auth"));
    assert_eq!(back.created_files(), vec!["src/jwt.rs".to_string()]);
}

// ---------------------------------------------------------------------------
// 2. Every status outside the allow-list is rejected with both names
// ---------------------------------------------------------------------------

#[test]
fn state_machine_rejects_everything_off_the_table() {
    let mut rejected = 0;
    for from in TaskStatus::ALL {
        for to in TaskStatus::ALL {
            let result = from.ensure_transition(to);
            if from.allowed_transitions().contains(&to) {
                assert!(result.is_ok(), "{from} -> {to} should be legal");
            } else {
                let msg = result.unwrap_err().to_string();
                assert!(msg.contains(from.as_str()) && msg.contains(to.as_str()));
                rejected += 1;
            }
        }
    }
    // 8x8 grid minus the 19 legal edges.
    assert_eq!(rejected, 64 - 19);
}

// ---------------------------------------------------------------------------
// 3. Config loads from disk
// ---------------------------------------------------------------------------

#[test]
fn config_loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        data_dir = "/var/lib/taskweave"

        [dispatcher]
        max_concurrent = 3

        [[backends.roles]]
        role = "test"
        provider = "local"
        model_id = "tiny-tester"
        "#
    )
    .unwrap();

    let config = TaskweaveConfig::load(file.path()).unwrap();
    assert_eq!(config.dispatcher.max_concurrent, 3);
    assert_eq!(config.backends.roles[0].model_id, "tiny-tester");
    assert_eq!(
        config.database_path().unwrap(),
        std::path::PathBuf::from("/var/lib/taskweave/taskweave.db")
    );
}
