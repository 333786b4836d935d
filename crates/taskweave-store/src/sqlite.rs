use crate::store::{FeedbackStats, FeedbackStore, NoticeLog, TaskFilter, TaskStore};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use taskweave_core::{FeedbackEvent, Notice, Task, TaskId, TaskweaveError, TaskweaveResult};
use tracing::{debug, info};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT UNIQUE,
    parent_id INTEGER,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    task_type TEXT NOT NULL,
    assignee TEXT,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    readiness_criteria TEXT NOT NULL DEFAULT '[]',
    readiness_met INTEGER NOT NULL DEFAULT 0,
    completion_criteria TEXT NOT NULL DEFAULT '[]',
    completion_met INTEGER NOT NULL DEFAULT 0,
    dependencies TEXT NOT NULL DEFAULT '[]',
    blocks TEXT NOT NULL DEFAULT '[]',
    input TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    artifacts TEXT NOT NULL DEFAULT '[]',
    review TEXT,
    created_at TEXT NOT NULL,
    assigned_at TEXT,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);

CREATE TABLE IF NOT EXISTS notices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender TEXT NOT NULL,
    recipient TEXT,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    reference_key TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback_events (
    id TEXT PRIMARY KEY,
    task_id INTEGER NOT NULL,
    worker TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    context TEXT NOT NULL DEFAULT 'null',
    suggested_remedy TEXT,
    created_at TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT,
    processing_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_feedback_task ON feedback_events(task_id);
"#;

const TASK_COLUMNS: &str = "id, key, parent_id, title, description, task_type, assignee, status, \
    priority, readiness_criteria, readiness_met, completion_criteria, completion_met, \
    dependencies, blocks, input, result, metadata, artifacts, review, \
    created_at, assigned_at, started_at, completed_at";

const FEEDBACK_COLUMNS: &str = "id, task_id, worker, event_type, severity, message, context, \
    suggested_remedy, created_at, processed, processed_at, processing_error";

/// Format of a task key for a given row id.
pub fn task_key(id: TaskId) -> String {
    format!("TASK-{id:04}")
}

/// SQLite-backed implementation of [`TaskStore`], [`NoticeLog`] and
/// [`FeedbackStore`] sharing one connection.
///
/// Every statement runs on tokio's blocking pool, so the store is safe to
/// use from any runtime flavor.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> TaskweaveResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(storage)?;
        info!(path = %path.display(), "Opened task database");
        Self::init(conn)
    }

    /// A private database that lives as long as the store.
    pub fn open_in_memory() -> TaskweaveResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> TaskweaveResult<Self> {
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> TaskweaveResult<T>
    where
        F: FnOnce(&mut Connection) -> TaskweaveResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || op(&mut conn.lock()))
            .await
            .map_err(|e| TaskweaveError::Storage(format!("storage task failed: {e}")))?
    }
}

fn insert_task(conn: &mut Connection, task: &Task) -> TaskweaveResult<Task> {
    let tx = conn.transaction().map_err(storage)?;
    tx.execute(
        "INSERT INTO tasks (parent_id, title, description, task_type, assignee, status, \
         priority, readiness_criteria, readiness_met, completion_criteria, completion_met, \
         dependencies, blocks, input, result, metadata, artifacts, review, \
         created_at, assigned_at, started_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
         ?17, ?18, ?19, ?20, ?21, ?22)",
        params![
            task.parent_id,
            task.title,
            task.description,
            task.task_type.as_str(),
            task.assignee,
            task.status.as_str(),
            task.priority,
            encode(&task.readiness_criteria)?,
            task.readiness_criteria_met,
            encode(&task.completion_criteria)?,
            task.completion_criteria_met,
            encode(&task.dependencies)?,
            encode(&task.blocks)?,
            encode(&task.input)?,
            task.result,
            encode(&task.metadata)?,
            encode(&task.artifacts)?,
            task.review.as_ref().map(encode).transpose()?,
            ts(&task.created_at),
            task.assigned_at.as_ref().map(ts),
            task.started_at.as_ref().map(ts),
            task.completed_at.as_ref().map(ts),
        ],
    )
    .map_err(storage)?;
    let id = tx.last_insert_rowid();
    let key = task_key(id);
    tx.execute("UPDATE tasks SET key = ?1 WHERE id = ?2", params![key, id])
        .map_err(storage)?;
    tx.commit().map_err(storage)?;

    debug!(task_id = id, key = %key, "Inserted task");
    let mut stored = task.clone();
    stored.id = id;
    stored.key = key;
    Ok(stored)
}

fn update_task(conn: &Connection, task: &Task) -> TaskweaveResult<()> {
    let changed = conn
        .execute(
            "UPDATE tasks SET parent_id = ?1, title = ?2, description = ?3, task_type = ?4, \
             assignee = ?5, status = ?6, priority = ?7, readiness_criteria = ?8, \
             readiness_met = ?9, completion_criteria = ?10, completion_met = ?11, \
             dependencies = ?12, blocks = ?13, input = ?14, result = ?15, metadata = ?16, \
             artifacts = ?17, review = ?18, assigned_at = ?19, started_at = ?20, \
             completed_at = ?21 WHERE id = ?22",
            params![
                task.parent_id,
                task.title,
                task.description,
                task.task_type.as_str(),
                task.assignee,
                task.status.as_str(),
                task.priority,
                encode(&task.readiness_criteria)?,
                task.readiness_criteria_met,
                encode(&task.completion_criteria)?,
                task.completion_criteria_met,
                encode(&task.dependencies)?,
                encode(&task.blocks)?,
                encode(&task.input)?,
                task.result,
                encode(&task.metadata)?,
                encode(&task.artifacts)?,
                task.review.as_ref().map(encode).transpose()?,
                task.assigned_at.as_ref().map(ts),
                task.started_at.as_ref().map(ts),
                task.completed_at.as_ref().map(ts),
                task.id,
            ],
        )
        .map_err(storage)?;
    if changed == 0 {
        return Err(TaskweaveError::NotFound(format!("task {}", task.id)));
    }
    Ok(())
}

/// Append `blocked_key` to the `blocks` column of `key`, leaving every other
/// column as stored.
fn append_blocked(conn: &mut Connection, key: &str, blocked_key: &str) -> TaskweaveResult<()> {
    let tx = conn.transaction().map_err(storage)?;
    let raw: Option<String> = tx
        .query_row("SELECT blocks FROM tasks WHERE key = ?1", params![key], |row| row.get(0))
        .optional()
        .map_err(storage)?;
    let Some(raw) = raw else {
        return Err(TaskweaveError::NotFound(format!("task {key}")));
    };
    let mut blocks: Vec<String> = decode(&raw)?;
    if !blocks.iter().any(|b| b == blocked_key) {
        blocks.push(blocked_key.to_string());
        tx.execute(
            "UPDATE tasks SET blocks = ?1 WHERE key = ?2",
            params![encode(&blocks)?, key],
        )
        .map_err(storage)?;
    }
    tx.commit().map_err(storage)?;
    Ok(())
}

fn query_tasks(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> TaskweaveResult<Vec<Task>> {
    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let rows = stmt
        .query_map(params_from_iter(args), TaskRow::from_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    rows.into_iter().map(TaskRow::into_task).collect()
}

fn query_events(
    conn: &Connection,
    sql: &str,
    args: Vec<SqlValue>,
) -> TaskweaveResult<Vec<FeedbackEvent>> {
    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let rows = stmt
        .query_map(params_from_iter(args), FeedbackRow::from_row)
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    rows.into_iter().map(FeedbackRow::into_event).collect()
}

fn query_notices(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> TaskweaveResult<Vec<Notice>> {
    let mut stmt = conn.prepare(sql).map_err(storage)?;
    let rows = stmt
        .query_map(params_from_iter(args), |row| {
            Ok((
                row.get::<_, i64>("id")?,
                row.get::<_, String>("sender")?,
                row.get::<_, Option<String>>("recipient")?,
                row.get::<_, String>("kind")?,
                row.get::<_, String>("text")?,
                row.get::<_, Option<String>>("reference_key")?,
                row.get::<_, String>("created_at")?,
            ))
        })
        .map_err(storage)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage)?;
    rows.into_iter()
        .map(|(id, sender, recipient, kind, text, reference_key, created_at)| {
            Ok(Notice {
                id,
                sender,
                recipient,
                kind,
                text,
                reference_key,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert(&self, task: &Task) -> TaskweaveResult<Task> {
        let task = task.clone();
        self.blocking(move |conn| insert_task(conn, &task)).await
    }

    async fn get(&self, id: TaskId) -> TaskweaveResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        self.blocking(move |conn| {
            Ok(query_tasks(conn, &sql, vec![SqlValue::Integer(id)])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn get_by_key(&self, key: &str) -> TaskweaveResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE key = ?1");
        let key = SqlValue::Text(key.to_string());
        self.blocking(move |conn| Ok(query_tasks(conn, &sql, vec![key])?.into_iter().next()))
            .await
    }

    async fn update(&self, task: &Task) -> TaskweaveResult<()> {
        let task = task.clone();
        self.blocking(move |conn| update_task(conn, &task)).await
    }

    async fn append_blocked(&self, key: &str, blocked_key: &str) -> TaskweaveResult<()> {
        let (key, blocked_key) = (key.to_string(), blocked_key.to_string());
        self.blocking(move |conn| append_blocked(conn, &key, &blocked_key))
            .await
    }

    async fn delete(&self, id: TaskId) -> TaskweaveResult<bool> {
        self.blocking(move |conn| {
            let removed = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .map_err(storage)?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list(&self, filter: &TaskFilter) -> TaskweaveResult<Vec<Task>> {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(status) = filter.status {
            args.push(SqlValue::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", args.len()));
        }
        if let Some(assignee) = &filter.assignee {
            args.push(SqlValue::Text(assignee.clone()));
            clauses.push(format!("assignee = ?{}", args.len()));
        }
        if let Some(task_type) = filter.task_type {
            args.push(SqlValue::Text(task_type.as_str().to_string()));
            clauses.push(format!("task_type = ?{}", args.len()));
        }
        if let Some(parent_id) = filter.parent_id {
            args.push(SqlValue::Integer(parent_id));
            clauses.push(format!("parent_id = ?{}", args.len()));
        }

        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        self.blocking(move |conn| query_tasks(conn, &sql, args)).await
    }

    async fn dependents_of(&self, key: &str) -> TaskweaveResult<Vec<Task>> {
        // The LIKE prefilter matches on the quoted JSON string; exact
        // membership is confirmed after decoding.
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE dependencies LIKE ?1 ORDER BY created_at ASC, id ASC"
        );
        let pattern = format!("%\"{key}\"%");
        let tasks = self
            .blocking(move |conn| query_tasks(conn, &sql, vec![SqlValue::Text(pattern)]))
            .await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.dependencies.iter().any(|d| d == key))
            .collect())
    }
}

#[async_trait]
impl NoticeLog for SqliteStore {
    async fn append(&self, notice: &Notice) -> TaskweaveResult<i64> {
        let notice = notice.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO notices (sender, recipient, kind, text, reference_key, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    notice.sender,
                    notice.recipient,
                    notice.kind,
                    notice.text,
                    notice.reference_key,
                    ts(&notice.created_at),
                ],
            )
            .map_err(storage)?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn notices(&self, recipient: Option<&str>, limit: usize) -> TaskweaveResult<Vec<Notice>> {
        let (sql, args) = match recipient {
            Some(recipient) => (
                format!(
                    "SELECT * FROM notices WHERE recipient IS NULL OR recipient = ?1 \
                     ORDER BY id DESC LIMIT {limit}"
                ),
                vec![SqlValue::Text(recipient.to_string())],
            ),
            None => (
                format!("SELECT * FROM notices ORDER BY id DESC LIMIT {limit}"),
                Vec::new(),
            ),
        };
        self.blocking(move |conn| query_notices(conn, &sql, args)).await
    }

    async fn notices_about(&self, key: &str) -> TaskweaveResult<Vec<Notice>> {
        let key = SqlValue::Text(key.to_string());
        self.blocking(move |conn| {
            query_notices(
                conn,
                "SELECT * FROM notices WHERE reference_key = ?1 ORDER BY id ASC",
                vec![key],
            )
        })
        .await
    }
}

#[async_trait]
impl FeedbackStore for SqliteStore {
    async fn record(&self, event: &FeedbackEvent) -> TaskweaveResult<()> {
        let event = event.clone();
        self.blocking(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO feedback_events ({FEEDBACK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    event.id.to_string(),
                    event.task_id,
                    event.worker,
                    event.event_type.as_str(),
                    event.severity.as_str(),
                    event.message,
                    encode(&event.context)?,
                    event.suggested_remedy,
                    ts(&event.created_at),
                    event.processed,
                    event.processed_at.as_ref().map(ts),
                    event.processing_error,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
        .await
    }

    async fn events_for_task(&self, task_id: TaskId) -> TaskweaveResult<Vec<FeedbackEvent>> {
        let sql = format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE task_id = ?1 \
             ORDER BY created_at ASC"
        );
        self.blocking(move |conn| query_events(conn, &sql, vec![SqlValue::Integer(task_id)]))
            .await
    }

    async fn unprocessed(&self, limit: usize) -> TaskweaveResult<Vec<FeedbackEvent>> {
        let sql = format!(
            "SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE processed = 0 \
             ORDER BY created_at ASC LIMIT {limit}"
        );
        self.blocking(move |conn| query_events(conn, &sql, Vec::new()))
            .await
    }

    async fn stats(&self, window: Duration) -> TaskweaveResult<FeedbackStats> {
        let events = self
            .blocking(|conn| {
                query_events(
                    conn,
                    &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback_events"),
                    Vec::new(),
                )
            })
            .await?;
        let window = chrono::Duration::from_std(window)
            .map_err(|e| TaskweaveError::Config(format!("Invalid stats window: {e}")))?;
        let since = Utc::now() - window;

        let mut stats = FeedbackStats {
            total: events.len(),
            ..FeedbackStats::default()
        };
        let mut latency_sum = 0.0;
        let mut latency_count = 0usize;
        for event in &events {
            *stats.by_type.entry(event.event_type.to_string()).or_default() += 1;
            *stats.by_severity.entry(event.severity.to_string()).or_default() += 1;
            if !event.processed {
                stats.unprocessed += 1;
            }
            if event.created_at >= since {
                if let Some(processed_at) = event.processed_at {
                    latency_sum += (processed_at - event.created_at).num_milliseconds() as f64;
                    latency_count += 1;
                }
            }
        }
        if latency_count > 0 {
            stats.mean_latency_ms = Some(latency_sum / latency_count as f64);
        }
        Ok(stats)
    }
}

struct TaskRow {
    id: i64,
    key: Option<String>,
    parent_id: Option<i64>,
    title: String,
    description: String,
    task_type: String,
    assignee: Option<String>,
    status: String,
    priority: i32,
    readiness_criteria: String,
    readiness_met: bool,
    completion_criteria: String,
    completion_met: bool,
    dependencies: String,
    blocks: String,
    input: String,
    result: Option<String>,
    metadata: String,
    artifacts: String,
    review: Option<String>,
    created_at: String,
    assigned_at: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            key: row.get("key")?,
            parent_id: row.get("parent_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            task_type: row.get("task_type")?,
            assignee: row.get("assignee")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            readiness_criteria: row.get("readiness_criteria")?,
            readiness_met: row.get("readiness_met")?,
            completion_criteria: row.get("completion_criteria")?,
            completion_met: row.get("completion_met")?,
            dependencies: row.get("dependencies")?,
            blocks: row.get("blocks")?,
            input: row.get("input")?,
            result: row.get("result")?,
            metadata: row.get("metadata")?,
            artifacts: row.get("artifacts")?,
            review: row.get("review")?,
            created_at: row.get("created_at")?,
            assigned_at: row.get("assigned_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_task(self) -> TaskweaveResult<Task> {
        Ok(Task {
            id: self.id,
            key: self.key.unwrap_or_else(|| task_key(self.id)),
            parent_id: self.parent_id,
            title: self.title,
            description: self.description,
            task_type: self.task_type.parse()?,
            assignee: self.assignee,
            status: self.status.parse()?,
            priority: self.priority,
            readiness_criteria: decode(&self.readiness_criteria)?,
            readiness_criteria_met: self.readiness_met,
            completion_criteria: decode(&self.completion_criteria)?,
            completion_criteria_met: self.completion_met,
            dependencies: decode(&self.dependencies)?,
            blocks: decode(&self.blocks)?,
            input: decode(&self.input)?,
            result: self.result,
            metadata: decode(&self.metadata)?,
            artifacts: decode(&self.artifacts)?,
            review: self.review.as_deref().map(decode).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            assigned_at: self.assigned_at.as_deref().map(parse_ts).transpose()?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct FeedbackRow {
    id: String,
    task_id: i64,
    worker: String,
    event_type: String,
    severity: String,
    message: String,
    context: String,
    suggested_remedy: Option<String>,
    created_at: String,
    processed: bool,
    processed_at: Option<String>,
    processing_error: Option<String>,
}

impl FeedbackRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            task_id: row.get("task_id")?,
            worker: row.get("worker")?,
            event_type: row.get("event_type")?,
            severity: row.get("severity")?,
            message: row.get("message")?,
            context: row.get("context")?,
            suggested_remedy: row.get("suggested_remedy")?,
            created_at: row.get("created_at")?,
            processed: row.get("processed")?,
            processed_at: row.get("processed_at")?,
            processing_error: row.get("processing_error")?,
        })
    }

    fn into_event(self) -> TaskweaveResult<FeedbackEvent> {
        Ok(FeedbackEvent {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| TaskweaveError::Storage(format!("bad feedback id '{}': {e}", self.id)))?,
            task_id: self.task_id,
            worker: self.worker,
            event_type: self.event_type.parse()?,
            severity: self.severity.parse()?,
            message: self.message,
            context: decode(&self.context)?,
            suggested_remedy: self.suggested_remedy,
            created_at: parse_ts(&self.created_at)?,
            processed: self.processed,
            processed_at: self.processed_at.as_deref().map(parse_ts).transpose()?,
            processing_error: self.processing_error,
        })
    }
}

fn storage(err: rusqlite::Error) -> TaskweaveError {
    TaskweaveError::Storage(err.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> TaskweaveResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> TaskweaveResult<T> {
    Ok(serde_json::from_str(raw)?)
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> TaskweaveResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| TaskweaveError::Storage(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskweave_core::{FeedbackType, Severity, TaskStatus, TaskType};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_keys() {
        let store = store();
        let a = store
            .insert(&Task::new("A", "first", TaskType::Generation))
            .await
            .unwrap();
        let b = store
            .insert(&Task::new("B", "second", TaskType::Validation))
            .await
            .unwrap();
        assert_eq!(a.key, "TASK-0001");
        assert_eq!(b.key, "TASK-0002");
        assert_eq!(b.id, a.id + 1);
    }

    #[tokio::test]
    async fn test_update_never_rewrites_key() {
        let store = store();
        let mut task = store
            .insert(&Task::new("A", "first", TaskType::General))
            .await
            .unwrap();
        task.key = "HACKED".to_string();
        task.title = "Renamed".to_string();
        task.status = TaskStatus::Ready;
        store.update(&task).await.unwrap();

        let back = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(back.key, "TASK-0001");
        assert_eq!(back.title, "Renamed");
        assert_eq!(back.status, TaskStatus::Ready);
        assert!(store.get_by_key("HACKED").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_task_is_not_found() {
        let store = store();
        let mut task = Task::new("ghost", "d", TaskType::General);
        task.id = 99;
        let err = store.update(&task).await.unwrap_err();
        assert!(matches!(err, TaskweaveError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_orders_by_priority_then_creation() {
        let store = store();
        store
            .insert(&Task::new("low", "d", TaskType::General))
            .await
            .unwrap();
        store
            .insert(&Task::new("high", "d", TaskType::General).with_priority(10))
            .await
            .unwrap();
        store
            .insert(&Task::new("low-later", "d", TaskType::Review))
            .await
            .unwrap();

        let all = store.list(&TaskFilter::default()).await.unwrap();
        let titles: Vec<_> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["high", "low", "low-later"]);

        let reviews = store
            .list(&TaskFilter::default().with_type(TaskType::Review))
            .await
            .unwrap();
        assert_eq!(reviews.len(), 1);

        let capped = store
            .list(&TaskFilter::default().with_limit(2))
            .await
            .unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn test_filter_by_parent_and_assignee() {
        let store = store();
        let parent = store
            .insert(&Task::new("P", "d", TaskType::General))
            .await
            .unwrap();
        let mut child = Task::new("C", "d", TaskType::Generation).with_parent(parent.id);
        child.assignee = Some("coder".to_string());
        store.insert(&child).await.unwrap();

        let children = store.list(&TaskFilter::children_of(parent.id)).await.unwrap();
        assert_eq!(children.len(), 1);
        let mine = store
            .list(&TaskFilter::default().with_assignee("coder"))
            .await
            .unwrap();
        assert_eq!(mine[0].title, "C");
    }

    #[tokio::test]
    async fn test_dependents_of_matches_exact_keys() {
        let store = store();
        store
            .insert(&Task::new("waits on 1", "d", TaskType::General).with_dependencies(vec!["TASK-0001".into()]))
            .await
            .unwrap();
        store
            .insert(&Task::new("waits on 10", "d", TaskType::General).with_dependencies(vec!["TASK-00010".into()]))
            .await
            .unwrap();
        let dependents = store.dependents_of("TASK-0001").await.unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].title, "waits on 1");
    }

    #[tokio::test]
    async fn test_append_blocked_keeps_other_columns() {
        let store = store();
        let mut dep = store
            .insert(&Task::new("A", "first", TaskType::Generation))
            .await
            .unwrap();
        dep.status = TaskStatus::Done;
        dep.result = Some("shipped".to_string());
        store.update(&dep).await.unwrap();

        store.append_blocked("TASK-0001", "TASK-0002").await.unwrap();
        store.append_blocked("TASK-0001", "TASK-0002").await.unwrap();

        let back = store.get(dep.id).await.unwrap().unwrap();
        assert_eq!(back.blocks, vec!["TASK-0002".to_string()]);
        assert_eq!(back.status, TaskStatus::Done);
        assert_eq!(back.result.as_deref(), Some("shipped"));
        assert!(matches!(
            store.append_blocked("TASK-0099", "TASK-0002").await,
            Err(TaskweaveError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writers_on_multi_thread_runtime() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert(&Task::new(format!("t{i}"), "d", TaskType::General))
                    .await
                    .unwrap()
            }));
        }
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().key);
        }
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 8);
        assert_eq!(store.list(&TaskFilter::default()).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = store();
        let task = store
            .insert(&Task::new("gone", "d", TaskType::General))
            .await
            .unwrap();
        assert!(store.delete(task.id).await.unwrap());
        assert!(!store.delete(task.id).await.unwrap());
        assert!(store.get(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_notice_broadcasts_reach_every_recipient() {
        let store = store();
        store
            .append(&Notice::broadcast("manager", "plan_created", "2 subtasks").about("TASK-0001"))
            .await
            .unwrap();
        store
            .append(&Notice::broadcast("manager", "task_blocked", "needs input").to("coder"))
            .await
            .unwrap();
        store
            .append(&Notice::broadcast("manager", "task_blocked", "needs input").to("tester"))
            .await
            .unwrap();

        let coder = store.notices(Some("coder"), 10).await.unwrap();
        assert_eq!(coder.len(), 2);
        assert_eq!(coder[0].kind, "task_blocked");
        assert_eq!(store.notices(None, 10).await.unwrap().len(), 3);
        assert_eq!(store.notices_about("TASK-0001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_record_and_stats() {
        let store = store();
        let mut done = FeedbackEvent::new(1, "coder", FeedbackType::DependencyNeeded, Severity::Warning, "m");
        done.processed = true;
        done.processed_at = Some(done.created_at + chrono::Duration::milliseconds(40));
        store.record(&done).await.unwrap();
        let pending = FeedbackEvent::new(1, "tester", FeedbackType::RepeatedFailure, Severity::Critical, "m");
        store.record(&pending).await.unwrap();

        let stats = store.stats(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unprocessed, 1);
        assert_eq!(stats.by_type["dependency_needed"], 1);
        assert_eq!(stats.by_severity["critical"], 1);
        assert_eq!(stats.mean_latency_ms, Some(40.0));

        // Re-recording the same id overwrites rather than duplicates.
        let mut pending = pending;
        pending.processed = true;
        store.record(&pending).await.unwrap();
        assert!(store.unprocessed(10).await.unwrap().is_empty());
        assert_eq!(store.events_for_task(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert(&Task::new("persisted", "d", TaskType::Research))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let task = store.get_by_key("TASK-0001").await.unwrap().unwrap();
        assert_eq!(task.title, "persisted");
        assert_eq!(task.task_type, TaskType::Research);
    }
}
