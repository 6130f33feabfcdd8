use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, Row, ToSql, params};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::task::{Task, TaskPriority, TaskStatus};

/// SQLite persistence for tasks and their audit trail.
///
/// One connection behind an async mutex; WAL mode so the dashboard can read
/// while the runner writes.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

impl TaskStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        tracing::info!("task store ready: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace the full task record.
    pub async fn save(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_value(&task.payload)?;
        let tags = task
            .tags
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO tasks (
                id, task_type, url, description, priority, status,
                created_at, updated_at, scheduled_at, executed_at, completed_at,
                result, error_message, retry_count, max_retries,
                task_data, tags, webhook_url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.id.to_string(),
                task.kind().as_str(),
                task.url,
                task.description,
                task.priority,
                task.status,
                task.created_at,
                task.updated_at,
                task.scheduled_at,
                task.executed_at,
                task.completed_at,
                task.result,
                task.error_message,
                task.retry_count,
                task.max_retries,
                payload,
                tags,
                task.webhook_url,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM tasks WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id.to_string()], row_to_task)?;
        match rows.next() {
            Some(task) => Ok(Some(task?)),
            None => Ok(None),
        }
    }

    /// Newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![status, limit as i64], row_to_task)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_task)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(tasks)
    }

    /// Atomically pick the runnable pending task with the highest priority
    /// (FIFO within a priority) and mark it running. Pending tasks whose
    /// retry backoff has not elapsed are skipped.
    pub async fn claim_next_runnable(&self, now: DateTime<Utc>) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;

        let task = {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks
                 WHERE status = 'pending'
                   AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                 ORDER BY priority DESC, created_at ASC
                 LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![now], row_to_task)?;
            match rows.next() {
                Some(task) => task?,
                None => return Ok(None),
            }
        };

        conn.execute(
            "UPDATE tasks SET status = 'running', executed_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, task.id.to_string()],
        )?;

        Ok(Some(Task {
            status: TaskStatus::Running,
            executed_at: Some(now),
            updated_at: now,
            ..task
        }))
    }

    /// Scheduled tasks whose start time has passed.
    pub async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?1
             ORDER BY scheduled_at ASC",
        )?;
        let rows = stmt.query_map(params![now], row_to_task)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status {
                TaskStatus::Pending => counts.pending = count,
                TaskStatus::Running => counts.running = count,
                TaskStatus::Completed => counts.completed = count,
                TaskStatus::Failed => counts.failed = count,
                TaskStatus::Cancelled => counts.cancelled = count,
                TaskStatus::Scheduled => counts.scheduled = count,
            }
        }
        Ok(counts)
    }

    pub async fn log_event(&self, task_id: Uuid, level: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO task_logs (task_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![task_id.to_string(), Utc::now(), level, message],
        )?;
        Ok(())
    }

    pub async fn logs(&self, task_id: Uuid) -> Result<Vec<TaskLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, timestamp, level, message FROM task_logs
             WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![task_id.to_string()], |row| {
            Ok(TaskLogEntry {
                id: row.get(0)?,
                task_id: row.get::<_, String>(1)?,
                timestamp: row.get(2)?,
                level: row.get(3)?,
                message: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// One row of a task's audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Counts per status, for the dashboard stats row.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub scheduled: i64,
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        TaskStatus::parse(value.as_str()?).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for TaskPriority {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_i64().into())
    }
}

impl FromSql for TaskPriority {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_i64()?;
        TaskPriority::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get("id")?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    let payload: serde_json::Value = row.get("task_data")?;
    let payload = serde_json::from_value(payload)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(15, Type::Text, Box::new(e)))?;

    let tags: Option<serde_json::Value> = row.get("tags")?;
    let tags = tags
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(16, Type::Text, Box::new(e)))?;

    Ok(Task {
        id,
        url: row.get("url")?,
        description: row.get("description")?,
        payload,
        priority: row.get("priority")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        scheduled_at: row.get("scheduled_at")?,
        executed_at: row.get("executed_at")?,
        completed_at: row.get("completed_at")?,
        result: row.get("result")?,
        error_message: row.get("error_message")?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        tags,
        webhook_url: row.get("webhook_url")?,
    })
}
