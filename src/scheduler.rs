use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::error::{AutomationError, Result};
use crate::store::{StatusCounts, TaskLogEntry, TaskStore};
use crate::task::{NewTask, Task, TaskStatus};

/// Seconds added per failed attempt before a retry becomes runnable.
pub const RETRY_BACKOFF_STEP_SECS: i64 = 5;

/// Creates tasks, hands them to the runner in priority order, and applies the
/// retry policy when a run fails.
pub struct TaskScheduler {
    store: Arc<TaskStore>,
}

impl TaskScheduler {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Persist a new task. Tasks with a future `scheduled_at` start out
    /// `scheduled` and are promoted once due; everything else is `pending`.
    pub async fn create_task(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let status = match new.scheduled_at {
            Some(at) if at > now => TaskStatus::Scheduled,
            _ => TaskStatus::Pending,
        };

        let task = Task {
            id: Uuid::new_v4(),
            url: new.url,
            description: new.description,
            payload: new.payload,
            priority: new.priority,
            status,
            created_at: now,
            updated_at: now,
            scheduled_at: new.scheduled_at,
            executed_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            retry_count: 0,
            max_retries: new.max_retries,
            tags: new.tags,
            webhook_url: new.webhook_url,
        };

        self.store.save(&task).await?;
        self.store.log_event(task.id, "INFO", "task created").await?;
        tracing::info!(id = %task.id, kind = %task.kind(), status = %task.status, "created task");
        Ok(task)
    }

    pub async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.store
            .get(id)
            .await?
            .ok_or(AutomationError::TaskNotFound(id))
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Result<Vec<Task>> {
        self.store.list(status, limit).await
    }

    pub async fn task_logs(&self, id: Uuid) -> Result<Vec<TaskLogEntry>> {
        // 404 for unknown ids rather than an empty trail
        self.get_task(id).await?;
        self.store.logs(id).await
    }

    pub async fn stats(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }

    /// Move due `scheduled` tasks to `pending`. Returns how many moved.
    pub async fn promote_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_scheduled(now).await?;
        let count = due.len();
        for task in due {
            self.transition(task, TaskStatus::Pending, now, "scheduled start time reached")
                .await?;
        }
        Ok(count)
    }

    /// Claim the next runnable task for execution, marking it `running`.
    pub async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Task>> {
        let Some(task) = self.store.claim_next_runnable(now).await? else {
            return Ok(None);
        };
        self.store
            .log_event(task.id, "INFO", "execution started")
            .await?;
        Ok(Some(task))
    }

    /// Record a successful run.
    pub async fn complete_task(&self, task: &Task, result: serde_json::Value) -> Result<Task> {
        let now = Utc::now();
        let mut updated = self.checked(task, TaskStatus::Completed)?;
        updated.result = Some(result);
        updated.error_message = None;
        updated.completed_at = Some(now);
        updated.updated_at = now;
        self.store.save(&updated).await?;
        self.store
            .log_event(updated.id, "INFO", "task completed")
            .await?;
        tracing::info!(id = %updated.id, "task completed");
        Ok(updated)
    }

    /// Record a failed run. While retries remain the task re-enters `pending`
    /// with a backoff; otherwise it is terminally `failed`.
    pub async fn fail_task(&self, task: &Task, error: &str) -> Result<Task> {
        let now = Utc::now();
        let mut updated = self.checked(task, TaskStatus::Failed)?;
        updated.error_message = Some(error.to_string());
        updated.updated_at = now;

        if updated.retries_remaining() {
            updated.retry_count += 1;
            updated.status = TaskStatus::Pending;
            updated.scheduled_at = Some(now + retry_backoff(updated.retry_count));
            self.store.save(&updated).await?;
            self.store
                .log_event(
                    updated.id,
                    "WARN",
                    &format!(
                        "attempt {}/{} failed, retrying: {error}",
                        updated.retry_count, updated.max_retries
                    ),
                )
                .await?;
            tracing::warn!(
                id = %updated.id,
                attempt = updated.retry_count,
                max = updated.max_retries,
                "task failed, queued for retry"
            );
        } else {
            updated.completed_at = Some(now);
            self.store.save(&updated).await?;
            self.store
                .log_event(updated.id, "ERROR", &format!("task failed: {error}"))
                .await?;
            tracing::error!(id = %updated.id, error, "task failed permanently");
        }
        Ok(updated)
    }

    /// Cancel a task that has not started. Running and finished tasks are
    /// rejected with `InvalidTransition`.
    pub async fn cancel_task(&self, id: Uuid) -> Result<Task> {
        let task = self.get_task(id).await?;
        let updated = self
            .transition(task, TaskStatus::Cancelled, Utc::now(), "cancelled by user")
            .await?;
        tracing::info!(id = %updated.id, "task cancelled");
        Ok(updated)
    }

    async fn transition(
        &self,
        task: Task,
        to: TaskStatus,
        now: DateTime<Utc>,
        note: &str,
    ) -> Result<Task> {
        let mut updated = self.checked(&task, to)?;
        updated.updated_at = now;
        self.store.save(&updated).await?;
        self.store.log_event(updated.id, "INFO", note).await?;
        Ok(updated)
    }

    fn checked(&self, task: &Task, to: TaskStatus) -> Result<Task> {
        if !task.status.can_transition(to) {
            return Err(AutomationError::InvalidTransition {
                from: task.status,
                to,
            });
        }
        let mut updated = task.clone();
        updated.status = to;
        Ok(updated)
    }
}

fn retry_backoff(attempt: u32) -> ChronoDuration {
    let jitter_ms = (rand::random::<f64>() * 1000.0) as i64;
    ChronoDuration::seconds(RETRY_BACKOFF_STEP_SECS * i64::from(attempt))
        + ChronoDuration::milliseconds(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskPayload, TaskPriority};
    use tempfile::NamedTempFile;

    fn new_task(description: &str) -> NewTask {
        NewTask {
            url: "https://example.com".to_string(),
            description: description.to_string(),
            payload: TaskPayload::Extract {
                selectors: vec!["h1".to_string()],
            },
            priority: TaskPriority::Medium,
            scheduled_at: None,
            max_retries: 2,
            tags: None,
            webhook_url: None,
        }
    }

    async fn scheduler() -> (TaskScheduler, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(TaskStore::open(temp.path()).unwrap());
        (TaskScheduler::new(store), temp)
    }

    #[tokio::test]
    async fn create_is_pending_unless_deferred() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;

        let task = sched.create_task(new_task("immediate")).await?;
        assert_eq!(task.status, TaskStatus::Pending);

        let mut deferred = new_task("later");
        deferred.scheduled_at = Some(Utc::now() + ChronoDuration::hours(1));
        let task = sched.create_task(deferred).await?;
        assert_eq!(task.status, TaskStatus::Scheduled);
        Ok(())
    }

    #[tokio::test]
    async fn promotion_makes_due_tasks_claimable() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;

        let mut deferred = new_task("later");
        deferred.scheduled_at = Some(Utc::now() + ChronoDuration::minutes(5));
        let task = sched.create_task(deferred).await?;

        let now = Utc::now();
        assert_eq!(sched.promote_due(now).await?, 0);
        assert!(sched.claim_next(now).await?.is_none());

        let after = now + ChronoDuration::minutes(6);
        assert_eq!(sched.promote_due(after).await?, 1);
        let claimed = sched.claim_next(after).await?.unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        Ok(())
    }

    #[tokio::test]
    async fn failure_retries_until_exhausted() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;
        sched.create_task(new_task("flaky")).await?; // max_retries = 2

        let mut now = Utc::now();
        for attempt in 1..=2u32 {
            let claimed = sched.claim_next(now).await?.unwrap();
            let failed = sched.fail_task(&claimed, "boom").await?;
            assert_eq!(failed.status, TaskStatus::Pending);
            assert_eq!(failed.retry_count, attempt);
            assert!(failed.scheduled_at.unwrap() > now);
            // Jump past the backoff window.
            now = failed.scheduled_at.unwrap() + ChronoDuration::seconds(1);
        }

        let claimed = sched.claim_next(now).await?.unwrap();
        let failed = sched.fail_task(&claimed, "boom").await?;
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("boom"));

        // Terminal: nothing left to claim.
        assert!(sched.claim_next(now + ChronoDuration::hours(1)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn completion_records_result() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;
        sched.create_task(new_task("ok")).await?;

        let claimed = sched.claim_next(Utc::now()).await?.unwrap();
        let done = sched
            .complete_task(&claimed, serde_json::json!({"type": "extract", "data": {}}))
            .await?;
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.result.unwrap()["type"], "extract");
        Ok(())
    }

    #[tokio::test]
    async fn cancel_only_before_execution() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;

        let task = sched.create_task(new_task("cancel me")).await?;
        let cancelled = sched.cancel_task(task.id).await?;
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        sched.create_task(new_task("too late")).await?;
        let running = sched.claim_next(Utc::now()).await?.unwrap();
        let err = sched.cancel_task(running.id).await.unwrap_err();
        assert!(matches!(
            err,
            AutomationError::InvalidTransition {
                from: TaskStatus::Running,
                to: TaskStatus::Cancelled
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;
        let err = sched.get_task(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AutomationError::TaskNotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn audit_trail_follows_the_lifecycle() -> anyhow::Result<()> {
        let (sched, _db) = scheduler().await;
        let task = sched.create_task(new_task("audited")).await?;

        let claimed = sched.claim_next(Utc::now()).await?.unwrap();
        sched.complete_task(&claimed, serde_json::json!({})).await?;

        let logs = sched.task_logs(task.id).await?;
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["task created", "execution started", "task completed"]
        );
        Ok(())
    }
}
