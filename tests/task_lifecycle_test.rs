// End-to-end scheduler/store lifecycle against a real SQLite file.
//
// Exercises the cross-module path the runner drives in production: create ->
// claim -> fail -> backoff -> retry -> complete, without a browser.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::NamedTempFile;

use webpilot::scheduler::TaskScheduler;
use webpilot::store::TaskStore;
use webpilot::task::{NewTask, TaskPayload, TaskPriority, TaskStatus};

fn new_task(description: &str, priority: TaskPriority) -> NewTask {
    NewTask {
        url: "https://example.com".to_string(),
        description: description.to_string(),
        payload: TaskPayload::Extract {
            selectors: vec!["h1".to_string()],
        },
        priority,
        scheduled_at: None,
        max_retries: 1,
        tags: Some(vec!["integration".to_string()]),
        webhook_url: None,
    }
}

async fn scheduler() -> (TaskScheduler, NamedTempFile) {
    let temp = NamedTempFile::new().unwrap();
    let store = Arc::new(TaskStore::open(temp.path()).unwrap());
    (TaskScheduler::new(store), temp)
}

#[tokio::test]
async fn mixed_priority_queue_drains_in_order() {
    let (sched, _db) = scheduler().await;

    let low = sched
        .create_task(new_task("low", TaskPriority::Low))
        .await
        .unwrap();
    let urgent = sched
        .create_task(new_task("urgent", TaskPriority::Urgent))
        .await
        .unwrap();
    let medium = sched
        .create_task(new_task("medium", TaskPriority::Medium))
        .await
        .unwrap();

    let now = Utc::now();
    let order: Vec<_> = [
        sched.claim_next(now).await.unwrap().unwrap().id,
        sched.claim_next(now).await.unwrap().unwrap().id,
        sched.claim_next(now).await.unwrap().unwrap().id,
    ]
    .to_vec();
    assert_eq!(order, vec![urgent.id, medium.id, low.id]);
    assert!(sched.claim_next(now).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_run_retries_once_then_lands_in_failed() {
    let (sched, _db) = scheduler().await;
    let task = sched
        .create_task(new_task("flaky", TaskPriority::High))
        .await
        .unwrap();

    // First attempt fails and is queued again with a backoff.
    let claimed = sched.claim_next(Utc::now()).await.unwrap().unwrap();
    let retried = sched.fail_task(&claimed, "timeout").await.unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.retry_count, 1);
    let backoff_until = retried.scheduled_at.expect("retry should have a backoff");

    // Not claimable before the backoff elapses.
    assert!(
        sched
            .claim_next(backoff_until - ChronoDuration::seconds(2))
            .await
            .unwrap()
            .is_none()
    );

    // Second attempt exhausts the retry budget.
    let claimed = sched
        .claim_next(backoff_until + ChronoDuration::seconds(1))
        .await
        .unwrap()
        .unwrap();
    let dead = sched.fail_task(&claimed, "timeout").await.unwrap();
    assert_eq!(dead.status, TaskStatus::Failed);
    assert_eq!(dead.error_message.as_deref(), Some("timeout"));
    assert!(dead.completed_at.is_some());

    let stats = sched.stats().await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 0);

    // The audit trail tells the whole story.
    let logs = sched.task_logs(task.id).await.unwrap();
    let levels: Vec<&str> = logs.iter().map(|l| l.level.as_str()).collect();
    assert_eq!(levels, vec!["INFO", "INFO", "WARN", "INFO", "ERROR"]);
}

#[tokio::test]
async fn deferred_task_waits_for_promotion() {
    let (sched, _db) = scheduler().await;

    let mut deferred = new_task("nightly export", TaskPriority::Medium);
    deferred.scheduled_at = Some(Utc::now() + ChronoDuration::minutes(10));
    let task = sched.create_task(deferred).await.unwrap();
    assert_eq!(task.status, TaskStatus::Scheduled);

    let now = Utc::now();
    sched.promote_due(now).await.unwrap();
    assert!(sched.claim_next(now).await.unwrap().is_none());

    let later = now + ChronoDuration::minutes(11);
    assert_eq!(sched.promote_due(later).await.unwrap(), 1);
    let claimed = sched.claim_next(later).await.unwrap().unwrap();
    assert_eq!(claimed.id, task.id);
}

#[tokio::test]
async fn completed_task_keeps_its_outcome_for_history() {
    let (sched, _db) = scheduler().await;
    sched
        .create_task(new_task("extract headlines", TaskPriority::Medium))
        .await
        .unwrap();

    let claimed = sched.claim_next(Utc::now()).await.unwrap().unwrap();
    let outcome = serde_json::json!({
        "type": "extract",
        "data": { "h1": [{ "text": "Hello", "tag": "h1", "attributes": {} }] },
        "failed": []
    });
    sched.complete_task(&claimed, outcome).await.unwrap();

    // History query sees the terminal record, payload intact.
    let done = sched
        .list_tasks(Some(TaskStatus::Completed), 10)
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].result.as_ref().unwrap()["type"], "extract");
    assert_eq!(done[0].retry_count, 0);
}
