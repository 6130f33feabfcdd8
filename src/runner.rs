use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::controller::WebController;
use crate::error::{AutomationError, Result};
use crate::scheduler::TaskScheduler;
use crate::server::RunnerEvent;
use crate::task::{Task, TaskOutcome, TaskStatus};

/// Single-worker execution loop. One automation run at a time; the browser
/// session lives exactly as long as the run.
pub struct Runner {
    scheduler: Arc<TaskScheduler>,
    config: Config,
    events: broadcast::Sender<RunnerEvent>,
    http: reqwest::Client,
}

impl Runner {
    pub fn new(
        scheduler: Arc<TaskScheduler>,
        config: Config,
        events: broadcast::Sender<RunnerEvent>,
    ) -> Self {
        Self {
            scheduler,
            config,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Poll the queue forever.
    pub async fn run(&self) {
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.config.poll_interval).await,
                Err(err) => {
                    tracing::error!(%err, "runner tick failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Execute runnable tasks until the queue is empty (`--once` mode).
    pub async fn drain(&self) -> Result<usize> {
        let mut executed = 0;
        while self.tick().await? {
            executed += 1;
        }
        Ok(executed)
    }

    /// Promote due tasks and execute at most one. Returns whether a task ran.
    async fn tick(&self) -> Result<bool> {
        let now = Utc::now();
        self.scheduler.promote_due(now).await?;
        match self.scheduler.claim_next(now).await? {
            Some(task) => {
                self.execute(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn execute(&self, task: Task) -> Result<()> {
        tracing::info!(id = %task.id, kind = %task.kind(), url = %task.url, "executing task");
        let _ = self.events.send(RunnerEvent::Started {
            id: task.id,
            description: task.description.clone(),
        });

        let deadline = self.run_deadline(&task);
        let headless = self.config.headless;
        let op_timeout = self.config.web_timeout;
        let screenshot = self.config.screenshot_dir.join(format!("{}.png", task.id));
        let run_task = task.clone();

        let handle = tokio::task::spawn_blocking(move || {
            run_in_browser(run_task, headless, op_timeout, screenshot)
        });

        let outcome = match tokio::time::timeout(deadline, handle).await {
            Err(_) => Err(AutomationError::Deadline(deadline.as_secs())),
            Ok(Err(join_err)) => Err(AutomationError::Browser(format!(
                "run panicked: {join_err}"
            ))),
            Ok(Ok(result)) => result,
        };

        match outcome {
            Ok(outcome) => {
                let result = serde_json::to_value(&outcome)?;
                let updated = self.scheduler.complete_task(&task, result).await?;
                let _ = self.events.send(RunnerEvent::Completed {
                    id: task.id,
                    summary: outcome_summary(&outcome),
                });
                self.notify_webhook(&updated).await;
            }
            Err(err) => {
                let message = err.to_string();
                let updated = self.scheduler.fail_task(&task, &message).await?;
                if updated.status == TaskStatus::Pending {
                    let _ = self.events.send(RunnerEvent::Retrying {
                        id: task.id,
                        attempt: updated.retry_count,
                        max: updated.max_retries,
                    });
                } else {
                    let _ = self.events.send(RunnerEvent::Failed {
                        id: task.id,
                        message,
                    });
                    self.notify_webhook(&updated).await;
                }
            }
        }
        Ok(())
    }

    /// One timeout slot per element operation plus one for the navigation.
    fn run_deadline(&self, task: &Task) -> Duration {
        self.config.web_timeout * (task.payload.op_count() as u32 + 1)
    }

    /// Best effort: delivery failures are logged, never change task state.
    async fn notify_webhook(&self, task: &Task) {
        let Some(url) = &task.webhook_url else { return };

        let body = serde_json::json!({
            "task_id": task.id,
            "status": task.status,
            "description": task.description,
            "result": task.result,
            "error_message": task.error_message,
            "completed_at": task.completed_at,
        });

        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(id = %task.id, "webhook delivered");
            }
            Ok(resp) => {
                tracing::warn!(id = %task.id, status = %resp.status(), "webhook rejected");
                let _ = self
                    .scheduler
                    .store()
                    .log_event(task.id, "WARN", &format!("webhook rejected: {}", resp.status()))
                    .await;
            }
            Err(err) => {
                tracing::warn!(id = %task.id, %err, "webhook delivery failed");
                let _ = self
                    .scheduler
                    .store()
                    .log_event(task.id, "WARN", &format!("webhook delivery failed: {err}"))
                    .await;
            }
        }
    }
}

/// Runs on the blocking pool: launch Chrome, execute the payload, and keep a
/// screenshot of the page when the run fails.
fn run_in_browser(
    task: Task,
    headless: bool,
    op_timeout: Duration,
    screenshot_path: PathBuf,
) -> Result<TaskOutcome> {
    let controller = WebController::new(headless, op_timeout)?;
    match controller.execute(&task) {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            match controller.screenshot(&screenshot_path) {
                Ok(()) => {
                    tracing::info!(path = %screenshot_path.display(), "failure screenshot saved")
                }
                Err(shot_err) => {
                    tracing::debug!(%shot_err, "failure screenshot not captured")
                }
            }
            Err(err)
        }
    }
}

fn outcome_summary(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::FormFill {
            filled,
            failed,
            submitted,
        } => format!(
            "filled {} field(s), {} failed{}",
            filled.len(),
            failed.len(),
            if *submitted { ", submitted" } else { "" }
        ),
        TaskOutcome::Extract { data, failed } => {
            let matches: usize = data.values().map(Vec::len).sum();
            format!(
                "extracted {} element(s) across {} selector(s), {} failed",
                matches,
                data.len(),
                failed.len()
            )
        }
        TaskOutcome::Click { clicked, failed } => {
            format!("clicked {} element(s), {} failed", clicked.len(), failed.len())
        }
        TaskOutcome::Upload { uploaded, failed } => {
            format!("attached {} file(s), {} failed", uploaded.len(), failed.len())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn summaries_read_like_log_lines() {
        let outcome = TaskOutcome::FormFill {
            filled: vec!["email".into(), "name".into()],
            failed: vec![],
            submitted: true,
        };
        assert_eq!(outcome_summary(&outcome), "filled 2 field(s), 0 failed, submitted");

        let outcome = TaskOutcome::Extract {
            data: BTreeMap::from([(
                "h1".to_string(),
                vec![crate::task::ExtractedElement {
                    text: "Hello".into(),
                    tag: "h1".into(),
                    attributes: BTreeMap::new(),
                }],
            )]),
            failed: vec!["div.missing".into()],
        };
        assert_eq!(
            outcome_summary(&outcome),
            "extracted 1 element(s) across 1 selector(s), 1 failed"
        );
    }
}
