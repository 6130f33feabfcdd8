use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of browser work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FormFill,
    Extract,
    Click,
    Upload,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::FormFill => "form_fill",
            TaskKind::Extract => "extract",
            TaskKind::Click => "click",
            TaskKind::Upload => "upload",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific instructions carried by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    FormFill {
        /// Field selector (name, id, or raw CSS) to value.
        fields: BTreeMap<String, String>,
        #[serde(default)]
        submit: bool,
    },
    Extract {
        selectors: Vec<String>,
    },
    Click {
        selectors: Vec<String>,
        #[serde(default = "default_wait_between_ms")]
        wait_between_ms: u64,
    },
    Upload {
        #[serde(default = "default_file_selector")]
        file_selector: String,
        files: Vec<String>,
    },
}

fn default_wait_between_ms() -> u64 {
    1000
}

fn default_file_selector() -> String {
    "input[type=file]".to_string()
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::FormFill { .. } => TaskKind::FormFill,
            TaskPayload::Extract { .. } => TaskKind::Extract,
            TaskPayload::Click { .. } => TaskKind::Click,
            TaskPayload::Upload { .. } => TaskKind::Upload,
        }
    }

    /// How many element operations this payload performs. Used to size the
    /// overall run deadline (each operation gets one timeout slot).
    pub fn op_count(&self) -> usize {
        let n = match self {
            TaskPayload::FormFill { fields, .. } => fields.len(),
            TaskPayload::Extract { selectors } => selectors.len(),
            TaskPayload::Click { selectors, .. } => selectors.len(),
            TaskPayload::Upload { files, .. } => files.len(),
        };
        n.max(1)
    }
}

/// Ordered priority. `Urgent` tasks are claimed before `Low` ones.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    pub fn as_i64(&self) -> i64 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(TaskPriority::Low),
            2 => Some(TaskPriority::Medium),
            3 => Some(TaskPriority::High),
            4 => Some(TaskPriority::Urgent),
            _ => None,
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Scheduled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            "scheduled" => Some(TaskStatus::Scheduled),
            _ => None,
        }
    }

    /// Transitions are monotonic except the retry path (failed -> pending).
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Scheduled, Pending)
                | (Scheduled, Cancelled)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of browser-automation work, as persisted in the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub url: String,
    pub description: String,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub tags: Option<Vec<String>>,
    pub webhook_url: Option<String>,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Request body for creating a task (dashboard POST /tasks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub url: String,
    pub description: String,
    pub payload: TaskPayload,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// What a run produced. Serialized into the task's `result` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutcome {
    FormFill {
        filled: Vec<String>,
        failed: Vec<String>,
        submitted: bool,
    },
    Extract {
        data: BTreeMap<String, Vec<ExtractedElement>>,
        /// Selectors whose snapshot errored (bad selector, evaluation failure).
        failed: Vec<String>,
    },
    Click {
        clicked: Vec<String>,
        failed: Vec<String>,
    },
    Upload {
        uploaded: Vec<String>,
        failed: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedElement {
    pub text: String,
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(TaskPriority::Urgent > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!(TaskPriority::from_i64(4), Some(TaskPriority::Urgent));
        assert_eq!(TaskPriority::from_i64(0), None);
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use TaskStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Failed.can_transition(Pending)); // retry path
        assert!(Scheduled.can_transition(Pending));
        assert!(Pending.can_transition(Cancelled));

        assert!(!Completed.can_transition(Pending));
        assert!(!Running.can_transition(Cancelled));
        assert!(!Pending.can_transition(Completed));
        assert!(!Cancelled.can_transition(Pending));
    }

    #[test]
    fn payload_tag_matches_task_type_column() {
        let payload = TaskPayload::FormFill {
            fields: BTreeMap::from([("email".to_string(), "a@b.c".to_string())]),
            submit: false,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "form_fill");
        assert_eq!(payload.kind().as_str(), "form_fill");
    }

    #[test]
    fn form_fill_submit_defaults_to_false() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"type":"form_fill","fields":{"q":"rust"}}"#).unwrap();
        match payload {
            TaskPayload::FormFill { submit, .. } => assert!(!submit),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn upload_selector_defaults_to_file_input() {
        let payload: TaskPayload =
            serde_json::from_str(r#"{"type":"upload","files":["/tmp/a.txt"]}"#).unwrap();
        match payload {
            TaskPayload::Upload { file_selector, .. } => {
                assert_eq!(file_selector, "input[type=file]")
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn op_count_never_zero() {
        let payload = TaskPayload::Extract { selectors: vec![] };
        assert_eq!(payload.op_count(), 1);
        let payload = TaskPayload::Click {
            selectors: vec!["a".into(), "b".into(), "c".into()],
            wait_between_ms: 100,
        };
        assert_eq!(payload.op_count(), 3);
    }
}
