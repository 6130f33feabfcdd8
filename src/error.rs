use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskStatus;

/// Error type for task scheduling and browser execution.
#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("browser error: {0}")]
    Browser(String),

    #[error("no element matched selector `{0}`")]
    ElementNotFound(String),

    #[error("run exceeded deadline of {0} seconds")]
    Deadline(u64),

    #[error("file upload failed: {0}")]
    Upload(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

// headless_chrome surfaces anyhow errors from every tab operation.
impl From<anyhow::Error> for AutomationError {
    fn from(err: anyhow::Error) -> Self {
        AutomationError::Browser(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, AutomationError>;
