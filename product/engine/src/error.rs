use thiserror::Error;

use crate::task::TaskStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external tool is missing: {tool}")]
    ExternalToolMissing { tool: String },

    #[error("unknown download task: {0}")]
    TaskNotFound(String),

    #[error("cannot {action} task {id} while it is {from}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        action: &'static str,
    },

    #[error("invalid download url: {0}")]
    InvalidUrl(String),

    #[error("download supervisor is no longer running")]
    SupervisorStopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a single task ended up `Failed`. The display string is what gets stored
/// as the task's error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskFailure {
    /// The subprocess could not be started at all.
    #[error("{0}")]
    Admission(String),

    /// The subprocess reported an error or exited unsuccessfully.
    #[error("{0}")]
    Runtime(String),

    /// Clean exit, but the output file is not on disk.
    #[error("download finished but the output file is missing")]
    Integrity,
}
