use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "downloading" => Some(TaskStatus::Downloading),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Downloading)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, TaskStatus::Paused)
    }

    pub fn can_retry(&self) -> bool {
        matches!(self, TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested download of a single media item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    /// Final output file, known once the downloader reports it.
    pub file_path: Option<PathBuf>,
    /// Percentage as text ("0".."100"); kept textual so storage and observers
    /// see exactly what was last applied.
    pub progress_text: String,
    pub error_text: String,
    pub status: TaskStatus,
    pub created_at_ms: i64,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            title: None,
            file_path: None,
            progress_text: "0".to_string(),
            error_text: String::new(),
            status: TaskStatus::Pending,
            created_at_ms: now_ms(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

pub fn format_percent(percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0);
    let mut tenths = (percent * 10.0).round() / 10.0;
    // Only a real 100 may read as "100".
    if percent < 100.0 {
        tenths = tenths.min(99.9);
    }
    if tenths.fract() == 0.0 {
        format!("{tenths:.0}")
    } else {
        format!("{tenths:.1}")
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
