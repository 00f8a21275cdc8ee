use crate::db::{self, OptionalRowExt};
use crate::paths::AppPaths;
use crate::task::{Task, TaskStatus};
use crate::Result;
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};

/// Durable record of download tasks.
///
/// The supervisor calls these synchronously from its control thread. An `Err`
/// never stops the supervisor: it logs the failure and skips the matching
/// broadcast.
pub trait TaskStore: Send + Sync {
    fn list_tasks(&self) -> Result<Vec<Task>>;

    fn get_task(&self, id: &str) -> Result<Option<Task>>;

    fn upsert_task(&self, task: &Task) -> Result<Task>;

    fn update_progress(
        &self,
        id: &str,
        progress_text: &str,
        status: TaskStatus,
        error_text: &str,
    ) -> Result<()>;

    fn update_destination_path(&self, id: &str, path: &Path) -> Result<()>;

    fn delete_task(&self, id: &str) -> Result<()>;

    /// Returns how many rows were moved from `downloading` back to `pending`.
    fn reset_running_to_pending(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
pub struct SqliteTaskStore {
    paths: AppPaths,
}

impl SqliteTaskStore {
    pub fn open(paths: AppPaths) -> Result<Self> {
        db::ensure_schema(&paths)?;
        Ok(Self { paths })
    }

    fn conn(&self) -> Result<Connection> {
        db::open(&self.paths)
    }

    pub fn find_by_url(&self, url: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(
                &format!("{SELECT_TASK} WHERE url=?1 ORDER BY created_at_ms ASC LIMIT 1"),
                [url],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }
}

const SELECT_TASK: &str = r#"
SELECT
  id,
  url,
  title,
  file_path,
  progress_text,
  error_text,
  status,
  created_at_ms
FROM download_task"#;

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(6)?;
    let file_path: Option<String> = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        file_path: file_path.filter(|p| !p.is_empty()).map(PathBuf::from),
        progress_text: row.get(4)?,
        error_text: row.get(5)?,
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Failed),
        created_at_ms: row.get(7)?,
    })
}

impl TaskStore for SqliteTaskStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{SELECT_TASK} ORDER BY created_at_ms ASC, rowid ASC"))?;
        let rows = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row(&format!("{SELECT_TASK} WHERE id=?1"), [id], task_from_row)
            .optional()?;
        Ok(task)
    }

    fn upsert_task(&self, task: &Task) -> Result<Task> {
        let conn = self.conn()?;
        let file_path = task
            .file_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string());
        conn.execute(
            r#"
INSERT INTO download_task (
  id,
  url,
  title,
  file_path,
  progress_text,
  error_text,
  status,
  created_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(id) DO UPDATE SET
  url=excluded.url,
  title=excluded.title,
  file_path=excluded.file_path,
  progress_text=excluded.progress_text,
  error_text=excluded.error_text,
  status=excluded.status
"#,
            params![
                &task.id,
                &task.url,
                &task.title,
                &file_path,
                &task.progress_text,
                &task.error_text,
                task.status.as_str(),
                task.created_at_ms
            ],
        )?;
        Ok(task.clone())
    }

    fn update_progress(
        &self,
        id: &str,
        progress_text: &str,
        status: TaskStatus,
        error_text: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE download_task SET progress_text=?1, status=?2, error_text=?3 WHERE id=?4",
            params![progress_text, status.as_str(), error_text, id],
        )?;
        Ok(())
    }

    fn update_destination_path(&self, id: &str, path: &Path) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE download_task SET file_path=?1 WHERE id=?2",
            params![path.to_string_lossy().to_string(), id],
        )?;
        Ok(())
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM download_task WHERE id=?1", [id])?;
        Ok(())
    }

    fn reset_running_to_pending(&self) -> Result<usize> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE download_task SET status=?1 WHERE status=?2",
            params![
                TaskStatus::Pending.as_str(),
                TaskStatus::Downloading.as_str()
            ],
        )?;
        Ok(updated)
    }
}
