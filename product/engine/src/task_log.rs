use crate::task::now_ms;
use crate::Result;
use std::io::Write;
use std::path::{Path, PathBuf};

const TASK_LOG_ROTATE_BYTES: u64 = 5 * 1024 * 1024;
const TASK_LOG_MAX_BACKUPS: usize = 3;

/// Per-task JSONL logs of everything the downloader printed.
#[derive(Debug, Clone)]
pub struct TaskLog {
    dir: PathBuf,
}

impl TaskLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.jsonl"))
    }

    pub fn append(
        &self,
        task_id: &str,
        level: &str,
        event: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let line = serde_json::json!({
            "ts_ms": now_ms(),
            "task_id": task_id,
            "level": level,
            "event": event,
            "data": data
        })
        .to_string();

        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(task_id);
        rotate_task_log_if_needed(&path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?
            .write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    /// Removes the log and its rotated backups; returns how many files went.
    pub fn remove(&self, task_id: &str) -> usize {
        let base_path = self.path_for(task_id);
        let mut removed = 0_usize;
        if base_path.exists() && std::fs::remove_file(&base_path).is_ok() {
            removed += 1;
        }
        for i in 1..=TASK_LOG_MAX_BACKUPS {
            let backup = path_with_suffix(&base_path, &format!(".{i}"));
            if backup.exists() && std::fs::remove_file(backup).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

fn rotate_task_log_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };

    if len < TASK_LOG_ROTATE_BYTES {
        return Ok(());
    }

    rotate_file_backups(path, TASK_LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }

    let oldest = path_with_suffix(path, &format!(".{max_backups}"));
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for i in (1..max_backups).rev() {
        let src = path_with_suffix(path, &format!(".{i}"));
        if src.exists() {
            std::fs::rename(&src, path_with_suffix(path, &format!(".{}", i + 1)))?;
        }
    }
    if path.exists() {
        std::fs::rename(path, path_with_suffix(path, ".1"))?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::new(dir.path().to_path_buf());

        log.append("t1", "info", "output", serde_json::json!({ "line": "a" }))
            .expect("append a");
        log.append("t1", "error", "output", serde_json::json!({ "line": "b" }))
            .expect("append b");

        let contents = std::fs::read_to_string(log.path_for("t1")).expect("read");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["task_id"], "t1");
        assert_eq!(lines[1]["level"], "error");
        assert_eq!(lines[1]["data"]["line"], "b");
    }

    #[test]
    fn rotate_file_backups_shifts_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = dir.path().join("task.jsonl");

        std::fs::write(&log, "main").expect("write main");
        std::fs::write(path_with_suffix(&log, ".1"), "b1").expect("write b1");
        std::fs::write(path_with_suffix(&log, ".2"), "b2").expect("write b2");

        rotate_file_backups(&log, 3).expect("rotate");

        assert!(!log.exists());
        assert_eq!(
            std::fs::read_to_string(path_with_suffix(&log, ".1")).expect("r1"),
            "main"
        );
        assert_eq!(
            std::fs::read_to_string(path_with_suffix(&log, ".2")).expect("r2"),
            "b1"
        );
        assert_eq!(
            std::fs::read_to_string(path_with_suffix(&log, ".3")).expect("r3"),
            "b2"
        );
    }

    #[test]
    fn remove_deletes_log_and_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = TaskLog::new(dir.path().to_path_buf());
        let base = log.path_for("t2");
        std::fs::write(&base, "x").expect("write");
        std::fs::write(path_with_suffix(&base, ".1"), "y").expect("write backup");

        assert_eq!(log.remove("t2"), 2);
        assert_eq!(log.remove("t2"), 0);
    }
}
