use crate::config::{self, DownloadSettings};
use crate::notify::TaskObserver;
use crate::paths::AppPaths;
use crate::process::{Launcher, YtDlpLauncher};
use crate::store::{SqliteTaskStore, TaskStore};
use crate::supervisor::{Cancellation, QueueSnapshot, Supervisor, SupervisorParts};
use crate::task::{Task, TaskStatus};
use crate::task_log::TaskLog;
use crate::ytdlp::YtDlpCommand;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// User-facing download operations on top of the store and the supervisor.
///
/// A dispatching instance runs downloads; an idle one only reads and edits
/// stored tasks and settings, so nothing it queues starts until a dispatching
/// instance opens the same library.
pub struct Downloads {
    paths: AppPaths,
    store: Arc<SqliteTaskStore>,
    observer: Arc<dyn TaskObserver>,
    supervisor: Option<Supervisor>,
    task_log: TaskLog,
}

impl Downloads {
    /// Opens the library under `paths` and resumes every pending task.
    pub fn open(paths: AppPaths, observer: Arc<dyn TaskObserver>) -> Result<Self> {
        let launcher = Arc::new(YtDlpLauncher::new(YtDlpCommand::resolve(&paths)));
        Self::open_with_launcher(paths, observer, launcher)
    }

    pub fn open_with_launcher(
        paths: AppPaths,
        observer: Arc<dyn TaskObserver>,
        launcher: Arc<dyn Launcher>,
    ) -> Result<Self> {
        let mut downloads = Self::open_idle(paths, observer)?;
        let settings = config::load_download_settings(&downloads.paths)?;
        downloads.supervisor = Some(Supervisor::start(
            SupervisorParts {
                store: downloads.store.clone(),
                observer: downloads.observer.clone(),
                launcher,
                task_log: Some(downloads.task_log.clone()),
            },
            settings,
        )?);

        let resumed = downloads.resume_pending()?;
        if resumed > 0 {
            info!(count = resumed, "resumed pending downloads");
        }
        Ok(downloads)
    }

    /// Opens the library without starting a supervisor. Stored states are
    /// left as they are, including rows another process is downloading.
    pub fn open_idle(paths: AppPaths, observer: Arc<dyn TaskObserver>) -> Result<Self> {
        paths.ensure_dirs()?;
        let store = Arc::new(SqliteTaskStore::open(paths.clone())?);
        let task_log = TaskLog::new(paths.task_logs_dir());
        Ok(Self {
            paths,
            store,
            observer,
            supervisor: None,
            task_log,
        })
    }

    fn resume_pending(&self) -> Result<usize> {
        let pending: Vec<Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        let count = pending.len();
        if count > 0 {
            self.enqueue(pending)?;
        }
        Ok(count)
    }

    fn enqueue(&self, tasks: Vec<Task>) -> Result<()> {
        match self.supervisor.as_ref() {
            Some(supervisor) => supervisor.enqueue(tasks),
            None => Ok(()),
        }
    }

    fn cancel(&self, id: &str) -> Result<Cancellation> {
        match self.supervisor.as_ref() {
            Some(supervisor) => supervisor.cancel(id),
            None => Ok(Cancellation::NotFound),
        }
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        self.store.list_tasks()
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        self.store
            .get_task(id)?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// Queues `url` for download. A task that already exists for the same URL
    /// is reset and restarted instead of duplicated.
    pub fn add(&self, url: &str, title: Option<String>) -> Result<Task> {
        let url = normalize_download_url(url)?;
        let mut task = match self.store.find_by_url(&url)? {
            Some(existing) => {
                debug!(task_id = %existing.id, "restarting existing task for url");
                self.cancel(&existing.id)?;
                existing
            }
            None => Task::new(url),
        };
        if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
            task.title = Some(title);
        }
        task.status = TaskStatus::Pending;
        task.progress_text = "0".to_string();
        task.error_text.clear();
        task.file_path = None;

        let task = self.store.upsert_task(&task)?;
        self.observer.on_task_changed(&task);
        self.enqueue(vec![task.clone()])?;
        info!(task_id = %task.id, url = %task.url, "download queued");
        Ok(task)
    }

    /// Stops the run first, then decides from the stored state. A task whose
    /// completion was already in flight ends up `completed` and the pause is
    /// rejected.
    pub fn pause(&self, id: &str) -> Result<Task> {
        self.cancel(id)?;

        let mut task = self.get(id)?;
        if !task.status.can_pause() {
            return Err(invalid_transition(&task, "pause"));
        }
        task.status = TaskStatus::Paused;
        self.store
            .update_progress(&task.id, &task.progress_text, task.status, &task.error_text)?;
        self.observer.on_task_changed(&task);
        info!(task_id = %task.id, "download paused");
        Ok(task)
    }

    pub fn resume(&self, id: &str) -> Result<Task> {
        let mut task = self.get(id)?;
        if !task.status.can_resume() {
            return Err(invalid_transition(&task, "resume"));
        }
        task.status = TaskStatus::Pending;
        self.requeue(task)
    }

    pub fn retry(&self, id: &str) -> Result<Task> {
        let mut task = self.get(id)?;
        if !task.status.can_retry() {
            return Err(invalid_transition(&task, "retry"));
        }
        task.status = TaskStatus::Pending;
        task.progress_text = "0".to_string();
        task.error_text.clear();
        self.requeue(task)
    }

    fn requeue(&self, task: Task) -> Result<Task> {
        self.store
            .update_progress(&task.id, &task.progress_text, task.status, &task.error_text)?;
        self.observer.on_task_changed(&task);
        self.enqueue(vec![task.clone()])?;
        info!(task_id = %task.id, "download requeued");
        Ok(task)
    }

    /// Stops the task if needed and forgets it, including its log files.
    /// Deleting an unknown id is not an error.
    pub fn delete(&self, id: &str) -> Result<Cancellation> {
        let cancellation = self.cancel(id)?;
        self.store.delete_task(id)?;
        let removed_logs = self.task_log.remove(id);
        info!(task_id = id, ?cancellation, removed_logs, "download deleted");
        Ok(cancellation)
    }

    /// An idle instance reports an empty queue.
    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        match self.supervisor.as_ref() {
            Some(supervisor) => supervisor.snapshot(),
            None => Ok(QueueSnapshot {
                pending: Vec::new(),
                active: Vec::new(),
                max_concurrency: self.settings()?.max_concurrency,
            }),
        }
    }

    pub fn settings(&self) -> Result<DownloadSettings> {
        config::load_download_settings(&self.paths)
    }

    pub fn set_max_concurrency(&self, value: usize) -> Result<usize> {
        let stored = config::save_max_concurrency(&self.paths, value)?;
        match self.supervisor.as_ref() {
            Some(supervisor) => supervisor.set_max_concurrency(stored),
            None => Ok(stored),
        }
    }

    pub fn set_download_dir(&self, dir: &Path) -> Result<PathBuf> {
        let dir = AppPaths::normalize_base_dir(dir);
        std::fs::create_dir_all(&dir)?;
        config::save_download_dir(&self.paths, &dir)?;
        if let Some(supervisor) = self.supervisor.as_ref() {
            supervisor.set_download_dir(dir.clone())?;
        }
        Ok(dir)
    }

    pub fn set_cookie_file(&self, file: Option<&Path>) -> Result<()> {
        config::save_cookie_file(&self.paths, file)?;
        self.reload_auth()
    }

    pub fn set_browser_name(&self, name: Option<&str>) -> Result<()> {
        config::save_browser_name(&self.paths, name)?;
        self.reload_auth()
    }

    fn reload_auth(&self) -> Result<()> {
        let Some(supervisor) = self.supervisor.as_ref() else {
            return Ok(());
        };
        let settings = config::load_download_settings(&self.paths)?;
        supervisor.set_auth(settings.auth)
    }

    pub fn shutdown(&self) -> Result<()> {
        match self.supervisor.as_ref() {
            Some(supervisor) => supervisor.shutdown(),
            None => Ok(()),
        }
    }
}

fn invalid_transition(task: &Task, action: &'static str) -> EngineError {
    EngineError::InvalidTransition {
        id: task.id.clone(),
        from: task.status,
        action,
    }
}

/// Accepts absolute http(s) URLs with a host; returns the trimmed input.
pub fn normalize_download_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidUrl("empty URL provided".to_string()));
    }

    let parsed = url::Url::parse(trimmed)
        .map_err(|err| EngineError::InvalidUrl(format!("{trimmed}: {err}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(EngineError::InvalidUrl(format!(
            "unsupported URL scheme {}; only http/https are allowed",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(EngineError::InvalidUrl(format!("URL is missing host: {trimmed}")));
    }

    Ok(trimmed.to_string())
}
