//! Bounded-concurrency supervision of download subprocesses.
//!
//! A single control thread owns the pending queue and the table of active
//! runs. Callers and subprocess readers talk to it only through its mailbox,
//! so every state change happens in one place and in arrival order.

use crate::config::{self, AuthParams, DownloadSettings};
use crate::events::{EventSink, ExitInfo, TaskEvent};
use crate::notify::TaskObserver;
use crate::process::{LaunchRequest, Launcher, ProcessHandle};
use crate::progress::ProgressGate;
use crate::store::TaskStore;
use crate::task::{format_percent, Task, TaskStatus};
use crate::task_log::TaskLog;
use crate::{EngineError, Result, TaskFailure};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// What `cancel` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cancellation {
    /// The id was neither queued nor running.
    NotFound,
    /// Removed from the pending queue before it started.
    Dequeued,
    /// The running process tree was killed.
    Terminated,
    /// The run was detached but killing its process tree reported an error.
    KillFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    /// Queued ids, next to start first.
    pub pending: Vec<String>,
    /// Running ids, sorted.
    pub active: Vec<String>,
    pub max_concurrency: usize,
}

impl QueueSnapshot {
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}

/// Collaborators the supervisor drives.
pub struct SupervisorParts {
    pub store: Arc<dyn TaskStore>,
    pub observer: Arc<dyn TaskObserver>,
    pub launcher: Arc<dyn Launcher>,
    pub task_log: Option<TaskLog>,
}

#[derive(Debug)]
pub(crate) enum Message {
    Enqueue(Vec<Task>, Sender<()>),
    Cancel(String, Sender<Cancellation>),
    SetMaxConcurrency(usize, Sender<usize>),
    SetDownloadDir(PathBuf, Sender<()>),
    SetAuth(AuthParams, Sender<()>),
    Snapshot(Sender<QueueSnapshot>),
    Event {
        task_id: String,
        run: u64,
        event: TaskEvent,
    },
    Shutdown(Option<Sender<()>>),
}

/// Handle to the control thread. Clones share it; the thread is shut down
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    mailbox: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Starts the control thread.
    ///
    /// Tasks a previous process left in `downloading` are moved back to
    /// `pending` first. Nothing is enqueued automatically; the caller decides
    /// what to feed in.
    pub fn start(parts: SupervisorParts, settings: DownloadSettings) -> Result<Self> {
        match parts.store.reset_running_to_pending() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "requeued downloads interrupted by a previous run"),
            Err(err) => warn!(error = %err, "failed to reset interrupted downloads"),
        }

        let (tx, rx) = mpsc::channel();
        let worker = Worker {
            store: parts.store,
            observer: parts.observer,
            launcher: parts.launcher,
            task_log: parts.task_log,
            settings: DownloadSettings {
                max_concurrency: config::clamp_concurrency(settings.max_concurrency),
                ..settings
            },
            pending: VecDeque::new(),
            active: HashMap::new(),
            next_run: 0,
            mailbox: tx.clone(),
        };
        let handle = thread::Builder::new()
            .name("download-supervisor".to_string())
            .spawn(move || worker.run(rx))?;

        Ok(Self {
            inner: Arc::new(Inner {
                mailbox: tx,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Appends tasks to the queue and starts as many as the limit allows.
    /// Ids already queued or running are skipped.
    pub fn enqueue(&self, tasks: Vec<Task>) -> Result<()> {
        self.request(|reply| Message::Enqueue(tasks, reply))
    }

    /// Stops a task if it is queued or running. Persisted status is left for
    /// the caller to decide.
    pub fn cancel(&self, task_id: &str) -> Result<Cancellation> {
        let task_id = task_id.to_string();
        self.request(|reply| Message::Cancel(task_id, reply))
    }

    /// Clamps to 1..=10 and returns the applied limit. Lowering the limit
    /// never stops running downloads.
    pub fn set_max_concurrency(&self, limit: usize) -> Result<usize> {
        self.request(|reply| Message::SetMaxConcurrency(limit, reply))
    }

    /// Applies to downloads started afterwards.
    pub fn set_download_dir(&self, dir: PathBuf) -> Result<()> {
        self.request(|reply| Message::SetDownloadDir(dir, reply))
    }

    /// Applies to downloads started afterwards.
    pub fn set_auth(&self, auth: AuthParams) -> Result<()> {
        self.request(|reply| Message::SetAuth(auth, reply))
    }

    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        self.request(Message::Snapshot)
    }

    /// Kills every running download, drops the queue and stops the thread.
    pub fn shutdown(&self) -> Result<()> {
        self.request(|reply| Message::Shutdown(Some(reply)))?;
        self.inner.join_worker();
        Ok(())
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Message) -> Result<T> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .mailbox
            .send(build(tx))
            .map_err(|_| EngineError::SupervisorStopped)?;
        rx.recv().map_err(|_| EngineError::SupervisorStopped)
    }
}

impl Inner {
    fn join_worker(&self) {
        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("download supervisor thread panicked");
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.mailbox.send(Message::Shutdown(None));
        self.join_worker();
    }
}

struct ActiveRun {
    run: u64,
    task: Task,
    gate: ProgressGate,
    last_error: Option<String>,
    handle: Box<dyn ProcessHandle>,
}

struct Worker {
    store: Arc<dyn TaskStore>,
    observer: Arc<dyn TaskObserver>,
    launcher: Arc<dyn Launcher>,
    task_log: Option<TaskLog>,
    settings: DownloadSettings,
    pending: VecDeque<Task>,
    active: HashMap<String, ActiveRun>,
    next_run: u64,
    mailbox: Sender<Message>,
}

impl Worker {
    fn run(mut self, inbox: Receiver<Message>) {
        debug!(
            max_concurrency = self.settings.max_concurrency,
            "download supervisor started"
        );
        while let Ok(message) = inbox.recv() {
            match message {
                Message::Enqueue(tasks, reply) => {
                    self.enqueue(tasks);
                    let _ = reply.send(());
                }
                Message::Cancel(task_id, reply) => {
                    let outcome = self.cancel(&task_id);
                    let _ = reply.send(outcome);
                }
                Message::SetMaxConcurrency(limit, reply) => {
                    let applied = self.set_max_concurrency(limit);
                    let _ = reply.send(applied);
                }
                Message::SetDownloadDir(dir, reply) => {
                    info!(dir = %dir.display(), "download directory changed");
                    self.settings.download_dir = dir;
                    let _ = reply.send(());
                }
                Message::SetAuth(auth, reply) => {
                    debug!(
                        cookie_file = auth.cookie_file.is_some(),
                        browser = auth.browser_name.is_some(),
                        "download auth changed"
                    );
                    self.settings.auth = auth;
                    let _ = reply.send(());
                }
                Message::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                Message::Event {
                    task_id,
                    run,
                    event,
                } => self.on_event(task_id, run, event),
                Message::Shutdown(reply) => {
                    self.shutdown();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    break;
                }
            }
        }
        debug!("download supervisor stopped");
    }

    fn is_tracked(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.pending.iter().any(|t| t.id == task_id)
    }

    fn enqueue(&mut self, tasks: Vec<Task>) {
        for task in tasks {
            if self.is_tracked(&task.id) {
                debug!(task_id = %task.id, "task already queued or running");
                continue;
            }
            self.pending.push_back(task);
        }
        self.admit();
    }

    /// Starts queued tasks in order until the limit is reached. A task whose
    /// launch fails is marked failed and does not take a slot.
    fn admit(&mut self) {
        while self.active.len() < self.settings.max_concurrency {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            self.start(task);
        }
    }

    fn start(&mut self, mut task: Task) {
        task.status = TaskStatus::Downloading;
        task.error_text.clear();
        self.persist_progress(&task);

        self.next_run += 1;
        let run = self.next_run;
        let sink = EventSink::new(task.id.clone(), run, self.mailbox.clone());
        let request = LaunchRequest {
            task: &task,
            download_dir: &self.settings.download_dir,
            auth: &self.settings.auth,
        };

        match self.launcher.launch(&request, sink) {
            Ok(handle) => {
                info!(
                    task_id = %task.id,
                    run,
                    pid = ?handle.pid(),
                    url = %task.url,
                    "download started"
                );
                self.log_task(&task.id, "info", "started", serde_json::json!({ "run": run }));
                self.active.insert(
                    task.id.clone(),
                    ActiveRun {
                        run,
                        task,
                        gate: ProgressGate::new(),
                        last_error: None,
                        handle,
                    },
                );
            }
            Err(err) => {
                error!(task_id = %task.id, error = %err, "failed to start download");
                self.fail(task, TaskFailure::Admission(format!("failed to start yt-dlp: {err}")));
            }
        }
    }

    fn on_event(&mut self, task_id: String, run: u64, event: TaskEvent) {
        let current = self.active.get(&task_id).map(|a| a.run);
        if current != Some(run) {
            trace!(task_id = %task_id, run, "dropping event from detached run");
            return;
        }

        match event {
            TaskEvent::DestinationResolved(path) => self.on_destination(&task_id, path),
            TaskEvent::Progress(percent) => self.on_progress(&task_id, percent),
            TaskEvent::Output(line) => self.on_output(&task_id, line),
            TaskEvent::Terminal(exit) => self.on_exit(&task_id, exit),
            TaskEvent::Error(message) => self.on_error(&task_id, message),
        }
    }

    fn on_destination(&mut self, task_id: &str, path: PathBuf) {
        let Some(active) = self.active.get_mut(task_id) else {
            return;
        };
        active.task.file_path = Some(path.clone());
        let task = active.task.clone();

        debug!(task_id, path = %path.display(), "destination resolved");
        match self.store.update_destination_path(task_id, &path) {
            Ok(()) => self.observer.on_task_changed(&task),
            Err(err) => warn!(task_id, error = %err, "failed to persist destination path"),
        }
    }

    fn on_progress(&mut self, task_id: &str, percent: f64) {
        let Some(active) = self.active.get_mut(task_id) else {
            return;
        };
        if !active.gate.accept(percent) {
            trace!(task_id, percent, "progress sample dropped");
            return;
        }
        active.task.progress_text = format_percent(percent);
        active.task.error_text.clear();
        active.task.status = TaskStatus::Downloading;
        let task = active.task.clone();
        self.persist_progress(&task);
    }

    fn on_output(&mut self, task_id: &str, line: String) {
        let Some(active) = self.active.get_mut(task_id) else {
            return;
        };
        let level = if line.starts_with("ERROR:") {
            active.last_error = Some(line.clone());
            "error"
        } else {
            "info"
        };
        self.log_task(task_id, level, "output", serde_json::json!({ "line": line }));
    }

    fn on_exit(&mut self, task_id: &str, exit: ExitInfo) {
        let Some(mut finished) = self.active.remove(task_id) else {
            return;
        };
        finished.handle.reap();

        let outcome = settle(
            &exit,
            finished.task.file_path.as_deref(),
            finished.last_error.as_deref(),
        );
        let mut task = finished.task;
        match outcome {
            Ok(()) => {
                if !exit.success {
                    warn!(task_id, code = ?exit.code, "yt-dlp exited unsuccessfully but the output file exists");
                }
                info!(task_id, run = finished.run, "download completed");
                task.status = TaskStatus::Completed;
                task.progress_text = format_percent(100.0);
                task.error_text.clear();
                self.log_task(task_id, "info", "completed", serde_json::json!({ "code": exit.code }));
                self.persist_progress(&task);
            }
            Err(failure) => {
                warn!(task_id, run = finished.run, code = ?exit.code, error = %failure, "download failed");
                self.fail(task, failure);
            }
        }
        self.admit();
    }

    fn on_error(&mut self, task_id: &str, message: String) {
        let Some(mut broken) = self.active.remove(task_id) else {
            return;
        };
        error!(task_id, run = broken.run, error = %message, "download supervision failed");
        if let Err(err) = broken.handle.terminate_tree() {
            warn!(task_id, error = %err, "failed to kill process tree");
        }
        self.fail(broken.task, TaskFailure::Runtime(message));
        self.admit();
    }

    fn cancel(&mut self, task_id: &str) -> Cancellation {
        if let Some(pos) = self.pending.iter().position(|t| t.id == task_id) {
            self.pending.remove(pos);
            debug!(task_id, "removed task from queue");
            return Cancellation::Dequeued;
        }

        // Detach first so late events from this run are dropped.
        let Some(mut run) = self.active.remove(task_id) else {
            return Cancellation::NotFound;
        };
        let outcome = match run.handle.terminate_tree() {
            Ok(()) => {
                info!(task_id, run = run.run, "download cancelled");
                Cancellation::Terminated
            }
            Err(err) => {
                warn!(task_id, run = run.run, error = %err, "failed to kill process tree");
                Cancellation::KillFailed(err.to_string())
            }
        };
        self.log_task(task_id, "info", "cancelled", serde_json::json!({ "run": run.run }));
        drop(run);

        self.admit();
        outcome
    }

    fn set_max_concurrency(&mut self, limit: usize) -> usize {
        let applied = config::clamp_concurrency(limit);
        if applied != limit {
            debug!(requested = limit, applied, "concurrency limit clamped");
        }
        self.settings.max_concurrency = applied;
        if self.active.len() > applied {
            info!(
                active = self.active.len(),
                limit = applied,
                "running downloads exceed new limit; admissions wait until they drain"
            );
        }
        self.admit();
        applied
    }

    fn snapshot(&self) -> QueueSnapshot {
        let mut active: Vec<String> = self.active.keys().cloned().collect();
        active.sort();
        QueueSnapshot {
            pending: self.pending.iter().map(|t| t.id.clone()).collect(),
            active,
            max_concurrency: self.settings.max_concurrency,
        }
    }

    fn shutdown(&mut self) {
        self.pending.clear();
        for (task_id, mut run) in self.active.drain() {
            if let Err(err) = run.handle.terminate_tree() {
                warn!(task_id = %task_id, error = %err, "failed to kill process tree on shutdown");
            }
        }
    }

    fn fail(&self, mut task: Task, failure: TaskFailure) {
        task.status = TaskStatus::Failed;
        task.error_text = failure.to_string();
        self.log_task(
            &task.id,
            "error",
            "failed",
            serde_json::json!({ "error": task.error_text }),
        );
        self.persist_progress(&task);
    }

    /// Observers only ever see states that made it to the store.
    fn persist_progress(&self, task: &Task) {
        match self.store.update_progress(
            &task.id,
            &task.progress_text,
            task.status,
            &task.error_text,
        ) {
            Ok(()) => self.observer.on_task_changed(task),
            Err(err) => warn!(
                task_id = %task.id,
                status = %task.status,
                error = %err,
                "failed to persist task state; change not broadcast"
            ),
        }
    }

    fn log_task(&self, task_id: &str, level: &str, event: &str, data: serde_json::Value) {
        let Some(log) = self.task_log.as_ref() else {
            return;
        };
        if let Err(err) = log.append(task_id, level, event, data) {
            debug!(task_id, error = %err, "failed to write task log");
        }
    }
}

/// Outcome of a run that exited on its own. The output file decides; the exit
/// status only picks the error text when the file is missing.
fn settle(
    exit: &ExitInfo,
    destination: Option<&Path>,
    last_error: Option<&str>,
) -> std::result::Result<(), TaskFailure> {
    if destination.is_some_and(Path::exists) {
        return Ok(());
    }
    if exit.success {
        return Err(TaskFailure::Integrity);
    }

    let message = match (last_error, exit.code) {
        (Some(line), _) => line.to_string(),
        (None, Some(code)) => format!("yt-dlp exited with code {code}"),
        (None, None) => "yt-dlp was terminated by a signal".to_string(),
    };
    Err(TaskFailure::Runtime(message))
}
