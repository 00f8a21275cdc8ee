#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use tubequeue_engine::config::{AuthParams, DownloadSettings};
use tubequeue_engine::events::{EventSink, ExitInfo, TaskEvent};
use tubequeue_engine::notify::TaskObserver;
use tubequeue_engine::process::{LaunchRequest, Launcher, ProcessHandle};
use tubequeue_engine::store::TaskStore;
use tubequeue_engine::supervisor::{QueueSnapshot, Supervisor, SupervisorParts};
use tubequeue_engine::task::{Task, TaskStatus};
use tubequeue_engine::{EngineError, Result};

/// What a launch was asked to do.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub task_id: String,
    pub download_dir: PathBuf,
    pub auth: AuthParams,
}

#[derive(Default)]
struct FakeState {
    sinks: HashMap<String, EventSink>,
    launches: Vec<LaunchRecord>,
    live: HashSet<String>,
    max_live: usize,
    terminated: Vec<String>,
    rejected_urls: HashSet<String>,
    kill_error: Option<String>,
}

/// Launcher that starts nothing; tests drive each run through its sink.
#[derive(Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake launcher state")
    }

    pub fn reject_url(&self, url: &str) {
        self.state().rejected_urls.insert(url.to_string());
    }

    pub fn accept_url(&self, url: &str) {
        self.state().rejected_urls.remove(url);
    }

    pub fn fail_kills(&self, message: &str) {
        self.state().kill_error = Some(message.to_string());
    }

    /// Task ids in launch order, repeats included.
    pub fn started(&self) -> Vec<String> {
        self.state().launches.iter().map(|l| l.task_id.clone()).collect()
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state().launches.clone()
    }

    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<String> = self.state().live.iter().cloned().collect();
        live.sort();
        live
    }

    pub fn max_live(&self) -> usize {
        self.state().max_live
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    /// Sink of the most recent run of `task_id`.
    pub fn sink(&self, task_id: &str) -> EventSink {
        self.state()
            .sinks
            .get(task_id)
            .cloned()
            .expect("task was launched")
    }

    pub fn emit(&self, task_id: &str, event: TaskEvent) {
        self.sink(task_id).send(event);
    }
}

impl Launcher for FakeLauncher {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state();
        if state.rejected_urls.contains(&request.task.url) {
            return Err(EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            });
        }

        let task_id = request.task.id.clone();
        state.launches.push(LaunchRecord {
            task_id: task_id.clone(),
            download_dir: request.download_dir.to_path_buf(),
            auth: request.auth.clone(),
        });
        state.live.insert(task_id.clone());
        state.max_live = state.max_live.max(state.live.len());
        state.sinks.insert(task_id.clone(), events);

        Ok(Box::new(FakeProcess {
            task_id,
            state: self.state.clone(),
        }))
    }
}

struct FakeProcess {
    task_id: String,
    state: Arc<Mutex<FakeState>>,
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate_tree(&mut self) -> std::io::Result<()> {
        let mut state = self.state.lock().expect("fake launcher state");
        state.live.remove(&self.task_id);
        state.terminated.push(self.task_id.clone());
        match state.kill_error.as_ref() {
            Some(message) => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                message.clone(),
            )),
            None => Ok(()),
        }
    }

    fn reap(&mut self) {
        let mut state = self.state.lock().expect("fake launcher state");
        state.live.remove(&self.task_id);
    }
}

/// In-memory store whose writes can be made to fail.
#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<Vec<Task>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn insert(&self, task: &Task) {
        self.tasks.lock().expect("tasks").push(task.clone());
    }

    pub fn get(&self, id: &str) -> Task {
        self.get_task(id).expect("get").expect("task exists")
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }

    fn with_task(&self, id: &str, update: impl FnOnce(&mut Task)) -> Result<()> {
        self.check_writable()?;
        if let Some(task) = self.tasks.lock().expect("tasks").iter_mut().find(|t| t.id == id) {
            update(task);
        }
        Ok(())
    }
}

impl TaskStore for MemoryStore {
    fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.lock().expect("tasks").clone())
    }

    fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .lock()
            .expect("tasks")
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    fn upsert_task(&self, task: &Task) -> Result<Task> {
        self.check_writable()?;
        let mut tasks = self.tasks.lock().expect("tasks");
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task.clone(),
            None => tasks.push(task.clone()),
        }
        Ok(task.clone())
    }

    fn update_progress(
        &self,
        id: &str,
        progress_text: &str,
        status: TaskStatus,
        error_text: &str,
    ) -> Result<()> {
        self.with_task(id, |task| {
            task.progress_text = progress_text.to_string();
            task.status = status;
            task.error_text = error_text.to_string();
        })
    }

    fn update_destination_path(&self, id: &str, path: &Path) -> Result<()> {
        self.with_task(id, |task| task.file_path = Some(path.to_path_buf()))
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        self.check_writable()?;
        self.tasks.lock().expect("tasks").retain(|t| t.id != id);
        Ok(())
    }

    fn reset_running_to_pending(&self) -> Result<usize> {
        self.check_writable()?;
        let mut count = 0;
        for task in self.tasks.lock().expect("tasks").iter_mut() {
            if task.status == TaskStatus::Downloading {
                task.status = TaskStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Observer that keeps every broadcast.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Task>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn all(&self) -> Vec<Task> {
        self.seen.lock().expect("seen").clone()
    }

    pub fn history(&self, id: &str) -> Vec<Task> {
        self.all().into_iter().filter(|t| t.id == id).collect()
    }

    pub fn last(&self, id: &str) -> Option<Task> {
        self.history(id).pop()
    }
}

impl TaskObserver for Recorder {
    fn on_task_changed(&self, task: &Task) {
        self.seen.lock().expect("seen").push(task.clone());
    }
}

/// A supervisor wired to fakes.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub store: Arc<MemoryStore>,
    pub recorder: Arc<Recorder>,
    pub launcher: Arc<FakeLauncher>,
    pub supervisor: Supervisor,
}

impl Harness {
    pub fn start(max_concurrency: usize) -> Self {
        Self::start_with_store(max_concurrency, MemoryStore::new())
    }

    pub fn start_with_store(max_concurrency: usize, store: Arc<MemoryStore>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let recorder = Recorder::new();
        let launcher = FakeLauncher::new();
        let settings = DownloadSettings {
            download_dir: dir.path().join("downloads"),
            max_concurrency,
            auth: AuthParams::default(),
        };
        let supervisor = Supervisor::start(
            SupervisorParts {
                store: store.clone(),
                observer: recorder.clone(),
                launcher: launcher.clone(),
                task_log: None,
            },
            settings,
        )
        .expect("start supervisor");

        Self {
            dir,
            store,
            recorder,
            launcher,
            supervisor,
        }
    }

    /// Creates `count` stored tasks, enqueued in order.
    pub fn enqueue_new(&self, count: usize) -> Vec<Task> {
        let tasks: Vec<Task> = (0..count)
            .map(|i| {
                let task = Task::new(format!("https://example.com/watch?v={i}"));
                self.store.insert(&task);
                task
            })
            .collect();
        self.supervisor.enqueue(tasks.clone()).expect("enqueue");
        tasks
    }

    /// Waits until the control thread has handled everything sent so far.
    pub fn sync(&self) -> QueueSnapshot {
        self.supervisor.snapshot().expect("snapshot")
    }

    /// Reports an output file and a clean exit for the current run.
    pub fn finish_ok(&self, task_id: &str) -> PathBuf {
        let output = self.dir.path().join(format!("{task_id}.mp4"));
        std::fs::write(&output, b"video").expect("write output");
        self.launcher
            .emit(task_id, TaskEvent::DestinationResolved(output.clone()));
        self.launcher
            .emit(task_id, TaskEvent::Terminal(ExitInfo::success()));
        self.sync();
        output
    }
}

/// Polls `check` until it returns true or `timeout` passes.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(50));
    }
    check()
}
