use crate::cmd;
use crate::config::AuthParams;
use crate::events::{EventSink, ExitInfo, TaskEvent};
use crate::task::Task;
use crate::ytdlp::{self, OutputLine, YtDlpCommand};
use crate::{EngineError, Result};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

const CHILD_POLL_INTERVAL_MS: u64 = 100;

/// Everything a launcher needs to start one download.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub task: &'a Task,
    pub download_dir: &'a Path,
    pub auth: &'a AuthParams,
}

/// Starts downloads. `launch` must not block on the download itself: output,
/// progress and the final exit are reported through `events`.
pub trait Launcher: Send + Sync {
    fn launch(&self, request: &LaunchRequest<'_>, events: EventSink)
        -> Result<Box<dyn ProcessHandle>>;
}

/// A started download owned by the supervisor.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Kills the process and its descendants and waits until they are gone.
    fn terminate_tree(&mut self) -> std::io::Result<()>;

    /// Releases supervision resources after the process exited on its own.
    fn reap(&mut self);
}

/// Runs yt-dlp as a child process in its own process group.
#[derive(Debug, Clone)]
pub struct YtDlpLauncher {
    command: YtDlpCommand,
}

impl YtDlpLauncher {
    pub fn new(command: YtDlpCommand) -> Self {
        Self { command }
    }
}

impl Launcher for YtDlpLauncher {
    fn launch(
        &self,
        request: &LaunchRequest<'_>,
        events: EventSink,
    ) -> Result<Box<dyn ProcessHandle>> {
        std::fs::create_dir_all(request.download_dir)?;
        let args = ytdlp::build_download_args(&request.task.url, request.download_dir, request.auth);

        let mut cmd = cmd::supervised_command(&self.command.program);
        cmd.args(&self.command.prefix_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => EngineError::ExternalToolMissing {
                tool: self.command.display_name(),
            },
            _ => EngineError::Io(err),
        })?;
        let pid = child.id();

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(EngineError::Io(std::io::Error::new(
                    ErrorKind::Other,
                    "yt-dlp output pipes missing",
                )));
            }
        };

        let stdout_events = events.clone();
        let stdout_handle = thread::spawn(move || forward_output(stdout, &stdout_events));
        let stderr_events = events.clone();
        let stderr_handle = thread::spawn(move || forward_output(stderr, &stderr_events));

        let child = Arc::new(Mutex::new(child));
        let waiter_child = child.clone();
        let waiter = thread::spawn(move || {
            let status = wait_for_exit(&waiter_child);
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            match status {
                Ok(status) => {
                    debug!(task_id = %events.task_id(), pid, %status, "yt-dlp exited");
                    events.send(TaskEvent::Terminal(ExitInfo::from(status)));
                }
                Err(err) => {
                    events.send(TaskEvent::Error(format!(
                        "failed while waiting for yt-dlp: {err}"
                    )));
                }
            }
        });

        Ok(Box::new(ChildProcess {
            pid,
            child,
            waiter: Some(waiter),
        }))
    }
}

struct ChildProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    waiter: Option<JoinHandle<()>>,
}

impl ChildProcess {
    fn join_waiter(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            if waiter.join().is_err() {
                warn!(pid = self.pid, "yt-dlp waiter thread panicked");
            }
        }
    }
}

impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate_tree(&mut self) -> std::io::Result<()> {
        let result = {
            let mut child = lock_child(&self.child);
            let exited = matches!(child.try_wait(), Ok(Some(_)));
            // Helpers may outlive the leader, so the group is signalled either way.
            let tree = terminate_process_tree(self.pid);
            if exited {
                Ok(())
            } else {
                let _ = child.kill();
                tree
            }
        };
        self.join_waiter();
        result
    }

    fn reap(&mut self) {
        self.join_waiter();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.waiter.is_some() {
            let _ = self.terminate_tree();
        }
    }
}

fn lock_child(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait_for_exit(child: &Mutex<Child>) -> std::io::Result<std::process::ExitStatus> {
    loop {
        if let Some(status) = lock_child(child).try_wait()? {
            return Ok(status);
        }
        thread::sleep(Duration::from_millis(CHILD_POLL_INTERVAL_MS));
    }
}

/// Reads a pipe to EOF. yt-dlp redraws progress with `\r`, so both `\r` and
/// `\n` end a line.
fn forward_output(mut pipe: impl Read, events: &EventSink) {
    let mut buf = [0_u8; 4096];
    let mut line: Vec<u8> = Vec::new();
    loop {
        let n = match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                emit_line(&line, events);
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }
    emit_line(&line, events);
}

fn emit_line(raw: &[u8], events: &EventSink) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    let event = match ytdlp::classify_line(text) {
        OutputLine::Destination(path) => TaskEvent::DestinationResolved(path),
        OutputLine::Progress(percent) => TaskEvent::Progress(percent),
        OutputLine::Error(line) | OutputLine::Info(line) => TaskEvent::Output(line),
    };
    events.send(event);
}

/// Kills `pid` and every process it started.
#[cfg(windows)]
pub fn terminate_process_tree(pid: u32) -> std::io::Result<()> {
    let status = cmd::command("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            ErrorKind::Other,
            format!("taskkill exited with {status}"),
        ))
    }
}

/// Kills `pid` and every process it started. The child was spawned as leader
/// of its own process group, so signalling the group reaches all of them.
#[cfg(unix)]
pub fn terminate_process_tree(pid: u32) -> std::io::Result<()> {
    let status = cmd::command("kill")
        .args(["-s", "KILL", "--", &format!("-{pid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            ErrorKind::Other,
            format!("kill of process group {pid} exited with {status}"),
        ))
    }
}

#[cfg(not(any(unix, windows)))]
pub fn terminate_process_tree(pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        ErrorKind::Unsupported,
        format!("cannot terminate process tree of {pid} on this platform"),
    ))
}
