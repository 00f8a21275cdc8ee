use crate::supervisor::Message;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::mpsc::Sender;

/// Something a running download reported back to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Final output path announced by the downloader.
    DestinationResolved(PathBuf),
    Progress(f64),
    /// Any other output line, verbatim.
    Output(String),
    /// The process exited on its own.
    Terminal(ExitInfo),
    /// Supervision of the process broke down.
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            success: true,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// Sending half handed to a launcher for one run of one task.
///
/// Every event is tagged with the run it belongs to. Once the supervisor has
/// detached that run, its events are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    task_id: String,
    run: u64,
    mailbox: Sender<Message>,
}

impl EventSink {
    pub(crate) fn new(task_id: String, run: u64, mailbox: Sender<Message>) -> Self {
        Self {
            task_id,
            run,
            mailbox,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns false once the supervisor is gone.
    pub fn send(&self, event: TaskEvent) -> bool {
        self.mailbox
            .send(Message::Event {
                task_id: self.task_id.clone(),
                run: self.run,
                event,
            })
            .is_ok()
    }
}
