use crate::task::Task;
use std::sync::mpsc::{self, Receiver, Sender};

/// Receives every task change after it has been persisted.
///
/// Called on the supervisor's control thread, so implementations must return
/// quickly and must not call back into the supervisor.
pub trait TaskObserver: Send + Sync {
    fn on_task_changed(&self, task: &Task);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TaskObserver for NoopObserver {
    fn on_task_changed(&self, _task: &Task) {}
}

/// Forwards task snapshots into a channel; a dropped receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: Sender<Task>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<Task>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl TaskObserver for ChannelObserver {
    fn on_task_changed(&self, task: &Task) {
        let _ = self.tx.send(task.clone());
    }
}
