pub mod cmd;
pub mod config;
pub mod db;
pub mod downloads;
mod error;
pub mod events;
pub mod notify;
pub mod paths;
pub mod process;
pub mod progress;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod task_log;
pub mod ytdlp;

pub use error::{EngineError, Result, TaskFailure};
