//! Action Executor (§4.1).
//!
//! Each action type is handled by its own `ActionExecutor` implementation,
//! dispatched on the `Action`'s tag, matching the teacher's `can_handle` /
//! `execute` split: the Test-Plan Engine holds a `Vec<Box<dyn ActionExecutor
//! + Send + Sync>>` and asks each in turn rather than matching on the tag
//! itself, which keeps adding an executor a one-file change.

pub mod file_check;
pub mod http;
pub mod terminal;

use async_trait::async_trait;

use crate::classifier::RawActionResult;
use crate::protocol::Action;

/// Bundle of everything an executor needs that isn't the Action itself.
pub struct ExecutionEnvironment {
    pub workspace_root: std::path::PathBuf,
    pub default_timeout_secs: u64,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    fn can_handle(&self, action: &Action) -> bool;

    async fn execute(&self, action: &Action, env: &ExecutionEnvironment) -> RawActionResult;
}

pub fn default_executors() -> Vec<Box<dyn ActionExecutor + Send + Sync>> {
    vec![
        Box::new(terminal::TerminalCommandExecutor::default()),
        Box::new(file_check::FileCheckExecutor::default()),
        Box::new(http::HttpRequestExecutor::default()),
    ]
}
