pub mod local;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor not supported")]
    UnsupportedExecutor(String),
    #[error("application '{0}' is not registered")]
    UnknownApplication(String),
    #[error("no task with handle {0}")]
    UnknownTask(TaskHandle),
    #[error("application process failure")]
    Io(#[from] io::Error),
}

/// Handle for a submitted application run.
pub type TaskHandle = u64;

/// Resources requested for one submission. The local executor only logs
/// them; cluster backends would translate them into an actual placement.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSpec {
    pub num_procs: usize,
    pub num_nodes: usize,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            num_procs: 1,
            num_nodes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Finished(i32),
    /// the child vanished without an exit code
    Failed,
}

/// Contract every executor backend satisfies.
pub trait Executor {
    fn register_application(&self, path: PathBuf, name: &str);
    fn submit(
        &self,
        app_name: &str,
        args: &[String],
        resources: &ResourceSpec,
        workdir: Option<&Path>,
    ) -> Result<TaskHandle, ExecutorError>;
    fn poll(&self, handle: TaskHandle) -> Result<TaskStatus, ExecutorError>;
    /// poll with a bounded wait for the task to finish
    fn wait(&self, handle: TaskHandle, timeout: Duration) -> Result<TaskStatus, ExecutorError>;
}

/// All executor backends, selected by name.
/// (this is deliberately not made with dynamic dispatch to avoid the headache)
#[derive(Debug)]
pub enum Executors {
    Local(local::LocalExecutor),
}

impl Executors {
    pub fn load(name: &str) -> Result<Self, ExecutorError> {
        match name {
            "local" => Ok(Self::Local(local::LocalExecutor::new())),
            other => Err(ExecutorError::UnsupportedExecutor(other.to_owned())),
        }
    }

    pub fn register_application(&self, path: PathBuf, name: &str) {
        match self {
            Self::Local(executor) => executor.register_application(path, name),
        }
    }

    pub fn submit(
        &self,
        app_name: &str,
        args: &[String],
        resources: &ResourceSpec,
        workdir: Option<&Path>,
    ) -> Result<TaskHandle, ExecutorError> {
        match self {
            Self::Local(executor) => executor.submit(app_name, args, resources, workdir),
        }
    }

    pub fn poll(&self, handle: TaskHandle) -> Result<TaskStatus, ExecutorError> {
        match self {
            Self::Local(executor) => executor.poll(handle),
        }
    }

    pub fn wait(&self, handle: TaskHandle, timeout: Duration) -> Result<TaskStatus, ExecutorError> {
        match self {
            Self::Local(executor) => executor.wait(handle, timeout),
        }
    }
}
