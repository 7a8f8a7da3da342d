use super::{Executor, ExecutorError, ResourceSpec, TaskHandle, TaskStatus};
use parking_lot::FairMutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use tracing_unwrap::ResultExt;
use wait_timeout::ChildExt;

/// Executor that launches registered applications as local subprocesses.
/// Shared across worker threads, so the registry and task table sit behind
/// fair mutexes.
#[derive(Debug)]
pub struct LocalExecutor {
    apps: FairMutex<BTreeMap<String, PathBuf>>,
    tasks: FairMutex<BTreeMap<TaskHandle, Child>>,
    next_handle: AtomicU64,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            apps: FairMutex::new(BTreeMap::new()),
            tasks: FairMutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalExecutor {
    fn register_application(&self, path: PathBuf, name: &str) {
        debug!(name, path = ?path, "registered application");
        self.apps.lock().insert(name.to_owned(), path);
    }

    fn submit(
        &self,
        app_name: &str,
        args: &[String],
        resources: &ResourceSpec,
        workdir: Option<&Path>,
    ) -> Result<TaskHandle, ExecutorError> {
        let exec = self
            .apps
            .lock()
            .get(app_name)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownApplication(app_name.to_owned()))?;

        if resources.num_nodes > 1 {
            warn!(
                app = app_name,
                num_nodes = resources.num_nodes,
                "local executor runs everything on one node"
            );
        }

        let mut command = Command::new(&exec);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);

        debug!(app = app_name, handle, pid = child.id(), procs = resources.num_procs, "submitted task");
        self.tasks.lock().insert(handle, child);

        Ok(handle)
    }

    fn poll(&self, handle: TaskHandle) -> Result<TaskStatus, ExecutorError> {
        let mut tasks = self.tasks.lock();
        let child = tasks
            .get_mut(&handle)
            .ok_or(ExecutorError::UnknownTask(handle))?;

        match child.try_wait()? {
            None => Ok(TaskStatus::Running),
            Some(status) => Ok(status
                .code()
                .map(TaskStatus::Finished)
                .unwrap_or(TaskStatus::Failed)),
        }
    }

    fn wait(&self, handle: TaskHandle, timeout: Duration) -> Result<TaskStatus, ExecutorError> {
        let mut tasks = self.tasks.lock();
        let child = tasks
            .get_mut(&handle)
            .ok_or(ExecutorError::UnknownTask(handle))?;

        match child.wait_timeout(timeout).unwrap_or_log() {
            None => Ok(TaskStatus::Running),
            Some(status) => Ok(status
                .code()
                .map(TaskStatus::Finished)
                .unwrap_or(TaskStatus::Failed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::Executors;

    #[test]
    fn runs_a_registered_application_to_completion() {
        let executor = Executors::load("local").unwrap();
        executor.register_application(PathBuf::from("/bin/sh"), "shell");

        let handle = executor
            .submit(
                "shell",
                &["-c".to_owned(), "exit 3".to_owned()],
                &ResourceSpec::default(),
                None,
            )
            .unwrap();

        let status = executor.wait(handle, Duration::from_secs(5)).unwrap();
        assert_eq!(status, TaskStatus::Finished(3));
        // the exit status stays queryable after the child was reaped
        assert_eq!(executor.poll(handle).unwrap(), TaskStatus::Finished(3));
    }

    #[test]
    fn unregistered_applications_are_rejected() {
        let executor = LocalExecutor::new();
        assert!(matches!(
            executor.submit("missing", &[], &ResourceSpec::default(), None),
            Err(ExecutorError::UnknownApplication(_))
        ));
    }

    #[test]
    fn unknown_executors_are_rejected() {
        assert!(matches!(
            Executors::load("slurm"),
            Err(ExecutorError::UnsupportedExecutor(_))
        ));
    }

    #[test]
    fn unknown_handles_are_rejected() {
        let executor = LocalExecutor::new();
        assert!(matches!(
            executor.poll(99),
            Err(ExecutorError::UnknownTask(99))
        ));
    }
}
