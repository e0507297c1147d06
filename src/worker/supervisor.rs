use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::{Child, Command};

use crate::error::HarnessError;
use crate::worker::RunIdentity;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Event subscription forwarded to the worker as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub address: String,
    pub name: String,
}

impl EventFilter {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

/// Where the worker binary lives and which services it talks to.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub program: PathBuf,
    /// Arguments placed before the generated ones.
    pub base_args: Vec<String>,
    pub gateway_url: String,
    pub storage_url: String,
    pub network_url: String,
    pub log_level: String,
}

impl WorkerSettings {
    pub fn new(
        program: impl Into<PathBuf>,
        gateway_url: impl Into<String>,
        storage_url: impl Into<String>,
        network_url: impl Into<String>,
    ) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            gateway_url: gateway_url.into(),
            storage_url: storage_url.into(),
            network_url: network_url.into(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Drop any state stored under the run identity before indexing.
    pub reset_state: bool,
    pub extra_env: Vec<(String, String)>,
    /// Overrides [`WorkerSettings::log_level`] for this run.
    pub log_level: Option<String>,
    /// Use this identity instead of generating one from the test name.
    pub run_id: Option<RunIdentity>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            reset_state: true,
            extra_env: Vec::new(),
            log_level: None,
            run_id: None,
        }
    }
}

/// Launches indexer workers as child processes.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    settings: WorkerSettings,
}

impl WorkerSupervisor {
    pub fn new(settings: WorkerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Starts a worker for `test_name`.
    ///
    /// A launch failure is returned as [`HarnessError::WorkerLaunch`] and is
    /// never retried. The returned handle owns the process: dropping it kills
    /// and reaps the worker.
    pub fn start(
        &self,
        test_name: &str,
        filters: &[EventFilter],
        handler: &str,
        options: WorkerOptions,
    ) -> Result<WorkerHandle, HarnessError> {
        let run_id = options
            .run_id
            .clone()
            .unwrap_or_else(|| RunIdentity::generate(test_name));
        let filters_json = serde_json::to_string(filters)?;
        let log_level = options
            .log_level
            .as_deref()
            .unwrap_or(&self.settings.log_level);

        let mut cmd = Command::new(&self.settings.program);
        cmd.args(&self.settings.base_args)
            .arg("--run-id")
            .arg(run_id.as_str())
            .arg("--gateway")
            .arg(&self.settings.gateway_url)
            .arg("--storage")
            .arg(&self.settings.storage_url)
            .arg("--network")
            .arg(&self.settings.network_url)
            .arg("--filters")
            .arg(&filters_json)
            .arg("--handler")
            .arg(handler);

        if options.reset_state {
            cmd.arg("--reset-state");
        }

        cmd.env("RUST_LOG", log_level);
        for (key, value) in &options.extra_env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);

        debug!(
            "Spawning worker: {} {:?}",
            self.settings.program.display(),
            cmd.as_std().get_args().collect::<Vec<_>>()
        );

        let child = cmd.spawn().map_err(|source| {
            error!("Failed to spawn worker process for run {run_id}: {source}");
            HarnessError::WorkerLaunch {
                run_id: run_id.to_string(),
                source,
            }
        })?;

        info!(
            "Worker process started for run {run_id}: PID {:?}",
            child.id()
        );

        Ok(WorkerHandle::new(run_id, child))
    }
}

type TerminateCallback = Box<dyn FnOnce(&RunIdentity) + Send>;

/// A running worker. The process is terminated on every exit path: an
/// explicit [`terminate`](Self::terminate), or drop during normal scope exit
/// or unwinding.
pub struct WorkerHandle {
    run_id: RunIdentity,
    pid: Option<u32>,
    child: Option<Child>,
    on_terminate: Vec<TerminateCallback>,
}

impl WorkerHandle {
    fn new(run_id: RunIdentity, child: Child) -> Self {
        Self {
            run_id,
            pid: child.id(),
            child: Some(child),
            on_terminate: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &RunIdentity {
        &self.run_id
    }

    /// OS process id, as observed at launch.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Registers a callback run exactly once when the worker is torn down.
    pub fn on_terminate<F>(&mut self, callback: F)
    where
        F: FnOnce(&RunIdentity) + Send + 'static,
    {
        self.on_terminate.push(Box::new(callback));
    }

    /// Whether the process is still alive. A worker that crashed is reaped
    /// here and reports `false`.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                warn!("Worker for run {} exited early: {status}", self.run_id);
                false
            }
            Some(Err(e)) => {
                warn!("Failed to query worker for run {}: {e}", self.run_id);
                false
            }
            None => false,
        }
    }

    /// Kills the worker and waits for it to exit.
    pub async fn terminate(mut self) -> Result<Option<ExitStatus>, HarnessError> {
        let result = match self.child.take() {
            Some(mut child) => self.kill_and_wait(&mut child).await,
            None => Ok(None),
        };
        self.run_callbacks();
        result
    }

    async fn kill_and_wait(&self, child: &mut Child) -> Result<Option<ExitStatus>, HarnessError> {
        let command = format!("terminate worker {}", self.run_id);

        if let Ok(Some(status)) = child.try_wait() {
            info!("Worker for run {} had already exited: {status}", self.run_id);
            return Ok(Some(status));
        }

        child.start_kill().map_err(|e| HarnessError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;
        let status = child.wait().await.map_err(|e| HarnessError::Command {
            command,
            message: e.to_string(),
        })?;

        info!("Worker for run {} terminated: {status}", self.run_id);
        Ok(Some(status))
    }

    fn run_callbacks(&mut self) {
        for callback in self.on_terminate.drain(..) {
            callback(&self.run_id);
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Worker handle for run {} dropped, killing process", self.run_id);
            if let Err(e) = child.start_kill() {
                debug!("Worker for run {} was already gone: {e}", self.run_id);
            }

            // Reap off the dropping thread so no zombie outlives the test.
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = child.wait().await;
                    });
                }
                Err(_) => {
                    let _ = child.try_wait();
                }
            }
        }
        self.run_callbacks();
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("run_id", &self.run_id)
            .field("pid", &self.pid)
            .field("alive", &self.child.is_some())
            .finish()
    }
}
