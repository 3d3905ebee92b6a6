//! Lazy per-conversation containers.
//!
//! Containers are never created up front: the first shell invocation for
//! a conversation provisions one (read-only rootfs, per-conversation
//! scratch bind-mounted at `/mnt`, capped resources), opens its
//! long-lived shell, and later invocations reuse it.  An idle reaper
//! stops — never removes — long-quiet containers; the next invocation
//! restarts them in place with the scratch contents intact.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_config::ContainerConfig;

pub mod provider;
pub mod runtime;
pub mod shell;

#[cfg(any(test, feature = "inproc"))]
pub mod inproc;

pub use provider::ShellToolProvider;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use shell::{CommandOutcome, ShellError, ShellSession, TIMEOUT_EXIT_CODE, shell_quote};

/// Attempts beyond the first for transient create/start failures.
const TRANSIENT_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    NotCreated,
    Creating,
    Running,
    Stopped,
    Failed,
    Destroyed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::NotCreated => "not-created",
            ContainerState::Creating => "creating",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Failed => "failed",
            ContainerState::Destroyed => "destroyed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// No container can serve this conversation right now (missing image,
    /// failed or destroyed record).  Carries a remediation hint.
    #[error("container unavailable: {0}")]
    Unavailable(String),
    /// Transient runtime trouble; retried internally before surfacing.
    #[error("container runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Result of one command executed against a conversation's container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Monotonic per conversation, survives stop/resume.
    pub command_number: u64,
    /// True when this call provisioned a new container or restarted a
    /// stopped one.
    pub container_was_created_or_resumed: bool,
}

/// Observable fields of a conversation's container record.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub conversation_id: String,
    pub state: ContainerState,
    pub created_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub commands_run: u64,
    pub idle_timeout_seconds: u64,
}

struct ContainerRecord {
    state: ContainerState,
    handle: Option<String>,
    shell: Option<ShellSession>,
    created_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
    commands_run: u64,
}

impl ContainerRecord {
    fn new() -> Self {
        Self {
            state: ContainerState::NotCreated,
            handle: None,
            shell: None,
            created_at: None,
            last_activity: None,
            commands_run: 0,
        }
    }
}

/// Owns every per-conversation container.  Each record carries its own
/// async lock, so operations on one conversation are strictly serial
/// while distinct conversations proceed in parallel.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    cfg: ContainerConfig,
    /// Parent of all per-conversation scratch directories.
    scratch_root: PathBuf,
    records: Mutex<HashMap<String, Arc<AsyncMutex<ContainerRecord>>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cfg: ContainerConfig, scratch_root: PathBuf) -> Self {
        Self {
            runtime,
            cfg,
            scratch_root,
            records: Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
        }
    }

    /// Spawn the idle reaper.  Call once after construction.
    pub fn start(self: &Arc<Self>) {
        let sweep = Duration::from_secs(self.cfg.sweep_interval_seconds.max(1));
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_now().await;
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn record(&self, conversation_id: &str) -> Arc<AsyncMutex<ContainerRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(ContainerRecord::new())))
            .clone()
    }

    fn scratch_dir(&self, conversation_id: &str) -> PathBuf {
        self.scratch_root.join(conversation_id)
    }

    /// Execute one command in the conversation's stateful shell,
    /// provisioning or resuming the container as needed.
    pub async fn execute(
        &self,
        conversation_id: &str,
        command: &str,
        timeout: Duration,
        working_dir: Option<&str>,
    ) -> Result<ExecOutcome, ContainerError> {
        let entry = self.record(conversation_id);
        let mut record = entry.lock().await;

        let created_or_resumed = self.ensure_running(&mut record, conversation_id).await?;

        let full_command = match working_dir {
            Some(dir) => format!("cd -- {} && {{ {command}\n}}", shell_quote(dir)),
            None => command.to_string(),
        };

        let outcome = self
            .run_with_restart(&mut record, conversation_id, &full_command, timeout)
            .await?;

        record.commands_run += 1;
        record.last_activity = Some(Utc::now());
        Ok(ExecOutcome {
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            command_number: record.commands_run,
            container_was_created_or_resumed: created_or_resumed,
        })
    }

    /// Drive the record to `Running` with a live shell.  Returns whether a
    /// container was created or resumed in the process.
    async fn ensure_running(
        &self,
        record: &mut ContainerRecord,
        conversation_id: &str,
    ) -> Result<bool, ContainerError> {
        match record.state {
            ContainerState::Running => {
                if record.shell.as_ref().is_none_or(|s| !s.is_alive()) {
                    // Shell crashed between calls; reopen against the
                    // still-running container.
                    let handle = record.handle.clone().ok_or_else(|| {
                        ContainerError::Runtime("running record has no handle".to_string())
                    })?;
                    record.shell = Some(self.runtime.open_shell(&handle).await?);
                }
                Ok(false)
            }
            ContainerState::NotCreated => {
                record.state = ContainerState::Creating;
                match self.provision(conversation_id).await {
                    Ok((handle, shell)) => {
                        record.handle = Some(handle);
                        record.shell = Some(shell);
                        record.state = ContainerState::Running;
                        record.created_at = Some(Utc::now());
                        record.last_activity = Some(Utc::now());
                        Ok(true)
                    }
                    Err(err) => {
                        record.state = ContainerState::Failed;
                        Err(err)
                    }
                }
            }
            ContainerState::Stopped => {
                let handle = record.handle.clone().ok_or_else(|| {
                    ContainerError::Runtime("stopped record has no handle".to_string())
                })?;
                match self.resume(&handle).await {
                    Ok(shell) => {
                        info!(conversation = conversation_id, container = %handle, "container resumed");
                        record.shell = Some(shell);
                        record.state = ContainerState::Running;
                        record.last_activity = Some(Utc::now());
                        Ok(true)
                    }
                    Err(err) => {
                        record.state = ContainerState::Failed;
                        Err(err)
                    }
                }
            }
            ContainerState::Failed | ContainerState::Destroyed => Err(ContainerError::Unavailable(
                format!(
                    "container for this conversation is {}; reset it with bash_reset",
                    record.state.as_str()
                ),
            )),
            ContainerState::Creating => Err(ContainerError::Runtime(
                "container is mid-provisioning".to_string(),
            )),
        }
    }

    async fn provision(&self, conversation_id: &str) -> Result<(String, ShellSession), ContainerError> {
        let scratch = self.scratch_dir(conversation_id);
        std::fs::create_dir_all(&scratch)
            .map_err(|err| ContainerError::Runtime(format!("cannot create scratch dir: {err}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&scratch, std::fs::Permissions::from_mode(0o755));
        }

        let handle = retry_transient(|| self.runtime.create(conversation_id, &scratch)).await?;
        retry_transient(|| self.runtime.start(&handle)).await?;
        let shell = self.runtime.open_shell(&handle).await?;
        info!(conversation = conversation_id, container = %handle, "container provisioned");
        Ok((handle, shell))
    }

    async fn resume(&self, handle: &str) -> Result<ShellSession, ContainerError> {
        retry_transient(|| self.runtime.start(handle)).await?;
        self.runtime.open_shell(handle).await
    }

    /// One shell run, restarting the shell once if it died mid-call.
    async fn run_with_restart(
        &self,
        record: &mut ContainerRecord,
        conversation_id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, ContainerError> {
        let shell = record
            .shell
            .as_mut()
            .ok_or_else(|| ContainerError::Runtime("running record has no shell".to_string()))?;
        match shell.run(command, timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(ShellError::Dead) => {
                warn!(conversation = conversation_id, "shell died; restarting");
                let handle = record.handle.clone().ok_or_else(|| {
                    ContainerError::Runtime("running record has no handle".to_string())
                })?;
                let mut fresh = self.runtime.open_shell(&handle).await?;
                let outcome = fresh.run(command, timeout).await;
                record.shell = Some(fresh);
                match outcome {
                    Ok(outcome) => Ok(outcome),
                    Err(ShellError::Dead) => Err(ContainerError::Unavailable(
                        "shell keeps dying; reset the conversation with bash_reset".to_string(),
                    )),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn status(&self, conversation_id: &str) -> ContainerStatus {
        let entry = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.get(conversation_id).cloned()
        };
        match entry {
            Some(entry) => {
                let record = entry.lock().await;
                ContainerStatus {
                    conversation_id: conversation_id.to_string(),
                    state: record.state,
                    created_at: record.created_at,
                    last_activity: record.last_activity,
                    commands_run: record.commands_run,
                    idle_timeout_seconds: self.cfg.idle_timeout_seconds,
                }
            }
            None => ContainerStatus {
                conversation_id: conversation_id.to_string(),
                state: ContainerState::NotCreated,
                created_at: None,
                last_activity: None,
                commands_run: 0,
                idle_timeout_seconds: self.cfg.idle_timeout_seconds,
            },
        }
    }

    /// Stop and remove the conversation's container, optionally wiping its
    /// scratch directory, and return the record to `NotCreated` so the
    /// next invocation provisions from scratch.
    pub async fn reset(&self, conversation_id: &str, keep_scratch: bool) -> Result<(), ContainerError> {
        let entry = self.record(conversation_id);
        let mut record = entry.lock().await;

        if let Some(shell) = record.shell.as_mut() {
            shell.close().await;
        }
        record.shell = None;
        if let Some(handle) = record.handle.take() {
            if let Err(err) = self.runtime.stop(&handle).await {
                debug!(container = %handle, %err, "stop during reset failed");
            }
            if let Err(err) = self.runtime.remove(&handle).await {
                warn!(container = %handle, %err, "remove during reset failed");
            }
        }
        record.state = ContainerState::NotCreated;
        record.created_at = None;
        record.last_activity = None;
        record.commands_run = 0;

        if !keep_scratch {
            let scratch = self.scratch_dir(conversation_id);
            if let Err(err) = std::fs::remove_dir_all(&scratch) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %scratch.display(), %err, "cannot wipe scratch dir");
                }
            }
        }
        info!(conversation = conversation_id, keep_scratch, "container reset");
        Ok(())
    }

    /// Stop every running container whose idle timeout has elapsed.
    /// Containers are stopped, never removed: the scratch directory and
    /// the container itself survive for a later resume.
    pub async fn sweep_now(&self) {
        if self.cfg.idle_timeout_seconds == 0 {
            return;
        }
        let entries: Vec<(String, Arc<AsyncMutex<ContainerRecord>>)> = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (conversation_id, entry) in entries {
            let mut record = entry.lock().await;
            if record.state != ContainerState::Running {
                continue;
            }
            let idle = record
                .last_activity
                .map(|at| (Utc::now() - at).num_seconds())
                .unwrap_or(i64::MAX);
            if idle < self.cfg.idle_timeout_seconds as i64 {
                continue;
            }
            if let Some(shell) = record.shell.as_mut() {
                shell.close().await;
            }
            record.shell = None;
            if let Some(handle) = record.handle.clone() {
                match self.runtime.stop(&handle).await {
                    Ok(()) => {
                        record.state = ContainerState::Stopped;
                        info!(conversation = %conversation_id, idle_secs = idle, "idle container stopped");
                    }
                    Err(err) => {
                        warn!(conversation = %conversation_id, %err, "idle stop failed");
                    }
                }
            } else {
                record.state = ContainerState::Stopped;
            }
        }
    }

    /// Stop all running containers.  Best-effort, idempotent; used on
    /// process shutdown.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            reaper.abort();
        }
        let entries: Vec<Arc<AsyncMutex<ContainerRecord>>> = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.values().cloned().collect()
        };
        for entry in entries {
            let mut record = entry.lock().await;
            if record.state != ContainerState::Running {
                continue;
            }
            if let Some(shell) = record.shell.as_mut() {
                shell.close().await;
            }
            record.shell = None;
            if let Some(handle) = record.handle.clone() {
                if let Err(err) = self.runtime.stop(&handle).await {
                    warn!(container = %handle, %err, "stop during shutdown failed");
                }
            }
            record.state = ContainerState::Stopped;
        }
        info!("container manager shut down");
    }

    /// Remove every container and scratch directory.  Used by the
    /// persistence-wide wipe.
    pub async fn destroy_all(&self) {
        let entries: Vec<(String, Arc<AsyncMutex<ContainerRecord>>)> = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.drain().collect()
        };
        for (conversation_id, entry) in entries {
            let mut record = entry.lock().await;
            if let Some(shell) = record.shell.as_mut() {
                shell.close().await;
            }
            record.shell = None;
            if let Some(handle) = record.handle.take() {
                let _ = self.runtime.stop(&handle).await;
                let _ = self.runtime.remove(&handle).await;
            }
            record.state = ContainerState::Destroyed;
            let scratch = self.scratch_dir(&conversation_id);
            let _ = std::fs::remove_dir_all(&scratch);
        }
        info!("all containers destroyed");
    }
}

async fn retry_transient<T, F, Fut>(op: F) -> Result<T, ContainerError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ContainerError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(ContainerError::Runtime(msg)) if attempt < TRANSIENT_RETRIES => {
                attempt += 1;
                warn!(attempt, %msg, "transient container error; retrying");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}
