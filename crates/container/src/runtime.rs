//! The seam between the container manager and the OCI runtime.
//!
//! [`ContainerRuntime`] is everything the manager needs from a runtime:
//! create/start/stop/remove plus opening the long-lived shell.  The
//! production implementation is [`DockerRuntime`] over the Docker Engine
//! API; tests use the in-process runtime from [`crate::inproc`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{HostConfig, ResourcesUlimits};
use futures::StreamExt;
use tracing::{debug, info, warn};

use warden_config::ContainerConfig;

use crate::ContainerError;
use crate::shell::{JobInterrupter, ShellChunk, ShellSession};

/// Seconds Docker waits before SIGKILL on stop.
const STOP_GRACE_SECS: i64 = 5;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container for the conversation, with
    /// `host_scratch` as the `/mnt` bind source.  Returns the runtime
    /// handle.
    async fn create(&self, conversation_id: &str, host_scratch: &Path)
    -> Result<String, ContainerError>;

    async fn start(&self, handle: &str) -> Result<(), ContainerError>;

    async fn stop(&self, handle: &str) -> Result<(), ContainerError>;

    async fn remove(&self, handle: &str) -> Result<(), ContainerError>;

    /// Open the long-lived interactive shell inside a running container.
    /// The returned session has drained its banner and carries a job
    /// interrupter for timeout handling.
    async fn open_shell(&self, handle: &str) -> Result<ShellSession, ContainerError>;
}

// ── Docker implementation ────────────────────────────────────────────────────

pub struct DockerRuntime {
    docker: Docker,
    cfg: ContainerConfig,
}

impl DockerRuntime {
    /// Connect via the platform's local defaults (unix socket on Linux).
    pub fn connect(cfg: ContainerConfig) -> Result<Self, ContainerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ContainerError::Runtime(format!("cannot reach docker daemon: {err}")))?;
        Ok(Self { docker, cfg })
    }

    fn capabilities(&self) -> Vec<String> {
        // Everything is dropped; add back only what file ownership inside
        // the scratch mount needs, plus basic networking when enabled.
        let mut caps = vec![
            "CHOWN".to_string(),
            "DAC_OVERRIDE".to_string(),
            "FOWNER".to_string(),
            "SETGID".to_string(),
            "SETUID".to_string(),
        ];
        if self.cfg.network_mode != "none" {
            caps.push("NET_BIND_SERVICE".to_string());
            caps.push("NET_RAW".to_string());
        }
        caps
    }

    fn host_config(&self, host_scratch: &Path) -> HostConfig {
        HostConfig {
            binds: Some(vec![format!("{}:/mnt:rw", host_scratch.display())]),
            memory: Some(self.cfg.memory_limit_bytes),
            nano_cpus: Some((self.cfg.cpu_limit * 1_000_000_000.0) as i64),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([
                ("/tmp".to_string(), "rw,noexec,nosuid,size=268435456".to_string()),
                ("/var/cache".to_string(), "rw,noexec,nosuid,size=67108864".to_string()),
            ])),
            network_mode: Some(self.cfg.network_mode.clone()),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(self.capabilities()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ulimits: Some(vec![
                ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(1024),
                    hard: Some(2048),
                },
                ResourcesUlimits {
                    name: Some("nproc".to_string()),
                    soft: Some(512),
                    hard: Some(1024),
                },
            ]),
            ..Default::default()
        }
    }

    fn classify(&self, err: DockerError) -> ContainerError {
        match err {
            DockerError::DockerResponseServerError { status_code: 404, message } => {
                ContainerError::Unavailable(format!(
                    "image '{}' not found ({message}); pull it with `docker pull {}`",
                    self.cfg.image, self.cfg.image
                ))
            }
            other => ContainerError::Runtime(other.to_string()),
        }
    }
}

/// Docker container names only allow `[a-zA-Z0-9_.-]`; conversation ids
/// are opaque strings, so everything else is mapped to `-`.
fn container_name(conversation_id: &str) -> String {
    let sanitized: String = conversation_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '-' })
        .collect();
    format!("warden-{sanitized}")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(
        &self,
        conversation_id: &str,
        host_scratch: &Path,
    ) -> Result<String, ContainerError> {
        let name = container_name(conversation_id);
        let config = Config {
            image: Some(self.cfg.image.clone()),
            // The container just has to stay alive; all work happens in
            // the exec'd shell.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some("/mnt".to_string()),
            host_config: Some(self.host_config(host_scratch)),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        match self.docker.create_container(Some(options.clone()), config.clone()).await {
            Ok(response) => {
                info!(conversation = conversation_id, container = %response.id, "container created");
                Ok(response.id)
            }
            // A stale container with our name survives a host crash; take
            // its place.
            Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => {
                warn!(container = %name, "name in use; removing stale container");
                let _ = self
                    .docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                let response = self
                    .docker
                    .create_container(Some(options), config)
                    .await
                    .map_err(|err| self.classify(err))?;
                Ok(response.id)
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    async fn start(&self, handle: &str) -> Result<(), ContainerError> {
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| self.classify(err))
    }

    async fn stop(&self, handle: &str) -> Result<(), ContainerError> {
        match self
            .docker
            .stop_container(handle, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped is success for our purposes.
            Err(DockerError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(err) => Err(self.classify(err)),
        }
    }

    async fn remove(&self, handle: &str) -> Result<(), ContainerError> {
        self.docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| self.classify(err))
    }

    async fn open_shell(&self, handle: &str) -> Result<ShellSession, ContainerError> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec!["/bin/bash".to_string()]),
                    working_dir: Some("/mnt".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| self.classify(err))?;

        let StartExecResults::Attached { output, input } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|err| self.classify(err))?
        else {
            return Err(ContainerError::Runtime(
                "exec started detached; expected an attached shell".to_string(),
            ));
        };

        let chunks = output.map(|item| match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                Ok(ShellChunk::Out(message.to_vec()))
            }
            Ok(LogOutput::StdErr { message }) => Ok(ShellChunk::Err(message.to_vec())),
            Ok(LogOutput::StdIn { .. }) => Ok(ShellChunk::Out(Vec::new())),
            Err(err) => Err(std::io::Error::other(err)),
        });

        let mut session = ShellSession::over(input, Box::pin(chunks));
        session.ready().await?;
        let pid = session.shell_pid().await?;
        session.set_interrupter(Box::new(DockerJobInterrupter {
            docker: self.docker.clone(),
            container: handle.to_string(),
            shell_pid: pid,
        }));
        debug!(container = handle, shell_pid = pid, "shell opened");
        Ok(session)
    }
}

/// Interrupts the shell's foreground job by exec-ing `pkill` against the
/// shell's children inside the container.
struct DockerJobInterrupter {
    docker: Docker,
    container: String,
    shell_pid: u32,
}

#[async_trait]
impl JobInterrupter for DockerJobInterrupter {
    async fn interrupt(&self) {
        let command = format!("pkill -INT -P {} || kill -INT -{}", self.shell_pid, self.shell_pid);
        let exec = match self
            .docker
            .create_exec(
                &self.container,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(exec) => exec,
            Err(err) => {
                warn!(container = %self.container, %err, "cannot create interrupt exec");
                return;
            }
        };
        if let Err(err) = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(container = %self.container, %err, "cannot interrupt foreground job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("c1"), "warden-c1");
        assert_eq!(container_name("user@host/chat 7"), "warden-user-host-chat-7");
    }
}
