//! In-process container runtime for tests.
//!
//! Implements [`ContainerRuntime`] without a Docker daemon: "containers"
//! are bookkeeping records and their shells are local `bash` children
//! started in the conversation's scratch directory.  The lifecycle state
//! machine, idle reaper, resume path and shell framing all run for real;
//! only the OCI layer is simulated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::ContainerError;
use crate::runtime::ContainerRuntime;
use crate::shell::{JobInterrupter, ShellChunk, ShellSession};

/// Spawn a plain local bash with piped stdio, wired into a
/// [`ShellSession`] with a working job interrupter.  Returns the session
/// and the child's pid.
pub async fn spawn_local_shell(dir: &Path) -> std::io::Result<(ShellSession, u32)> {
    let mut child = tokio::process::Command::new("bash")
        .arg("--noprofile")
        .arg("--norc")
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let pid = child.id().unwrap_or_default();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("bash stdin not piped"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("bash stdout not piped"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("bash stderr not piped"))?;

    let (tx, rx) = mpsc::channel::<std::io::Result<ShellChunk>>(64);
    let out_tx = tx.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.send(Ok(ShellChunk::Out(buf[..n].to_vec()))).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Ok(ShellChunk::Err(buf[..n].to_vec()))).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    // Reap the child when it exits so it never lingers as a zombie.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let output = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });

    let mut session = ShellSession::over(Box::pin(stdin), Box::pin(output));
    session.set_interrupter(Box::new(LocalJobInterrupter { shell_pid: pid }));
    Ok((session, pid))
}

struct LocalJobInterrupter {
    shell_pid: u32,
}

#[async_trait]
impl JobInterrupter for LocalJobInterrupter {
    async fn interrupt(&self) {
        let _ = tokio::process::Command::new("pkill")
            .args(["-INT", "-P", &self.shell_pid.to_string()])
            .status()
            .await;
    }
}

// ── Fake OCI layer ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct InprocContainer {
    scratch: PathBuf,
    running: bool,
}

/// Failure injection knobs make the manager's retry and image-missing
/// paths testable.
#[derive(Default)]
pub struct InprocRuntime {
    containers: Mutex<HashMap<String, InprocContainer>>,
    next_id: AtomicU64,
    /// Next N create calls fail with a transient runtime error.
    pub fail_creates: AtomicU32,
    /// When set, every create fails as if the image were missing.
    pub missing_image: AtomicBool,
}

impl InprocRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of containers currently known to the fake daemon.
    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_running(&self, handle: &str) -> bool {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(handle)
            .is_some_and(|c| c.running)
    }
}

#[async_trait]
impl ContainerRuntime for InprocRuntime {
    async fn create(
        &self,
        _conversation_id: &str,
        host_scratch: &Path,
    ) -> Result<String, ContainerError> {
        if self.missing_image.load(Ordering::SeqCst) {
            return Err(ContainerError::Unavailable(
                "image 'test' not found; pull it with `docker pull test`".to_string(),
            ));
        }
        let pending = self.fail_creates.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_creates.store(pending - 1, Ordering::SeqCst);
            return Err(ContainerError::Runtime("injected transient create failure".to_string()));
        }

        let handle = format!("inproc-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle.clone(),
                InprocContainer {
                    scratch: host_scratch.to_path_buf(),
                    running: false,
                },
            );
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        match containers.get_mut(handle) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(ContainerError::Runtime(format!("no such container: {handle}"))),
        }
    }

    async fn stop(&self, handle: &str) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        match containers.get_mut(handle) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(ContainerError::Runtime(format!("no such container: {handle}"))),
        }
    }

    async fn remove(&self, handle: &str) -> Result<(), ContainerError> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle);
        Ok(())
    }

    async fn open_shell(&self, handle: &str) -> Result<ShellSession, ContainerError> {
        let scratch = {
            let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
            let container = containers
                .get(handle)
                .ok_or_else(|| ContainerError::Runtime(format!("no such container: {handle}")))?;
            if !container.running {
                return Err(ContainerError::Runtime(format!("container not running: {handle}")));
            }
            container.scratch.clone()
        };
        let (mut session, _pid) = spawn_local_shell(&scratch)
            .await
            .map_err(|err| ContainerError::Runtime(format!("cannot spawn local shell: {err}")))?;
        session.ready().await?;
        Ok(session)
    }
}
