//! The stateful shell: one long-lived interactive shell per container.
//!
//! Commands are framed with a per-call random sentinel so the end of a
//! command's output (and its exit code) can be recognized on a byte
//! stream.  The shell process survives across calls, so `cd`, exported
//! variables, aliases and functions persist from one command to the next.
//!
//! Framing written to the shell's stdin for each call:
//!
//! ```text
//! { <command>
//! }
//! __rc=$?
//! printf '\n%s %d\n' '<sentinel>' "$__rc"
//! ```
//!
//! Everything on stdout before the sentinel line is the command's stdout;
//! the integer after the sentinel is its exit code.  A call that times out
//! interrupts the foreground job and leaves the shell itself running; the
//! sentinel of the abandoned call is remembered and scrubbed from later
//! output so it never leaks into another command's stdout.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Exit code reported when a command exceeds its timeout, matching the
/// convention of coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long after interrupting a timed-out job we keep waiting for its
/// sentinel before declaring the stream desynchronized.
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

/// One chunk read from the shell's combined output.
#[derive(Debug)]
pub enum ShellChunk {
    Out(Vec<u8>),
    Err(Vec<u8>),
}

pub type ShellInput = Pin<Box<dyn AsyncWrite + Send>>;
pub type ShellOutput = Pin<Box<dyn Stream<Item = std::io::Result<ShellChunk>> + Send>>;

/// Interrupts the shell's current foreground job (not the shell itself).
/// The Docker backend execs `pkill -INT -P <shell pid>` in the container;
/// the in-process backend signals the local child's children.
#[async_trait]
pub trait JobInterrupter: Send + Sync {
    async fn interrupt(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("shell process is not running")]
    Dead,
    #[error("shell i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ShellSession {
    input: ShellInput,
    output: ShellOutput,
    interrupter: Option<Box<dyn JobInterrupter>>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    /// Sentinels of timed-out calls whose output may still arrive.
    stale_sentinels: Vec<String>,
    commands_run: u64,
    alive: bool,
}

impl ShellSession {
    /// Wrap an already-spawned interactive shell.  Call [`ready`] before
    /// the first command to drain any banner output.
    ///
    /// [`ready`]: ShellSession::ready
    pub fn over(input: ShellInput, output: ShellOutput) -> Self {
        Self {
            input,
            output,
            interrupter: None,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            stale_sentinels: Vec::new(),
            commands_run: 0,
            alive: true,
        }
    }

    pub fn set_interrupter(&mut self, interrupter: Box<dyn JobInterrupter>) {
        self.interrupter = Some(interrupter);
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn commands_run(&self) -> u64 {
        self.commands_run
    }

    /// Drain startup banners and confirm the shell answers.
    pub async fn ready(&mut self) -> Result<(), ShellError> {
        self.exec(":", Duration::from_secs(10)).await?;
        Ok(())
    }

    /// The shell's own PID (inside its namespace), for job interruption.
    pub async fn shell_pid(&mut self) -> Result<u32, ShellError> {
        let outcome = self.exec("echo $$", Duration::from_secs(10)).await?;
        outcome
            .stdout
            .trim()
            .parse()
            .map_err(|_| ShellError::Io(std::io::Error::other("shell did not report a pid")))
    }

    /// Execute one command and wait for its sentinel.
    pub async fn run(&mut self, command: &str, timeout: Duration) -> Result<CommandOutcome, ShellError> {
        let outcome = self.exec(command, timeout).await?;
        self.commands_run += 1;
        Ok(outcome)
    }

    /// Ask the shell to exit; best-effort.
    pub async fn close(&mut self) {
        if self.alive {
            let _ = self.input.write_all(b"exit\n").await;
            let _ = self.input.flush().await;
            self.alive = false;
        }
    }

    async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutcome, ShellError> {
        if !self.alive {
            return Err(ShellError::Dead);
        }

        let sentinel = Uuid::new_v4().simple().to_string();
        let framed = format!(
            "{{ {command}\n}}\n__rc=$?\nprintf '\\n%s %d\\n' '{sentinel}' \"$__rc\"\n"
        );
        self.input.write_all(framed.as_bytes()).await?;
        self.input.flush().await?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some((stdout, code)) = self.try_extract(&sentinel) {
                self.opportunistic_drain().await;
                return Ok(CommandOutcome {
                    exit_code: code,
                    stdout,
                    stderr: self.take_stderr(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.timed_out(sentinel, timeout).await;
            }
            match tokio::time::timeout(remaining, self.output.next()).await {
                Err(_) => return self.timed_out(sentinel, timeout).await,
                Ok(None) => {
                    self.alive = false;
                    return Err(ShellError::Dead);
                }
                Ok(Some(Err(err))) => {
                    self.alive = false;
                    return Err(ShellError::Io(err));
                }
                Ok(Some(Ok(ShellChunk::Out(bytes)))) => self.stdout_buf.extend_from_slice(&bytes),
                Ok(Some(Ok(ShellChunk::Err(bytes)))) => self.stderr_buf.extend_from_slice(&bytes),
            }
        }
    }

    /// Interrupt the foreground job, then give the shell a short grace
    /// period to emit the abandoned call's sentinel.  Either way the shell
    /// stays usable for the next call.
    async fn timed_out(
        &mut self,
        sentinel: String,
        timeout: Duration,
    ) -> Result<CommandOutcome, ShellError> {
        warn!(timeout_secs = timeout.as_secs_f64(), "shell command timed out; interrupting job");
        if let Some(interrupter) = &self.interrupter {
            interrupter.interrupt().await;
        }

        let deadline = Instant::now() + INTERRUPT_GRACE;
        let stdout = loop {
            if let Some((stdout, _abandoned_code)) = self.try_extract(&sentinel) {
                // The job died and the shell completed the framing; the
                // stream is fully synchronized again.
                break stdout;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Sentinel never arrived: remember it so late output can be
                // scrubbed, and hand back whatever was captured.
                self.stale_sentinels.push(sentinel);
                let stdout = String::from_utf8_lossy(&self.stdout_buf).into_owned();
                self.stdout_buf.clear();
                break stdout;
            }
            match tokio::time::timeout(remaining, self.output.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    self.alive = false;
                    return Err(ShellError::Dead);
                }
                Ok(Some(Err(err))) => {
                    self.alive = false;
                    return Err(ShellError::Io(err));
                }
                Ok(Some(Ok(ShellChunk::Out(bytes)))) => self.stdout_buf.extend_from_slice(&bytes),
                Ok(Some(Ok(ShellChunk::Err(bytes)))) => self.stderr_buf.extend_from_slice(&bytes),
            }
        };

        let mut stderr = self.take_stderr();
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!("command timed out after {}s\n", timeout.as_secs_f64()));
        Ok(CommandOutcome {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout,
            stderr,
        })
    }

    /// Look for the sentinel line in the buffered stdout.  On a hit,
    /// returns (stdout before the sentinel, exit code) and consumes the
    /// buffer through the sentinel line.
    fn try_extract(&mut self, sentinel: &str) -> Option<(String, i32)> {
        self.scrub_stale();

        let needle = sentinel.as_bytes();
        let mut search_from = 0;
        while let Some(pos) = find_from(&self.stdout_buf, needle, search_from) {
            let at_line_start = pos == 0 || self.stdout_buf[pos - 1] == b'\n';
            let after = pos + needle.len();
            if !at_line_start || self.stdout_buf.get(after) != Some(&b' ') {
                search_from = pos + 1;
                continue;
            }
            // Line must be complete before we can parse the exit code.
            let Some(line_end) = find_from(&self.stdout_buf, b"\n", after) else {
                return None;
            };
            let code = std::str::from_utf8(&self.stdout_buf[after + 1..line_end])
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(-1);
            // Drop the newline the framing printf injected before the
            // sentinel so the command's own output is returned verbatim.
            let stdout_end = pos.saturating_sub(1);
            let stdout = String::from_utf8_lossy(&self.stdout_buf[..stdout_end]).into_owned();
            self.stdout_buf.drain(..=line_end);
            debug!(exit_code = code, stdout_len = stdout.len(), "sentinel observed");
            return Some((stdout, code));
        }
        None
    }

    /// Remove sentinel lines of abandoned (timed-out) calls from the
    /// buffer so they never surface as another command's stdout.
    fn scrub_stale(&mut self) {
        let sentinels = std::mem::take(&mut self.stale_sentinels);
        let mut remaining = Vec::with_capacity(sentinels.len());
        for sentinel in sentinels {
            let needle = sentinel.as_bytes();
            let mut found = false;
            let mut search_from = 0;
            while let Some(pos) = find_from(&self.stdout_buf, needle, search_from) {
                let at_line_start = pos == 0 || self.stdout_buf[pos - 1] == b'\n';
                let after = pos + needle.len();
                if !at_line_start || self.stdout_buf.get(after) != Some(&b' ') {
                    search_from = pos + 1;
                    continue;
                }
                let Some(line_end) = find_from(&self.stdout_buf, b"\n", after) else {
                    break;
                };
                // Also swallow the injected newline before the line, plus
                // any partial output the abandoned job managed to write.
                self.stdout_buf.drain(..=line_end);
                found = true;
                break;
            }
            if !found {
                remaining.push(sentinel);
            }
        }
        self.stale_sentinels = remaining;
    }

    /// Pull anything the stream already has buffered without blocking
    /// beyond a token delay — stderr commonly trails the stdout sentinel
    /// by a scheduling tick.
    async fn opportunistic_drain(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_millis(20), self.output.next()).await {
                Ok(Some(Ok(ShellChunk::Out(bytes)))) => self.stdout_buf.extend_from_slice(&bytes),
                Ok(Some(Ok(ShellChunk::Err(bytes)))) => self.stderr_buf.extend_from_slice(&bytes),
                Ok(Some(Err(_))) | Ok(None) => {
                    self.alive = false;
                    break;
                }
                Err(_) => break,
            }
        }
    }

    fn take_stderr(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.stderr_buf)).into_owned()
    }
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|rel| from + rel)
}

/// Quote a string for safe interpolation into a shell command line.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}
