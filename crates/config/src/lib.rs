use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// System prompt sent with every completion request.  Empty = none.
    pub system_prompt: String,
    /// Hard cap on model↔tool iterations within a single user turn.
    pub max_tool_rounds: usize,
    /// Token cap passed to the completion service.
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_tool_rounds: 25,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Primary model identifier.
    pub model: String,
    /// Backup model the driver switches to after repeated primary failures.
    pub backup_model: String,
    /// Base URL of the completion service.  Overridden at runtime by the
    /// `WARDEN_API_BASE_URL` environment variable when set.
    pub api_base_url: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            backup_model: "claude-haiku-4-5".to_string(),
            api_base_url: "https://api.anthropic.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay after a transient completion failure.
    pub initial_ms: u64,
    /// Ceiling for the doubled delay.
    pub max_ms: u64,
    pub multiplier: f64,
    /// Consecutive primary-model failures before switching to the backup.
    pub fallback_retry_count: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 3000,
            multiplier: 2.0,
            fallback_retry_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// OCI image every per-conversation container is created from.
    pub image: String,
    pub memory_limit_bytes: i64,
    /// CPU quota in whole/fractional cores.
    pub cpu_limit: f64,
    /// Seconds of inactivity before the reaper stops a running container.
    /// 0 disables idle reaping.
    pub idle_timeout_seconds: u64,
    /// How often the reaper wakes to look for idle containers.
    pub sweep_interval_seconds: u64,
    /// "host" (default) or "bridge" for isolated networking.
    pub network_mode: String,
    /// Default per-command shell timeout in seconds.
    pub shell_timeout_seconds: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            memory_limit_bytes: 2 * 1024 * 1024 * 1024,
            cpu_limit: 2.0,
            idle_timeout_seconds: 300,
            sweep_interval_seconds: 60,
            network_mode: "host".to_string(),
            shell_timeout_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Base directory for everything warden writes to disk: the persisted
    /// state file and the per-conversation scratch directories.
    pub runtime_root: PathBuf,
    pub agent: AgentConfig,
    pub model: ModelConfig,
    pub backoff: BackoffConfig,
    pub container: ContainerConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        if config.runtime_root.as_os_str().is_empty() {
            config.runtime_root = PathBuf::from(".warden");
        }
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Environment variables win over anything in the TOML file.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_nonempty("WARDEN_RUNTIME_ROOT") {
            self.runtime_root = PathBuf::from(v);
        }
        if let Some(v) = env_nonempty("WARDEN_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = env_nonempty("WARDEN_BACKUP_MODEL") {
            self.model.backup_model = v;
        }
        if let Some(v) = env_nonempty("WARDEN_API_BASE_URL") {
            self.model.api_base_url = v;
        }
        if let Some(v) = env_parsed("WARDEN_INITIAL_BACKOFF_MS") {
            self.backoff.initial_ms = v;
        }
        if let Some(v) = env_parsed("WARDEN_MAX_BACKOFF_MS") {
            self.backoff.max_ms = v;
        }
        if let Some(v) = env_parsed("WARDEN_BACKOFF_MULTIPLIER") {
            self.backoff.multiplier = v;
        }
        if let Some(v) = env_parsed("WARDEN_FALLBACK_RETRY_COUNT") {
            self.backoff.fallback_retry_count = v;
        }
        if let Some(v) = env_parsed("WARDEN_IDLE_TIMEOUT_SECONDS") {
            self.container.idle_timeout_seconds = v;
        }
        if let Some(v) = env_parsed("WARDEN_MEMORY_LIMIT_BYTES") {
            self.container.memory_limit_bytes = v;
        }
        if let Some(v) = env_parsed("WARDEN_CPU_LIMIT") {
            self.container.cpu_limit = v;
        }
        if let Some(v) = env_nonempty("WARDEN_CONTAINER_IMAGE") {
            self.container.image = v;
        }
    }

    /// Canonical path of the persisted tool-state file.
    pub fn state_file(&self) -> PathBuf {
        self.runtime_root.join("state.bin")
    }

    /// Host-side scratch directory for one conversation — the mount source
    /// for the in-container `/mnt` volume.
    pub fn working_directory(&self, conversation_id: &str) -> PathBuf {
        self.runtime_root
            .join("agent-working-directory")
            .join(conversation_id)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_nonempty(key).and_then(|v| v.parse().ok())
}
