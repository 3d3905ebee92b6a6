//! The shell tool provider: `bash`, `bash_status`, `bash_reset`.
//!
//! Bridges the tool-registry contract onto the container manager.  The
//! container record itself lives in the manager; the provider keeps only
//! command-count and last-activity bookkeeping in its state slots.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use warden_tools::{
    ParamKind, ParamSpec, ProviderManifest, Tool, ToolCall, ToolError, ToolProvider, ToolValue,
};

use crate::{ContainerError, ContainerManager};

pub struct ShellToolProvider {
    manager: Arc<ContainerManager>,
    default_timeout_seconds: u64,
}

impl ShellToolProvider {
    pub fn new(manager: Arc<ContainerManager>, default_timeout_seconds: u64) -> Self {
        Self {
            manager,
            default_timeout_seconds,
        }
    }

    async fn run_bash(&self, call: &mut ToolCall<'_>) -> Result<ToolValue, ToolError> {
        let command = call.args["command"].as_str().unwrap_or_default().to_string();
        let timeout = call
            .args
            .get("timeout")
            .and_then(Value::as_f64)
            .unwrap_or(self.default_timeout_seconds as f64);
        let working_dir = call
            .args
            .get("working_dir")
            .and_then(Value::as_str)
            .map(str::to_string);

        let outcome = self
            .manager
            .execute(
                call.conversation_id,
                &command,
                Duration::from_secs_f64(timeout.max(1.0)),
                working_dir.as_deref(),
            )
            .await
            .map_err(|err| match err {
                ContainerError::Unavailable(msg) => ToolError::ContainerUnavailable(msg),
                other => ToolError::Provider(other.to_string()),
            })?;

        if let Value::Object(state) = call.state {
            state.insert("commands_run".to_string(), json!(outcome.command_number));
            state.insert("last_command_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        {
            let mut global = call.global.lock().await;
            let total = global["total_commands"].as_u64().unwrap_or(0) + 1;
            global["total_commands"] = json!(total);
        }

        Ok(ToolValue::Json(json!({
            "exit_code": outcome.exit_code,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
            "success": outcome.exit_code == 0,
            "command_number": outcome.command_number,
            "container_was_created_or_resumed": outcome.container_was_created_or_resumed,
        })))
    }

    async fn run_status(&self, call: &ToolCall<'_>) -> Result<ToolValue, ToolError> {
        let status = self.manager.status(call.conversation_id).await;
        Ok(ToolValue::Json(json!({
            "conversation_id": status.conversation_id,
            "state": status.state.as_str(),
            "created_at": status.created_at.map(|t| t.to_rfc3339()),
            "last_activity": status.last_activity.map(|t| t.to_rfc3339()),
            "commands_run": status.commands_run,
            "idle_timeout_seconds": status.idle_timeout_seconds,
        })))
    }

    async fn run_reset(&self, call: &mut ToolCall<'_>) -> Result<ToolValue, ToolError> {
        let keep_data = call.args.get("keep_data").and_then(Value::as_bool).unwrap_or(false);
        self.manager
            .reset(call.conversation_id, keep_data)
            .await
            .map_err(|err| ToolError::Provider(err.to_string()))?;
        if let Value::Object(state) = call.state {
            state.insert("commands_run".to_string(), json!(0));
            state.insert("last_command_at".to_string(), Value::Null);
        }
        Ok(ToolValue::Json(json!({"ok": true})))
    }
}

#[async_trait]
impl ToolProvider for ShellToolProvider {
    fn name(&self) -> &str {
        "shell"
    }

    fn declare(&self) -> ProviderManifest {
        ProviderManifest {
            tools: vec![
                Tool::new(
                    "bash",
                    "Bash",
                    "Run a command in this conversation's stateful shell. The shell lives in a \
                     per-conversation Linux container; working directory, environment variables, \
                     aliases and functions persist across calls. Files under /mnt survive \
                     container restarts.",
                )
                .with_params(vec![
                    ParamSpec::required("command", "The shell command to run", ParamKind::String),
                    ParamSpec::optional(
                        "timeout",
                        "Seconds to wait before the command is interrupted",
                        ParamKind::Number,
                    )
                    .with_default(json!(self.default_timeout_seconds)),
                    ParamSpec::optional(
                        "working_dir",
                        "Directory to cd into before running the command",
                        ParamKind::String,
                    ),
                ]),
                Tool::new(
                    "bash_status",
                    "Bash status",
                    "Inspect this conversation's container: lifecycle state, timestamps and \
                     command counter.",
                ),
                Tool::new(
                    "bash_reset",
                    "Bash reset",
                    "Destroy this conversation's container so the next bash call starts fresh. \
                     Set keep_data to preserve the files under /mnt.",
                )
                .with_params(vec![
                    ParamSpec::optional(
                        "keep_data",
                        "Keep the conversation's /mnt contents",
                        ParamKind::Boolean,
                    )
                    .with_default(json!(false)),
                ]),
            ],
            global_state: json!({"total_commands": 0}),
            conversation_state: json!({"commands_run": 0, "last_command_at": null}),
        }
    }

    async fn invoke(&self, mut call: ToolCall<'_>) -> Result<ToolValue, ToolError> {
        match call.tool_id {
            "bash" => self.run_bash(&mut call).await,
            "bash_status" => self.run_status(&call).await,
            "bash_reset" => self.run_reset(&mut call).await,
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inproc::InprocRuntime;
    use std::sync::atomic::Ordering;
    use warden_config::ContainerConfig;
    use warden_state::StateStore;
    use warden_tools::ToolRegistry;

    fn registry_with_shell(dir: &tempfile::TempDir) -> (ToolRegistry, Arc<InprocRuntime>) {
        let runtime = Arc::new(InprocRuntime::new());
        let manager = Arc::new(ContainerManager::new(
            runtime.clone(),
            ContainerConfig::default(),
            dir.path().join("agent-working-directory"),
        ));
        let store = Arc::new(StateStore::new(dir.path().join("state.bin")));
        let mut registry = ToolRegistry::new(store, dir.path().join("agent-working-directory"));
        registry
            .register(Arc::new(ShellToolProvider::new(manager, 120)))
            .unwrap();
        (registry, runtime)
    }

    #[tokio::test]
    async fn bash_runs_a_command_and_reports_the_wire_fields() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _runtime) = registry_with_shell(&dir);

        let result = registry
            .call("bash", &json!({"command": "echo hi"}), "c2")
            .await
            .unwrap();
        let ToolValue::Json(value) = result else { panic!() };
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["stdout"], "hi\n");
        assert_eq!(value["success"], true);
        assert_eq!(value["command_number"], 1);
        assert_eq!(value["container_was_created_or_resumed"], true);
    }

    #[tokio::test]
    async fn bash_without_command_is_invalid_args() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _runtime) = registry_with_shell(&dir);
        let err = registry.call("bash", &json!({}), "c1").await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _runtime) = registry_with_shell(&dir);

        let before = registry.call("bash_status", &json!({}), "c1").await.unwrap();
        let ToolValue::Json(before) = before else { panic!() };
        assert_eq!(before["state"], "not-created");

        registry.call("bash", &json!({"command": "true"}), "c1").await.unwrap();

        let after = registry.call("bash_status", &json!({}), "c1").await.unwrap();
        let ToolValue::Json(after) = after else { panic!() };
        assert_eq!(after["state"], "running");
        assert_eq!(after["commands_run"], 1);
    }

    #[tokio::test]
    async fn reset_returns_ok_and_clears_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, runtime) = registry_with_shell(&dir);

        registry.call("bash", &json!({"command": "true"}), "c1").await.unwrap();
        let result = registry.call("bash_reset", &json!({}), "c1").await.unwrap();
        assert_eq!(result, ToolValue::Json(json!({"ok": true})));
        assert_eq!(runtime.container_count(), 0);

        let status = registry.call("bash_status", &json!({}), "c1").await.unwrap();
        let ToolValue::Json(status) = status else { panic!() };
        assert_eq!(status["state"], "not-created");
        assert_eq!(status["commands_run"], 0);
    }

    #[tokio::test]
    async fn container_unavailable_is_its_own_error_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, runtime) = registry_with_shell(&dir);
        runtime.missing_image.store(true, Ordering::SeqCst);

        let err = registry
            .call("bash", &json!({"command": "true"}), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ContainerUnavailable(_)));
    }

    #[tokio::test]
    async fn timeout_is_a_normal_result_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _runtime) = registry_with_shell(&dir);

        let result = registry
            .call("bash", &json!({"command": "sleep 2; echo done", "timeout": 1}), "c1")
            .await
            .unwrap();
        let ToolValue::Json(value) = result else { panic!() };
        assert_eq!(value["exit_code"], 124);
        assert_eq!(value["success"], false);
        assert!(value["stderr"].as_str().unwrap().contains("timed out"));
    }
}
