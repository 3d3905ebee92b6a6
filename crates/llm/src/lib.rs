//! Completion-service client types and the retrying LLM driver.
//!
//! The driver owns request shaping, transient-failure retry with
//! exponential backoff, and the automatic switch to a backup model after
//! repeated primary failures.  The actual wire protocol lives behind the
//! [`CompletionService`] trait; production uses [`HttpCompletionService`],
//! tests use scripted stubs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use warden_config::{BackoffConfig, ModelConfig};

mod http;
pub use http::HttpCompletionService;

// ── Message model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Payload of one tool-result block.  The image variant is rendered as
/// visual input to the model rather than stringified JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultContent {
    Text(String),
    Image { media_type: String, data_b64: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: ToolResultContent,
        is_error: bool,
    },
}

/// One turn in a conversation's history.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// The combined tool-result turn that answers an assistant tool-use
    /// turn.  Tool results ride in a user-role message, which preserves
    /// the user/assistant alternation at the top level.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

// ── Completion service ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

impl CompletionResponse {
    pub fn has_tool_uses(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolUse { .. }))
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One fully-shaped completion request.
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    pub messages: &'a [Message],
    /// Wire-shaped tool schemas (`{name, description, input_schema}`).
    pub tools: &'a [Value],
    pub max_tokens: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    /// Overload, rate limit, timeout: worth retrying.
    #[error("transient completion failure: {0}")]
    Transient(String),
    /// Malformed response, authentication, unknown model: retrying cannot
    /// help.
    #[error("permanent completion failure: {0}")]
    Permanent(String),
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError>;
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Everything the driver needs for one completion besides the model,
/// which it chooses itself (primary or backup).
pub struct TurnRequest<'a> {
    pub system: Option<&'a str>,
    pub messages: &'a [Message],
    pub tools: &'a [Value],
    pub max_tokens: u32,
}

#[derive(Debug)]
struct DriverState {
    on_backup: bool,
    consecutive_failures: u32,
}

/// Retrying front-end over a [`CompletionService`].
///
/// Transient failures back off exponentially (initial delay doubling up
/// to a cap).  After `fallback_retry_count` consecutive failures on the
/// primary model the driver switches to the backup and keeps retrying
/// without a count cap; [`LlmDriver::reset`] restores the primary.
pub struct LlmDriver {
    service: Arc<dyn CompletionService>,
    model: ModelConfig,
    backoff: BackoffConfig,
    state: Mutex<DriverState>,
}

impl LlmDriver {
    pub fn new(service: Arc<dyn CompletionService>, model: ModelConfig, backoff: BackoffConfig) -> Self {
        Self {
            service,
            model,
            backoff,
            state: Mutex::new(DriverState {
                on_backup: false,
                consecutive_failures: 0,
            }),
        }
    }

    pub fn active_model(&self) -> String {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.on_backup {
            self.model.backup_model.clone()
        } else {
            self.model.model.clone()
        }
    }

    /// Restore the primary model for subsequent turns.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.on_backup = false;
        state.consecutive_failures = 0;
    }

    /// Issue one completion, retrying transient failures indefinitely.
    /// Permanent failures surface immediately.
    pub async fn complete(
        &self,
        request: TurnRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let mut delay = Duration::from_millis(self.backoff.initial_ms);
        let max_delay = Duration::from_millis(self.backoff.max_ms);

        loop {
            let model = self.active_model();
            debug!(model = %model, messages = request.messages.len(), "completion request");
            let attempt = self
                .service
                .complete(CompletionRequest {
                    model: &model,
                    system: request.system,
                    messages: request.messages,
                    tools: request.tools,
                    max_tokens: request.max_tokens,
                })
                .await;

            match attempt {
                Ok(response) => {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.consecutive_failures = 0;
                    return Ok(response);
                }
                Err(CompletionError::Permanent(message)) => {
                    return Err(CompletionError::Permanent(message));
                }
                Err(CompletionError::Transient(message)) => {
                    let switched = {
                        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                        state.consecutive_failures += 1;
                        if !state.on_backup
                            && state.consecutive_failures >= self.backoff.fallback_retry_count
                        {
                            state.on_backup = true;
                            true
                        } else {
                            false
                        }
                    };
                    if switched {
                        warn!(
                            backup = %self.model.backup_model,
                            ">>> primary model keeps failing; switching to backup model <<<"
                        );
                    } else {
                        warn!(%message, delay_ms = delay.as_millis() as u64, "transient completion failure; backing off");
                    }
                    tokio::time::sleep(delay).await;
                    delay = mul_delay(delay, self.backoff.multiplier).min(max_delay);
                }
            }
        }
    }
}

fn mul_delay(delay: Duration, multiplier: f64) -> Duration {
    Duration::from_secs_f64((delay.as_secs_f64() * multiplier).max(0.0))
}
