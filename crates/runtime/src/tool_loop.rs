//! The model↔tool loop for a single user turn.
//!
//! Sends the history plus tool schemas to the driver, executes any
//! tool-use requests (concurrently when the model asks for several in one
//! turn), feeds the results back as a single tool-result turn, and
//! repeats until the model answers with plain text or the round cap is
//! hit.

use futures::future::join_all;
use tracing::{debug, info, warn};

use warden_llm::{
    CompletionError, ContentBlock, LlmDriver, Message, Role, ToolResultContent, TurnRequest,
};
use warden_tools::{ToolRegistry, ToolValue};

/// A turn that could not produce an assistant answer.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("tool loop exceeded {0} rounds without a final answer")]
    RoundsExhausted(usize),
}

#[derive(Debug, Clone)]
pub struct ToolLoopOutcome {
    /// The assistant's final text for this turn.
    pub text: String,
    /// Completion requests issued.
    pub rounds: usize,
    /// Tool invocations executed across all rounds.
    pub tool_calls: usize,
}

/// Run one user turn to completion.  `history` gains the user turn, every
/// intermediate assistant/tool-result turn, and the final assistant text.
pub async fn run_tool_loop(
    driver: &LlmDriver,
    registry: &ToolRegistry,
    conversation_id: &str,
    history: &mut Vec<Message>,
    prompt: &str,
    system: Option<&str>,
    max_rounds: usize,
    max_tokens: u32,
) -> Result<ToolLoopOutcome, TurnError> {
    history.push(Message::user(prompt));

    let schemas = registry.tool_schemas();
    let mut tool_calls = 0;

    for round in 0..max_rounds {
        debug!(round, history_len = history.len(), "tool loop iteration");
        let response = driver
            .complete(TurnRequest {
                system,
                messages: history,
                tools: &schemas,
                max_tokens,
            })
            .await?;

        if !response.has_tool_uses() {
            let text = response.text();
            history.push(Message {
                role: Role::Assistant,
                content: response.content,
            });
            return Ok(ToolLoopOutcome {
                text,
                rounds: round + 1,
                tool_calls,
            });
        }

        // Keep the full mixed assistant message (text parts included),
        // then answer every tool-use in one combined tool-result turn.
        let requests: Vec<(String, String, serde_json::Value)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect();
        history.push(Message {
            role: Role::Assistant,
            content: response.content,
        });

        info!(round, count = requests.len(), "model requested tool calls");
        tool_calls += requests.len();

        // All calls of this assistant turn run concurrently; join_all
        // returns them in the model's declared order regardless of which
        // finishes first.
        let results = join_all(requests.iter().map(|(id, name, input)| async move {
            let result = registry.call(name, input, conversation_id).await;
            match result {
                Ok(ToolValue::Image { media_type, data_b64 }) => ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: ToolResultContent::Image { media_type, data_b64 },
                    is_error: false,
                },
                Ok(value) => ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: ToolResultContent::Text(value.render()),
                    is_error: false,
                },
                Err(err) => {
                    warn!(tool = %name, %err, "tool call failed; feeding the error back");
                    ContentBlock::ToolResult {
                        tool_use_id: id.clone(),
                        content: ToolResultContent::Text(err.to_string()),
                        is_error: true,
                    }
                }
            }
        }))
        .await;

        history.push(Message::tool_results(results));
    }

    warn!(max_rounds, "tool loop exhausted its round cap");
    Err(TurnError::RoundsExhausted(max_rounds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::Mutex;
    use warden_config::{BackoffConfig, ModelConfig};
    use warden_llm::{CompletionRequest, CompletionResponse, CompletionService, StopReason};
    use warden_state::StateStore;
    use warden_tools::{ParamKind, ParamSpec, ProviderManifest, Tool, ToolCall, ToolError, ToolProvider};

    /// Pops scripted responses in order.
    struct QueueService {
        responses: Mutex<Vec<CompletionResponse>>,
    }

    impl QueueService {
        fn with(responses: Vec<CompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
            })
        }
    }

    #[async_trait]
    impl CompletionService for QueueService {
        async fn complete(
            &self,
            _request: CompletionRequest<'_>,
        ) -> Result<CompletionResponse, CompletionError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(CompletionError::Permanent("script exhausted".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: vec![ContentBlock::Text { text: text.to_string() }],
            stop_reason: StopReason::EndTurn,
        }
    }

    fn tool_use_response(id: &str, name: &str, input: serde_json::Value) -> CompletionResponse {
        CompletionResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: StopReason::ToolUse,
        }
    }

    struct PingProvider;

    #[async_trait]
    impl ToolProvider for PingProvider {
        fn name(&self) -> &str {
            "ping"
        }
        fn declare(&self) -> ProviderManifest {
            ProviderManifest {
                tools: vec![
                    Tool::new("ping", "Ping", "Reply with pong.").with_params(vec![
                        ParamSpec::required("tag", "Echo tag", ParamKind::String),
                    ]),
                    Tool::new("snapshot", "Snapshot", "Produce a tiny image."),
                ],
                global_state: json!({}),
                conversation_state: json!({}),
            }
        }
        async fn invoke(&self, call: ToolCall<'_>) -> Result<ToolValue, ToolError> {
            match call.tool_id {
                "ping" => {
                    let tag = call.args["tag"].as_str().unwrap_or("");
                    if tag == "boom" {
                        Err(ToolError::Provider("ping exploded".to_string()))
                    } else {
                        Ok(ToolValue::Text(format!("pong:{tag}")))
                    }
                }
                "snapshot" => Ok(ToolValue::Image {
                    media_type: "image/png".to_string(),
                    data_b64: "aWJtZw==".to_string(),
                }),
                other => Err(ToolError::UnknownTool(other.to_string())),
            }
        }
    }

    fn registry_in(dir: &tempfile::TempDir) -> ToolRegistry {
        let store = Arc::new(StateStore::new(dir.path().join("state.bin")));
        let mut registry = ToolRegistry::new(store, dir.path().to_path_buf());
        registry.register(Arc::new(PingProvider)).unwrap();
        registry
    }

    fn driver_over(service: Arc<dyn CompletionService>) -> LlmDriver {
        LlmDriver::new(service, ModelConfig::default(), BackoffConfig::default())
    }

    #[tokio::test]
    async fn plain_text_turn_appends_two_messages() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![text_response("hello back")]));

        let mut history = vec![];
        let outcome = run_tool_loop(&driver, &registry, "c1", &mut history, "hi", None, 25, 256)
            .await
            .unwrap();

        assert_eq!(outcome.text, "hello back");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.tool_calls, 0);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn tool_turn_appends_four_messages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![
            tool_use_response("tu_1", "ping", json!({"tag": "a"})),
            text_response("done"),
        ]));

        let mut history = vec![];
        let outcome = run_tool_loop(&driver, &registry, "c1", &mut history, "ping it", None, 25, 256)
            .await
            .unwrap();

        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(history.len(), 4);
        let ContentBlock::ToolResult { tool_use_id, content, is_error } = &history[2].content[0]
        else {
            panic!("expected a tool result turn");
        };
        assert_eq!(tool_use_id, "tu_1");
        assert!(!*is_error);
        assert_eq!(content, &ToolResultContent::Text("pong:a".to_string()));
    }

    #[tokio::test]
    async fn parallel_tool_uses_answer_in_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![
            CompletionResponse {
                content: vec![
                    ContentBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "ping".to_string(),
                        input: json!({"tag": "first"}),
                    },
                    ContentBlock::ToolUse {
                        id: "tu_2".to_string(),
                        name: "ping".to_string(),
                        input: json!({"tag": "second"}),
                    },
                ],
                stop_reason: StopReason::ToolUse,
            },
            text_response("both done"),
        ]));

        let mut history = vec![];
        run_tool_loop(&driver, &registry, "c1", &mut history, "ping twice", None, 25, 256)
            .await
            .unwrap();

        let results = &history[2].content;
        assert_eq!(results.len(), 2);
        let ids: Vec<_> = results
            .iter()
            .map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(ids, ["tu_1", "tu_2"]);
    }

    #[tokio::test]
    async fn mixed_text_and_tool_use_is_kept_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![
            CompletionResponse {
                content: vec![
                    ContentBlock::Text { text: "Let me ping.".to_string() },
                    ContentBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "ping".to_string(),
                        input: json!({"tag": "x"}),
                    },
                ],
                stop_reason: StopReason::ToolUse,
            },
            text_response("done"),
        ]));

        let mut history = vec![];
        run_tool_loop(&driver, &registry, "c1", &mut history, "go", None, 25, 256)
            .await
            .unwrap();
        assert_eq!(history[1].content.len(), 2);
        assert_eq!(history[1].text(), "Let me ping.");
    }

    #[tokio::test]
    async fn tool_errors_are_fed_back_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![
            tool_use_response("tu_1", "ping", json!({"tag": "boom"})),
            tool_use_response("tu_2", "no_such_tool", json!({})),
            tool_use_response("tu_3", "ping", json!({"tag": 5})),
            text_response("recovered"),
        ]));

        let mut history = vec![];
        let outcome = run_tool_loop(&driver, &registry, "c1", &mut history, "go", None, 25, 256)
            .await
            .unwrap();
        assert_eq!(outcome.text, "recovered");

        let error_flags: Vec<bool> = history
            .iter()
            .flat_map(|m| &m.content)
            .filter_map(|block| match block {
                ContentBlock::ToolResult { is_error, .. } => Some(*is_error),
                _ => None,
            })
            .collect();
        assert_eq!(error_flags, [true, true, true]);

        // The invalid-args feedback names the offending field.
        let ContentBlock::ToolResult { content: ToolResultContent::Text(text), .. } =
            &history[6].content[0]
        else {
            panic!();
        };
        assert!(text.contains("`tag`"), "{text}");
    }

    #[tokio::test]
    async fn image_results_become_image_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let driver = driver_over(QueueService::with(vec![
            tool_use_response("tu_1", "snapshot", json!({})),
            text_response("nice picture"),
        ]));

        let mut history = vec![];
        run_tool_loop(&driver, &registry, "c1", &mut history, "snap", None, 25, 256)
            .await
            .unwrap();
        let ContentBlock::ToolResult { content, .. } = &history[2].content[0] else { panic!() };
        assert!(matches!(content, ToolResultContent::Image { media_type, .. } if media_type == "image/png"));
    }

    #[tokio::test]
    async fn round_cap_is_enforced_exactly() {
        struct AlwaysTool(std::sync::atomic::AtomicUsize);
        #[async_trait]
        impl CompletionService for AlwaysTool {
            async fn complete(
                &self,
                _request: CompletionRequest<'_>,
            ) -> Result<CompletionResponse, CompletionError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(tool_use_response("tu", "ping", json!({"tag": "again"})))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let service = Arc::new(AlwaysTool(std::sync::atomic::AtomicUsize::new(0)));
        let driver = driver_over(service.clone());

        let mut history = vec![];
        let err = run_tool_loop(&driver, &registry, "c1", &mut history, "loop", None, 3, 256)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::RoundsExhausted(3)));
        assert_eq!(service.0.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
