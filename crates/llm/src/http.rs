//! HTTP implementation of the completion service (messages wire format).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    CompletionError, CompletionRequest, CompletionResponse, CompletionService, ContentBlock,
    Message, StopReason, ToolResultContent,
};

const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpCompletionService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompletionService {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn api_key() -> Result<String, CompletionError> {
        std::env::var("WARDEN_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                CompletionError::Permanent(
                    "no API key; set WARDEN_API_KEY or ANTHROPIC_API_KEY".to_string(),
                )
            })
    }
}

#[async_trait]
impl CompletionService for HttpCompletionService {
    async fn complete(
        &self,
        request: CompletionRequest<'_>,
    ) -> Result<CompletionResponse, CompletionError> {
        let api_key = Self::api_key()?;
        let endpoint = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let mut payload = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": wire_messages(request.messages),
        });
        if let Some(system) = request.system.filter(|s| !s.is_empty()) {
            payload["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            payload["tools"] = json!(request.tools);
        }

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                // Connection refused, DNS trouble and client-side timeouts
                // are all worth retrying.
                CompletionError::Transient(format!("completion request failed: {err}"))
            })?;

        let status = response.status().as_u16();
        let body: Value = response
            .json()
            .await
            .map_err(|err| CompletionError::Permanent(format!("malformed response body: {err}")))?;

        if let Some(error) = classify_status(status, &body) {
            return Err(error);
        }
        parse_response(&body)
    }
}

// ── Request shaping ──────────────────────────────────────────────────────────

fn wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role.as_str(),
                "content": message.content.iter().map(wire_block).collect::<Vec<_>>(),
            })
        })
        .collect()
}

fn wire_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let content = match content {
                ToolResultContent::Text(text) => json!(text),
                ToolResultContent::Image { media_type, data_b64 } => json!([{
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": data_b64,
                    },
                }]),
            };
            let mut value = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if *is_error {
                value["is_error"] = json!(true);
            }
            value
        }
    }
}

// ── Response parsing ─────────────────────────────────────────────────────────

/// Map an HTTP status to the error taxonomy.  `None` means success.
fn classify_status(status: u16, body: &Value) -> Option<CompletionError> {
    if (200..300).contains(&status) {
        return None;
    }
    let detail = body
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("no detail")
        .to_string();
    let message = format!("completion service returned {status}: {detail}");
    match status {
        408 | 429 | 500..=599 => Some(CompletionError::Transient(message)),
        _ => Some(CompletionError::Permanent(message)),
    }
}

fn parse_response(body: &Value) -> Result<CompletionResponse, CompletionError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| CompletionError::Permanent(format!("response has no content array: {body}")))?;

    let mut content = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                content.push(ContentBlock::Text { text });
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CompletionError::Permanent("tool_use block without id".to_string()))?
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CompletionError::Permanent("tool_use block without name".to_string()))?
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(json!({}));
                content.push(ContentBlock::ToolUse { id, name, input });
            }
            // Thinking blocks and future block kinds are ignored rather
            // than rejected.
            _ => {}
        }
    }

    let stop_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(_) => StopReason::Other,
    };

    Ok(CompletionResponse { content, stop_reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_messages_shape_text_and_tool_blocks() {
        let messages = vec![
            Message::user("hi"),
            Message {
                role: crate::Role::Assistant,
                content: vec![
                    ContentBlock::Text { text: "checking".to_string() },
                    ContentBlock::ToolUse {
                        id: "tu_1".to_string(),
                        name: "bash".to_string(),
                        input: json!({"command": "ls"}),
                    },
                ],
            },
            Message::tool_results(vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: ToolResultContent::Text("a.txt\n".to_string()),
                is_error: false,
            }]),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "text");
        assert_eq!(wire[1]["content"][1]["type"], "tool_use");
        assert_eq!(wire[1]["content"][1]["name"], "bash");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "tu_1");
        assert_eq!(wire[2]["content"][0]["content"], "a.txt\n");
        assert!(wire[2]["content"][0].get("is_error").is_none());
    }

    #[test]
    fn error_results_carry_the_flag() {
        let block = wire_block(&ContentBlock::ToolResult {
            tool_use_id: "tu_9".to_string(),
            content: ToolResultContent::Text("unknown tool".to_string()),
            is_error: true,
        });
        assert_eq!(block["is_error"], true);
    }

    #[test]
    fn image_results_become_image_content_items() {
        let block = wire_block(&ContentBlock::ToolResult {
            tool_use_id: "tu_2".to_string(),
            content: ToolResultContent::Image {
                media_type: "image/png".to_string(),
                data_b64: "aGk=".to_string(),
            },
            is_error: false,
        });
        assert_eq!(block["content"][0]["type"], "image");
        assert_eq!(block["content"][0]["source"]["media_type"], "image/png");
        assert_eq!(block["content"][0]["source"]["data"], "aGk=");
    }

    #[test]
    fn parse_text_response() {
        let body = json!({
            "content": [{"type": "text", "text": "Paris: 22°C, sunny."}],
            "stop_reason": "end_turn",
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.text(), "Paris: 22°C, sunny.");
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        assert!(!response.has_tool_uses());
    }

    #[test]
    fn parse_mixed_text_and_tool_use() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Running it now."},
                {"type": "tool_use", "id": "tu_1", "name": "bash", "input": {"command": "echo hi"}},
            ],
            "stop_reason": "tool_use",
        });
        let response = parse_response(&body).unwrap();
        assert!(response.has_tool_uses());
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.content.len(), 2);
    }

    #[test]
    fn missing_content_is_permanent() {
        let err = parse_response(&json!({"oops": true})).unwrap_err();
        assert!(matches!(err, CompletionError::Permanent(_)));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(200, &json!({})).is_none());
        assert!(matches!(
            classify_status(429, &json!({})),
            Some(CompletionError::Transient(_))
        ));
        assert!(matches!(
            classify_status(529, &json!({})),
            Some(CompletionError::Transient(_))
        ));
        assert!(matches!(
            classify_status(500, &json!({})),
            Some(CompletionError::Transient(_))
        ));
        assert!(matches!(
            classify_status(401, &json!({"error": {"message": "bad key"}})),
            Some(CompletionError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(404, &json!({})),
            Some(CompletionError::Permanent(_))
        ));
    }
}
