//! Prompt-channel message shapes and the outbound trait.
//!
//! The transport itself is out of scope; anything able to deliver
//! [`InboundMessage`]s and accept [`OutboundMessage`]s can drive the
//! agent.  The daemon ships a JSON-lines stdio adapter; tests use
//! [`LocalChannel`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptPayload {
    pub conversation_id: String,
    pub prompt: String,
}

/// A message arriving on the prompt channel.  Only
/// `recipient = "agent"`, `type = "new_prompt"` is acted on; everything
/// else is ignored by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundMessage {
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: PromptPayload,
}

impl InboundMessage {
    pub fn new_prompt(conversation_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            recipient: "agent".to_string(),
            kind: "new_prompt".to_string(),
            payload: PromptPayload {
                conversation_id: conversation_id.into(),
                prompt: prompt.into(),
            },
        }
    }

    pub fn is_prompt(&self) -> bool {
        self.recipient == "agent" && self.kind == "new_prompt"
    }
}

/// The agent's response for one turn, echoed back with the conversation
/// id it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: PromptPayload,
}

impl OutboundMessage {
    pub fn agent_response(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            recipient: "user_device".to_string(),
            kind: "agent_response".to_string(),
            payload: PromptPayload {
                conversation_id: conversation_id.into(),
                prompt: text.into(),
            },
        }
    }
}

/// Outbound half of the prompt channel.
#[async_trait]
pub trait PromptChannel: Send + Sync {
    async fn send(&self, message: OutboundMessage);
}

/// In-process channel: outbound messages land on an mpsc receiver.
pub struct LocalChannel {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl LocalChannel {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PromptChannel for LocalChannel {
    async fn send(&self, message: OutboundMessage) {
        let _ = self.tx.send(message);
    }
}
