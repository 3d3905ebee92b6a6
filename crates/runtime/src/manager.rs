//! The conversation manager: owns every conversation, routes inbound
//! prompts through the tool loop, and publishes responses on the prompt
//! channel.
//!
//! One async mutex per conversation keeps turns strictly serial within a
//! conversation while distinct conversations run in parallel.  Errors
//! never escape [`ConversationManager::on_prompt`]: anything the tool
//! loop could not recover from becomes a short apology sentence, so the
//! history always ends with an assistant text turn.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};

use warden_config::AppConfig;
use warden_container::ContainerManager;
use warden_llm::{LlmDriver, Message};
use warden_tools::ToolRegistry;

use crate::channel::{OutboundMessage, PromptChannel};
use crate::tool_loop::run_tool_loop;

struct Conversation {
    history: Vec<Message>,
    created_at: DateTime<Utc>,
    turns_completed: u64,
    turns_failed: u64,
}

impl Conversation {
    fn new() -> Self {
        Self {
            history: Vec::new(),
            created_at: Utc::now(),
            turns_completed: 0,
            turns_failed: 0,
        }
    }
}

/// Operator-facing summary of one conversation.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub history_len: usize,
    pub created_at: DateTime<Utc>,
    pub turns_completed: u64,
    pub turns_failed: u64,
}

pub struct ConversationManager {
    config: AppConfig,
    driver: Arc<LlmDriver>,
    registry: Arc<ToolRegistry>,
    containers: Arc<ContainerManager>,
    channel: Arc<dyn PromptChannel>,
    conversations: Mutex<HashMap<String, Arc<AsyncMutex<Conversation>>>>,
}

impl ConversationManager {
    pub fn new(
        config: AppConfig,
        driver: Arc<LlmDriver>,
        registry: Arc<ToolRegistry>,
        containers: Arc<ContainerManager>,
        channel: Arc<dyn PromptChannel>,
    ) -> Self {
        Self {
            config,
            driver,
            registry,
            containers,
            channel,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn conversation(&self, conversation_id: &str) -> Arc<AsyncMutex<Conversation>> {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                info!(conversation = conversation_id, "new conversation");
                Arc::new(AsyncMutex::new(Conversation::new()))
            })
            .clone()
    }

    /// Handle one inbound prompt to completion and publish the assistant's
    /// final text.  Returns the published text.
    pub async fn on_prompt(&self, conversation_id: &str, prompt: &str) -> String {
        let entry = self.conversation(conversation_id);
        let mut conversation = entry.lock().await;

        let system = if self.config.agent.system_prompt.is_empty() {
            None
        } else {
            Some(self.config.agent.system_prompt.as_str())
        };

        let text = match run_tool_loop(
            &self.driver,
            &self.registry,
            conversation_id,
            &mut conversation.history,
            prompt,
            system,
            self.config.agent.max_tool_rounds,
            self.config.agent.max_tokens,
        )
        .await
        {
            Ok(outcome) => {
                conversation.turns_completed += 1;
                info!(
                    conversation = conversation_id,
                    rounds = outcome.rounds,
                    tool_calls = outcome.tool_calls,
                    "turn complete"
                );
                outcome.text
            }
            Err(err) => {
                conversation.turns_failed += 1;
                error!(conversation = conversation_id, %err, "turn failed");
                // Terminal marker: the history must not end on a dangling
                // tool-use or tool-result turn.
                let apology = format!("Sorry, I could not finish that request: {err}.");
                conversation.history.push(Message::assistant(apology.clone()));
                apology
            }
        };

        self.channel
            .send(OutboundMessage::agent_response(conversation_id, text.clone()))
            .await;
        text
    }

    /// Clear a conversation's history.  Tool state and the container are
    /// retained; only the dialog starts over.
    pub async fn reset(&self, conversation_id: &str) {
        let entry = self.conversation(conversation_id);
        let mut conversation = entry.lock().await;
        conversation.history.clear();
        conversation.turns_completed = 0;
        conversation.turns_failed = 0;
        info!(conversation = conversation_id, "history reset");
    }

    /// Drop every conversation, reset persisted tool state, and destroy
    /// all containers.
    pub async fn wipe_all(&self) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.registry.wipe().await;
        self.containers.destroy_all().await;
        info!("all conversations wiped");
    }

    /// Snapshot of one conversation's history.
    pub async fn history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let entry = {
            let conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            conversations.get(conversation_id).cloned()
        }?;
        let conversation = entry.lock().await;
        Some(conversation.history.clone())
    }

    pub async fn summaries(&self) -> Vec<ConversationSummary> {
        let entries: Vec<(String, Arc<AsyncMutex<Conversation>>)> = {
            let conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
            conversations.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut summaries = Vec::with_capacity(entries.len());
        for (conversation_id, entry) in entries {
            let conversation = entry.lock().await;
            summaries.push(ConversationSummary {
                conversation_id,
                history_len: conversation.history.len(),
                created_at: conversation.created_at,
                turns_completed: conversation.turns_completed,
                turns_failed: conversation.turns_failed,
            });
        }
        summaries.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        summaries
    }

    /// Stop containers and write a final state snapshot; called on
    /// process shutdown.
    pub async fn shutdown(&self) {
        self.containers.shutdown().await;
        self.registry.persist_now().await;
        info!("conversation manager shut down");
    }
}
