//! Tool runtime: provider plugins, schema validation, dual-layer state.
//!
//! A [`ToolProvider`] declares one or more tools plus its initial state and
//! handles dispatch for all of them.  The [`ToolRegistry`] owns the
//! schemas, validates inbound calls, routes them to the owning provider,
//! and persists both state layers through [`warden_state::StateStore`]
//! after every invocation.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use warden_state::{StateBuckets, StateStore};

pub mod schema;
pub use schema::{ParamKind, ParamSpec, input_schema, validate_args};

// ── Tool declarations ────────────────────────────────────────────────────────

/// A declarative tool record.  `id` is what the model calls; `description`
/// is fed to it verbatim.
#[derive(Debug, Clone)]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    /// Advisory return shape; never sent to the model.
    pub returns: Option<ParamKind>,
}

impl Tool {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            params: vec![],
            returns: None,
        }
    }

    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn with_returns(mut self, returns: ParamKind) -> Self {
        self.returns = Some(returns);
        self
    }

    /// Wire shape for the completion service:
    /// `{name, description, input_schema}`.
    pub fn wire_schema(&self) -> Value {
        json!({
            "name": self.id,
            "description": self.description,
            "input_schema": input_schema(&self.params),
        })
    }
}

/// What a tool invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolValue {
    Text(String),
    Json(Value),
    /// Rendered as visual input to the model rather than stringified JSON.
    Image { media_type: String, data_b64: String },
}

impl ToolValue {
    /// String rendering used when the result is sent back as text content.
    pub fn render(&self) -> String {
        match self {
            ToolValue::Text(text) => text.clone(),
            ToolValue::Json(value) => value.to_string(),
            ToolValue::Image { media_type, .. } => format!("[image: {media_type}]"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("duplicate tool id: {0}")]
    DuplicateTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Provider(String),
    #[error("container unavailable: {0}")]
    ContainerUnavailable(String),
}

// ── Providers ────────────────────────────────────────────────────────────────

/// Provider-global state handle.  Shared across conversations; a provider
/// that mutates it does its own (brief) locking.
pub type SharedValue = Arc<AsyncMutex<Value>>;

/// Everything a provider declares up front: its tools, the initial global
/// state, and the template each conversation's state starts from.
#[derive(Debug, Clone)]
pub struct ProviderManifest {
    pub tools: Vec<Tool>,
    pub global_state: Value,
    pub conversation_state: Value,
}

/// One validated tool invocation, handed to the owning provider.
pub struct ToolCall<'a> {
    pub tool_id: &'a str,
    /// Normalized arguments: defaults applied, undeclared fields dropped.
    pub args: Map<String, Value>,
    pub conversation_id: &'a str,
    /// Per-conversation state; mutations persist after the call returns.
    pub state: &'a mut Value,
    /// Provider-global state shared across conversations.
    pub global: &'a SharedValue,
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Stable provider name; keys both state buckets.
    fn name(&self) -> &str;

    fn declare(&self) -> ProviderManifest;

    async fn invoke(&self, call: ToolCall<'_>) -> Result<ToolValue, ToolError>;
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Central registry for all providers and their tools.
///
/// Effectively immutable after startup registration; the mutable interior
/// is the two state layers.  Same-conversation calls are serialized by the
/// conversation lock upstream; distinct conversations touch distinct state
/// entries and proceed in parallel.
pub struct ToolRegistry {
    providers: Vec<Arc<dyn ToolProvider>>,
    tools: Vec<Tool>,
    /// tool id → index into `providers`.
    routes: HashMap<String, usize>,
    /// provider name → per-conversation state template.
    templates: HashMap<String, Value>,
    /// provider name → initial global state, kept for `wipe`.
    initial_global: HashMap<String, Value>,
    global: HashMap<String, SharedValue>,
    conversations: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
    store: Arc<StateStore>,
    scratch_root: PathBuf,
}

impl ToolRegistry {
    /// Load persisted state and start with no providers registered.
    /// `scratch_root` is the parent of all per-conversation working
    /// directories, used to stamp `_working_directory` into fresh state.
    pub fn new(store: Arc<StateStore>, scratch_root: PathBuf) -> Self {
        let buckets = store.load();
        Self {
            providers: vec![],
            tools: vec![],
            routes: HashMap::new(),
            templates: HashMap::new(),
            initial_global: HashMap::new(),
            global: buckets
                .global
                .iter()
                .map(|(name, value)| (name.clone(), Arc::new(AsyncMutex::new(value.clone()))))
                .collect(),
            conversations: Mutex::new(buckets.conversations),
            store,
            scratch_root,
        }
    }

    /// Register a provider: declare its tools, enforce id uniqueness, merge
    /// its initial global state (persisted value wins), record the
    /// per-conversation template.
    pub fn register(&mut self, provider: Arc<dyn ToolProvider>) -> Result<(), ToolError> {
        let manifest = provider.declare();
        for tool in &manifest.tools {
            if self.routes.contains_key(&tool.id) {
                return Err(ToolError::DuplicateTool(tool.id.clone()));
            }
        }

        let index = self.providers.len();
        let name = provider.name().to_string();
        for tool in &manifest.tools {
            self.routes.insert(tool.id.clone(), index);
        }
        info!(
            provider = %name,
            tools = ?manifest.tools.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "provider registered"
        );

        self.tools.extend(manifest.tools);
        // Only-if-absent: a value loaded from disk is authoritative.
        self.global
            .entry(name.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(manifest.global_state.clone())));
        self.initial_global.insert(name.clone(), manifest.global_state);
        self.templates.insert(name, manifest.conversation_state);
        self.providers.push(provider);
        Ok(())
    }

    /// All registered tools, in registration order.
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Wire-shaped schema list for the completion service.
    pub fn tool_schemas(&self) -> Vec<Value> {
        self.tools.iter().map(Tool::wire_schema).collect()
    }

    /// Validate and dispatch one tool call, then persist state.
    ///
    /// Every failure mode is a value so the caller can feed it back to the
    /// model as tool-result error content.
    pub async fn call(
        &self,
        tool_id: &str,
        args: &Value,
        conversation_id: &str,
    ) -> Result<ToolValue, ToolError> {
        let index = *self
            .routes
            .get(tool_id)
            .ok_or_else(|| ToolError::UnknownTool(tool_id.to_string()))?;
        let provider = &self.providers[index];
        let tool = self
            .tools
            .iter()
            .find(|t| t.id == tool_id)
            .expect("routed tool is declared");

        let normalized = validate_args(&tool.params, args).map_err(ToolError::InvalidArgs)?;

        let provider_name = provider.name().to_string();
        let mut state = self.fetch_conversation_state(&provider_name, conversation_id);
        let global = self.global[&provider_name].clone();

        debug!(tool = tool_id, conversation = conversation_id, "invoking tool");
        let result = provider
            .invoke(ToolCall {
                tool_id,
                args: normalized,
                conversation_id,
                state: &mut state,
                global: &global,
            })
            .await;

        self.write_back(&provider_name, conversation_id, state);
        self.persist().await;
        result
    }

    /// Per-conversation state slot: persisted value if present, otherwise a
    /// deep copy of the provider's template with the convenience fields
    /// stamped in.
    fn fetch_conversation_state(&self, provider_name: &str, conversation_id: &str) -> Value {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .entry(provider_name.to_string())
            .or_insert_with(|| {
                let mut state = self.templates.get(provider_name).cloned().unwrap_or(Value::Null);
                if let Value::Object(map) = &mut state {
                    map.insert("_conversation_id".to_string(), json!(conversation_id));
                    map.insert(
                        "_working_directory".to_string(),
                        json!(self.scratch_root.join(conversation_id).display().to_string()),
                    );
                }
                state
            })
            .clone()
    }

    fn write_back(&self, provider_name: &str, conversation_id: &str, state: Value) {
        let mut conversations = self.conversations.lock().unwrap_or_else(|e| e.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .insert(provider_name.to_string(), state);
    }

    /// Snapshot both layers and save.  A save failure is logged and the
    /// next mutation re-attempts; the in-memory state stays authoritative.
    async fn persist(&self) {
        let mut buckets = StateBuckets {
            global: BTreeMap::new(),
            conversations: self
                .conversations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        };
        for (name, handle) in &self.global {
            buckets.global.insert(name.clone(), handle.lock().await.clone());
        }
        if let Err(err) = self.store.save(&buckets) {
            warn!(%err, "state persistence failed; continuing with in-memory state");
        }
    }

    /// Write a snapshot of both state layers now; used for the final save
    /// on process shutdown.
    pub async fn persist_now(&self) {
        self.persist().await;
    }

    /// Drop all conversation state, restore every provider's initial global
    /// state, and delete the state file.
    pub async fn wipe(&self) {
        self.conversations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        for (name, handle) in &self.global {
            let initial = self.initial_global.get(name).cloned().unwrap_or(Value::Null);
            *handle.lock().await = initial;
        }
        self.store.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two counting tools sharing one provider: per-conversation `count`
    /// plus a cross-conversation `total`.
    struct CounterProvider;

    #[async_trait]
    impl ToolProvider for CounterProvider {
        fn name(&self) -> &str {
            "counter"
        }

        fn declare(&self) -> ProviderManifest {
            ProviderManifest {
                tools: vec![
                    Tool::new("counter_add", "Add", "Add to the conversation counter.").with_params(
                        vec![
                            ParamSpec::required("amount", "How much to add", ParamKind::Integer),
                            ParamSpec::optional("note", "Optional note", ParamKind::String)
                                .with_default(json!("-")),
                        ],
                    ),
                    Tool::new("counter_get", "Get", "Read both counters."),
                ],
                global_state: json!({"total": 0}),
                conversation_state: json!({"count": 0}),
            }
        }

        async fn invoke(&self, call: ToolCall<'_>) -> Result<ToolValue, ToolError> {
            match call.tool_id {
                "counter_add" => {
                    let amount = call.args["amount"].as_i64().unwrap_or(0);
                    if amount < 0 {
                        return Err(ToolError::Provider("amount must be non-negative".into()));
                    }
                    let count = call.state["count"].as_i64().unwrap_or(0) + amount;
                    call.state["count"] = json!(count);
                    let mut global = call.global.lock().await;
                    let total = global["total"].as_i64().unwrap_or(0) + amount;
                    global["total"] = json!(total);
                    Ok(ToolValue::Json(json!({"count": count, "total": total})))
                }
                "counter_get" => Ok(ToolValue::Json(call.state.clone())),
                other => Err(ToolError::UnknownTool(other.to_string())),
            }
        }
    }

    fn registry_in(dir: &tempfile::TempDir) -> ToolRegistry {
        let store = Arc::new(StateStore::new(dir.path().join("state.bin")));
        let mut registry = ToolRegistry::new(store, dir.path().join("scratch"));
        registry.register(Arc::new(CounterProvider)).unwrap();
        registry
    }

    #[test]
    fn duplicate_tool_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry_in(&dir);
        let err = registry.register(Arc::new(CounterProvider)).unwrap_err();
        assert_eq!(err, ToolError::DuplicateTool("counter_add".to_string()));
    }

    #[test]
    fn schemas_have_wire_shape() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let schemas = registry.tool_schemas();
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0]["name"], "counter_add");
        assert_eq!(schemas[0]["input_schema"]["type"], "object");
        assert_eq!(schemas[0]["input_schema"]["required"], json!(["amount"]));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_value() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let err = registry.call("nope", &json!({}), "c1").await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".to_string()));
    }

    #[tokio::test]
    async fn invalid_args_name_the_field() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let err = registry
            .call("counter_add", &json!({"amount": "three"}), "c1")
            .await
            .unwrap_err();
        match err {
            ToolError::InvalidArgs(msg) => assert!(msg.contains("`amount`"), "{msg}"),
            other => panic!("expected InvalidArgs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_layers_accumulate_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);

        registry.call("counter_add", &json!({"amount": 2}), "c1").await.unwrap();
        registry.call("counter_add", &json!({"amount": 3}), "c1").await.unwrap();
        let result = registry.call("counter_add", &json!({"amount": 5}), "c2").await.unwrap();

        // c2 sees its own count but the shared total.
        assert_eq!(result, ToolValue::Json(json!({"count": 5, "total": 10})));

        let c1 = registry.call("counter_get", &json!({}), "c1").await.unwrap();
        let ToolValue::Json(state) = c1 else { panic!() };
        assert_eq!(state["count"], 5);
    }

    #[tokio::test]
    async fn fresh_state_is_stamped_with_convenience_fields() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        let result = registry.call("counter_get", &json!({}), "c9").await.unwrap();
        let ToolValue::Json(state) = result else { panic!() };
        assert_eq!(state["_conversation_id"], "c9");
        assert!(
            state["_working_directory"].as_str().unwrap().ends_with("scratch/c9"),
            "{state}"
        );
    }

    #[tokio::test]
    async fn provider_errors_do_not_lose_state_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.call("counter_add", &json!({"amount": 4}), "c1").await.unwrap();
        let err = registry.call("counter_add", &json!({"amount": -1}), "c1").await.unwrap_err();
        assert!(matches!(err, ToolError::Provider(_)));

        let result = registry.call("counter_get", &json!({}), "c1").await.unwrap();
        let ToolValue::Json(state) = result else { panic!() };
        assert_eq!(state["count"], 4);
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry_in(&dir);
            registry.call("counter_add", &json!({"amount": 7}), "c1").await.unwrap();
        }

        // New registry over the same store: persisted global beats the
        // provider's initial value, per-conversation state is back too.
        let registry = registry_in(&dir);
        let result = registry.call("counter_add", &json!({"amount": 1}), "c1").await.unwrap();
        assert_eq!(result, ToolValue::Json(json!({"count": 8, "total": 8})));
    }

    #[tokio::test]
    async fn wipe_restores_initial_state_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(&dir);
        registry.call("counter_add", &json!({"amount": 7}), "c1").await.unwrap();

        registry.wipe().await;

        let result = registry.call("counter_add", &json!({"amount": 1}), "c1").await.unwrap();
        assert_eq!(result, ToolValue::Json(json!({"count": 1, "total": 1})));
    }

    #[tokio::test]
    async fn defaults_reach_the_provider() {
        let dir = tempfile::tempdir().unwrap();

        struct EchoNote;
        #[async_trait]
        impl ToolProvider for EchoNote {
            fn name(&self) -> &str {
                "echo_note"
            }
            fn declare(&self) -> ProviderManifest {
                ProviderManifest {
                    tools: vec![Tool::new("echo_note", "Echo", "Echo the note.").with_params(vec![
                        ParamSpec::optional("note", "", ParamKind::String).with_default(json!("dflt")),
                    ])],
                    global_state: Value::Null,
                    conversation_state: Value::Null,
                }
            }
            async fn invoke(&self, call: ToolCall<'_>) -> Result<ToolValue, ToolError> {
                Ok(ToolValue::Text(call.args["note"].as_str().unwrap_or("").to_string()))
            }
        }

        let store = Arc::new(StateStore::new(dir.path().join("state.bin")));
        let mut registry = ToolRegistry::new(store, dir.path().to_path_buf());
        registry.register(Arc::new(EchoNote)).unwrap();

        let result = registry.call("echo_note", &json!({}), "c1").await.unwrap();
        assert_eq!(result, ToolValue::Text("dflt".to_string()));
    }
}
