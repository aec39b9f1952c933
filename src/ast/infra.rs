//! Infrastructure nodes: messaging, jobs, WebSockets, agents, LLMs,
//! knowledge bases, and state persistence groups.

use super::Node;
use crate::persist::PersistScope;
use serde::Serialize;
use serde_json::{json, Value};

// ============================================================================
// MESSAGING
// ============================================================================

/// What a `q:message` does with its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Fan out to all matching topic subscribers.
    Publish,
    /// Enqueue for exactly one queue consumer.
    Send,
    /// Synchronous request with a reply timeout.
    Request,
}

/// `<q:message-header name="k" value="v" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHeaderNode {
    pub name: String,
    pub value: String,
}

/// `<q:message type="publish" topic="orders.created">{payload}</q:message>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageNode {
    pub name: Option<String>,
    pub kind: MessageKind,
    pub topic: Option<String>,
    pub queue: Option<String>,
    pub body: String,
    pub headers: Vec<MessageHeaderNode>,
    pub timeout_ms: Option<u64>,
}

impl MessageNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self.kind {
            MessageKind::Publish => {
                if self.topic.is_none() {
                    errors.push("publish q:message requires a 'topic' attribute".into());
                }
            }
            MessageKind::Send | MessageKind::Request => {
                if self.queue.is_none() {
                    errors.push("send/request q:message requires a 'queue' attribute".into());
                }
            }
        }
        errors
    }
}

/// Ack mode for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    Auto,
    Manual,
}

/// `<q:subscribe name="s" topic="payments.*">handler statements</q:subscribe>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscribeNode {
    pub name: String,
    pub topic: Option<String>,
    /// Comma-separated list of additional topic patterns.
    pub topics: Option<String>,
    pub queue: Option<String>,
    pub ack: AckMode,
    pub prefetch: u16,
    pub handler: Vec<Node>,
}

impl SubscribeNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:subscribe requires a 'name' attribute".into());
        }
        if self.topic.is_none() && self.topics.is_none() && self.queue.is_none() {
            errors.push("q:subscribe requires 'topic', 'topics', or 'queue'".into());
        }
        if self.prefetch == 0 {
            errors.push("q:subscribe prefetch must be at least 1".into());
        }
        errors
    }
}

/// Queue management verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueAction {
    Declare,
    Delete,
    Purge,
    Info,
}

/// `<q:queue name="work" action="declare" durable="true" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueNode {
    pub name: String,
    pub action: QueueAction,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dlq: Option<String>,
    pub ttl_ms: Option<u64>,
    pub result_var: Option<String>,
}

impl QueueNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:queue requires a 'name' attribute".into());
        }
        errors
    }
}

/// `<q:ack />` - acknowledge the current delivery (manual ack mode).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageAckNode {}

/// `<q:nack requeue="false" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageNackNode {
    pub requeue: bool,
}

// ============================================================================
// JOB EXECUTION
// ============================================================================

/// `<q:schedule name="nightly" cron="0 0 3 * * *">...</q:schedule>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleNode {
    pub name: String,
    pub interval: Option<String>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub enabled: bool,
    pub body: Vec<Node>,
}

impl ScheduleNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:schedule requires a 'name' attribute".into());
        }
        if self.interval.is_none() && self.cron.is_none() {
            errors.push("q:schedule requires 'interval' or 'cron'".into());
        }
        if self.interval.is_some() && self.cron.is_some() {
            errors.push("q:schedule takes 'interval' or 'cron', not both".into());
        }
        errors
    }
}

/// Advisory thread priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadPriority {
    Low,
    Normal,
    High,
}

impl ThreadPriority {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "low" => Some(ThreadPriority::Low),
            "normal" => Some(ThreadPriority::Normal),
            "high" => Some(ThreadPriority::High),
            _ => None,
        }
    }
}

impl Default for ThreadPriority {
    fn default() -> Self {
        ThreadPriority::Normal
    }
}

/// `<q:thread name="warmup" priority="high">...</q:thread>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadNode {
    pub name: String,
    pub priority: ThreadPriority,
    pub body: Vec<Node>,
    pub result_var: Option<String>,
}

impl ThreadNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:thread requires a 'name' attribute".into());
        }
        errors
    }
}

/// `<q:job name="send-report" queue="default">` - with a body the node
/// registers the statements as the named job handler; without one it
/// dispatches the job with the given parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNode {
    pub name: String,
    pub queue: Option<String>,
    pub params: Vec<(String, String)>,
    pub priority: i32,
    pub delay: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<String>,
    pub result_var: Option<String>,
    pub handler: Vec<Node>,
}

impl JobNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:job requires a 'name' attribute".into());
        }
        errors
    }
}

// ============================================================================
// WEBSOCKETS
// ============================================================================

/// Events a WebSocket handler can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEvent {
    Connect,
    Message,
    Error,
    Close,
}

impl WsEvent {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "connect" => Some(WsEvent::Connect),
            "message" => Some(WsEvent::Message),
            "error" => Some(WsEvent::Error),
            "close" => Some(WsEvent::Close),
            _ => None,
        }
    }
}

/// `<q:on event="message">...</q:on>` inside `q:websocket`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketHandlerNode {
    pub event: WsEvent,
    pub body: Vec<Node>,
}

/// `<q:websocket name="chat" url="wss://...">handlers</q:websocket>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketNode {
    pub name: String,
    pub url: String,
    pub auto_connect: bool,
    pub handlers: Vec<WebSocketHandlerNode>,
}

impl WebSocketNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:websocket requires a 'name' attribute".into());
        }
        if self.url.is_empty() {
            errors.push("q:websocket requires a 'url' attribute".into());
        }
        errors
    }
}

/// `<q:ws-send connection="chat" message="{payload}" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketSendNode {
    pub connection: String,
    pub message: String,
    pub result_var: Option<String>,
}

impl WebSocketSendNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.connection.is_empty() {
            errors.push("q:ws-send requires a 'connection' attribute".into());
        }
        errors
    }
}

/// `<q:ws-close connection="chat" code="1000" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebSocketCloseNode {
    pub connection: String,
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl WebSocketCloseNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.connection.is_empty() {
            errors.push("q:ws-close requires a 'connection' attribute".into());
        }
        errors
    }
}

// ============================================================================
// AGENTS
// ============================================================================

/// `<q:tool-param name="query" type="string" required="true" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentToolParamNode {
    pub name: String,
    pub param_type: String,
    pub required: bool,
    pub description: Option<String>,
}

/// `<q:tool name="search" description="...">body</q:tool>`
///
/// The body is an AST fragment executed through the interpreter when the
/// agent invokes the tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentToolNode {
    pub name: String,
    pub description: String,
    pub params: Vec<AgentToolParamNode>,
    pub body: Vec<Node>,
}

impl AgentToolNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:tool requires a 'name' attribute".into());
        }
        if self.description.is_empty() {
            errors.push(format!("tool '{}' requires a description", self.name));
        }
        errors
    }

    /// JSON-schema-shaped description of the tool's parameters, used when a
    /// provider supports structured tool definitions.
    pub fn schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            properties.insert(
                param.name.clone(),
                json!({
                    "type": param.param_type,
                    "description": param.description.clone().unwrap_or_default(),
                }),
            );
            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        })
    }
}

/// `<q:instruction>system instruction text</q:instruction>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInstructionNode {
    pub text: String,
}

/// `<q:agent name="helper" model="phi3">tools + instruction</q:agent>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentNode {
    pub name: String,
    pub model: String,
    pub provider: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub max_iterations: u32,
    pub timeout_ms: u64,
    pub instruction: Option<AgentInstructionNode>,
    pub tools: Vec<AgentToolNode>,
}

impl AgentNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:agent requires a 'name' attribute".into());
        }
        if self.model.is_empty() {
            errors.push("q:agent requires a 'model' attribute".into());
        }
        if self.max_iterations == 0 {
            errors.push("q:agent max_iterations must be at least 1".into());
        }
        for tool in &self.tools {
            errors.extend(tool.validate());
        }
        errors
    }
}

/// `<q:agent-execute agent="helper" task="..." result="answer" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentExecuteNode {
    pub agent: String,
    pub task: String,
    pub context: Option<String>,
    pub result_var: String,
}

impl AgentExecuteNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.agent.is_empty() {
            errors.push("q:agent-execute requires an 'agent' attribute".into());
        }
        if self.task.is_empty() {
            errors.push("q:agent-execute requires a 'task' attribute".into());
        }
        if self.result_var.is_empty() {
            errors.push("q:agent-execute requires a 'result' attribute".into());
        }
        errors
    }
}

// ============================================================================
// LLM
// ============================================================================

/// `<q:llm id="assistant" model="llama3" provider="ollama">` - registers a
/// named LLM configuration for later `q:llm-generate` calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmNode {
    pub id: String,
    pub model: String,
    pub provider: String,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
    /// Provider-specific attributes preserved verbatim.
    pub options: Vec<(String, String)>,
}

impl LlmNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.is_empty() {
            errors.push("q:llm requires an 'id' attribute".into());
        }
        if self.model.is_empty() {
            errors.push("q:llm requires a 'model' attribute".into());
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            errors.push(format!(
                "temperature must be between 0 and 1, got {}",
                self.temperature
            ));
        }
        if !matches!(
            self.provider.as_str(),
            "ollama" | "openai" | "anthropic" | "auto"
        ) {
            errors.push(format!(
                "unknown provider: {}. Supported: ollama, openai, anthropic, auto",
                self.provider
            ));
        }
        errors
    }
}

/// `<q:llm-generate llm="assistant" prompt="..." result="summary" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmGenerateNode {
    pub llm_id: String,
    pub prompt: String,
    pub result_var: Option<String>,
    pub stream: bool,
    pub cache: bool,
    pub cache_key: Option<String>,
}

impl LlmGenerateNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.llm_id.is_empty() {
            errors.push("q:llm-generate requires an 'llm' attribute".into());
        }
        if self.prompt.trim().is_empty() {
            errors.push("q:llm-generate requires a prompt".into());
        }
        errors
    }
}

// ============================================================================
// KNOWLEDGE
// ============================================================================

/// Kind of a knowledge source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Text,
    File,
    Directory,
    Query,
    Url,
}

impl SourceKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "text" => Some(SourceKind::Text),
            "file" => Some(SourceKind::File),
            "directory" | "dir" | "glob" => Some(SourceKind::Directory),
            "query" => Some(SourceKind::Query),
            "url" => Some(SourceKind::Url),
            _ => None,
        }
    }
}

/// `<q:source type="directory" value="docs/**/*.md" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeSourceNode {
    pub kind: SourceKind,
    pub value: String,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

/// `<q:knowledge name="docs" embed_model="nomic-embed-text">sources</q:knowledge>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeNode {
    pub name: String,
    pub embed_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub persist: bool,
    pub persist_path: Option<String>,
    pub rebuild: bool,
    pub sources: Vec<KnowledgeSourceNode>,
}

impl KnowledgeNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:knowledge requires a 'name' attribute".into());
        }
        if self.sources.is_empty() {
            errors.push("q:knowledge requires at least one source".into());
        }
        if self.chunk_overlap >= self.chunk_size {
            errors.push("chunk_overlap must be smaller than chunk_size".into());
        }
        errors
    }
}

/// `<q:search knowledge="docs" query="..." result="hits" top_k="5" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchNode {
    pub knowledge_id: String,
    pub query: String,
    pub result_var: Option<String>,
    pub top_k: usize,
    pub threshold: Option<f64>,
}

impl SearchNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.knowledge_id.is_empty() {
            errors.push("q:search requires a 'knowledge' attribute".into());
        }
        if self.query.trim().is_empty() {
            errors.push("q:search requires a query".into());
        }
        errors
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// `<q:persist scope="local" prefix="cart.">names</q:persist>` - groups
/// variables under a shared scope/prefix for save/restore.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistNode {
    pub scope: PersistScope,
    pub prefix: Option<String>,
    pub names: Vec<String>,
    pub ttl_seconds: Option<u64>,
    pub encrypt: bool,
}

impl PersistNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.names.is_empty() {
            errors.push("q:persist requires at least one variable name".into());
        }
        errors
    }
}
