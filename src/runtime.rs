//! # Runtime - explicit injection of the shared collaborators
//!
//! Every process-wide owner (AST cache, expression engine, broker, job
//! services, LLM client, WebSocket registry, knowledge service, persistence,
//! external collaborators) hangs off one [`Runtime`] handle that renderers
//! borrow. Construction goes through [`RuntimeBuilder`]; the
//! [`global`] accessor is a thin convenience wrapper for embedders that want
//! singleton behavior.
//!
//! Builders must run inside a tokio runtime: the thread service and broker
//! own background tasks.

use crate::agent::AgentEngine;
use crate::ast::LlmNode;
use crate::binding::DataBinding;
use crate::broker::{MemoryBroker, MessageBroker, MessageService};
use crate::cache::AstCache;
use crate::expr::ExpressionEngine;
use crate::jobs::{JobQueue, Scheduler, ThreadService};
use crate::knowledge::{
    EmbeddingsClient, HttpEmbeddings, KnowledgeService, MemoryVectorStore, VectorStore,
};
use crate::llm::{default_endpoint, ChatBackend, LlmClient};
use crate::parser::QuillParser;
use crate::persist::{MemoryStorageAdapter, StatePersistence, StorageAdapter};
use crate::services::{
    ActionSignal, DatabaseService, EmailService, FileService, NoActionSignal, NoopDatabase,
    NoopEmail, NoopFiles,
};
use crate::websocket::WebSocketService;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde_json::Value;
use std::sync::Arc;

/// Default worker-pool bound for the thread service.
const DEFAULT_MAX_WORKERS: usize = 8;

/// The shared collaborator bundle.
pub struct Runtime {
    pub expressions: Arc<ExpressionEngine>,
    pub binding: DataBinding,
    pub parser: Arc<QuillParser>,
    pub ast_cache: Arc<AstCache>,
    pub messages: Arc<MessageService>,
    pub threads: Arc<ThreadService>,
    pub scheduler: Arc<Scheduler>,
    pub jobs: Arc<JobQueue>,
    pub agents: Arc<AgentEngine>,
    pub chat: Arc<dyn ChatBackend>,
    pub websockets: Arc<WebSocketService>,
    pub knowledge: Arc<KnowledgeService>,
    pub persistence: Arc<StatePersistence>,
    pub database: Arc<dyn DatabaseService>,
    pub email: Arc<dyn EmailService>,
    pub files: Arc<dyn FileService>,
    pub actions: Arc<dyn ActionSignal>,

    /// Named LLM configurations registered by `q:llm`.
    pub llm_configs: DashMap<String, LlmNode>,
    /// Response cache for `q:llm-generate cache="true"`.
    pub llm_response_cache: DashMap<String, Value>,
    /// Agent definitions registered by `q:agent`, looked up by
    /// `q:agent-execute`.
    pub agent_configs: DashMap<String, crate::ast::AgentNode>,
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }
}

/// Builder with memory-backed defaults for every collaborator.
#[derive(Default)]
pub struct RuntimeBuilder {
    broker: Option<Arc<dyn MessageBroker>>,
    chat: Option<Arc<dyn ChatBackend>>,
    embeddings: Option<Arc<dyn EmbeddingsClient>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    storage: Option<Arc<dyn StorageAdapter>>,
    database: Option<Arc<dyn DatabaseService>>,
    email: Option<Arc<dyn EmailService>>,
    files: Option<Arc<dyn FileService>>,
    actions: Option<Arc<dyn ActionSignal>>,
    jobs: Option<Arc<JobQueue>>,
    max_workers: Option<usize>,
    expression_cache_size: Option<usize>,
    ast_cache_entries: Option<usize>,
}

impl RuntimeBuilder {
    pub fn broker(mut self, broker: Arc<dyn MessageBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn chat_backend(mut self, chat: Arc<dyn ChatBackend>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<dyn EmbeddingsClient>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn database(mut self, database: Arc<dyn DatabaseService>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn email(mut self, email: Arc<dyn EmailService>) -> Self {
        self.email = Some(email);
        self
    }

    pub fn files(mut self, files: Arc<dyn FileService>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn actions(mut self, actions: Arc<dyn ActionSignal>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn job_queue(mut self, jobs: Arc<JobQueue>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn expression_cache_size(mut self, size: usize) -> Self {
        self.expression_cache_size = Some(size);
        self
    }

    pub fn ast_cache_entries(mut self, entries: usize) -> Self {
        self.ast_cache_entries = Some(entries);
        self
    }

    /// Assemble the runtime. Must run inside a tokio runtime.
    pub fn build(self) -> Arc<Runtime> {
        let expressions = Arc::new(ExpressionEngine::new(
            self.expression_cache_size
                .unwrap_or(crate::expr::DEFAULT_CACHE_SIZE),
            None,
        ));
        let binding = DataBinding::new(expressions.clone());

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn MessageBroker>);
        let chat = self
            .chat
            .unwrap_or_else(|| Arc::new(LlmClient::new()) as Arc<dyn ChatBackend>);
        let embeddings = self
            .embeddings
            .unwrap_or_else(|| Arc::new(HttpEmbeddings::new(default_endpoint())));
        let vector_store = self
            .vector_store
            .unwrap_or_else(|| Arc::new(MemoryVectorStore::new()));
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorageAdapter::new()));
        let jobs = self.jobs.unwrap_or_else(|| {
            Arc::new(JobQueue::open_in_memory().expect("in-memory job store opens"))
        });
        let agents = Arc::new(AgentEngine::new(chat.clone()));
        let knowledge = Arc::new(KnowledgeService::new(
            embeddings,
            vector_store,
            chat.clone(),
        ));

        Arc::new(Runtime {
            binding,
            expressions,
            parser: Arc::new(QuillParser::new()),
            ast_cache: Arc::new(AstCache::default()),
            messages: Arc::new(MessageService::new(broker)),
            threads: Arc::new(ThreadService::new(
                self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
            )),
            scheduler: Arc::new(Scheduler::new()),
            jobs,
            agents,
            chat,
            websockets: Arc::new(WebSocketService::new()),
            knowledge,
            persistence: Arc::new(StatePersistence::new(storage)),
            database: self.database.unwrap_or_else(|| Arc::new(NoopDatabase)),
            email: self.email.unwrap_or_else(|| Arc::new(NoopEmail)),
            files: self.files.unwrap_or_else(|| Arc::new(NoopFiles)),
            actions: self.actions.unwrap_or_else(|| Arc::new(NoActionSignal)),
            llm_configs: DashMap::new(),
            llm_response_cache: DashMap::new(),
            agent_configs: DashMap::new(),
        })
    }
}

static GLOBAL: OnceCell<Arc<Runtime>> = OnceCell::new();

/// Process-wide default runtime, built on first access with memory-backed
/// collaborators. Prefer explicit injection; this exists for embedders that
/// want singleton ergonomics.
pub fn global() -> Arc<Runtime> {
    GLOBAL
        .get_or_init(|| Runtime::builder().build())
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedChat;

    #[tokio::test]
    async fn test_builder_defaults() {
        let runtime = Runtime::builder().build();
        assert!(!runtime.messages.broker().is_connected());
        assert_eq!(runtime.llm_configs.len(), 0);
    }

    #[tokio::test]
    async fn test_builder_accepts_overrides() {
        let backend = Arc::new(ScriptedChat::single("hi"));
        let runtime = Runtime::builder()
            .chat_backend(backend)
            .max_workers(2)
            .expression_cache_size(16)
            .build();
        // The agent engine shares the injected backend.
        let result = runtime
            .agents
            .execute(crate::agent::AgentRequest {
                task: "t".into(),
                tools: vec![crate::ast::AgentToolNode {
                    name: "noop".into(),
                    description: "d".into(),
                    params: vec![],
                    body: vec![],
                }],
                max_iterations: 1,
                ..crate::agent::AgentRequest::default()
            })
            .await;
        // "hi" parses as no action; first-iteration responses are not
        // salvaged, so the run ends at max iterations.
        assert!(!result.success);
    }
}
