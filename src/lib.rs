//! # Quill Runtime Core
//!
//! The execution core of the Quill declarative XML application framework.
//! Source documents are tag-based component trees (`q:` root namespace plus
//! `ui:` / `qt:` / `qg:` sub-namespaces); this crate parses them into typed
//! ASTs, evaluates them against scoped variable contexts, renders the
//! reference HTML output, and drives the infrastructure tags (messaging,
//! jobs, agents, LLMs, WebSockets, knowledge bases).
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`expr`] | Safe, LRU-cached evaluation of `{expr}` databinding expressions |
//! | [`binding`] | `{expr}` substitution inside text and attributes |
//! | [`ast`] | Typed nodes for every tag, with `validate()` and canonical records |
//! | [`parser`] | XML → AST, namespace dispatch, unified-query lowering |
//! | [`cache`] | mtime+size validated LRU cache of parsed documents |
//! | [`context`] | Lexically scoped variable store (component/function/loop) |
//! | [`render`] | The tree-walking statement interpreter |
//! | [`broker`] | Pub/sub + queue + request/reply with the in-memory adapter |
//! | [`jobs`] | Thread pool, scheduler, durable SQLite-backed job queue |
//! | [`agent`] | ReAct tool-using reasoning loop |
//! | [`llm`] | Multi-provider LLM client with endpoint auto-detection |
//! | [`websocket`] | Connection registry and event dispatch |
//! | [`knowledge`] | Chunking, embeddings, vector retrieval, RAG |
//! | [`persist`] | Declarative state persistence hooks |
//! | [`services`] | Collaborator contracts (database, mail, files, actions) |
//! | [`runtime`] | The injected collaborator bundle renderers borrow |
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use quill::{ExecutionContext, QuillParser, Renderer, Runtime};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let runtime = Runtime::builder().build();
//! let document = QuillParser::new().parse(
//!     r#"<q:component name="hello">
//!         <q:set name="who" value="world" />
//!         <p>hello {who}</p>
//!     </q:component>"#,
//! )?;
//!
//! let renderer = Renderer::new(runtime);
//! let mut ctx = ExecutionContext::new();
//! let html = renderer.render_document(&document, &mut ctx).await;
//! assert_eq!(html.trim(), "<p>hello world</p>");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod ast;
pub mod binding;
pub mod broker;
pub mod cache;
pub mod context;
pub mod error;
pub mod expr;
pub mod jobs;
pub mod knowledge;
pub mod llm;
pub mod parser;
pub mod persist;
pub mod render;
pub mod runtime;
pub mod services;
pub mod value;
pub mod websocket;

// The types most embedders touch.
pub use agent::{AgentEngine, AgentRequest, AgentResult};
pub use ast::{Document, Node, ValidationIssue};
pub use binding::DataBinding;
pub use broker::{MemoryBroker, MessageBroker, MessageService};
pub use cache::{AstCache, CacheWatcher};
pub use context::{ExecutionContext, ScopeKind};
pub use error::{QuillError, Result};
pub use expr::{ExprError, ExpressionEngine};
pub use jobs::{JobQueue, JobStatus, Scheduler, ThreadService};
pub use knowledge::KnowledgeService;
pub use llm::{detect_provider, ChatBackend, LlmClient, Provider};
pub use parser::QuillParser;
pub use persist::{PersistScope, StatePersistence, StorageAdapter};
pub use render::Renderer;
pub use runtime::{Runtime, RuntimeBuilder};
pub use services::{DatabaseService, QueryResult};
pub use websocket::WebSocketService;
