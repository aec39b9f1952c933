//! # Knowledge Service - chunking, embeddings, retrieval, RAG
//!
//! Indexes named knowledge bases: source text is chunked with a sliding
//! window that prefers paragraph and sentence boundaries, embedded in
//! batches through the embeddings endpoint, and upserted into the vector
//! store under deterministic chunk ids. Retrieval maps cosine distance to a
//! `[0, 1]` relevance (`max(0, 1 - distance/2)`); `rag_query` composes the
//! retrieved context into a grounded prompt for the LLM client.

use crate::ast::{KnowledgeNode, KnowledgeSourceNode, SourceKind};
use crate::llm::{ChatBackend, ChatMessage, ChatOptions};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Fixed system prompt for retrieval-grounded answers.
const RAG_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the question using ONLY the \
provided context. If the context does not contain the answer, say you do not know. Do not invent \
information.";

/// Knowledge base failure.
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("unknown knowledge base '{0}'")]
    UnknownBase(String),

    #[error("knowledge source error: {0}")]
    Source(String),

    #[error("embeddings error: {0}")]
    Embeddings(String),

    #[error("vector store error: {0}")]
    Store(String),

    #[error("llm error: {0}")]
    Llm(String),
}

// ============================================================================
// CHUNKING
// ============================================================================

/// Split text into chunks of roughly `chunk_size` characters with
/// `overlap` characters carried between neighbors.
///
/// Split points prefer paragraph breaks, then sentence boundaries
/// (`. ! ? ; ,` and newline), and are only taken past one third of
/// `chunk_size` so chunks never degenerate.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let mut end = hard_end;

        if hard_end < chars.len() {
            let min_split = start + chunk_size / 3;
            // Paragraph boundary first.
            let paragraph = (min_split..hard_end)
                .rev()
                .find(|&i| i > 0 && chars[i - 1] == '\n' && chars[i] == '\n');
            if let Some(i) = paragraph {
                end = i + 1;
            } else {
                // Sentence-ish boundary as a fallback.
                let sentence = (min_split..hard_end)
                    .rev()
                    .find(|&i| matches!(chars[i], '.' | '!' | '?' | ';' | ',' | '\n'));
                if let Some(i) = sentence {
                    end = i + 1;
                }
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        // Overlap into the next chunk, always making progress.
        start = std::cmp::max(end.saturating_sub(overlap), start + 1);
    }

    chunks
}

// ============================================================================
// COLLABORATOR CONTRACTS
// ============================================================================

/// Embeddings endpoint contract.
#[async_trait]
pub trait EmbeddingsClient: Send + Sync {
    async fn embed(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, KnowledgeError>;
}

/// Result shape returned by [`VectorStore::query`].
#[derive(Debug, Clone, Default)]
pub struct VectorQueryResult {
    pub documents: Vec<String>,
    pub metadatas: Vec<Value>,
    pub distances: Vec<f32>,
}

/// Vector store contract.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        collection: &str,
        ids: Vec<String>,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadatas: Vec<Value>,
    ) -> Result<(), KnowledgeError>;

    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        n_results: usize,
    ) -> Result<VectorQueryResult, KnowledgeError>;

    async fn count(&self, collection: &str) -> usize;

    async fn delete_collection(&self, collection: &str) -> Result<(), KnowledgeError>;
}

/// HTTP embeddings client against an Ollama-style `/api/embeddings`
/// endpoint.
pub struct HttpEmbeddings {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl EmbeddingsClient for HttpEmbeddings {
    async fn embed(
        &self,
        model: &str,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, KnowledgeError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let response = self
                .http
                .post(&url)
                .json(&json!({ "model": model, "prompt": text }))
                .send()
                .await
                .map_err(|e| KnowledgeError::Embeddings(e.to_string()))?;
            if !response.status().is_success() {
                return Err(KnowledgeError::Embeddings(format!(
                    "embeddings endpoint returned HTTP {}",
                    response.status()
                )));
            }
            let body: Value = response
                .json()
                .await
                .map_err(|e| KnowledgeError::Embeddings(e.to_string()))?;
            let vector = body["embedding"]
                .as_array()
                .ok_or_else(|| {
                    KnowledgeError::Embeddings("missing embedding in response".into())
                })?
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

struct StoredVector {
    id: String,
    document: String,
    embedding: Vec<f32>,
    metadata: Value,
}

/// In-memory cosine vector store.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: DashMap<String, Vec<StoredVector>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(
        &self,
        collection: &str,
        ids: Vec<String>,
        documents: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        metadatas: Vec<Value>,
    ) -> Result<(), KnowledgeError> {
        if ids.len() != documents.len() || ids.len() != embeddings.len() {
            return Err(KnowledgeError::Store(
                "ids, documents and embeddings must have equal length".into(),
            ));
        }
        let mut entries = self.collections.entry(collection.to_string()).or_default();
        for (i, id) in ids.into_iter().enumerate() {
            let stored = StoredVector {
                id,
                document: documents[i].clone(),
                embedding: embeddings[i].clone(),
                metadata: metadatas.get(i).cloned().unwrap_or(Value::Null),
            };
            match entries.iter_mut().find(|e| e.id == stored.id) {
                Some(existing) => *existing = stored,
                None => entries.push(stored),
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        query_embedding: &[f32],
        n_results: usize,
    ) -> Result<VectorQueryResult, KnowledgeError> {
        let entries = self
            .collections
            .get(collection)
            .ok_or_else(|| KnowledgeError::UnknownBase(collection.to_string()))?;

        let mut scored: Vec<(f32, &StoredVector)> = entries
            .iter()
            .map(|e| (cosine_distance(query_embedding, &e.embedding), e))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n_results);

        let mut result = VectorQueryResult::default();
        for (distance, entry) in scored {
            result.documents.push(entry.document.clone());
            result.metadatas.push(entry.metadata.clone());
            result.distances.push(distance);
        }
        Ok(result)
    }

    async fn count(&self, collection: &str) -> usize {
        self.collections
            .get(collection)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), KnowledgeError> {
        self.collections.remove(collection);
        Ok(())
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// One extracted source text ready for chunking.
#[derive(Debug, Clone)]
pub struct SourceText {
    pub label: String,
    pub text: String,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

/// One retrieval hit.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub content: String,
    pub relevance: f64,
    pub source: String,
    pub chunk_index: usize,
}

impl SearchHit {
    pub fn to_value(&self) -> Value {
        json!({
            "content": self.content,
            "relevance": self.relevance,
            "source": self.source,
            "chunk_index": self.chunk_index,
        })
    }
}

/// RAG answer.
#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub sources: Vec<String>,
    pub confidence: f64,
}

impl RagAnswer {
    pub fn to_value(&self) -> Value {
        json!({
            "answer": self.answer,
            "sources": self.sources,
            "confidence": self.confidence,
        })
    }
}

/// Indexing, retrieval, and RAG over the vector store and LLM client.
pub struct KnowledgeService {
    embeddings: Arc<dyn EmbeddingsClient>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn ChatBackend>,
    /// Embed model per indexed base, for searches that omit one.
    embed_models: DashMap<String, String>,
}

impl KnowledgeService {
    pub fn new(
        embeddings: Arc<dyn EmbeddingsClient>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            embeddings,
            store,
            llm,
            embed_models: DashMap::new(),
        }
    }

    /// Resolve a source node to its texts. Text sources pass through; file
    /// sources read the path; directory sources walk the tree recursively
    /// (a value containing glob metacharacters expands as a glob pattern
    /// instead); query and url sources must be resolved by the caller
    /// (`resolved` map).
    pub fn resolve_source(
        source: &KnowledgeSourceNode,
        resolved: &HashMap<String, String>,
    ) -> Result<Vec<SourceText>, KnowledgeError> {
        let passthrough = |label: &str, text: String| SourceText {
            label: label.to_string(),
            text,
            chunk_size: source.chunk_size,
            chunk_overlap: source.chunk_overlap,
        };

        match source.kind {
            SourceKind::Text => Ok(vec![passthrough("inline", source.value.clone())]),
            SourceKind::File => {
                let text = std::fs::read_to_string(&source.value)
                    .map_err(|e| KnowledgeError::Source(format!("{}: {}", source.value, e)))?;
                Ok(vec![passthrough(&source.value, text)])
            }
            SourceKind::Directory => {
                let mut texts = Vec::new();
                let mut push_file = |path: &std::path::Path| match std::fs::read_to_string(path) {
                    Ok(text) => {
                        texts.push(passthrough(&path.to_string_lossy(), text));
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping unreadable source file");
                    }
                };

                let is_glob = source.value.chars().any(|c| matches!(c, '*' | '?' | '['));
                if is_glob {
                    let paths = glob::glob(&source.value)
                        .map_err(|e| KnowledgeError::Source(e.to_string()))?;
                    for path in paths.flatten() {
                        if path.is_file() {
                            push_file(&path);
                        }
                    }
                } else {
                    for entry in walkdir::WalkDir::new(&source.value)
                        .into_iter()
                        .filter_map(|e| e.ok())
                    {
                        if entry.file_type().is_file() {
                            push_file(entry.path());
                        }
                    }
                }
                Ok(texts)
            }
            SourceKind::Query => {
                let text = resolved.get(&source.value).cloned().ok_or_else(|| {
                    KnowledgeError::Source(format!(
                        "query source '{}' was not resolved",
                        source.value
                    ))
                })?;
                Ok(vec![passthrough(&source.value, text)])
            }
            SourceKind::Url => {
                tracing::warn!(url = %source.value, "url knowledge sources are not supported yet");
                Ok(Vec::new())
            }
        }
    }

    /// Index a knowledge base. Skips work when the collection is already
    /// populated unless `rebuild` is set.
    pub async fn index_knowledge(
        &self,
        node: &KnowledgeNode,
        resolved_queries: &HashMap<String, String>,
    ) -> Result<usize, KnowledgeError> {
        if node.rebuild {
            self.store.delete_collection(&node.name).await?;
        } else if self.store.count(&node.name).await > 0 {
            tracing::info!(base = %node.name, "knowledge base already indexed");
            self.embed_models
                .insert(node.name.clone(), node.embed_model.clone());
            return Ok(self.store.count(&node.name).await);
        }

        let mut sources = Vec::new();
        for source in &node.sources {
            sources.extend(Self::resolve_source(source, resolved_queries)?);
        }

        let mut all_chunks = Vec::new();
        let mut all_metadata = Vec::new();
        let mut all_ids = Vec::new();
        for source in &sources {
            let size = source.chunk_size.unwrap_or(node.chunk_size);
            let overlap = source.chunk_overlap.unwrap_or(node.chunk_overlap);
            for (index, chunk) in chunk_text(&source.text, size, overlap).into_iter().enumerate()
            {
                all_ids.push(chunk_id(&node.name, &source.label, index));
                all_metadata.push(json!({
                    "source": source.label,
                    "chunk_index": index,
                }));
                all_chunks.push(chunk);
            }
        }

        if all_chunks.is_empty() {
            tracing::warn!(base = %node.name, "no text extracted from sources");
            return Ok(0);
        }

        let embeddings = self
            .embeddings
            .embed(&node.embed_model, &all_chunks)
            .await?;
        let total = all_chunks.len();
        self.store
            .upsert(&node.name, all_ids, all_chunks, embeddings, all_metadata)
            .await?;
        self.embed_models
            .insert(node.name.clone(), node.embed_model.clone());

        tracing::info!(base = %node.name, chunks = total, "knowledge base indexed");
        Ok(total)
    }

    /// Vector search over an indexed base.
    pub async fn search(
        &self,
        name: &str,
        query: &str,
        n_results: usize,
        embed_model: Option<&str>,
    ) -> Result<Vec<SearchHit>, KnowledgeError> {
        let model = embed_model
            .map(str::to_string)
            .or_else(|| self.embed_models.get(name).map(|m| m.value().clone()))
            .unwrap_or_else(|| "nomic-embed-text".to_string());

        let query_embedding = self
            .embeddings
            .embed(&model, &[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| KnowledgeError::Embeddings("empty embedding response".into()))?;

        let result = self.store.query(name, &query_embedding, n_results).await?;
        let hits = result
            .documents
            .into_iter()
            .zip(result.metadatas)
            .zip(result.distances)
            .map(|((content, metadata), distance)| SearchHit {
                content,
                relevance: (1.0 - f64::from(distance) / 2.0).max(0.0),
                source: metadata["source"].as_str().unwrap_or("inline").to_string(),
                chunk_index: metadata["chunk_index"].as_u64().unwrap_or(0) as usize,
            })
            .collect();
        Ok(hits)
    }

    /// Retrieval-augmented answer: search, compose the grounded prompt,
    /// call the LLM.
    pub async fn rag_query(
        &self,
        name: &str,
        question: &str,
        model: &str,
        n_results: usize,
        embed_model: Option<&str>,
        chat_options: &ChatOptions,
    ) -> Result<RagAnswer, KnowledgeError> {
        let hits = self.search(name, question, n_results, embed_model).await?;
        if hits.is_empty() {
            return Ok(RagAnswer {
                answer: "I do not know: the knowledge base returned no relevant context.".into(),
                sources: Vec::new(),
                confidence: 0.0,
            });
        }

        let context = hits
            .iter()
            .enumerate()
            .map(|(i, hit)| format!("[{}] ({})\n{}", i + 1, hit.source, hit.content))
            .collect::<Vec<_>>()
            .join("\n\n");
        let prompt = format!("Context:\n{}\n\nQuestion: {}", context, question);

        let mut options = chat_options.clone();
        options.model = model.to_string();
        let response = self
            .llm
            .chat(
                &[ChatMessage::system(RAG_SYSTEM_PROMPT), ChatMessage::user(prompt)],
                &options,
            )
            .await
            .map_err(|e| KnowledgeError::Llm(e.to_string()))?;

        let confidence = hits.iter().map(|h| h.relevance).fold(0.0f64, f64::max);
        let mut sources: Vec<String> = hits.into_iter().map(|h| h.source).collect();
        sources.dedup();

        Ok(RagAnswer {
            answer: response.content,
            sources,
            confidence,
        })
    }
}

/// Deterministic chunk id: digest of base, source label, and index.
fn chunk_id(base: &str, source: &str, index: usize) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", base, source, index).as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedChat;

    /// Deterministic fake embeddings: a 4-dim vector derived from character
    /// statistics, stable across calls.
    struct FakeEmbeddings;

    #[async_trait]
    impl EmbeddingsClient for FakeEmbeddings {
        async fn embed(
            &self,
            _model: &str,
            texts: &[String],
        ) -> Result<Vec<Vec<f32>>, KnowledgeError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let len = t.chars().count() as f32;
                    let vowels = t.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
                    let digits = t.chars().filter(|c| c.is_ascii_digit()).count() as f32;
                    let spaces = t.chars().filter(|c| c.is_whitespace()).count() as f32;
                    vec![len, vowels + 1.0, digits + 1.0, spaces + 1.0]
                })
                .collect())
        }
    }

    fn knowledge_node(name: &str, text: &str) -> KnowledgeNode {
        KnowledgeNode {
            name: name.into(),
            embed_model: "fake".into(),
            chunk_size: 500,
            chunk_overlap: 50,
            persist: false,
            persist_path: None,
            rebuild: false,
            sources: vec![KnowledgeSourceNode {
                kind: SourceKind::Text,
                value: text.into(),
                chunk_size: None,
                chunk_overlap: None,
            }],
        }
    }

    fn service() -> KnowledgeService {
        KnowledgeService::new(
            Arc::new(FakeEmbeddings),
            Arc::new(MemoryVectorStore::new()),
            Arc::new(ScriptedChat::single("Grounded answer.")),
        )
    }

    #[test]
    fn test_chunk_small_text_is_single_chunk() {
        let chunks = chunk_text("short text", 500, 50);
        assert_eq!(chunks, vec!["short text"]);
    }

    #[test]
    fn test_chunk_prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&text, 100, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn test_chunk_sentence_boundary_past_one_third() {
        let text = "First sentence here. Second sentence follows and keeps going with more words.";
        let chunks = chunk_text(text, 40, 5);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn test_chunk_always_progresses() {
        // Pathological input with no boundaries must still terminate.
        let text = "x".repeat(1000);
        let chunks = chunk_text(&text, 100, 99);
        assert!(!chunks.is_empty());
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert!(total >= 1000);
    }

    #[tokio::test]
    async fn test_index_and_search() {
        let service = service();
        let node = knowledge_node("docs", "Rust is a systems language. Quill renders XML.");
        let indexed = service.index_knowledge(&node, &HashMap::new()).await.unwrap();
        assert!(indexed >= 1);

        let hits = service.search("docs", "Rust systems", 3, None).await.unwrap();
        assert!(!hits.is_empty());
        for hit in &hits {
            assert!((0.0..=1.0).contains(&hit.relevance));
        }
    }

    #[tokio::test]
    async fn test_reindex_skipped_unless_rebuild() {
        let service = service();
        let node = knowledge_node("docs", "Some content to index.");
        let first = service.index_knowledge(&node, &HashMap::new()).await.unwrap();

        // Second index call without rebuild keeps the existing collection.
        let second = service.index_knowledge(&node, &HashMap::new()).await.unwrap();
        assert_eq!(first, second);

        let mut rebuild_node = knowledge_node("docs", "Fresh content.");
        rebuild_node.rebuild = true;
        let rebuilt = service
            .index_knowledge(&rebuild_node, &HashMap::new())
            .await
            .unwrap();
        assert!(rebuilt >= 1);
    }

    #[tokio::test]
    async fn test_search_unknown_base_errors() {
        let service = service();
        let err = service.search("nope", "q", 3, None).await.unwrap_err();
        assert!(matches!(err, KnowledgeError::UnknownBase(_)));
    }

    #[tokio::test]
    async fn test_rag_query_composes_answer() {
        let service = service();
        let node = knowledge_node("docs", "The framework parses XML into an AST.");
        service.index_knowledge(&node, &HashMap::new()).await.unwrap();

        let answer = service
            .rag_query(
                "docs",
                "What does the framework parse?",
                "m",
                3,
                None,
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(answer.answer, "Grounded answer.");
        assert!(!answer.sources.is_empty());
        assert!(answer.confidence > 0.0);
    }

    #[test]
    fn test_chunk_ids_are_deterministic() {
        assert_eq!(chunk_id("kb", "file.md", 3), chunk_id("kb", "file.md", 3));
        assert_ne!(chunk_id("kb", "file.md", 3), chunk_id("kb", "file.md", 4));
    }

    #[test]
    fn test_directory_source_walks_recursively() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "top level doc").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("b.md"), "nested doc").unwrap();

        // A plain directory path walks the whole tree.
        let source = KnowledgeSourceNode {
            kind: SourceKind::Directory,
            value: dir.path().to_string_lossy().into_owned(),
            chunk_size: None,
            chunk_overlap: None,
        };
        let texts = KnowledgeService::resolve_source(&source, &HashMap::new()).unwrap();
        assert_eq!(texts.len(), 2);

        // A glob pattern only matches what it names.
        let glob_source = KnowledgeSourceNode {
            kind: SourceKind::Directory,
            value: format!("{}/*.md", dir.path().to_string_lossy()),
            chunk_size: None,
            chunk_overlap: None,
        };
        let texts = KnowledgeService::resolve_source(&glob_source, &HashMap::new()).unwrap();
        assert_eq!(texts.len(), 1);
        assert_eq!(texts[0].text, "top level doc");
    }

    #[test]
    fn test_query_source_requires_resolution() {
        let source = KnowledgeSourceNode {
            kind: SourceKind::Query,
            value: "users".into(),
            chunk_size: None,
            chunk_overlap: None,
        };
        assert!(KnowledgeService::resolve_source(&source, &HashMap::new()).is_err());

        let mut resolved = HashMap::new();
        resolved.insert("users".to_string(), "row data".to_string());
        let texts = KnowledgeService::resolve_source(&source, &resolved).unwrap();
        assert_eq!(texts[0].text, "row data");
    }
}
