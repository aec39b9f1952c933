//! # Multi-Provider LLM Client
//!
//! Normalized chat/completion over three provider families: local-OSS
//! (Ollama), OpenAI-compatible, and Anthropic. The provider is auto-detected
//! from endpoint heuristics unless named explicitly. Provider-specific
//! message shaping: Anthropic lifts `system` messages into the top-level
//! `system` field; OpenAI-style providers pass the transcript through.
//!
//! Provider configurations are cached per (provider, endpoint, api-key)
//! tuple to avoid reconstruction between calls.
//!
//! [`ChatBackend`] is the seam the agent engine drives; [`ScriptedChat`]
//! implements it with canned responses for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use url::Url;

/// Default local endpoint when none is configured.
pub fn default_endpoint() -> String {
    std::env::var("QUILL_LLM_BASE_URL").unwrap_or_else(|_| "http://localhost:11434".to_string())
}

/// Provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Ollama => "ollama",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
        }
    }

    /// Parse an explicit provider name; `auto`/unknown return `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ollama" | "local" => Some(Provider::Ollama),
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            _ => None,
        }
    }
}

/// Auto-detect the provider family from an endpoint.
///
/// Heuristics: port 11434 → Ollama; `api.openai.com` → OpenAI;
/// `api.anthropic.com` → Anthropic; port 1234 (LM Studio) or a `/v1` path →
/// OpenAI-compatible; anything else defaults to Ollama.
pub fn detect_provider(endpoint: &str) -> Provider {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    };
    let Ok(url) = Url::parse(&normalized) else {
        return Provider::Ollama;
    };
    let host = url.host_str().unwrap_or("");
    let port = url.port();

    if port == Some(11434) {
        return Provider::Ollama;
    }
    if host.contains("api.openai.com") {
        return Provider::OpenAi;
    }
    if host.contains("api.anthropic.com") {
        return Provider::Anthropic;
    }
    if port == Some(1234) {
        return Provider::OpenAi;
    }
    if url.path().contains("/v1") {
        return Provider::OpenAi;
    }
    Provider::Ollama
}

/// Network or provider HTTP failure.
#[derive(Error, Debug)]
pub enum LlmProviderError {
    #[error("Cannot connect to {endpoint}. Ensure the service is running and reachable.")]
    CannotConnect { endpoint: String },

    #[error("{provider} request timed out")]
    Timeout { provider: &'static str },

    #[error("{provider} returned HTTP {status}: {body}")]
    Http {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} returned an unexpected response shape: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },
}

/// One transcript message.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Token accounting reported by providers.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// Normalized response.
#[derive(Debug, Clone, Serialize)]
pub struct LlmResponse {
    pub success: bool,
    pub content: String,
    pub model: String,
    pub provider: &'static str,
    pub usage: TokenUsage,
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub provider: Option<Provider>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    /// `Some("json")` asks JSON-mode from providers that support it.
    pub response_format: Option<String>,
    pub timeout: std::time::Duration,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            provider: None,
            endpoint: None,
            api_key: None,
            temperature: 0.7,
            max_tokens: None,
            response_format: None,
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

/// Resolved provider configuration, cached per tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProviderConfig {
    provider: Provider,
    endpoint: String,
    api_key: Option<String>,
}

/// The seam the agent engine and the interpreter drive. `LlmClient` is the
/// HTTP implementation; tests use [`ScriptedChat`].
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError>;
}

static SHARED_HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// HTTP multi-provider client.
pub struct LlmClient {
    http: reqwest::Client,
    configs: DashMap<(String, String, String), Arc<ProviderConfig>>,
}

impl Default for LlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            http: SHARED_HTTP.clone(),
            configs: DashMap::new(),
        }
    }

    /// Resolve (and cache) the provider configuration for a call.
    fn resolve(&self, options: &ChatOptions) -> Arc<ProviderConfig> {
        let endpoint = options
            .endpoint
            .clone()
            .unwrap_or_else(default_endpoint)
            .trim_end_matches('/')
            .to_string();
        let provider = options
            .provider
            .unwrap_or_else(|| detect_provider(&endpoint));
        let key = (
            provider.as_str().to_string(),
            endpoint.clone(),
            options.api_key.clone().unwrap_or_default(),
        );
        self.configs
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ProviderConfig {
                    provider,
                    endpoint,
                    api_key: options.api_key.clone(),
                })
            })
            .clone()
    }

    /// Single-prompt convenience over [`ChatBackend::chat`].
    pub async fn generate(
        &self,
        prompt: &str,
        system: Option<&str>,
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat(&messages, options).await
    }

    async fn post(
        &self,
        config: &ProviderConfig,
        url: String,
        headers: Vec<(&'static str, String)>,
        body: Value,
        timeout: std::time::Duration,
    ) -> Result<Value, LlmProviderError> {
        let provider = config.provider.as_str();
        let mut request = self.http.post(&url).timeout(timeout).json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmProviderError::Timeout { provider }
            } else if e.is_connect() {
                LlmProviderError::CannotConnect {
                    endpoint: config.endpoint.clone(),
                }
            } else {
                LlmProviderError::InvalidResponse {
                    provider,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(LlmProviderError::Http {
                provider,
                status: status.as_u16(),
                body: snippet,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| LlmProviderError::InvalidResponse {
                provider,
                message: e.to_string(),
            })
    }

    async fn chat_ollama(
        &self,
        config: &ProviderConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        let mut body = json!({
            "model": options.model,
            "messages": messages,
            "stream": false,
            "options": { "temperature": options.temperature },
        });
        if let Some(max_tokens) = options.max_tokens {
            body["options"]["num_predict"] = json!(max_tokens);
        }
        if options.response_format.as_deref() == Some("json") {
            body["format"] = json!("json");
        }

        let url = format!("{}/api/chat", config.endpoint);
        let response = self
            .post(config, url, Vec::new(), body, options.timeout)
            .await?;

        let content = response["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmProviderError::InvalidResponse {
                provider: "ollama",
                message: "missing message.content".into(),
            })?
            .to_string();
        let usage = TokenUsage::new(
            response["prompt_eval_count"].as_u64().unwrap_or(0),
            response["eval_count"].as_u64().unwrap_or(0),
        );
        Ok(LlmResponse {
            success: true,
            content,
            model: options.model.clone(),
            provider: "ollama",
            usage,
            error: None,
        })
    }

    async fn chat_openai(
        &self,
        config: &ProviderConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        let mut body = json!({
            "model": options.model,
            "messages": messages,
            "temperature": options.temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if options.response_format.as_deref() == Some("json") {
            body["response_format"] = json!({"type": "json_object"});
        }

        // Endpoints may or may not already carry the /v1 prefix.
        let base = config.endpoint.trim_end_matches('/');
        let url = if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        };

        let mut headers = Vec::new();
        if let Some(api_key) = &config.api_key {
            headers.push(("Authorization", format!("Bearer {}", api_key)));
        }

        let response = self
            .post(config, url, headers, body, options.timeout)
            .await?;

        let content = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| LlmProviderError::InvalidResponse {
                provider: "openai",
                message: "missing choices[0].message.content".into(),
            })?
            .to_string();
        let usage = TokenUsage::new(
            response["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            response["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );
        Ok(LlmResponse {
            success: true,
            content,
            model: options.model.clone(),
            provider: "openai",
            usage,
            error: None,
        })
    }

    async fn chat_anthropic(
        &self,
        config: &ProviderConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        // Anthropic takes system prompts as a top-level field.
        let (system_parts, chat_messages): (Vec<&ChatMessage>, Vec<&ChatMessage>) =
            messages.iter().partition(|m| m.role == "system");
        let system = system_parts
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut body = json!({
            "model": options.model,
            "max_tokens": options.max_tokens.unwrap_or(1024),
            "messages": chat_messages,
            "temperature": options.temperature,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        let url = format!("{}/v1/messages", config.endpoint.trim_end_matches("/v1"));
        let mut headers = vec![("anthropic-version", "2023-06-01".to_string())];
        if let Some(api_key) = &config.api_key {
            headers.push(("x-api-key", api_key.clone()));
        }

        let response = self
            .post(config, url, headers, body, options.timeout)
            .await?;

        let content = response["content"][0]["text"]
            .as_str()
            .ok_or_else(|| LlmProviderError::InvalidResponse {
                provider: "anthropic",
                message: "missing content[0].text".into(),
            })?
            .to_string();
        let usage = TokenUsage::new(
            response["usage"]["input_tokens"].as_u64().unwrap_or(0),
            response["usage"]["output_tokens"].as_u64().unwrap_or(0),
        );
        Ok(LlmResponse {
            success: true,
            content,
            model: options.model.clone(),
            provider: "anthropic",
            usage,
            error: None,
        })
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        let config = self.resolve(options);
        match config.provider {
            Provider::Ollama => self.chat_ollama(&config, messages, options).await,
            Provider::OpenAi => self.chat_openai(&config, messages, options).await,
            Provider::Anthropic => self.chat_anthropic(&config, messages, options).await,
        }
    }
}

/// Scripted backend returning canned responses in order (the last response
/// repeats once the script runs out). Records every request transcript.
pub struct ScriptedChat {
    responses: Mutex<Vec<String>>,
    cursor: Mutex<usize>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            cursor: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<LlmResponse, LlmProviderError> {
        self.requests
            .lock()
            .expect("scripted requests lock")
            .push(messages.to_vec());

        let responses = self.responses.lock().expect("scripted responses lock");
        let mut cursor = self.cursor.lock().expect("scripted cursor lock");
        let index = (*cursor).min(responses.len().saturating_sub(1));
        *cursor += 1;
        let content = responses
            .get(index)
            .cloned()
            .unwrap_or_default();

        Ok(LlmResponse {
            success: true,
            content,
            model: options.model.clone(),
            provider: "scripted",
            usage: TokenUsage::new(10, 5),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_ollama_from_port() {
        assert_eq!(detect_provider("http://localhost:11434"), Provider::Ollama);
        assert_eq!(
            detect_provider("http://127.0.0.1:11434/api/chat"),
            Provider::Ollama
        );
    }

    #[test]
    fn test_detect_openai_from_url() {
        assert_eq!(
            detect_provider("https://api.openai.com/v1"),
            Provider::OpenAi
        );
        assert_eq!(
            detect_provider("https://api.openai.com/v1/chat/completions"),
            Provider::OpenAi
        );
    }

    #[test]
    fn test_detect_lm_studio_port_and_v1_path() {
        assert_eq!(
            detect_provider("http://localhost:1234/v1"),
            Provider::OpenAi
        );
        assert_eq!(detect_provider("http://myserver.com/v1"), Provider::OpenAi);
        assert_eq!(
            detect_provider("https://custom-llm.example.com/v1/"),
            Provider::OpenAi
        );
    }

    #[test]
    fn test_detect_anthropic_even_with_v1_path() {
        assert_eq!(
            detect_provider("https://api.anthropic.com"),
            Provider::Anthropic
        );
        assert_eq!(
            detect_provider("https://api.anthropic.com/v1/messages"),
            Provider::Anthropic
        );
    }

    #[test]
    fn test_detect_defaults_to_ollama() {
        assert_eq!(detect_provider("http://localhost:8080"), Provider::Ollama);
        assert_eq!(detect_provider("http://unknown-llm.local"), Provider::Ollama);
    }

    #[test]
    fn test_provider_config_is_cached() {
        let client = LlmClient::new();
        let options = ChatOptions {
            model: "m".into(),
            endpoint: Some("http://localhost:11434".into()),
            ..ChatOptions::default()
        };
        let a = client.resolve(&options);
        let b = client.resolve(&options);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(client.configs.len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_backend_plays_in_order() {
        let backend = ScriptedChat::new(vec!["one".into(), "two".into()]);
        let options = ChatOptions {
            model: "m".into(),
            ..ChatOptions::default()
        };
        let first = backend.chat(&[ChatMessage::user("hi")], &options).await.unwrap();
        let second = backend.chat(&[ChatMessage::user("hi")], &options).await.unwrap();
        let third = backend.chat(&[ChatMessage::user("hi")], &options).await.unwrap();
        assert_eq!(first.content, "one");
        assert_eq!(second.content, "two");
        // The script repeats its last entry once exhausted.
        assert_eq!(third.content, "two");
        assert_eq!(backend.requests.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_token_usage_totals() {
        let usage = TokenUsage::new(100, 50);
        assert_eq!(usage.total, 150);
    }
}
