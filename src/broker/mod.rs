//! # Message Broker
//!
//! Pluggable pub/sub + queue + request/reply abstraction.
//!
//! - [`MessageBroker`] - the adapter contract any backend implements.
//! - [`MemoryBroker`] - the in-process reference adapter: topic fan-out with
//!   single-segment `*` wildcards, durable ordered queues with round-robin
//!   consumer dispatch and prefetch, ack/nack with DLQ routing, and
//!   correlation-id request/reply.
//! - [`MessageService`] - the high-level layer the interpreter talks to:
//!   JSON body handling, `MessageResult` records, ack-mode bookkeeping.
//!
//! Delivery guarantees: a queued message reaches at most one consumer per
//! queue; only the first ack or nack of a delivery counts, later calls are
//! no-ops. Handlers run on broker-owned tasks; `disconnect()` drains
//! in-flight deliveries before returning.

mod memory;
mod service;
mod topic;

pub use memory::MemoryBroker;
pub use service::{MessageResult, MessageService, SubscribeOptions, SubscriptionCallback};
pub use topic::{topic_matches, validate_pattern};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Broker operation failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Wire-visible error kind tag.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Timeout(_) => "TimeoutError",
            _ => "BrokerError",
        }
    }
}

/// A message in flight.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub topic: Option<String>,
    pub queue: Option<String>,
    /// Body text; structured payloads are JSON-serialized by the service
    /// layer before they reach the broker.
    pub body: String,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn to_topic(topic: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: Some(topic.into()),
            queue: None,
            body: body.into(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn to_queue(queue: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: None,
            queue: Some(queue.into()),
            body: body.into(),
            headers: HashMap::new(),
            timestamp: Utc::now(),
            reply_to: None,
            correlation_id: None,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Declared queue settings.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter_queue: Option<String>,
    /// Message TTL in milliseconds; expired messages are dropped at
    /// dispatch.
    pub ttl_ms: Option<u64>,
}

/// Queue status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: usize,
    pub consumer_count: usize,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Handler invoked on broker-owned tasks for each delivery.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// The adapter contract any broker backend implements; the core ships the
/// in-memory reference adapter.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn connect(&self, config: serde_json::Value) -> Result<(), BrokerError>;
    async fn disconnect(&self) -> Result<(), BrokerError>;
    fn is_connected(&self) -> bool;

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;
    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<String, BrokerError>;
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError>;

    async fn send(&self, queue: &str, message: Message) -> Result<(), BrokerError>;
    async fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        prefetch: usize,
    ) -> Result<String, BrokerError>;

    async fn ack(&self, message: &Message) -> Result<(), BrokerError>;
    async fn nack(&self, message: &Message, requeue: bool) -> Result<(), BrokerError>;

    async fn request(
        &self,
        queue: &str,
        message: Message,
        timeout_ms: u64,
    ) -> Result<Message, BrokerError>;
    async fn reply(&self, incoming: &Message, response: Message) -> Result<(), BrokerError>;

    async fn get_queue_info(&self, name: &str) -> Result<QueueInfo, BrokerError>;
    async fn list_queues(&self) -> Vec<String>;
    async fn list_topics(&self) -> Vec<String>;
    async fn purge_queue(&self, name: &str) -> Result<usize, BrokerError>;
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;
}
