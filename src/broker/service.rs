//! High-level message service above the broker adapter.
//!
//! This is what the interpreter talks to for `q:message` / `q:subscribe` /
//! `q:queue`: it JSON-serializes structured bodies, parses JSON replies,
//! fans a comma-separated topic list into multiple subscriptions, and
//! implements the ack-mode policy (auto acks after a clean handler return;
//! handler failures are logged and nacked-with-requeue in manual mode, log
//! only in auto mode).

use super::{BrokerError, Message, MessageBroker, MessageHandler, QueueOptions};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Result record stored under a `q:message` / `q:queue` node's name.
#[derive(Debug, Clone)]
pub struct MessageResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl MessageResult {
    pub fn ok(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            data: None,
            error: None,
        }
    }

    pub fn ok_with_data(data: Value) -> Self {
        Self {
            success: true,
            message_id: None,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "success": self.success,
            "message_id": self.message_id,
            "data": self.data,
            "error": self.error,
        })
    }
}

/// Subscription request from a `q:subscribe` node.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub name: String,
    pub topic: Option<String>,
    /// Comma-separated list of additional patterns.
    pub topics: Option<String>,
    pub queue: Option<String>,
    pub manual_ack: bool,
    pub prefetch: usize,
}

/// Handler invoked per delivery: the raw message (for ack/nack/reply) and
/// the parsed message context exposed to the handler statements.
pub type SubscriptionCallback =
    Arc<dyn Fn(Message, Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The interpreter-facing message facade.
pub struct MessageService {
    broker: Arc<dyn MessageBroker>,
    /// Subscription name → broker subscription/consumer ids.
    subscriptions: DashMap<String, Vec<String>>,
}

impl MessageService {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self {
            broker,
            subscriptions: DashMap::new(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    async fn ensure_connected(&self) -> Result<(), BrokerError> {
        if !self.broker.is_connected() {
            self.broker.connect(json!({})).await?;
        }
        Ok(())
    }

    fn encode_body(body: &Value) -> String {
        match body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn decode_body(body: &str) -> Value {
        serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
    }

    /// The context record handler statements see for a delivery.
    pub fn message_context(message: &Message) -> Value {
        json!({
            "id": message.id,
            "topic": message.topic,
            "queue": message.queue,
            "body": Self::decode_body(&message.body),
            "headers": message.headers,
            "timestamp": message.timestamp.to_rfc3339(),
            "correlation_id": message.correlation_id,
        })
    }

    /// Publish to a topic.
    pub async fn publish(
        &self,
        topic: &str,
        body: Value,
        headers: HashMap<String, String>,
    ) -> MessageResult {
        if let Err(e) = self.ensure_connected().await {
            return MessageResult::failed(e.to_string());
        }
        let message = Message::to_topic(topic, Self::encode_body(&body)).with_headers(headers);
        let id = message.id.clone();
        match self.broker.publish(topic, message).await {
            Ok(()) => MessageResult::ok(Some(id)),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Send to a queue.
    pub async fn send(
        &self,
        queue: &str,
        body: Value,
        headers: HashMap<String, String>,
    ) -> MessageResult {
        if let Err(e) = self.ensure_connected().await {
            return MessageResult::failed(e.to_string());
        }
        let message = Message::to_queue(queue, Self::encode_body(&body)).with_headers(headers);
        let id = message.id.clone();
        match self.broker.send(queue, message).await {
            Ok(()) => MessageResult::ok(Some(id)),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Send a request and wait for the reply.
    pub async fn request(
        &self,
        queue: &str,
        body: Value,
        headers: HashMap<String, String>,
        timeout_ms: u64,
    ) -> MessageResult {
        if let Err(e) = self.ensure_connected().await {
            return MessageResult::failed(e.to_string());
        }
        let message = Message::to_queue(queue, Self::encode_body(&body)).with_headers(headers);
        match self.broker.request(queue, message, timeout_ms).await {
            Ok(response) => MessageResult {
                success: true,
                message_id: Some(response.id.clone()),
                data: Some(Self::decode_body(&response.body)),
                error: None,
            },
            Err(e @ BrokerError::Timeout(_)) => {
                MessageResult::failed(format!("Request timed out: {}", e))
            }
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Register a durable subscription (topic patterns and/or a queue).
    pub async fn subscribe(
        &self,
        options: SubscribeOptions,
        callback: SubscriptionCallback,
    ) -> Result<String, BrokerError> {
        self.ensure_connected().await?;

        let broker = self.broker.clone();
        let manual_ack = options.manual_ack;
        let subscription_name = options.name.clone();

        let handler: MessageHandler = Arc::new(move |message: Message| {
            let callback = callback.clone();
            let broker = broker.clone();
            let name = subscription_name.clone();
            Box::pin(async move {
                let context = Self::message_context(&message);
                match callback(message.clone(), context).await {
                    Ok(()) => {
                        if !manual_ack {
                            let _ = broker.ack(&message).await;
                        }
                    }
                    Err(e) => {
                        tracing::error!(subscription = %name, error = %e, "subscription handler failed");
                        if manual_ack {
                            let _ = broker.nack(&message, true).await;
                        }
                    }
                }
            })
        });

        let mut ids = Vec::new();
        if let Some(queue) = &options.queue {
            ids.push(
                self.broker
                    .consume(queue, handler.clone(), options.prefetch.max(1))
                    .await?,
            );
        }
        let mut patterns: Vec<String> = Vec::new();
        if let Some(topic) = &options.topic {
            patterns.push(topic.clone());
        }
        if let Some(topics) = &options.topics {
            patterns.extend(
                topics
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
            );
        }
        for pattern in &patterns {
            ids.push(self.broker.subscribe(pattern, handler.clone()).await?);
        }

        if ids.is_empty() {
            return Err(BrokerError::Other(
                "subscribe requires 'topic', 'topics', or 'queue'".into(),
            ));
        }

        let joined = ids.join(",");
        self.subscriptions.insert(options.name, ids);
        Ok(joined)
    }

    /// Remove a named subscription (all of its broker ids).
    pub async fn unsubscribe(&self, name: &str) -> Result<(), BrokerError> {
        if let Some((_, ids)) = self.subscriptions.remove(name) {
            for id in ids {
                self.broker.unsubscribe(&id).await?;
            }
        }
        Ok(())
    }

    /// Manual ack of a delivery by message id.
    pub async fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        self.broker.ack(message).await
    }

    /// Manual nack of a delivery by message id.
    pub async fn nack(&self, message: &Message, requeue: bool) -> Result<(), BrokerError> {
        self.broker.nack(message, requeue).await
    }

    /// Reply to a request message.
    pub async fn reply(&self, incoming: &Message, body: Value) -> Result<(), BrokerError> {
        let response = Message::to_queue(
            incoming.reply_to.clone().unwrap_or_default(),
            Self::encode_body(&body),
        );
        self.broker.reply(incoming, response).await
    }

    /// Declare a queue.
    pub async fn declare_queue(&self, name: &str, options: QueueOptions) -> MessageResult {
        if let Err(e) = self.ensure_connected().await {
            return MessageResult::failed(e.to_string());
        }
        match self.broker.declare_queue(name, options).await {
            Ok(()) => MessageResult::ok(None),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Remove all messages from a queue.
    pub async fn purge_queue(&self, name: &str) -> MessageResult {
        match self.broker.purge_queue(name).await {
            Ok(count) => MessageResult::ok_with_data(json!({ "purged_count": count })),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Delete a queue.
    pub async fn delete_queue(&self, name: &str) -> MessageResult {
        match self.broker.delete_queue(name).await {
            Ok(()) => MessageResult::ok(None),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }

    /// Queue status.
    pub async fn queue_info(&self, name: &str) -> MessageResult {
        match self.broker.get_queue_info(name).await {
            Ok(info) => MessageResult::ok_with_data(
                serde_json::to_value(&info).unwrap_or(Value::Null),
            ),
            Err(e) => MessageResult::failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::MemoryBroker;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn service() -> MessageService {
        MessageService::new(Arc::new(MemoryBroker::new()))
    }

    #[tokio::test]
    async fn test_publish_serializes_structured_bodies() {
        let service = service();
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_for_callback = received.clone();
        let callback: SubscriptionCallback = Arc::new(move |_msg, context| {
            let received = received_for_callback.clone();
            Box::pin(async move {
                received.lock().unwrap().push(context["body"].clone());
                Ok(())
            })
        });
        service
            .subscribe(
                SubscribeOptions {
                    name: "s".into(),
                    topic: Some("events.*".into()),
                    prefetch: 1,
                    ..SubscribeOptions::default()
                },
                callback,
            )
            .await
            .unwrap();

        let result = service
            .publish("events.test", json!({"n": 1}), HashMap::new())
            .await;
        assert!(result.success);
        assert!(result.message_id.is_some());

        for _ in 0..100 {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        // The structured body round-trips through the string wire form.
        assert_eq!(received.lock().unwrap()[0], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_subscribe_multiple_topics_comma_separated() {
        let service = service();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_for_callback = hits.clone();
        let callback: SubscriptionCallback = Arc::new(move |_msg, _context| {
            let hits = hits_for_callback.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let joined = service
            .subscribe(
                SubscribeOptions {
                    name: "multi".into(),
                    topics: Some("a.*, b.*".into()),
                    prefetch: 1,
                    ..SubscribeOptions::default()
                },
                callback,
            )
            .await
            .unwrap();
        assert_eq!(joined.split(',').count(), 2);

        service.publish("a.x", json!("1"), HashMap::new()).await;
        service.publish("b.y", json!("2"), HashMap::new()).await;
        service.publish("c.z", json!("3"), HashMap::new()).await;

        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_consumption_auto_acks() {
        let service = service();
        let hits = Arc::new(AtomicU32::new(0));

        let hits_for_callback = hits.clone();
        let callback: SubscriptionCallback = Arc::new(move |_msg, _context| {
            let hits = hits_for_callback.clone();
            Box::pin(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        service
            .subscribe(
                SubscribeOptions {
                    name: "worker".into(),
                    queue: Some("jobs".into()),
                    prefetch: 1,
                    ..SubscribeOptions::default()
                },
                callback,
            )
            .await
            .unwrap();

        // Two sends; auto-ack must release the prefetch slot for the second.
        service.send("jobs", json!("a"), HashMap::new()).await;
        service.send("jobs", json!("b"), HashMap::new()).await;

        for _ in 0..200 {
            if hits.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_request_parses_json_reply() {
        let service = Arc::new(service());

        let service_for_responder = service.clone();
        let callback: SubscriptionCallback = Arc::new(move |msg, context| {
            let service = service_for_responder.clone();
            Box::pin(async move {
                let n = context["body"]["n"].as_i64().unwrap_or(0);
                service.reply(&msg, json!({"n": n + 1})).await?;
                Ok(())
            })
        });
        service
            .subscribe(
                SubscribeOptions {
                    name: "incr".into(),
                    queue: Some("incr".into()),
                    prefetch: 1,
                    ..SubscribeOptions::default()
                },
                callback,
            )
            .await
            .unwrap();

        let result = service
            .request("incr", json!({"n": 41}), HashMap::new(), 2_000)
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["n"], json!(42));
    }

    #[tokio::test]
    async fn test_request_timeout_is_captured() {
        let service = service();
        let result = service
            .request("void", json!("x"), HashMap::new(), 100)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }
}
