//! In-memory reference broker adapter.
//!
//! Single-process. Topic subscriptions live in a pattern → handler-list map
//! and are matched at publish time. Queues are ordered lists with a
//! dispatcher task per queue handing messages to consumers round-robin,
//! honoring per-consumer prefetch. Requests ride on a correlation-id map of
//! oneshot channels. `nack(requeue = false)` routes to the queue's DLQ when
//! configured, else the message is discarded.
//!
//! Invariants:
//! - a queued message is delivered to at most one consumer;
//! - only the first ack/nack of a delivery settles it, later calls no-op;
//! - `disconnect()` drains in-flight handler tasks before returning.

use super::{
    topic, BrokerError, Message, MessageBroker, MessageHandler, QueueInfo, QueueOptions,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

const DISPATCH_TICK_MS: u64 = 100;
const DRAIN_TIMEOUT_MS: u64 = 5_000;

struct TopicSubscription {
    id: String,
    handler: MessageHandler,
}

struct Consumer {
    id: String,
    handler: MessageHandler,
    prefetch: usize,
    /// Deliveries handed to this consumer and not yet settled.
    in_flight: Arc<AtomicUsize>,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    messages: Mutex<VecDeque<Message>>,
    consumers: Mutex<Vec<Consumer>>,
    round_robin: AtomicUsize,
    notify: Notify,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

struct Delivery {
    queue: String,
    consumer_in_flight: Arc<AtomicUsize>,
    message: Message,
}

struct Inner {
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<String, Vec<TopicSubscription>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    deliveries: Mutex<HashMap<String, Delivery>>,
    pending_requests: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    active_handlers: AtomicUsize,
}

/// The in-memory reference adapter.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                active_handlers: AtomicUsize::new(0),
            }),
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn queue(&self, name: &str) -> Option<Arc<QueueState>> {
        self.inner.queues.lock().expect("queue map lock").get(name).cloned()
    }

    fn get_or_create_queue(&self, name: &str, options: QueueOptions) -> Arc<QueueState> {
        let mut queues = self.inner.queues.lock().expect("queue map lock");
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    name: name.to_string(),
                    options,
                    messages: Mutex::new(VecDeque::new()),
                    consumers: Mutex::new(Vec::new()),
                    round_robin: AtomicUsize::new(0),
                    notify: Notify::new(),
                    dispatcher: Mutex::new(None),
                })
            })
            .clone();
        drop(queues);
        self.ensure_dispatcher(&queue);
        queue
    }

    /// Spawn (or respawn after a disconnect) the queue's dispatcher task.
    fn ensure_dispatcher(&self, queue: &Arc<QueueState>) {
        let mut slot = queue.dispatcher.lock().expect("dispatcher lock");
        let running = slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
        if running {
            return;
        }
        let inner = self.inner.clone();
        let queue = queue.clone();
        *slot = Some(tokio::spawn(async move {
            dispatch_loop(inner, queue).await;
        }));
    }

    /// Settle a delivery: first caller wins, later calls observe `None`.
    fn settle(&self, message_id: &str) -> Option<Delivery> {
        self.inner
            .deliveries
            .lock()
            .expect("deliveries lock")
            .remove(message_id)
    }
}

async fn dispatch_loop(inner: Arc<Inner>, queue: Arc<QueueState>) {
    loop {
        if !inner.connected.load(Ordering::SeqCst) {
            break;
        }
        if !try_dispatch_one(&inner, &queue) {
            // Nothing deliverable right now; wake on notify or tick to
            // re-check TTLs and the connected flag.
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(DISPATCH_TICK_MS),
                queue.notify.notified(),
            )
            .await;
        }
    }
}

fn try_dispatch_one(inner: &Arc<Inner>, queue: &Arc<QueueState>) -> bool {
    let mut messages = queue.messages.lock().expect("queue messages lock");

    // Expired messages are dropped at dispatch time.
    if let Some(ttl_ms) = queue.options.ttl_ms {
        while let Some(front) = messages.front() {
            let age_ms = (Utc::now() - front.timestamp).num_milliseconds();
            if age_ms >= 0 && age_ms as u64 > ttl_ms {
                let expired = messages.pop_front();
                tracing::debug!(
                    queue = %queue.name,
                    id = expired.as_ref().map(|m| m.id.as_str()).unwrap_or(""),
                    "dropping expired message"
                );
            } else {
                break;
            }
        }
    }

    if messages.is_empty() {
        return false;
    }

    let consumers = queue.consumers.lock().expect("consumers lock");
    if consumers.is_empty() {
        return false;
    }

    // Round-robin over consumers with free prefetch slots.
    let start = queue.round_robin.load(Ordering::Relaxed);
    let selected = (0..consumers.len())
        .map(|offset| (start + offset) % consumers.len())
        .find(|&i| consumers[i].in_flight.load(Ordering::SeqCst) < consumers[i].prefetch);

    let Some(index) = selected else {
        return false;
    };
    queue.round_robin.store(index + 1, Ordering::Relaxed);

    let message = messages.pop_front().expect("checked non-empty");
    let consumer = &consumers[index];

    consumer.in_flight.fetch_add(1, Ordering::SeqCst);
    inner.deliveries.lock().expect("deliveries lock").insert(
        message.id.clone(),
        Delivery {
            queue: queue.name.clone(),
            consumer_in_flight: consumer.in_flight.clone(),
            message: message.clone(),
        },
    );

    inner.active_handlers.fetch_add(1, Ordering::SeqCst);
    let handler = consumer.handler.clone();
    let inner_for_task = inner.clone();
    tokio::spawn(async move {
        handler(message).await;
        inner_for_task.active_handlers.fetch_sub(1, Ordering::SeqCst);
    });

    true
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn connect(&self, _config: serde_json::Value) -> Result<(), BrokerError> {
        self.inner.connected.store(true, Ordering::SeqCst);
        // Revive dispatchers for queues that survived a disconnect.
        let queues: Vec<Arc<QueueState>> = self
            .inner
            .queues
            .lock()
            .expect("queue map lock")
            .values()
            .cloned()
            .collect();
        for queue in queues {
            self.ensure_dispatcher(&queue);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(false, Ordering::SeqCst);

        // Wake every dispatcher so it observes the flag and exits.
        for queue in self.inner.queues.lock().expect("queue map lock").values() {
            queue.notify.notify_waiters();
        }

        // Drain in-flight handler tasks.
        let deadline = std::time::Instant::now()
            + std::time::Duration::from_millis(DRAIN_TIMEOUT_MS);
        while self.inner.active_handlers.load(Ordering::SeqCst) > 0 {
            if std::time::Instant::now() > deadline {
                tracing::warn!("disconnect drain timed out with handlers still running");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .clear();
        for queue in self.inner.queues.lock().expect("queue map lock").values() {
            queue.consumers.lock().expect("consumers lock").clear();
        }
        self.inner
            .pending_requests
            .lock()
            .expect("pending requests lock")
            .clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        self.get_or_create_queue(name, options);
        Ok(())
    }

    async fn publish(&self, topic_name: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let handlers: Vec<MessageHandler> = {
            let subscriptions = self.inner.subscriptions.lock().expect("subscriptions lock");
            subscriptions
                .iter()
                .filter(|(pattern, _)| topic::topic_matches(topic_name, pattern))
                .flat_map(|(_, subs)| subs.iter().map(|s| s.handler.clone()))
                .collect()
        };

        for handler in handlers {
            let delivery = message.clone();
            self.inner.active_handlers.fetch_add(1, Ordering::SeqCst);
            let inner = self.inner.clone();
            tokio::spawn(async move {
                handler(delivery).await;
                inner.active_handlers.fetch_sub(1, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: MessageHandler,
    ) -> Result<String, BrokerError> {
        self.ensure_connected()?;
        topic::validate_pattern(pattern)?;

        let id = format!("sub-{}", Uuid::new_v4());
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .entry(pattern.to_string())
            .or_default()
            .push(TopicSubscription {
                id: id.clone(),
                handler,
            });
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), BrokerError> {
        // Topic subscription?
        {
            let mut subscriptions =
                self.inner.subscriptions.lock().expect("subscriptions lock");
            let mut removed = false;
            subscriptions.retain(|_, subs| {
                let before = subs.len();
                subs.retain(|s| s.id != subscription_id);
                removed |= subs.len() != before;
                !subs.is_empty()
            });
            if removed {
                return Ok(());
            }
        }
        // Queue consumer?
        for queue in self.inner.queues.lock().expect("queue map lock").values() {
            let mut consumers = queue.consumers.lock().expect("consumers lock");
            let before = consumers.len();
            consumers.retain(|c| c.id != subscription_id);
            if consumers.len() != before {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn send(&self, queue_name: &str, message: Message) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let queue = self.get_or_create_queue(queue_name, QueueOptions::default());
        queue
            .messages
            .lock()
            .expect("queue messages lock")
            .push_back(message);
        queue.notify.notify_one();
        Ok(())
    }

    async fn consume(
        &self,
        queue_name: &str,
        handler: MessageHandler,
        prefetch: usize,
    ) -> Result<String, BrokerError> {
        self.ensure_connected()?;
        let queue = self.get_or_create_queue(queue_name, QueueOptions::default());
        let id = format!("consumer-{}", Uuid::new_v4());
        queue
            .consumers
            .lock()
            .expect("consumers lock")
            .push(Consumer {
                id: id.clone(),
                handler,
                prefetch: prefetch.max(1),
                in_flight: Arc::new(AtomicUsize::new(0)),
            });
        queue.notify.notify_one();
        Ok(id)
    }

    async fn ack(&self, message: &Message) -> Result<(), BrokerError> {
        if let Some(delivery) = self.settle(&message.id) {
            delivery.consumer_in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(queue) = self.queue(&delivery.queue) {
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn nack(&self, message: &Message, requeue: bool) -> Result<(), BrokerError> {
        let Some(delivery) = self.settle(&message.id) else {
            return Ok(());
        };
        delivery.consumer_in_flight.fetch_sub(1, Ordering::SeqCst);

        let queue = self.queue(&delivery.queue);
        if requeue {
            if let Some(queue) = &queue {
                queue
                    .messages
                    .lock()
                    .expect("queue messages lock")
                    .push_front(delivery.message);
                queue.notify.notify_one();
            }
            return Ok(());
        }

        // Rejected without requeue: DLQ when configured, else discard.
        let dlq = queue
            .as_ref()
            .and_then(|q| q.options.dead_letter_queue.clone());
        if let Some(queue) = &queue {
            queue.notify.notify_one();
        }
        if let Some(dlq_name) = dlq {
            let mut dead = delivery.message;
            dead.queue = Some(dlq_name.clone());
            let dlq_queue = self.get_or_create_queue(&dlq_name, QueueOptions::default());
            dlq_queue
                .messages
                .lock()
                .expect("queue messages lock")
                .push_back(dead);
            dlq_queue.notify.notify_one();
        }
        Ok(())
    }

    async fn request(
        &self,
        queue_name: &str,
        mut message: Message,
        timeout_ms: u64,
    ) -> Result<Message, BrokerError> {
        self.ensure_connected()?;

        let correlation_id = Uuid::new_v4().to_string();
        message.correlation_id = Some(correlation_id.clone());
        message.reply_to = Some(format!("reply.{}", correlation_id));

        let (sender, receiver) = oneshot::channel();
        self.inner
            .pending_requests
            .lock()
            .expect("pending requests lock")
            .insert(correlation_id.clone(), sender);

        self.send(queue_name, message).await?;

        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), receiver).await
        {
            Ok(Ok(response)) => Ok(response),
            _ => {
                self.inner
                    .pending_requests
                    .lock()
                    .expect("pending requests lock")
                    .remove(&correlation_id);
                Err(BrokerError::Timeout(timeout_ms))
            }
        }
    }

    async fn reply(&self, incoming: &Message, mut response: Message) -> Result<(), BrokerError> {
        let Some(correlation_id) = incoming.correlation_id.as_deref() else {
            return Err(BrokerError::Other(
                "cannot reply to a message without a correlation id".into(),
            ));
        };
        response.correlation_id = Some(correlation_id.to_string());

        let sender = self
            .inner
            .pending_requests
            .lock()
            .expect("pending requests lock")
            .remove(correlation_id);
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
        Ok(())
    }

    async fn get_queue_info(&self, name: &str) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))?;
        let info = QueueInfo {
            name: queue.name.clone(),
            message_count: queue.messages.lock().expect("queue messages lock").len(),
            consumer_count: queue.consumers.lock().expect("consumers lock").len(),
            durable: queue.options.durable,
            auto_delete: queue.options.auto_delete,
        };
        Ok(info)
    }

    async fn list_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .queues
            .lock()
            .expect("queue map lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    async fn list_topics(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }

    async fn purge_queue(&self, name: &str) -> Result<usize, BrokerError> {
        let queue = self
            .queue(name)
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))?;
        let mut messages = queue.messages.lock().expect("queue messages lock");
        let purged = messages.len();
        messages.clear();
        Ok(purged)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let removed = self
            .inner
            .queues
            .lock()
            .expect("queue map lock")
            .remove(name);
        if let Some(queue) = removed {
            queue.notify.notify_waiters();
            if let Some(handle) = queue.dispatcher.lock().expect("dispatcher lock").take() {
                handle.abort();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handler(counter: Arc<AtomicU32>) -> MessageHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    async fn connected_broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.connect(serde_json::json!({})).await.unwrap();
        broker
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..200 {
            if predicate() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_topic_fan_out_matches_pattern() {
        let broker = connected_broker().await;
        let hits = Arc::new(AtomicU32::new(0));
        broker
            .subscribe("payments.*", counting_handler(hits.clone()))
            .await
            .unwrap();

        broker
            .publish("payments.completed", Message::to_topic("payments.completed", "{}"))
            .await
            .unwrap();
        broker
            .publish("orders.created", Message::to_topic("orders.created", "{}"))
            .await
            .unwrap();

        wait_for(|| hits.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_delivers_to_single_consumer() {
        let broker = connected_broker().await;
        let a = Arc::new(AtomicU32::new(0));
        let b = Arc::new(AtomicU32::new(0));

        // Auto-acking consumers.
        for counter in [a.clone(), b.clone()] {
            let broker_for_ack = broker.clone();
            let handler: MessageHandler = Arc::new(move |msg| {
                let counter = counter.clone();
                let broker = broker_for_ack.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    broker.ack(&msg).await.unwrap();
                })
            });
            broker.consume("work", handler, 1).await.unwrap();
        }

        for i in 0..10 {
            broker
                .send("work", Message::to_queue("work", format!("{}", i)))
                .await
                .unwrap();
        }

        wait_for(|| a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst) == 10).await;
        // Round-robin split, no duplicates.
        assert_eq!(a.load(Ordering::SeqCst) + b.load(Ordering::SeqCst), 10);
        assert!(a.load(Ordering::SeqCst) > 0);
        assert!(b.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_ack_is_at_most_once() {
        let broker = connected_broker().await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handler: MessageHandler = Arc::new(move |msg| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(msg);
            })
        });
        broker.consume("q", handler, 1).await.unwrap();
        broker.send("q", Message::to_queue("q", "one")).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        broker.ack(&delivered).await.unwrap();
        // Second settle attempts are no-ops; a nack-with-requeue after an
        // ack must not resurrect the message.
        broker.nack(&delivered, true).await.unwrap();
        broker.ack(&delivered).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let info = broker.get_queue_info("q").await.unwrap();
        assert_eq!(info.message_count, 0);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_routes_to_dlq() {
        let broker = connected_broker().await;
        broker
            .declare_queue(
                "orders",
                QueueOptions {
                    durable: true,
                    dead_letter_queue: Some("orders.dlq".into()),
                    ..QueueOptions::default()
                },
            )
            .await
            .unwrap();

        let broker_for_handler = broker.clone();
        let handler: MessageHandler = Arc::new(move |msg| {
            let broker = broker_for_handler.clone();
            Box::pin(async move {
                broker.nack(&msg, false).await.unwrap();
            })
        });
        broker.consume("orders", handler, 1).await.unwrap();
        broker
            .send("orders", Message::to_queue("orders", "bad"))
            .await
            .unwrap();

        let mut routed = false;
        for _ in 0..200 {
            if broker
                .get_queue_info("orders.dlq")
                .await
                .map(|info| info.message_count == 1)
                .unwrap_or(false)
            {
                routed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(routed, "message never reached the DLQ");
    }

    #[tokio::test]
    async fn test_request_reply_round_trip() {
        let broker = connected_broker().await;

        let broker_for_responder = broker.clone();
        let responder: MessageHandler = Arc::new(move |msg| {
            let broker = broker_for_responder.clone();
            Box::pin(async move {
                let response = Message::to_queue("", format!("echo:{}", msg.body));
                broker.reply(&msg, response).await.unwrap();
                broker.ack(&msg).await.unwrap();
            })
        });
        broker.consume("echo", responder, 1).await.unwrap();

        let response = broker
            .request("echo", Message::to_queue("echo", "ping"), 2_000)
            .await
            .unwrap();
        assert_eq!(response.body, "echo:ping");
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let broker = connected_broker().await;
        let err = broker
            .request("nobody-home", Message::to_queue("nobody-home", "x"), 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "TimeoutError");
    }

    #[tokio::test]
    async fn test_fifo_order_for_single_consumer() {
        let broker = connected_broker().await;
        let received = Arc::new(Mutex::new(Vec::new()));

        let broker_for_handler = broker.clone();
        let received_for_handler = received.clone();
        let handler: MessageHandler = Arc::new(move |msg| {
            let broker = broker_for_handler.clone();
            let received = received_for_handler.clone();
            Box::pin(async move {
                received.lock().unwrap().push(msg.body.clone());
                broker.ack(&msg).await.unwrap();
            })
        });
        broker.consume("fifo", handler, 1).await.unwrap();

        for i in 0..5 {
            broker
                .send("fifo", Message::to_queue("fifo", format!("m{}", i)))
                .await
                .unwrap();
        }

        wait_for(|| received.lock().unwrap().len() == 5).await;
        assert_eq!(
            *received.lock().unwrap(),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
    }

    #[tokio::test]
    async fn test_disconnect_requires_reconnect() {
        let broker = connected_broker().await;
        broker.disconnect().await.unwrap();
        assert!(!broker.is_connected());
        assert!(matches!(
            broker.send("q", Message::to_queue("q", "x")).await,
            Err(BrokerError::NotConnected)
        ));
    }
}
