//! # WebSocket Service - connection registry and messaging
//!
//! Server-side registry of client connections addressed by logical name
//! (several connections may share a name; broadcasts fan out to the group).
//! Each connection runs the `connecting → open → closing → closed` state
//! machine, keeps a bounded message history, and queues outbound messages
//! for the transport adapter to drain.
//!
//! Events (`connect`, `message`, `error`, `close`) dispatch to registered
//! handlers; JSON-typed payloads are parsed before dispatch, and a failing
//! handler is logged without interrupting the rest.

use crate::ast::WsEvent;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Bounded per-connection history length.
const HISTORY_LIMIT: usize = 100;

/// Connection lifecycle, mirroring the client-side `readyState` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

/// One registered connection.
#[derive(Debug, Clone)]
pub struct WsConnection {
    pub id: String,
    pub name: String,
    pub url: String,
    pub state: WsState,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub last_error: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl WsConnection {
    /// Record form for template access.
    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "url": self.url,
            "connected": self.state == WsState::Open,
            "readyState": self.state as u8,
            "connectedAt": self.connected_at.map(|t| t.to_rfc3339()),
            "lastMessageAt": self.last_message_at.map(|t| t.to_rfc3339()),
            "messageCount": self.message_count,
            "error": self.last_error,
        })
    }
}

/// Direction of a recorded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsDirection {
    Incoming,
    Outgoing,
}

/// One message in a connection's history or outbound queue.
#[derive(Debug, Clone)]
pub struct WsMessage {
    pub connection_id: String,
    pub data: Value,
    pub direction: WsDirection,
    pub timestamp: DateTime<Utc>,
}

/// Event handler callback.
pub type WsHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct ConnectionQueues {
    history: VecDeque<WsMessage>,
    outbound: VecDeque<WsMessage>,
}

struct Registry {
    connections: HashMap<String, WsConnection>,
    queues: HashMap<String, ConnectionQueues>,
    /// Handlers keyed by logical connection name, then event.
    handlers: HashMap<String, HashMap<WsEvent, Vec<WsHandler>>>,
}

/// The connection registry. All mutation happens under one internal lock;
/// handlers run outside it.
pub struct WebSocketService {
    registry: Mutex<Registry>,
    counter: AtomicU64,
}

impl Default for WebSocketService {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketService {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                connections: HashMap::new(),
                queues: HashMap::new(),
                handlers: HashMap::new(),
            }),
            counter: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("ws_{}_{}", n, Utc::now().timestamp_millis())
    }

    /// Register a new connection in `connecting` state.
    pub fn register_connection(
        &self,
        name: &str,
        url: &str,
        metadata: HashMap<String, Value>,
    ) -> WsConnection {
        let connection = WsConnection {
            id: self.next_id(),
            name: name.to_string(),
            url: url.to_string(),
            state: WsState::Connecting,
            connected_at: None,
            last_message_at: None,
            message_count: 0,
            last_error: None,
            metadata,
        };
        let mut registry = self.registry.lock().expect("ws registry lock");
        registry
            .queues
            .insert(connection.id.clone(), ConnectionQueues::default());
        registry
            .connections
            .insert(connection.id.clone(), connection.clone());
        tracing::info!(name = %name, url = %url, id = %connection.id, "registered websocket connection");
        connection
    }

    /// Look up by id first, then by logical name (first match).
    pub fn get_connection(&self, name_or_id: &str) -> Option<WsConnection> {
        let registry = self.registry.lock().expect("ws registry lock");
        if let Some(connection) = registry.connections.get(name_or_id) {
            return Some(connection.clone());
        }
        registry
            .connections
            .values()
            .find(|c| c.name == name_or_id)
            .cloned()
    }

    /// Every connection sharing a logical name.
    pub fn get_connections_by_name(&self, name: &str) -> Vec<WsConnection> {
        let registry = self.registry.lock().expect("ws registry lock");
        registry
            .connections
            .values()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    /// Drive the state machine. Opening dispatches `connect`; closing and
    /// closed dispatch `close`.
    pub fn set_connection_state(
        &self,
        connection_id: &str,
        state: WsState,
        error: Option<String>,
    ) {
        let event = {
            let mut registry = self.registry.lock().expect("ws registry lock");
            let Some(connection) = registry.connections.get_mut(connection_id) else {
                return;
            };
            let previous = connection.state;
            connection.state = state;
            connection.last_error = error.clone();

            match state {
                WsState::Open if previous != WsState::Open => {
                    connection.connected_at = Some(Utc::now());
                    Some((connection.name.clone(), WsEvent::Connect, json!({})))
                }
                WsState::Closing | WsState::Closed => Some((
                    connection.name.clone(),
                    WsEvent::Close,
                    json!({ "error": error }),
                )),
                _ => None,
            }
        };
        if let Some((name, event, payload)) = event {
            self.dispatch(&name, event, payload);
        }
    }

    /// Drop a connection and everything queued for it.
    pub fn remove_connection(&self, connection_id: &str) {
        let mut registry = self.registry.lock().expect("ws registry lock");
        registry.connections.remove(connection_id);
        registry.queues.remove(connection_id);
        tracing::info!(id = %connection_id, "removed websocket connection");
    }

    /// Register an event handler for a logical connection name.
    pub fn register_handler(&self, connection_name: &str, event: WsEvent, handler: WsHandler) {
        let mut registry = self.registry.lock().expect("ws registry lock");
        registry
            .handlers
            .entry(connection_name.to_string())
            .or_default()
            .entry(event)
            .or_default()
            .push(handler);
    }

    /// Process an incoming frame: record history, update counters, dispatch
    /// `message` handlers. JSON text is parsed before dispatch.
    pub fn receive_message(&self, connection_id: &str, data: Value) {
        let parsed = match data {
            Value::String(text) => serde_json::from_str::<Value>(&text)
                .unwrap_or(Value::String(text)),
            other => other,
        };

        let name = {
            let mut registry = self.registry.lock().expect("ws registry lock");
            let Some(connection) = registry.connections.get_mut(connection_id) else {
                return;
            };
            connection.message_count += 1;
            connection.last_message_at = Some(Utc::now());
            let name = connection.name.clone();

            if let Some(queues) = registry.queues.get_mut(connection_id) {
                push_bounded(
                    &mut queues.history,
                    WsMessage {
                        connection_id: connection_id.to_string(),
                        data: parsed.clone(),
                        direction: WsDirection::Incoming,
                        timestamp: Utc::now(),
                    },
                );
            }
            name
        };

        self.dispatch(&name, WsEvent::Message, parsed);
    }

    /// Record an error and dispatch `error` handlers.
    pub fn report_error(&self, connection_id: &str, error: impl Into<String>) {
        let error = error.into();
        let name = {
            let mut registry = self.registry.lock().expect("ws registry lock");
            let Some(connection) = registry.connections.get_mut(connection_id) else {
                return;
            };
            connection.last_error = Some(error.clone());
            connection.name.clone()
        };
        self.dispatch(&name, WsEvent::Error, json!({ "error": error }));
    }

    /// Queue an outbound message for one connection (by name or id).
    /// Returns the number of connections queued to.
    pub fn send_message(&self, name_or_id: &str, data: Value) -> usize {
        let mut registry = self.registry.lock().expect("ws registry lock");
        let ids: Vec<String> = if registry.connections.contains_key(name_or_id) {
            vec![name_or_id.to_string()]
        } else {
            registry
                .connections
                .values()
                .filter(|c| c.name == name_or_id && c.state == WsState::Open)
                .map(|c| c.id.clone())
                .collect()
        };

        for id in &ids {
            if let Some(queues) = registry.queues.get_mut(id) {
                let message = WsMessage {
                    connection_id: id.clone(),
                    data: data.clone(),
                    direction: WsDirection::Outgoing,
                    timestamp: Utc::now(),
                };
                queues.outbound.push_back(message.clone());
                push_bounded(&mut queues.history, message);
            }
        }
        ids.len()
    }

    /// Queue an outbound message to every open connection sharing `name`.
    pub fn broadcast(&self, name: &str, data: Value) -> usize {
        self.send_message(name, data)
    }

    /// Drain the outbound queue for a connection (transport adapter side).
    pub fn get_pending_messages(&self, connection_id: &str) -> Vec<WsMessage> {
        let mut registry = self.registry.lock().expect("ws registry lock");
        registry
            .queues
            .get_mut(connection_id)
            .map(|queues| queues.outbound.drain(..).collect())
            .unwrap_or_default()
    }

    /// Bounded history snapshot for a connection.
    pub fn get_history(&self, connection_id: &str) -> Vec<WsMessage> {
        let registry = self.registry.lock().expect("ws registry lock");
        registry
            .queues
            .get(connection_id)
            .map(|queues| queues.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every connection with the logical name.
    pub fn close_connection(&self, name: &str, code: Option<u16>, reason: Option<String>) {
        let ids: Vec<String> = self
            .get_connections_by_name(name)
            .into_iter()
            .map(|c| c.id)
            .collect();
        for id in ids {
            self.set_connection_state(
                &id,
                WsState::Closing,
                reason
                    .clone()
                    .map(|r| format!("close {}: {}", code.unwrap_or(1000), r)),
            );
            self.set_connection_state(&id, WsState::Closed, None);
        }
    }

    /// All live connections.
    pub fn list_connections(&self) -> Vec<WsConnection> {
        let registry = self.registry.lock().expect("ws registry lock");
        let mut all: Vec<WsConnection> = registry.connections.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn dispatch(&self, name: &str, event: WsEvent, payload: Value) {
        // Snapshot the handlers so user callbacks never run under the lock.
        let handlers: Vec<WsHandler> = {
            let registry = self.registry.lock().expect("ws registry lock");
            registry
                .handlers
                .get(name)
                .and_then(|events| events.get(&event))
                .map(|list| list.to_vec())
                .unwrap_or_default()
        };

        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(payload.clone())
            }));
            if result.is_err() {
                tracing::error!(connection = %name, event = ?event, "websocket handler panicked");
            }
        }
    }
}

fn push_bounded(history: &mut VecDeque<WsMessage>, message: WsMessage) {
    history.push_back(message);
    while history.len() > HISTORY_LIMIT {
        history.pop_front();
    }
}
