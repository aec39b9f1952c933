//! State persistence hooks.
//!
//! `q:set` may carry `persist ∈ {local, session, sync}`; `q:persist` groups
//! several variables under a shared scope and prefix. The core computes the
//! effective key (`persist_key` > `prefix + name` > `name`), honors TTL on
//! restore, and forwards the encrypt flag to the storage adapter - the
//! adapter owns the actual storage and any server round-trips the `sync`
//! scope may imply.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Where a persisted value lives, from the document's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistScope {
    Local,
    Session,
    Sync,
}

impl PersistScope {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "local" => Some(PersistScope::Local),
            "session" => Some(PersistScope::Session),
            "sync" => Some(PersistScope::Sync),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PersistScope::Local => "local",
            PersistScope::Session => "session",
            PersistScope::Sync => "sync",
        }
    }
}

/// Options forwarded to the storage adapter on save.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub ttl_seconds: Option<u64>,
    pub encrypt: bool,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Adapter(String),
}

/// External storage adapter contract.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn save(
        &self,
        scope: PersistScope,
        key: &str,
        value: Value,
        options: SaveOptions,
    ) -> Result<(), StorageError>;

    async fn load(&self, scope: PersistScope, key: &str) -> Result<Option<Value>, StorageError>;

    async fn remove(&self, scope: PersistScope, key: &str) -> Result<(), StorageError>;
}

/// One registered persisted variable.
#[derive(Debug, Clone)]
pub struct PersistedVar {
    pub name: String,
    pub scope: PersistScope,
    pub key: String,
    pub ttl_seconds: Option<u64>,
    pub encrypt: bool,
}

/// Compute the effective storage key: explicit key wins, then prefix+name,
/// then the bare variable name.
pub fn effective_key(name: &str, explicit: Option<&str>, prefix: Option<&str>) -> String {
    if let Some(key) = explicit {
        return key.to_string();
    }
    if let Some(prefix) = prefix {
        return format!("{}{}", prefix, name);
    }
    name.to_string()
}

/// Persistence service: registration, save-on-set, restore-at-creation.
pub struct StatePersistence {
    adapter: Arc<dyn StorageAdapter>,
    registered: DashMap<String, PersistedVar>,
}

impl StatePersistence {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            adapter,
            registered: DashMap::new(),
        }
    }

    /// Register a variable for save/restore. Later registrations of the same
    /// variable replace the earlier descriptor.
    pub fn register(&self, var: PersistedVar) {
        self.registered.insert(var.name.clone(), var);
    }

    /// Descriptor lookup (used by the interpreter on `q:set`).
    pub fn lookup(&self, name: &str) -> Option<PersistedVar> {
        self.registered.get(name).map(|v| v.value().clone())
    }

    /// Save a variable through the adapter.
    pub async fn save(&self, var: &PersistedVar, value: Value) -> Result<(), StorageError> {
        let envelope = wrap_with_ttl(value, var.ttl_seconds);
        self.adapter
            .save(
                var.scope,
                &var.key,
                envelope,
                SaveOptions {
                    ttl_seconds: var.ttl_seconds,
                    encrypt: var.encrypt,
                },
            )
            .await
    }

    /// Restore every registered variable. Expired entries are ignored.
    /// Returns the variables to seed into a fresh context.
    pub async fn restore_all(&self) -> HashMap<String, Value> {
        let mut restored = HashMap::new();
        let vars: Vec<PersistedVar> = self.registered.iter().map(|v| v.value().clone()).collect();
        for var in vars {
            match self.adapter.load(var.scope, &var.key).await {
                Ok(Some(envelope)) => {
                    if let Some(value) = unwrap_if_fresh(envelope) {
                        restored.insert(var.name.clone(), value);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(var = %var.name, error = %e, "persisted restore failed");
                }
            }
        }
        restored
    }

    /// Remove a persisted variable from both the registry and the adapter.
    pub async fn remove(&self, name: &str) -> Result<(), StorageError> {
        if let Some((_, var)) = self.registered.remove(name) {
            self.adapter.remove(var.scope, &var.key).await?;
        }
        Ok(())
    }
}

/// Saved values are wrapped with an absolute expiry timestamp so restore can
/// honor TTL without trusting adapter clocks.
fn wrap_with_ttl(value: Value, ttl_seconds: Option<u64>) -> Value {
    match ttl_seconds {
        Some(ttl) => {
            let expires: DateTime<Utc> = Utc::now() + Duration::seconds(ttl as i64);
            serde_json::json!({
                "value": value,
                "expires_at": expires.to_rfc3339(),
            })
        }
        None => serde_json::json!({ "value": value }),
    }
}

fn unwrap_if_fresh(envelope: Value) -> Option<Value> {
    let object = envelope.as_object()?;
    if let Some(expires) = object.get("expires_at").and_then(|v| v.as_str()) {
        let expires: DateTime<Utc> = expires.parse().ok()?;
        if expires < Utc::now() {
            return None;
        }
    }
    object.get("value").cloned()
}

/// In-memory storage adapter. The three scopes are separate keyspaces; the
/// encrypt flag is accepted and ignored (nothing leaves the process).
#[derive(Default)]
pub struct MemoryStorageAdapter {
    values: DashMap<(PersistScope, String), Value>,
}

impl MemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorageAdapter {
    async fn save(
        &self,
        scope: PersistScope,
        key: &str,
        value: Value,
        _options: SaveOptions,
    ) -> Result<(), StorageError> {
        self.values.insert((scope, key.to_string()), value);
        Ok(())
    }

    async fn load(&self, scope: PersistScope, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .values
            .get(&(scope, key.to_string()))
            .map(|v| v.clone()))
    }

    async fn remove(&self, scope: PersistScope, key: &str) -> Result<(), StorageError> {
        self.values.remove(&(scope, key.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> StatePersistence {
        StatePersistence::new(Arc::new(MemoryStorageAdapter::new()))
    }

    #[test]
    fn test_effective_key_precedence() {
        assert_eq!(effective_key("x", Some("custom"), Some("p.")), "custom");
        assert_eq!(effective_key("x", None, Some("p.")), "p.x");
        assert_eq!(effective_key("x", None, None), "x");
    }

    #[tokio::test]
    async fn test_save_and_restore_round_trip() {
        let persistence = service();
        let var = PersistedVar {
            name: "cart".into(),
            scope: PersistScope::Local,
            key: "cart".into(),
            ttl_seconds: None,
            encrypt: false,
        };
        persistence.register(var.clone());
        persistence.save(&var, json!([1, 2])).await.unwrap();

        let restored = persistence.restore_all().await;
        assert_eq!(restored["cart"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_expired_values_are_ignored_on_restore() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let persistence = StatePersistence::new(adapter.clone());
        let var = PersistedVar {
            name: "session".into(),
            scope: PersistScope::Session,
            key: "session".into(),
            ttl_seconds: Some(60),
            encrypt: false,
        };
        persistence.register(var.clone());

        // Simulate an entry written in the past.
        let expired = serde_json::json!({
            "value": "stale",
            "expires_at": (Utc::now() - Duration::seconds(5)).to_rfc3339(),
        });
        adapter
            .save(
                PersistScope::Session,
                "session",
                expired,
                SaveOptions::default(),
            )
            .await
            .unwrap();

        let restored = persistence.restore_all().await;
        assert!(!restored.contains_key("session"));
    }

    #[tokio::test]
    async fn test_scopes_are_separate_keyspaces() {
        let adapter = MemoryStorageAdapter::new();
        adapter
            .save(PersistScope::Local, "k", json!(1), SaveOptions::default())
            .await
            .unwrap();
        assert_eq!(
            adapter.load(PersistScope::Session, "k").await.unwrap(),
            None
        );
    }
}
