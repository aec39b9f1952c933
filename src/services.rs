//! Collaborator contracts the core consumes: database, email, file upload,
//! and the HTTP action signal.
//!
//! The core never implements concrete drivers; it talks to these traits.
//! No-op defaults keep a runtime constructible without wiring every
//! collaborator, and tests swap in scripted implementations.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Result record stored under a `q:query` node's name.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub data: Vec<Value>,
    pub record_count: usize,
    pub error: Option<String>,
}

impl QueryResult {
    pub fn ok(data: Vec<Value>) -> Self {
        let record_count = data.len();
        Self {
            success: true,
            data,
            record_count,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Vec::new(),
            record_count: 0,
            error: Some(error.into()),
        }
    }

    /// The context-value form templates reach into (`{users.data}`).
    pub fn to_value(&self) -> Value {
        json!({
            "success": self.success,
            "data": self.data,
            "recordCount": self.record_count,
            "error": self.error,
        })
    }
}

/// Database collaborator.
#[async_trait]
pub trait DatabaseService: Send + Sync {
    async fn execute_query(
        &self,
        sql: &str,
        datasource_id: &str,
        params: &HashMap<String, Value>,
        max_rows: Option<u64>,
        timeout_ms: Option<u64>,
    ) -> QueryResult;
}

/// Outcome record for mail / file operations.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub success: bool,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ServiceOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            path: None,
        }
    }

    pub fn ok_with_path(path: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            path: Some(path.into()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            path: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outbound email request.
#[derive(Debug, Clone)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub from: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub reply_to: Option<String>,
    pub html: bool,
}

/// Email collaborator.
#[async_trait]
pub trait EmailService: Send + Sync {
    async fn send_email(&self, request: EmailRequest) -> ServiceOutcome;
}

/// Upload request passed to the file collaborator. The core does not carry
/// the bytes; the collaborator owns the request payload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub field: String,
    pub destination: String,
    pub allowed_extensions: Option<Vec<String>>,
    pub max_file_size: Option<u64>,
    pub name_conflict: crate::ast::NameConflict,
}

/// File-upload collaborator.
#[async_trait]
pub trait FileService: Send + Sync {
    async fn handle_upload(&self, request: UploadRequest) -> ServiceOutcome;
}

/// HTTP action signal: does the current request match an action, and what
/// form parameters does it carry.
pub trait ActionSignal: Send + Sync {
    fn matches(&self, action_name: &str, method: &str) -> bool;
    fn form_params(&self) -> HashMap<String, Value>;
}

// ============================================================================
// NO-OP DEFAULTS
// ============================================================================

/// Database stand-in that fails every query with a wiring hint.
pub struct NoopDatabase;

#[async_trait]
impl DatabaseService for NoopDatabase {
    async fn execute_query(
        &self,
        _sql: &str,
        datasource_id: &str,
        _params: &HashMap<String, Value>,
        _max_rows: Option<u64>,
        _timeout_ms: Option<u64>,
    ) -> QueryResult {
        QueryResult::failed(format!(
            "no database service configured for datasource '{}'",
            datasource_id
        ))
    }
}

/// Email stand-in that reports success without sending.
pub struct NoopEmail;

#[async_trait]
impl EmailService for NoopEmail {
    async fn send_email(&self, request: EmailRequest) -> ServiceOutcome {
        tracing::debug!(to = %request.to, subject = %request.subject, "email dropped (no service configured)");
        ServiceOutcome::failed("no email service configured")
    }
}

/// File-upload stand-in.
pub struct NoopFiles;

#[async_trait]
impl FileService for NoopFiles {
    async fn handle_upload(&self, _request: UploadRequest) -> ServiceOutcome {
        ServiceOutcome::failed("no file service configured")
    }
}

/// Action signal that never matches (no HTTP request in flight).
pub struct NoActionSignal;

impl ActionSignal for NoActionSignal {
    fn matches(&self, _action_name: &str, _method: &str) -> bool {
        false
    }

    fn form_params(&self) -> HashMap<String, Value> {
        HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_result_value_shape() {
        let result = QueryResult::ok(vec![json!({"id": 1})]);
        let value = result.to_value();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["recordCount"], json!(1));
        assert_eq!(value["data"][0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_noop_database_reports_missing_wiring() {
        let db = NoopDatabase;
        let result = db
            .execute_query("SELECT 1", "main", &HashMap::new(), None, None)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("main"));
    }
}
