//! Effectful nodes: queries, actions, mail, file uploads, dumps, logging.

use super::Node;
use serde::Serialize;

/// `<q:query name="users" datasource="db">SELECT ...</q:query>`
///
/// Unified-query lowering happens at parse time; a QueryNode that survives
/// parsing targets a database-typed (or unknown) datasource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryNode {
    pub name: String,
    pub datasource: Option<String>,
    pub sql: String,
    pub max_rows: Option<u64>,
    pub timeout_ms: Option<u64>,
}

impl QueryNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:query requires a 'name' attribute".into());
        }
        if self.sql.trim().is_empty() {
            errors.push("q:query requires a body".into());
        }
        errors
    }
}

/// `<q:action name="save" method="POST">...</q:action>` - fires only when the
/// external HTTP collaborator signals a matching action name + method.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionNode {
    pub name: String,
    pub method: String,
    pub redirect: Option<String>,
    pub body: Vec<Node>,
}

impl ActionNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:action requires a 'name' attribute".into());
        }
        if !matches!(self.method.as_str(), "GET" | "POST" | "PUT" | "DELETE") {
            errors.push(format!("q:action method '{}' is not supported", self.method));
        }
        errors
    }
}

/// Body encoding for outbound mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailType {
    Html,
    Text,
}

/// `<q:mail to="..." subject="...">body statements</q:mail>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailNode {
    pub to: String,
    pub subject: String,
    pub from: Option<String>,
    pub cc: Option<String>,
    pub bcc: Option<String>,
    pub reply_to: Option<String>,
    pub mail_type: MailType,
    pub result_var: Option<String>,
    pub body: Vec<Node>,
}

impl MailNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.to.is_empty() {
            errors.push("q:mail requires a 'to' attribute".into());
        }
        if self.subject.is_empty() {
            errors.push("q:mail requires a 'subject' attribute".into());
        }
        errors
    }
}

/// Conflict policy for uploaded file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NameConflict {
    MakeUnique,
    Overwrite,
    Error,
}

impl NameConflict {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "makeunique" => Some(NameConflict::MakeUnique),
            "overwrite" => Some(NameConflict::Overwrite),
            "error" => Some(NameConflict::Error),
            _ => None,
        }
    }
}

/// `<q:file field="upload" destination="uploads" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileNode {
    pub field: Option<String>,
    pub destination: Option<String>,
    pub accept: Option<String>,
    pub max_size: Option<String>,
    pub name_conflict: NameConflict,
    pub result_var: Option<String>,
}

impl FileNode {
    pub fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Output format for `q:dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    Html,
    Json,
    Text,
}

/// `<q:dump var="{result}" label="debug" format="html" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DumpNode {
    pub expression: String,
    pub label: Option<String>,
    pub format: DumpFormat,
    pub max_depth: u32,
}

impl DumpNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.expression.trim().is_empty() {
            errors.push("q:dump requires a 'var' attribute".into());
        }
        if self.max_depth == 0 {
            errors.push("q:dump depth must be at least 1".into());
        }
        errors
    }
}

/// Log severity for `q:log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// `<q:log message="saved {count} rows" level="info" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogNode {
    pub message: String,
    pub level: LogLevel,
}

impl LogNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.message.is_empty() {
            errors.push("q:log requires a 'message' attribute".into());
        }
        errors
    }
}
