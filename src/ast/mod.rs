//! # AST Module - Abstract Syntax Tree for Quill documents
//!
//! Typed nodes for every tag the parser recognizes:
//!
//! - `application`: Application, Component, Datasource (document roots)
//! - `control`: set, if, loop, function, call, return, html, text
//! - `effects`: query, action, mail, file, dump, log
//! - `infra`: message, subscribe, queue, schedule, thread, job, websocket,
//!   agent, llm, knowledge, search, persist
//! - `widgets`: `ui:` / `qt:` / `qg:` widget variants and raw code
//!
//! These types represent the "what" - static structure parsed from XML.
//! The interpreter in `render` dispatches on the [`Node`] variant tag;
//! nothing mutates an AST after parse completion.
//!
//! Every node provides `validate() → Vec<String>` (declared invariants,
//! collected without raising) and serializes through serde into the
//! canonical record form used by tests and tooling ([`Node::to_value`]).

mod application;
mod control;
mod effects;
mod infra;
mod widgets;

pub use application::{
    AppType, ApplicationNode, ComponentNode, DatasourceNode, DatasourceType,
};
pub use control::{
    ElseIfBranch, FunctionCallNode, FunctionNode, HtmlNode, IfNode, LoopKind, LoopNode,
    ParamNode, ParamType, ReturnNode, SetNode, SetOperation, TextNode, VarScope,
};
pub use effects::{
    ActionNode, DumpFormat, DumpNode, FileNode, LogLevel, LogNode, MailNode, MailType,
    NameConflict, QueryNode,
};
pub use infra::{
    AckMode, AgentExecuteNode, AgentInstructionNode, AgentNode, AgentToolNode,
    AgentToolParamNode, JobNode, KnowledgeNode, KnowledgeSourceNode, LlmGenerateNode, LlmNode,
    MessageAckNode, MessageHeaderNode, MessageKind, MessageNackNode, MessageNode, PersistNode,
    QueueAction, QueueNode, ScheduleNode, SearchNode, SourceKind, SubscribeNode,
    ThreadNode, ThreadPriority, WebSocketCloseNode, WebSocketHandlerNode, WebSocketNode,
    WebSocketSendNode, WsEvent,
};
pub use widgets::{
    GameWidgetNode, LayoutAttrs, RawCodeNode, TerminalWidgetNode, UiWidgetNode, GAME_TAGS,
    TERMINAL_TAGS, UI_TAGS,
};

use serde::Serialize;
use serde_json::Value;

/// A parsed document: either an application or a bare component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "document", rename_all = "snake_case")]
pub enum Document {
    Application(ApplicationNode),
    Component(ComponentNode),
}

impl Document {
    /// Collect validation issues for the whole document.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        match self {
            Document::Application(app) => {
                for message in app.validate() {
                    issues.push(ValidationIssue::new("q:application", message));
                }
                for statements in [
                    &app.statements,
                    &app.scenes,
                    &app.screens,
                    &app.prefabs,
                    &app.behaviors,
                    &app.windows,
                ] {
                    collect_issues(statements, &mut issues);
                }
                for component in &app.components {
                    collect_issues(&component.statements, &mut issues);
                }
            }
            Document::Component(component) => {
                for message in component.validate() {
                    issues.push(ValidationIssue::new("q:component", message));
                }
                collect_issues(&component.statements, &mut issues);
            }
        }
        issues
    }

    /// Canonical record form (deterministic for equal input).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One validation failure, tagged with the offending node's tag name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub node: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>: {}", self.node, self.message)
    }
}

/// A statement-level AST node. The interpreter dispatches on this tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Html(HtmlNode),
    Text(TextNode),
    Set(SetNode),
    If(IfNode),
    Loop(LoopNode),
    Function(FunctionNode),
    Call(FunctionCallNode),
    Return(ReturnNode),
    Query(QueryNode),
    Action(ActionNode),
    Mail(MailNode),
    File(FileNode),
    Dump(DumpNode),
    Log(LogNode),
    Message(MessageNode),
    Subscribe(SubscribeNode),
    Queue(QueueNode),
    MessageAck(MessageAckNode),
    MessageNack(MessageNackNode),
    Schedule(ScheduleNode),
    Thread(ThreadNode),
    Job(JobNode),
    WebSocket(WebSocketNode),
    WebSocketSend(WebSocketSendNode),
    WebSocketClose(WebSocketCloseNode),
    Agent(AgentNode),
    AgentExecute(AgentExecuteNode),
    Llm(LlmNode),
    LlmGenerate(LlmGenerateNode),
    Knowledge(KnowledgeNode),
    Search(SearchNode),
    Persist(PersistNode),
    UiWidget(UiWidgetNode),
    TerminalWidget(TerminalWidgetNode),
    GameWidget(GameWidgetNode),
    RawCode(RawCodeNode),
}

impl Node {
    /// The tag name used in error messages and validation issues.
    pub fn tag_name(&self) -> String {
        match self {
            Node::Html(n) => n.tag.clone(),
            Node::Text(_) => "#text".into(),
            Node::Set(_) => "q:set".into(),
            Node::If(_) => "q:if".into(),
            Node::Loop(_) => "q:loop".into(),
            Node::Function(_) => "q:function".into(),
            Node::Call(_) => "q:call".into(),
            Node::Return(_) => "q:return".into(),
            Node::Query(_) => "q:query".into(),
            Node::Action(_) => "q:action".into(),
            Node::Mail(_) => "q:mail".into(),
            Node::File(_) => "q:file".into(),
            Node::Dump(_) => "q:dump".into(),
            Node::Log(_) => "q:log".into(),
            Node::Message(_) => "q:message".into(),
            Node::Subscribe(_) => "q:subscribe".into(),
            Node::Queue(_) => "q:queue".into(),
            Node::MessageAck(_) => "q:ack".into(),
            Node::MessageNack(_) => "q:nack".into(),
            Node::Schedule(_) => "q:schedule".into(),
            Node::Thread(_) => "q:thread".into(),
            Node::Job(_) => "q:job".into(),
            Node::WebSocket(_) => "q:websocket".into(),
            Node::WebSocketSend(_) => "q:ws-send".into(),
            Node::WebSocketClose(_) => "q:ws-close".into(),
            Node::Agent(_) => "q:agent".into(),
            Node::AgentExecute(_) => "q:agent-execute".into(),
            Node::Llm(_) => "q:llm".into(),
            Node::LlmGenerate(_) => "q:llm-generate".into(),
            Node::Knowledge(_) => "q:knowledge".into(),
            Node::Search(_) => "q:search".into(),
            Node::Persist(_) => "q:persist".into(),
            Node::UiWidget(n) => format!("ui:{}", n.widget),
            Node::TerminalWidget(n) => format!("qt:{}", n.widget),
            Node::GameWidget(n) => format!("qg:{}", n.widget),
            Node::RawCode(_) => "#raw".into(),
        }
    }

    /// Per-node declared-invariant check. Children are not recursed here;
    /// use [`Document::validate`] for the whole tree.
    pub fn validate(&self) -> Vec<String> {
        match self {
            Node::Html(n) => n.validate(),
            Node::Text(n) => n.validate(),
            Node::Set(n) => n.validate(),
            Node::If(n) => n.validate(),
            Node::Loop(n) => n.validate(),
            Node::Function(n) => n.validate(),
            Node::Call(n) => n.validate(),
            Node::Return(n) => n.validate(),
            Node::Query(n) => n.validate(),
            Node::Action(n) => n.validate(),
            Node::Mail(n) => n.validate(),
            Node::File(n) => n.validate(),
            Node::Dump(n) => n.validate(),
            Node::Log(n) => n.validate(),
            Node::Message(n) => n.validate(),
            Node::Subscribe(n) => n.validate(),
            Node::Queue(n) => n.validate(),
            Node::MessageAck(_) | Node::MessageNack(_) => Vec::new(),
            Node::Schedule(n) => n.validate(),
            Node::Thread(n) => n.validate(),
            Node::Job(n) => n.validate(),
            Node::WebSocket(n) => n.validate(),
            Node::WebSocketSend(n) => n.validate(),
            Node::WebSocketClose(n) => n.validate(),
            Node::Agent(n) => n.validate(),
            Node::AgentExecute(n) => n.validate(),
            Node::Llm(n) => n.validate(),
            Node::LlmGenerate(n) => n.validate(),
            Node::Knowledge(n) => n.validate(),
            Node::Search(n) => n.validate(),
            Node::Persist(n) => n.validate(),
            Node::UiWidget(n) => n.validate(),
            Node::TerminalWidget(n) => n.validate(),
            Node::GameWidget(n) => n.validate(),
            Node::RawCode(n) => n.validate(),
        }
    }

    /// Child statement lists, for recursive walks.
    pub fn children(&self) -> Vec<&[Node]> {
        match self {
            Node::Html(n) => vec![&n.children],
            Node::If(n) => {
                let mut lists = vec![n.body.as_slice()];
                lists.extend(n.elseifs.iter().map(|b| b.body.as_slice()));
                lists.push(n.else_body.as_slice());
                lists
            }
            Node::Loop(n) => vec![&n.body],
            Node::Function(n) => vec![&n.body],
            Node::Action(n) => vec![&n.body],
            Node::Mail(n) => vec![&n.body],
            Node::Subscribe(n) => vec![&n.handler],
            Node::Schedule(n) => vec![&n.body],
            Node::Thread(n) => vec![&n.body],
            Node::Job(n) => vec![&n.handler],
            Node::WebSocket(n) => n.handlers.iter().map(|h| h.body.as_slice()).collect(),
            Node::Agent(n) => n.tools.iter().map(|t| t.body.as_slice()).collect(),
            Node::UiWidget(n) => vec![&n.children],
            Node::TerminalWidget(n) => vec![&n.children],
            Node::GameWidget(n) => vec![&n.children],
            _ => Vec::new(),
        }
    }

    /// Canonical record form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn collect_issues(statements: &[Node], issues: &mut Vec<ValidationIssue>) {
    for node in statements {
        for message in node.validate() {
            issues.push(ValidationIssue::new(node.tag_name(), message));
        }
        for child_list in node.children() {
            collect_issues(child_list, issues);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_component() -> Document {
        Document::Component(ComponentNode {
            name: "C".into(),
            statements: vec![
                Node::Set(SetNode {
                    name: "x".into(),
                    value: Some("1".into()),
                    operation: SetOperation::Assign,
                    scope: VarScope::Auto,
                    persist: None,
                    persist_key: None,
                    persist_ttl_seconds: None,
                    persist_encrypt: false,
                }),
                Node::Html(HtmlNode {
                    tag: "p".into(),
                    attributes: vec![],
                    children: vec![Node::Text(TextNode {
                        content: "{x}".into(),
                    })],
                }),
            ],
        })
    }

    #[test]
    fn test_to_value_is_deterministic() {
        let doc = sample_component();
        assert_eq!(doc.to_value(), doc.to_value());
    }

    #[test]
    fn test_validate_flags_missing_attributes() {
        let doc = Document::Component(ComponentNode {
            name: "C".into(),
            statements: vec![Node::Set(SetNode {
                name: String::new(),
                value: None,
                operation: SetOperation::Assign,
                scope: VarScope::Auto,
                persist: None,
                persist_key: None,
                persist_ttl_seconds: None,
                persist_encrypt: false,
            })],
        });
        let issues = doc.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].node, "q:set");
    }

    #[test]
    fn test_validation_recurses_into_children() {
        let doc = Document::Component(ComponentNode {
            name: "C".into(),
            statements: vec![Node::If(IfNode {
                condition: "true".into(),
                body: vec![Node::Loop(LoopNode {
                    kind: LoopKind::Array,
                    var: "i".into(),
                    from: None,
                    to: None,
                    step: None,
                    items: None, // missing
                    body: vec![],
                })],
                elseifs: vec![],
                else_body: vec![],
            })],
        });
        let issues = doc.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].node, "q:loop");
    }

    #[test]
    fn test_tool_schema_shape() {
        let tool = AgentToolNode {
            name: "search".into(),
            description: "Search docs".into(),
            params: vec![AgentToolParamNode {
                name: "query".into(),
                param_type: "string".into(),
                required: true,
                description: Some("Search text".into()),
            }],
            body: vec![],
        };
        let schema = tool.schema();
        assert_eq!(schema["name"], "search");
        assert_eq!(schema["parameters"]["required"][0], "query");
    }

    #[test]
    fn test_function_rest_helper() {
        let func = FunctionNode {
            name: "f".into(),
            params: vec![],
            body: vec![],
            rest: true,
            rest_path: Some("/api/f".into()),
        };
        assert!(func.is_rest_enabled());
    }
}
