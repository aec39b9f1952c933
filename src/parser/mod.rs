//! # Parser - XML documents into typed ASTs
//!
//! Top-level dispatch on `(namespace, localName)`:
//!
//! - `q:` - control flow, effects, infrastructure (this module)
//! - `ui:` - multi-target UI widgets ([`ui`])
//! - `qt:` - terminal widgets, with mixed raw-text function bodies
//!   ([`terminal`])
//! - `qg:` - 2D game elements ([`game`])
//! - no prefix - plain HTML elements with databinding-capable attributes
//!
//! Sub-parsers recurse back into the root parser for mixed content (`q:set`
//! inside a `ui:panel`, a `qt:table` inside a `q:if` body).
//!
//! Application roots with `type` ∈ {game, terminal, desktop} (or an explicit
//! `engine`) get the matching `xmlns:` declaration injected when absent, so
//! documents may omit namespace boilerplate.
//!
//! The "unified query" lowering happens here: a `q:query` whose datasource
//! resolves to an `llm` or `knowledge` type is lowered to the concrete
//! `LlmGenerate` / `Search` node at parse time; database and unknown types
//! stay `Query` (unknown datasources are reported at execution).

mod game;
mod terminal;
mod ui;
mod xml;

pub use xml::{build_dom, XmlChild, XmlElement};

use crate::ast::*;
use crate::error::{QuillError, Result};
use crate::persist::PersistScope;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Parsing context threaded through the statement dispatch.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Content {
    /// Statement position: unknown tags are errors.
    Statements,
    /// Mixed-content position (HTML bodies, mail bodies): unknown
    /// namespaces pass through as opaque HTML-like elements.
    Mixed,
}

/// XML → AST parser.
///
/// The parser is stateless per call apart from a snapshot of the most
/// recently parsed application's datasource map, which later component
/// parses in the same run consult for unified-query lowering.
pub struct QuillParser {
    recent_datasources: Mutex<Arc<BTreeMap<String, DatasourceNode>>>,
}

impl Default for QuillParser {
    fn default() -> Self {
        Self::new()
    }
}

impl QuillParser {
    pub fn new() -> Self {
        Self {
            recent_datasources: Mutex::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Parse a document string. The root must be `q:application` or
    /// `q:component`.
    pub fn parse(&self, input: &str) -> Result<Document> {
        let dom = build_dom(input)?;
        match dom.name.as_str() {
            "q:application" => Ok(Document::Application(self.parse_application(&dom)?)),
            "q:component" => {
                let datasources = self.recent_datasources.lock().expect("parser lock").clone();
                Ok(Document::Component(
                    self.parse_component(&dom, &datasources)?,
                ))
            }
            other => Err(QuillError::parse(format!(
                "root element must be q:application or q:component, found <{}>",
                other
            ))),
        }
    }

    /// Parse a document from a file.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Document> {
        let content = std::fs::read_to_string(path)?;
        self.parse(&content)
    }

    /// The datasource map of the most recently parsed application.
    pub fn recent_datasources(&self) -> Arc<BTreeMap<String, DatasourceNode>> {
        self.recent_datasources.lock().expect("parser lock").clone()
    }

    // ------------------------------------------------------------------
    // Document roots
    // ------------------------------------------------------------------

    fn parse_application(&self, el: &XmlElement) -> Result<ApplicationNode> {
        let app_type = match el.attr("type") {
            Some(text) => AppType::parse(text).ok_or_else(|| {
                QuillError::parse(format!("unknown application type '{}'", text))
            })?,
            None => AppType::Html,
        };
        let engine = el.attr("engine").map(str::to_string);

        let mut attributes: Vec<(String, String)> = el
            .attributes
            .iter()
            .filter(|(k, _)| k != "id" && k != "type" && k != "engine")
            .cloned()
            .collect();
        inject_namespaces(&mut attributes, app_type, engine.as_deref());

        // Datasources parse first so sibling components can consult them.
        let mut datasources = BTreeMap::new();
        for child in el.elements() {
            if child.local_name() == "datasource" {
                let ds = Self::parse_datasource(child)?;
                datasources.insert(ds.id.clone(), ds);
            }
        }
        let datasources_arc = Arc::new(datasources.clone());
        *self.recent_datasources.lock().expect("parser lock") = datasources_arc.clone();

        let mut app = ApplicationNode {
            id: el.attr("id").map(str::to_string),
            app_type,
            engine,
            attributes,
            datasources,
            components: Vec::new(),
            scenes: Vec::new(),
            screens: Vec::new(),
            prefabs: Vec::new(),
            behaviors: Vec::new(),
            windows: Vec::new(),
            statements: Vec::new(),
        };

        for child in el.elements() {
            match (child.prefix(), child.local_name()) {
                (_, "datasource") => {}
                ("q", "component") => {
                    app.components
                        .push(self.parse_component(child, &datasources_arc)?);
                }
                ("qg", "scene") => app
                    .scenes
                    .push(game::parse_game_element(self, child, &datasources_arc)?),
                ("qg", "prefab") => app
                    .prefabs
                    .push(game::parse_game_element(self, child, &datasources_arc)?),
                ("qg", "behavior") => app
                    .behaviors
                    .push(game::parse_game_element(self, child, &datasources_arc)?),
                ("qt", "screen") => app
                    .screens
                    .push(terminal::parse_terminal_element(self, child, &datasources_arc)?),
                ("ui", "window") => app
                    .windows
                    .push(ui::parse_ui_element(self, child, &datasources_arc)?),
                _ => {
                    if let Some(node) =
                        self.parse_statement(child, &datasources_arc, Content::Statements)?
                    {
                        app.statements.push(node);
                    }
                }
            }
        }

        Ok(app)
    }

    fn parse_component(
        &self,
        el: &XmlElement,
        datasources: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<ComponentNode> {
        Ok(ComponentNode {
            name: el.attr_or_empty("name"),
            statements: self.parse_children(el, datasources, Content::Mixed)?,
        })
    }

    fn parse_datasource(el: &XmlElement) -> Result<DatasourceNode> {
        let ds_type = DatasourceType::parse(el.attr("type").unwrap_or(""));
        let attributes = el
            .attributes
            .iter()
            .filter(|(k, _)| k != "id" && k != "type")
            .cloned()
            .collect();
        Ok(DatasourceNode {
            id: el.attr_or_empty("id"),
            ds_type,
            attributes,
        })
    }

    // ------------------------------------------------------------------
    // Statement dispatch
    // ------------------------------------------------------------------

    /// Parse all children of an element as statements/mixed content.
    pub(crate) fn parse_children(
        &self,
        el: &XmlElement,
        datasources: &Arc<BTreeMap<String, DatasourceNode>>,
        content: Content,
    ) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for child in &el.children {
            match child {
                XmlChild::Text(text) => {
                    if !text.trim().is_empty() {
                        nodes.push(Node::Text(TextNode {
                            content: text.clone(),
                        }));
                    }
                }
                XmlChild::Element(element) => {
                    if let Some(node) = self.parse_statement(element, datasources, content)? {
                        nodes.push(node);
                    }
                }
            }
        }
        Ok(nodes)
    }

    /// Dispatch one element. Returns `None` for structural children consumed
    /// by their parent (`q:elseif`, `q:param`, ...) that appear out of place.
    pub(crate) fn parse_statement(
        &self,
        el: &XmlElement,
        datasources: &Arc<BTreeMap<String, DatasourceNode>>,
        content: Content,
    ) -> Result<Option<Node>> {
        match el.prefix() {
            "q" => self.parse_q_statement(el, datasources, content),
            "ui" => Ok(Some(ui::parse_ui_element(self, el, datasources)?)),
            "qt" => Ok(Some(terminal::parse_terminal_element(self, el, datasources)?)),
            "qg" => Ok(Some(game::parse_game_element(self, el, datasources)?)),
            "" => Ok(Some(self.parse_html(el, datasources)?)),
            _other if content == Content::Mixed => {
                // Unknown namespaces pass through as opaque elements when
                // the parent accepts mixed content.
                Ok(Some(self.parse_html(el, datasources)?))
            }
            other => Err(QuillError::parse(format!(
                "unknown namespace '{}:' in <{}>",
                other, el.name
            ))),
        }
    }

    fn parse_q_statement(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
        _content: Content,
    ) -> Result<Option<Node>> {
        let node = match el.local_name() {
            "set" => Node::Set(Self::parse_set(el)?),
            "if" => Node::If(self.parse_if(el, ds)?),
            "loop" => Node::Loop(self.parse_loop(el, ds)?),
            "function" => Node::Function(self.parse_function(el, ds, false)?),
            "call" => Node::Call(Self::parse_call(el)?),
            "return" => Node::Return(ReturnNode {
                value: el.attr("value").map(str::to_string),
            }),
            "query" => self.parse_query(el, ds)?,
            "action" => Node::Action(ActionNode {
                name: el.attr_or_empty("name"),
                method: el.attr("method").unwrap_or("POST").to_uppercase(),
                redirect: el.attr("redirect").map(str::to_string),
                body: self.parse_children(el, ds, Content::Statements)?,
            }),
            "mail" => Node::Mail(MailNode {
                to: el.attr_or_empty("to"),
                subject: el.attr_or_empty("subject"),
                from: el.attr("from").map(str::to_string),
                cc: el.attr("cc").map(str::to_string),
                bcc: el.attr("bcc").map(str::to_string),
                reply_to: el.attr("reply_to").map(str::to_string),
                mail_type: match el.attr("type") {
                    Some("text") => MailType::Text,
                    _ => MailType::Html,
                },
                result_var: el.attr("result").map(str::to_string),
                body: self.parse_children(el, ds, Content::Mixed)?,
            }),
            "file" => Node::File(FileNode {
                field: el.attr("field").map(str::to_string),
                destination: el.attr("destination").map(str::to_string),
                accept: el.attr("accept").map(str::to_string),
                max_size: el.attr("max_size").map(str::to_string),
                name_conflict: el
                    .attr("name_conflict")
                    .and_then(NameConflict::parse)
                    .unwrap_or(NameConflict::MakeUnique),
                result_var: el.attr("result").map(str::to_string),
            }),
            "dump" => Node::Dump(DumpNode {
                expression: el.attr_or_empty("var"),
                label: el.attr("label").map(str::to_string),
                format: match el.attr("format") {
                    Some("json") => DumpFormat::Json,
                    Some("text") => DumpFormat::Text,
                    _ => DumpFormat::Html,
                },
                max_depth: el.attr_u32("depth").unwrap_or(3),
            }),
            "log" => Node::Log(LogNode {
                message: el.attr_or_empty("message"),
                level: el
                    .attr("level")
                    .and_then(LogLevel::parse)
                    .unwrap_or(LogLevel::Info),
            }),
            "message" => Node::Message(Self::parse_message(el)?),
            "subscribe" => Node::Subscribe(SubscribeNode {
                name: el.attr_or_empty("name"),
                topic: el.attr("topic").map(str::to_string),
                topics: el.attr("topics").map(str::to_string),
                queue: el.attr("queue").map(str::to_string),
                ack: match el.attr("ack") {
                    Some("manual") => AckMode::Manual,
                    _ => AckMode::Auto,
                },
                prefetch: el.attr_u32("prefetch").unwrap_or(1) as u16,
                handler: self.parse_children(el, ds, Content::Statements)?,
            }),
            "queue" => Node::Queue(QueueNode {
                name: el.attr_or_empty("name"),
                action: match el.attr("action") {
                    Some("delete") => QueueAction::Delete,
                    Some("purge") => QueueAction::Purge,
                    Some("info") => QueueAction::Info,
                    _ => QueueAction::Declare,
                },
                durable: el.attr_bool("durable", true),
                exclusive: el.attr_bool("exclusive", false),
                auto_delete: el.attr_bool("auto_delete", false),
                dlq: el.attr("dlq").map(str::to_string),
                ttl_ms: el.attr_u64("ttl"),
                result_var: el.attr("result").map(str::to_string),
            }),
            "ack" => Node::MessageAck(MessageAckNode {}),
            "nack" => Node::MessageNack(MessageNackNode {
                requeue: el.attr_bool("requeue", true),
            }),
            "schedule" => Node::Schedule(ScheduleNode {
                name: el.attr_or_empty("name"),
                interval: el.attr("interval").map(str::to_string),
                cron: el.attr("cron").map(str::to_string),
                timezone: el.attr("timezone").map(str::to_string),
                enabled: el.attr_bool("enabled", true),
                body: self.parse_children(el, ds, Content::Statements)?,
            }),
            "thread" => Node::Thread(ThreadNode {
                name: el.attr_or_empty("name"),
                priority: el
                    .attr("priority")
                    .and_then(ThreadPriority::parse)
                    .unwrap_or(ThreadPriority::Normal),
                body: self.parse_children(el, ds, Content::Statements)?,
                result_var: el.attr("result").map(str::to_string),
            }),
            "job" => Node::Job(self.parse_job(el, ds)?),
            "websocket" => Node::WebSocket(self.parse_websocket(el, ds)?),
            "ws-send" => Node::WebSocketSend(WebSocketSendNode {
                connection: el.attr_or_empty("connection"),
                message: el
                    .attr("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| el.text().trim().to_string()),
                result_var: el.attr("result").map(str::to_string),
            }),
            "ws-close" => Node::WebSocketClose(WebSocketCloseNode {
                connection: el.attr_or_empty("connection"),
                code: el.attr_u32("code").map(|c| c as u16),
                reason: el.attr("reason").map(str::to_string),
            }),
            "agent" => Node::Agent(self.parse_agent(el, ds)?),
            "agent-execute" => Node::AgentExecute(AgentExecuteNode {
                agent: el.attr_or_empty("agent"),
                task: el.attr_or_empty("task"),
                context: el.attr("context").map(str::to_string),
                result_var: el.attr_or_empty("result"),
            }),
            "llm" => Node::Llm(Self::parse_llm(el)?),
            "llm-generate" => Node::LlmGenerate(Self::parse_llm_generate(el)?),
            "knowledge" => Node::Knowledge(Self::parse_knowledge(el)?),
            "search" => Node::Search(SearchNode {
                knowledge_id: el.attr_or_empty("knowledge"),
                query: el
                    .attr("query")
                    .map(str::to_string)
                    .unwrap_or_else(|| el.text().trim().to_string()),
                result_var: el.attr("result").map(str::to_string),
                top_k: el.attr_usize("top_k").unwrap_or(5),
                threshold: el.attr_f64("threshold"),
            }),
            "persist" => Node::Persist(Self::parse_persist(el)?),
            other => {
                return Err(QuillError::parse(format!("unknown tag <q:{}>", other)));
            }
        };
        Ok(Some(node))
    }

    fn parse_html(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<Node> {
        Ok(Node::Html(HtmlNode {
            tag: el.name.clone(),
            attributes: el.attributes.clone(),
            children: self.parse_children(el, ds, Content::Mixed)?,
        }))
    }

    fn parse_set(el: &XmlElement) -> Result<SetNode> {
        let operation = match el.attr("operation") {
            Some(text) => SetOperation::parse(text).ok_or_else(|| {
                QuillError::parse(format!("unknown q:set operation '{}'", text))
            })?,
            None => SetOperation::Assign,
        };
        Ok(SetNode {
            name: el.attr_or_empty("name"),
            value: el.attr("value").map(str::to_string),
            operation,
            scope: match el.attr("scope") {
                Some("component") => VarScope::Component,
                _ => VarScope::Auto,
            },
            persist: el.attr("persist").and_then(PersistScope::parse),
            persist_key: el.attr("persist_key").map(str::to_string),
            persist_ttl_seconds: el.attr_u64("persist_ttl"),
            persist_encrypt: el.attr_bool("persist_encrypt", false),
        })
    }

    fn parse_if(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<IfNode> {
        // `q:elseif` / `q:else` children split the body into branches.
        let mut node = IfNode {
            condition: el.attr_or_empty("condition"),
            body: Vec::new(),
            elseifs: Vec::new(),
            else_body: Vec::new(),
        };

        enum Target {
            Body,
            ElseIf,
            Else,
        }
        let mut target = Target::Body;

        for child in &el.children {
            match child {
                XmlChild::Element(element)
                    if element.prefix() == "q" && element.local_name() == "elseif" =>
                {
                    node.elseifs.push(ElseIfBranch {
                        condition: element.attr_or_empty("condition"),
                        body: self.parse_children(element, ds, Content::Mixed)?,
                    });
                    // Content may also follow as siblings of a self-closed
                    // divider form.
                    if element.children.is_empty() {
                        target = Target::ElseIf;
                    }
                }
                XmlChild::Element(element)
                    if element.prefix() == "q" && element.local_name() == "else" =>
                {
                    if element.children.is_empty() {
                        target = Target::Else;
                    } else {
                        node.else_body
                            .extend(self.parse_children(element, ds, Content::Mixed)?);
                    }
                }
                other => {
                    let parsed: Vec<Node> = match other {
                        XmlChild::Text(text) => {
                            if text.trim().is_empty() {
                                Vec::new()
                            } else {
                                vec![Node::Text(TextNode {
                                    content: text.clone(),
                                })]
                            }
                        }
                        XmlChild::Element(element) => self
                            .parse_statement(element, ds, Content::Mixed)?
                            .into_iter()
                            .collect(),
                    };
                    match target {
                        Target::Body => node.body.extend(parsed),
                        Target::ElseIf => {
                            if let Some(branch) = node.elseifs.last_mut() {
                                branch.body.extend(parsed);
                            }
                        }
                        Target::Else => node.else_body.extend(parsed),
                    }
                }
            }
        }

        Ok(node)
    }

    fn parse_loop(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<LoopNode> {
        let items = el.attr("items").map(str::to_string);
        let kind = if items.is_some() {
            LoopKind::Array
        } else {
            LoopKind::Range
        };
        Ok(LoopNode {
            kind,
            var: el.attr_or_empty("var"),
            from: el.attr("from").map(str::to_string),
            to: el.attr("to").map(str::to_string),
            step: el.attr("step").map(str::to_string),
            items,
            body: self.parse_children(el, ds, Content::Mixed)?,
        })
    }

    pub(crate) fn parse_function(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
        preserve_raw_text: bool,
    ) -> Result<FunctionNode> {
        let mut params = Vec::new();
        let mut body = Vec::new();

        for child in &el.children {
            match child {
                XmlChild::Element(element)
                    if element.prefix() == "q" && element.local_name() == "param" =>
                {
                    params.push(ParamNode {
                        name: element.attr_or_empty("name"),
                        param_type: element
                            .attr("type")
                            .and_then(ParamType::parse)
                            .unwrap_or(ParamType::Any),
                        required: element.attr_bool("required", false),
                        default: element.attr("default").map(str::to_string),
                    });
                }
                XmlChild::Element(element) => {
                    if let Some(node) = self.parse_statement(element, ds, Content::Mixed)? {
                        body.push(node);
                    }
                }
                XmlChild::Text(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    if preserve_raw_text {
                        // Terminal-engine function bodies keep raw lines
                        // interleaved with statement tags, in order.
                        for line in text.lines() {
                            if !line.trim().is_empty() {
                                body.push(Node::RawCode(RawCodeNode {
                                    code: line.trim_end().to_string(),
                                }));
                            }
                        }
                    } else {
                        body.push(Node::Text(TextNode {
                            content: text.clone(),
                        }));
                    }
                }
            }
        }

        Ok(FunctionNode {
            name: el.attr_or_empty("name"),
            params,
            body,
            rest: el.attr_bool("rest", false),
            rest_path: el.attr("rest_path").map(str::to_string),
        })
    }

    fn parse_call(el: &XmlElement) -> Result<FunctionCallNode> {
        let mut args = Vec::new();
        // Arguments come as `arg:`-prefixed attributes or q:arg children.
        for (key, value) in &el.attributes {
            if let Some(name) = key.strip_prefix("arg:") {
                args.push((name.to_string(), value.clone()));
            }
        }
        for child in el.elements() {
            if child.prefix() == "q" && child.local_name() == "arg" {
                args.push((child.attr_or_empty("name"), child.attr_or_empty("value")));
            }
        }
        Ok(FunctionCallNode {
            function: el.attr_or_empty("function"),
            args,
            result_var: el.attr("result").map(str::to_string),
        })
    }

    /// Unified query: lower on the declared datasource type.
    fn parse_query(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<Node> {
        let name = el.attr_or_empty("name");
        let datasource = el.attr("datasource").map(str::to_string);
        let body = el.text().trim().to_string();

        if let Some(ds_id) = datasource.as_deref() {
            match ds.get(ds_id).map(|d| &d.ds_type) {
                Some(DatasourceType::Llm) => {
                    return Ok(Node::LlmGenerate(LlmGenerateNode {
                        llm_id: ds_id.to_string(),
                        prompt: body,
                        result_var: Some(name),
                        stream: el.attr_bool("stream", false),
                        cache: el.attr_bool("cache", false),
                        cache_key: el.attr("cache_key").map(str::to_string),
                    }));
                }
                Some(DatasourceType::Knowledge) => {
                    return Ok(Node::Search(SearchNode {
                        knowledge_id: ds_id.to_string(),
                        query: body,
                        result_var: Some(name),
                        top_k: el.attr_usize("top_k").unwrap_or(5),
                        threshold: el.attr_f64("threshold"),
                    }));
                }
                // Database types and unknown datasources stay QueryNode;
                // unknown ids are reported at execution.
                _ => {}
            }
        }

        Ok(Node::Query(QueryNode {
            name,
            datasource,
            sql: body,
            max_rows: el.attr_u64("max_rows"),
            timeout_ms: el.attr_u64("timeout"),
        }))
    }

    fn parse_message(el: &XmlElement) -> Result<MessageNode> {
        let kind = match el.attr("type") {
            Some("send") => MessageKind::Send,
            Some("request") => MessageKind::Request,
            Some("publish") | None => MessageKind::Publish,
            Some(other) => {
                return Err(QuillError::parse(format!(
                    "unknown q:message type '{}'",
                    other
                )));
            }
        };
        let headers = el
            .elements()
            .filter(|c| c.prefix() == "q" && c.local_name() == "message-header")
            .map(|c| MessageHeaderNode {
                name: c.attr_or_empty("name"),
                value: c.attr_or_empty("value"),
            })
            .collect();
        Ok(MessageNode {
            name: el.attr("name").map(str::to_string),
            kind,
            topic: el.attr("topic").map(str::to_string),
            queue: el.attr("queue").map(str::to_string),
            body: el.text().trim().to_string(),
            headers,
            timeout_ms: el.attr_u64("timeout"),
        })
    }

    fn parse_job(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<JobNode> {
        let mut params = Vec::new();
        let mut handler = Vec::new();
        for child in el.elements() {
            if child.prefix() == "q" && child.local_name() == "param" {
                params.push((child.attr_or_empty("name"), child.attr_or_empty("value")));
            } else if let Some(node) = self.parse_statement(child, ds, Content::Statements)? {
                handler.push(node);
            }
        }
        Ok(JobNode {
            name: el.attr_or_empty("name"),
            queue: el.attr("queue").map(str::to_string),
            params,
            priority: el.attr_i32("priority").unwrap_or(0),
            delay: el.attr("delay").map(str::to_string),
            attempts: el.attr_u32("attempts"),
            backoff: el.attr("backoff").map(str::to_string),
            result_var: el.attr("result").map(str::to_string),
            handler,
        })
    }

    fn parse_websocket(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<WebSocketNode> {
        let mut handlers = Vec::new();
        for child in el.elements() {
            if child.prefix() == "q" && child.local_name() == "on" {
                let event_name = child.attr_or_empty("event");
                let event = WsEvent::parse(&event_name).ok_or_else(|| {
                    QuillError::parse(format!("unknown websocket event '{}'", event_name))
                })?;
                handlers.push(WebSocketHandlerNode {
                    event,
                    body: self.parse_children(child, ds, Content::Statements)?,
                });
            }
        }
        Ok(WebSocketNode {
            name: el.attr_or_empty("name"),
            url: el.attr_or_empty("url"),
            auto_connect: el.attr_bool("auto_connect", true),
            handlers,
        })
    }

    fn parse_agent(
        &self,
        el: &XmlElement,
        ds: &Arc<BTreeMap<String, DatasourceNode>>,
    ) -> Result<AgentNode> {
        let mut instruction = None;
        let mut tools = Vec::new();

        for child in el.elements() {
            if child.prefix() != "q" {
                continue;
            }
            match child.local_name() {
                "instruction" => {
                    instruction = Some(AgentInstructionNode {
                        text: child.text().trim().to_string(),
                    });
                }
                "tool" => {
                    let mut params = Vec::new();
                    let mut body = Vec::new();
                    for tool_child in &child.children {
                        match tool_child {
                            XmlChild::Element(element)
                                if element.prefix() == "q"
                                    && element.local_name() == "tool-param" =>
                            {
                                params.push(AgentToolParamNode {
                                    name: element.attr_or_empty("name"),
                                    param_type: element
                                        .attr("type")
                                        .unwrap_or("string")
                                        .to_string(),
                                    required: element.attr_bool("required", false),
                                    description: element
                                        .attr("description")
                                        .map(str::to_string),
                                });
                            }
                            XmlChild::Element(element) => {
                                if let Some(node) =
                                    self.parse_statement(element, ds, Content::Statements)?
                                {
                                    body.push(node);
                                }
                            }
                            XmlChild::Text(_) => {}
                        }
                    }
                    tools.push(AgentToolNode {
                        name: child.attr_or_empty("name"),
                        description: child.attr_or_empty("description"),
                        params,
                        body,
                    });
                }
                other => {
                    return Err(QuillError::parse(format!(
                        "unknown tag <q:{}> inside q:agent",
                        other
                    )));
                }
            }
        }

        Ok(AgentNode {
            name: el.attr_or_empty("name"),
            model: el.attr_or_empty("model"),
            provider: el.attr("provider").unwrap_or("auto").to_string(),
            endpoint: el.attr("endpoint").map(str::to_string),
            api_key: el.attr("api_key").map(str::to_string),
            max_iterations: el.attr_u32("max_iterations").unwrap_or(10),
            timeout_ms: el.attr_u64("timeout").unwrap_or(60_000),
            instruction,
            tools,
        })
    }

    fn parse_llm(el: &XmlElement) -> Result<LlmNode> {
        const KNOWN: &[&str] = &["id", "model", "provider", "temperature", "max_tokens"];
        let system_prompt = el
            .child("default-prompt")
            .map(|c| c.text().trim().to_string());
        let options = el
            .attributes
            .iter()
            .filter(|(k, _)| !KNOWN.contains(&k.as_str()))
            .cloned()
            .collect();
        Ok(LlmNode {
            id: el.attr_or_empty("id"),
            model: el.attr_or_empty("model"),
            provider: el.attr("provider").unwrap_or("ollama").to_string(),
            temperature: el.attr_f64("temperature").unwrap_or(0.7),
            max_tokens: el.attr_u32("max_tokens"),
            system_prompt,
            options,
        })
    }

    fn parse_llm_generate(el: &XmlElement) -> Result<LlmGenerateNode> {
        // The prompt may come as an attribute or as element text.
        let prompt = el
            .attr("prompt")
            .map(str::to_string)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| el.text().trim().to_string());
        Ok(LlmGenerateNode {
            llm_id: el.attr_or_empty("llm"),
            prompt,
            result_var: el.attr("result").map(str::to_string),
            stream: el.attr_bool("stream", false),
            cache: el.attr_bool("cache", false),
            cache_key: el.attr("cache_key").map(str::to_string),
        })
    }

    fn parse_knowledge(el: &XmlElement) -> Result<KnowledgeNode> {
        let mut sources = Vec::new();
        for child in el.elements() {
            if child.prefix() == "q" && child.local_name() == "source" {
                let kind_name = child.attr("type").unwrap_or("text");
                let kind = SourceKind::parse(kind_name).ok_or_else(|| {
                    QuillError::parse(format!("unknown knowledge source type '{}'", kind_name))
                })?;
                let value = child
                    .attr("value")
                    .map(str::to_string)
                    .unwrap_or_else(|| child.text().trim().to_string());
                sources.push(KnowledgeSourceNode {
                    kind,
                    value,
                    chunk_size: child.attr_usize("chunk_size"),
                    chunk_overlap: child.attr_usize("chunk_overlap"),
                });
            }
        }
        Ok(KnowledgeNode {
            name: el.attr_or_empty("name"),
            embed_model: el
                .attr("embed_model")
                .unwrap_or("nomic-embed-text")
                .to_string(),
            chunk_size: el.attr_usize("chunk_size").unwrap_or(500),
            chunk_overlap: el.attr_usize("chunk_overlap").unwrap_or(50),
            persist: el.attr_bool("persist", false),
            persist_path: el.attr("persist_path").map(str::to_string),
            rebuild: el.attr_bool("rebuild", false),
            sources,
        })
    }

    fn parse_persist(el: &XmlElement) -> Result<PersistNode> {
        let scope_name = el.attr("scope").unwrap_or("local");
        let scope = PersistScope::parse(scope_name).ok_or_else(|| {
            QuillError::parse(format!("unknown persist scope '{}'", scope_name))
        })?;
        // Variable names: `names` attribute (comma separated) or q:var
        // children.
        let mut names: Vec<String> = el
            .attr("names")
            .map(|list| {
                list.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        for child in el.elements() {
            if child.prefix() == "q" && child.local_name() == "var" {
                names.push(child.attr_or_empty("name"));
            }
        }
        Ok(PersistNode {
            scope,
            prefix: el.attr("prefix").map(str::to_string),
            names,
            ttl_seconds: el.attr_u64("ttl"),
            encrypt: el.attr_bool("encrypt", false),
        })
    }
}

/// Add the implied namespace declarations for typed applications when the
/// author omitted them.
fn inject_namespaces(attributes: &mut Vec<(String, String)>, app_type: AppType, engine: Option<&str>) {
    let mut ensure = |name: &str, value: &str| {
        if !attributes.iter().any(|(k, _)| k == name) {
            attributes.push((name.to_string(), value.to_string()));
        }
    };
    match app_type {
        AppType::Game => ensure("xmlns:qg", "http://quill.dev/ns/game"),
        AppType::Terminal => ensure("xmlns:qt", "http://quill.dev/ns/terminal"),
        AppType::Desktop => ensure("xmlns:ui", "http://quill.dev/ns/ui"),
        _ => {}
    }
    if engine.is_some() {
        ensure("xmlns:qg", "http://quill.dev/ns/game");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Document {
        QuillParser::new().parse(input).unwrap()
    }

    fn component_statements(doc: &Document) -> &[Node] {
        match doc {
            Document::Component(c) => &c.statements,
            Document::Application(_) => panic!("expected component"),
        }
    }

    #[test]
    fn test_parse_counter_component() {
        let doc = parse(
            r#"<q:component name="C">
                <q:set name="x" value="1" />
                <q:set name="x" value="{x + 2}" />
                <p>{x}</p>
            </q:component>"#,
        );
        let statements = component_statements(&doc);
        assert_eq!(statements.len(), 3);
        assert!(matches!(&statements[0], Node::Set(s) if s.name == "x"));
        assert!(matches!(&statements[2], Node::Html(h) if h.tag == "p"));
    }

    #[test]
    fn test_parse_if_with_else() {
        let doc = parse(
            r#"<q:component name="C">
                <q:if condition="x > 1">
                    <p>big</p>
                    <q:else />
                    <p>small</p>
                </q:if>
            </q:component>"#,
        );
        match &component_statements(&doc)[0] {
            Node::If(node) => {
                assert_eq!(node.condition, "x > 1");
                assert_eq!(node.body.len(), 1);
                assert_eq!(node.else_body.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_loop_kinds() {
        let doc = parse(
            r#"<q:component name="C">
                <q:loop from="1" to="3" var="i"><li>{i}</li></q:loop>
                <q:loop items="{users.data}" var="u"><li>{u.name}</li></q:loop>
            </q:component>"#,
        );
        let statements = component_statements(&doc);
        assert!(matches!(&statements[0], Node::Loop(l) if l.kind == LoopKind::Range));
        assert!(matches!(&statements[1], Node::Loop(l) if l.kind == LoopKind::Array));
    }

    #[test]
    fn test_unified_query_lowering_llm() {
        let parser = QuillParser::new();
        parser
            .parse(
                r#"<q:application id="app" type="html">
                    <datasource id="ai" type="llm" model="m" />
                </q:application>"#,
            )
            .unwrap();

        // A later component in the same run consults the application's
        // datasource map.
        let doc = parser
            .parse(
                r#"<q:component name="C">
                    <q:query name="answer" datasource="ai">Explain X</q:query>
                </q:component>"#,
            )
            .unwrap();
        match &component_statements(&doc)[0] {
            Node::LlmGenerate(node) => {
                assert_eq!(node.llm_id, "ai");
                assert_eq!(node.prompt, "Explain X");
                assert_eq!(node.result_var.as_deref(), Some("answer"));
            }
            other => panic!("expected lowered llm-generate, got {:?}", other),
        }
    }

    #[test]
    fn test_unified_query_lowering_knowledge_and_fallback() {
        let parser = QuillParser::new();
        parser
            .parse(
                r#"<q:application id="app">
                    <datasource id="kb" type="knowledge" />
                    <datasource id="db" type="postgres" />
                </q:application>"#,
            )
            .unwrap();

        let doc = parser
            .parse(
                r#"<q:component name="C">
                    <q:query name="hits" datasource="kb" top_k="3">find it</q:query>
                    <q:query name="rows" datasource="db">SELECT 1</q:query>
                    <q:query name="later" datasource="unknown">SELECT 2</q:query>
                </q:component>"#,
            )
            .unwrap();
        let statements = component_statements(&doc);
        assert!(matches!(&statements[0], Node::Search(s) if s.top_k == 3));
        assert!(matches!(&statements[1], Node::Query(_)));
        // Unknown datasource falls back to QueryNode for execution to report.
        assert!(matches!(&statements[2], Node::Query(_)));
    }

    #[test]
    fn test_unknown_q_tag_is_parse_error() {
        let err = QuillParser::new()
            .parse(r#"<q:component name="C"><q:frobnicate /></q:component>"#)
            .unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn test_unknown_namespace_in_mixed_content_passes_through() {
        let doc = parse(
            r#"<q:component name="C">
                <q:mail to="a@b" subject="s"><v:shape>x</v:shape></q:mail>
            </q:component>"#,
        );
        match &component_statements(&doc)[0] {
            Node::Mail(mail) => {
                assert!(matches!(&mail.body[0], Node::Html(h) if h.tag == "v:shape"));
            }
            other => panic!("expected mail, got {:?}", other),
        }
    }

    #[test]
    fn test_game_app_namespace_injection_and_scenes() {
        let doc = parse(
            r#"<q:application id="g" type="game">
                <qg:scene name="main" width="800" height="600">
                    <qg:sprite id="player" src="p.png" x="0" y="0" />
                </qg:scene>
            </q:application>"#,
        );
        match doc {
            Document::Application(app) => {
                assert!(app
                    .attributes
                    .iter()
                    .any(|(k, _)| k == "xmlns:qg"));
                assert_eq!(app.scenes.len(), 1);
            }
            other => panic!("expected application, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_function_with_params() {
        let doc = parse(
            r#"<q:component name="C">
                <q:function name="greet">
                    <q:param name="who" type="string" default="world" />
                    <q:return value="'hello ' + who" />
                </q:function>
                <q:call function="greet" arg:who="'quill'" result="msg" />
            </q:component>"#,
        );
        let statements = component_statements(&doc);
        match &statements[0] {
            Node::Function(f) => {
                assert_eq!(f.params.len(), 1);
                assert_eq!(f.params[0].default.as_deref(), Some("world"));
                assert_eq!(f.body.len(), 1);
            }
            other => panic!("expected function, got {:?}", other),
        }
        assert!(matches!(&statements[1], Node::Call(c) if c.args.len() == 1));
    }

    #[test]
    fn test_parse_agent_with_tools() {
        let doc = parse(
            r#"<q:component name="C">
                <q:agent name="helper" model="phi3" max_iterations="5">
                    <q:instruction>Be helpful.</q:instruction>
                    <q:tool name="lookup" description="Find a thing">
                        <q:tool-param name="key" type="string" required="true" />
                        <q:set name="found" value="'yes'" />
                    </q:tool>
                </q:agent>
                <q:agent-execute agent="helper" task="do it" result="out" />
            </q:component>"#,
        );
        let statements = component_statements(&doc);
        match &statements[0] {
            Node::Agent(agent) => {
                assert_eq!(agent.max_iterations, 5);
                assert_eq!(agent.tools.len(), 1);
                assert_eq!(agent.tools[0].params[0].name, "key");
                assert_eq!(agent.tools[0].body.len(), 1);
                assert!(agent.instruction.is_some());
            }
            other => panic!("expected agent, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_llm_with_default_prompt() {
        let doc = parse(
            r#"<q:component name="C">
                <q:llm id="assistant" model="llama3" temperature="0.2" top_p="0.9">
                    <default-prompt>You are terse.</default-prompt>
                </q:llm>
            </q:component>"#,
        );
        match &component_statements(&doc)[0] {
            Node::Llm(llm) => {
                assert_eq!(llm.temperature, 0.2);
                assert_eq!(llm.system_prompt.as_deref(), Some("You are terse."));
                // Unknown attributes are preserved as options.
                assert!(llm.options.iter().any(|(k, v)| k == "top_p" && v == "0.9"));
            }
            other => panic!("expected llm, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_idempotence() {
        let source = r#"<q:component name="C">
            <q:set name="x" value="1" />
            <q:loop from="1" to="2" var="i"><p>{i}</p></q:loop>
        </q:component>"#;
        let a = QuillParser::new().parse(source).unwrap().to_value();
        let b = QuillParser::new().parse(source).unwrap().to_value();
        assert_eq!(a, b);
    }
}
