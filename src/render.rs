//! # Statement Interpreter
//!
//! Tree-walking evaluator producing the reference HTML-ish output. Each
//! statement variant has a defined behavior; effectful tags delegate to the
//! runtime's collaborators.
//!
//! Error policy: effectful tags with a named result variable capture
//! failures into the result record and continue. Statements without a
//! result sink propagate a `RenderError` carrying the node's identity;
//! [`Renderer::render_document`] turns those into HTML comments
//! (`<!-- Kind: message -->`) in the output stream, one per broken
//! top-level statement. Expression failures inside text/attribute
//! substitution keep the `{expr}` placeholder and never raise; `q:if`
//! conditions and `q:loop` ranges do raise.

use crate::ast::*;
use crate::broker::{Message, QueueOptions, SubscribeOptions};
use crate::context::{ExecutionContext, ScopeKind};
use crate::error::{QuillError, Result};
use crate::jobs::{DispatchOptions, ThreadOptions};
use crate::llm::{ChatOptions, Provider};
use crate::persist::{effective_key, PersistedVar};
use crate::runtime::Runtime;
use crate::services::{EmailRequest, UploadRequest};
use crate::value;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// HTML elements rendered self-closing.
const VOID_ELEMENTS: &[&str] = &[
    "br", "hr", "img", "input", "meta", "link", "area", "base", "col", "embed", "param",
    "source", "track", "wbr",
];

/// Output of one statement: rendered text plus an optional `q:return`
/// value that unwinds the enclosing function body.
#[derive(Debug, Default)]
struct Step {
    output: String,
    returned: Option<Value>,
}

impl Step {
    fn text(output: String) -> Self {
        Self {
            output,
            returned: None,
        }
    }

    fn none() -> Self {
        Self::default()
    }
}

/// The tree-walking interpreter. Cheap to construct; holds only the
/// runtime handle.
#[derive(Clone)]
pub struct Renderer {
    runtime: Arc<Runtime>,
}

impl Renderer {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Render a whole document. Broken top-level statements surface as
    /// HTML comments; the rest of the document still renders.
    pub async fn render_document(
        &self,
        document: &Document,
        ctx: &mut ExecutionContext,
    ) -> String {
        match document {
            Document::Component(component) => self.render_component(component, ctx).await,
            Document::Application(app) => {
                self.render_statement_list(&app.statements, ctx).await
            }
        }
    }

    /// Render one component: pre-register its functions, restore persisted
    /// variables, then walk its statements.
    pub async fn render_component(
        &self,
        component: &ComponentNode,
        ctx: &mut ExecutionContext,
    ) -> String {
        for statement in &component.statements {
            if let Node::Function(function) = statement {
                ctx.register_function(Arc::new(function.clone()));
            }
        }
        for (name, restored) in self.runtime.persistence.restore_all().await {
            if ctx.get(&name).is_none() {
                ctx.set_component(&name, restored);
            }
        }
        self.render_statement_list(&component.statements, ctx).await
    }

    /// Render a component of an application by name.
    pub async fn render_component_by_name(
        &self,
        app: &ApplicationNode,
        name: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<String> {
        let component = app
            .components
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| QuillError::other(format!("unknown component '{}'", name)))?;
        Ok(self.render_component(component, ctx).await)
    }

    /// Walk a statement list at the outermost level, converting per-
    /// statement failures into HTML comments.
    async fn render_statement_list(
        &self,
        statements: &[Node],
        ctx: &mut ExecutionContext,
    ) -> String {
        let mut output = String::new();
        for statement in statements {
            match self.render_statement(statement, ctx).await {
                Ok(step) => output.push_str(&step.output),
                Err(e) => {
                    tracing::warn!(node = %statement.tag_name(), error = %e, "statement failed");
                    output.push_str(&e.html_comment());
                }
            }
        }
        output
    }

    /// Walk a nested statement list; failures propagate, `q:return` stops
    /// the walk.
    async fn run_statements(
        &self,
        statements: &[Node],
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let mut combined = Step::none();
        for statement in statements {
            let step = self.render_statement(statement, ctx).await?;
            combined.output.push_str(&step.output);
            if step.returned.is_some() {
                combined.returned = step.returned;
                break;
            }
        }
        Ok(combined)
    }

    fn render_statement<'a>(
        &'a self,
        node: &'a Node,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<Step>> {
        Box::pin(async move {
            match node {
                Node::Html(n) => self.render_html(n, ctx).await,
                Node::Text(n) => {
                    let namespace = ctx.flatten();
                    Ok(Step::text(self.runtime.binding.resolve(&n.content, &namespace)))
                }
                Node::RawCode(n) => Ok(Step::text(n.code.clone())),
                Node::Set(n) => self.execute_set(n, ctx).await,
                Node::If(n) => self.render_if(n, ctx).await,
                Node::Loop(n) => self.render_loop(n, ctx).await,
                Node::Function(n) => {
                    ctx.register_function(Arc::new(n.clone()));
                    Ok(Step::none())
                }
                Node::Call(n) => self.execute_call(n, ctx).await,
                Node::Return(n) => {
                    let namespace = ctx.flatten();
                    let value = match &n.value {
                        Some(text) => self
                            .runtime
                            .binding
                            .evaluate(text, &namespace)
                            .map_err(|e| {
                                QuillError::render("q:return", e.to_string())
                            })?,
                        None => Value::Null,
                    };
                    Ok(Step {
                        output: String::new(),
                        returned: Some(value),
                    })
                }
                Node::Query(n) => self.execute_query(n, ctx).await,
                Node::Action(n) => self.execute_action(n, ctx).await,
                Node::Mail(n) => self.execute_mail(n, ctx).await,
                Node::File(n) => self.execute_file(n, ctx).await,
                Node::Dump(n) => self.execute_dump(n, ctx),
                Node::Log(n) => {
                    let namespace = ctx.flatten();
                    let message = self.runtime.binding.resolve(&n.message, &namespace);
                    match n.level {
                        LogLevel::Debug => tracing::debug!(target: "quill::doc", "{}", message),
                        LogLevel::Info => tracing::info!(target: "quill::doc", "{}", message),
                        LogLevel::Warn => tracing::warn!(target: "quill::doc", "{}", message),
                        LogLevel::Error => tracing::error!(target: "quill::doc", "{}", message),
                    }
                    Ok(Step::none())
                }
                Node::Message(n) => self.execute_message(n, ctx).await,
                Node::Subscribe(n) => self.execute_subscribe(n).await,
                Node::Queue(n) => self.execute_queue(n, ctx).await,
                Node::MessageAck(_) => {
                    self.settle_current(ctx, true, true).await;
                    Ok(Step::none())
                }
                Node::MessageNack(n) => {
                    self.settle_current(ctx, false, n.requeue).await;
                    Ok(Step::none())
                }
                Node::Schedule(n) => self.execute_schedule(n),
                Node::Thread(n) => self.execute_thread(n, ctx),
                Node::Job(n) => self.execute_job(n, ctx).await,
                Node::WebSocket(n) => self.execute_websocket(n),
                Node::WebSocketSend(n) => {
                    let namespace = ctx.flatten();
                    let payload = self.runtime.binding.apply(&n.message, &namespace);
                    let queued = self.runtime.websockets.send_message(&n.connection, payload);
                    if let Some(result_var) = &n.result_var {
                        ctx.set(result_var, json!({ "queued": queued }));
                    }
                    Ok(Step::none())
                }
                Node::WebSocketClose(n) => {
                    self.runtime
                        .websockets
                        .close_connection(&n.connection, n.code, n.reason.clone());
                    Ok(Step::none())
                }
                Node::Agent(n) => {
                    self.runtime
                        .agent_configs
                        .insert(n.name.clone(), n.clone());
                    Ok(Step::none())
                }
                Node::AgentExecute(n) => self.execute_agent(n, ctx).await,
                Node::Llm(n) => {
                    self.runtime.llm_configs.insert(n.id.clone(), n.clone());
                    Ok(Step::none())
                }
                Node::LlmGenerate(n) => self.execute_llm_generate(n, ctx).await,
                Node::Knowledge(n) => self.execute_knowledge(n, ctx).await,
                Node::Search(n) => self.execute_search(n, ctx).await,
                Node::Persist(n) => self.execute_persist(n, ctx).await,
                Node::UiWidget(n) => {
                    self.render_widget(&format!("ui:{}", n.widget), &widget_attrs(n), &n.children, ctx)
                        .await
                }
                Node::TerminalWidget(n) => {
                    self.render_widget(
                        &format!("qt:{}", n.widget),
                        &n.attributes,
                        &n.children,
                        ctx,
                    )
                    .await
                }
                Node::GameWidget(n) => {
                    self.render_widget(
                        &format!("qg:{}", n.widget),
                        &n.attributes,
                        &n.children,
                        ctx,
                    )
                    .await
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Structural
    // ------------------------------------------------------------------

    async fn render_html(&self, node: &HtmlNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let mut attrs = String::new();
        for (key, raw) in &node.attributes {
            let resolved = self.runtime.binding.resolve(raw, &namespace);
            attrs.push_str(&format!(" {}=\"{}\"", key, resolved));
        }

        if VOID_ELEMENTS.contains(&node.tag.as_str()) {
            return Ok(Step::text(format!("<{}{} />", node.tag, attrs)));
        }

        let inner = self.run_statements(&node.children, ctx).await?;
        let output = format!("<{}{}>{}</{}>", node.tag, attrs, inner.output, node.tag);
        Ok(Step {
            output,
            returned: inner.returned,
        })
    }

    async fn render_widget(
        &self,
        tag: &str,
        attributes: &[(String, String)],
        children: &[Node],
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let namespace = ctx.flatten();
        let mut attrs = String::new();
        for (key, raw) in attributes {
            let resolved = self.runtime.binding.resolve(raw, &namespace);
            attrs.push_str(&format!(" {}=\"{}\"", key, resolved));
        }
        if children.is_empty() {
            return Ok(Step::text(format!("<{}{} />", tag, attrs)));
        }
        let inner = self.run_statements(children, ctx).await?;
        Ok(Step {
            output: format!("<{}{}>{}</{}>", tag, attrs, inner.output, tag),
            returned: inner.returned,
        })
    }

    // ------------------------------------------------------------------
    // Variables and control flow
    // ------------------------------------------------------------------

    async fn execute_set(&self, node: &SetNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let resolved = match &node.value {
            Some(raw) => {
                if crate::binding::DataBinding::has_binding(raw) {
                    match self.runtime.binding.apply(raw, &namespace) {
                        // Mixed substitution yields a string; re-read it as
                        // a literal so `value="{x + 2}"` stays numeric.
                        Value::String(s) => value::parse_literal(&s),
                        typed => typed,
                    }
                } else {
                    value::parse_literal(raw)
                }
            }
            None => Value::Null,
        };

        let new_value = match node.operation {
            SetOperation::Assign => resolved,
            SetOperation::Add | SetOperation::Subtract => {
                let current = ctx.get(&node.name).map(value::to_number).unwrap_or(0.0);
                let operand = value::to_number(&resolved);
                let result = if node.operation == SetOperation::Add {
                    current + operand
                } else {
                    current - operand
                };
                value::from_number(result)
            }
            SetOperation::Multiply | SetOperation::Divide => {
                let current = ctx.get(&node.name).map(value::to_number).unwrap_or(1.0);
                let operand = value::to_number(&resolved);
                if node.operation == SetOperation::Divide {
                    if operand == 0.0 {
                        return Err(QuillError::render(
                            "q:set",
                            format!("division by zero assigning '{}'", node.name),
                        ));
                    }
                    value::from_number(current / operand)
                } else {
                    value::from_number(current * operand)
                }
            }
        };

        match node.scope {
            VarScope::Component => ctx.set_component(&node.name, new_value.clone()),
            VarScope::Auto => ctx.set(&node.name, new_value.clone()),
        }

        // Mirror to external storage when requested.
        if let Some(scope) = node.persist {
            let var = PersistedVar {
                name: node.name.clone(),
                scope,
                key: effective_key(&node.name, node.persist_key.as_deref(), None),
                ttl_seconds: node.persist_ttl_seconds,
                encrypt: node.persist_encrypt,
            };
            self.runtime.persistence.register(var.clone());
            if let Err(e) = self.runtime.persistence.save(&var, new_value).await {
                tracing::warn!(var = %node.name, error = %e, "persist save failed");
            }
        }

        Ok(Step::none())
    }

    async fn render_if(&self, node: &IfNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let wrap = |e: crate::expr::ExprError| QuillError::render("q:if", e.to_string());

        if self
            .runtime
            .binding
            .condition(&node.condition, &namespace)
            .map_err(wrap)?
        {
            return self.run_statements(&node.body, ctx).await;
        }
        for branch in &node.elseifs {
            if self
                .runtime
                .binding
                .condition(&branch.condition, &namespace)
                .map_err(wrap)?
            {
                return self.run_statements(&branch.body, ctx).await;
            }
        }
        self.run_statements(&node.else_body, ctx).await
    }

    async fn render_loop(&self, node: &LoopNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let wrap = |e: crate::expr::ExprError| QuillError::render("q:loop", e.to_string());
        let mut combined = Step::none();

        match node.kind {
            LoopKind::Range => {
                let namespace = ctx.flatten();
                let number = |text: Option<&String>, default: f64| -> Result<i64> {
                    match text {
                        Some(raw) => {
                            let v = self
                                .runtime
                                .binding
                                .evaluate(raw, &namespace)
                                .map_err(wrap)?;
                            Ok(value::to_number(&v) as i64)
                        }
                        None => Ok(default as i64),
                    }
                };
                let start = number(node.from.as_ref(), 0.0)?;
                let end = number(node.to.as_ref(), 0.0)?;
                let step = number(node.step.as_ref(), 1.0)?;
                if step == 0 {
                    return Err(QuillError::render("q:loop", "step must not be zero"));
                }

                let mut index = 0usize;
                let mut i = start;
                // Range loops include the end bound.
                while (step > 0 && i <= end) || (step < 0 && i >= end) {
                    ctx.push_loop_frame(&node.var, Value::from(i), index);
                    let step_result = self.run_statements(&node.body, ctx).await;
                    ctx.pop_frame();
                    let step_output = step_result?;
                    combined.output.push_str(&step_output.output);
                    if step_output.returned.is_some() {
                        combined.returned = step_output.returned;
                        break;
                    }
                    i += step;
                    index += 1;
                }
            }
            LoopKind::Array => {
                let namespace = ctx.flatten();
                let raw = node.items.clone().unwrap_or_default();
                let mut resolved = self
                    .runtime
                    .binding
                    .evaluate(&raw, &namespace)
                    .map_err(wrap)?;

                // A bare string names a context variable.
                if let Value::String(name) = &resolved {
                    if let Some(from_ctx) = ctx.get(name) {
                        resolved = from_ctx.clone();
                    }
                }
                // Query-result records iterate their data rows.
                if let Value::Object(map) = &resolved {
                    if let Some(data) = map.get("data") {
                        resolved = data.clone();
                    }
                }
                let items = match resolved {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                };

                for (index, item) in items.into_iter().enumerate() {
                    ctx.push_loop_frame(&node.var, item, index);
                    let step_result = self.run_statements(&node.body, ctx).await;
                    ctx.pop_frame();
                    let step_output = step_result?;
                    combined.output.push_str(&step_output.output);
                    if step_output.returned.is_some() {
                        combined.returned = step_output.returned;
                        break;
                    }
                }
            }
        }

        Ok(combined)
    }

    async fn execute_call(
        &self,
        node: &FunctionCallNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let descriptor = ctx.lookup_function(&node.function).ok_or_else(|| {
            QuillError::render("q:call", format!("unknown function '{}'", node.function))
        })?;

        let namespace = ctx.flatten();
        let mut arguments: HashMap<String, Value> = HashMap::new();
        for (name, expr) in &node.args {
            let resolved = self
                .runtime
                .binding
                .evaluate(expr, &namespace)
                .map_err(|e| QuillError::render("q:call", e.to_string()))?;
            arguments.insert(name.clone(), resolved);
        }

        ctx.push_frame(ScopeKind::Function);
        let mut seed_error = None;
        for param in &descriptor.params {
            let bound = match arguments.remove(&param.name) {
                Some(value) => Some(coerce_param(value, param.param_type)),
                None => match &param.default {
                    Some(default) => Some(coerce_param(
                        value::parse_literal(default),
                        param.param_type,
                    )),
                    None if param.required => {
                        seed_error = Some(QuillError::render(
                            "q:call",
                            format!(
                                "missing required argument '{}' for '{}'",
                                param.name, node.function
                            ),
                        ));
                        None
                    }
                    None => Some(Value::Null),
                },
            };
            if let Some(value) = bound {
                ctx.set_local(&param.name, value);
            }
        }
        // Unknown extra arguments are still visible to the body.
        for (name, value) in arguments {
            ctx.set_local(&name, value);
        }

        if let Some(e) = seed_error {
            ctx.pop_frame();
            return Err(e);
        }

        let body_result = self.run_statements(&descriptor.node.body, ctx).await;
        ctx.pop_frame();
        let body = body_result?;

        let returned = body.returned.unwrap_or(Value::Null);
        match &node.result_var {
            Some(result_var) => {
                ctx.set(result_var, returned);
                Ok(Step::none())
            }
            None => Ok(Step::text(value::display(&returned))),
        }
    }

    // ------------------------------------------------------------------
    // Effects
    // ------------------------------------------------------------------

    async fn execute_query(&self, node: &QueryNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let sql = self.runtime.binding.resolve(&node.sql, &namespace);
        let result = self
            .runtime
            .database
            .execute_query(
                &sql,
                node.datasource.as_deref().unwrap_or("default"),
                &namespace,
                node.max_rows,
                node.timeout_ms,
            )
            .await;
        if let Some(error) = &result.error {
            tracing::warn!(query = %node.name, error = %error, "query failed");
        }
        ctx.set(&node.name, result.to_value());
        Ok(Step::none())
    }

    async fn execute_action(
        &self,
        node: &ActionNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        if !self.runtime.actions.matches(&node.name, &node.method) {
            return Ok(Step::none());
        }

        // Form parameters become visible to the action body.
        for (name, value) in self.runtime.actions.form_params() {
            ctx.set(&name, value);
        }
        let body = self.run_statements(&node.body, ctx).await?;

        if let Some(redirect) = &node.redirect {
            let namespace = ctx.flatten();
            let target = self.runtime.binding.resolve(redirect, &namespace);
            ctx.set("__redirect__", Value::String(target.clone()));
            return Ok(Step::text(format!(
                "{}<!-- Redirecting to {} -->",
                body.output, target
            )));
        }
        Ok(body)
    }

    async fn execute_mail(&self, node: &MailNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let body = self.run_statements(&node.body, ctx).await?;

        let request = EmailRequest {
            to: self.runtime.binding.resolve(&node.to, &namespace),
            subject: self.runtime.binding.resolve(&node.subject, &namespace),
            body: body.output,
            from: node
                .from
                .as_ref()
                .map(|f| self.runtime.binding.resolve(f, &namespace)),
            cc: node.cc.clone(),
            bcc: node.bcc.clone(),
            reply_to: node.reply_to.clone(),
            html: node.mail_type == MailType::Html,
        };
        let outcome = self.runtime.email.send_email(request).await;
        if !outcome.success {
            tracing::warn!(error = ?outcome.error, "mail send failed");
        }
        if let Some(result_var) = &node.result_var {
            ctx.set(result_var, outcome.to_value());
        }
        Ok(Step::none())
    }

    async fn execute_file(&self, node: &FileNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let request = UploadRequest {
            field: node.field.clone().unwrap_or_else(|| "file".into()),
            destination: node
                .destination
                .clone()
                .unwrap_or_else(|| "uploads".into()),
            allowed_extensions: node.accept.as_ref().map(|accept| {
                accept
                    .split(',')
                    .map(|ext| ext.trim().to_string())
                    .collect()
            }),
            max_file_size: node
                .max_size
                .as_ref()
                .and_then(|s| parse_size(s)),
            name_conflict: node.name_conflict,
        };
        let outcome = self.runtime.files.handle_upload(request).await;
        let result_var = node.result_var.as_deref().unwrap_or("uploadedFile");
        ctx.set(result_var, outcome.to_value());
        Ok(Step::none())
    }

    fn execute_dump(&self, node: &DumpNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let namespace = ctx.flatten();
        let resolved = self.runtime.binding.apply(&node.expression, &namespace);
        let truncated = truncate_depth(&resolved, node.max_depth);
        let label = node.label.as_deref().unwrap_or(&node.expression);

        let output = match node.format {
            DumpFormat::Json => serde_json::to_string_pretty(&truncated)
                .unwrap_or_else(|_| truncated.to_string()),
            DumpFormat::Text => format!("{}: {}", label, truncated),
            DumpFormat::Html => format!(
                "<pre class=\"quill-dump\"><strong>{}</strong>\n{}</pre>",
                label,
                serde_json::to_string_pretty(&truncated)
                    .unwrap_or_else(|_| truncated.to_string())
            ),
        };
        Ok(Step::text(output))
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    async fn execute_message(
        &self,
        node: &MessageNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let namespace = ctx.flatten();
        let body = self.runtime.binding.apply(&node.body, &namespace);
        let headers: HashMap<String, String> = node
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.clone(),
                    self.runtime.binding.resolve(&h.value, &namespace),
                )
            })
            .collect();

        let result = match node.kind {
            MessageKind::Publish => {
                let topic = self
                    .runtime
                    .binding
                    .resolve(node.topic.as_deref().unwrap_or_default(), &namespace);
                self.runtime.messages.publish(&topic, body, headers).await
            }
            MessageKind::Send => {
                let queue = self
                    .runtime
                    .binding
                    .resolve(node.queue.as_deref().unwrap_or_default(), &namespace);
                self.runtime.messages.send(&queue, body, headers).await
            }
            MessageKind::Request => {
                let queue = self
                    .runtime
                    .binding
                    .resolve(node.queue.as_deref().unwrap_or_default(), &namespace);
                self.runtime
                    .messages
                    .request(&queue, body, headers, node.timeout_ms.unwrap_or(5_000))
                    .await
            }
        };

        if let Some(name) = &node.name {
            ctx.set(name, result.to_value());
        }
        Ok(Step::none())
    }

    async fn execute_subscribe(&self, node: &SubscribeNode) -> Result<Step> {
        let runtime = self.runtime.clone();
        let statements = node.handler.clone();
        let callback: crate::broker::SubscriptionCallback =
            Arc::new(move |message: Message, context_value: Value| {
                let runtime = runtime.clone();
                let statements = statements.clone();
                Box::pin(async move {
                    let mut seed = HashMap::new();
                    seed.insert("message".to_string(), context_value);
                    seed.insert(
                        "__delivery_id__".to_string(),
                        Value::String(message.id.clone()),
                    );
                    let renderer = Renderer::new(runtime);
                    let mut ctx = ExecutionContext::with_vars(seed);
                    // Handler bodies run like nested statements: any failure
                    // surfaces to the service layer for nack handling.
                    renderer
                        .run_statements(&statements, &mut ctx)
                        .await
                        .map(|_| ())
                        .map_err(|e| anyhow::anyhow!(e.to_string()))
                })
            });

        self.runtime
            .messages
            .subscribe(
                SubscribeOptions {
                    name: node.name.clone(),
                    topic: node.topic.clone(),
                    topics: node.topics.clone(),
                    queue: node.queue.clone(),
                    manual_ack: node.ack == AckMode::Manual,
                    prefetch: node.prefetch as usize,
                },
                callback,
            )
            .await
            .map_err(QuillError::from)?;
        Ok(Step::none())
    }

    async fn execute_queue(&self, node: &QueueNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let result = match node.action {
            QueueAction::Declare => {
                self.runtime
                    .messages
                    .declare_queue(
                        &node.name,
                        QueueOptions {
                            durable: node.durable,
                            exclusive: node.exclusive,
                            auto_delete: node.auto_delete,
                            dead_letter_queue: node.dlq.clone(),
                            ttl_ms: node.ttl_ms,
                        },
                    )
                    .await
            }
            QueueAction::Delete => self.runtime.messages.delete_queue(&node.name).await,
            QueueAction::Purge => self.runtime.messages.purge_queue(&node.name).await,
            QueueAction::Info => self.runtime.messages.queue_info(&node.name).await,
        };
        if let Some(result_var) = &node.result_var {
            ctx.set(result_var, result.to_value());
        }
        Ok(Step::none())
    }

    /// `q:ack` / `q:nack` settle the delivery whose id the subscription
    /// handler placed in the context.
    async fn settle_current(&self, ctx: &ExecutionContext, ack: bool, requeue: bool) {
        let Some(Value::String(delivery_id)) = ctx.get("__delivery_id__").cloned() else {
            tracing::warn!("q:ack/q:nack outside a subscription handler");
            return;
        };
        let mut marker = Message::to_queue("", "");
        marker.id = delivery_id;
        let result = if ack {
            self.runtime.messages.ack(&marker).await
        } else {
            self.runtime.messages.nack(&marker, requeue).await
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "delivery settle failed");
        }
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    fn execute_schedule(&self, node: &ScheduleNode) -> Result<Step> {
        let runtime = self.runtime.clone();
        let statements = node.body.clone();
        let schedule_name = node.name.clone();
        let callback: crate::jobs::ScheduleCallback = Arc::new(move || {
            let runtime = runtime.clone();
            let statements = statements.clone();
            let schedule_name = schedule_name.clone();
            Box::pin(async move {
                let renderer = Renderer::new(runtime);
                let mut ctx = ExecutionContext::new();
                if let Err(e) = renderer.run_statements(&statements, &mut ctx).await {
                    tracing::error!(schedule = %schedule_name, error = %e, "scheduled body failed");
                }
            })
        });

        let installed = match (&node.interval, &node.cron) {
            (Some(interval), None) => {
                self.runtime
                    .scheduler
                    .add_interval(&node.name, interval, callback)
            }
            (None, Some(cron)) => self.runtime.scheduler.add_cron(&node.name, cron, callback),
            _ => {
                return Err(QuillError::render(
                    "q:schedule",
                    "exactly one of 'interval' or 'cron' is required",
                ))
            }
        };
        installed.map_err(QuillError::from)?;

        if !node.enabled {
            self.runtime.scheduler.pause(&node.name);
        }
        Ok(Step::none())
    }

    fn execute_thread(&self, node: &ThreadNode, ctx: &mut ExecutionContext) -> Result<Step> {
        let runtime = self.runtime.clone();
        let statements = node.body.clone();
        let seed = ctx.flatten();

        let body: crate::jobs::ThreadBody = Box::pin(async move {
            let renderer = Renderer::new(runtime);
            let mut thread_ctx = ExecutionContext::with_vars(seed);
            renderer
                .run_statements(&statements, &mut thread_ctx)
                .await
                .map(|step| Value::String(step.output))
                .map_err(|e| e.to_string())
        });

        let info = self
            .runtime
            .threads
            .run(
                &node.name,
                body,
                ThreadOptions {
                    priority: node.priority,
                    ..ThreadOptions::default()
                },
            )
            .map_err(QuillError::from)?;

        if let Some(result_var) = &node.result_var {
            ctx.set(
                result_var,
                json!({ "name": info.name, "status": "pending" }),
            );
        }
        Ok(Step::none())
    }

    async fn execute_job(&self, node: &JobNode, ctx: &mut ExecutionContext) -> Result<Step> {
        // A body registers the handler; an empty body dispatches.
        if !node.handler.is_empty() {
            let runtime = self.runtime.clone();
            let statements = node.handler.clone();
            let handler: crate::jobs::JobHandler = Arc::new(move |params: Value| {
                let runtime = runtime.clone();
                let statements = statements.clone();
                Box::pin(async move {
                    let mut seed = HashMap::new();
                    seed.insert("params".to_string(), params);
                    let renderer = Renderer::new(runtime);
                    let mut job_ctx = ExecutionContext::with_vars(seed);
                    renderer
                        .run_statements(&statements, &mut job_ctx)
                        .await
                        .map(|step| Value::String(step.output))
                        .map_err(|e| anyhow::anyhow!(e.to_string()))
                })
            });
            self.runtime.jobs.register_handler(&node.name, handler);
            return Ok(Step::none());
        }

        let namespace = ctx.flatten();
        let mut params = serde_json::Map::new();
        for (name, raw) in &node.params {
            params.insert(name.clone(), self.runtime.binding.apply(raw, &namespace));
        }

        let dispatched = self.runtime.jobs.dispatch(
            &node.name,
            DispatchOptions {
                params: Value::Object(params),
                queue: node.queue.clone().unwrap_or_else(|| "default".into()),
                priority: node.priority,
                delay: node.delay.clone(),
                max_attempts: node.attempts.unwrap_or(1),
                backoff: node.backoff.clone(),
            },
        );

        match dispatched {
            Ok(job_id) => {
                if let Some(result_var) = &node.result_var {
                    ctx.set(result_var, json!({ "success": true, "job_id": job_id }));
                }
                Ok(Step::none())
            }
            Err(e) => match &node.result_var {
                Some(result_var) => {
                    ctx.set(
                        result_var,
                        json!({ "success": false, "error": e.to_string() }),
                    );
                    Ok(Step::none())
                }
                None => Err(QuillError::from(e)),
            },
        }
    }

    // ------------------------------------------------------------------
    // WebSockets
    // ------------------------------------------------------------------

    fn execute_websocket(&self, node: &WebSocketNode) -> Result<Step> {
        let connection =
            self.runtime
                .websockets
                .register_connection(&node.name, &node.url, HashMap::new());

        for handler in &node.handlers {
            let runtime = self.runtime.clone();
            let statements = handler.body.clone();
            let connection_name = node.name.clone();
            self.runtime.websockets.register_handler(
                &node.name,
                handler.event,
                Arc::new(move |payload: Value| {
                    let runtime = runtime.clone();
                    let statements = statements.clone();
                    let connection_name = connection_name.clone();
                    tokio::spawn(async move {
                        let mut seed = HashMap::new();
                        seed.insert("event".to_string(), payload);
                        let renderer = Renderer::new(runtime);
                        let mut ws_ctx = ExecutionContext::with_vars(seed);
                        if let Err(e) = renderer.run_statements(&statements, &mut ws_ctx).await
                        {
                            tracing::error!(
                                connection = %connection_name,
                                error = %e,
                                "websocket handler body failed"
                            );
                        }
                    });
                }),
            );
        }

        if node.auto_connect {
            self.runtime
                .websockets
                .set_connection_state(&connection.id, crate::websocket::WsState::Open, None);
        }
        Ok(Step::none())
    }

    // ------------------------------------------------------------------
    // Agents / LLM / knowledge / persistence
    // ------------------------------------------------------------------

    async fn execute_agent(
        &self,
        node: &AgentExecuteNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let Some(config) = self
            .runtime
            .agent_configs
            .get(&node.agent)
            .map(|a| a.value().clone())
        else {
            let error = format!("unknown agent '{}'", node.agent);
            ctx.set(
                &node.result_var,
                json!({ "success": false, "error": error }),
            );
            return Ok(Step::none());
        };

        let namespace = ctx.flatten();
        let task = self.runtime.binding.resolve(&node.task, &namespace);
        let agent_context = node
            .context
            .as_ref()
            .map(|c| self.runtime.binding.resolve(c, &namespace));

        // Tool bodies execute through the interpreter in a fresh context
        // seeded with the tool arguments.
        let runtime = self.runtime.clone();
        let tool_executor: crate::agent::ToolExecutor =
            Arc::new(move |_tool: String, args: Value, body: Vec<Node>| {
                let runtime = runtime.clone();
                Box::pin(async move {
                    let mut seed = HashMap::new();
                    if let Value::Object(map) = &args {
                        for (key, value) in map {
                            seed.insert(key.clone(), value.clone());
                        }
                    }
                    seed.insert("args".to_string(), args);
                    let renderer = Renderer::new(runtime);
                    let mut tool_ctx = ExecutionContext::with_vars(seed);
                    let step = renderer
                        .run_statements(&body, &mut tool_ctx)
                        .await
                        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                    // A `result` variable set by the body wins over output.
                    Ok(match tool_ctx.get("result") {
                        Some(value) => value.clone(),
                        None => Value::String(step.output),
                    })
                })
            });

        let request = crate::agent::AgentRequest {
            instruction: config
                .instruction
                .as_ref()
                .map(|i| i.text.clone())
                .unwrap_or_default(),
            tools: config.tools.clone(),
            task,
            context: agent_context,
            model: config.model.clone(),
            provider: Provider::parse(&config.provider),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            max_iterations: config.max_iterations,
            timeout: std::time::Duration::from_millis(config.timeout_ms),
            tool_executor: Some(tool_executor),
        };

        let result = self.runtime.agents.execute(request).await;
        ctx.set(&node.result_var, result.to_value());
        Ok(Step::none())
    }

    async fn execute_llm_generate(
        &self,
        node: &LlmGenerateNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let namespace = ctx.flatten();
        let prompt = self.runtime.binding.resolve(&node.prompt, &namespace);

        let config = self
            .runtime
            .llm_configs
            .get(&node.llm_id)
            .map(|c| c.value().clone());
        let Some(config) = config else {
            let record = json!({
                "success": false,
                "error": format!("unknown llm configuration '{}'", node.llm_id),
            });
            return match &node.result_var {
                Some(result_var) => {
                    ctx.set(result_var, record);
                    Ok(Step::none())
                }
                None => Err(QuillError::render(
                    "q:llm-generate",
                    format!("unknown llm configuration '{}'", node.llm_id),
                )),
            };
        };

        // Response memoization for `cache="true"`.
        let cache_key = node.cache.then(|| {
            node.cache_key
                .clone()
                .unwrap_or_else(|| format!("{}::{}::{}", config.id, config.model, prompt))
        });
        if let Some(key) = &cache_key {
            if let Some(cached) = self.runtime.llm_response_cache.get(key) {
                let record = cached.value().clone();
                return Ok(self.store_llm_record(node, ctx, record));
            }
        }

        if node.stream {
            // The reference client is non-streaming; the flag is accepted
            // and the full response is returned in one piece.
            tracing::debug!(llm = %config.id, "stream requested, using buffered response");
        }

        let options = ChatOptions {
            model: config.model.clone(),
            provider: Provider::parse(&config.provider),
            endpoint: config
                .options
                .iter()
                .find(|(k, _)| k == "endpoint")
                .map(|(_, v)| v.clone()),
            api_key: config
                .options
                .iter()
                .find(|(k, _)| k == "api_key")
                .map(|(_, v)| v.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            ..ChatOptions::default()
        };

        let mut messages = Vec::new();
        if let Some(system) = &config.system_prompt {
            messages.push(crate::llm::ChatMessage::system(system.clone()));
        }
        messages.push(crate::llm::ChatMessage::user(prompt));

        let record = match self.runtime.chat.chat(&messages, &options).await {
            Ok(response) => response.to_value(),
            Err(e) => json!({ "success": false, "error": e.to_string() }),
        };

        if let Some(key) = cache_key {
            if record["success"] == json!(true) {
                self.runtime.llm_response_cache.insert(key, record.clone());
            }
        }
        Ok(self.store_llm_record(node, ctx, record))
    }

    fn store_llm_record(
        &self,
        node: &LlmGenerateNode,
        ctx: &mut ExecutionContext,
        record: Value,
    ) -> Step {
        match &node.result_var {
            Some(result_var) => {
                ctx.set(result_var, record);
                Step::none()
            }
            None => Step::text(
                record["content"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            ),
        }
    }

    async fn execute_knowledge(
        &self,
        node: &KnowledgeNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        // Query-kind sources read their text from context variables.
        let mut resolved = HashMap::new();
        for source in &node.sources {
            if source.kind == SourceKind::Query {
                if let Some(value) = ctx.get(&source.value) {
                    resolved.insert(source.value.clone(), flatten_query_text(value));
                }
            }
        }

        self.runtime
            .knowledge
            .index_knowledge(node, &resolved)
            .await
            .map_err(QuillError::from)?;
        Ok(Step::none())
    }

    async fn execute_search(
        &self,
        node: &SearchNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        let namespace = ctx.flatten();
        let query = self.runtime.binding.resolve(&node.query, &namespace);

        let record = match self
            .runtime
            .knowledge
            .search(&node.knowledge_id, &query, node.top_k, None)
            .await
        {
            Ok(hits) => {
                let filtered: Vec<Value> = hits
                    .into_iter()
                    .filter(|hit| {
                        node.threshold
                            .map(|threshold| hit.relevance >= threshold)
                            .unwrap_or(true)
                    })
                    .map(|hit| hit.to_value())
                    .collect();
                json!({ "success": true, "results": filtered })
            }
            Err(e) => json!({ "success": false, "error": e.to_string(), "results": [] }),
        };

        match &node.result_var {
            Some(result_var) => {
                ctx.set(result_var, record);
                Ok(Step::none())
            }
            None => Ok(Step::text(record.to_string())),
        }
    }

    async fn execute_persist(
        &self,
        node: &PersistNode,
        ctx: &mut ExecutionContext,
    ) -> Result<Step> {
        for name in &node.names {
            let var = PersistedVar {
                name: name.clone(),
                scope: node.scope,
                key: effective_key(name, None, node.prefix.as_deref()),
                ttl_seconds: node.ttl_seconds,
                encrypt: node.encrypt,
            };
            self.runtime.persistence.register(var);
        }
        // Restore straight away so the variables are live for the rest of
        // this render.
        for (name, restored) in self.runtime.persistence.restore_all().await {
            if node.names.contains(&name) && ctx.get(&name).is_none() {
                ctx.set_component(&name, restored);
            }
        }
        Ok(Step::none())
    }
}

/// Type coercion applied to function-call arguments per the declared param
/// type.
fn coerce_param(value: Value, param_type: ParamType) -> Value {
    match param_type {
        ParamType::Any => value,
        ParamType::String => Value::String(value::display(&value)),
        ParamType::Int => Value::from(value::to_number(&value) as i64),
        ParamType::Float => Value::from(value::to_number(&value)),
        ParamType::Bool => Value::Bool(value::is_truthy(&value)),
        ParamType::List => match value {
            Value::Array(items) => Value::Array(items),
            Value::Null => Value::Array(vec![]),
            other => Value::Array(vec![other]),
        },
        ParamType::Dict => match value {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        },
    }
}

/// Depth-limit a value for `q:dump`; deeper structure collapses to a
/// summary string (also the cycle guard, since depth is finite).
fn truncate_depth(value: &Value, depth: u32) -> Value {
    if depth == 0 {
        return match value {
            Value::Array(items) => Value::String(format!("[… {} items]", items.len())),
            Value::Object(map) => Value::String(format!("{{… {} keys}}", map.len())),
            other => other.clone(),
        };
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| truncate_depth(item, depth - 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_depth(v, depth - 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Size strings for uploads: `10MB`, `512KB`, bare bytes.
fn parse_size(text: &str) -> Option<u64> {
    let lower = text.trim().to_ascii_lowercase();
    let (digits, suffix) = match lower.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => lower.split_at(split),
        None => (lower.as_str(), ""),
    };
    let base: u64 = digits.parse().ok()?;
    let factor = match suffix.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1_024,
        "mb" | "m" => 1_024 * 1_024,
        "gb" | "g" => 1_024 * 1_024 * 1_024,
        _ => return None,
    };
    Some(base * factor)
}

/// Widget rendering flattens the layout attributes back into the attribute
/// list ahead of the verbatim ones.
fn widget_attrs(node: &UiWidgetNode) -> Vec<(String, String)> {
    let layout = &node.layout;
    let mut attrs = Vec::new();
    let pairs: [(&str, &Option<String>); 13] = [
        ("id", &layout.id),
        ("class", &layout.class),
        ("gap", &layout.gap),
        ("padding", &layout.padding),
        ("margin", &layout.margin),
        ("align", &layout.align),
        ("justify", &layout.justify),
        ("width", &layout.width),
        ("height", &layout.height),
        ("background", &layout.background),
        ("color", &layout.color),
        ("border", &layout.border),
        ("visible", &layout.visible),
    ];
    for (name, value) in pairs {
        if let Some(value) = value {
            attrs.push((name.to_string(), value.clone()));
        }
    }
    attrs.extend(node.attributes.iter().cloned());
    attrs
}

/// Knowledge query sources flatten a query-result record into plain text.
fn flatten_query_text(value: &Value) -> String {
    let rows = match value {
        Value::Object(map) => map.get("data").cloned().unwrap_or_else(|| value.clone()),
        other => other.clone(),
    };
    match rows {
        Value::Array(items) => items
            .iter()
            .map(|row| row.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
        other => value::display(&other),
    }
}
