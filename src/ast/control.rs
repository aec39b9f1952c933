//! Control-flow and structural nodes: HTML/text output, variables,
//! conditionals, loops, functions.

use super::Node;
use crate::persist::PersistScope;
use serde::Serialize;

/// A plain HTML element with databinding-capable attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HtmlNode {
    pub tag: String,
    /// Attribute order is preserved for deterministic output.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl HtmlNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.tag.is_empty() {
            errors.push("html element requires a tag name".into());
        }
        errors
    }
}

/// Raw text content; `{expr}` databinding applies at render time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextNode {
    pub content: String,
}

impl TextNode {
    pub fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Operation applied by `q:set` against the existing variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetOperation {
    Assign,
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl SetOperation {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "assign" => Some(SetOperation::Assign),
            "add" => Some(SetOperation::Add),
            "subtract" => Some(SetOperation::Subtract),
            "multiply" => Some(SetOperation::Multiply),
            "divide" => Some(SetOperation::Divide),
            _ => None,
        }
    }
}

/// Variable scope override on `q:set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    Auto,
    Component,
}

/// `<q:set name="x" value="{x + 1}" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetNode {
    pub name: String,
    pub value: Option<String>,
    pub operation: SetOperation,
    pub scope: VarScope,
    /// Persistence scope; when present the interpreter mirrors the new value
    /// to the external storage adapter.
    pub persist: Option<PersistScope>,
    pub persist_key: Option<String>,
    pub persist_ttl_seconds: Option<u64>,
    pub persist_encrypt: bool,
}

impl SetNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:set requires a 'name' attribute".into());
        }
        if self.persist.is_none()
            && (self.persist_key.is_some() || self.persist_ttl_seconds.is_some())
        {
            errors.push("persist_key/persist_ttl require a 'persist' scope".into());
        }
        errors
    }
}

/// One `q:elseif` branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElseIfBranch {
    pub condition: String,
    pub body: Vec<Node>,
}

/// `<q:if condition="...">...<q:elseif/>...<q:else/>...</q:if>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IfNode {
    pub condition: String,
    pub body: Vec<Node>,
    pub elseifs: Vec<ElseIfBranch>,
    pub else_body: Vec<Node>,
}

impl IfNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.condition.trim().is_empty() {
            errors.push("q:if requires a 'condition' attribute".into());
        }
        for branch in &self.elseifs {
            if branch.condition.trim().is_empty() {
                errors.push("q:elseif requires a 'condition' attribute".into());
            }
        }
        errors
    }
}

/// Whether a loop iterates a numeric range or an array value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopKind {
    Range,
    Array,
}

/// `<q:loop from="1" to="10" var="i">` or `<q:loop items="{rows}" var="r">`.
///
/// Range loops iterate the inclusive end. Array loops expose `var`,
/// `var_index`, and `var_count` inside the body frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopNode {
    pub kind: LoopKind,
    pub var: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub step: Option<String>,
    pub items: Option<String>,
    pub body: Vec<Node>,
}

impl LoopNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.var.is_empty() {
            errors.push("q:loop requires a 'var' attribute".into());
        }
        match self.kind {
            LoopKind::Range => {
                if self.to.is_none() {
                    errors.push("range q:loop requires a 'to' attribute".into());
                }
            }
            LoopKind::Array => {
                if self.items.is_none() {
                    errors.push("array q:loop requires an 'items' attribute".into());
                }
            }
        }
        errors
    }
}

/// Declared parameter type on `q:param`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Any,
}

impl ParamType {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "string" | "str" => Some(ParamType::String),
            "int" | "integer" => Some(ParamType::Int),
            "float" | "number" => Some(ParamType::Float),
            "bool" | "boolean" => Some(ParamType::Bool),
            "list" | "array" => Some(ParamType::List),
            "dict" | "object" => Some(ParamType::Dict),
            "any" => Some(ParamType::Any),
            _ => None,
        }
    }
}

/// `<q:param name="limit" type="int" default="10" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamNode {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<String>,
}

impl ParamNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:param requires a 'name' attribute".into());
        }
        if self.required && self.default.is_some() {
            errors.push(format!(
                "param '{}' cannot be required and carry a default",
                self.name
            ));
        }
        errors
    }
}

/// `<q:function name="f">` - registered at execution walk, contributes no
/// output. `rest` exposes the function over the REST generator collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionNode {
    pub name: String,
    pub params: Vec<ParamNode>,
    pub body: Vec<Node>,
    pub rest: bool,
    pub rest_path: Option<String>,
}

impl FunctionNode {
    pub fn is_rest_enabled(&self) -> bool {
        self.rest
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("q:function requires a 'name' attribute".into());
        }
        let mut seen = std::collections::HashSet::new();
        for param in &self.params {
            errors.extend(param.validate());
            if !seen.insert(param.name.as_str()) {
                errors.push(format!("duplicate param '{}'", param.name));
            }
        }
        errors
    }
}

/// `<q:call function="f" result="r"><q:arg name="x" value="1"/></q:call>`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionCallNode {
    pub function: String,
    /// Argument name → expression text, in declaration order.
    pub args: Vec<(String, String)>,
    pub result_var: Option<String>,
}

impl FunctionCallNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.function.is_empty() {
            errors.push("q:call requires a 'function' attribute".into());
        }
        errors
    }
}

/// `<q:return value="{total}" />`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReturnNode {
    pub value: Option<String>,
}

impl ReturnNode {
    pub fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}
