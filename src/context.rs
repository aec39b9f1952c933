//! # Execution Context
//!
//! Scoped variable store driving one component render.
//!
//! A context is a stack of frames (component → function → loop). Lookup
//! walks frames nearest-first; assignment targets the current frame unless
//! `scope="component"` forces the root. Functions registered during the walk
//! live on the context until it is dropped. Contexts are never shared
//! between concurrent executions, so no locking happens here.

use crate::ast::{FunctionNode, ParamNode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// What kind of frame sits on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Component,
    Function,
    Loop,
}

#[derive(Debug)]
struct Frame {
    kind: ScopeKind,
    vars: HashMap<String, Value>,
}

/// A registered function: parameters, body, and the name it answers to.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub params: Vec<ParamNode>,
    pub node: Arc<FunctionNode>,
}

/// The scoped variable store for one execution.
pub struct ExecutionContext {
    frames: Vec<Frame>,
    functions: HashMap<String, Arc<FunctionDescriptor>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create a context with an empty component frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame {
                kind: ScopeKind::Component,
                vars: HashMap::new(),
            }],
            functions: HashMap::new(),
        }
    }

    /// Create a context seeded with initial variables (query params,
    /// restored persisted state, message payloads).
    pub fn with_vars(vars: HashMap<String, Value>) -> Self {
        let mut context = Self::new();
        context.frames[0].vars = vars;
        context
    }

    /// Push a new frame. Loop and function bodies each get their own.
    pub fn push_frame(&mut self, kind: ScopeKind) {
        self.frames.push(Frame {
            kind,
            vars: HashMap::new(),
        });
    }

    /// Pop the top frame. Popping the component frame is a programmer error.
    pub fn pop_frame(&mut self) {
        assert!(
            self.frames.len() > 1,
            "pop_frame on the component frame: push/pop must be balanced"
        );
        self.frames.pop();
    }

    /// Current stack depth (component frame included).
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Nearest-frame-first lookup. Absent names return `None`, not an error;
    /// expressions raise `UndefinedName` themselves when they need to.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|f| f.vars.get(name))
    }

    /// Write to the frame that already owns `name`, falling back to the
    /// current frame for new variables.
    pub fn set(&mut self, name: &str, value: Value) {
        for frame in self.frames.iter_mut().rev() {
            if frame.vars.contains_key(name) {
                frame.vars.insert(name.to_string(), value);
                return;
            }
        }
        if let Some(top) = self.frames.last_mut() {
            top.vars.insert(name.to_string(), value);
        }
    }

    /// Write into the current frame unconditionally (loop variables shadow
    /// outer names for the body's duration).
    pub fn set_local(&mut self, name: &str, value: Value) {
        if let Some(top) = self.frames.last_mut() {
            top.vars.insert(name.to_string(), value);
        }
    }

    /// Write into the component (root) frame regardless of stack depth.
    pub fn set_component(&mut self, name: &str, value: Value) {
        self.frames[0].vars.insert(name.to_string(), value);
    }

    /// Register a function descriptor. Stays visible until context end.
    pub fn register_function(&mut self, node: Arc<FunctionNode>) {
        let descriptor = FunctionDescriptor {
            name: node.name.clone(),
            params: node.params.clone(),
            node,
        };
        self.functions
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn lookup_function(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.functions.get(name).cloned()
    }

    /// Push a loop frame exposing `var`, `var_index`, and `var_count`.
    pub fn push_loop_frame(&mut self, var: &str, item: Value, index: usize) {
        self.push_frame(ScopeKind::Loop);
        self.set_local(var, item);
        self.set_local(&format!("{}_index", var), Value::from(index as i64));
        self.set_local(&format!("{}_count", var), Value::from(index as i64 + 1));
    }

    /// Flatten the stack into one namespace for expression evaluation.
    /// Inner frames shadow outer ones.
    pub fn flatten(&self) -> HashMap<String, Value> {
        let mut namespace = HashMap::new();
        for frame in &self.frames {
            for (k, v) in &frame.vars {
                namespace.insert(k.clone(), v.clone());
            }
        }
        namespace
    }

    /// The kind of the current frame.
    pub fn current_scope(&self) -> ScopeKind {
        self.frames.last().map(|f| f.kind).unwrap_or(ScopeKind::Component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_nearest_frame_lookup() {
        let mut ctx = ExecutionContext::new();
        ctx.set("x", json!(1));
        ctx.push_frame(ScopeKind::Loop);
        ctx.set_local("x", json!(2));
        assert_eq!(ctx.get("x"), Some(&json!(2)));
        ctx.pop_frame();
        assert_eq!(ctx.get("x"), Some(&json!(1)));
    }

    #[test]
    fn test_set_targets_owning_frame() {
        let mut ctx = ExecutionContext::new();
        ctx.set("counter", json!(0));
        ctx.push_frame(ScopeKind::Loop);
        // `set` finds the component frame that owns `counter`.
        ctx.set("counter", json!(5));
        ctx.pop_frame();
        assert_eq!(ctx.get("counter"), Some(&json!(5)));
    }

    #[test]
    fn test_frame_locals_invisible_after_pop() {
        let mut ctx = ExecutionContext::new();
        ctx.push_frame(ScopeKind::Function);
        ctx.set_local("temp", json!("inner"));
        assert_eq!(ctx.get("temp"), Some(&json!("inner")));
        ctx.pop_frame();
        assert_eq!(ctx.get("temp"), None);
    }

    #[test]
    fn test_component_scope_write_from_nested_frame() {
        let mut ctx = ExecutionContext::new();
        ctx.push_frame(ScopeKind::Function);
        ctx.push_frame(ScopeKind::Loop);
        ctx.set_component("shared", json!(42));
        ctx.pop_frame();
        ctx.pop_frame();
        assert_eq!(ctx.get("shared"), Some(&json!(42)));
    }

    #[test]
    fn test_loop_frame_exposes_index_and_count() {
        let mut ctx = ExecutionContext::new();
        ctx.push_loop_frame("u", json!({"name": "A"}), 3);
        assert_eq!(ctx.get("u_index"), Some(&json!(3)));
        assert_eq!(ctx.get("u_count"), Some(&json!(4)));
        assert_eq!(ctx.current_scope(), ScopeKind::Loop);
    }

    #[test]
    fn test_flatten_shadows_outer_frames() {
        let mut ctx = ExecutionContext::new();
        ctx.set("x", json!(1));
        ctx.set("y", json!("outer"));
        ctx.push_frame(ScopeKind::Loop);
        ctx.set_local("y", json!("inner"));
        let ns = ctx.flatten();
        assert_eq!(ns["x"], json!(1));
        assert_eq!(ns["y"], json!("inner"));
    }

    #[test]
    #[should_panic(expected = "pop_frame on the component frame")]
    fn test_unbalanced_pop_panics() {
        let mut ctx = ExecutionContext::new();
        ctx.pop_frame();
    }

    #[test]
    fn test_function_registry() {
        use crate::ast::FunctionNode;
        let mut ctx = ExecutionContext::new();
        ctx.register_function(Arc::new(FunctionNode {
            name: "greet".into(),
            params: vec![],
            body: vec![],
            rest: false,
            rest_path: None,
        }));
        assert!(ctx.lookup_function("greet").is_some());
        assert!(ctx.lookup_function("missing").is_none());
    }
}
