//! Namespaced widget nodes for the `ui:`, `qt:`, and `qg:` sub-namespaces.
//!
//! Each namespace keeps a closed tag set; unknown local names within a known
//! namespace are parse errors. Widget nodes carry their layout attributes
//! plus a child list and may nest `q:` statements (a `q:set` inside a
//! `ui:panel` is legal).

use super::Node;
use serde::Serialize;

/// Multi-target UI tags (`ui:`).
pub const UI_TAGS: &[&str] = &[
    "window", "hbox", "vbox", "panel", "tabpanel", "tab", "grid", "accordion", "section",
    "dividedbox", "form", "formitem", "spacer", "scrollbox", "text", "button", "input",
    "checkbox", "radio", "switch", "select", "table", "column", "list", "item", "image", "link",
    "progress", "tree", "menu", "option", "log", "markdown", "header", "footer", "rule",
    "loading", "badge",
];

/// Terminal widget tags (`qt:`).
pub const TERMINAL_TAGS: &[&str] = &[
    "screen", "panel", "layout", "table", "column", "input", "button", "menu", "option", "text",
    "progress", "tree", "tabs", "tab", "log", "header", "footer", "status", "keybinding",
    "timer", "service", "css", "on",
];

/// 2D game engine tags (`qg:`).
pub const GAME_TAGS: &[&str] = &[
    "scene", "sprite", "physics", "camera", "behavior", "prefab", "sound", "text", "tilemap",
    "particle", "collider", "input", "timer", "spawn",
];

/// Common layout attributes shared by UI widgets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LayoutAttrs {
    pub gap: Option<String>,
    pub padding: Option<String>,
    pub margin: Option<String>,
    pub align: Option<String>,
    pub justify: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub background: Option<String>,
    pub color: Option<String>,
    pub border: Option<String>,
    pub id: Option<String>,
    pub class: Option<String>,
    pub visible: Option<String>,
}

impl LayoutAttrs {
    /// Pull the layout attributes out of a raw attribute list, returning the
    /// remainder untouched.
    pub fn extract(attributes: Vec<(String, String)>) -> (Self, Vec<(String, String)>) {
        let mut layout = LayoutAttrs::default();
        let mut rest = Vec::new();
        for (key, value) in attributes {
            match key.as_str() {
                "gap" => layout.gap = Some(value),
                "padding" => layout.padding = Some(value),
                "margin" => layout.margin = Some(value),
                "align" => layout.align = Some(value),
                "justify" => layout.justify = Some(value),
                "width" => layout.width = Some(value),
                "height" => layout.height = Some(value),
                "background" => layout.background = Some(value),
                "color" => layout.color = Some(value),
                "border" => layout.border = Some(value),
                "id" => layout.id = Some(value),
                "class" => layout.class = Some(value),
                "visible" => layout.visible = Some(value),
                _ => rest.push((key, value)),
            }
        }
        (layout, rest)
    }
}

/// A `ui:` widget element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiWidgetNode {
    pub widget: String,
    pub layout: LayoutAttrs,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl UiWidgetNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !UI_TAGS.contains(&self.widget.as_str()) {
            errors.push(format!("unknown ui: widget '{}'", self.widget));
        }
        errors
    }
}

/// A `qt:` terminal widget element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalWidgetNode {
    pub widget: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl TerminalWidgetNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !TERMINAL_TAGS.contains(&self.widget.as_str()) {
            errors.push(format!("unknown qt: widget '{}'", self.widget));
        }
        errors
    }
}

/// A `qg:` game element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameWidgetNode {
    pub widget: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl GameWidgetNode {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !GAME_TAGS.contains(&self.widget.as_str()) {
            errors.push(format!("unknown qg: widget '{}'", self.widget));
        }
        errors
    }
}

/// Raw interleaved text inside a `qt:` function body. Preserves the ordering
/// of template-level text relative to embedded statement tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawCodeNode {
    pub code: String,
}

impl RawCodeNode {
    pub fn validate(&self) -> Vec<String> {
        Vec::new()
    }
}
