//! Sub-parser for the `qt:` terminal widget namespace.
//!
//! The one special case: `q:function` bodies nested under terminal widgets
//! preserve raw text lines interleaved with statement children as `RawCode`
//! nodes, so template-level text keeps its ordering relative to embedded
//! tags.

use super::{Content, QuillParser, XmlChild, XmlElement};
use crate::ast::{DatasourceNode, Node, TerminalWidgetNode, TERMINAL_TAGS};
use crate::error::{QuillError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn parse_terminal_element(
    parser: &QuillParser,
    el: &XmlElement,
    datasources: &Arc<BTreeMap<String, DatasourceNode>>,
) -> Result<Node> {
    let local = el.local_name();
    if !TERMINAL_TAGS.contains(&local) {
        return Err(QuillError::parse(format!("unknown tag <qt:{}>", local)));
    }

    let mut children = Vec::new();
    for child in &el.children {
        match child {
            XmlChild::Element(element)
                if element.prefix() == "q" && element.local_name() == "function" =>
            {
                children.push(Node::Function(parser.parse_function(
                    element,
                    datasources,
                    true,
                )?));
            }
            XmlChild::Element(element) => {
                if let Some(node) =
                    parser.parse_statement(element, datasources, Content::Mixed)?
                {
                    children.push(node);
                }
            }
            XmlChild::Text(text) => {
                if !text.trim().is_empty() {
                    children.push(Node::Text(crate::ast::TextNode {
                        content: text.clone(),
                    }));
                }
            }
        }
    }

    Ok(Node::TerminalWidget(TerminalWidgetNode {
        widget: local.to_string(),
        attributes: el.attributes.clone(),
        children,
    }))
}
