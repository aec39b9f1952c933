//! Sub-parser for the `ui:` multi-target widget namespace.
//!
//! Widgets share a common layout attribute set; everything else is kept
//! verbatim on the node. Children recurse through the root parser so `q:`
//! statements nest freely inside widget trees.

use super::{Content, QuillParser, XmlElement};
use crate::ast::{DatasourceNode, LayoutAttrs, Node, UiWidgetNode, UI_TAGS};
use crate::error::{QuillError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn parse_ui_element(
    parser: &QuillParser,
    el: &XmlElement,
    datasources: &Arc<BTreeMap<String, DatasourceNode>>,
) -> Result<Node> {
    let local = el.local_name();
    if !UI_TAGS.contains(&local) {
        return Err(QuillError::parse(format!("unknown tag <ui:{}>", local)));
    }

    let (layout, attributes) = LayoutAttrs::extract(el.attributes.clone());
    let children = parser.parse_children(el, datasources, Content::Mixed)?;

    Ok(Node::UiWidget(UiWidgetNode {
        widget: local.to_string(),
        layout,
        attributes,
        children,
    }))
}

#[cfg(test)]
mod tests {
    use crate::ast::{Document, Node};
    use crate::parser::QuillParser;

    #[test]
    fn test_ui_panel_with_layout_and_nested_statement() {
        let doc = QuillParser::new()
            .parse(
                r#"<q:component name="C">
                    <ui:panel padding="8" title="Users">
                        <q:set name="x" value="1" />
                        <ui:text value="{x}" />
                    </ui:panel>
                </q:component>"#,
            )
            .unwrap();
        let statements = match doc {
            Document::Component(c) => c.statements,
            _ => panic!("expected component"),
        };
        match &statements[0] {
            Node::UiWidget(panel) => {
                assert_eq!(panel.widget, "panel");
                assert_eq!(panel.layout.padding.as_deref(), Some("8"));
                // `title` is not a layout attribute and stays verbatim.
                assert!(panel.attributes.iter().any(|(k, _)| k == "title"));
                assert!(matches!(&panel.children[0], Node::Set(_)));
                assert!(matches!(&panel.children[1], Node::UiWidget(w) if w.widget == "text"));
            }
            other => panic!("expected ui widget, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_ui_tag_rejected() {
        let err = QuillParser::new()
            .parse(r#"<q:component name="C"><ui:blink /></q:component>"#)
            .unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }
}
