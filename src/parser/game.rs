//! Sub-parser for the `qg:` 2D game namespace.

use super::{Content, QuillParser, XmlElement};
use crate::ast::{DatasourceNode, GameWidgetNode, Node, GAME_TAGS};
use crate::error::{QuillError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub(crate) fn parse_game_element(
    parser: &QuillParser,
    el: &XmlElement,
    datasources: &Arc<BTreeMap<String, DatasourceNode>>,
) -> Result<Node> {
    let local = el.local_name();
    if !GAME_TAGS.contains(&local) {
        return Err(QuillError::parse(format!("unknown tag <qg:{}>", local)));
    }

    Ok(Node::GameWidget(GameWidgetNode {
        widget: local.to_string(),
        attributes: el.attributes.clone(),
        children: parser.parse_children(el, datasources, Content::Statements)?,
    }))
}

#[cfg(test)]
mod tests {
    use crate::ast::{Document, Node};
    use crate::parser::QuillParser;

    #[test]
    fn test_scene_children_keep_order() {
        let doc = QuillParser::new()
            .parse(
                r#"<q:application id="g" type="game">
                    <qg:scene name="main" width="800" height="600">
                        <qg:physics gravity-y="9.8" bounds="canvas" />
                        <qg:sprite id="player" src="p.png" x="100" y="200" body="dynamic" />
                        <qg:camera follow="player" lerp="0.1" />
                    </qg:scene>
                </q:application>"#,
            )
            .unwrap();
        let app = match doc {
            Document::Application(app) => app,
            _ => panic!("expected application"),
        };
        match &app.scenes[0] {
            Node::GameWidget(scene) => {
                assert_eq!(scene.widget, "scene");
                let kinds: Vec<&str> = scene
                    .children
                    .iter()
                    .map(|c| match c {
                        Node::GameWidget(w) => w.widget.as_str(),
                        _ => "?",
                    })
                    .collect();
                assert_eq!(kinds, vec!["physics", "sprite", "camera"]);
            }
            other => panic!("expected scene, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_game_tag_rejected() {
        let err = QuillParser::new()
            .parse(r#"<q:component name="C"><qg:warp /></q:component>"#)
            .unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }
}
