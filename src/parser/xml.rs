//! Minimal DOM built from quick-xml events.
//!
//! The statement parsers need ordered access to child elements and
//! interleaved text (mixed content in `qt:` function bodies, mail bodies),
//! so the event stream is materialized into a lightweight element tree
//! first. Line/column positions are resolved from byte offsets for error
//! reporting.

use crate::error::{QuillError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

/// One XML element with its ordered children.
#[derive(Debug, Clone)]
pub struct XmlElement {
    /// Prefixed name as written (`q:set`, `ui:panel`, `p`).
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlChild>,
}

/// Element content in document order.
#[derive(Debug, Clone)]
pub enum XmlChild {
    Element(XmlElement),
    Text(String),
}

impl XmlElement {
    /// The namespace prefix (empty for plain HTML tags).
    pub fn prefix(&self) -> &str {
        match self.name.split_once(':') {
            Some((prefix, _)) => prefix,
            None => "",
        }
    }

    /// The local name without prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// Attribute lookup.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Required attribute, defaulting to empty so the node's `validate()`
    /// reports the omission instead of aborting the parse.
    pub fn attr_or_empty(&self, name: &str) -> String {
        self.attr(name).unwrap_or_default().to_string()
    }

    pub fn attr_bool(&self, name: &str, default: bool) -> bool {
        match self.attr(name) {
            Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn attr_u32(&self, name: &str) -> Option<u32> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn attr_usize(&self, name: &str) -> Option<usize> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn attr_i32(&self, name: &str) -> Option<i32> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    pub fn attr_f64(&self, name: &str) -> Option<f64> {
        self.attr(name).and_then(|v| v.trim().parse().ok())
    }

    /// Child elements only, in order.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlChild::Element(e) => Some(e),
            XmlChild::Text(_) => None,
        })
    }

    /// First child element with the given (prefixed) name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenated text content of direct text children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlChild::Text(text) = child {
                out.push_str(text);
            }
        }
        out
    }
}

/// Parse an XML document or fragment into an element tree.
pub fn build_dom(input: &str) -> Result<XmlElement> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let position = reader.buffer_position();
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let element = element_from_start(&start, input, position as usize)?;
                stack.push(element);
            }
            Ok(Event::Empty(start)) => {
                let element = element_from_start(&start, input, position as usize)?;
                attach(&mut stack, &mut root, element, input, position as usize)?;
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or_else(|| {
                    parse_error("unexpected closing tag", input, position as usize)
                })?;
                attach(&mut stack, &mut root, element, input, position as usize)?;
            }
            Ok(Event::Text(text)) => {
                let content = text
                    .unescape()
                    .map_err(|e| parse_error(e.to_string(), input, position as usize))?
                    .into_owned();
                if let Some(parent) = stack.last_mut() {
                    if !content.trim().is_empty() {
                        parent.children.push(XmlChild::Text(content));
                    }
                }
            }
            Ok(Event::CData(data)) => {
                let content = String::from_utf8_lossy(&data).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlChild::Text(content));
                }
            }
            Ok(Event::Comment(_)) | Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(parse_error(e.to_string(), input, position as usize));
            }
        }
    }

    if !stack.is_empty() {
        return Err(QuillError::parse(format!(
            "unclosed element <{}>",
            stack.last().map(|e| e.name.as_str()).unwrap_or("?")
        )));
    }

    root.ok_or_else(|| QuillError::parse("document has no root element"))
}

fn element_from_start(
    start: &quick_xml::events::BytesStart<'_>,
    input: &str,
    position: usize,
) -> Result<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| parse_error(e.to_string(), input, position))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| parse_error(e.to_string(), input, position))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
    input: &str,
    position: usize,
) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlChild::Element(element));
        return Ok(());
    }
    if root.is_some() {
        return Err(parse_error(
            "multiple root elements in document",
            input,
            position,
        ));
    }
    *root = Some(element);
    Ok(())
}

/// Resolve a byte offset into a 1-based line/column pair.
pub fn parse_error(message: impl Into<String>, input: &str, offset: usize) -> QuillError {
    let clamped = offset.min(input.len());
    let prefix = &input[..clamped];
    let line = prefix.bytes().filter(|b| *b == b'\n').count() as u64 + 1;
    let column = prefix
        .rsplit_once('\n')
        .map(|(_, tail)| tail.len())
        .unwrap_or(prefix.len()) as u64
        + 1;
    QuillError::parse_at(message, line, column)
}
