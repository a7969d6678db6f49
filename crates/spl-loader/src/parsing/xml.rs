//! Minimal element tree over quick-xml
//!
//! SPL documents are small enough (tens to hundreds of KB) to hold in memory,
//! and extraction needs "first descendant named X" style lookups, so events
//! are folded into a tree of local-named elements. Namespace prefixes are
//! dropped; every SPL element lives in the HL7 v3 namespace.
//!
//! Nesting is capped at [`MAX_DEPTH`] and every walk over the tree uses an
//! explicit stack, so hostile input cannot exhaust the worker's call stack.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

/// Deepest element nesting accepted; real labels stay well under 100.
pub const MAX_DEPTH: usize = 256;

/// Parsed XML element
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub namespace: Option<String>,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("malformed XML at byte {position}: {message}")]
    Syntax { position: u64, message: String },

    #[error("document has no root element")]
    Empty,

    #[error("unexpected end of document inside <{0}>")]
    Unclosed(String),

    #[error("elements nested deeper than {limit} levels at byte {position}")]
    TooDeep { limit: usize, position: u64 },
}

impl Drop for Element {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut element) = pending.pop() {
            pending.append(&mut element.children);
        }
    }
}

fn local(name: &[u8]) -> String {
    let local = match name.iter().rposition(|b| *b == b':') {
        Some(idx) => &name[idx + 1..],
        None => name,
    };
    String::from_utf8_lossy(local).into_owned()
}

fn open_element(start: &BytesStart<'_>, position: u64) -> Result<Element, XmlError> {
    let mut element = Element {
        name: local(start.name().as_ref()),
        namespace: None,
        attributes: Vec::new(),
        children: Vec::new(),
        text: String::new(),
    };

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Syntax {
            position,
            message: e.to_string(),
        })?;
        let key = attr.key.as_ref();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Syntax {
                position,
                message: e.to_string(),
            })?
            .into_owned();

        if key == b"xmlns" {
            element.namespace = Some(value.clone());
        }
        element.attributes.push((local(key), value));
    }

    Ok(element)
}

/// Parse a complete document into its root element.
///
/// DOCTYPE declarations are skipped and never expanded. Elements nested more
/// than [`MAX_DEPTH`] levels deep fail with [`XmlError::TooDeep`].
pub fn parse_document(xml: &str) -> Result<Element, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader.read_event().map_err(|e| XmlError::Syntax {
            position,
            message: e.to_string(),
        })?;

        if matches!(event, Event::Start(_) | Event::Empty(_)) && stack.len() >= MAX_DEPTH {
            return Err(XmlError::TooDeep {
                limit: MAX_DEPTH,
                position,
            });
        }

        match event {
            Event::Start(ref e) => {
                stack.push(open_element(e, position)?);
            },
            Event::Empty(ref e) => {
                let element = open_element(e, position)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            },
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| XmlError::Syntax {
                    position,
                    message: "closing tag without matching open tag".to_string(),
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            },
            Event::Text(ref t) => {
                if let Some(current) = stack.last_mut() {
                    let text = t.unescape().map_err(|e| XmlError::Syntax {
                        position,
                        message: e.to_string(),
                    })?;
                    append_text(&mut current.text, &text);
                }
            },
            Event::CData(ref c) => {
                if let Some(current) = stack.last_mut() {
                    append_text(&mut current.text, &String::from_utf8_lossy(&**c));
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    if let Some(mut open) = stack.pop() {
        return Err(XmlError::Unclosed(std::mem::take(&mut open.name)));
    }

    root.ok_or(XmlError::Empty)
}

fn append_text(buffer: &mut String, text: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(text);
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Text content, `None` when empty
    pub fn text(&self) -> Option<&str> {
        if self.text.is_empty() {
            None
        } else {
            Some(self.text.as_str())
        }
    }

    /// Direct children with the given local name
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Follow a `/`-separated path of direct children
    pub fn path(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .try_fold(self, |current, segment| current.child(segment))
    }

    /// Descendants in document order, excluding self
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            pending: self.children.iter().rev().collect(),
        }
    }

    /// First descendant (document order, excluding self) with the given name
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.descendants().find(|e| e.name == name)
    }

    /// All descendants (document order, excluding self) with the given name
    pub fn find_all<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        self.descendants().filter(|e| e.name == name).collect()
    }

    fn is_leaf(&self) -> bool {
        self.attributes.is_empty() && self.children.is_empty()
    }

    fn leaf_value(&self) -> Value {
        self.text()
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null)
    }

    /// Structural JSON re-encoding: attributes become `@name`, text becomes
    /// `#text`, repeated child names collapse into arrays and an element with
    /// neither attributes nor children is its text (or null).
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        root.insert(self.name.clone(), self.json_body());
        Value::Object(root)
    }

    fn json_body(&self) -> Value {
        if self.is_leaf() {
            return self.leaf_value();
        }

        let mut stack = vec![JsonFrame::open(self)];
        while let Some(frame) = stack.last_mut() {
            let element = frame.element;
            if let Some(child) = element.children.get(frame.next) {
                frame.next += 1;
                if child.is_leaf() {
                    insert_child(&mut frame.body, &child.name, child.leaf_value());
                } else {
                    stack.push(JsonFrame::open(child));
                }
                continue;
            }

            let value = match stack.pop() {
                Some(done) => done.close(),
                None => break,
            };
            match stack.last_mut() {
                Some(parent) => insert_child(&mut parent.body, &element.name, value),
                None => return value,
            }
        }

        Value::Null
    }
}

/// Pre-order walk over an element's subtree
pub struct Descendants<'a> {
    pending: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let element = self.pending.pop()?;
        self.pending.extend(element.children.iter().rev());
        Some(element)
    }
}

/// An element whose JSON object is being filled in
struct JsonFrame<'a> {
    element: &'a Element,
    next: usize,
    body: Map<String, Value>,
}

impl<'a> JsonFrame<'a> {
    fn open(element: &'a Element) -> Self {
        let mut body = Map::new();
        for (key, value) in &element.attributes {
            body.insert(format!("@{}", key), Value::String(value.clone()));
        }
        Self {
            element,
            next: 0,
            body,
        }
    }

    fn close(mut self) -> Value {
        if let Some(text) = self.element.text() {
            self.body
                .insert("#text".to_string(), Value::String(text.to_string()));
        }
        Value::Object(self.body)
    }
}

fn insert_child(body: &mut Map<String, Value>, name: &str, value: Value) {
    match body.get_mut(name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
        None => {
            body.insert(name.to_string(), value);
        },
    }
}
