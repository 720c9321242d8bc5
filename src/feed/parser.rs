use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::document::{Fields, Node, ATTRIBUTES_KEY, VALUE_KEY};

/// Nesting limit for parsed documents; feeds are shallow.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("Document has no root element")]
    Empty,
    #[error("Unexpected end of document inside <{0}>")]
    Unclosed(String),
    #[error("Document nesting exceeds {MAX_DEPTH} levels")]
    TooDeep,
}

/// A parsed XML document: root element name plus its tree.
#[derive(Debug, Clone)]
pub struct Document {
    pub root_name: String,
    pub root: Node,
}

impl Document {
    /// The feed's entries: RSS `channel.item`, RDF `item`, or Atom `entry`.
    ///
    /// Unknown document shapes yield no entries rather than an error.
    pub fn entries(&self) -> &[Node] {
        let container = self.root.get("channel").unwrap_or(&self.root);
        let items = container.get_all("item");
        if !items.is_empty() {
            return items;
        }
        let items = self.root.get_all("item");
        if !items.is_empty() {
            return items;
        }
        self.root.get_all("entry")
    }
}

struct Frame {
    name: String,
    attributes: Fields,
    children: Fields,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self, ParseError> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Fields::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            attributes.push(key, Node::Text(value));
        }
        Ok(Self {
            name,
            attributes,
            children: Fields::new(),
            text: String::new(),
        })
    }

    fn close(self) -> (String, Node) {
        let text = self.text.trim().to_string();
        if self.attributes.is_empty() && self.children.is_empty() {
            return (self.name, Node::Text(text));
        }

        let mut fields = Fields::new();
        if !text.is_empty() {
            fields.push(VALUE_KEY.to_string(), Node::Text(text));
        }
        if !self.attributes.is_empty() {
            fields.push(ATTRIBUTES_KEY.to_string(), Node::Map(self.attributes));
        }
        for (name, child) in self.children {
            fields.push(name, child);
        }
        (self.name, Node::Map(fields))
    }
}

/// Parse XML bytes into a [`Document`].
///
/// Entity references that the XML reader cannot resolve (HTML entities in
/// sloppy feeds) are kept verbatim rather than failing the whole document.
pub fn parse_document(bytes: &[u8]) -> Result<Document, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<(String, Node)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(ParseError::TooDeep);
                }
                stack.push(Frame::open(&start)?);
            }
            Event::Empty(start) => {
                let (name, node) = Frame::open(&start)?.close();
                attach(&mut stack, &mut root, name, node);
            }
            Event::End(_) => {
                if let Some(frame) = stack.pop() {
                    let (name, node) = frame.close();
                    attach(&mut stack, &mut root, name, node);
                }
            }
            Event::Text(text) => {
                if let Some(frame) = stack.last_mut() {
                    match text.unescape() {
                        Ok(t) => frame.text.push_str(&t),
                        Err(_) => frame.text.push_str(&String::from_utf8_lossy(&text)),
                    }
                }
            }
            Event::CData(data) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(frame) = stack.pop() {
        return Err(ParseError::Unclosed(frame.name));
    }

    let (root_name, root) = root.ok_or(ParseError::Empty)?;
    Ok(Document { root_name, root })
}

fn attach(stack: &mut [Frame], root: &mut Option<(String, Node)>, name: String, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(name, node),
        None => {
            if root.is_none() {
                *root = Some((name, node));
            }
        }
    }
}
