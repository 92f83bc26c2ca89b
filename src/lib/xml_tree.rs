//! Minimal mutable XML tree used to merge tuning settings into a domain definition.
//!
//! The tree is read with quick-xml's pull parser. Anything the merge never touches
//! is written back verbatim: the prolog and epilog around the root element, text,
//! comments and the raw start tag of every element whose attributes were not modified.

use quick_xml::escape::{partial_escape, unescape};
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),
    #[error("XML document is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("XML write error: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    /// Character data, kept escaped exactly as read.
    Text(String),
    /// Content of a CDATA section, without the delimiters.
    CData(String),
    /// Comments and processing instructions.
    Markup(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
    // original start tag content, dropped as soon as an attribute changes
    raw_start: Option<String>,
    self_closing: bool,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Element {
        Element {
            tag: tag.into(),
            attributes: vec![],
            children: vec![],
            raw_start: None,
            self_closing: true,
        }
    }

    fn from_start(start: &BytesStart<'_>, self_closing: bool) -> Result<Element, XmlError> {
        let tag = std::str::from_utf8(start.name().as_ref())?.to_string();
        let mut attributes = vec![];
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Parse(format!("in <{tag}>: {e}")))?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| XmlError::Parse(format!("in <{tag}> attribute {key}: {e}")))?
                .into_owned();
            attributes.push((key, value));
        }
        let raw_start = std::str::from_utf8(start)?.to_string();
        Ok(Element {
            tag,
            attributes,
            children: vec![],
            raw_start: Some(raw_start),
            self_closing,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Sets or replaces an attribute. Writing the value already present is a no-op.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| key == name) {
            Some((_, current)) if *current == value => return,
            Some((_, current)) => *current = value,
            None => self.attributes.push((name.to_string(), value)),
        }
        self.raw_start = None;
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(key, _)| key == name)?;
        self.raw_start = None;
        Some(self.attributes.remove(index).1)
    }

    fn leading_len(&self) -> usize {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(_)))
            .unwrap_or(self.children.len())
    }

    /// Unescaped character data placed before the first child element, if any.
    /// Text and CDATA sections are joined, comments in between are skipped.
    pub fn text(&self) -> Option<String> {
        let mut text: Option<String> = None;
        for node in &self.children[..self.leading_len()] {
            let part = match node {
                Node::Text(raw) => match unescape(raw) {
                    Ok(unescaped) => unescaped.into_owned(),
                    Err(_) => raw.clone(),
                },
                Node::CData(data) => data.clone(),
                _ => continue,
            };
            text.get_or_insert_with(String::new).push_str(&part);
        }
        text
    }

    /// Replaces all character data before the first child element with `text`.
    /// Comments stay in place after the new text, child elements are left alone.
    pub fn set_text(&mut self, text: &str) {
        let leading = self.leading_len();
        let mut index = 0;
        self.children.retain(|node| {
            index += 1;
            index > leading || !matches!(node, Node::Text(_) | Node::CData(_))
        });
        self.children
            .insert(0, Node::Text(partial_escape(text).into_owned()));
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Appends `child` after every existing child node and returns it.
    pub fn push_child(&mut self, child: Element) -> &mut Element {
        self.children.push(Node::Element(child));
        let index = self.children.len() - 1;
        match self.child_at_mut(index) {
            Some(child) => child,
            None => unreachable!("the node just pushed is an element"),
        }
    }

    /// Removes the first child element named `tag` along with the indentation
    /// right before it.
    pub fn remove_child(&mut self, tag: &str) -> Option<Element> {
        let mut index = self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(element) if element.tag == tag))?;
        if index > 0 {
            if let Node::Text(raw) = &self.children[index - 1] {
                if raw.trim().is_empty() {
                    self.children.remove(index - 1);
                    index -= 1;
                }
            }
        }
        match self.children.remove(index) {
            Node::Element(element) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn child_at(&self, index: usize) -> Option<&Element> {
        match self.children.get(index) {
            Some(Node::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub(crate) fn child_at_mut(&mut self, index: usize) -> Option<&mut Element> {
        match self.children.get_mut(index) {
            Some(Node::Element(element)) => Some(element),
            _ => None,
        }
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), XmlError> {
        let start = match &self.raw_start {
            Some(raw) => BytesStart::from_content(raw.as_str(), self.tag.len()),
            None => {
                let mut start = BytesStart::new(self.tag.as_str());
                for (key, value) in &self.attributes {
                    start.push_attribute((key.as_str(), value.as_str()));
                }
                start
            }
        };
        if self.children.is_empty() && self.self_closing {
            return write_event(writer, Event::Empty(start));
        }
        write_event(writer, Event::Start(start))?;
        for child in &self.children {
            match child {
                Node::Element(element) => element.write(writer)?,
                Node::Text(raw) => {
                    write_event(writer, Event::Text(BytesText::from_escaped(raw.as_str())))?
                }
                Node::CData(data) => {
                    write_event(writer, Event::CData(BytesCData::new(data.as_str())))?
                }
                Node::Markup(raw) => writer.get_mut().extend_from_slice(raw.as_bytes()),
            }
        }
        write_event(writer, Event::End(BytesEnd::new(self.tag.as_str())))
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), XmlError> {
    writer
        .write_event(event)
        .map_err(|e| XmlError::Write(e.to_string()))
}

/// A parsed document: the root element plus whatever surrounds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    prolog: String,
    root: Element,
    epilog: String,
}

impl Document {
    pub fn parse(input: &str) -> Result<Document, XmlError> {
        let mut reader = Reader::from_str(input);
        let mut stack: Vec<Element> = vec![];
        let mut root: Option<Element> = None;
        let mut prolog_end = 0;
        let mut epilog_start = input.len();

        loop {
            let before = reader.buffer_position() as usize;
            let event = reader.read_event().map_err(|e| {
                XmlError::Parse(format!("{e} (near byte {})", reader.buffer_position()))
            })?;
            let after = reader.buffer_position() as usize;
            let raw = &input[before..after];

            match event {
                Event::Start(start) => {
                    if stack.is_empty() {
                        if root.is_some() {
                            return Err(XmlError::Parse("more than one root element".into()));
                        }
                        prolog_end = before;
                    }
                    stack.push(Element::from_start(&start, false)?);
                }
                Event::Empty(start) => {
                    let element = Element::from_start(&start, true)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => {
                            if root.is_some() {
                                return Err(XmlError::Parse("more than one root element".into()));
                            }
                            prolog_end = before;
                            epilog_start = after;
                            root = Some(element);
                        }
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Parse(format!("unexpected end tag {raw}")))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => {
                            epilog_start = after;
                            root = Some(element);
                        }
                    }
                }
                Event::Text(_) => match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Text(raw.to_string())),
                    None if raw.trim().is_empty() => {}
                    None => {
                        return Err(XmlError::Parse(format!(
                            "text outside of the root element: {:?}",
                            raw.trim()
                        )))
                    }
                },
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        let data = std::str::from_utf8(&data)?.to_string();
                        parent.children.push(Node::CData(data));
                    }
                }
                Event::Eof => break,
                _ => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Markup(raw.to_string()));
                    }
                }
            }
        }

        if let Some(open) = stack.last() {
            return Err(XmlError::Parse(format!("unclosed element <{}>", open.tag)));
        }
        let root = root.ok_or_else(|| XmlError::Parse("no root element".into()))?;
        Ok(Document {
            prolog: input[..prolog_end].to_string(),
            root,
            epilog: input[epilog_start..].to_string(),
        })
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, XmlError> {
        let mut writer = Writer::new(Vec::new());
        writer.get_mut().extend_from_slice(self.prolog.as_bytes());
        self.root.write(&mut writer)?;
        writer.get_mut().extend_from_slice(self.epilog.as_bytes());
        Ok(writer.into_inner())
    }
}

impl FromStr for Document {
    type Err = XmlError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Document::parse(input)
    }
}
