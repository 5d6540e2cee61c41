//! In-memory XML document model for CloudStack responses.
//!
//! Responses are small (a page of at most a few hundred records), so the
//! whole body is parsed into an owned element tree with `quick-xml` and
//! navigated with DOM-like helpers. Attributes are never used by the API
//! and are not kept.

use crate::error::{CsError, CsResult};
use crate::wire::WireObserver;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

/// One element: its tag name, direct text and child elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlElement {
    name: String,
    text: Option<String>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            text: None,
            children: Vec::new(),
        }
    }

    /// Builder used by tests and by callers assembling synthetic records.
    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Text content, `None` when the element has no text at all.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    /// First direct child whose name matches ignoring ASCII case.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Text of the first direct child with the given name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(|c| c.text())
    }

    /// All descendants (including `self`) with an exact tag name, in
    /// document order.
    pub fn elements_by_tag_name<'a>(&'a self, tag: &str) -> Vec<&'a XmlElement> {
        let mut out = Vec::new();
        self.collect(tag, &mut out);
        out
    }

    fn collect<'a>(&'a self, tag: &str, out: &mut Vec<&'a XmlElement>) {
        if self.name == tag {
            out.push(self);
        }
        for child in &self.children {
            child.collect(tag, out);
        }
    }

    fn push_text(&mut self, chunk: &str) {
        match self.text {
            Some(ref mut text) => text.push_str(chunk),
            None => self.text = Some(chunk.to_string()),
        }
    }

    /// Drop formatting whitespace around child elements.
    fn finish(&mut self) {
        let blank = self.text.as_deref().map(|t| t.is_empty()).unwrap_or(false);
        let layout_only = !self.children.is_empty()
            && self.text.as_deref().map(|t| t.trim().is_empty()).unwrap_or(false);
        if blank || layout_only {
            self.text = None;
        }
    }

    fn write_to(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), String> {
        if self.text.is_none() && self.children.is_empty() {
            return writer
                .write_event(Event::Empty(BytesStart::new(self.name.as_str())))
                .map_err(|e| e.to_string());
        }
        writer
            .write_event(Event::Start(BytesStart::new(self.name.as_str())))
            .map_err(|e| e.to_string())?;
        if let Some(ref text) = self.text {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|e| e.to_string())?;
        }
        for child in &self.children {
            child.write_to(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| e.to_string())
    }
}

/// A parsed, well-formed response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmlDocument {
    root: XmlElement,
}

impl XmlDocument {
    /// Parse a UTF-8 XML body. Returns a description of the first syntax
    /// problem on failure.
    pub fn parse(body: &str) -> Result<Self, String> {
        let mut reader = Reader::from_str(body);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| format!("XML error at position {}: {}", reader.buffer_position(), e))?;
            match event {
                Event::Start(ref e) => {
                    if root.is_some() {
                        return Err("Content after the root element".to_string());
                    }
                    stack.push(XmlElement::new(&element_name(e)?));
                }
                Event::Empty(ref e) => {
                    let element = XmlElement::new(&element_name(e)?);
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| "Unexpected closing tag".to_string())?;
                    element.finish();
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(ref t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| format!("XML error at position {}: {}", reader.buffer_position(), e))?;
                    match stack.last_mut() {
                        Some(current) => current.push_text(&text),
                        None if text.trim().is_empty() => {}
                        None => return Err("Text outside of the root element".to_string()),
                    }
                }
                Event::CData(ref c) => {
                    let text = std::str::from_utf8(c).map_err(|e| e.to_string())?;
                    match stack.last_mut() {
                        Some(current) => current.push_text(text),
                        None => return Err("CDATA outside of the root element".to_string()),
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(format!("Unclosed element <{}>", open.name));
        }
        root.map(|root| Self { root })
            .ok_or_else(|| "Document has no root element".to_string())
    }

    pub fn from_root(root: XmlElement) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &XmlElement {
        &self.root
    }

    /// All elements with an exact tag name, in document order.
    pub fn elements_by_tag_name<'a>(&'a self, tag: &str) -> Vec<&'a XmlElement> {
        self.root.elements_by_tag_name(tag)
    }

    /// Text of the first element with the given tag name.
    pub fn first_text(&self, tag: &str) -> Option<&str> {
        self.elements_by_tag_name(tag)
            .into_iter()
            .next()
            .and_then(|e| e.text())
    }

    /// Indented rendering for wire tracing.
    pub fn to_pretty_string(&self) -> Result<String, String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.root.write_to(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| e.to_string())
    }
}

/// Parse a response body, tracing it through `wire` when present.
///
/// A malformed body is a communication failure whose message carries the
/// HTTP status and the raw payload.
pub fn parse_response(
    status: u16,
    body: &str,
    wire: Option<&dyn WireObserver>,
) -> CsResult<XmlDocument> {
    match XmlDocument::parse(body) {
        Ok(doc) => {
            if let Some(wire) = wire {
                match doc.to_pretty_string() {
                    Ok(pretty) => wire.body(&pretty),
                    Err(e) => {
                        log::debug!("unable to pretty-print response: {}", e);
                        wire.body(body);
                    }
                }
            }
            Ok(doc)
        }
        Err(reason) => {
            if let Some(wire) = wire {
                wire.body(body);
            }
            log::debug!("response from server was not XML: {}", reason);
            Err(CsError::communication(format!(
                "Received error code from server [{}]: {}",
                status, body
            )))
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────────

fn element_name(start: &BytesStart<'_>) -> Result<String, String> {
    std::str::from_utf8(start.name().as_ref())
        .map(|s| s.to_string())
        .map_err(|e| e.to_string())
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => return Err("Content after the root element".to_string()),
    }
    Ok(())
}
