//! Parsed view of framed elements.
//!
//! The framer hands out element strings; everything that needs to look inside
//! one (negotiation, routing, error replies) goes through `Stanza`, which keeps
//! the original text for forwarding and a small element tree for inspection.

use std::borrow::Cow;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::error::{StanzaErrorCondition, StreamErrorCondition, XmppError};
use super::jid::{Jid, JidError};

/// Namespaces used by the core.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const SERVER: &str = "jabber:server";
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
    pub const MULTIPLEXER: &str = "http://jabber.org/protocol/connectionmanager";
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const FRAMING: &str = "urn:ietf:params:xml:ns:xmpp-framing";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    pub const PING: &str = "urn:xmpp:ping";
}

/// Escape text for use in character data or a single-quoted attribute.
pub fn escape(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// Minimal element tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Parse a complete element.
    pub fn parse(xml: &str) -> Result<Element, XmppError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(element_from_start(&e)?),
                Event::Empty(e) => {
                    let element = element_from_start(&e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(element),
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmppError::xml("unbalanced closing tag"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => return Ok(element),
                    }
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Event::CData(e) => {
                    if let Some(parent) = stack.last_mut() {
                        parent
                            .children
                            .push(Node::Text(String::from_utf8_lossy(&e).into_owned()));
                    }
                }
                Event::Eof => return Err(XmppError::xml("incomplete element")),
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Namespace declared on this element for its own name.
    pub fn ns(&self) -> Option<&str> {
        match self.prefix() {
            Some(prefix) => self.attr(&format!("xmlns:{}", prefix)),
            None => self.attr("xmlns"),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) {
        self.attributes.retain(|(k, _)| k != key);
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given local name and declared namespace.
    pub fn get_child(&self, local_name: &str, namespace: &str) -> Option<&Element> {
        self.children()
            .find(|c| c.local_name() == local_name && c.ns() == Some(namespace))
    }

    /// First child with the given local name, whatever its namespace.
    pub fn child_named(&self, local_name: &str) -> Option<&Element> {
        self.children().find(|c| c.local_name() == local_name)
    }

    /// Concatenated character data of direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    /// Serialize and return the offset just past the root start tag.
    fn to_xml_with_start_end(&self) -> (String, usize) {
        let mut out = String::new();
        self.write_start_tag(&mut out);
        let start_end = out.len();
        if self.children.is_empty() {
            return (out, start_end);
        }
        self.write_content(&mut out);
        (out, start_end)
    }

    fn write_xml(&self, out: &mut String) {
        self.write_start_tag(out);
        if !self.children.is_empty() {
            self.write_content(out);
        }
    }

    fn write_start_tag(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push_str(&format!(" {}='{}'", k, escape(v)));
        }
        out.push_str(if self.children.is_empty() { "/>" } else { ">" });
    }

    fn write_content(&self, out: &mut String) {
        for child in &self.children {
            match child {
                Node::Element(e) => e.write_xml(out),
                Node::Text(t) => out.push_str(&escape(t)),
            }
        }
        out.push_str(&format!("</{}>", self.name));
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, XmppError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmppError::xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
    /// Any other top-level element (negotiation directives, `handshake`, ...).
    Other,
}

/// A framed top-level element: original text plus its parsed tree.
///
/// The original text is what gets forwarded. Attribute changes made through
/// `set_attr` rewrite only the root start tag.
#[derive(Debug, Clone)]
pub struct Stanza {
    raw: String,
    element: Element,
    /// Byte offset just past the root start tag in `raw`.
    start_tag_end: usize,
}

impl Stanza {
    pub fn parse(raw: impl Into<String>) -> Result<Self, XmppError> {
        let raw = raw.into();
        let element = Element::parse(&raw)?;

        let mut reader = Reader::from_str(&raw);
        reader.config_mut().check_end_names = false;
        let start_tag_end = loop {
            match reader.read_event()? {
                Event::Start(_) | Event::Empty(_) => break reader.buffer_position() as usize,
                Event::Eof => return Err(XmppError::xml("no root element")),
                _ => continue,
            }
        };

        Ok(Self {
            raw,
            element,
            start_tag_end,
        })
    }

    pub fn from_element(element: Element) -> Self {
        let (raw, start_tag_end) = element.to_xml_with_start_end();
        Self {
            raw,
            element,
            start_tag_end,
        }
    }

    pub fn kind(&self) -> StanzaKind {
        match self.element.local_name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            "iq" => StanzaKind::Iq,
            _ => StanzaKind::Other,
        }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn name(&self) -> &str {
        self.element.name()
    }

    pub fn local_name(&self) -> &str {
        self.element.local_name()
    }

    pub fn ns(&self) -> Option<&str> {
        self.element.ns()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.element.attr(key)
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    pub fn to(&self) -> Option<Result<Jid, JidError>> {
        self.attr("to").map(Jid::parse)
    }

    pub fn from(&self) -> Option<Result<Jid, JidError>> {
        self.attr("from").map(Jid::parse)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn into_string(self) -> String {
        self.raw
    }

    /// Set a root attribute, rewriting the start tag of the original text.
    pub fn set_attr(&mut self, key: &str, value: &str) {
        self.element.set_attr(key, value);

        let self_closing = self.raw[..self.start_tag_end].trim_end().ends_with("/>");
        let mut start = String::with_capacity(self.start_tag_end + value.len() + key.len() + 4);
        start.push('<');
        start.push_str(self.element.name());
        for (k, v) in self.element.attrs() {
            start.push_str(&format!(" {}='{}'", k, escape(v)));
        }
        start.push_str(if self_closing { "/>" } else { ">" });

        let rest = &self.raw[self.start_tag_end..];
        let mut raw = String::with_capacity(start.len() + rest.len());
        raw.push_str(&start);
        raw.push_str(rest);
        self.start_tag_end = start.len();
        self.raw = raw;
    }

    /// Build the error reply for this stanza: addresses swapped, `type='error'`,
    /// the original payload echoed back and an `<error/>` child appended.
    /// Returns `None` for stanzas that must never be
    /// answered with an error (errors themselves, IQ results).
    pub fn error_reply(&self, condition: StanzaErrorCondition, text: Option<&str>) -> Option<Stanza> {
        if self.is_error() || self.kind() == StanzaKind::Other {
            return None;
        }
        if self.kind() == StanzaKind::Iq && self.stanza_type() == Some("result") {
            return None;
        }

        let mut reply = Element::new(self.element.name());
        if let Some(xmlns) = self.element.attr("xmlns") {
            reply.set_attr("xmlns", xmlns);
        }
        if let Some(to) = self.attr("to") {
            reply.set_attr("from", to);
        }
        if let Some(from) = self.attr("from") {
            reply.set_attr("to", from);
        }
        if let Some(id) = self.id() {
            reply.set_attr("id", id);
        }
        reply.set_attr("type", "error");
        reply.children = self
            .element
            .children
            .iter()
            .filter(|node| !matches!(node, Node::Element(e) if e.local_name() == "error"))
            .cloned()
            .collect();

        let mut error = Element::new("error")
            .with_attr("type", condition.error_type())
            .with_child(Element::new(condition.as_str()).with_attr("xmlns", ns::STANZA_ERRORS));
        if let Some(text) = text {
            error = error.with_child(
                Element::new("text")
                    .with_attr("xmlns", ns::STANZA_ERRORS)
                    .with_attr("xml:lang", "en")
                    .with_text(text),
            );
        }
        Some(Stanza::from_element(reply.with_child(error)))
    }
}

/// Attributes of a peer's stream header (`<stream:stream>` or RFC 7395 `<open/>`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamHeader {
    pub name: String,
    pub default_ns: Option<String>,
    pub stream_ns: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Parse the open tag of a stream header. The tag is not closed, so only
    /// the first event is read.
    pub fn parse(header: &str) -> Result<Self, StreamErrorCondition> {
        let mut reader = Reader::from_str(header);
        reader.config_mut().check_end_names = false;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => return Self::from_start(&e),
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_)) => continue,
                Ok(Event::Text(t)) if t.iter().all(|b| b.is_ascii_whitespace()) => continue,
                _ => return Err(StreamErrorCondition::NotWellFormed),
            }
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, StreamErrorCondition> {
        let mut header = StreamHeader {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            ..Default::default()
        };
        let prefix = header.prefix().map(str::to_string);

        for attr in start.attributes() {
            let attr = attr.map_err(|_| StreamErrorCondition::NotWellFormed)?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|_| StreamErrorCondition::NotWellFormed)?
                .into_owned();
            match key.as_str() {
                "xmlns" => header.default_ns = Some(value),
                "to" => header.to = Some(value),
                "from" => header.from = Some(value),
                "version" => header.version = Some(value),
                "xml:lang" => header.lang = Some(value),
                k if Some(k.trim_start_matches("xmlns:")) == prefix.as_deref()
                    && k.starts_with("xmlns:") =>
                {
                    header.stream_ns = Some(value)
                }
                _ => {}
            }
        }
        Ok(header)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// `(major, minor)` of the declared version, if present and well formed.
    pub fn version_numbers(&self) -> Option<(u32, u32)> {
        let version = self.version.as_deref()?;
        let (major, minor) = version.split_once('.')?;
        Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
    }
}
