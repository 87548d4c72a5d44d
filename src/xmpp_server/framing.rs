//! XMPP XML framing: incremental stanza extraction and stream wrappers.
//!
//! `StanzaFramer` turns arbitrarily fragmented reads into complete top-level
//! elements without building a tree. It is a small automaton over characters;
//! partial UTF-8 sequences are carried over between chunks, so a boundary may
//! fall anywhere, including inside a multi-byte character.
//!
//! `StreamFraming` produces the stream-level wrappers for the two supported
//! transports: classic TCP (`<stream:stream>`) and RFC 7395 WebSocket
//! (`<open/>`, `<close/>`).

use std::borrow::Cow;

use super::error::{FramingError, StreamError};
use super::stanza::{escape, ns};

/// Default limit for a single buffered top-level element.
///
/// Typical stanzas are a few KB; vCard avatars and archive pages rarely go above
/// 100 KB. Anything larger is treated as abuse rather than traffic.
pub const DEFAULT_MAX_STANZA_SIZE: usize = 1_024 * 1_024;

/// Longest entity or character reference accepted between `&` and `;`.
const MAX_REFERENCE_LEN: usize = 16;

const CDATA_OPEN: &str = "[CDATA[";
const COMMENT_OPEN: &str = "--";

/// Automaton states of the framer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Between top-level elements (only whitespace is allowed here).
    Outside,
    /// Just read `<`; the next character decides the kind of markup.
    TagStart,
    /// Reading an element name after `<`.
    OpenTagName,
    /// Inside an open tag, scanning attributes for `>` or `/>`.
    InsideTag,
    /// Inside a quoted attribute value; the payload is the quote character.
    AttrValue(char),
    /// Read `/` inside an open tag; only `>` may follow.
    SelfClose,
    /// Character data inside an element.
    Body,
    /// Reading a closing tag name after `</`.
    ClosingTag,
    /// Read `<!`; waiting to recognise CDATA or a comment.
    Bang,
    Cdata,
    Comment,
    /// `<?...?>`: XML declaration or processing instruction.
    ProcessingInstruction,
    /// Reading an entity or character reference after `&`.
    Reference,
}

/// Incremental framer for one XMPP stream.
///
/// `feed` returns the complete top-level elements found so far, in arrival
/// order. The stream header is returned as soon as its open tag ends, and the
/// stream close tag is returned on its own; both are recognised by the local
/// name `stream`. XML declarations and top-level comments are dropped.
#[derive(Debug)]
pub struct StanzaFramer {
    state: State,
    /// Text of the element currently being framed.
    buffer: String,
    /// Name being read (open or closing tag).
    name: String,
    /// Open elements of the current stanza, outermost first.
    stack: Vec<String>,
    /// Scratch for `<!`, `<?`, `&...;` and terminator detection.
    markup: String,
    reference_return: State,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
    /// Qualified name of the stream root once its header has been framed.
    stream_name: Option<String>,
    max_size: usize,
    failed: bool,
}

impl Default for StanzaFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STANZA_SIZE)
    }
}

impl StanzaFramer {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: State::Outside,
            buffer: String::new(),
            name: String::new(),
            stack: Vec::new(),
            markup: String::new(),
            reference_return: State::Body,
            pending: Vec::new(),
            stream_name: None,
            max_size,
            failed: false,
        }
    }

    /// Consume a chunk of bytes and return every element it completes.
    ///
    /// Any error is terminal: the framer stops parsing and every later call
    /// returns `FramingError::Aborted` until `reset` is called. Elements
    /// completed earlier in the failing chunk are discarded along with it.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, FramingError> {
        if self.failed {
            return Err(FramingError::Aborted);
        }
        let result = self.feed_chunk(chunk);
        if result.is_err() {
            self.failed = true;
            self.buffer = String::new();
            self.pending.clear();
            self.stack.clear();
        }
        result
    }

    /// Forget all state. Used when the byte stream underneath changes
    /// (TLS or compression took over) and a new stream header is expected.
    pub fn reset(&mut self) {
        self.state = State::Outside;
        self.buffer.clear();
        self.name.clear();
        self.stack.clear();
        self.markup.clear();
        self.pending.clear();
        self.stream_name = None;
        self.failed = false;
    }

    /// Bytes currently held for an incomplete element.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.pending.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn feed_chunk(&mut self, chunk: &[u8]) -> Result<Vec<String>, FramingError> {
        let data: Cow<'_, [u8]> = if self.pending.is_empty() {
            Cow::Borrowed(chunk)
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            Cow::Owned(joined)
        };

        let text = match std::str::from_utf8(&data) {
            Ok(text) => text,
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the end of the chunk: keep it for later.
                let valid = e.valid_up_to();
                self.pending = data[valid..].to_vec();
                std::str::from_utf8(&data[..valid])
                    .map_err(|e| not_well_formed(format!("invalid UTF-8: {}", e)))?
            }
            Err(e) => {
                return Err(not_well_formed(format!(
                    "invalid UTF-8 sequence after {} bytes",
                    e.valid_up_to()
                )))
            }
        };

        let mut out = Vec::new();
        for c in text.chars() {
            self.push_char(c, &mut out)?;
            if self.buffer.len() > self.max_size {
                return Err(FramingError::SizeExceeded {
                    limit: self.max_size,
                });
            }
        }
        Ok(out)
    }

    fn push_char(&mut self, c: char, out: &mut Vec<String>) -> Result<(), FramingError> {
        if !is_xml_char(c) {
            return Err(not_well_formed(format!(
                "illegal character U+{:04X}",
                c as u32
            )));
        }

        match self.state {
            State::Outside => {
                if c == '<' {
                    self.buffer.push(c);
                    self.state = State::TagStart;
                } else if !is_xml_space(c) {
                    return Err(not_well_formed("character data outside of a stanza"));
                }
            }
            State::TagStart => {
                self.buffer.push(c);
                match c {
                    '/' => {
                        self.name.clear();
                        self.state = State::ClosingTag;
                    }
                    '!' => {
                        self.markup.clear();
                        self.state = State::Bang;
                    }
                    '?' => {
                        if !self.stack.is_empty() {
                            return Err(not_well_formed(
                                "processing instructions are not allowed inside stanzas",
                            ));
                        }
                        self.markup.clear();
                        self.state = State::ProcessingInstruction;
                    }
                    c if is_name_start_char(c) => {
                        self.name.clear();
                        self.name.push(c);
                        self.state = State::OpenTagName;
                    }
                    _ => return Err(not_well_formed(format!("unexpected {:?} after '<'", c))),
                }
            }
            State::OpenTagName => {
                self.buffer.push(c);
                match c {
                    '>' => self.finish_open_tag(false, out),
                    '/' => self.state = State::SelfClose,
                    c if is_xml_space(c) => self.state = State::InsideTag,
                    c if is_name_char(c) => self.name.push(c),
                    _ => return Err(not_well_formed(format!("unexpected {:?} in element name", c))),
                }
            }
            State::InsideTag => {
                self.buffer.push(c);
                match c {
                    '>' => self.finish_open_tag(false, out),
                    '/' => self.state = State::SelfClose,
                    '"' | '\'' => self.state = State::AttrValue(c),
                    '<' => return Err(not_well_formed("'<' inside a tag")),
                    _ => {}
                }
            }
            State::AttrValue(quote) => {
                self.buffer.push(c);
                match c {
                    c if c == quote => self.state = State::InsideTag,
                    '<' => return Err(not_well_formed("'<' in attribute value")),
                    '&' => self.begin_reference(),
                    _ => {}
                }
            }
            State::SelfClose => {
                self.buffer.push(c);
                if c != '>' {
                    return Err(not_well_formed("expected '>' after '/'"));
                }
                self.finish_open_tag(true, out);
            }
            State::Body => {
                self.buffer.push(c);
                match c {
                    '<' => self.state = State::TagStart,
                    '&' => self.begin_reference(),
                    _ => {}
                }
            }
            State::ClosingTag => {
                if c == '>' {
                    self.buffer.push(c);
                    self.finish_closing_tag(out)?;
                } else if is_name_char(c) || is_xml_space(c) {
                    self.buffer.push(c);
                    self.name.push(c);
                } else {
                    return Err(not_well_formed(format!("unexpected {:?} in closing tag", c)));
                }
            }
            State::Bang => {
                self.buffer.push(c);
                self.markup.push(c);
                if self.markup == CDATA_OPEN {
                    if self.stack.is_empty() {
                        return Err(not_well_formed("CDATA section outside of an element"));
                    }
                    self.markup.clear();
                    self.state = State::Cdata;
                } else if self.markup == COMMENT_OPEN {
                    self.markup.clear();
                    self.state = State::Comment;
                } else if !CDATA_OPEN.starts_with(self.markup.as_str())
                    && !COMMENT_OPEN.starts_with(self.markup.as_str())
                {
                    return Err(not_well_formed("document type declarations are not allowed"));
                }
            }
            State::Cdata => {
                self.buffer.push(c);
                if c == '>' && self.markup == "]]" {
                    self.markup.clear();
                    self.state = State::Body;
                } else if c == ']' {
                    if self.markup.len() < 2 {
                        self.markup.push(c);
                    }
                } else {
                    self.markup.clear();
                }
            }
            State::Comment => {
                self.buffer.push(c);
                if c == '>' && self.markup == "--" {
                    self.markup.clear();
                    self.end_markup();
                } else if c == '-' {
                    if self.markup.len() < 2 {
                        self.markup.push(c);
                    }
                } else {
                    self.markup.clear();
                }
            }
            State::ProcessingInstruction => {
                self.buffer.push(c);
                if c == '>' && self.markup == "?" {
                    self.markup.clear();
                    self.end_markup();
                } else if c == '?' {
                    self.markup = String::from("?");
                } else {
                    self.markup.clear();
                }
            }
            State::Reference => {
                self.buffer.push(c);
                if c == ';' {
                    validate_reference(&self.markup)?;
                    self.markup.clear();
                    self.state = self.reference_return;
                } else if self.markup.len() >= MAX_REFERENCE_LEN || is_xml_space(c) || c == '<' {
                    return Err(not_well_formed("unterminated entity reference"));
                } else {
                    self.markup.push(c);
                }
            }
        }
        Ok(())
    }

    fn begin_reference(&mut self) {
        self.markup.clear();
        self.reference_return = self.state;
        self.state = State::Reference;
    }

    /// End of a comment or processing instruction. Top-level ones are dropped.
    fn end_markup(&mut self) {
        if self.stack.is_empty() {
            self.buffer.clear();
            self.state = State::Outside;
        } else {
            self.state = State::Body;
        }
    }

    fn finish_open_tag(&mut self, self_closing: bool, out: &mut Vec<String>) {
        let name = std::mem::take(&mut self.name);

        if self.stack.is_empty() {
            if is_stream_root(&name) {
                // The stream header never closes inside a stanza: hand it out as
                // soon as its open tag is complete.
                self.stream_name = Some(name);
                self.emit(out);
                return;
            }
            if self_closing {
                self.emit(out);
                return;
            }
        }

        if !self_closing {
            self.stack.push(name);
        }
        self.state = State::Body;
    }

    fn finish_closing_tag(&mut self, out: &mut Vec<String>) -> Result<(), FramingError> {
        let name = std::mem::take(&mut self.name);
        let name = name.trim_end();
        if name.is_empty() || name.contains(is_xml_space) {
            return Err(not_well_formed("malformed closing tag"));
        }

        match self.stack.pop() {
            Some(open) => {
                if open != name {
                    return Err(not_well_formed(format!(
                        "closing tag </{}> does not match <{}>",
                        name, open
                    )));
                }
                if self.stack.is_empty() {
                    self.emit(out);
                } else {
                    self.state = State::Body;
                }
            }
            None => {
                let matches_header = self.stream_name.as_deref().map_or(true, |open| open == name);
                if !is_stream_root(name) || !matches_header {
                    return Err(not_well_formed(format!("unexpected closing tag </{}>", name)));
                }
                self.stream_name = None;
                self.emit(out);
            }
        }
        Ok(())
    }

    fn emit(&mut self, out: &mut Vec<String>) {
        out.push(std::mem::take(&mut self.buffer));
        self.state = State::Outside;
    }
}

fn not_well_formed(msg: impl Into<String>) -> FramingError {
    FramingError::NotWellFormed(msg.into())
}

/// `Char` production of XML 1.0.
fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

fn is_xml_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn is_name_start_char(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    is_name_start_char(c) || c.is_numeric() || matches!(c, '-' | '.' | '\u{B7}')
}

fn is_stream_root(name: &str) -> bool {
    name == "stream" || name.ends_with(":stream")
}

/// Check the text between `&` and `;`.
fn validate_reference(reference: &str) -> Result<(), FramingError> {
    if let Some(number) = reference.strip_prefix('#') {
        let (digits, radix) = match number.strip_prefix('x') {
            Some(hex) => (hex, 16),
            None => (number, 10),
        };
        if digits.is_empty() || !digits.chars().all(|d| d.is_digit(radix)) {
            return Err(not_well_formed(format!("malformed character reference &{};", reference)));
        }
        let legal = u32::from_str_radix(digits, radix)
            .ok()
            .and_then(char::from_u32)
            .is_some_and(is_xml_char);
        if !legal {
            return Err(not_well_formed(format!(
                "character reference &{}; is not a legal XML character",
                reference
            )));
        }
        return Ok(());
    }

    match reference {
        "amp" | "lt" | "gt" | "quot" | "apos" => Ok(()),
        _ => Err(not_well_formed(format!("undefined entity &{};", reference))),
    }
}

/// Name of the root element of a framed element (`<name ...`).
pub fn root_name(element: &str) -> &str {
    let rest = element
        .trim_start()
        .trim_start_matches('<')
        .trim_start_matches('/');
    let end = rest
        .find(|c: char| is_xml_space(c) || c == '/' || c == '>')
        .unwrap_or(rest.len());
    &rest[..end]
}

/// Stream wrappers for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// Classic `<stream:stream>` framing over a byte stream.
    Tcp,
    /// RFC 7395 framing: one element per WebSocket text message.
    WebSocket,
}

impl StreamFraming {
    pub fn is_stream_open(&self, element: &str) -> bool {
        let trimmed = element.trim_start();
        if trimmed.starts_with("</") {
            return false;
        }
        match self {
            Self::Tcp => is_stream_root(root_name(trimmed)),
            Self::WebSocket => root_name(trimmed) == "open",
        }
    }

    pub fn is_stream_close(&self, element: &str) -> bool {
        let trimmed = element.trim_start();
        match self {
            Self::Tcp => trimmed.starts_with("</") && is_stream_root(root_name(trimmed)),
            Self::WebSocket => root_name(trimmed) == "close",
        }
    }

    /// Response header for a stream opened by the peer.
    pub fn open_stream(
        &self,
        namespace: &str,
        from: &str,
        id: &str,
        lang: &str,
        version: Option<&str>,
    ) -> String {
        let mut header = match self {
            Self::Tcp => format!(
                "<?xml version='1.0'?><stream:stream xmlns:stream='{}' xmlns='{}'",
                ns::STREAMS,
                namespace
            ),
            Self::WebSocket => format!("<open xmlns='{}'", ns::FRAMING),
        };
        header.push_str(&format!(" from='{}' id='{}'", escape(from), escape(id)));
        if !lang.is_empty() {
            header.push_str(&format!(" xml:lang='{}'", escape(lang)));
        }
        if let Some(version) = version {
            header.push_str(&format!(" version='{}'", version));
        }
        header.push_str(match self {
            Self::Tcp => ">",
            Self::WebSocket => "/>",
        });
        header
    }

    pub fn close_stream(&self) -> &'static str {
        match self {
            Self::Tcp => "</stream:stream>",
            Self::WebSocket => "<close xmlns='urn:ietf:params:xml:ns:xmpp-framing'/>",
        }
    }

    /// `<stream:features>` element. WebSocket messages are standalone
    /// documents, so the `stream` prefix is declared on the element itself.
    pub fn features(&self, inner: &str) -> String {
        match self {
            Self::Tcp => format!("<stream:features>{}</stream:features>", inner),
            Self::WebSocket => format!(
                "<stream:features xmlns:stream='{}'>{}</stream:features>",
                ns::STREAMS,
                inner
            ),
        }
    }

    pub fn error(&self, err: &StreamError) -> String {
        match self {
            Self::Tcp => err.to_xml(),
            Self::WebSocket => format!(
                "<stream:error xmlns:stream='{}'>{}</stream:error>",
                ns::STREAMS,
                err.condition_xml()
            ),
        }
    }
}
