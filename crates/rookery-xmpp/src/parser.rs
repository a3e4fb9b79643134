//! Incremental framing of the inbound XMPP byte stream.
//!
//! XMPP uses a single long-lived XML document per session. The framer
//! tracks element depth over raw bytes, cuts complete top-level elements
//! out of the buffer and hands each one to minidom, so a partially
//! received stanza never reaches the session.

use minidom::Element;

use crate::error::{StreamError, StreamErrorCondition};
use crate::XmppError;

/// Namespace URIs used in XMPP
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Stream error conditions namespace
    pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Application-specific stream error conditions
    pub const APP_ERRORS: &str = "urn:xmpp:errors";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Stream compression namespace (XEP-0138)
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    /// Stream compression feature namespace (XEP-0138)
    pub const COMPRESS_FEATURE: &str = "http://jabber.org/features/compress";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Legacy non-SASL authentication (XEP-0078)
    pub const LEGACY_AUTH: &str = "jabber:iq:auth";
    /// Delayed delivery (XEP-0203)
    pub const DELAY: &str = "urn:xmpp:delay";
    /// Message processing hints (XEP-0334)
    pub const HINTS: &str = "urn:xmpp:hints";
    /// Stanza forwarding (XEP-0297)
    pub const FORWARD: &str = "urn:xmpp:forward:0";
    /// Delivery receipts (XEP-0184)
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    /// Chat state notifications (XEP-0085)
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
    /// Unique and stable stanza IDs (XEP-0359)
    pub const STANZA_ID: &str = "urn:xmpp:sid:0";
    /// Roster management (RFC 6121)
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Roster versioning stream feature
    pub const ROSTER_VER: &str = "urn:xmpp:features:rosterver";
    /// Message carbons (XEP-0280)
    pub const CARBONS: &str = "urn:xmpp:carbons:2";
    /// Message archive management (XEP-0313)
    pub const MAM: &str = "urn:xmpp:mam:2";
    /// Result set management (XEP-0059)
    pub const RSM: &str = "http://jabber.org/protocol/rsm";
    /// Data forms (XEP-0004)
    pub const XDATA: &str = "jabber:x:data";
    /// XMPP ping (XEP-0199)
    pub const PING: &str = "urn:xmpp:ping";
    /// Service discovery info (XEP-0030)
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery items (XEP-0030)
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Software version (XEP-0092)
    pub const VERSION: &str = "jabber:iq:version";
    /// Private XML storage (XEP-0049)
    pub const PRIVATE: &str = "jabber:iq:private";
}

/// Parsed stream header information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamHeader {
    /// The 'to' attribute (target domain)
    pub to: Option<String>,
    /// The 'from' attribute (source domain)
    pub from: Option<String>,
    /// The 'id' attribute (stream ID, set by server)
    pub id: Option<String>,
    /// The 'version' attribute (should be "1.0")
    pub version: Option<String>,
    /// The 'xml:lang' attribute
    pub lang: Option<String>,
    /// Default content namespace (`xmlns`)
    pub xmlns: Option<String>,
    /// Namespace bound to the `stream` prefix
    pub stream_ns: Option<String>,
}

impl StreamHeader {
    /// Parse a stream header from the raw opening tag.
    ///
    /// The tag is intentionally unclosed (the closing tag comes at session
    /// end), so attributes are extracted without an XML parser.
    pub fn parse(tag: &str) -> Result<Self, XmppError> {
        if !(tag.starts_with("<stream:stream") || tag.starts_with("<stream ")) {
            return Err(XmppError::xml_parse("No stream:stream element found"));
        }
        Ok(StreamHeader {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
            xmlns: extract_attribute(tag, "xmlns"),
            stream_ns: extract_attribute(tag, "xmlns:stream"),
        })
    }

    /// Validate the stream header per RFC 6120.
    pub fn validate(&self, content_ns: &str) -> Result<(), StreamError> {
        if self.stream_ns.as_deref() != Some(ns::STREAM) {
            return Err(StreamError::new(StreamErrorCondition::InvalidNamespace));
        }
        if let Some(ref xmlns) = self.xmlns {
            if xmlns != content_ns {
                return Err(StreamError::new(StreamErrorCondition::InvalidNamespace));
            }
        }
        if let Some(ref version) = self.version {
            if version != "1.0" {
                return Err(StreamError::new(StreamErrorCondition::UnsupportedVersion));
            }
        }
        Ok(())
    }
}

/// Extract an attribute value from an XML tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!("{}={}", name, quote);
        let mut from = 0;
        while let Some(found) = tag[from..].find(&pattern) {
            let start = from + found;
            // Skip matches that are the tail of a longer name (`xmlns` inside `xmlns:stream`).
            let preceded_by_space = start > 0 && tag.as_bytes()[start - 1].is_ascii_whitespace();
            let value_start = start + pattern.len();
            if preceded_by_space {
                if let Some(value_end) = tag[value_start..].find(quote) {
                    return Some(tag[value_start..value_start + value_end].to_string());
                }
            }
            from = value_start;
        }
    }
    None
}

/// A unit cut out of the inbound stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `<stream:stream ...>` opening tag
    StreamOpen(StreamHeader),
    /// A complete top-level element
    Element(Element),
    /// `</stream:stream>`
    StreamClose,
}

/// Incremental framer for XMPP streams.
#[derive(Debug)]
pub struct XmlFramer {
    buffer: Vec<u8>,
    max_element_size: usize,
    content_ns: &'static str,
}

enum Scan {
    Complete(usize),
    Incomplete,
}

impl XmlFramer {
    /// Create a framer that rejects elements larger than `max_element_size` bytes.
    pub fn new(max_element_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            max_element_size,
            content_ns: ns::JABBER_CLIENT,
        }
    }

    /// Use a different default content namespace (e.g. `jabber:server`).
    pub fn with_content_namespace(mut self, content_ns: &'static str) -> Self {
        self.content_ns = content_ns;
        self
    }

    /// Feed data into the framer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drop any buffered bytes (stream restart).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered, not yet framed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Cut the next complete frame out of the buffer, if one is available.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, XmppError> {
        loop {
            let skip = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            if skip > 0 {
                self.buffer.drain(..skip);
            }
            if self.buffer.is_empty() {
                return Ok(None);
            }
            if self.buffer[0] != b'<' {
                return Err(XmppError::Stream(StreamError::new(
                    StreamErrorCondition::NotWellFormed,
                )));
            }

            // Declarations and comments between stanzas are dropped.
            if self.buffer.starts_with(b"<?") {
                match find(&self.buffer, b"?>") {
                    Some(end) => {
                        self.buffer.drain(..end + 2);
                        continue;
                    }
                    None => return self.incomplete(),
                }
            }
            if self.buffer.starts_with(b"<!--") {
                match find(&self.buffer, b"-->") {
                    Some(end) => {
                        self.buffer.drain(..end + 3);
                        continue;
                    }
                    None => return self.incomplete(),
                }
            }

            if self.buffer.starts_with(b"</") {
                let Some(end) = tag_end(&self.buffer, 0) else {
                    return self.incomplete();
                };
                let tag = String::from_utf8_lossy(&self.buffer[2..end]).trim().to_string();
                self.buffer.drain(..=end);
                if tag == "stream:stream" || tag == "stream" {
                    return Ok(Some(Frame::StreamClose));
                }
                return Err(XmppError::Stream(StreamError::new(
                    StreamErrorCondition::NotWellFormed,
                )));
            }

            if self.buffer.starts_with(b"<stream:stream") || self.buffer.starts_with(b"<stream ") {
                let Some(end) = tag_end(&self.buffer, 0) else {
                    return self.incomplete();
                };
                let tag = std::str::from_utf8(&self.buffer[..=end])
                    .map_err(|_| XmppError::stream(StreamErrorCondition::NotWellFormed))?
                    .to_string();
                self.buffer.drain(..=end);
                return Ok(Some(Frame::StreamOpen(StreamHeader::parse(&tag)?)));
            }

            return match scan_element(&self.buffer)? {
                Scan::Incomplete => self.incomplete(),
                Scan::Complete(len) => {
                    if len > self.max_element_size {
                        return Err(XmppError::Stream(
                            StreamError::new(StreamErrorCondition::PolicyViolation)
                                .with_text("stanza too large"),
                        ));
                    }
                    let raw: Vec<u8> = self.buffer.drain(..len).collect();
                    let raw = String::from_utf8(raw)
                        .map_err(|_| XmppError::stream(StreamErrorCondition::NotWellFormed))?;
                    let element = parse_top_level(&raw, self.content_ns)?;
                    Ok(Some(Frame::Element(element)))
                }
            };
        }
    }

    fn incomplete(&self) -> Result<Option<Frame>, XmppError> {
        if self.buffer.len() > self.max_element_size {
            return Err(XmppError::Stream(
                StreamError::new(StreamErrorCondition::PolicyViolation)
                    .with_text("stanza too large"),
            ));
        }
        Ok(None)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Position of the `>` closing the tag that starts at `start`, honouring quotes.
fn tag_end(buf: &[u8], start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate().skip(start + 1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i),
            None => {}
        }
    }
    None
}

/// Find the length of the top-level element starting at offset zero.
fn scan_element(buf: &[u8]) -> Result<Scan, XmppError> {
    let mut depth = 0usize;
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != b'<' {
            match buf[i..].iter().position(|&b| b == b'<') {
                Some(next) => {
                    i += next;
                    continue;
                }
                None => return Ok(Scan::Incomplete),
            }
        }
        let rest = &buf[i..];
        if rest.starts_with(b"<!--") {
            match find(rest, b"-->") {
                Some(end) => i += end + 3,
                None => return Ok(Scan::Incomplete),
            }
            continue;
        }
        if rest.starts_with(b"<![CDATA[") {
            match find(rest, b"]]>") {
                Some(end) => i += end + 3,
                None => return Ok(Scan::Incomplete),
            }
            continue;
        }
        if rest.starts_with(b"<?") || rest.starts_with(b"<!") {
            // Processing instructions and DTDs are restricted XML in XMPP.
            return Err(XmppError::stream(StreamErrorCondition::NotWellFormed));
        }
        let Some(end) = tag_end(buf, i) else {
            return Ok(Scan::Incomplete);
        };
        if rest.len() > 1 && rest[1] == b'/' {
            depth = depth
                .checked_sub(1)
                .ok_or_else(|| XmppError::stream(StreamErrorCondition::NotWellFormed))?;
        } else if buf[end - 1] != b'/' {
            depth += 1;
        }
        i = end + 1;
        if depth == 0 {
            return Ok(Scan::Complete(i));
        }
    }
    Ok(Scan::Incomplete)
}

/// Parse a framed top-level element, declaring the namespaces the stream
/// header established but the element itself omits.
fn parse_top_level(raw: &str, content_ns: &str) -> Result<Element, XmppError> {
    let name_end = raw[1..]
        .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
        .map(|i| i + 1)
        .unwrap_or(raw.len());
    let name = &raw[1..name_end];
    let start_tag_end = tag_end(raw.as_bytes(), 0).unwrap_or(raw.len() - 1);
    let start_tag = &raw[..start_tag_end];

    let mut injected = String::new();
    if name.starts_with("stream:") && extract_attribute(start_tag, "xmlns:stream").is_none() {
        injected.push_str(&format!(" xmlns:stream='{}'", ns::STREAM));
    }
    if !name.contains(':') && extract_attribute(start_tag, "xmlns").is_none() {
        injected.push_str(&format!(" xmlns='{}'", content_ns));
    }

    let document = if injected.is_empty() {
        raw.to_string()
    } else {
        format!("{}{}{}", &raw[..name_end], injected, &raw[name_end..])
    };
    document
        .parse::<Element>()
        .map_err(|e| XmppError::xml_parse(format!("Failed to parse element: {}", e)))
}

/// Serialize the opening tag of a server-to-client stream.
pub fn stream_header(from: &str, id: &str, content_ns: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}' from='{}' id='{}' version='1.0' xml:lang='en'>",
        content_ns,
        ns::STREAM,
        escape_attr(from),
        escape_attr(id)
    )
}

/// Closing tag of a stream.
pub const STREAM_CLOSE: &str = "</stream:stream>";

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('\'', "&apos;")
        .replace('<', "&lt;")
}

/// Convert a minidom Element back to an XML string.
pub fn element_to_string(element: &Element) -> Result<String, XmppError> {
    let mut output = Vec::new();
    element
        .write_to(&mut output)
        .map_err(|e| XmppError::xml_parse(format!("Failed to serialize element: {}", e)))?;
    String::from_utf8(output).map_err(|e| XmppError::xml_parse(format!("Invalid UTF-8: {}", e)))
}
