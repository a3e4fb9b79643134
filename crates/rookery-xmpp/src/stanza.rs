//! Stanza wrapper and JID helpers.
//!
//! Stanzas stay as `minidom::Element` trees so that unknown extension
//! payloads are forwarded untouched; [`Stanza`] caches the parsed
//! addressing attributes and exposes the accessors routing needs.

use jid::{BareJid, FullJid, Jid};
use minidom::Element;

use crate::error::{stanza_error_element, StanzaErrorCondition};
use crate::parser::ns;
use crate::types::StanzaType;
use crate::XmppError;

/// Address predicates beyond the ones `jid` provides.
pub trait JidExt {
    /// Node and resource are both empty.
    fn is_server(&self) -> bool;
    /// Node and resource are both present.
    fn is_full_with_user(&self) -> bool;
    /// Node as a string slice, empty when absent.
    fn node_str(&self) -> &str;
    /// Resource as a string slice, empty when absent.
    fn resource_str(&self) -> &str;
    /// Domain as a string slice.
    fn domain_str(&self) -> &str;
}

impl JidExt for Jid {
    fn is_server(&self) -> bool {
        self.node().is_none() && self.resource().is_none()
    }

    fn is_full_with_user(&self) -> bool {
        self.node().is_some() && self.resource().is_some()
    }

    fn node_str(&self) -> &str {
        self.node().map(|n| n.as_str()).unwrap_or("")
    }

    fn resource_str(&self) -> &str {
        self.resource().map(|r| r.as_str()).unwrap_or("")
    }

    fn domain_str(&self) -> &str {
        self.domain().as_str()
    }
}

/// Build a full JID from its parts.
pub fn full_jid(node: &str, domain: &str, resource: &str) -> Result<FullJid, XmppError> {
    let raw = if node.is_empty() {
        format!("{}/{}", domain, resource)
    } else {
        format!("{}@{}/{}", node, domain, resource)
    };
    raw.parse()
        .map_err(|e| XmppError::internal(format!("invalid JID {}: {}", raw, e)))
}

/// Build a bare JID from its parts.
pub fn bare_jid(node: &str, domain: &str) -> Result<BareJid, XmppError> {
    let raw = if node.is_empty() {
        domain.to_string()
    } else {
        format!("{}@{}", node, domain)
    };
    raw.parse()
        .map_err(|e| XmppError::internal(format!("invalid JID {}: {}", raw, e)))
}

/// Presence `type` values (RFC 6121 Section 4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    /// No `type` attribute
    Available,
    /// `unavailable`
    Unavailable,
    /// `subscribe`
    Subscribe,
    /// `subscribed`
    Subscribed,
    /// `unsubscribe`
    Unsubscribe,
    /// `unsubscribed`
    Unsubscribed,
    /// `probe`
    Probe,
    /// `error`
    Error,
}

impl PresenceType {
    /// Parse the `type` attribute value.
    pub fn from_attr(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("") => Some(PresenceType::Available),
            Some("unavailable") => Some(PresenceType::Unavailable),
            Some("subscribe") => Some(PresenceType::Subscribe),
            Some("subscribed") => Some(PresenceType::Subscribed),
            Some("unsubscribe") => Some(PresenceType::Unsubscribe),
            Some("unsubscribed") => Some(PresenceType::Unsubscribed),
            Some("probe") => Some(PresenceType::Probe),
            Some("error") => Some(PresenceType::Error),
            Some(_) => None,
        }
    }

    /// The attribute value, `None` for available.
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }
}

/// A validated top-level stanza.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
    kind: StanzaType,
    from: Option<Jid>,
    to: Option<Jid>,
}

fn parse_addr(element: &Element, attr: &str) -> Result<Option<Jid>, XmppError> {
    match element.attr(attr) {
        None | Some("") => Ok(None),
        Some(raw) => raw.parse::<Jid>().map(Some).map_err(|e| {
            XmppError::stanza(
                StanzaErrorCondition::JidMalformed,
                Some(format!("invalid '{}' address: {}", attr, e)),
            )
        }),
    }
}

impl Stanza {
    /// Validate an element as a stanza in `jabber:client`.
    pub fn from_element(element: Element) -> Result<Self, XmppError> {
        if element.ns() != ns::JABBER_CLIENT && element.ns() != ns::JABBER_SERVER {
            return Err(XmppError::bad_request(Some(format!(
                "unexpected namespace {}",
                element.ns()
            ))));
        }
        let kind = match element.name() {
            "iq" => StanzaType::Iq,
            "message" => StanzaType::Message,
            "presence" => StanzaType::Presence,
            other => {
                return Err(XmppError::bad_request(Some(format!(
                    "'{}' is not a stanza",
                    other
                ))))
            }
        };
        let from = parse_addr(&element, "from")?;
        let to = parse_addr(&element, "to")?;
        Ok(Self {
            element,
            kind,
            from,
            to,
        })
    }

    /// Empty `<iq/>` with the given type and id.
    pub fn iq(iq_type: &str, id: &str) -> Self {
        Self {
            element: Element::builder("iq", ns::JABBER_CLIENT)
                .attr("type", iq_type)
                .attr("id", id)
                .build(),
            kind: StanzaType::Iq,
            from: None,
            to: None,
        }
    }

    /// Empty `<message/>` with the given type.
    pub fn message(message_type: Option<&str>) -> Self {
        let mut builder = Element::builder("message", ns::JABBER_CLIENT);
        if let Some(t) = message_type {
            builder = builder.attr("type", t);
        }
        Self {
            element: builder.build(),
            kind: StanzaType::Message,
            from: None,
            to: None,
        }
    }

    /// Empty `<presence/>` of the given type.
    pub fn presence(presence_type: PresenceType) -> Self {
        let mut builder = Element::builder("presence", ns::JABBER_CLIENT);
        if let Some(t) = presence_type.as_attr() {
            builder = builder.attr("type", t);
        }
        Self {
            element: builder.build(),
            kind: StanzaType::Presence,
            from: None,
            to: None,
        }
    }

    /// Stanza kind.
    pub fn kind(&self) -> StanzaType {
        self.kind
    }

    /// Element name (`iq`, `message`, `presence`).
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Consume into the underlying element.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// `from` address.
    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    /// `to` address.
    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Raw `type` attribute.
    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// Replace the `from` address.
    pub fn set_from(&mut self, from: Jid) {
        self.element.set_attr("from", from.to_string());
        self.from = Some(from);
    }

    /// Replace the `to` address.
    pub fn set_to(&mut self, to: Jid) {
        self.element.set_attr("to", to.to_string());
        self.to = Some(to);
    }

    /// Builder-style `from`.
    pub fn with_from(mut self, from: impl Into<Jid>) -> Self {
        self.set_from(from.into());
        self
    }

    /// Builder-style `to`.
    pub fn with_to(mut self, to: impl Into<Jid>) -> Self {
        self.set_to(to.into());
        self
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.element.set_attr(name, value);
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Element) -> Self {
        self.element.append_child(child);
        self
    }

    /// Append a child element.
    pub fn append_child(&mut self, child: Element) {
        self.element.append_child(child);
    }

    /// Remove the first child matching `name` and `namespace`.
    pub fn remove_child(&mut self, name: &str, namespace: &str) -> Option<Element> {
        self.element.remove_child(name, namespace)
    }

    /// First child matching `name` and `namespace`.
    pub fn child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    /// Whether a child matching `name` and `namespace` exists.
    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.element.has_child(name, namespace)
    }

    // --- iq ---

    /// IQ of type `get`.
    pub fn is_iq_get(&self) -> bool {
        self.kind == StanzaType::Iq && self.type_attr() == Some("get")
    }

    /// IQ of type `set`.
    pub fn is_iq_set(&self) -> bool {
        self.kind == StanzaType::Iq && self.type_attr() == Some("set")
    }

    /// IQ of type `result` or `error`.
    pub fn is_iq_response(&self) -> bool {
        self.kind == StanzaType::Iq && matches!(self.type_attr(), Some("result") | Some("error"))
    }

    /// First child of an IQ that is not an `<error/>`.
    pub fn iq_payload(&self) -> Option<&Element> {
        self.element.children().find(|c| c.name() != "error")
    }

    /// Empty `result` reply to this IQ.
    pub fn result_reply(&self) -> Stanza {
        let mut reply = Stanza::iq("result", self.id().unwrap_or_default());
        if let Some(from) = self.to.clone() {
            reply.set_from(from);
        }
        if let Some(to) = self.from.clone() {
            reply.set_to(to);
        }
        reply
    }

    /// `result` reply carrying a payload.
    pub fn result_reply_with(&self, payload: Element) -> Stanza {
        self.result_reply().with_child(payload)
    }

    /// Error reply: the original stanza with addresses swapped and an
    /// `<error/>` child.
    pub fn error_reply(&self, condition: StanzaErrorCondition) -> Stanza {
        self.error_reply_with_text(condition, None)
    }

    /// Error reply with explanatory text.
    pub fn error_reply_with_text(
        &self,
        condition: StanzaErrorCondition,
        text: Option<&str>,
    ) -> Stanza {
        let from = self.to.clone();
        let to = self.from.clone();
        let mut builder = Element::builder(self.element.name(), self.element.ns());
        for (name, value) in self.element.attrs() {
            if !matches!(name, "from" | "to" | "type") {
                builder = builder.attr(name, value);
            }
        }
        builder = builder.attr("type", "error");
        if let Some(ref jid) = from {
            builder = builder.attr("from", jid.to_string());
        }
        if let Some(ref jid) = to {
            builder = builder.attr("to", jid.to_string());
        }
        let mut element = builder.build();
        for child in self.element.children().filter(|c| c.name() != "error") {
            element.append_child(child.clone());
        }
        element.append_child(stanza_error_element(
            condition,
            condition.default_type(),
            text,
        ));
        Stanza {
            element,
            kind: self.kind,
            from,
            to,
        }
    }

    // --- message ---

    /// Message `type`, defaulting to `normal`.
    pub fn message_type(&self) -> &str {
        self.type_attr().unwrap_or("normal")
    }

    /// Message body text, if any.
    pub fn body(&self) -> Option<String> {
        self.element
            .get_child("body", ns::JABBER_CLIENT)
            .or_else(|| self.element.get_child("body", ns::JABBER_SERVER))
            .map(|b| b.text())
    }

    /// Chat message.
    pub fn is_chat(&self) -> bool {
        self.kind == StanzaType::Message && self.message_type() == "chat"
    }

    /// Normal message.
    pub fn is_normal(&self) -> bool {
        self.kind == StanzaType::Message && self.message_type() == "normal"
    }

    /// Message with a body element.
    pub fn is_message_with_body(&self) -> bool {
        self.kind == StanzaType::Message && self.body().is_some()
    }

    // --- presence ---

    /// Presence type, `None` if the attribute is not a known value.
    pub fn presence_type(&self) -> Option<PresenceType> {
        PresenceType::from_attr(self.type_attr())
    }

    /// Available presence.
    pub fn is_available(&self) -> bool {
        self.kind == StanzaType::Presence && self.presence_type() == Some(PresenceType::Available)
    }

    /// Unavailable presence.
    pub fn is_unavailable(&self) -> bool {
        self.kind == StanzaType::Presence
            && self.presence_type() == Some(PresenceType::Unavailable)
    }

    /// Presence priority, 0 when absent or malformed.
    pub fn priority(&self) -> i8 {
        self.element
            .get_child("priority", ns::JABBER_CLIENT)
            .and_then(|p| p.text().trim().parse::<i8>().ok())
            .unwrap_or(0)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = XmppError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Stanza::from_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        stanza.element
    }
}

/// `<delay xmlns='urn:xmpp:delay'/>` stamped with `stamp`.
pub fn delay_element(from: &str, stamp: chrono::DateTime<chrono::Utc>) -> Element {
    Element::builder("delay", ns::DELAY)
        .attr("from", from)
        .attr(
            "stamp",
            stamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        )
        .build()
}
