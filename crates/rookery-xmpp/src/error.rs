//! Error types for the XMPP server.

use minidom::Element;
use thiserror::Error;

use crate::cluster::KvError;
use crate::parser::ns;
use crate::router::RouteError;
use crate::storage::StorageError;

/// XMPP server errors.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error (network, file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Fatal stream error; the connection is closed after sending it.
    #[error("Stream error: {0}")]
    Stream(StreamError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Repository failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cluster key-value store failure
    #[error("KV error: {0}")]
    Kv(#[from] KvError),

    /// Routing failure
    #[error("Routing error: {0}")]
    Route(#[from] RouteError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Stanza error (replied to the offender, the stream continues)
    #[error("Stanza error: {condition}")]
    Stanza {
        /// Error condition
        condition: StanzaErrorCondition,
        /// Error type
        error_type: StanzaErrorType,
        /// Optional text description
        text: Option<String>,
    },
}

impl XmppError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new stream error with the given condition.
    pub fn stream(condition: StreamErrorCondition) -> Self {
        Self::Stream(StreamError::new(condition))
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a stanza error using the condition's default error type.
    pub fn stanza(condition: StanzaErrorCondition, text: Option<String>) -> Self {
        Self::Stanza {
            condition,
            error_type: condition.default_type(),
            text,
        }
    }

    /// Create a stanza error for 'bad-request'.
    pub fn bad_request(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::BadRequest, text)
    }

    /// Create a stanza error for 'item-not-found'.
    pub fn item_not_found(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ItemNotFound, text)
    }

    /// Create a stanza error for 'forbidden'.
    pub fn forbidden(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::Forbidden, text)
    }

    /// Create a stanza error for 'not-allowed'.
    pub fn not_allowed(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAllowed, text)
    }

    /// Create a stanza error for 'not-acceptable'.
    pub fn not_acceptable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::NotAcceptable, text)
    }

    /// Create a stanza error for 'internal-server-error'.
    pub fn internal_server_error(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::InternalServerError, text)
    }

    /// Create a stanza error for 'service-unavailable'.
    pub fn service_unavailable(text: Option<String>) -> Self {
        Self::stanza(StanzaErrorCondition::ServiceUnavailable, text)
    }

    /// The stanza error condition a client should see for this error.
    ///
    /// Anything that is not already a stanza error is reported as
    /// `internal-server-error`.
    pub fn stanza_condition(&self) -> StanzaErrorCondition {
        match self {
            Self::Stanza { condition, .. } => *condition,
            Self::Route(err) => err.stanza_condition(),
            _ => StanzaErrorCondition::InternalServerError,
        }
    }
}

/// XMPP stanza error conditions (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// Bad request (malformed XML, etc.)
    BadRequest,
    /// Conflict (e.g., resource already bound)
    Conflict,
    /// Feature not implemented
    FeatureNotImplemented,
    /// Forbidden (permission denied)
    Forbidden,
    /// Internal server error
    InternalServerError,
    /// Item not found
    ItemNotFound,
    /// JID malformed
    JidMalformed,
    /// Not acceptable
    NotAcceptable,
    /// Not allowed
    NotAllowed,
    /// Not authorized
    NotAuthorized,
    /// Policy violation
    PolicyViolation,
    /// Recipient unavailable
    RecipientUnavailable,
    /// Remote server not found
    RemoteServerNotFound,
    /// Remote server timeout
    RemoteServerTimeout,
    /// Resource constraint
    ResourceConstraint,
    /// Service unavailable
    ServiceUnavailable,
    /// Subscription required
    SubscriptionRequired,
    /// Undefined condition
    UndefinedCondition,
    /// Unexpected request
    UnexpectedRequest,
}

impl StanzaErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::InternalServerError => "internal-server-error",
            Self::ItemNotFound => "item-not-found",
            Self::JidMalformed => "jid-malformed",
            Self::NotAcceptable => "not-acceptable",
            Self::NotAllowed => "not-allowed",
            Self::NotAuthorized => "not-authorized",
            Self::PolicyViolation => "policy-violation",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
            Self::SubscriptionRequired => "subscription-required",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnexpectedRequest => "unexpected-request",
        }
    }

    /// Error type recommended by RFC 6120 for this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest | Self::JidMalformed | Self::NotAcceptable | Self::PolicyViolation => {
                StanzaErrorType::Modify
            }
            Self::Forbidden | Self::NotAuthorized | Self::SubscriptionRequired => {
                StanzaErrorType::Auth
            }
            Self::InternalServerError
            | Self::RecipientUnavailable
            | Self::RemoteServerTimeout
            | Self::ResourceConstraint
            | Self::UnexpectedRequest => StanzaErrorType::Wait,
            Self::Conflict
            | Self::FeatureNotImplemented
            | Self::ItemNotFound
            | Self::NotAllowed
            | Self::RemoteServerNotFound
            | Self::ServiceUnavailable
            | Self::UndefinedCondition => StanzaErrorType::Cancel,
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// XMPP stanza error types (RFC 6120 Section 8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after providing credentials
    Auth,
    /// Do not retry (unrecoverable error)
    Cancel,
    /// Retry after changing the data sent
    Modify,
    /// Retry after waiting (temporary error)
    Wait,
}

impl StanzaErrorType {
    /// Get the type attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }
}

impl std::fmt::Display for StanzaErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `<error/>` child carried by an error stanza.
pub fn stanza_error_element(
    condition: StanzaErrorCondition,
    error_type: StanzaErrorType,
    text: Option<&str>,
) -> Element {
    let mut error = Element::builder("error", ns::JABBER_CLIENT)
        .attr("type", error_type.as_str())
        .append(Element::builder(condition.as_str(), ns::STANZAS).build())
        .build();
    if let Some(text) = text {
        error.append_child(
            Element::builder("text", ns::STANZAS)
                .append(text.to_string())
                .build(),
        );
    }
    error
}

/// XMPP stream error conditions (RFC 6120 Section 4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Malformed stream element
    BadFormat,
    /// Idle or unresponsive peer
    ConnectionTimeout,
    /// `to` names a domain not served here
    HostUnknown,
    /// Server-side failure
    InternalServerError,
    /// Wrong stream or content namespace
    InvalidNamespace,
    /// XML that failed validation
    InvalidXml,
    /// Stanza before authentication
    NotAuthorized,
    /// Syntactically broken XML
    NotWellFormed,
    /// Local policy violated (rate, size, sessions)
    PolicyViolation,
    /// Stream restart forced by the server
    Reset,
    /// Server shutting down
    SystemShutdown,
    /// Generic failure
    UndefinedCondition,
    /// Unknown top-level element
    UnsupportedStanzaType,
    /// Stream version not supported
    UnsupportedVersion,
}

impl StreamErrorCondition {
    /// Get the element name for this condition.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadFormat => "bad-format",
            Self::ConnectionTimeout => "connection-timeout",
            Self::HostUnknown => "host-unknown",
            Self::InternalServerError => "internal-server-error",
            Self::InvalidNamespace => "invalid-namespace",
            Self::InvalidXml => "invalid-xml",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::PolicyViolation => "policy-violation",
            Self::Reset => "reset",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stream error with an optional application-specific condition.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// Defined condition
    pub condition: StreamErrorCondition,
    /// Application-specific child, e.g. `<resource-conflict/>`
    pub application: Option<Element>,
    /// Optional human readable text
    pub text: Option<String>,
}

impl StreamError {
    /// Create a stream error with only a defined condition.
    pub fn new(condition: StreamErrorCondition) -> Self {
        Self {
            condition,
            application: None,
            text: None,
        }
    }

    /// Attach an application-specific condition element.
    pub fn with_application(mut self, application: Element) -> Self {
        self.application = Some(application);
        self
    }

    /// Attach descriptive text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// `policy-violation` carrying `<resource-conflict/>`.
    pub fn resource_conflict() -> Self {
        Self::new(StreamErrorCondition::PolicyViolation).with_application(
            Element::builder("resource-conflict", ns::APP_ERRORS).build(),
        )
    }

    /// `policy-violation` carrying `<reached-max-session-count/>`.
    pub fn reached_max_session_count() -> Self {
        Self::new(StreamErrorCondition::PolicyViolation).with_application(
            Element::builder("reached-max-session-count", ns::APP_ERRORS).build(),
        )
    }

    /// Build the `<stream:error/>` element.
    pub fn to_element(&self) -> Element {
        let mut error = Element::builder("error", ns::STREAM)
            .append(Element::builder(self.condition.as_str(), ns::STREAM_ERRORS).build())
            .build();
        if let Some(ref text) = self.text {
            error.append_child(
                Element::builder("text", ns::STREAM_ERRORS)
                    .append(text.clone())
                    .build(),
            );
        }
        if let Some(ref app) = self.application {
            error.append_child(app.clone());
        }
        error
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.application {
            Some(ref app) => write!(f, "{} ({})", self.condition, app.name()),
            None => write!(f, "{}", self.condition),
        }
    }
}

impl From<StreamErrorCondition> for StreamError {
    fn from(condition: StreamErrorCondition) -> Self {
        Self::new(condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stanza_error_element() {
        let error = stanza_error_element(
            StanzaErrorCondition::ServiceUnavailable,
            StanzaErrorType::Cancel,
            Some("nobody home"),
        );

        assert_eq!(error.attr("type"), Some("cancel"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
        assert_eq!(
            error.get_child("text", ns::STANZAS).map(|t| t.text()),
            Some("nobody home".to_string())
        );
    }

    #[test]
    fn test_stream_error_with_application_condition() {
        let err = StreamError::resource_conflict();
        let elem = err.to_element();

        assert!(elem.is("error", ns::STREAM));
        assert!(elem.has_child("policy-violation", ns::STREAM_ERRORS));
        assert!(elem.has_child("resource-conflict", ns::APP_ERRORS));
        assert_eq!(err.to_string(), "policy-violation (resource-conflict)");
    }

    #[test]
    fn test_stanza_error_conditions() {
        assert_eq!(StanzaErrorCondition::BadRequest.as_str(), "bad-request");
        assert_eq!(StanzaErrorCondition::NotAuthorized.as_str(), "not-authorized");
        assert_eq!(StanzaErrorCondition::ItemNotFound.as_str(), "item-not-found");
        assert_eq!(
            StanzaErrorCondition::ServiceUnavailable.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(
            StanzaErrorCondition::InternalServerError.default_type(),
            StanzaErrorType::Wait
        );
    }

    #[test]
    fn test_stanza_condition_mapping() {
        let err = XmppError::Route(RouteError::ResourceNotFound);
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::ServiceUnavailable);

        let err = XmppError::internal("boom");
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::InternalServerError);
    }
}
