//! Common types for the XMPP server.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing identifier of a C2S stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u64);

impl StreamId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c2s:{}", self.0)
    }
}

/// Session state in the XMPP stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a stream header
    Connecting,
    /// Stream opened, pre-authentication
    Connected,
    /// SASL exchange in progress
    Authenticating,
    /// Authenticated, waiting for resource binding
    Authenticated,
    /// Resource bound, stanzas flow
    Bound,
    /// Outbound stream closed, termination pending
    Disconnected,
    /// Absorbing final state
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Authenticating => write!(f, "authenticating"),
            SessionState::Authenticated => write!(f, "authenticated"),
            SessionState::Bound => write!(f, "bound"),
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Per-session negotiation flags. Flags only rise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    secured: bool,
    authenticated: bool,
    compressed: bool,
    bound: bool,
    session_started: bool,
}

impl SessionFlags {
    /// TLS is active on the transport.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// SASL completed successfully.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Stream compression is active.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// A resource is bound.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// The legacy session IQ was answered.
    pub fn is_session_started(&self) -> bool {
        self.session_started
    }

    pub(crate) fn set_secured(&mut self) {
        self.secured = true;
    }

    pub(crate) fn set_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub(crate) fn set_compressed(&mut self) {
        self.compressed = true;
    }

    pub(crate) fn set_bound(&mut self) {
        self.bound = true;
    }

    pub(crate) fn set_session_started(&mut self) {
        self.session_started = true;
    }
}

/// Transport family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Raw TCP socket (STARTTLS, compression available)
    Socket,
    /// WebSocket framing (TLS terminated outside)
    WebSocket,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Socket => write!(f, "socket"),
            TransportType::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Stanza type for metrics and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaType {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// IQ (info/query) stanza
    Iq,
    /// Anything else
    Other,
}

impl std::fmt::Display for StanzaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StanzaType::Message => write!(f, "message"),
            StanzaType::Presence => write!(f, "presence"),
            StanzaType::Iq => write!(f, "iq"),
            StanzaType::Other => write!(f, "other"),
        }
    }
}
