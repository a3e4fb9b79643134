//! # rookery-xmpp
//!
//! Core of a clustered XMPP server.
//!
//! Each instance accepts client connections, authenticates them with SASL,
//! binds resources and routes stanzas. Instances share a key-value store
//! that mirrors every bound resource, so a stanza accepted anywhere in the
//! cluster reaches the instance that owns the recipient's stream.
//!
//! ## Architecture
//!
//! - **Sessions**: one [`c2s::C2sSession`] task per connection drives the
//!   RFC 6120 stream state machine; other tasks reach it through its
//!   [`c2s::LocalStream`] handle.
//! - **Hooks**: [`hook::Hooks`] is a prioritised, named event bus. Modules
//!   extend the stanza pipeline by registering handlers on it.
//! - **Routing**: [`router::Router`] dispatches by domain to the C2S router
//!   (local and cluster delivery), components or S2S.
//! - **Directory**: [`resource::ResourceDirectory`] keeps a local mirror of
//!   every resource bound in the cluster.
//! - **Modules**: roster and presence, offline storage, message carbons,
//!   message archive, ping, disco, version and private storage.
//!
//! ## XEP Support
//!
//! - RFC 6120/6121 (XMPP Core/IM)
//! - XEP-0030 (Service Discovery)
//! - XEP-0049 (Private XML Storage)
//! - XEP-0092 (Software Version)
//! - XEP-0138 (Stream Compression)
//! - XEP-0160 (Offline Messages)
//! - XEP-0199 (XMPP Ping)
//! - XEP-0280 (Message Carbons)
//! - XEP-0313 (Message Archive Management)

pub mod auth;
pub mod c2s;
pub mod cluster;
pub mod config;
pub mod hook;
pub mod host;
pub mod metrics;
pub mod module;
pub mod parser;
pub mod resource;
pub mod router;
pub mod server;
pub mod shaper;
pub mod stanza;
pub mod storage;

mod error;
mod types;

pub use error::{
    stanza_error_element, StanzaErrorCondition, StanzaErrorType, StreamError,
    StreamErrorCondition, XmppError,
};
pub use server::{ServerParts, XmppServer};
pub use types::{SessionFlags, SessionState, StanzaType, StreamId, TransportType};
