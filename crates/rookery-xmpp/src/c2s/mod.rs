//! Client-to-server streams.
//!
//! A [`C2sSession`] owns one connection: it negotiates the stream, runs SASL
//! and resource binding, then feeds stanzas into the hook bus and the router.
//! Other tasks talk to it only through its [`LocalStream`] handle.

pub mod listener;
pub mod session;
pub mod stream;
pub mod transport;

pub use listener::C2sListener;
pub use session::C2sSession;
pub use stream::LocalStream;
pub use transport::{SocketTransport, Transport};

use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;

use crate::config::{CompressionLevel, ListenerConfig, ResourceConflict, SaslMechanismName};
use crate::hook::Hooks;
use crate::host::Hosts;
use crate::module::Modules;
use crate::router::Router;
use crate::shaper::Shapers;
use crate::storage::Repository;

/// Per-listener session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for the first stream header
    pub conn_timeout: Duration,
    /// Deadline for completing SASL; zero disables it
    pub auth_timeout: Duration,
    /// Idle read deadline once the stream is open; zero disables it
    pub keep_alive_timeout: Duration,
    /// Budget for processing one inbound element
    pub req_timeout: Duration,
    /// Largest accepted top-level element in bytes
    pub max_stanza_size: usize,
    /// Compression offered after authentication
    pub compression_level: CompressionLevel,
    /// Bind conflict policy
    pub resource_conflict: ResourceConflict,
    /// SASL mechanisms to offer
    pub sasl_mechanisms: Vec<SaslMechanismName>,
    /// The listener already terminated TLS
    pub use_tls: bool,
    /// Certificates for STARTTLS
    pub tls_config: Option<Arc<ServerConfig>>,
}

impl SessionConfig {
    /// Settings for sessions accepted on `listener`.
    pub fn from_listener(listener: &ListenerConfig, tls_config: Option<Arc<ServerConfig>>) -> Self {
        Self {
            conn_timeout: listener.conn_timeout,
            auth_timeout: listener.auth_timeout,
            keep_alive_timeout: listener.keep_alive_timeout,
            req_timeout: listener.req_timeout,
            max_stanza_size: listener.max_stanza_size,
            compression_level: listener.compression_level,
            resource_conflict: listener.resource_conflict,
            sasl_mechanisms: listener.sasl.mechanisms.clone(),
            use_tls: listener.direct_tls,
            tls_config,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_listener(&ListenerConfig::default(), None)
    }
}

/// Collaborators shared by every session of the instance.
#[derive(Clone)]
pub struct C2sContext {
    /// Local domains
    pub hosts: Arc<Hosts>,
    /// Global router
    pub router: Arc<Router>,
    /// Hook bus
    pub hooks: Arc<Hooks>,
    /// Session caps and rate limits
    pub shapers: Arc<Shapers>,
    /// Enabled modules
    pub modules: Arc<Modules>,
    /// Account storage for SASL
    pub repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for C2sContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("C2sContext")
            .field("hosts", &self.hosts)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}
