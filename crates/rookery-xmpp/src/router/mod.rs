//! Stanza routing.
//!
//! [`Router`] is the entry point used by sessions and modules. It picks a
//! destination by the recipient's domain:
//!
//! 1. Local domains go to the [`C2sRouter`], which applies the XMPP delivery
//!    rules against the cluster resource directory.
//! 2. Component hosts go to the [`Components`] collaborator.
//! 3. Everything else goes to the [`S2sRouter`].

pub mod c2s;
pub mod local;
pub mod s2s_in;

pub use c2s::C2sRouter;
pub use local::LocalRouter;
pub use s2s_in::S2sInHandler;

use std::sync::Arc;

use async_trait::async_trait;
use jid::FullJid;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::error::{StanzaErrorCondition, StreamError};
use crate::host::Hosts;
use crate::metrics;
use crate::stanza::{JidExt, Stanza};

/// Routing failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// The recipient account does not exist
    #[error("account does not exist")]
    NotExistingAccount,
    /// The recipient has no resource that can take the stanza
    #[error("user not available")]
    UserNotAvailable,
    /// The addressed resource is not bound
    #[error("resource not found")]
    ResourceNotFound,
    /// The remote domain cannot be reached
    #[error("remote server not found")]
    RemoteServerNotFound,
    /// The remote domain did not answer in time
    #[error("remote server timeout")]
    RemoteServerTimeout,
    /// Anything else
    #[error("routing failed: {0}")]
    Internal(String),
}

impl RouteError {
    /// The stanza error reported to the originator.
    pub fn stanza_condition(&self) -> StanzaErrorCondition {
        match self {
            RouteError::NotExistingAccount
            | RouteError::UserNotAvailable
            | RouteError::ResourceNotFound => StanzaErrorCondition::ServiceUnavailable,
            RouteError::RemoteServerNotFound => StanzaErrorCondition::RemoteServerNotFound,
            RouteError::RemoteServerTimeout => StanzaErrorCondition::RemoteServerTimeout,
            RouteError::Internal(_) => StanzaErrorCondition::InternalServerError,
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RouteError::NotExistingAccount => "not_existing_account",
            RouteError::UserNotAvailable => "user_not_available",
            RouteError::ResourceNotFound => "resource_not_found",
            RouteError::RemoteServerNotFound => "remote_server_not_found",
            RouteError::RemoteServerTimeout => "remote_server_timeout",
            RouteError::Internal(_) => "internal",
        }
    }
}

/// Per-call routing options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingOptions {
    /// Fail with `NotExistingAccount` when the recipient has no account
    pub check_user_existence: bool,
}

impl RoutingOptions {
    /// Options with the existence check enabled.
    pub fn check_user_existence() -> Self {
        Self {
            check_user_existence: true,
        }
    }
}

/// Opaque forwarder to remote domains.
#[async_trait]
pub trait S2sRouter: Send + Sync {
    /// Forward `stanza` to its remote recipient.
    async fn route(&self, stanza: Stanza) -> Result<(), RouteError>;
}

/// S2S router used when federation is not configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnreachableS2sRouter;

#[async_trait]
impl S2sRouter for UnreachableS2sRouter {
    async fn route(&self, _stanza: Stanza) -> Result<(), RouteError> {
        Err(RouteError::RemoteServerNotFound)
    }
}

/// External components bridged into the server.
#[async_trait]
pub trait Components: Send + Sync {
    /// Whether `domain` is served by a component.
    fn is_component_host(&self, domain: &str) -> bool;

    /// Hand `stanza` to the component serving its recipient.
    async fn process_stanza(&self, stanza: Stanza) -> Result<(), RouteError>;
}

/// Component set with no members.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoComponents;

#[async_trait]
impl Components for NoComponents {
    fn is_component_host(&self, _domain: &str) -> bool {
        false
    }

    async fn process_stanza(&self, _stanza: Stanza) -> Result<(), RouteError> {
        Err(RouteError::RemoteServerNotFound)
    }
}

/// Global router.
pub struct Router {
    hosts: Arc<Hosts>,
    c2s: Arc<C2sRouter>,
    s2s: Arc<dyn S2sRouter>,
    components: Arc<dyn Components>,
}

impl Router {
    /// Compose the global router.
    pub fn new(
        hosts: Arc<Hosts>,
        c2s: Arc<C2sRouter>,
        s2s: Arc<dyn S2sRouter>,
        components: Arc<dyn Components>,
    ) -> Self {
        Self {
            hosts,
            c2s,
            s2s,
            components,
        }
    }

    /// Local domain registry.
    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    /// C2S delivery layer.
    pub fn c2s(&self) -> &Arc<C2sRouter> {
        &self.c2s
    }

    /// Component collaborator.
    pub fn components(&self) -> &Arc<dyn Components> {
        &self.components
    }

    /// Route `stanza` to its recipient. Returns the local resources it was
    /// delivered to (empty for remote and component delivery).
    #[instrument(skip(self, stanza), fields(kind = %stanza.kind(), to = ?stanza.to().map(|j| j.to_string())))]
    pub async fn route(
        &self,
        stanza: Stanza,
        options: RoutingOptions,
    ) -> Result<Vec<FullJid>, RouteError> {
        let Some(to) = stanza.to().cloned() else {
            return Err(RouteError::Internal("stanza has no recipient".into()));
        };
        let result = if self.hosts.is_local_host(to.domain_str()) {
            self.c2s.route(stanza, options).await
        } else if self.components.is_component_host(to.domain_str()) {
            self.components.process_stanza(stanza).await.map(|_| Vec::new())
        } else {
            self.s2s.route(stanza).await.map(|_| Vec::new())
        };
        match result {
            Ok(ref targets) => {
                debug!(targets = targets.len(), "Stanza routed");
                metrics::record_route("delivered");
            }
            Err(ref e) => {
                debug!(error = %e, "Stanza not routed");
                metrics::record_route(e.label());
            }
        }
        result
    }

    /// Disconnect a bound resource wherever it lives.
    pub async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), RouteError> {
        self.c2s.disconnect_resource(username, resource, error).await
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").field("hosts", &self.hosts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_error_mapping() {
        assert_eq!(
            RouteError::ResourceNotFound.stanza_condition(),
            StanzaErrorCondition::ServiceUnavailable
        );
        assert_eq!(
            RouteError::RemoteServerNotFound.stanza_condition(),
            StanzaErrorCondition::RemoteServerNotFound
        );
        assert_eq!(
            RouteError::RemoteServerTimeout.stanza_condition(),
            StanzaErrorCondition::RemoteServerTimeout
        );
        assert_eq!(
            RouteError::Internal("x".into()).stanza_condition(),
            StanzaErrorCondition::InternalServerError
        );
    }

    #[tokio::test]
    async fn test_default_collaborators_fail() {
        let stanza = Stanza::message(Some("chat")).with_to("noelia@jabber.org".parse::<jid::Jid>().unwrap());
        assert_eq!(
            UnreachableS2sRouter.route(stanza.clone()).await,
            Err(RouteError::RemoteServerNotFound)
        );
        assert!(!NoComponents.is_component_host("jabber.org"));
    }
}
