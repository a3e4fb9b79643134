//! Forwarding of stanzas and disconnects to peer instances.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::error::StreamError;
use crate::router::local::LocalRouter;
use crate::router::RouteError;
use crate::stanza::Stanza;

/// Delivery to resources bound on another instance.
#[async_trait]
pub trait ClusterRouter: Send + Sync {
    /// Deliver `stanza` to `username/resource` on `instance_id`.
    async fn route(
        &self,
        stanza: Stanza,
        username: &str,
        resource: &str,
        instance_id: &str,
    ) -> Result<(), RouteError>;

    /// Disconnect `username/resource` on `instance_id`.
    async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
        instance_id: &str,
    ) -> Result<(), RouteError>;
}

/// Single-instance deployments: every forward fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopClusterRouter;

#[async_trait]
impl ClusterRouter for NoopClusterRouter {
    async fn route(
        &self,
        _stanza: Stanza,
        _username: &str,
        _resource: &str,
        instance_id: &str,
    ) -> Result<(), RouteError> {
        Err(RouteError::Internal(format!(
            "no cluster router for instance {}",
            instance_id
        )))
    }

    async fn disconnect(
        &self,
        _username: &str,
        _resource: &str,
        _error: StreamError,
        instance_id: &str,
    ) -> Result<(), RouteError> {
        Err(RouteError::Internal(format!(
            "no cluster router for instance {}",
            instance_id
        )))
    }
}

/// Cluster router for instances living in the same process.
///
#[derive(Default)]
pub struct InProcessClusterRouter {
    members: DashMap<String, Arc<LocalRouter>>,
}

impl InProcessClusterRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `router` reachable as `instance_id`.
    pub fn register(&self, instance_id: &str, router: Arc<LocalRouter>) {
        self.members.insert(instance_id.to_string(), router);
    }

    /// Forget `instance_id`.
    pub fn unregister(&self, instance_id: &str) {
        self.members.remove(instance_id);
    }

    fn member(&self, instance_id: &str) -> Result<Arc<LocalRouter>, RouteError> {
        self.members
            .get(instance_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RouteError::Internal(format!("unknown instance {}", instance_id)))
    }
}

impl std::fmt::Debug for InProcessClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let members: Vec<String> = self.members.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("InProcessClusterRouter")
            .field("members", &members)
            .finish()
    }
}

#[async_trait]
impl ClusterRouter for InProcessClusterRouter {
    #[instrument(skip(self, stanza))]
    async fn route(
        &self,
        stanza: Stanza,
        username: &str,
        resource: &str,
        instance_id: &str,
    ) -> Result<(), RouteError> {
        let member = self.member(instance_id)?;
        debug!("Forwarding stanza to peer instance");
        member.route(stanza, username, resource)
    }

    #[instrument(skip(self, error))]
    async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
        instance_id: &str,
    ) -> Result<(), RouteError> {
        let member = self.member(instance_id)?;
        member.disconnect(username, resource, error).await
    }
}
