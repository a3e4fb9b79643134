//! Delivery to client resources anywhere in the cluster.

use std::sync::Arc;

use jid::FullJid;
use tracing::{debug, instrument, warn};

use crate::c2s::LocalStream;
use crate::cluster::ClusterRouter;
use crate::error::StreamError;
use crate::resource::{same_user, ResourceDesc, ResourceDirectory};
use crate::router::local::LocalRouter;
use crate::router::{RouteError, RoutingOptions};
use crate::stanza::{JidExt, Stanza};
use crate::storage::Repository;
use crate::types::{StanzaType, StreamId};
use crate::XmppError;

/// Applies the RFC 6121 delivery rules over the resource directory and
/// picks local or cluster delivery per resource.
pub struct C2sRouter {
    instance_id: String,
    local: Arc<LocalRouter>,
    cluster: Arc<dyn ClusterRouter>,
    directory: Arc<ResourceDirectory>,
    repository: Arc<dyn Repository>,
}

impl C2sRouter {
    /// Compose the router for the instance owning `directory`.
    pub fn new(
        local: Arc<LocalRouter>,
        cluster: Arc<dyn ClusterRouter>,
        directory: Arc<ResourceDirectory>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        Self {
            instance_id: directory.instance_id().to_string(),
            local,
            cluster,
            directory,
            repository,
        }
    }

    /// Route `stanza` to a local-domain recipient. Returns the resources
    /// it was delivered to.
    #[instrument(skip(self, stanza), fields(instance_id = %self.instance_id))]
    pub async fn route(
        &self,
        stanza: Stanza,
        options: RoutingOptions,
    ) -> Result<Vec<FullJid>, RouteError> {
        let to = stanza
            .to()
            .cloned()
            .ok_or_else(|| RouteError::Internal("stanza has no recipient".into()))?;
        let username = to.node_str();

        if options.check_user_existence {
            let exists = self
                .repository
                .user_exists(username)
                .await
                .map_err(|e| RouteError::Internal(e.to_string()))?;
            if !exists {
                return Err(RouteError::NotExistingAccount);
            }
        }

        let resources: Vec<ResourceDesc> = self
            .directory
            .get_all(username)
            .into_iter()
            .filter(|desc| same_user(desc, &to))
            .collect();
        if resources.is_empty() {
            return Err(RouteError::UserNotAvailable);
        }

        if to.is_full_with_user() {
            let desc = resources
                .iter()
                .find(|desc| desc.resource() == to.resource_str())
                .ok_or(RouteError::ResourceNotFound)?;
            self.route_to(stanza, desc).await?;
            return Ok(vec![desc.jid().clone()]);
        }

        match stanza.kind() {
            StanzaType::Message => self.route_to_priority_resources(stanza, &resources).await,
            _ => self.route_to_all(stanza, &resources).await,
        }
    }

    /// Deliver to one resource, locally or through the cluster.
    pub async fn route_to(&self, stanza: Stanza, desc: &ResourceDesc) -> Result<(), RouteError> {
        if desc.instance_id() == self.instance_id {
            self.local.route(stanza, desc.username(), desc.resource())
        } else {
            self.cluster
                .route(stanza, desc.username(), desc.resource(), desc.instance_id())
                .await
        }
    }

    async fn route_to_priority_resources(
        &self,
        stanza: Stanza,
        resources: &[ResourceDesc],
    ) -> Result<Vec<FullJid>, RouteError> {
        let top = resources
            .iter()
            .filter(|desc| desc.is_available())
            .map(ResourceDesc::priority)
            .max();
        let Some(top) = top.filter(|p| *p >= 0) else {
            return Err(RouteError::UserNotAvailable);
        };
        let targets: Vec<ResourceDesc> = resources
            .iter()
            .filter(|desc| desc.is_available() && desc.priority() == top)
            .cloned()
            .collect();
        self.route_to_all(stanza, &targets).await
    }

    async fn route_to_all(
        &self,
        stanza: Stanza,
        resources: &[ResourceDesc],
    ) -> Result<Vec<FullJid>, RouteError> {
        let mut delivered = Vec::with_capacity(resources.len());
        let mut last_error = None;
        for desc in resources {
            match self.route_to(stanza.clone(), desc).await {
                Ok(()) => delivered.push(desc.jid().clone()),
                Err(e) => {
                    warn!(jid = %desc.jid(), error = %e, "Delivery to resource failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered.is_empty() => Err(e),
            _ => Ok(delivered),
        }
    }

    /// Disconnect the stream behind `desc`, locally or through the cluster.
    #[instrument(skip(self, desc, error), fields(jid = %desc.jid()))]
    pub async fn disconnect(&self, desc: &ResourceDesc, error: StreamError) -> Result<(), RouteError> {
        debug!(condition = %error.condition, "Disconnecting resource");
        if desc.instance_id() == self.instance_id {
            self.local
                .disconnect(desc.username(), desc.resource(), error)
                .await
        } else {
            self.cluster
                .disconnect(desc.username(), desc.resource(), error, desc.instance_id())
                .await
        }
    }

    /// Disconnect `username/resource` wherever it is bound.
    pub async fn disconnect_resource(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), RouteError> {
        let desc = self
            .directory
            .get(username, resource)
            .ok_or(RouteError::ResourceNotFound)?;
        self.disconnect(&desc, error).await
    }

    /// Track a freshly accepted stream.
    pub fn register(&self, stream: LocalStream) -> Result<(), XmppError> {
        self.local.register(stream)
    }

    /// Mark a registered stream as bound.
    pub fn bind(&self, id: StreamId) -> Result<LocalStream, XmppError> {
        self.local.bind(id)
    }

    /// Forget a stream.
    pub fn unregister(&self, stream: &LocalStream) {
        self.local.unregister(stream)
    }

    /// Handle of a stream bound on this instance.
    pub fn local_stream(&self, username: &str, resource: &str) -> Option<LocalStream> {
        self.local.stream(username, resource)
    }

    /// Per-instance stream registry.
    pub fn local(&self) -> &Arc<LocalRouter> {
        &self.local
    }

    /// Cluster resource view.
    pub fn directory(&self) -> &Arc<ResourceDirectory> {
        &self.directory
    }

    /// Account storage consulted for existence checks.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// This instance's id.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

impl std::fmt::Debug for C2sRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("C2sRouter")
            .field("instance_id", &self.instance_id)
            .field("local", &self.local)
            .finish()
    }
}
