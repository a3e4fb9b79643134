//! Server assembly.
//!
//! [`XmppServer`] wires one instance together from [`XmppServerConfig`] and
//! the external collaborators (storage, cluster KV, cluster router, S2S and
//! components), starts the directory, modules and listeners, and tears them
//! down in reverse order.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::c2s::{C2sContext, C2sListener};
use crate::cluster::{ClusterRouter, KvStore, MemberList, NoopClusterRouter};
use crate::config::XmppServerConfig;
use crate::hook::Hooks;
use crate::host::Hosts;
use crate::module::{ModuleContext, Modules};
use crate::resource::ResourceDirectory;
use crate::router::{
    C2sRouter, Components, LocalRouter, NoComponents, Router, S2sInHandler, S2sRouter,
    UnreachableS2sRouter,
};
use crate::shaper::Shapers;
use crate::storage::Repository;
use crate::XmppError;

/// External collaborators of an instance.
#[derive(Clone)]
pub struct ServerParts {
    /// Persistent storage
    pub repository: Arc<dyn Repository>,
    /// Cluster coordination store
    pub kv: Arc<dyn KvStore>,
    /// Forwarder to streams bound on other instances
    pub cluster: Arc<dyn ClusterRouter>,
    /// Forwarder to remote domains
    pub s2s: Arc<dyn S2sRouter>,
    /// External components
    pub components: Arc<dyn Components>,
}

impl ServerParts {
    /// Single-instance parts: no peers, no federation, no components.
    pub fn standalone(repository: Arc<dyn Repository>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            repository,
            kv,
            cluster: Arc::new(NoopClusterRouter),
            s2s: Arc::new(UnreachableS2sRouter),
            components: Arc::new(NoComponents),
        }
    }

    /// Replace the cluster router.
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterRouter>) -> Self {
        self.cluster = cluster;
        self
    }
}

/// One running instance.
pub struct XmppServer {
    instance_id: String,
    config: XmppServerConfig,
    kv: Arc<dyn KvStore>,
    hooks: Arc<Hooks>,
    hosts: Arc<Hosts>,
    members: Arc<MemberList>,
    directory: Arc<ResourceDirectory>,
    local: Arc<LocalRouter>,
    router: Arc<Router>,
    modules: Arc<Modules>,
    s2s_in: Arc<S2sInHandler>,
    c2s: C2sContext,
    shutdown: CancellationToken,
    listeners: Mutex<Vec<(SocketAddr, JoinHandle<()>)>>,
}

impl XmppServer {
    /// Build every component of the instance. Nothing runs until [`start`].
    ///
    /// [`start`]: XmppServer::start
    pub fn new(
        instance_id: impl Into<String>,
        config: XmppServerConfig,
        parts: ServerParts,
    ) -> Result<Self, XmppError> {
        let instance_id = instance_id.into();
        let hooks = Arc::new(Hooks::new());
        let hosts = Arc::new(Hosts::from_config(&config.default_host, &config.hosts)?);
        let shapers = Arc::new(Shapers::from_config(&config.shapers)?);

        let members = MemberList::new(instance_id.clone(), parts.kv.clone(), hooks.clone());
        let directory = ResourceDirectory::new(instance_id.clone(), parts.kv.clone(), hooks.clone());
        let local = Arc::new(LocalRouter::new());
        let c2s_router = Arc::new(C2sRouter::new(
            local.clone(),
            parts.cluster,
            directory.clone(),
            parts.repository.clone(),
        ));
        let router = Arc::new(Router::new(hosts.clone(), c2s_router, parts.s2s, parts.components));

        let modules = Arc::new(Modules::from_config(
            &config.modules,
            &ModuleContext {
                hosts: hosts.clone(),
                router: router.clone(),
                hooks: hooks.clone(),
                repository: parts.repository.clone(),
            },
        ));
        let s2s_in = Arc::new(S2sInHandler::new(router.clone(), hooks.clone(), modules.clone()));
        let c2s = C2sContext {
            hosts: hosts.clone(),
            router: router.clone(),
            hooks: hooks.clone(),
            shapers,
            modules: modules.clone(),
            repository: parts.repository,
        };

        Ok(Self {
            instance_id,
            config,
            kv: parts.kv,
            hooks,
            hosts,
            members,
            directory,
            local,
            router,
            modules,
            s2s_in,
            c2s,
            shutdown: CancellationToken::new(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Start the directory, the member list, the modules and every
    /// listener, in that order.
    pub async fn start(&self) -> Result<(), XmppError> {
        self.directory.start().await?;
        self.members.start().await?;
        self.modules.start().await?;

        let tls_config = self.hosts.tls_config()?;
        for listener_config in &self.config.listeners {
            let listener =
                C2sListener::bind(listener_config, self.c2s.clone(), tls_config.clone()).await?;
            let addr = listener.local_addr()?;
            let handle = tokio::spawn(listener.run(self.shutdown.child_token()));
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((addr, handle));
        }
        info!(
            instance_id = %self.instance_id,
            listeners = self.config.listeners.len(),
            "XMPP server started"
        );
        Ok(())
    }

    /// Stop accepting, disconnect local streams within `deadline`, then
    /// stop the modules and withdraw from the cluster.
    pub async fn stop(&self, deadline: Duration) {
        info!(instance_id = %self.instance_id, "XMPP server stopping");
        self.shutdown.cancel();
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for (addr, handle) in listeners {
            if let Err(e) = handle.await {
                warn!(%addr, error = %e, "C2S listener task failed");
            }
        }

        self.local.stop(deadline).await;
        self.modules.stop().await;
        if let Err(e) = self.members.stop().await {
            warn!(error = %e, "Failed to leave cluster member list");
        }
        self.directory.stop().await;
        info!(instance_id = %self.instance_id, "XMPP server stopped");
    }

    /// Fires when the cluster KV session is lost. The instance can no
    /// longer guarantee its directory entries and must shut down.
    pub fn session_lost(&self) -> CancellationToken {
        self.kv.session_lost()
    }

    /// Addresses of the bound listeners, in configuration order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Streams owned by this instance.
    pub fn local_router(&self) -> &Arc<LocalRouter> {
        &self.local
    }

    pub fn directory(&self) -> &Arc<ResourceDirectory> {
        &self.directory
    }

    pub fn modules(&self) -> &Arc<Modules> {
        &self.modules
    }

    /// Entry point for the S2S transport.
    pub fn s2s_in(&self) -> &Arc<S2sInHandler> {
        &self.s2s_in
    }

    /// Collaborators for sessions created outside the configured listeners.
    pub fn c2s_context(&self) -> &C2sContext {
        &self.c2s
    }
}

impl std::fmt::Debug for XmppServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppServer")
            .field("instance_id", &self.instance_id)
            .field("hosts", &self.hosts)
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}
