//! Protocol extension modules.
//!
//! A module contributes stream features, disco features, IQ namespace
//! handlers and hook handlers. [`Modules`] is the ordered set built from
//! configuration; sessions ask it for stream features and hand it every IQ
//! addressed to the server or to an account's bare JID.

pub mod archive;
pub mod carbons;
pub mod disco;
pub mod offline;
pub mod ping;
pub mod private;
pub mod roster;
pub mod version;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, info, instrument, warn};

use crate::config::ModulesConfig;
use crate::error::StanzaErrorCondition;
use crate::hook::{HandlerId, HookFn, Hooks};
use crate::host::Hosts;
use crate::router::{Router, RoutingOptions};
use crate::stanza::{JidExt, Stanza};
use crate::storage::Repository;
use crate::XmppError;

/// Shared collaborators handed to every module.
#[derive(Clone)]
pub struct ModuleContext {
    /// Local domains
    pub hosts: Arc<Hosts>,
    /// Global router
    pub router: Arc<Router>,
    /// Hook bus
    pub hooks: Arc<Hooks>,
    /// Persistent storage
    pub repository: Arc<dyn Repository>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("hosts", &self.hosts)
            .finish_non_exhaustive()
    }
}

/// A pluggable protocol extension.
#[async_trait]
pub trait Module: Send + Sync {
    /// Configuration name of the module.
    fn name(&self) -> &'static str;

    /// Element advertised in post-auth `<stream:features/>`.
    fn stream_feature(&self, _domain: &str) -> Option<Element> {
        None
    }

    /// Features reported by disco#info on the server JID.
    fn server_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Features reported by disco#info on account JIDs.
    fn account_features(&self) -> Vec<String> {
        Vec::new()
    }

    /// Register hooks and start background work.
    async fn start(self: Arc<Self>) -> Result<(), XmppError>;

    /// Undo `start`.
    async fn stop(&self) -> Result<(), XmppError>;

    /// The IQ handler side of the module, if it has one.
    fn iq_handler(self: Arc<Self>) -> Option<Arc<dyn IqHandler>> {
        None
    }
}

/// Handles IQs whose payload namespace it claims.
#[async_trait]
pub trait IqHandler: Send + Sync {
    /// Whether this handler serves `namespace`. `server_target` is true
    /// when the IQ is addressed to the server itself rather than to an
    /// account's bare JID.
    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool;

    /// Process a `get` or `set` IQ and route the reply.
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError>;
}

/// Hook registrations owned by a module, removed together on stop.
#[derive(Debug, Default)]
pub(crate) struct HookRegistrations {
    ids: Mutex<Vec<(&'static str, HandlerId)>>,
}

impl HookRegistrations {
    pub(crate) fn add(&self, hooks: &Hooks, name: &'static str, handler: HookFn, priority: i32) {
        let id = hooks.add(name, handler, priority);
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name, id));
    }

    pub(crate) fn remove_all(&self, hooks: &Hooks) {
        let ids = std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, id) in ids {
            hooks.remove(name, id);
        }
    }
}

/// Route a module-generated stanza, logging instead of failing.
pub(crate) async fn send(router: &Router, stanza: Stanza) {
    if let Err(e) = router.route(stanza, RoutingOptions::default()).await {
        debug!(error = %e, "Module stanza not delivered");
    }
}

/// The enabled modules in dispatch order.
pub struct Modules {
    modules: Vec<Arc<dyn Module>>,
    iq_handlers: Vec<Arc<dyn IqHandler>>,
    hosts: Arc<Hosts>,
    router: Arc<Router>,
}

impl Modules {
    /// Wrap an explicit module list.
    pub fn new(modules: Vec<Arc<dyn Module>>, hosts: Arc<Hosts>, router: Arc<Router>) -> Self {
        let iq_handlers = modules.iter().filter_map(|m| m.clone().iq_handler()).collect();
        Self {
            modules,
            iq_handlers,
            hosts,
            router,
        }
    }

    /// Instantiate every module enabled in `config`. Service discovery is
    /// built last so it can report the features of the others.
    pub fn from_config(config: &ModulesConfig, ctx: &ModuleContext) -> Self {
        let mut modules: Vec<Arc<dyn Module>> = Vec::new();
        for name in &config.enabled {
            let module: Arc<dyn Module> = match name.as_str() {
                roster::MODULE_NAME => roster::Roster::new(ctx.clone()),
                offline::MODULE_NAME => offline::Offline::new(ctx.clone(), config.offline.clone()),
                carbons::MODULE_NAME => carbons::Carbons::new(ctx.clone()),
                archive::MODULE_NAME => archive::Archive::new(ctx.clone(), config.archive.clone()),
                ping::MODULE_NAME => ping::Ping::new(ctx.clone(), config.ping.clone()),
                private::MODULE_NAME => private::Private::new(ctx.clone()),
                version::MODULE_NAME => version::Version::new(ctx.clone(), config.version.clone()),
                disco::MODULE_NAME => continue,
                other => {
                    warn!(module = other, "Unknown module in configuration");
                    continue;
                }
            };
            modules.push(module);
        }
        if config.is_enabled(disco::MODULE_NAME) {
            let server_features = modules.iter().flat_map(|m| m.server_features()).collect();
            let account_features = modules.iter().flat_map(|m| m.account_features()).collect();
            modules.push(disco::Disco::new(ctx.clone(), server_features, account_features));
        }
        Self::new(modules, ctx.hosts.clone(), ctx.router.clone())
    }

    /// Names in dispatch order.
    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is enabled.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Start every module in order.
    pub async fn start(&self) -> Result<(), XmppError> {
        for module in &self.modules {
            module.clone().start().await?;
            debug!(module = module.name(), "Module started");
        }
        info!(modules = ?self.names(), "Modules started");
        Ok(())
    }

    /// Stop every module in reverse order.
    pub async fn stop(&self) {
        for module in self.modules.iter().rev() {
            if let Err(e) = module.stop().await {
                warn!(module = module.name(), error = %e, "Failed to stop module");
            }
        }
    }

    /// Stream features contributed by the modules.
    pub fn stream_features(&self, domain: &str) -> Vec<Element> {
        self.modules
            .iter()
            .filter_map(|m| m.stream_feature(domain))
            .collect()
    }

    /// Whether `iq` is addressed to a local server or bare JID and is a
    /// request.
    pub fn is_module_iq(&self, iq: &Stanza) -> bool {
        let Some(to) = iq.to() else {
            return false;
        };
        (to.is_server() || to.resource().is_none())
            && self.hosts.is_local_host(to.domain_str())
            && (iq.is_iq_get() || iq.is_iq_set())
    }

    /// Dispatch `iq` to the first handler claiming its namespace. Handler
    /// failures are answered with the matching stanza error.
    #[instrument(skip(self, iq), fields(id = ?iq.id()))]
    pub async fn process_iq(&self, iq: &Stanza) {
        let Some(payload) = iq.iq_payload() else {
            send(&self.router, iq.error_reply(StanzaErrorCondition::BadRequest)).await;
            return;
        };
        let namespace = payload.ns();
        let server_target = iq.to().map(JidExt::is_server).unwrap_or(true);
        let handler = self
            .iq_handlers
            .iter()
            .find(|h| h.matches_namespace(&namespace, server_target));
        let Some(handler) = handler else {
            debug!(namespace = %namespace, "No module handles IQ namespace");
            send(&self.router, iq.error_reply(StanzaErrorCondition::ServiceUnavailable)).await;
            return;
        };
        if let Err(e) = handler.process_iq(iq).await {
            let condition = e.stanza_condition();
            if condition == StanzaErrorCondition::InternalServerError {
                warn!(namespace = %namespace, error = %e, "IQ handler failed");
            } else {
                debug!(namespace = %namespace, error = %e, "IQ rejected");
            }
            send(&self.router, iq.error_reply(condition)).await;
        }
    }
}

impl std::fmt::Debug for Modules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modules")
            .field("modules", &self.names())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::parser::ns;

    struct Echo {
        namespace: &'static str,
        router: Arc<Router>,
        fail: bool,
    }

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn start(self: Arc<Self>) -> Result<(), XmppError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), XmppError> {
            Ok(())
        }

        fn iq_handler(self: Arc<Self>) -> Option<Arc<dyn IqHandler>> {
            Some(self)
        }
    }

    #[async_trait]
    impl IqHandler for Echo {
        fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
            namespace == self.namespace
        }

        async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
            if self.fail {
                return Err(XmppError::internal("boom"));
            }
            send(&self.router, iq.result_reply()).await;
            Ok(())
        }
    }

    fn modules(harness: &Harness, fail: bool) -> Modules {
        let echo: Arc<dyn Module> = Arc::new(Echo {
            namespace: "urn:test:echo",
            router: harness.ctx.router.clone(),
            fail,
        });
        Modules::new(vec![echo], harness.ctx.hosts.clone(), harness.ctx.router.clone())
    }

    #[tokio::test]
    async fn test_is_module_iq() {
        let harness = Harness::new();
        let modules = modules(&harness, false);
        let payload = || Element::builder("query", "urn:test:echo").build();

        assert!(modules.is_module_iq(&iq("get", "ortuman@localhost/yard", "localhost", payload())));
        assert!(modules.is_module_iq(&iq("set", "ortuman@localhost/yard", "noelia@localhost", payload())));
        assert!(!modules.is_module_iq(&iq("get", "ortuman@localhost/yard", "noelia@localhost/hall", payload())));
        assert!(!modules.is_module_iq(&iq("get", "ortuman@localhost/yard", "jabber.org", payload())));
        assert!(!modules.is_module_iq(&iq("result", "ortuman@localhost/yard", "localhost", payload())));
    }

    #[tokio::test]
    async fn test_dispatch_and_unknown_namespace() {
        let harness = Harness::new();
        let modules = modules(&harness, false);
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        let handled = iq(
            "get",
            "ortuman@localhost/yard",
            "localhost",
            Element::builder("query", "urn:test:echo").build(),
        );
        modules.process_iq(&handled).await;
        let replies = yard.drain();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].type_attr(), Some("result"));

        let unknown = iq(
            "get",
            "ortuman@localhost/yard",
            "localhost",
            Element::builder("query", "urn:test:nobody").build(),
        );
        modules.process_iq(&unknown).await;
        let replies = yard.drain();
        assert_eq!(replies[0].type_attr(), Some("error"));
        let error = replies[0].child("error", ns::JABBER_CLIENT).unwrap();
        assert!(error.has_child("service-unavailable", ns::STANZAS));
    }

    #[tokio::test]
    async fn test_handler_error_is_answered() {
        let harness = Harness::new();
        let modules = modules(&harness, true);
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        modules
            .process_iq(&iq(
                "set",
                "ortuman@localhost/yard",
                "localhost",
                Element::builder("query", "urn:test:echo").build(),
            ))
            .await;
        let replies = yard.drain();
        let error = replies[0].child("error", ns::JABBER_CLIENT).unwrap();
        assert!(error.has_child("internal-server-error", ns::STANZAS));
    }

    #[tokio::test]
    async fn test_from_config_orders_disco_last() {
        let harness = Harness::new();
        let modules = Modules::from_config(&ModulesConfig::default(), &harness.ctx);
        let names = modules.names();
        assert_eq!(names.last(), Some(&disco::MODULE_NAME));
        assert!(names.contains(&offline::MODULE_NAME));
    }
}
