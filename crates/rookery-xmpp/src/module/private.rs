//! XEP-0049: Private XML Storage.
//!
//! Accounts store arbitrary XML fragments keyed by the fragment's
//! namespace. Only the owning account may read or write its storage.

use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, instrument};

use super::{send, HookRegistrations, IqHandler, Module, ModuleContext};
use crate::hook::{names, weak_hook_fn, HookOutcome};
use crate::parser::ns;
use crate::stanza::{JidExt, Stanza};
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "private";

/// Namespaces a client may not use as storage keys.
const RESERVED_NAMESPACES: &[&str] = &[ns::JABBER_CLIENT, ns::JABBER_SERVER, ns::PRIVATE];

/// Private XML storage module.
pub struct Private {
    ctx: ModuleContext,
    hooks: HookRegistrations,
}

impl Private {
    /// Create the module.
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            hooks: HookRegistrations::default(),
        })
    }

    async fn get(&self, iq: &Stanza, username: &str, query: &Element) -> Result<(), XmppError> {
        let mut children = query.children();
        let (Some(key), None) = (children.next(), children.next()) else {
            return Err(XmppError::not_acceptable(Some("exactly one child expected".into())));
        };
        let namespace = key.ns();
        if RESERVED_NAMESPACES.contains(&namespace.as_str()) {
            return Err(XmppError::not_acceptable(Some(format!("reserved namespace {}", namespace))));
        }
        let stored = self.ctx.repository.fetch_private(username, &namespace).await?;
        let payload = stored.unwrap_or_else(|| Element::builder(key.name(), namespace.as_str()).build());
        let result = Element::builder("query", ns::PRIVATE).append(payload).build();
        send(&self.ctx.router, iq.result_reply_with(result)).await;
        Ok(())
    }

    async fn set(&self, iq: &Stanza, username: &str, query: &Element) -> Result<(), XmppError> {
        let fragments: Vec<&Element> = query.children().collect();
        if fragments.is_empty() {
            return Err(XmppError::not_acceptable(Some("nothing to store".into())));
        }
        for fragment in &fragments {
            let namespace = fragment.ns();
            if namespace.is_empty() || RESERVED_NAMESPACES.contains(&namespace.as_str()) {
                return Err(XmppError::not_acceptable(Some(format!(
                    "invalid storage namespace '{}'",
                    namespace
                ))));
            }
        }
        for fragment in fragments {
            self.ctx
                .repository
                .upsert_private(username, &fragment.ns(), fragment)
                .await?;
        }
        debug!(username, "Private storage updated");
        send(&self.ctx.router, iq.result_reply()).await;
        Ok(())
    }
}

#[async_trait]
impl Module for Private {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::PRIVATE.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        self.hooks.add(
            &self.ctx.hooks,
            names::USER_DELETED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    if let Some(user) = ctx.user() {
                        module.ctx.repository.delete_private(&user.username).await?;
                    }
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), XmppError> {
        self.hooks.remove_all(&self.ctx.hooks);
        Ok(())
    }

    fn iq_handler(self: Arc<Self>) -> Option<Arc<dyn IqHandler>> {
        Some(self)
    }
}

#[async_trait]
impl IqHandler for Private {
    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool {
        !server_target && namespace == ns::PRIVATE
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        let (Some(from), Some(to)) = (iq.from(), iq.to()) else {
            return Err(XmppError::bad_request(None));
        };
        if from.node_str() != to.node_str() || from.domain_str() != to.domain_str() {
            return Err(XmppError::forbidden(None));
        }
        let Some(query) = iq.child("query", ns::PRIVATE) else {
            return Err(XmppError::bad_request(None));
        };
        if iq.is_iq_get() {
            self.get(iq, from.node_str(), query).await
        } else {
            self.set(iq, from.node_str(), query).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{HookContext, HookInfo, UserInfo};
    use crate::module::testing::*;
    use crate::storage::PrivateRepository;

    fn query(child: Element) -> Element {
        Element::builder("query", ns::PRIVATE).append(child).build()
    }

    fn bookmarks() -> Element {
        Element::builder("storage", "storage:bookmarks")
            .append(
                Element::builder("conference", "storage:bookmarks")
                    .attr("jid", "council@conference.localhost")
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let harness = Harness::new();
        let module = Private::new(harness.ctx.clone());
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module
            .process_iq(&iq("set", "ortuman@localhost/yard", "ortuman@localhost", query(bookmarks())))
            .await
            .unwrap();
        assert_eq!(yard.drain()[0].type_attr(), Some("result"));

        module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "ortuman@localhost",
                query(Element::builder("storage", "storage:bookmarks").build()),
            ))
            .await
            .unwrap();
        let reply = yard.drain().remove(0);
        let stored = reply
            .child("query", ns::PRIVATE)
            .and_then(|q| q.get_child("storage", "storage:bookmarks"))
            .unwrap();
        assert!(stored.has_child("conference", "storage:bookmarks"));
    }

    #[tokio::test]
    async fn test_get_missing_returns_empty_fragment() {
        let harness = Harness::new();
        let module = Private::new(harness.ctx.clone());
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "ortuman@localhost",
                query(Element::builder("prefs", "urn:test:prefs").build()),
            ))
            .await
            .unwrap();
        let reply = yard.drain().remove(0);
        let fragment = reply
            .child("query", ns::PRIVATE)
            .and_then(|q| q.get_child("prefs", "urn:test:prefs"))
            .unwrap();
        assert_eq!(fragment.children().count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_account_is_forbidden() {
        let harness = Harness::new();
        let module = Private::new(harness.ctx.clone());

        let err = module
            .process_iq(&iq("get", "noelia@localhost/hall", "ortuman@localhost", query(bookmarks())))
            .await
            .unwrap_err();
        assert_eq!(err.stanza_condition(), crate::error::StanzaErrorCondition::Forbidden);
    }

    #[tokio::test]
    async fn test_reserved_namespace_rejected() {
        let harness = Harness::new();
        let module = Private::new(harness.ctx.clone());

        let err = module
            .process_iq(&iq(
                "set",
                "ortuman@localhost/yard",
                "ortuman@localhost",
                query(Element::builder("query", ns::PRIVATE).build()),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.stanza_condition(), crate::error::StanzaErrorCondition::NotAcceptable);
    }

    #[tokio::test]
    async fn test_user_deleted_drops_storage() {
        let harness = Harness::new();
        let module = Private::new(harness.ctx.clone());
        module.clone().start().await.unwrap();
        harness
            .repository
            .upsert_private("ortuman", "storage:bookmarks", &bookmarks())
            .await
            .unwrap();

        let mut ctx = HookContext::new(HookInfo::User(UserInfo {
            username: "ortuman".to_string(),
        }));
        harness.ctx.hooks.run(names::USER_DELETED, &mut ctx).await.unwrap();

        assert!(harness
            .repository
            .fetch_private("ortuman", "storage:bookmarks")
            .await
            .unwrap()
            .is_none());
        module.stop().await.unwrap();
        assert_eq!(harness.ctx.hooks.len(names::USER_DELETED), 0);
    }
}
