//! XEP-0030: Service Discovery.
//!
//! Answers `disco#info` and `disco#items` on the server JID and on account
//! bare JIDs. Features are the core set plus whatever the other enabled
//! modules report, collected once when the module set is built.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;
use tracing::instrument;

use super::{send, IqHandler, Module, ModuleContext};
use crate::parser::ns;
use crate::stanza::{JidExt, Stanza};
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "disco";

const SERVER_NAME: &str = "rookery";

/// Identity element of a disco#info reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Category (e.g. `server`, `account`)
    pub category: &'static str,
    /// Type within the category
    pub type_: &'static str,
    /// Human-readable name
    pub name: Option<&'static str>,
}

impl Identity {
    /// `server/im`
    pub fn server() -> Self {
        Self {
            category: "server",
            type_: "im",
            name: Some(SERVER_NAME),
        }
    }

    /// `account/registered`
    pub fn account() -> Self {
        Self {
            category: "account",
            type_: "registered",
            name: None,
        }
    }

    fn to_element(&self) -> Element {
        let mut builder = Element::builder("identity", ns::DISCO_INFO)
            .attr("category", self.category)
            .attr("type", self.type_);
        if let Some(name) = self.name {
            builder = builder.attr("name", name);
        }
        builder.build()
    }
}

/// Service discovery module.
pub struct Disco {
    ctx: ModuleContext,
    server_features: BTreeSet<String>,
    account_features: BTreeSet<String>,
}

impl Disco {
    /// Create the module with the features of the other modules.
    pub fn new(ctx: ModuleContext, server_features: Vec<String>, account_features: Vec<String>) -> Arc<Self> {
        let core = [ns::DISCO_INFO, ns::DISCO_ITEMS].map(str::to_string);
        Arc::new(Self {
            ctx,
            server_features: core.iter().cloned().chain(server_features).collect(),
            account_features: core.iter().cloned().chain(account_features).collect(),
        })
    }

    /// Features reported for the server JID.
    pub fn server_feature_list(&self) -> Vec<String> {
        self.server_features.iter().cloned().collect()
    }

    /// Features reported for account JIDs.
    pub fn account_feature_list(&self) -> Vec<String> {
        self.account_features.iter().cloned().collect()
    }

    fn info_query(identity: Identity, features: &BTreeSet<String>) -> Element {
        let mut query = Element::builder("query", ns::DISCO_INFO)
            .append(identity.to_element())
            .build();
        for feature in features {
            query.append_child(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature.as_str())
                    .build(),
            );
        }
        query
    }

    fn items_query(items: &[String]) -> Element {
        let mut query = Element::builder("query", ns::DISCO_ITEMS).build();
        for jid in items {
            query.append_child(
                Element::builder("item", ns::DISCO_ITEMS)
                    .attr("jid", jid.as_str())
                    .build(),
            );
        }
        query
    }

    /// Whether `requester` may discover the account `target`: the account
    /// itself, or a contact the account shares its presence with.
    async fn may_discover(&self, target: &Jid, requester: &Jid) -> Result<bool, XmppError> {
        if target.node_str() == requester.node_str() && target.domain_str() == requester.domain_str() {
            return Ok(true);
        }
        let contact = requester.to_bare().to_string();
        let item = self
            .ctx
            .repository
            .fetch_roster_item(target.node_str(), &contact)
            .await?;
        Ok(item.map(|i| i.subscription.has_from()).unwrap_or(false))
    }
}

#[async_trait]
impl Module for Disco {
    fn name(&self) -> &'static str {
        MODULE_NAME
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
impl IqHandler for Disco {
    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::DISCO_INFO || namespace == ns::DISCO_ITEMS
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        if !iq.is_iq_get() {
            return Err(XmppError::bad_request(None));
        }
        let (Some(from), Some(to)) = (iq.from(), iq.to()) else {
            return Err(XmppError::bad_request(None));
        };
        let Some(query) = iq.iq_payload() else {
            return Err(XmppError::bad_request(None));
        };
        if query.attr("node").is_some() {
            return Err(XmppError::item_not_found(None));
        }
        let is_info = query.ns() == ns::DISCO_INFO;

        let reply = if to.is_server() {
            if is_info {
                Self::info_query(Identity::server(), &self.server_features)
            } else {
                Self::items_query(&[])
            }
        } else {
            if !self.may_discover(to, from).await? {
                return Err(XmppError::stanza(
                    crate::error::StanzaErrorCondition::SubscriptionRequired,
                    None,
                ));
            }
            if is_info {
                Self::info_query(Identity::account(), &self.account_features)
            } else {
                let resources: Vec<String> = self
                    .ctx
                    .router
                    .c2s()
                    .directory()
                    .get_all(to.node_str())
                    .iter()
                    .filter(|desc| desc.jid().domain().as_str() == to.domain_str())
                    .map(|desc| desc.jid().to_string())
                    .collect();
                Self::items_query(&resources)
            }
        };
        send(&self.ctx.router, iq.result_reply_with(reply)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use crate::module::testing::*;
    use crate::storage::{RosterItem, RosterRepository, Subscription};

    fn disco(harness: &Harness) -> Arc<Disco> {
        Disco::new(
            harness.ctx.clone(),
            vec![ns::PING.to_string(), ns::VERSION.to_string()],
            vec![ns::MAM.to_string()],
        )
    }

    fn features(reply: &Stanza) -> Vec<String> {
        reply
            .child("query", ns::DISCO_INFO)
            .unwrap()
            .children()
            .filter(|c| c.name() == "feature")
            .filter_map(|c| c.attr("var").map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_server_info() {
        let harness = Harness::new();
        let module = disco(&harness);
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "localhost",
                Element::builder("query", ns::DISCO_INFO).build(),
            ))
            .await
            .unwrap();
        let reply = yard.drain().remove(0);
        let features = features(&reply);
        assert!(features.contains(&ns::DISCO_INFO.to_string()));
        assert!(features.contains(&ns::PING.to_string()));
        assert!(!features.contains(&ns::MAM.to_string()));
        let identity = reply
            .child("query", ns::DISCO_INFO)
            .and_then(|q| q.get_child("identity", ns::DISCO_INFO))
            .unwrap();
        assert_eq!(identity.attr("category"), Some("server"));
    }

    #[tokio::test]
    async fn test_account_items_lists_resources() {
        let harness = Harness::new();
        let module = disco(&harness);
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;
        let _balcony = harness.online("ortuman", "balcony", Some(0)).await;

        module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "ortuman@localhost",
                Element::builder("query", ns::DISCO_ITEMS).build(),
            ))
            .await
            .unwrap();
        let reply = yard.drain().remove(0);
        let items = reply.child("query", ns::DISCO_ITEMS).unwrap().children().count();
        assert_eq!(items, 2);
    }

    #[tokio::test]
    async fn test_account_info_requires_subscription() {
        let harness = Harness::new();
        let module = disco(&harness);
        let info = || {
            iq(
                "get",
                "noelia@localhost/hall",
                "ortuman@localhost",
                Element::builder("query", ns::DISCO_INFO).build(),
            )
        };

        let err = module.process_iq(&info()).await.unwrap_err();
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::SubscriptionRequired);

        let mut item = RosterItem::new("ortuman", "noelia@localhost");
        item.subscription = Subscription::From;
        harness.repository.upsert_roster_item(&item).await.unwrap();
        let mut hall = harness.online("noelia", "hall", Some(0)).await;
        module.process_iq(&info()).await.unwrap();
        let features = features(&hall.drain().remove(0));
        assert!(features.contains(&ns::MAM.to_string()));
    }

    #[tokio::test]
    async fn test_node_queries_are_not_found() {
        let harness = Harness::new();
        let module = disco(&harness);
        let err = module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "localhost",
                Element::builder("query", ns::DISCO_INFO).attr("node", "x").build(),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::ItemNotFound);
    }
}
