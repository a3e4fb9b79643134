//! Roster management (RFC 6121) with roster versioning (XEP-0237).
//!
//! The IQ side serves `jabber:iq:roster` gets and sets; every change bumps
//! the account's roster version and is pushed to the resources that have
//! requested the roster. The presence side, in [`presence`], drives the
//! subscription state machine and the presence broadcast.

mod presence;
pub mod subscription;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{send, HookRegistrations, IqHandler, Module, ModuleContext};
use crate::hook::{names, weak_hook_fn, HookOutcome};
use crate::parser::ns;
use crate::resource::info_keys;
use crate::stanza::{JidExt, Stanza};
use crate::storage::{RosterItem, Subscription};
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "roster";

/// Serialize a stored item as a roster `<item/>`.
pub fn item_element(item: &RosterItem) -> Element {
    let mut builder = Element::builder("item", ns::ROSTER)
        .attr("jid", item.jid.as_str())
        .attr("subscription", item.subscription.as_str());
    if !item.name.is_empty() {
        builder = builder.attr("name", item.name.as_str());
    }
    if item.ask {
        builder = builder.attr("ask", "subscribe");
    }
    for group in &item.groups {
        builder = builder.append(
            Element::builder("group", ns::ROSTER)
                .append(group.clone())
                .build(),
        );
    }
    builder.build()
}

/// An `<item/>` of a client roster set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedItem {
    /// Contact
    pub jid: BareJid,
    /// Display name, empty when absent
    pub name: String,
    /// Groups, unique and non-empty
    pub groups: Vec<String>,
    /// `subscription='remove'`
    pub remove: bool,
}

impl RequestedItem {
    /// Parse and validate a client-supplied item. Subscription state other
    /// than `remove` is ignored.
    pub fn from_element(element: &Element) -> Result<Self, XmppError> {
        let raw = element
            .attr("jid")
            .ok_or_else(|| XmppError::bad_request(Some("roster item without jid".into())))?;
        let jid: BareJid = raw
            .parse()
            .map_err(|e| XmppError::bad_request(Some(format!("invalid jid {}: {}", raw, e))))?;

        let mut groups = Vec::new();
        let mut seen = HashSet::new();
        for group in element.children().filter(|c| c.is("group", ns::ROSTER)) {
            let name = group.text();
            if name.trim().is_empty() {
                return Err(XmppError::not_acceptable(Some("empty group name".into())));
            }
            if !seen.insert(name.clone()) {
                return Err(XmppError::bad_request(Some("duplicate group name".into())));
            }
            groups.push(name);
        }

        Ok(Self {
            jid,
            name: element.attr("name").unwrap_or_default().to_string(),
            groups,
            remove: element.attr("subscription") == Some(Subscription::Remove.as_str()),
        })
    }
}

/// Roster module.
pub struct Roster {
    ctx: ModuleContext,
    hooks: HookRegistrations,
}

impl Roster {
    /// Create the module.
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            hooks: HookRegistrations::default(),
        })
    }

    fn query(version: i64) -> Element {
        Element::builder("query", ns::ROSTER)
            .attr("ver", version.to_string())
            .build()
    }

    /// Persist `item`, bump the roster version and push the change.
    async fn save_item(&self, item: &RosterItem) -> Result<(), XmppError> {
        self.ctx.repository.upsert_roster_item(item).await?;
        let version = self.ctx.repository.touch_roster_version(&item.username).await?;
        self.push(item, version).await;
        Ok(())
    }

    /// Delete an item, bump the roster version and push the removal.
    async fn delete_item(&self, username: &str, jid: &str) -> Result<(), XmppError> {
        self.ctx.repository.delete_roster_item(username, jid).await?;
        let version = self.ctx.repository.touch_roster_version(username).await?;
        let mut removed = RosterItem::new(username, jid);
        removed.subscription = Subscription::Remove;
        self.push(&removed, version).await;
        Ok(())
    }

    /// Send a roster push to every resource that requested the roster.
    async fn push(&self, item: &RosterItem, version: i64) {
        let c2s = self.ctx.router.c2s();
        let mut query = Self::query(version);
        query.append_child(item_element(item));
        for desc in c2s.directory().get_all(&item.username) {
            if !desc.info().bool(info_keys::ROSTER_REQUESTED) {
                continue;
            }
            let push = Stanza::iq("set", &Uuid::new_v4().to_string())
                .with_from(desc.jid().to_bare())
                .with_to(desc.jid().clone())
                .with_child(query.clone());
            if let Err(e) = c2s.route_to(push, &desc).await {
                debug!(jid = %desc.jid(), error = %e, "Roster push not delivered");
            }
        }
    }

    async fn process_get(&self, iq: &Stanza, from: &Jid, query: &Element) -> Result<(), XmppError> {
        if query.children().next().is_some() {
            return Err(XmppError::bad_request(None));
        }
        let username = from.node_str();
        if let Some(stream) = self.ctx.router.c2s().local_stream(username, from.resource_str()) {
            stream.set_info_value(info_keys::ROSTER_REQUESTED, true).await?;
        }

        let version = self.ctx.repository.fetch_roster_version(username).await?;
        if query.attr("ver") == Some(version.to_string().as_str()) {
            debug!(username, version, "Roster unchanged since requested version");
            send(&self.ctx.router, iq.result_reply()).await;
            return Ok(());
        }
        let mut reply = Self::query(version);
        for item in self.ctx.repository.fetch_roster_items(username).await? {
            reply.append_child(item_element(&item));
        }
        send(&self.ctx.router, iq.result_reply_with(reply)).await;
        Ok(())
    }

    async fn process_set(&self, iq: &Stanza, from: &Jid, query: &Element) -> Result<(), XmppError> {
        let items: Vec<&Element> = query.children().filter(|c| c.is("item", ns::ROSTER)).collect();
        let [element] = items.as_slice() else {
            return Err(XmppError::bad_request(Some("roster set must carry one item".into())));
        };
        let requested = RequestedItem::from_element(element)?;
        let owner = from.to_bare();
        if requested.remove {
            self.remove_contact(&owner, &requested.jid).await?;
        } else {
            let username = from.node_str();
            let contact = requested.jid.to_string();
            let mut item = self
                .ctx
                .repository
                .fetch_roster_item(username, &contact)
                .await?
                .unwrap_or_else(|| RosterItem::new(username, &contact));
            item.name = requested.name;
            item.groups = requested.groups;
            self.save_item(&item).await?;
        }
        send(&self.ctx.router, iq.result_reply()).await;
        Ok(())
    }
}

#[async_trait]
impl Module for Roster {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn stream_feature(&self, _domain: &str) -> Option<Element> {
        Some(Element::builder("ver", ns::ROSTER_VER).build())
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        let hooks = &self.ctx.hooks;
        self.hooks.add(
            hooks,
            names::C2S_STREAM_PRESENCE_RECEIVED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    if let (Some(stream), Some(info)) = (ctx.sender.as_ref(), ctx.element()) {
                        module.process_outbound(stream, &info.stanza).await?;
                    }
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        self.hooks.add(
            hooks,
            names::S2S_IN_STREAM_PRESENCE_RECEIVED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    let Some(info) = ctx.element() else {
                        return Ok(HookOutcome::Continue);
                    };
                    module.process_inbound(info.stanza.clone()).await?;
                    Ok(HookOutcome::Halt)
                })
            }),
            0,
        );
        self.hooks.add(
            hooks,
            names::USER_DELETED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    if let Some(user) = ctx.user() {
                        module.ctx.repository.delete_roster(&user.username).await?;
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
impl IqHandler for Roster {
    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::ROSTER
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME, from = ?iq.from().map(|j| j.to_string())))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        let (Some(from), Some(query)) = (iq.from(), iq.iq_payload()) else {
            return Err(XmppError::bad_request(None));
        };
        if !from.is_full_with_user() || !self.ctx.hosts.is_local_host(from.domain_str()) {
            return Err(XmppError::forbidden(None));
        }
        if let Some(to) = iq.to() {
            let own = to.node_str() == from.node_str() && to.domain_str() == from.domain_str();
            if !to.is_server() && !own {
                return Err(XmppError::forbidden(None));
            }
        }
        if iq.is_iq_get() {
            self.process_get(iq, from, query).await
        } else {
            self.process_set(iq, from, query).await
        }
    }
}
