//! Presence subscriptions and broadcast.
//!
//! Outbound processing handles presences sent by a local client; inbound
//! processing handles presences addressed to a local account, whether they
//! come from a local contact or arrive over S2S. Subscription stanzas are
//! always re-addressed bare to bare.

use futures::future::BoxFuture;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, instrument};

use super::subscription::{self, SubscriptionType};
use super::Roster;
use crate::c2s::LocalStream;
use crate::module::send;
use crate::resource::{info_keys, same_user, ResourceDesc};
use crate::stanza::{JidExt, PresenceType, Stanza};
use crate::storage::{RosterItem, RosterNotification};
use crate::XmppError;

impl Roster {
    fn is_local_account(&self, jid: &Jid) -> bool {
        !jid.node_str().is_empty() && self.ctx.hosts.is_local_host(jid.domain_str())
    }

    /// Available resources of the account `jid` refers to.
    fn available_resources(&self, jid: &Jid) -> Vec<ResourceDesc> {
        self.ctx
            .router
            .c2s()
            .directory()
            .get_all(jid.node_str())
            .into_iter()
            .filter(|desc| same_user(desc, jid) && desc.is_available())
            .collect()
    }

    async fn fetch_item(&self, username: &str, contact: &BareJid) -> Result<Option<RosterItem>, XmppError> {
        Ok(self
            .ctx
            .repository
            .fetch_roster_item(username, &contact.to_string())
            .await?)
    }

    /// Deliver a subscription stanza from `from` to `to`, running inbound
    /// processing directly when the recipient is local.
    fn deliver_subscription<'a>(
        &'a self,
        kind: SubscriptionType,
        from: &'a BareJid,
        to: &'a BareJid,
        original: Option<&'a Stanza>,
    ) -> BoxFuture<'a, Result<(), XmppError>> {
        Box::pin(async move {
            let presence = match original {
                Some(stanza) => stanza.clone(),
                None => Stanza::presence(kind.presence_type()),
            }
            .with_from(from.clone())
            .with_to(to.clone());

            let to: Jid = to.clone().into();
            if self.is_local_account(&to) {
                // Inbound processing may answer with another subscription.
                let inbound: BoxFuture<'_, Result<(), XmppError>> = Box::pin(self.process_inbound(presence));
                inbound.await
            } else {
                send(&self.ctx.router, presence).await;
                Ok(())
            }
        })
    }

    /// Send the presence of every available resource of `owner` to `to`,
    /// or an unavailable presence from each of them when `unavailable`.
    async fn send_resource_presences(&self, owner: &BareJid, to: &BareJid, unavailable: bool) {
        let owner: Jid = owner.clone().into();
        for desc in self.available_resources(&owner) {
            let presence = match (unavailable, desc.presence()) {
                (false, Some(presence)) => presence.clone(),
                _ => Stanza::presence(PresenceType::Unavailable),
            };
            send(
                &self.ctx.router,
                presence.with_from(desc.jid().clone()).with_to(to.clone()),
            )
            .await;
        }
    }

    /// Remove `contact` from the roster of `owner`, cancelling the
    /// subscriptions in both directions.
    pub(super) async fn remove_contact(&self, owner: &BareJid, contact: &BareJid) -> Result<(), XmppError> {
        let username = owner.node().map(|n| n.as_str()).unwrap_or_default();
        let Some(item) = self.fetch_item(username, contact).await? else {
            return Err(XmppError::item_not_found(None));
        };
        self.ctx
            .repository
            .delete_roster_notification(username, &item.jid)
            .await?;
        self.delete_item(username, &item.jid).await?;

        if item.subscription.has_to() || item.ask {
            self.deliver_subscription(SubscriptionType::Unsubscribe, owner, contact, None)
                .await?;
        }
        if item.subscription.has_from() {
            self.deliver_subscription(SubscriptionType::Unsubscribed, owner, contact, None)
                .await?;
            self.send_resource_presences(owner, contact, true).await;
        }
        debug!(username, contact = %contact, "Roster item removed");
        Ok(())
    }

    /// Presence sent by a bound local client.
    #[instrument(skip_all, fields(stream_id = %stream.id()))]
    pub(super) async fn process_outbound(&self, stream: &LocalStream, presence: &Stanza) -> Result<(), XmppError> {
        let Some(jid) = stream.jid() else {
            return Ok(());
        };
        let Some(presence_type) = presence.presence_type() else {
            return Ok(());
        };
        let owner = jid.to_bare();
        let username = stream.username();

        let to = match presence.to() {
            None => None,
            Some(to) if to.node_str() == username && to.domain_str() == jid.domain().as_str() => None,
            Some(to) => Some(to.clone()),
        };
        let Some(to) = to else {
            if matches!(presence_type, PresenceType::Available | PresenceType::Unavailable) {
                self.broadcast(stream, &jid, presence).await?;
            }
            return Ok(());
        };
        let contact = to.to_bare();

        let Some(kind) = SubscriptionType::from_presence_type(presence_type) else {
            // Directed presence to a bare JID; full JIDs are routed by the session.
            if to.resource().is_none() && presence_type != PresenceType::Probe {
                send(&self.ctx.router, presence.clone().with_from(jid.clone())).await;
            }
            return Ok(());
        };

        match kind {
            SubscriptionType::Subscribe => {
                let mut item = self
                    .fetch_item(&username, &contact)
                    .await?
                    .unwrap_or_else(|| RosterItem::new(&username, &contact.to_string()));
                subscription::apply_outbound_subscribe(&mut item);
                self.save_item(&item).await?;
                self.deliver_subscription(kind, &owner, &contact, Some(presence)).await?;
            }
            SubscriptionType::Subscribed => {
                self.ctx
                    .repository
                    .delete_roster_notification(&username, &contact.to_string())
                    .await?;
                let mut item = self
                    .fetch_item(&username, &contact)
                    .await?
                    .unwrap_or_else(|| RosterItem::new(&username, &contact.to_string()));
                subscription::apply_outbound_subscribed(&mut item);
                self.save_item(&item).await?;
                self.deliver_subscription(kind, &owner, &contact, Some(presence)).await?;
                self.send_resource_presences(&owner, &contact, false).await;
            }
            SubscriptionType::Unsubscribe => {
                if let Some(mut item) = self.fetch_item(&username, &contact).await? {
                    subscription::apply_outbound_unsubscribe(&mut item);
                    self.save_item(&item).await?;
                }
                self.deliver_subscription(kind, &owner, &contact, Some(presence)).await?;
            }
            SubscriptionType::Unsubscribed => {
                self.ctx
                    .repository
                    .delete_roster_notification(&username, &contact.to_string())
                    .await?;
                if let Some(mut item) = self.fetch_item(&username, &contact).await? {
                    subscription::apply_outbound_unsubscribed(&mut item);
                    self.save_item(&item).await?;
                }
                self.deliver_subscription(kind, &owner, &contact, Some(presence)).await?;
                self.send_resource_presences(&owner, &contact, true).await;
            }
        }
        Ok(())
    }

    /// Presence addressed to a local account.
    #[instrument(skip_all, fields(from = ?presence.from().map(|j| j.to_string()), to = ?presence.to().map(|j| j.to_string())))]
    pub(super) async fn process_inbound(&self, presence: Stanza) -> Result<(), XmppError> {
        let (Some(from), Some(to)) = (presence.from().cloned(), presence.to().cloned()) else {
            return Ok(());
        };
        let Some(presence_type) = presence.presence_type() else {
            return Ok(());
        };
        if !self.is_local_account(&to) {
            return Ok(());
        }
        let username = to.node_str();
        let requester = from.to_bare();

        match presence_type {
            PresenceType::Subscribe => {
                let approved = self
                    .fetch_item(username, &requester)
                    .await?
                    .map(|item| item.subscription.has_from())
                    .unwrap_or(false);
                if approved {
                    let owner = to.to_bare();
                    self.deliver_subscription(SubscriptionType::Subscribed, &owner, &requester, None)
                        .await?;
                    return Ok(());
                }
                self.ctx
                    .repository
                    .upsert_roster_notification(&RosterNotification {
                        contact: username.to_string(),
                        jid: requester.to_string(),
                        presence: presence.clone(),
                    })
                    .await?;
                send(&self.ctx.router, presence).await;
            }
            PresenceType::Subscribed => {
                let Some(mut item) = self.fetch_item(username, &requester).await? else {
                    return Ok(());
                };
                if !subscription::apply_inbound_subscribed(&mut item) {
                    debug!(username, contact = %requester, "Unsolicited subscription approval");
                    return Ok(());
                }
                self.save_item(&item).await?;
                send(&self.ctx.router, presence).await;
            }
            PresenceType::Unsubscribe => {
                self.ctx
                    .repository
                    .delete_roster_notification(username, &requester.to_string())
                    .await?;
                if let Some(mut item) = self.fetch_item(username, &requester).await? {
                    subscription::apply_inbound_unsubscribe(&mut item);
                    self.save_item(&item).await?;
                }
                send(&self.ctx.router, presence).await;
            }
            PresenceType::Unsubscribed => {
                if let Some(mut item) = self.fetch_item(username, &requester).await? {
                    subscription::apply_inbound_unsubscribed(&mut item);
                    self.save_item(&item).await?;
                }
                send(&self.ctx.router, presence).await;
            }
            PresenceType::Probe => {
                let shares = self
                    .fetch_item(username, &requester)
                    .await?
                    .map(|item| item.subscription.has_from())
                    .unwrap_or(false);
                if shares {
                    self.send_resource_presences(&to.to_bare(), &requester, false).await;
                }
            }
            PresenceType::Available | PresenceType::Unavailable | PresenceType::Error => {
                send(&self.ctx.router, presence).await;
            }
        }
        Ok(())
    }

    /// Self-addressed presence: send it to every subscribed contact and to
    /// the account's other resources. The first available presence of a
    /// bound resource also collects the presences it needs to see.
    async fn broadcast(&self, stream: &LocalStream, jid: &FullJid, presence: &Stanza) -> Result<(), XmppError> {
        let was_available = stream.presence().map(|p| p.is_available()).unwrap_or(false);
        if presence.is_unavailable() && !was_available {
            return Ok(());
        }
        if presence.is_available() && !stream.info().bool(info_keys::FIRST_AVAILABLE_DELIVERED) {
            stream
                .set_info_value(info_keys::FIRST_AVAILABLE_DELIVERED, true)
                .await?;
            self.deliver_initial_presences(stream, jid).await?;
        }

        let username = stream.username();
        let outgoing = presence.clone().with_from(jid.clone());
        for item in self.ctx.repository.fetch_roster_items(&username).await? {
            if !item.subscription.has_from() {
                continue;
            }
            match item.jid.parse::<BareJid>() {
                Ok(contact) => send(&self.ctx.router, outgoing.clone().with_to(contact)).await,
                Err(e) => debug!(contact = %item.jid, error = %e, "Skipping malformed roster JID"),
            }
        }

        let own: Jid = jid.to_bare().into();
        let c2s = self.ctx.router.c2s();
        for desc in self.available_resources(&own) {
            if desc.resource() == jid.resource().as_str() {
                continue;
            }
            if let Err(e) = c2s.route_to(outgoing.clone().with_to(desc.jid().clone()), &desc).await {
                debug!(jid = %desc.jid(), error = %e, "Presence not delivered to own resource");
            }
        }
        Ok(())
    }

    /// Own resources, pending subscription requests and subscribed
    /// contacts' presences, sent to a resource coming online. Remote
    /// contacts are asked for their current presence.
    #[instrument(skip_all, fields(jid = %jid))]
    async fn deliver_initial_presences(&self, stream: &LocalStream, jid: &FullJid) -> Result<(), XmppError> {
        let deliver = |stanza: Stanza| {
            if let Err(e) = stream.send_element(stanza) {
                debug!(error = %e, "Initial presence not delivered");
            }
        };
        let own: Jid = jid.to_bare().into();
        for desc in self.available_resources(&own) {
            if desc.resource() == jid.resource().as_str() {
                continue;
            }
            if let Some(presence) = desc.presence() {
                deliver(presence.clone().with_from(desc.jid().clone()).with_to(jid.clone()));
            }
        }

        let username = stream.username();
        for notification in self.ctx.repository.fetch_roster_notifications(&username).await? {
            deliver(notification.presence.with_to(jid.clone()));
        }

        for item in self.ctx.repository.fetch_roster_items(&username).await? {
            if !item.subscription.has_to() {
                continue;
            }
            let Ok(contact) = item.jid.parse::<BareJid>() else {
                continue;
            };
            let contact: Jid = contact.into();
            if self.is_local_account(&contact) {
                for desc in self.available_resources(&contact) {
                    if let Some(presence) = desc.presence() {
                        deliver(presence.clone().with_from(desc.jid().clone()).with_to(jid.clone()));
                    }
                }
            } else {
                let request = Stanza::presence(PresenceType::Probe)
                    .with_from(jid.to_bare())
                    .with_to(contact);
                send(&self.ctx.router, request).await;
            }
        }
        Ok(())
    }
}
