//! RFC 6121 subscription state transitions.
//!
//! Each function applies one presence subscription stanza to the roster
//! item of the account that sends (outbound) or receives (inbound) it.
//!
//! | stanza         | outbound            | inbound                      |
//! |----------------|---------------------|------------------------------|
//! | `subscribe`    | ask set             | stored as notification       |
//! | `subscribed`   | none→from, to→both  | none→to, from→both (if ask)  |
//! | `unsubscribe`  | to→none, both→from  | from→none, both→to           |
//! | `unsubscribed` | from→none, both→to  | to→none, both→from           |

use tracing::trace;

use crate::stanza::PresenceType;
use crate::storage::{RosterItem, Subscription};

/// A presence type that changes subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Request to receive the contact's presence
    Subscribe,
    /// Approval of a request
    Subscribed,
    /// Cancel the owner's subscription to the contact
    Unsubscribe,
    /// Deny or revoke the contact's subscription
    Unsubscribed,
}

impl SubscriptionType {
    /// Subscription type carried by a presence type, if any.
    pub fn from_presence_type(presence_type: PresenceType) -> Option<Self> {
        match presence_type {
            PresenceType::Subscribe => Some(SubscriptionType::Subscribe),
            PresenceType::Subscribed => Some(SubscriptionType::Subscribed),
            PresenceType::Unsubscribe => Some(SubscriptionType::Unsubscribe),
            PresenceType::Unsubscribed => Some(SubscriptionType::Unsubscribed),
            _ => None,
        }
    }

    /// Presence type to emit.
    pub fn presence_type(&self) -> PresenceType {
        match self {
            SubscriptionType::Subscribe => PresenceType::Subscribe,
            SubscriptionType::Subscribed => PresenceType::Subscribed,
            SubscriptionType::Unsubscribe => PresenceType::Unsubscribe,
            SubscriptionType::Unsubscribed => PresenceType::Unsubscribed,
        }
    }
}

/// Owner asks the contact for a subscription.
pub fn apply_outbound_subscribe(item: &mut RosterItem) {
    item.ask = true;
    trace!(contact = %item.jid, subscription = %item.subscription, "Outbound subscribe");
}

/// Owner approves the contact's request.
pub fn apply_outbound_subscribed(item: &mut RosterItem) {
    item.subscription = match item.subscription {
        Subscription::None | Subscription::Remove => Subscription::From,
        Subscription::To => Subscription::Both,
        other => other,
    };
    trace!(contact = %item.jid, subscription = %item.subscription, "Outbound subscribed");
}

/// Owner cancels its subscription to the contact.
pub fn apply_outbound_unsubscribe(item: &mut RosterItem) {
    item.subscription = match item.subscription {
        Subscription::To | Subscription::Remove => Subscription::None,
        Subscription::Both => Subscription::From,
        other => other,
    };
    item.ask = false;
    trace!(contact = %item.jid, subscription = %item.subscription, "Outbound unsubscribe");
}

/// Owner denies or revokes the contact's subscription.
pub fn apply_outbound_unsubscribed(item: &mut RosterItem) {
    item.subscription = match item.subscription {
        Subscription::From | Subscription::Remove => Subscription::None,
        Subscription::Both => Subscription::To,
        other => other,
    };
    trace!(contact = %item.jid, subscription = %item.subscription, "Outbound unsubscribed");
}

/// Contact approved the owner's request. Returns false, leaving the item
/// untouched, when no request was pending.
pub fn apply_inbound_subscribed(item: &mut RosterItem) -> bool {
    if !item.ask {
        return false;
    }
    item.subscription = match item.subscription {
        Subscription::None | Subscription::Remove => Subscription::To,
        Subscription::From => Subscription::Both,
        other => other,
    };
    item.ask = false;
    trace!(contact = %item.jid, subscription = %item.subscription, "Inbound subscribed");
    true
}

/// Contact cancelled its subscription to the owner.
pub fn apply_inbound_unsubscribe(item: &mut RosterItem) {
    apply_outbound_unsubscribed(item);
}

/// Contact denied or revoked the owner's subscription.
pub fn apply_inbound_unsubscribed(item: &mut RosterItem) {
    apply_outbound_unsubscribe(item);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(subscription: Subscription, ask: bool) -> RosterItem {
        let mut item = RosterItem::new("ortuman", "noelia@localhost");
        item.subscription = subscription;
        item.ask = ask;
        item
    }

    #[test]
    fn test_from_presence_type() {
        assert_eq!(
            SubscriptionType::from_presence_type(PresenceType::Subscribe),
            Some(SubscriptionType::Subscribe)
        );
        assert_eq!(SubscriptionType::from_presence_type(PresenceType::Available), None);
        assert_eq!(SubscriptionType::from_presence_type(PresenceType::Probe), None);
        assert_eq!(
            SubscriptionType::Unsubscribed.presence_type(),
            PresenceType::Unsubscribed
        );
    }

    #[test]
    fn test_outbound_subscribe_sets_ask() {
        let mut i = item(Subscription::From, false);
        apply_outbound_subscribe(&mut i);
        assert!(i.ask);
        assert_eq!(i.subscription, Subscription::From);
    }

    #[test]
    fn test_outbound_subscribed() {
        let mut i = item(Subscription::None, false);
        apply_outbound_subscribed(&mut i);
        assert_eq!(i.subscription, Subscription::From);

        let mut i = item(Subscription::To, false);
        apply_outbound_subscribed(&mut i);
        assert_eq!(i.subscription, Subscription::Both);
    }

    #[test]
    fn test_outbound_unsubscribe() {
        let mut i = item(Subscription::Both, true);
        apply_outbound_unsubscribe(&mut i);
        assert_eq!(i.subscription, Subscription::From);
        assert!(!i.ask);

        let mut i = item(Subscription::To, false);
        apply_outbound_unsubscribe(&mut i);
        assert_eq!(i.subscription, Subscription::None);
    }

    #[test]
    fn test_outbound_unsubscribed() {
        let mut i = item(Subscription::Both, false);
        apply_outbound_unsubscribed(&mut i);
        assert_eq!(i.subscription, Subscription::To);

        let mut i = item(Subscription::From, false);
        apply_outbound_unsubscribed(&mut i);
        assert_eq!(i.subscription, Subscription::None);
    }

    #[test]
    fn test_inbound_subscribed_requires_pending_ask() {
        let mut i = item(Subscription::None, false);
        assert!(!apply_inbound_subscribed(&mut i));
        assert_eq!(i.subscription, Subscription::None);

        let mut i = item(Subscription::None, true);
        assert!(apply_inbound_subscribed(&mut i));
        assert_eq!(i.subscription, Subscription::To);
        assert!(!i.ask);

        let mut i = item(Subscription::From, true);
        assert!(apply_inbound_subscribed(&mut i));
        assert_eq!(i.subscription, Subscription::Both);
    }

    #[test]
    fn test_inbound_unsubscribe_and_unsubscribed() {
        let mut i = item(Subscription::Both, false);
        apply_inbound_unsubscribe(&mut i);
        assert_eq!(i.subscription, Subscription::To);

        let mut i = item(Subscription::Both, true);
        apply_inbound_unsubscribed(&mut i);
        assert_eq!(i.subscription, Subscription::From);
        assert!(!i.ask);
    }
}
