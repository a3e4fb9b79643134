//! XEP-0280: Message Carbons.
//!
//! Each resource toggles carbons for itself; the flag lives in the
//! resource's info map so every instance sees it. After a message has been
//! routed, copies go to the sender's other resources (`<sent/>`) and to the
//! recipient's resources that did not get the original (`<received/>`).

use std::sync::Arc;

use async_trait::async_trait;
use jid::{FullJid, Jid};
use minidom::Element;
use tracing::{debug, instrument};

use super::{HookRegistrations, IqHandler, Module, ModuleContext};
use crate::hook::{names, weak_hook_fn, ElementInfo, HookOutcome};
use crate::parser::ns;
use crate::resource::{info_keys, same_user, ResourceDesc};
use crate::stanza::{JidExt, Stanza};
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "carbons";

/// Whether a routed message should be copied to other resources.
pub fn is_eligible(message: &Stanza) -> bool {
    if message.has_child("sent", ns::CARBONS) || message.has_child("received", ns::CARBONS) {
        return false;
    }
    if message.has_child("private", ns::CARBONS) || message.has_child("no-copy", ns::HINTS) {
        return false;
    }
    if message.is_chat() || (message.is_normal() && message.is_message_with_body()) {
        return true;
    }
    message
        .element()
        .children()
        .any(|c| c.ns() == ns::RECEIPTS || c.ns() == ns::CHATSTATES)
}

/// Wrap `message` in a carbon envelope (`sent` or `received`) addressed
/// to `to`.
pub fn envelope(kind: &str, message: &Stanza, from: Jid, to: &FullJid) -> Stanza {
    let forwarded = Element::builder("forwarded", ns::FORWARD)
        .append(message.element().clone())
        .build();
    let wrapper = Element::builder(kind, ns::CARBONS).append(forwarded).build();
    Stanza::message(Some(message.message_type()))
        .with_from(from)
        .with_to(to.clone())
        .with_child(wrapper)
}

/// Message carbons module.
pub struct Carbons {
    ctx: ModuleContext,
    hooks: HookRegistrations,
}

impl Carbons {
    /// Create the module.
    pub fn new(ctx: ModuleContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            hooks: HookRegistrations::default(),
        })
    }

    fn enabled_resources(&self, jid: &Jid) -> Vec<ResourceDesc> {
        self.ctx
            .router
            .c2s()
            .directory()
            .get_all(jid.node_str())
            .into_iter()
            .filter(|desc| same_user(desc, jid) && desc.info().bool(info_keys::CARBONS_ENABLED))
            .collect()
    }

    async fn deliver(&self, copy: Stanza, desc: &ResourceDesc) {
        if let Err(e) = self.ctx.router.c2s().route_to(copy, desc).await {
            debug!(jid = %desc.jid(), error = %e, "Carbon copy not delivered");
        }
    }

    /// Replace `<private/>` by a `<no-copy/>` hint so that neither this
    /// server nor the recipient's copies the message.
    fn strip_private(info: &mut ElementInfo) {
        let stanza = &mut info.stanza;
        if stanza.remove_child("private", ns::CARBONS).is_some() && !stanza.has_child("no-copy", ns::HINTS) {
            stanza.append_child(Element::builder("no-copy", ns::HINTS).build());
        }
    }

    #[instrument(skip_all, fields(module = MODULE_NAME))]
    async fn on_message_routed(&self, info: &ElementInfo) -> Result<(), XmppError> {
        let message = &info.stanza;
        if !is_eligible(message) {
            return Ok(());
        }
        let (Some(from), Some(to)) = (message.from(), message.to()) else {
            return Ok(());
        };

        if from.is_full_with_user() && self.ctx.hosts.is_local_host(from.domain_str()) {
            for desc in self.enabled_resources(from) {
                if desc.resource() == from.resource_str() || info.targets.contains(desc.jid()) {
                    continue;
                }
                let copy = envelope("sent", message, from.to_bare().into(), desc.jid());
                self.deliver(copy, &desc).await;
            }
        }

        if self.ctx.hosts.is_local_host(to.domain_str()) && !to.node_str().is_empty() {
            for desc in self.enabled_resources(to) {
                if info.targets.contains(desc.jid()) {
                    continue;
                }
                if same_user(&desc, from) && desc.resource() == from.resource_str() {
                    continue;
                }
                let copy = envelope("received", message, to.to_bare().into(), desc.jid());
                self.deliver(copy, &desc).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Carbons {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::CARBONS.to_string()]
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::CARBONS.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        let hooks = &self.ctx.hooks;
        for hook in [names::C2S_STREAM_WILL_ROUTE_ELEMENT, names::S2S_IN_STREAM_WILL_ROUTE_ELEMENT] {
            self.hooks.add(
                hooks,
                hook,
                weak_hook_fn(&self, |_module, ctx| {
                    Box::pin(async move {
                        if let Some(info) = ctx.element_mut() {
                            Self::strip_private(info);
                        }
                        Ok(HookOutcome::Continue)
                    })
                }),
                0,
            );
        }
        for hook in [names::C2S_STREAM_MESSAGE_ROUTED, names::S2S_IN_STREAM_MESSAGE_ROUTED] {
            self.hooks.add(
                hooks,
                hook,
                weak_hook_fn(&self, |module, ctx| {
                    Box::pin(async move {
                        if let Some(info) = ctx.element() {
                            module.on_message_routed(info).await?;
                        }
                        Ok(HookOutcome::Continue)
                    })
                }),
                0,
            );
        }
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
impl IqHandler for Carbons {
    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::CARBONS
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        let Some(from) = iq.from() else {
            return Err(XmppError::bad_request(None));
        };
        if !from.is_full_with_user() || !self.ctx.hosts.is_local_host(from.domain_str()) {
            return Err(XmppError::not_allowed(None));
        }
        if !iq.is_iq_set() {
            return Err(XmppError::bad_request(None));
        }
        let enable = if iq.has_child("enable", ns::CARBONS) {
            true
        } else if iq.has_child("disable", ns::CARBONS) {
            false
        } else {
            return Err(XmppError::bad_request(None));
        };
        let stream = self
            .ctx
            .router
            .c2s()
            .local_stream(from.node_str(), from.resource_str())
            .ok_or_else(|| XmppError::service_unavailable(None))?;
        stream.set_info_value(info_keys::CARBONS_ENABLED, enable).await?;
        debug!(jid = %from, enable, "Carbons toggled");
        super::send(&self.ctx.router, iq.result_reply()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::testing::*;

    fn toggle(kind: &str, from: &str) -> Stanza {
        iq("set", from, "ortuman@localhost", Element::builder(kind, ns::CARBONS).build())
    }

    async fn started(harness: &Harness) -> Arc<Carbons> {
        let module = Carbons::new(harness.ctx.clone());
        module.clone().start().await.unwrap();
        module
    }

    #[test]
    fn test_eligibility() {
        assert!(is_eligible(&chat("a@localhost/x", "b@localhost", "hi")));
        assert!(!is_eligible(&Stanza::message(Some("groupchat")).with_to(jid("room@muc.localhost"))));
        assert!(!is_eligible(&Stanza::message(None).with_to(jid("b@localhost"))));
        let receipt = Stanza::message(Some("normal"))
            .with_child(Element::builder("received", ns::RECEIPTS).attr("id", "x").build());
        assert!(is_eligible(&receipt));
        let private = chat("a@localhost/x", "b@localhost", "hi")
            .with_child(Element::builder("private", ns::CARBONS).build());
        assert!(!is_eligible(&private));
        let carbon = envelope("sent", &chat("a@localhost/x", "b@localhost", "hi"), jid("a@localhost"), &"a@localhost/y".parse().unwrap());
        assert!(!is_eligible(&carbon));
    }

    #[tokio::test]
    async fn test_enable_is_idempotent() {
        let harness = Harness::new();
        let module = started(&harness).await;
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module.process_iq(&toggle("enable", "ortuman@localhost/yard")).await.unwrap();
        module.process_iq(&toggle("enable", "ortuman@localhost/yard")).await.unwrap();
        assert_eq!(yard.drain().len(), 2);
        let desc = harness.directory.get("ortuman", "yard").unwrap();
        assert!(desc.info().bool(info_keys::CARBONS_ENABLED));

        module.process_iq(&toggle("disable", "ortuman@localhost/yard")).await.unwrap();
        let desc = harness.directory.get("ortuman", "yard").unwrap();
        assert!(!desc.info().bool(info_keys::CARBONS_ENABLED));
    }

    #[tokio::test]
    async fn test_remote_originator_not_allowed() {
        let harness = Harness::new();
        let module = started(&harness).await;
        let err = module
            .process_iq(&toggle("enable", "noelia@jabber.org/hall"))
            .await
            .unwrap_err();
        assert_eq!(err.stanza_condition(), crate::error::StanzaErrorCondition::NotAllowed);
    }

    #[tokio::test]
    async fn test_received_copies_skip_targets_and_disabled() {
        let harness = Harness::new();
        let _module = started(&harness).await;
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;
        let mut balcony = harness.online("ortuman", "balcony", Some(0)).await;
        let mut hall = harness.online("ortuman", "hall", Some(0)).await;
        yard.stream.set_info_value(info_keys::CARBONS_ENABLED, true).await.unwrap();
        balcony.stream.set_info_value(info_keys::CARBONS_ENABLED, true).await.unwrap();

        let message = chat("noelia@jabber.org/hall", "ortuman@localhost/yard", "hi");
        let mut ctx = crate::hook::HookContext::new(crate::hook::HookInfo::Element(ElementInfo {
            id: None,
            stanza: message,
            targets: vec!["ortuman@localhost/yard".parse().unwrap()],
        }));
        harness
            .ctx
            .hooks
            .run(names::S2S_IN_STREAM_MESSAGE_ROUTED, &mut ctx)
            .await
            .unwrap();

        assert!(yard.drain().is_empty());
        assert!(hall.drain().is_empty());
        let copies = balcony.drain();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].has_child("received", ns::CARBONS));
        assert_eq!(copies[0].from().unwrap().to_string(), "ortuman@localhost");
    }

    #[tokio::test]
    async fn test_sent_copies_go_to_other_resources() {
        let harness = Harness::new();
        let _module = started(&harness).await;
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;
        let mut balcony = harness.online("ortuman", "balcony", Some(0)).await;
        balcony.stream.set_info_value(info_keys::CARBONS_ENABLED, true).await.unwrap();

        let message = chat("ortuman@localhost/yard", "noelia@jabber.org", "hi");
        let mut ctx = crate::hook::HookContext::new(crate::hook::HookInfo::Element(ElementInfo {
            id: Some(yard.stream.id()),
            stanza: message,
            targets: Vec::new(),
        }));
        harness
            .ctx
            .hooks
            .run(names::C2S_STREAM_MESSAGE_ROUTED, &mut ctx)
            .await
            .unwrap();

        assert!(yard.drain().is_empty());
        let copies = balcony.drain();
        assert_eq!(copies.len(), 1);
        let forwarded = copies[0]
            .child("sent", ns::CARBONS)
            .and_then(|s| s.get_child("forwarded", ns::FORWARD))
            .unwrap();
        assert!(forwarded.has_child("message", ns::JABBER_CLIENT));
    }

    #[tokio::test]
    async fn test_private_is_stripped_and_not_copied() {
        let harness = Harness::new();
        let _module = started(&harness).await;
        let message = chat("ortuman@localhost/yard", "noelia@localhost", "hi")
            .with_child(Element::builder("private", ns::CARBONS).build());

        let (halted, routed) = harness
            .run_element_hook(names::C2S_STREAM_WILL_ROUTE_ELEMENT, message, None)
            .await;
        assert!(!halted);
        assert!(!routed.has_child("private", ns::CARBONS));
        assert!(routed.has_child("no-copy", ns::HINTS));
        assert!(!is_eligible(&routed));
    }
}
