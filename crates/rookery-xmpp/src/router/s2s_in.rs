//! Entry point for stanzas arriving over incoming server-to-server streams.
//!
//! The S2S transport authenticates the remote domain and hands every stanza
//! to [`S2sInHandler::process_stanza`], which runs the `s2s_in_*` hooks and
//! delivers through the global router the same way a C2S session does.

use std::sync::Arc;

use jid::Jid;
use tracing::{debug, instrument, warn};

use super::{RouteError, Router, RoutingOptions};
use crate::hook::{names, ElementInfo, HookContext, HookInfo, Hooks};
use crate::metrics;
use crate::module::Modules;
use crate::stanza::Stanza;
use crate::types::StanzaType;

/// Processes stanzas received from remote servers.
pub struct S2sInHandler {
    router: Arc<Router>,
    hooks: Arc<Hooks>,
    modules: Arc<Modules>,
}

impl S2sInHandler {
    pub fn new(router: Arc<Router>, hooks: Arc<Hooks>, modules: Arc<Modules>) -> Self {
        Self {
            router,
            hooks,
            modules,
        }
    }

    /// Deliver a stanza received from a remote domain. Stanzas that cannot
    /// be delivered are bounced to the sender unless they are errors
    /// themselves.
    #[instrument(skip(self, stanza), fields(kind = %stanza.kind(), from = ?stanza.from().map(|j| j.to_string())))]
    pub async fn process_stanza(&self, stanza: Stanza) {
        if stanza.from().is_none() || stanza.to().is_none() {
            debug!("Dropping S2S stanza without addressing");
            return;
        }
        metrics::record_stanza(&stanza.kind().to_string());
        match stanza.kind() {
            StanzaType::Iq => self.process_iq(stanza).await,
            StanzaType::Presence => self.process_presence(stanza).await,
            StanzaType::Message => self.process_message(stanza).await,
            StanzaType::Other => debug!(name = stanza.name(), "Ignoring unknown S2S element"),
        }
    }

    async fn process_iq(&self, iq: Stanza) {
        if self.modules.is_module_iq(&iq) {
            self.modules.process_iq(&iq).await;
            return;
        }
        let Some(iq) = self.run_hook(names::S2S_IN_STREAM_WILL_ROUTE_ELEMENT, iq, Vec::new()).await
        else {
            return;
        };
        if let Err(e) = self.router.route(iq.clone(), RoutingOptions::default()).await {
            if !iq.is_iq_response() {
                self.bounce(&iq, e).await;
            }
        }
    }

    async fn process_presence(&self, presence: Stanza) {
        let Some(presence) = self
            .run_hook(names::S2S_IN_STREAM_PRESENCE_RECEIVED, presence, Vec::new())
            .await
        else {
            return;
        };
        // Subscription and broadcast handling is left to the hook handlers;
        // only directed presences reach the router from here.
        let directed = presence.to().map(|to| to.resource().is_some()).unwrap_or(false);
        if !directed {
            return;
        }
        let Some(presence) = self
            .run_hook(names::S2S_IN_STREAM_WILL_ROUTE_ELEMENT, presence, Vec::new())
            .await
        else {
            return;
        };
        if let Err(e) = self.router.route(presence, RoutingOptions::default()).await {
            debug!(error = %e, "Directed presence not delivered");
        }
    }

    async fn process_message(&self, message: Stanza) {
        let Some(mut message) = self
            .run_hook(names::S2S_IN_STREAM_WILL_ROUTE_ELEMENT, message, Vec::new())
            .await
        else {
            return;
        };
        let options = RoutingOptions::check_user_existence();
        let mut result = self.router.route(message.clone(), options).await;
        if matches!(result, Err(RouteError::ResourceNotFound)) {
            if let Some(bare) = message.to().map(|to| Jid::from(to.to_bare())) {
                message.set_to(bare);
                result = self.router.route(message.clone(), options).await;
            }
        }
        match result {
            Ok(targets) => {
                self.run_hook(names::S2S_IN_STREAM_MESSAGE_ROUTED, message, targets)
                    .await;
            }
            Err(_) if message.message_type() == "error" => {}
            Err(e) => self.bounce(&message, e).await,
        }
    }

    async fn bounce(&self, stanza: &Stanza, error: RouteError) {
        let reply = stanza.error_reply(error.stanza_condition());
        if let Err(e) = self.router.route(reply, RoutingOptions::default()).await {
            debug!(error = %e, "Failed to bounce S2S stanza");
        }
    }

    async fn run_hook(
        &self,
        name: &str,
        stanza: Stanza,
        targets: Vec<jid::FullJid>,
    ) -> Option<Stanza> {
        let mut ctx = HookContext::new(HookInfo::Element(ElementInfo {
            id: None,
            stanza,
            targets,
        }));
        match self.hooks.run(name, &mut ctx).await {
            Ok(true) => None,
            Ok(false) => match ctx.info {
                HookInfo::Element(info) => Some(info.stanza),
                _ => None,
            },
            Err(e) => {
                warn!(hook = name, error = %e, "Hook failed, dropping stanza");
                None
            }
        }
    }
}

impl std::fmt::Debug for S2sInHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S2sInHandler")
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{hook_fn, HookOutcome};
    use crate::module::testing::{available, chat, jid, Harness};
    use crate::stanza::PresenceType;

    fn handler(harness: &Harness) -> S2sInHandler {
        let modules = Arc::new(Modules::new(
            Vec::new(),
            harness.ctx.hosts.clone(),
            harness.ctx.router.clone(),
        ));
        S2sInHandler::new(harness.ctx.router.clone(), harness.ctx.hooks.clone(), modules)
    }

    #[tokio::test]
    async fn test_remote_message_reaches_local_resource() {
        let harness = Harness::new();
        harness.add_user("ortuman").await;
        let mut yard = harness.online("ortuman", "yard", Some(1)).await;

        handler(&harness)
            .process_stanza(chat("noelia@jabber.org/balcony", "ortuman@localhost", "hi"))
            .await;

        let received = yard.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_unknown_resource_falls_back_to_bare() {
        let harness = Harness::new();
        harness.add_user("ortuman").await;
        let mut yard = harness.online("ortuman", "yard", Some(1)).await;

        handler(&harness)
            .process_stanza(chat("noelia@jabber.org/balcony", "ortuman@localhost/gone", "hi"))
            .await;

        assert_eq!(yard.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_presence_hook_halts_delivery() {
        let harness = Harness::new();
        harness.add_user("ortuman").await;
        let mut yard = harness.online("ortuman", "yard", Some(1)).await;
        harness.ctx.hooks.add(
            names::S2S_IN_STREAM_PRESENCE_RECEIVED,
            hook_fn(|_| Box::pin(async { Ok(HookOutcome::Halt) })),
            0,
        );

        let presence = available(3)
            .with_from(jid("noelia@jabber.org/balcony"))
            .with_to(jid("ortuman@localhost/yard"));
        handler(&harness).process_stanza(presence).await;

        assert!(yard.drain().is_empty());
    }

    #[tokio::test]
    async fn test_directed_presence_is_routed() {
        let harness = Harness::new();
        harness.add_user("ortuman").await;
        let mut yard = harness.online("ortuman", "yard", Some(1)).await;

        let presence = Stanza::presence(PresenceType::Unavailable)
            .with_from(jid("noelia@jabber.org/balcony"))
            .with_to(jid("ortuman@localhost/yard"));
        handler(&harness).process_stanza(presence).await;

        let received = yard.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].type_attr(), Some("unavailable"));
    }

    #[tokio::test]
    async fn test_unaddressed_stanza_is_dropped() {
        let harness = Harness::new();
        let mut yard = harness.online("ortuman", "yard", Some(1)).await;
        handler(&harness)
            .process_stanza(Stanza::message(Some("chat")).with_to(jid("ortuman@localhost/yard")))
            .await;
        assert!(yard.drain().is_empty());
    }
}
