//! XEP-0199: XMPP Ping.
//!
//! Server-directed pings are always answered. With `send_pings` enabled
//! the module also pings idle clients: a timer is armed on bind and re-armed
//! on every received element; when it fires a ping IQ is sent and an ack
//! timer started. A missed ack triggers the configured timeout action.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use minidom::Element;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{send, HookRegistrations, IqHandler, Module, ModuleContext};
use crate::c2s::LocalStream;
use crate::config::{PingConfig, PingTimeoutAction};
use crate::error::{StreamError, StreamErrorCondition};
use crate::hook::{names, weak_hook_fn, HookContext, HookOutcome};
use crate::parser::ns;
use crate::stanza::Stanza;
use crate::types::StreamId;
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "ping";

struct PingTimer {
    cancel: CancellationToken,
    pending: Mutex<Option<String>>,
}

/// Ping responder and idle-client pinger.
pub struct Ping {
    ctx: ModuleContext,
    config: PingConfig,
    hooks: HookRegistrations,
    timers: DashMap<StreamId, Arc<PingTimer>>,
}

impl Ping {
    /// Create the module.
    pub fn new(ctx: ModuleContext, config: PingConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            hooks: HookRegistrations::default(),
            timers: DashMap::new(),
        })
    }

    /// Number of streams with an armed timer.
    pub fn armed(&self) -> usize {
        self.timers.len()
    }

    fn cancel(&self, id: StreamId) {
        if let Some((_, timer)) = self.timers.remove(&id) {
            timer.cancel.cancel();
        }
    }

    fn arm(self: &Arc<Self>, stream: LocalStream) {
        let timer = Arc::new(PingTimer {
            cancel: CancellationToken::new(),
            pending: Mutex::new(None),
        });
        let previous = self.timers.insert(stream.id(), timer.clone());
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let interval = self.config.interval;
        let ack_timeout = self.config.ack_timeout;
        let action = self.config.timeout_action;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(jid) = stream.jid() else {
                return;
            };
            let id = Uuid::new_v4().to_string();
            let ping = Stanza::iq("get", &id)
                .with_from(BareJid::from_parts(None, jid.domain()))
                .with_to(jid.clone())
                .with_child(Element::builder("ping", ns::PING).build());
            *timer.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
            if stream.send_element(ping).is_err() {
                return;
            }
            debug!(stream_id = %stream.id(), "Ping sent");

            tokio::select! {
                _ = timer.cancel.cancelled() => return,
                _ = tokio::time::sleep(ack_timeout) => {}
            }
            if timer.pending.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
                return;
            }
            match action {
                PingTimeoutAction::Kill => {
                    info!(stream_id = %stream.id(), jid = %jid, "Ping timeout, disconnecting");
                    stream
                        .disconnect(Some(StreamError::new(StreamErrorCondition::ConnectionTimeout)))
                        .await;
                }
                PingTimeoutAction::None => {
                    info!(stream_id = %stream.id(), jid = %jid, "Ping timeout");
                }
            }
        });
    }

    /// Clear the pending ping when `stanza` answers it.
    fn acknowledge(&self, id: StreamId, stanza: &Stanza) {
        if !stanza.is_iq_response() {
            return;
        }
        let timer = self.timers.get(&id).map(|entry| Arc::clone(entry.value()));
        if let Some(timer) = timer {
            let mut pending = timer.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if pending.as_deref() == stanza.id() {
                *pending = None;
            }
        }
    }

    fn on_bound(self: &Arc<Self>, ctx: &HookContext) {
        if let Some(stream) = ctx.sender.clone() {
            self.arm(stream);
        }
    }

    fn on_element_received(self: &Arc<Self>, ctx: &HookContext) {
        let (Some(stream), Some(element)) = (ctx.sender.clone(), ctx.element()) else {
            return;
        };
        self.acknowledge(stream.id(), &element.stanza);
        self.arm(stream);
    }

    fn on_terminated(&self, ctx: &HookContext) {
        if let Some(info) = ctx.stream() {
            self.cancel(info.id);
        }
    }
}

#[async_trait]
impl Module for Ping {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn server_features(&self) -> Vec<String> {
        vec![ns::PING.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        if !self.config.send_pings {
            return Ok(());
        }
        let hooks = &self.ctx.hooks;
        self.hooks.add(
            hooks,
            names::C2S_STREAM_BOUND,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    module.on_bound(ctx);
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        self.hooks.add(
            hooks,
            names::C2S_STREAM_ELEMENT_RECEIVED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    module.on_element_received(ctx);
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        self.hooks.add(
            hooks,
            names::C2S_STREAM_TERMINATED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    module.on_terminated(ctx);
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), XmppError> {
        self.hooks.remove_all(&self.ctx.hooks);
        self.timers.retain(|_, timer| {
            timer.cancel.cancel();
            false
        });
        Ok(())
    }

    fn iq_handler(self: Arc<Self>) -> Option<Arc<dyn IqHandler>> {
        Some(self)
    }
}

#[async_trait]
impl IqHandler for Ping {
    fn matches_namespace(&self, namespace: &str, server_target: bool) -> bool {
        server_target && namespace == ns::PING
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        if !iq.is_iq_get() {
            return Err(XmppError::bad_request(None));
        }
        send(&self.ctx.router, iq.result_reply()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c2s::stream::StreamCommand;
    use crate::hook::{ElementInfo, HookInfo, StreamInfo};
    use crate::module::testing::*;
    use std::time::Duration;

    fn config(action: PingTimeoutAction) -> PingConfig {
        PingConfig {
            ack_timeout: Duration::from_millis(250),
            interval: Duration::from_millis(500),
            send_pings: true,
            timeout_action: action,
        }
    }

    fn bound_ctx(stream: &LocalStream) -> HookContext {
        HookContext::new(HookInfo::Stream(StreamInfo {
            id: stream.id(),
            jid: stream.jid(),
            presence: None,
        }))
        .with_sender(stream.clone())
    }

    #[tokio::test]
    async fn test_responder() {
        let harness = Harness::new();
        let module = Ping::new(harness.ctx.clone(), PingConfig::default());
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        module
            .process_iq(&iq(
                "get",
                "ortuman@localhost/yard",
                "localhost",
                Element::builder("ping", ns::PING).build(),
            ))
            .await
            .unwrap();
        assert_eq!(yard.drain()[0].type_attr(), Some("result"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_ping_kills_stream() {
        let harness = Harness::new();
        let module = Ping::new(harness.ctx.clone(), config(PingTimeoutAction::Kill));
        module.clone().start().await.unwrap();
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        let mut ctx = bound_ctx(&yard.stream);
        harness.ctx.hooks.run(names::C2S_STREAM_BOUND, &mut ctx).await.unwrap();

        let ping = match yard.commands.recv().await.unwrap() {
            StreamCommand::Send(stanza) => stanza,
            other => panic!("unexpected command {:?}", other),
        };
        assert!(ping.has_child("ping", ns::PING));
        match yard.commands.recv().await.unwrap() {
            StreamCommand::Disconnect(Some(err)) => {
                assert_eq!(err.condition, StreamErrorCondition::ConnectionTimeout)
            }
            other => panic!("unexpected command {:?}", other),
        }
        yard.stream.mark_done();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_stream() {
        let harness = Harness::new();
        let module = Ping::new(harness.ctx.clone(), config(PingTimeoutAction::Kill));
        module.clone().start().await.unwrap();
        let mut yard = harness.online("ortuman", "yard", Some(0)).await;

        let mut ctx = bound_ctx(&yard.stream);
        harness.ctx.hooks.run(names::C2S_STREAM_BOUND, &mut ctx).await.unwrap();
        let ping = match yard.commands.recv().await.unwrap() {
            StreamCommand::Send(stanza) => stanza,
            other => panic!("unexpected command {:?}", other),
        };

        let pong = Stanza::iq("result", ping.id().unwrap())
            .with_from(jid("ortuman@localhost/yard"))
            .with_to(jid("localhost"));
        let mut ctx = HookContext::new(HookInfo::Element(ElementInfo {
            id: Some(yard.stream.id()),
            stanza: pong,
            targets: Vec::new(),
        }))
        .with_sender(yard.stream.clone());
        harness
            .ctx
            .hooks
            .run(names::C2S_STREAM_ELEMENT_RECEIVED, &mut ctx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(yard.commands.try_recv().is_err());

        let mut ctx = HookContext::new(HookInfo::Stream(StreamInfo {
            id: yard.stream.id(),
            jid: yard.stream.jid(),
            presence: None,
        }));
        harness
            .ctx
            .hooks
            .run(names::C2S_STREAM_TERMINATED, &mut ctx)
            .await
            .unwrap();
        assert_eq!(module.armed(), 0);
        module.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_passive_registers_no_hooks() {
        let harness = Harness::new();
        let module = Ping::new(harness.ctx.clone(), PingConfig::default());
        module.clone().start().await.unwrap();
        assert_eq!(harness.ctx.hooks.len(names::C2S_STREAM_BOUND), 0);
    }
}
