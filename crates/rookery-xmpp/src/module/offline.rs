//! Offline message storage (XEP-0160).
//!
//! Messages for a local account with no bound resource are queued in the
//! repository, stamped with `<delay/>`, and flushed to the first resource
//! that announces itself available with a non-negative priority. Queue
//! access is serialized per account through the repository's named lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::{send, HookRegistrations, Module, ModuleContext};
use crate::c2s::LocalStream;
use crate::config::OfflineConfig;
use crate::error::StanzaErrorCondition;
use crate::hook::{names, weak_hook_fn, HookContext, HookOutcome, HookResult};
use crate::metrics;
use crate::parser::ns;
use crate::resource::same_user;
use crate::stanza::{delay_element, JidExt, Stanza};
use crate::storage::with_lock;
use crate::types::StanzaType;
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "offline";

/// Disco feature advertised by the module.
pub const OFFLINE_FEATURE: &str = "msgoffline";

/// Runs after every other will-route handler.
const WILL_ROUTE_PRIORITY: i32 = i32::MIN;

/// Whether `message` may be kept for later delivery.
pub fn is_archivable(message: &Stanza) -> bool {
    if message.kind() != StanzaType::Message {
        return false;
    }
    if message.has_child("no-store", ns::HINTS) {
        return false;
    }
    if message.has_child("store", ns::HINTS) {
        return true;
    }
    message.is_normal() || (message.is_chat() && message.is_message_with_body())
}

fn lock_name(username: &str) -> String {
    format!("offline:{}", username)
}

/// Offline queue module.
pub struct Offline {
    ctx: ModuleContext,
    config: OfflineConfig,
    hooks: HookRegistrations,
}

impl Offline {
    /// Create the module.
    pub fn new(ctx: ModuleContext, config: OfflineConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            hooks: HookRegistrations::default(),
        })
    }

    async fn on_will_route(&self, ctx: &mut HookContext) -> HookResult {
        let Some(info) = ctx.element() else {
            return Ok(HookOutcome::Continue);
        };
        let message = &info.stanza;
        if !is_archivable(message) {
            return Ok(HookOutcome::Continue);
        }
        let Some(to) = message.to() else {
            return Ok(HookOutcome::Continue);
        };
        let username = to.node_str();
        if username.is_empty() || !self.ctx.hosts.is_local_host(to.domain_str()) {
            return Ok(HookOutcome::Continue);
        }
        let online = self
            .ctx
            .router
            .c2s()
            .directory()
            .get_all(username)
            .iter()
            .any(|desc| same_user(desc, to));
        if online || !self.ctx.repository.user_exists(username).await? {
            return Ok(HookOutcome::Continue);
        }
        self.archive(message).await?;
        Ok(HookOutcome::Halt)
    }

    #[instrument(skip_all, fields(module = MODULE_NAME, to = ?message.to().map(|j| j.to_string())))]
    async fn archive(&self, message: &Stanza) -> Result<(), XmppError> {
        let Some(to) = message.to() else {
            return Ok(());
        };
        let username = to.node_str();
        let delayed = message
            .clone()
            .with_child(delay_element(to.domain_str(), Utc::now()));
        let repository = self.ctx.repository.as_ref();
        let queue_size = self.config.queue_size;
        let queued = with_lock(repository, &lock_name(username), async {
            if repository.count_offline_messages(username).await? >= queue_size {
                return Ok(false);
            }
            repository.insert_offline_message(username, &delayed).await?;
            Ok(true)
        })
        .await?;

        if queued {
            metrics::record_offline_queued();
            debug!(username, "Message stored for offline delivery");
        } else {
            info!(username, queue_size, "Offline queue full");
            send(
                &self.ctx.router,
                message.error_reply(StanzaErrorCondition::ServiceUnavailable),
            )
            .await;
        }
        Ok(())
    }

    async fn on_presence_received(&self, ctx: &HookContext) -> Result<(), XmppError> {
        let (Some(stream), Some(info)) = (ctx.sender.as_ref(), ctx.element()) else {
            return Ok(());
        };
        let presence = &info.stanza;
        if !presence.is_available() || presence.priority() < 0 {
            return Ok(());
        }
        let is_self = presence
            .to()
            .map(|to| to.resource().is_none() && to.node_str() == stream.username())
            .unwrap_or(true);
        if is_self {
            self.deliver_queue(stream).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(module = MODULE_NAME, stream_id = %stream.id()))]
    async fn deliver_queue(&self, stream: &LocalStream) -> Result<(), XmppError> {
        let Some(jid) = stream.jid() else {
            return Ok(());
        };
        let username = stream.username();
        let repository = self.ctx.repository.as_ref();
        let messages = with_lock(repository, &lock_name(&username), async {
            let messages = repository.fetch_offline_messages(&username).await?;
            if !messages.is_empty() {
                repository.delete_offline_messages(&username).await?;
            }
            Ok(messages)
        })
        .await?;
        if messages.is_empty() {
            return Ok(());
        }

        info!(jid = %jid, count = messages.len(), "Delivering offline messages");
        for mut message in messages {
            message.set_to(jid.clone().into());
            if let Err(e) = stream.send_element(message) {
                warn!(jid = %jid, error = %e, "Failed to deliver offline message");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Module for Offline {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn server_features(&self) -> Vec<String> {
        vec![OFFLINE_FEATURE.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        let hooks = &self.ctx.hooks;
        for hook in [names::C2S_STREAM_WILL_ROUTE_ELEMENT, names::S2S_IN_STREAM_WILL_ROUTE_ELEMENT] {
            self.hooks.add(
                hooks,
                hook,
                weak_hook_fn(&self, |module, ctx| {
                    Box::pin(async move { module.on_will_route(ctx).await })
                }),
                WILL_ROUTE_PRIORITY,
            );
        }
        self.hooks.add(
            hooks,
            names::C2S_STREAM_PRESENCE_RECEIVED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    module.on_presence_received(ctx).await?;
                    Ok(HookOutcome::Continue)
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
                        module
                            .ctx
                            .repository
                            .delete_offline_messages(&user.username)
                            .await?;
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
}
