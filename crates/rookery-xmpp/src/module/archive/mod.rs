//! XEP-0313: Message Archive Management.
//!
//! Messages exchanged by local accounts are archived once per local party.
//! The recipient's copy is tagged with a `<stanza-id/>` (XEP-0359) while
//! the message is on its way, and the same id identifies the entry in the
//! recipient's archive. Each archive is capped at `queue_size` entries; the
//! oldest are evicted in the same transaction as the insert.

pub mod query;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jid::Jid;
use minidom::Element;
use tracing::{debug, instrument};
use uuid::Uuid;

use self::query::{fin_element, form_element, metadata_element, paginate, result_message, ArchiveQuery};
use super::{send, HookRegistrations, IqHandler, Module, ModuleContext};
use crate::config::ArchiveConfig;
use crate::hook::{names, weak_hook_fn, HookContext, HookOutcome, HookResult};
use crate::metrics;
use crate::parser::ns;
use crate::resource::info_keys;
use crate::stanza::{JidExt, Stanza};
use crate::storage::{ArchiveMessage, Repository, StorageError};
use crate::types::StanzaType;
use crate::XmppError;

/// Configuration name.
pub const MODULE_NAME: &str = "archive";

/// Runs before the offline queue may consume the message.
const WILL_ROUTE_PRIORITY: i32 = 100;

/// Whether `message` belongs in the archive.
pub fn is_archivable(message: &Stanza) -> bool {
    message.kind() == StanzaType::Message
        && (message.is_chat() || message.is_normal())
        && message.is_message_with_body()
        && !message.has_child("no-store", ns::HINTS)
}

/// Id of the `<stanza-id/>` assigned by `by`, if any.
pub fn stanza_id(message: &Stanza, by: &str) -> Option<String> {
    message
        .element()
        .children()
        .find(|c| c.is("stanza-id", ns::STANZA_ID) && c.attr("by") == Some(by))
        .and_then(|c| c.attr("id"))
        .map(str::to_string)
}

/// Drop every `<stanza-id/>` claiming to come from `by`.
fn strip_stanza_ids(message: &mut Stanza, by: &str) {
    let mut kept = Vec::new();
    while let Some(id) = message.remove_child("stanza-id", ns::STANZA_ID) {
        if id.attr("by") != Some(by) {
            kept.push(id);
        }
    }
    for id in kept {
        message.append_child(id);
    }
}

/// Archive module.
pub struct Archive {
    ctx: ModuleContext,
    config: ArchiveConfig,
    hooks: HookRegistrations,
}

impl Archive {
    /// Create the module.
    pub fn new(ctx: ModuleContext, config: ArchiveConfig) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            hooks: HookRegistrations::default(),
        })
    }

    fn local_account<'a>(&self, jid: Option<&'a Jid>) -> Option<&'a Jid> {
        jid.filter(|j| !j.node_str().is_empty() && self.ctx.hosts.is_local_host(j.domain_str()))
    }

    /// Insert `message` into `archive_id`, evicting the oldest entries above
    /// the configured cap.
    #[instrument(skip(self, message), fields(module = MODULE_NAME))]
    async fn archive(&self, archive_id: &str, id: String, message: &Stanza) -> Result<(), XmppError> {
        let entry = ArchiveMessage {
            archive_id: archive_id.to_string(),
            id,
            from: message.from().map(|j| j.to_string()).unwrap_or_default(),
            to: message.to().map(|j| j.to_string()).unwrap_or_default(),
            message: message.clone(),
            stamp: Utc::now(),
        };
        let queue_size = self.config.queue_size;
        self.ctx
            .repository
            .in_transaction(&move |tx: &dyn Repository| {
                let entry = entry.clone();
                Box::pin(async move {
                    tx.insert_archive_message(&entry).await?;
                    tx.delete_archive_oldest_messages(&entry.archive_id, queue_size)
                        .await
                })
            })
            .await?;
        metrics::record_archive_insert();
        debug!(archive_id, "Message archived");
        Ok(())
    }

    /// Sender copy of a message sent by a local client.
    async fn on_message_received(&self, ctx: &HookContext) -> Result<(), XmppError> {
        let Some(info) = ctx.element() else {
            return Ok(());
        };
        let message = &info.stanza;
        if !is_archivable(message) {
            return Ok(());
        }
        if let Some(from) = self.local_account(message.from()) {
            self.archive(from.node_str(), Uuid::new_v4().to_string(), message)
                .await?;
        }
        Ok(())
    }

    /// Tag the recipient copy. Recipients without any bound resource get
    /// their copy archived here, since the message may never be routed.
    async fn on_will_route(&self, ctx: &mut HookContext) -> HookResult {
        let Some(info) = ctx.element_mut() else {
            return Ok(HookOutcome::Continue);
        };
        let message = &mut info.stanza;
        if message.kind() != StanzaType::Message {
            return Ok(HookOutcome::Continue);
        }
        let Some(to) = self.local_account(message.to()).cloned() else {
            return Ok(HookOutcome::Continue);
        };
        let by = to.to_bare().to_string();
        strip_stanza_ids(message, &by);
        if !is_archivable(message) {
            return Ok(HookOutcome::Continue);
        }
        let id = Uuid::new_v4().to_string();
        message.append_child(
            Element::builder("stanza-id", ns::STANZA_ID)
                .attr("by", by.as_str())
                .attr("id", id.as_str())
                .build(),
        );

        let offline = self
            .ctx
            .router
            .c2s()
            .directory()
            .get_all(to.node_str())
            .is_empty();
        if offline && self.ctx.repository.user_exists(to.node_str()).await? {
            let message = message.clone();
            self.archive(to.node_str(), id, &message).await?;
        }
        Ok(HookOutcome::Continue)
    }

    /// Recipient copy of a delivered message.
    async fn on_message_routed(&self, ctx: &HookContext) -> Result<(), XmppError> {
        let Some(info) = ctx.element() else {
            return Ok(());
        };
        let message = &info.stanza;
        if !is_archivable(message) {
            return Ok(());
        }
        let Some(to) = self.local_account(message.to()) else {
            return Ok(());
        };
        let Some(id) = stanza_id(message, &to.to_bare().to_string()) else {
            return Ok(());
        };
        self.archive(to.node_str(), id, message).await
    }

    async fn process_query(&self, iq: &Stanza, from: &Jid, query: &Element) -> Result<(), XmppError> {
        let archive_id = from.node_str();
        if let Some(stream) = self.ctx.router.c2s().local_stream(archive_id, from.resource_str()) {
            stream.set_info_value(info_keys::ARCHIVE_REQUESTED, true).await?;
        }
        let parsed = ArchiveQuery::from_element(query)?;
        let messages = self
            .ctx
            .repository
            .fetch_archive_messages(archive_id, &parsed.filters)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(what) => XmppError::item_not_found(Some(what)),
                other => other.into(),
            })?;
        let page = paginate(messages, &parsed.page)?;

        let owner = from.to_bare();
        let mut results: Vec<&ArchiveMessage> = page.messages.iter().collect();
        if parsed.flip_page {
            results.reverse();
        }
        for entry in results {
            let result = result_message(entry, parsed.query_id.as_deref(), owner.clone(), from.clone());
            send(&self.ctx.router, result).await;
        }
        debug!(archive_id, count = page.messages.len(), complete = page.complete, "Archive page sent");
        send(&self.ctx.router, iq.result_reply_with(fin_element(&page))).await;
        Ok(())
    }
}

#[async_trait]
impl Module for Archive {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn account_features(&self) -> Vec<String> {
        vec![ns::MAM.to_string()]
    }

    async fn start(self: Arc<Self>) -> Result<(), XmppError> {
        let hooks = &self.ctx.hooks;
        self.hooks.add(
            hooks,
            names::C2S_STREAM_MESSAGE_RECEIVED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    module.on_message_received(ctx).await?;
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );
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
        for hook in [names::C2S_STREAM_MESSAGE_ROUTED, names::S2S_IN_STREAM_MESSAGE_ROUTED] {
            self.hooks.add(
                hooks,
                hook,
                weak_hook_fn(&self, |module, ctx| {
                    Box::pin(async move {
                        module.on_message_routed(ctx).await?;
                        Ok(HookOutcome::Continue)
                    })
                }),
                0,
            );
        }
        self.hooks.add(
            hooks,
            names::USER_DELETED,
            weak_hook_fn(&self, |module, ctx| {
                Box::pin(async move {
                    if let Some(user) = ctx.user() {
                        module.ctx.repository.delete_archive(&user.username).await?;
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
impl IqHandler for Archive {
    fn matches_namespace(&self, namespace: &str, _server_target: bool) -> bool {
        namespace == ns::MAM
    }

    #[instrument(skip(self, iq), fields(module = MODULE_NAME, id = ?iq.id()))]
    async fn process_iq(&self, iq: &Stanza) -> Result<(), XmppError> {
        let (Some(from), Some(payload)) = (iq.from(), iq.iq_payload()) else {
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

        match (payload.name(), iq.is_iq_get()) {
            ("metadata", true) => {
                let metadata = self
                    .ctx
                    .repository
                    .fetch_archive_metadata(from.node_str())
                    .await?;
                send(
                    &self.ctx.router,
                    iq.result_reply_with(metadata_element(metadata.as_ref())),
                )
                .await;
                Ok(())
            }
            ("query", true) => {
                send(&self.ctx.router, iq.result_reply_with(form_element())).await;
                Ok(())
            }
            ("query", false) => self.process_query(iq, from, payload).await,
            _ => Err(XmppError::bad_request(None)),
        }
    }
}
