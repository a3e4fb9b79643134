//! Process-wide hook bus.
//!
//! Handlers are registered under a hook name with an `i32` priority and run
//! in descending priority order (ties keep registration order). A handler
//! consumes an event by returning [`HookOutcome::Halt`]; returning an error
//! aborts the chain and hands the error to the caller.
//!
//! `run` only snapshots the handler list under the read lock, so handlers
//! may themselves run hooks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use jid::FullJid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::c2s::LocalStream;
use crate::stanza::Stanza;
use crate::types::StreamId;

/// Hook names fired by the core.
pub mod names {
    /// A C2S stream was accepted.
    pub const C2S_STREAM_CONNECTED: &str = "c2s_stream_connected";
    /// A C2S stream sent its closing tag or lost its transport.
    pub const C2S_STREAM_DISCONNECTED: &str = "c2s_stream_disconnected";
    /// A C2S stream bound a resource.
    pub const C2S_STREAM_BOUND: &str = "c2s_stream_bound";
    /// A C2S stream reached its terminal state.
    pub const C2S_STREAM_TERMINATED: &str = "c2s_stream_terminated";
    /// Any stanza received on a bound C2S stream.
    pub const C2S_STREAM_ELEMENT_RECEIVED: &str = "c2s_stream_element_received";
    /// An IQ received on a bound C2S stream.
    pub const C2S_STREAM_IQ_RECEIVED: &str = "c2s_stream_iq_received";
    /// A presence received on a bound C2S stream.
    pub const C2S_STREAM_PRESENCE_RECEIVED: &str = "c2s_stream_presence_received";
    /// A message received on a bound C2S stream.
    pub const C2S_STREAM_MESSAGE_RECEIVED: &str = "c2s_stream_message_received";
    /// A stanza from a C2S stream is about to be routed.
    pub const C2S_STREAM_WILL_ROUTE_ELEMENT: &str = "c2s_stream_will_route_element";
    /// A message from a C2S stream was routed.
    pub const C2S_STREAM_MESSAGE_ROUTED: &str = "c2s_stream_message_routed";
    /// A presence arrived over an incoming S2S stream.
    pub const S2S_IN_STREAM_PRESENCE_RECEIVED: &str = "s2s_in_stream_presence_received";
    /// A stanza from an incoming S2S stream is about to be routed.
    pub const S2S_IN_STREAM_WILL_ROUTE_ELEMENT: &str = "s2s_in_stream_will_route_element";
    /// A message from an incoming S2S stream was routed.
    pub const S2S_IN_STREAM_MESSAGE_ROUTED: &str = "s2s_in_stream_message_routed";
    /// A local account was deleted.
    pub const USER_DELETED: &str = "user_deleted";
    /// The set of cluster members changed.
    pub const MEMBER_LIST_UPDATED: &str = "member_list_updated";
}

/// What a handler decided about the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Let the next handler run.
    Continue,
    /// The event was consumed; stop the chain.
    Halt,
}

/// Result returned by a hook handler.
pub type HookResult = anyhow::Result<HookOutcome>;

/// A registered hook callback.
pub type HookFn =
    Arc<dyn for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, HookResult> + Send + Sync>;

/// Wrap a closure as a hook callback.
pub fn hook_fn<F>(f: F) -> HookFn
where
    F: for<'a> Fn(&'a mut HookContext) -> BoxFuture<'a, HookResult> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a method of `target` as a hook callback that only holds a weak
/// reference; once `target` is dropped the callback is a no-op.
pub fn weak_hook_fn<T, F>(target: &Arc<T>, f: F) -> HookFn
where
    T: Send + Sync + 'static,
    F: for<'a> Fn(Arc<T>, &'a mut HookContext) -> BoxFuture<'a, HookResult>
        + Send
        + Sync
        + 'static,
{
    let weak = Arc::downgrade(target);
    hook_fn(move |ctx| match weak.upgrade() {
        Some(target) => f(target, ctx),
        None => Box::pin(async { Ok(HookOutcome::Continue) }),
    })
}

/// Payload describing a stream lifecycle event.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// Stream identifier
    pub id: StreamId,
    /// Bound JID, if any
    pub jid: Option<FullJid>,
    /// Last presence of the stream, if any
    pub presence: Option<Stanza>,
}

/// Payload describing a stanza moving through the pipeline.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    /// Originating stream, if the stanza came from a local C2S stream
    pub id: Option<StreamId>,
    /// The stanza; handlers may rewrite it
    pub stanza: Stanza,
    /// Resources the stanza was delivered to (post-routing hooks only)
    pub targets: Vec<FullJid>,
}

/// Payload describing an account event.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Account node
    pub username: String,
}

/// Payload describing a cluster membership change.
#[derive(Debug, Clone, Default)]
pub struct MemberListInfo {
    /// Instances that joined
    pub registered: Vec<String>,
    /// Instances that left
    pub unregistered: Vec<String>,
}

/// Event payload variants.
#[derive(Debug, Clone)]
pub enum HookInfo {
    /// Stream lifecycle
    Stream(StreamInfo),
    /// Stanza pipeline
    Element(ElementInfo),
    /// Account lifecycle
    User(UserInfo),
    /// Cluster membership
    MemberList(MemberListInfo),
}

/// Execution context handed to every handler of one `run`.
pub struct HookContext {
    /// Local stream that triggered the event, if any
    pub sender: Option<LocalStream>,
    /// Mutable payload
    pub info: HookInfo,
    /// Cancellation scope of the triggering request
    pub cancel: CancellationToken,
}

impl HookContext {
    /// Context with no sender and a fresh cancellation scope.
    pub fn new(info: HookInfo) -> Self {
        Self {
            sender: None,
            info,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the triggering stream.
    pub fn with_sender(mut self, sender: LocalStream) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Inherit a cancellation scope.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stanza payload, if this is a stanza event.
    pub fn element(&self) -> Option<&ElementInfo> {
        match self.info {
            HookInfo::Element(ref info) => Some(info),
            _ => None,
        }
    }

    /// Mutable stanza payload, if this is a stanza event.
    pub fn element_mut(&mut self) -> Option<&mut ElementInfo> {
        match self.info {
            HookInfo::Element(ref mut info) => Some(info),
            _ => None,
        }
    }

    /// Stream payload, if this is a stream event.
    pub fn stream(&self) -> Option<&StreamInfo> {
        match self.info {
            HookInfo::Stream(ref info) => Some(info),
            _ => None,
        }
    }

    /// Account payload, if this is an account event.
    pub fn user(&self) -> Option<&UserInfo> {
        match self.info {
            HookInfo::User(ref info) => Some(info),
            _ => None,
        }
    }

    /// Membership payload, if this is a membership event.
    pub fn member_list(&self) -> Option<&MemberListInfo> {
        match self.info {
            HookInfo::MemberList(ref info) => Some(info),
            _ => None,
        }
    }
}

/// Handle returned by [`Hooks::add`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registered {
    id: HandlerId,
    priority: i32,
    handler: HookFn,
}

/// The hook bus.
#[derive(Default)]
pub struct Hooks {
    handlers: RwLock<HashMap<String, Vec<Registered>>>,
    next_id: AtomicU64,
}

impl Hooks {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name` with `priority`.
    pub fn add(&self, name: &str, handler: HookFn, priority: i32) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let list = handlers.entry(name.to_string()).or_default();
        list.push(Registered {
            id,
            priority,
            handler,
        });
        // Stable sort keeps insertion order among equal priorities.
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        trace!(hook = name, priority, "Hook handler registered");
        id
    }

    /// Remove a handler. Returns whether it was registered.
    pub fn remove(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        removed
    }

    /// Number of handlers registered under `name`.
    pub fn len(&self, name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Run every handler of `name`. Returns `Ok(true)` when a handler halted
    /// the chain.
    pub async fn run(&self, name: &str, ctx: &mut HookContext) -> anyhow::Result<bool> {
        let chain: Vec<HookFn> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(name) {
                Some(list) => list.iter().map(|r| r.handler.clone()).collect(),
                None => return Ok(false),
            }
        };
        for handler in chain {
            if ctx.cancel.is_cancelled() {
                anyhow::bail!("hook {} cancelled", name);
            }
            if handler(ctx).await? == HookOutcome::Halt {
                debug!(hook = name, "Hook chain halted");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Hooks")
            .field("hooks", &handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn user_ctx() -> HookContext {
        HookContext::new(HookInfo::User(UserInfo {
            username: "ortuman".to_string(),
        }))
    }

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str, outcome: HookOutcome) -> HookFn {
        let log = log.clone();
        hook_fn(move |_ctx| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(tag);
                Ok(outcome)
            })
        })
    }

    #[tokio::test]
    async fn test_runs_by_descending_priority_with_stable_ties() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("h", recorder(&log, "low", HookOutcome::Continue), 1);
        hooks.add("h", recorder(&log, "high", HookOutcome::Continue), 10);
        hooks.add("h", recorder(&log, "mid-a", HookOutcome::Continue), 5);
        hooks.add("h", recorder(&log, "mid-b", HookOutcome::Continue), 5);

        let halted = hooks.run("h", &mut user_ctx()).await.unwrap();

        assert!(!halted);
        assert_eq!(*log.lock().unwrap(), vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[tokio::test]
    async fn test_halt_stops_chain_without_error() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("h", recorder(&log, "first", HookOutcome::Halt), 10);
        hooks.add("h", recorder(&log, "second", HookOutcome::Continue), 0);

        let halted = hooks.run("h", &mut user_ctx()).await.unwrap();

        assert!(halted);
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_error_aborts_chain() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add(
            "h",
            hook_fn(|_ctx| Box::pin(async { Err(anyhow::anyhow!("storage down")) })),
            10,
        );
        hooks.add("h", recorder(&log, "after", HookOutcome::Continue), 0);

        let result = hooks.run("h", &mut user_ctx()).await;

        assert!(result.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_unknown_hook() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = hooks.add("h", recorder(&log, "x", HookOutcome::Halt), 0);

        assert!(hooks.remove("h", id));
        assert!(!hooks.remove("h", id));
        assert_eq!(hooks.len("h"), 0);
        assert!(!hooks.run("h", &mut user_ctx()).await.unwrap());
        assert!(!hooks.run("unknown", &mut user_ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_handlers_can_mutate_payload() {
        let hooks = Hooks::new();
        hooks.add(
            "h",
            hook_fn(|ctx| {
                Box::pin(async move {
                    if let HookInfo::User(ref mut info) = ctx.info {
                        info.username.push_str("-renamed");
                    }
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );

        let mut ctx = user_ctx();
        hooks.run("h", &mut ctx).await.unwrap();
        assert_eq!(ctx.user().unwrap().username, "ortuman-renamed");
    }

    #[tokio::test]
    async fn test_reentrant_run() {
        let hooks = Arc::new(Hooks::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("inner", recorder(&log, "inner", HookOutcome::Continue), 0);
        let weak = Arc::downgrade(&hooks);
        hooks.add(
            "outer",
            hook_fn(move |_ctx| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(hooks) = weak.upgrade() {
                        hooks.run("inner", &mut user_ctx()).await?;
                    }
                    Ok(HookOutcome::Continue)
                })
            }),
            0,
        );

        hooks.run("outer", &mut user_ctx()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["inner"]);
    }

    #[tokio::test]
    async fn test_weak_handler_is_noop_after_drop() {
        struct Counter(Mutex<u32>);
        let hooks = Hooks::new();
        let counter = Arc::new(Counter(Mutex::new(0)));
        hooks.add(
            "h",
            weak_hook_fn(&counter, |c, _ctx| {
                Box::pin(async move {
                    *c.0.lock().unwrap() += 1;
                    Ok(HookOutcome::Halt)
                })
            }),
            0,
        );

        assert!(hooks.run("h", &mut user_ctx()).await.unwrap());
        assert_eq!(*counter.0.lock().unwrap(), 1);

        drop(counter);
        assert!(!hooks.run("h", &mut user_ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts() {
        let hooks = Hooks::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add("h", recorder(&log, "x", HookOutcome::Continue), 0);
        let mut ctx = user_ctx();
        ctx.cancel.cancel();

        assert!(hooks.run("h", &mut ctx).await.is_err());
        assert!(log.lock().unwrap().is_empty());
    }
}
