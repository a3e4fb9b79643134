//! Cloneable handle to a running C2S session.
//!
//! The session actor owns all protocol state; the handle only sees a
//! read-mostly view (identity, presence, info map, flags) and a command
//! channel into the actor.

use std::sync::{Arc, PoisonError, RwLock};

use jid::FullJid;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StreamError;
use crate::resource::{InfoMap, ResourceDesc, ResourceDirectory};
use crate::router::RouteError;
use crate::stanza::{full_jid, Stanza};
use crate::types::{SessionFlags, SessionState, StreamId};
use crate::XmppError;

/// Capacity of a session's command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Requests posted to a session actor.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// Write a stanza to the client
    Send(Stanza),
    /// Close the stream, optionally with an error
    Disconnect(Option<StreamError>),
}

#[derive(Debug, Clone)]
struct StreamView {
    username: String,
    domain: String,
    resource: String,
    presence: Option<Stanza>,
    info: InfoMap,
    state: SessionState,
}

struct StreamShared {
    id: StreamId,
    view: RwLock<StreamView>,
    flags: RwLock<SessionFlags>,
    commands: mpsc::Sender<StreamCommand>,
    done: CancellationToken,
    directory: Arc<ResourceDirectory>,
}

/// Handle to a local C2S stream.
#[derive(Clone)]
pub struct LocalStream {
    shared: Arc<StreamShared>,
}

impl LocalStream {
    pub(crate) fn new(
        id: StreamId,
        domain: &str,
        directory: Arc<ResourceDirectory>,
    ) -> (Self, mpsc::Receiver<StreamCommand>) {
        let (commands, receiver) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let stream = Self {
            shared: Arc::new(StreamShared {
                id,
                view: RwLock::new(StreamView {
                    username: String::new(),
                    domain: domain.to_string(),
                    resource: String::new(),
                    presence: None,
                    info: InfoMap::new(),
                    state: SessionState::Connecting,
                }),
                flags: RwLock::new(SessionFlags::default()),
                commands,
                done: CancellationToken::new(),
                directory,
            }),
        };
        (stream, receiver)
    }

    /// Stream identifier.
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Authenticated account node, empty before SASL succeeds.
    pub fn username(&self) -> String {
        self.read_view(|v| v.username.clone())
    }

    /// Serving domain.
    pub fn domain(&self) -> String {
        self.read_view(|v| v.domain.clone())
    }

    /// Bound resource, empty before bind.
    pub fn resource(&self) -> String {
        self.read_view(|v| v.resource.clone())
    }

    /// Full JID once a resource is bound.
    pub fn jid(&self) -> Option<FullJid> {
        self.read_view(|v| {
            if v.username.is_empty() || v.resource.is_empty() {
                return None;
            }
            full_jid(&v.username, &v.domain, &v.resource).ok()
        })
    }

    /// Last presence the client sent to itself.
    pub fn presence(&self) -> Option<Stanza> {
        self.read_view(|v| v.presence.clone())
    }

    /// Snapshot of the info map.
    pub fn info(&self) -> InfoMap {
        self.read_view(|v| v.info.clone())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.read_view(|v| v.state)
    }

    /// Snapshot of the negotiation flags.
    pub fn flags(&self) -> SessionFlags {
        *self.shared.flags.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Descriptor of the bound resource.
    pub fn resource_desc(&self) -> Option<ResourceDesc> {
        let jid = self.jid()?;
        let (presence, info) = self.read_view(|v| (v.presence.clone(), v.info.clone()));
        Some(ResourceDesc::new(
            self.shared.directory.instance_id(),
            jid,
            presence,
            info,
        ))
    }

    /// Queue a stanza for the client without waiting.
    pub fn send_element(&self, stanza: Stanza) -> Result<(), RouteError> {
        match self.shared.commands.try_send(StreamCommand::Send(stanza)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(stream_id = %self.id(), "Outbound queue full, dropping stanza");
                Err(RouteError::Internal("outbound queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(stream_id = %self.id(), "Stream already terminated");
                Err(RouteError::ResourceNotFound)
            }
        }
    }

    /// Close the stream and wait until it has terminated.
    pub async fn disconnect(&self, error: Option<StreamError>) {
        if self
            .shared
            .commands
            .send(StreamCommand::Disconnect(error))
            .await
            .is_err()
        {
            debug!(stream_id = %self.id(), "Disconnect posted to a finished stream");
        }
        self.done().await;
    }

    /// Resolves once the stream has terminated.
    pub async fn done(&self) {
        self.shared.done.cancelled().await
    }

    /// Whether the stream has terminated.
    pub fn is_done(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Write an info map entry and republish the descriptor when bound.
    pub async fn set_info_value(&self, key: &str, value: impl ToString) -> Result<(), XmppError> {
        let bound = {
            let mut view = self.shared.view.write().unwrap_or_else(PoisonError::into_inner);
            view.info.set(key, value);
            view.state == SessionState::Bound
        };
        if bound {
            self.republish().await?;
        }
        Ok(())
    }

    /// Publish the current descriptor to the resource directory.
    pub(crate) async fn republish(&self) -> Result<(), XmppError> {
        if let Some(desc) = self.resource_desc() {
            self.shared.directory.put(desc).await?;
        }
        Ok(())
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.shared
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .state = state;
    }

    pub(crate) fn set_username(&self, username: &str) {
        self.shared
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .username = username.to_string();
    }

    pub(crate) fn set_domain(&self, domain: &str) {
        self.shared
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .domain = domain.to_string();
    }

    pub(crate) fn set_resource(&self, resource: &str) {
        self.shared
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .resource = resource.to_string();
    }

    pub(crate) fn set_presence(&self, presence: Stanza) {
        self.shared
            .view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .presence = Some(presence);
    }

    /// Raise flags under the write lock.
    pub(crate) fn update_flags(&self, f: impl FnOnce(&mut SessionFlags)) {
        let mut flags = self.shared.flags.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut flags);
    }

    pub(crate) fn mark_done(&self) {
        self.shared.done.cancel();
    }

    fn read_view<R>(&self, f: impl FnOnce(&StreamView) -> R) -> R {
        let view = self.shared.view.read().unwrap_or_else(PoisonError::into_inner);
        f(&view)
    }
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.shared.id)
            .field("jid", &self.jid())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for LocalStream {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for LocalStream {}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for driving a `LocalStream` without a session actor.

    use super::*;

    /// A handle plus the receiving end of its command channel.
    pub(crate) struct DetachedStream {
        pub stream: LocalStream,
        pub commands: mpsc::Receiver<StreamCommand>,
    }

    impl DetachedStream {
        /// Bound-looking stream for `username/resource@localhost`.
        pub(crate) fn bound(
            directory: Arc<ResourceDirectory>,
            username: &str,
            resource: &str,
        ) -> Self {
            let (stream, commands) = LocalStream::new(StreamId::next(), "localhost", directory);
            stream.set_username(username);
            stream.set_resource(resource);
            stream.set_state(SessionState::Bound);
            stream.update_flags(|f| {
                f.set_authenticated();
                f.set_bound();
            });
            Self { stream, commands }
        }

        /// Stanzas queued so far.
        pub(crate) fn drain(&mut self) -> Vec<Stanza> {
            let mut out = Vec::new();
            while let Ok(cmd) = self.commands.try_recv() {
                if let StreamCommand::Send(stanza) = cmd {
                    out.push(stanza);
                }
            }
            out
        }

        /// Answer disconnects by terminating immediately.
        pub(crate) fn auto_terminate(mut self) -> (LocalStream, tokio::task::JoinHandle<Option<StreamError>>) {
            let stream = self.stream.clone();
            let handle = tokio::spawn(async move {
                while let Some(cmd) = self.commands.recv().await {
                    if let StreamCommand::Disconnect(err) = cmd {
                        self.stream.set_state(SessionState::Terminated);
                        self.stream.mark_done();
                        return err;
                    }
                }
                None
            });
            (stream, handle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::DetachedStream;
    use super::*;
    use crate::cluster::kv::{KvStore, MemoryKv};
    use crate::error::StreamErrorCondition;
    use crate::hook::Hooks;

    fn directory() -> Arc<ResourceDirectory> {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        ResourceDirectory::new("local", kv, Arc::new(Hooks::new()))
    }

    #[tokio::test]
    async fn test_jid_requires_user_and_resource() {
        let (stream, _rx) = LocalStream::new(StreamId::next(), "localhost", directory());
        assert!(stream.jid().is_none());
        stream.set_username("ortuman");
        assert!(stream.jid().is_none());
        stream.set_resource("yard");
        assert_eq!(stream.jid().unwrap().to_string(), "ortuman@localhost/yard");
    }

    #[tokio::test]
    async fn test_info_write_republishes_when_bound() {
        let dir = directory();
        let detached = DetachedStream::bound(dir.clone(), "ortuman", "yard");

        detached
            .stream
            .set_info_value("carbons:enabled", true)
            .await
            .unwrap();

        let desc = dir.get("ortuman", "yard").unwrap();
        assert!(desc.info().bool("carbons:enabled"));
    }

    #[tokio::test]
    async fn test_send_and_disconnect() {
        let mut detached = DetachedStream::bound(directory(), "ortuman", "yard");
        detached
            .stream
            .send_element(Stanza::message(Some("chat")))
            .unwrap();
        assert_eq!(detached.drain().len(), 1);

        let (stream, handle) = detached.auto_terminate();
        stream
            .disconnect(Some(StreamErrorCondition::SystemShutdown.into()))
            .await;

        assert!(stream.is_done());
        let err = handle.await.unwrap().unwrap();
        assert_eq!(err.condition, StreamErrorCondition::SystemShutdown);
        assert!(matches!(
            stream.send_element(Stanza::message(None)),
            Err(RouteError::ResourceNotFound)
        ));
    }
}
