//! Registry of the streams running on this instance.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::c2s::LocalStream;
use crate::error::{StreamError, StreamErrorCondition};
use crate::router::RouteError;
use crate::stanza::Stanza;
use crate::types::StreamId;
use crate::XmppError;

#[derive(Default)]
struct Tables {
    anonymous: HashMap<StreamId, LocalStream>,
    bound_by_user: HashMap<String, Vec<LocalStream>>,
}

/// Local streams, anonymous until bind and then grouped by account.
#[derive(Default)]
pub struct LocalRouter {
    tables: RwLock<Tables>,
}

impl LocalRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly accepted stream.
    #[instrument(skip(self, stream), fields(stream_id = %stream.id()))]
    pub fn register(&self, stream: LocalStream) -> Result<(), XmppError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.anonymous.contains_key(&stream.id()) {
            return Err(XmppError::internal(format!(
                "stream {} already registered",
                stream.id()
            )));
        }
        tables.anonymous.insert(stream.id(), stream);
        Ok(())
    }

    /// Move an anonymous stream into its account's bound list, replacing any
    /// stream already bound to the same resource.
    #[instrument(skip(self))]
    pub fn bind(&self, id: StreamId) -> Result<LocalStream, XmppError> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let stream = tables
            .anonymous
            .remove(&id)
            .ok_or_else(|| XmppError::internal(format!("stream {} not registered", id)))?;
        let username = stream.username();
        let resource = stream.resource();
        if username.is_empty() || resource.is_empty() {
            tables.anonymous.insert(id, stream);
            return Err(XmppError::internal(format!("stream {} has no bound JID", id)));
        }
        let list = tables.bound_by_user.entry(username).or_default();
        list.retain(|s| s.resource() != resource);
        list.push(stream.clone());
        debug!(resource = %resource, "Stream bound");
        Ok(stream)
    }

    /// Forget a stream wherever it lives.
    #[instrument(skip(self, stream), fields(stream_id = %stream.id()))]
    pub fn unregister(&self, stream: &LocalStream) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        if tables.anonymous.remove(&stream.id()).is_some() {
            return;
        }
        let username = stream.username();
        let now_empty = match tables.bound_by_user.get_mut(&username) {
            Some(list) => {
                list.retain(|s| s.id() != stream.id());
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            tables.bound_by_user.remove(&username);
        }
    }

    /// Queue `stanza` on the stream bound to `username/resource`.
    pub fn route(&self, stanza: Stanza, username: &str, resource: &str) -> Result<(), RouteError> {
        let targets: Vec<LocalStream> = {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            tables
                .bound_by_user
                .get(username)
                .map(|list| {
                    list.iter()
                        .filter(|s| s.resource() == resource)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        if targets.is_empty() {
            return Err(RouteError::ResourceNotFound);
        }
        for stream in targets {
            stream.send_element(stanza.clone())?;
        }
        Ok(())
    }

    /// Disconnect the stream bound to `username/resource` and wait for it to
    /// terminate.
    #[instrument(skip(self, error))]
    pub async fn disconnect(
        &self,
        username: &str,
        resource: &str,
        error: StreamError,
    ) -> Result<(), RouteError> {
        let stream = self
            .stream(username, resource)
            .ok_or(RouteError::ResourceNotFound)?;
        stream.disconnect(Some(error)).await;
        Ok(())
    }

    /// Stream bound to `username/resource`.
    pub fn stream(&self, username: &str, resource: &str) -> Option<LocalStream> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .bound_by_user
            .get(username)?
            .iter()
            .find(|s| s.resource() == resource)
            .cloned()
    }

    /// Every stream bound by `username`.
    pub fn streams(&self, username: &str) -> Vec<LocalStream> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables
            .bound_by_user
            .get(username)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of tracked streams (anonymous and bound).
    pub fn len(&self) -> usize {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.anonymous.len() + tables.bound_by_user.values().map(Vec::len).sum::<usize>()
    }

    /// Whether no stream is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every stream with `system-shutdown`, waiting at most
    /// `deadline` for them to terminate.
    pub async fn stop(&self, deadline: Duration) {
        let streams: Vec<LocalStream> = {
            let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
            tables
                .anonymous
                .values()
                .cloned()
                .chain(tables.bound_by_user.values().flatten().cloned())
                .collect()
        };
        if streams.is_empty() {
            return;
        }
        info!(count = streams.len(), "Disconnecting local streams");
        let shutdown = join_all(streams.iter().map(|s| {
            s.disconnect(Some(StreamError::new(StreamErrorCondition::SystemShutdown)))
        }));
        if tokio::time::timeout(deadline, shutdown).await.is_err() {
            warn!(?deadline, "Shutdown deadline reached with streams still open");
        }
    }
}

impl std::fmt::Debug for LocalRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRouter").field("streams", &self.len()).finish()
    }
}
