//! Cluster key-value store contract and an in-process implementation.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// KV failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    /// The store could not be reached
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    /// A watcher fell behind and missed events
    #[error("kv watcher lagged by {0} events")]
    Lagged(u64),
    /// The watch stream ended
    #[error("kv watch closed")]
    Closed,
}

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventType {
    /// Key written
    Put,
    /// Key removed
    Delete,
}

/// A change observed through `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    /// Put or delete
    pub kind: KvEventType,
    /// Affected key
    pub key: String,
    /// New value (puts only)
    pub value: Option<Vec<u8>>,
    /// Previous value, when requested and present
    pub prev_value: Option<Vec<u8>>,
}

/// Stream of watch events.
pub type KvWatchStream = BoxStream<'static, Result<KvEvent, KvError>>;

/// Cluster coordination store.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Write `value` under `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError>;

    /// Read `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Read every pair whose key starts with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError>;

    /// Remove `key`.
    async fn del(&self, key: &str) -> Result<(), KvError>;

    /// Subscribe to changes under `prefix`. Events written after this call
    /// returns are guaranteed to be observed.
    async fn watch(&self, prefix: &str, with_prev: bool) -> Result<KvWatchStream, KvError>;

    /// Fires when the store's lifecycle keepalive is lost.
    fn session_lost(&self) -> CancellationToken;
}

const WATCH_CHANNEL_CAPACITY: usize = 1024;

struct MemoryKvInner {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    events: broadcast::Sender<KvEvent>,
    session: CancellationToken,
}

/// In-process store. Clones share state, so several resource directories
/// built on clones of one `MemoryKv` behave as a cluster.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<MemoryKvInner>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_capacity(WATCH_CHANNEL_CAPACITY)
    }

    /// Create an empty store whose watchers buffer `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(MemoryKvInner {
                data: RwLock::new(BTreeMap::new()),
                events,
                session: CancellationToken::new(),
            }),
        }
    }

    /// Simulate loss of the keepalive session.
    pub fn lose_session(&self) {
        self.inner.session.cancel();
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.inner
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKv").field("keys", &self.len()).finish()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), KvError> {
        let mut data = self.inner.data.write().unwrap_or_else(PoisonError::into_inner);
        let prev_value = data.insert(key.to_string(), value.clone());
        // Sent under the write lock so watchers observe writes in order.
        let _ = self.inner.events.send(KvEvent {
            kind: KvEventType::Put,
            key: key.to_string(),
            value: Some(value),
            prev_value,
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let data = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KvError> {
        let data = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut data = self.inner.data.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev_value) = data.remove(key) {
            let _ = self.inner.events.send(KvEvent {
                kind: KvEventType::Delete,
                key: key.to_string(),
                value: None,
                prev_value: Some(prev_value),
            });
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str, with_prev: bool) -> Result<KvWatchStream, KvError> {
        let receiver = self.inner.events.subscribe();
        let prefix = prefix.to_string();
        let events = stream::unfold(receiver, move |mut receiver| {
            let prefix = prefix.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(mut event) => {
                            if !event.key.starts_with(&prefix) {
                                continue;
                            }
                            if !with_prev {
                                event.prev_value = None;
                            }
                            return Some((Ok(event), receiver));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            return Some((Err(KvError::Lagged(n)), receiver));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }

    fn session_lost(&self) -> CancellationToken {
        self.inner.session.clone()
    }
}
