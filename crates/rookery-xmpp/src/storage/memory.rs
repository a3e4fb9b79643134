//! In-process repository.
//!
//! Transactions are serialized against each other and roll back by
//! restoring a snapshot of the whole state. Named locks are owned tokio
//! mutex guards kept until `unlock`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use minidom::Element;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use super::{
    retry_delay, ArchiveFilters, ArchiveMessage, ArchiveMetadata, ArchiveRepository, LockRepository,
    OfflineRepository, PrivateRepository, Repository, RosterItem, RosterNotification, RosterRepository,
    StorageError, TxFn, User, UserRepository, MAX_TRANSACTION_ATTEMPTS,
};
use crate::stanza::Stanza;

#[derive(Debug, Clone, Default)]
struct State {
    users: HashMap<String, User>,
    offline: HashMap<String, Vec<Stanza>>,
    roster_items: HashMap<String, BTreeMap<String, RosterItem>>,
    roster_notifications: HashMap<String, BTreeMap<String, RosterNotification>>,
    roster_versions: HashMap<String, i64>,
    archives: HashMap<String, Vec<ArchiveMessage>>,
    private: HashMap<String, BTreeMap<String, Element>>,
}

#[derive(Default)]
struct Inner {
    state: RwLock<State>,
    tx: tokio::sync::Mutex<()>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<String, OwnedMutexGuard<()>>>,
}

/// Repository keeping everything in memory.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Inner>,
    in_tx: bool,
}

impl MemoryRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.inner.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.inner.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn restore(&self, snapshot: State) {
        self.write(|state| *state = snapshot);
    }
}

impl std::fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRepository").field("in_tx", &self.in_tx).finish()
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        self.write(|s| s.users.insert(user.username.clone(), user.clone()));
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        Ok(self.read(|s| s.users.get(username).cloned()))
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.write(|s| s.users.remove(username));
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        Ok(self.read(|s| s.users.contains_key(username)))
    }
}

#[async_trait]
impl OfflineRepository for MemoryRepository {
    async fn insert_offline_message(&self, username: &str, message: &Stanza) -> Result<(), StorageError> {
        self.write(|s| {
            s.offline
                .entry(username.to_string())
                .or_default()
                .push(message.clone())
        });
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        Ok(self.read(|s| s.offline.get(username).map_or(0, Vec::len)))
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Stanza>, StorageError> {
        Ok(self.read(|s| s.offline.get(username).cloned().unwrap_or_default()))
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.write(|s| s.offline.remove(username));
        Ok(())
    }
}

#[async_trait]
impl RosterRepository for MemoryRepository {
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<(), StorageError> {
        self.write(|s| {
            s.roster_items
                .entry(item.username.clone())
                .or_default()
                .insert(item.jid.clone(), item.clone())
        });
        Ok(())
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<(), StorageError> {
        self.write(|s| {
            if let Some(items) = s.roster_items.get_mut(username) {
                items.remove(jid);
            }
        });
        Ok(())
    }

    async fn fetch_roster_item(&self, username: &str, jid: &str) -> Result<Option<RosterItem>, StorageError> {
        Ok(self.read(|s| s.roster_items.get(username).and_then(|items| items.get(jid)).cloned()))
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        Ok(self.read(|s| {
            s.roster_items
                .get(username)
                .map(|items| items.values().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn upsert_roster_notification(&self, notification: &RosterNotification) -> Result<(), StorageError> {
        self.write(|s| {
            s.roster_notifications
                .entry(notification.contact.clone())
                .or_default()
                .insert(notification.jid.clone(), notification.clone())
        });
        Ok(())
    }

    async fn delete_roster_notification(&self, contact: &str, jid: &str) -> Result<(), StorageError> {
        self.write(|s| {
            if let Some(pending) = s.roster_notifications.get_mut(contact) {
                pending.remove(jid);
            }
        });
        Ok(())
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError> {
        Ok(self.read(|s| {
            s.roster_notifications
                .get(contact)
                .and_then(|pending| pending.get(jid))
                .cloned()
        }))
    }

    async fn fetch_roster_notifications(&self, contact: &str) -> Result<Vec<RosterNotification>, StorageError> {
        Ok(self.read(|s| {
            s.roster_notifications
                .get(contact)
                .map(|pending| pending.values().cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn touch_roster_version(&self, username: &str) -> Result<i64, StorageError> {
        Ok(self.write(|s| {
            let version = s.roster_versions.entry(username.to_string()).or_insert(0);
            *version += 1;
            *version
        }))
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<i64, StorageError> {
        Ok(self.read(|s| s.roster_versions.get(username).copied().unwrap_or(0)))
    }

    async fn delete_roster(&self, username: &str) -> Result<(), StorageError> {
        self.write(|s| {
            s.roster_items.remove(username);
            s.roster_notifications.remove(username);
            s.roster_versions.remove(username);
        });
        Ok(())
    }
}

#[async_trait]
impl ArchiveRepository for MemoryRepository {
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError> {
        self.write(|s| {
            let archive = s.archives.entry(message.archive_id.clone()).or_default();
            if !archive.iter().any(|m| m.id == message.id) {
                archive.push(message.clone());
            }
        });
        Ok(())
    }

    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
        filters: &ArchiveFilters,
    ) -> Result<Vec<ArchiveMessage>, StorageError> {
        let messages = self.read(|s| s.archives.get(archive_id).cloned().unwrap_or_default());
        filters.apply(messages)
    }

    async fn fetch_archive_metadata(&self, archive_id: &str) -> Result<Option<ArchiveMetadata>, StorageError> {
        Ok(self.read(|s| {
            let archive = s.archives.get(archive_id)?;
            let first = archive.first()?;
            let last = archive.last()?;
            Some(ArchiveMetadata {
                start_id: first.id.clone(),
                start_timestamp: first.stamp,
                end_id: last.id.clone(),
                end_timestamp: last.stamp,
            })
        }))
    }

    async fn delete_archive_oldest_messages(&self, archive_id: &str, max_elements: usize) -> Result<(), StorageError> {
        self.write(|s| {
            if let Some(archive) = s.archives.get_mut(archive_id) {
                let excess = archive.len().saturating_sub(max_elements);
                archive.drain(..excess);
            }
        });
        Ok(())
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError> {
        self.write(|s| s.archives.remove(archive_id));
        Ok(())
    }
}

#[async_trait]
impl PrivateRepository for MemoryRepository {
    async fn upsert_private(&self, username: &str, namespace: &str, element: &Element) -> Result<(), StorageError> {
        self.write(|s| {
            s.private
                .entry(username.to_string())
                .or_default()
                .insert(namespace.to_string(), element.clone())
        });
        Ok(())
    }

    async fn fetch_private(&self, username: &str, namespace: &str) -> Result<Option<Element>, StorageError> {
        Ok(self.read(|s| s.private.get(username).and_then(|m| m.get(namespace)).cloned()))
    }

    async fn delete_private(&self, username: &str) -> Result<(), StorageError> {
        self.write(|s| s.private.remove(username));
        Ok(())
    }
}

#[async_trait]
impl LockRepository for MemoryRepository {
    async fn lock(&self, name: &str) -> Result<(), StorageError> {
        let mutex = {
            let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(name.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        self.inner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), guard);
        Ok(())
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        let guard = self
            .inner
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match guard {
            Some(guard) => {
                drop(guard);
                Ok(())
            }
            None => Err(StorageError::NotFound(format!("lock {} is not held", name))),
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn in_transaction(&self, f: &TxFn) -> Result<(), StorageError> {
        if self.in_tx {
            return f(self).await;
        }
        let _serialized = self.inner.tx.lock().await;
        let view = MemoryRepository {
            inner: self.inner.clone(),
            in_tx: true,
        };

        let mut attempt = 0;
        loop {
            let snapshot = self.read(State::clone);
            match f(&view).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.restore(snapshot);
                    attempt += 1;
                    if !e.is_retryable() || attempt >= MAX_TRANSACTION_ATTEMPTS {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "Retrying transaction");
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let held = self.held.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !held.is_empty() {
            warn!(count = held.len(), "Memory repository dropped with named locks held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{with_lock, Subscription};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn chat(body: &str) -> Stanza {
        Stanza::message(Some("chat")).with_child(
            Element::builder("body", crate::parser::ns::JABBER_CLIENT)
                .append(body.to_string())
                .build(),
        )
    }

    fn archived(id: &str) -> ArchiveMessage {
        ArchiveMessage {
            archive_id: "ortuman".to_string(),
            id: id.to_string(),
            from: "noelia@localhost/hall".to_string(),
            to: "ortuman@localhost".to_string(),
            message: chat(id),
            stamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let repo = MemoryRepository::new();
        let user = User::with_password_iterations("ortuman", "1234", 16).unwrap();
        repo.upsert_user(&user).await.unwrap();

        assert!(repo.user_exists("ortuman").await.unwrap());
        assert_eq!(repo.fetch_user("ortuman").await.unwrap(), Some(user));
        repo.delete_user("ortuman").await.unwrap();
        assert!(!repo.user_exists("ortuman").await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_queue() {
        let repo = MemoryRepository::new();
        repo.insert_offline_message("ortuman", &chat("one")).await.unwrap();
        repo.insert_offline_message("ortuman", &chat("two")).await.unwrap();

        assert_eq!(repo.count_offline_messages("ortuman").await.unwrap(), 2);
        let queued = repo.fetch_offline_messages("ortuman").await.unwrap();
        assert_eq!(queued[0].body(), Some("one".to_string()));
        repo.delete_offline_messages("ortuman").await.unwrap();
        assert_eq!(repo.count_offline_messages("ortuman").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_roster_versions_and_items() {
        let repo = MemoryRepository::new();
        assert_eq!(repo.fetch_roster_version("ortuman").await.unwrap(), 0);

        let mut item = RosterItem::new("ortuman", "noelia@localhost");
        item.subscription = Subscription::Both;
        repo.upsert_roster_item(&item).await.unwrap();
        assert_eq!(repo.touch_roster_version("ortuman").await.unwrap(), 1);
        assert_eq!(repo.touch_roster_version("ortuman").await.unwrap(), 2);

        let fetched = repo.fetch_roster_item("ortuman", "noelia@localhost").await.unwrap();
        assert_eq!(fetched, Some(item));

        repo.delete_roster("ortuman").await.unwrap();
        assert!(repo.fetch_roster_items("ortuman").await.unwrap().is_empty());
        assert_eq!(repo.fetch_roster_version("ortuman").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_archive_insert_is_idempotent_and_trims() {
        let repo = MemoryRepository::new();
        for id in ["a", "b", "a", "c"] {
            repo.insert_archive_message(&archived(id)).await.unwrap();
        }
        let all = repo.fetch_archive_messages("ortuman", &ArchiveFilters::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        repo.delete_archive_oldest_messages("ortuman", 2).await.unwrap();
        let meta = repo.fetch_archive_metadata("ortuman").await.unwrap().unwrap();
        assert_eq!(meta.start_id, "b");
        assert_eq!(meta.end_id, "c");
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let repo = MemoryRepository::new();
        let result = repo
            .in_transaction(&|tx| {
                Box::pin(async move {
                    tx.insert_offline_message("ortuman", &chat("lost")).await?;
                    Err(StorageError::Database("boom".into()))
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(repo.count_offline_messages("ortuman").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transaction_retries_retryable_errors() {
        let repo = MemoryRepository::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        repo.in_transaction(&move |tx| {
            let counter = counter.clone();
            Box::pin(async move {
                tx.insert_offline_message("ortuman", &chat("kept")).await?;
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(StorageError::Retryable("busy".into()));
                }
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(repo.count_offline_messages("ortuman").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_named_lock_serializes() {
        let repo = MemoryRepository::new();
        repo.lock("offline:ortuman").await.unwrap();

        let contender = repo.clone();
        let waiter = tokio::spawn(async move {
            with_lock(&contender, "offline:ortuman", async { Ok(()) }).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        repo.unlock("offline:ortuman").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert!(repo.unlock("offline:ortuman").await.is_err());
    }
}
