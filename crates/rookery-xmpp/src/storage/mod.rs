//! Persistence for accounts, offline queues, rosters, archives and private
//! storage.
//!
//! [`Repository`] is the contract the core consumes. It is split into one
//! sub-trait per concern plus `in_transaction`, which runs a closure against
//! a transactional view of the repository and retries it while the backend
//! reports [`StorageError::Retryable`].

mod libsql;
mod memory;

pub use self::libsql::LibSqlRepository;
pub use self::memory::MemoryRepository;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::auth::{generate_salt, generate_scram_keys, SaslError, ScramHash, DEFAULT_ITERATIONS};
use crate::stanza::Stanza;
use crate::XmppError;

/// Attempts made by `in_transaction` before giving up on a retryable error.
pub const MAX_TRANSACTION_ATTEMPTS: usize = 5;

/// Repository failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend failure
    #[error("database error: {0}")]
    Database(String),
    /// A stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Transient conflict; the operation may be retried
    #[error("retryable storage error: {0}")]
    Retryable(String),
    /// The referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Retryable(_))
    }
}

// ============================================================================
// Models
// ============================================================================

/// SCRAM key material for one digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScramCredentials {
    /// Random salt
    pub salt: Vec<u8>,
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// `H(ClientKey)`
    pub stored_key: Vec<u8>,
    /// `HMAC(SaltedPassword, "Server Key")`
    pub server_key: Vec<u8>,
}

impl ScramCredentials {
    /// Derive fresh credentials for `password`.
    pub fn derive(hash: ScramHash, password: &str, iterations: u32) -> Result<Self, SaslError> {
        let salt = generate_salt();
        let (stored_key, server_key) = generate_scram_keys(hash, password, &salt, iterations)?;
        Ok(Self {
            salt,
            iterations,
            stored_key,
            server_key,
        })
    }
}

/// A local account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Account node
    pub username: String,
    /// Key material per digest
    pub credentials: BTreeMap<ScramHash, ScramCredentials>,
}

impl User {
    /// Account with credentials for every supported digest.
    pub fn with_password(username: &str, password: &str) -> Result<Self, XmppError> {
        Self::with_password_iterations(username, password, DEFAULT_ITERATIONS)
    }

    /// Like [`User::with_password`] with an explicit iteration count.
    pub fn with_password_iterations(
        username: &str,
        password: &str,
        iterations: u32,
    ) -> Result<Self, XmppError> {
        let mut credentials = BTreeMap::new();
        for hash in ScramHash::ALL {
            let derived = ScramCredentials::derive(hash, password, iterations)
                .map_err(|e| XmppError::internal(format!("credential derivation failed: {}", e)))?;
            credentials.insert(hash, derived);
        }
        Ok(Self {
            username: username.to_string(),
            credentials,
        })
    }

    /// Key material for `hash`.
    pub fn credentials(&self, hash: ScramHash) -> Option<&ScramCredentials> {
        self.credentials.get(&hash)
    }

    /// Check a plaintext password against the stored keys.
    pub fn verify_password(&self, password: &str) -> Result<bool, SaslError> {
        let Some((hash, creds)) = self
            .credentials
            .get_key_value(&ScramHash::Sha256)
            .or_else(|| self.credentials.iter().next())
        else {
            return Ok(false);
        };
        let (stored_key, _) = generate_scram_keys(*hash, password, &creds.salt, creds.iterations)?;
        Ok(stored_key == creds.stored_key)
    }
}

/// Subscription state of a roster item (RFC 6121 Section 2.1.2.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    /// No subscription in either direction
    #[default]
    None,
    /// The owner receives the contact's presence
    To,
    /// The contact receives the owner's presence
    From,
    /// Both directions
    Both,
    /// Item is being removed
    Remove,
}

impl Subscription {
    /// Attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }

    /// Parse an attribute value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Subscription::None),
            "to" => Some(Subscription::To),
            "from" => Some(Subscription::From),
            "both" => Some(Subscription::Both),
            "remove" => Some(Subscription::Remove),
            _ => None,
        }
    }

    /// The owner receives the contact's presence.
    pub fn has_to(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }

    /// The contact receives the owner's presence.
    pub fn has_from(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a user's roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterItem {
    /// Roster owner
    pub username: String,
    /// Contact bare JID
    pub jid: String,
    /// Display name
    pub name: String,
    /// Subscription state
    pub subscription: Subscription,
    /// Outbound subscription request pending
    pub ask: bool,
    /// Groups
    pub groups: Vec<String>,
}

impl RosterItem {
    /// Item with no subscription.
    pub fn new(username: &str, jid: &str) -> Self {
        Self {
            username: username.to_string(),
            jid: jid.to_string(),
            name: String::new(),
            subscription: Subscription::None,
            ask: false,
            groups: Vec::new(),
        }
    }
}

/// Subscription request waiting for the contact to answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterNotification {
    /// Local account the request is addressed to
    pub contact: String,
    /// Requester bare JID
    pub jid: String,
    /// The original `subscribe` presence
    pub presence: Stanza,
}

/// An archived message.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveMessage {
    /// Archive owner (account node)
    pub archive_id: String,
    /// Server-assigned stanza id, unique per archive
    pub id: String,
    /// Sender JID
    pub from: String,
    /// Recipient JID
    pub to: String,
    /// The message
    pub message: Stanza,
    /// Archival time
    pub stamp: DateTime<Utc>,
}

/// Archive query filters (XEP-0313 Section 4.1).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveFilters {
    /// Conversation partner (bare or full JID)
    pub with: Option<String>,
    /// Inclusive lower time bound
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper time bound
    pub end: Option<DateTime<Utc>>,
    /// Only messages archived before this id
    pub before_id: Option<String>,
    /// Only messages archived after this id
    pub after_id: Option<String>,
    /// Only these ids
    pub ids: Vec<String>,
}

impl ArchiveFilters {
    /// Apply the filters to `messages`, which must be in archive order.
    ///
    /// Fails with [`StorageError::NotFound`] when `before_id` or `after_id`
    /// name a message that is not in the archive.
    pub fn apply(&self, messages: Vec<ArchiveMessage>) -> Result<Vec<ArchiveMessage>, StorageError> {
        let position = |id: &str| {
            messages
                .iter()
                .position(|m| m.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("archive id {}", id)))
        };
        let lower = match self.after_id {
            Some(ref id) => position(id)? + 1,
            None => 0,
        };
        let upper = match self.before_id {
            Some(ref id) => position(id)?,
            None => messages.len(),
        };
        if lower >= upper {
            return Ok(Vec::new());
        }

        Ok(messages
            .into_iter()
            .skip(lower)
            .take(upper - lower)
            .filter(|m| self.matches(m))
            .collect())
    }

    fn matches(&self, message: &ArchiveMessage) -> bool {
        if let Some(ref with) = self.with {
            let matches_with = |addr: &str| {
                if with.contains('/') {
                    addr == with
                } else {
                    addr.split('/').next() == Some(with.as_str())
                }
            };
            if !matches_with(&message.from) && !matches_with(&message.to) {
                return false;
            }
        }
        if let Some(start) = self.start {
            if message.stamp < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if message.stamp > end {
                return false;
            }
        }
        self.ids.is_empty() || self.ids.iter().any(|id| *id == message.id)
    }
}

/// First and last entries of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMetadata {
    /// Oldest archived id
    pub start_id: String,
    /// Oldest archived stamp
    pub start_timestamp: DateTime<Utc>,
    /// Newest archived id
    pub end_id: String,
    /// Newest archived stamp
    pub end_timestamp: DateTime<Utc>,
}

// ============================================================================
// Repository contract
// ============================================================================

/// Account storage.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create or replace an account.
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError>;
    /// Fetch an account.
    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError>;
    /// Delete an account.
    async fn delete_user(&self, username: &str) -> Result<(), StorageError>;
    /// Whether the account exists.
    async fn user_exists(&self, username: &str) -> Result<bool, StorageError>;
}

/// Offline message queues.
#[async_trait]
pub trait OfflineRepository: Send + Sync {
    /// Append a message to `username`'s queue.
    async fn insert_offline_message(&self, username: &str, message: &Stanza) -> Result<(), StorageError>;
    /// Queue length.
    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError>;
    /// Queue contents in arrival order.
    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Stanza>, StorageError>;
    /// Drop the queue.
    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError>;
}

/// Rosters, pending subscription requests and roster versions.
#[async_trait]
pub trait RosterRepository: Send + Sync {
    /// Create or replace an item.
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<(), StorageError>;
    /// Remove an item.
    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<(), StorageError>;
    /// One item.
    async fn fetch_roster_item(&self, username: &str, jid: &str) -> Result<Option<RosterItem>, StorageError>;
    /// Every item of `username`, ordered by contact JID.
    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError>;
    /// Create or replace a pending subscription request.
    async fn upsert_roster_notification(&self, notification: &RosterNotification) -> Result<(), StorageError>;
    /// Remove a pending subscription request.
    async fn delete_roster_notification(&self, contact: &str, jid: &str) -> Result<(), StorageError>;
    /// One pending request.
    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError>;
    /// Every pending request addressed to `contact`.
    async fn fetch_roster_notifications(&self, contact: &str) -> Result<Vec<RosterNotification>, StorageError>;
    /// Bump and return the roster version.
    async fn touch_roster_version(&self, username: &str) -> Result<i64, StorageError>;
    /// Current roster version, 0 for a roster never written.
    async fn fetch_roster_version(&self, username: &str) -> Result<i64, StorageError>;
    /// Drop items, requests and version of `username`.
    async fn delete_roster(&self, username: &str) -> Result<(), StorageError>;
}

/// Message archives.
#[async_trait]
pub trait ArchiveRepository: Send + Sync {
    /// Archive a message; inserting an existing `(archive_id, id)` is a no-op.
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError>;
    /// Messages matching `filters`, oldest first.
    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
        filters: &ArchiveFilters,
    ) -> Result<Vec<ArchiveMessage>, StorageError>;
    /// First and last entries, `None` for an empty archive.
    async fn fetch_archive_metadata(&self, archive_id: &str) -> Result<Option<ArchiveMetadata>, StorageError>;
    /// Keep only the newest `max_elements` entries.
    async fn delete_archive_oldest_messages(&self, archive_id: &str, max_elements: usize) -> Result<(), StorageError>;
    /// Drop the whole archive.
    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError>;
}

/// Private XML storage (XEP-0049).
#[async_trait]
pub trait PrivateRepository: Send + Sync {
    /// Store `element` under its namespace.
    async fn upsert_private(&self, username: &str, namespace: &str, element: &minidom::Element) -> Result<(), StorageError>;
    /// Fetch the element stored under `namespace`.
    async fn fetch_private(&self, username: &str, namespace: &str) -> Result<Option<minidom::Element>, StorageError>;
    /// Drop everything stored by `username`.
    async fn delete_private(&self, username: &str) -> Result<(), StorageError>;
}

/// Named locks shared by every instance using the same store.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Wait until `name` is acquired.
    async fn lock(&self, name: &str) -> Result<(), StorageError>;
    /// Release `name`.
    async fn unlock(&self, name: &str) -> Result<(), StorageError>;
}

/// A transactional unit of work.
pub type TxFn =
    dyn for<'a> Fn(&'a dyn Repository) -> BoxFuture<'a, Result<(), StorageError>> + Send + Sync;

/// The full repository.
#[async_trait]
pub trait Repository:
    UserRepository
    + OfflineRepository
    + RosterRepository
    + ArchiveRepository
    + PrivateRepository
    + LockRepository
{
    /// Run `f` atomically. `f` may run more than once when the backend
    /// reports a retryable conflict.
    async fn in_transaction(&self, f: &TxFn) -> Result<(), StorageError>;
}

/// Run `f` while holding the named lock `name`; the lock is released on
/// every path.
pub async fn with_lock<T, F>(repository: &dyn Repository, name: &str, f: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>> + Send,
{
    repository.lock(name).await?;
    let result = f.await;
    if let Err(e) = repository.unlock(name).await {
        warn!(lock = name, error = %e, "Failed to release named lock");
    }
    result
}

/// Back-off between transaction attempts and lock polls.
pub(crate) fn retry_delay(attempt: usize) -> Duration {
    let factor = 1u64 << attempt.min(6);
    Duration::from_millis(10 * factor)
}

/// Serialize a stanza for storage.
pub(crate) fn encode_stanza(stanza: &Stanza) -> Result<String, StorageError> {
    crate::parser::element_to_string(stanza.element())
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Parse a stored stanza.
pub(crate) fn decode_stanza(raw: &str) -> Result<Stanza, StorageError> {
    let element: minidom::Element = raw
        .parse()
        .map_err(|e| StorageError::Serialization(format!("stored stanza: {}", e)))?;
    Stanza::from_element(element).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn archived(id: &str, from: &str, to: &str, minute: u32) -> ArchiveMessage {
        ArchiveMessage {
            archive_id: "ortuman".to_string(),
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            message: Stanza::message(Some("chat")),
            stamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, minute, 0).unwrap(),
        }
    }

    fn archive() -> Vec<ArchiveMessage> {
        vec![
            archived("a", "ortuman@localhost/yard", "noelia@localhost", 0),
            archived("b", "noelia@localhost/hall", "ortuman@localhost", 1),
            archived("c", "ortuman@localhost/yard", "juliet@capulet.lit", 2),
            archived("d", "juliet@capulet.lit/balcony", "ortuman@localhost", 3),
        ]
    }

    fn ids(messages: &[ArchiveMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn test_filters_by_with() {
        let filters = ArchiveFilters {
            with: Some("noelia@localhost".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&filters.apply(archive()).unwrap()), vec!["a", "b"]);

        let filters = ArchiveFilters {
            with: Some("juliet@capulet.lit/balcony".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&filters.apply(archive()).unwrap()), vec!["d"]);
    }

    #[test]
    fn test_filters_by_time_and_ids() {
        let filters = ArchiveFilters {
            start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 1, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 2, 0).unwrap()),
            ..Default::default()
        };
        assert_eq!(ids(&filters.apply(archive()).unwrap()), vec!["b", "c"]);

        let filters = ArchiveFilters {
            ids: vec!["d".to_string(), "a".to_string()],
            ..Default::default()
        };
        assert_eq!(ids(&filters.apply(archive()).unwrap()), vec!["a", "d"]);
    }

    #[test]
    fn test_filters_by_position() {
        let filters = ArchiveFilters {
            after_id: Some("a".to_string()),
            before_id: Some("d".to_string()),
            ..Default::default()
        };
        assert_eq!(ids(&filters.apply(archive()).unwrap()), vec!["b", "c"]);

        let filters = ArchiveFilters {
            after_id: Some("zzz".to_string()),
            ..Default::default()
        };
        assert!(matches!(filters.apply(archive()), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_user_password_verification() {
        let user = User::with_password_iterations("ortuman", "1234", 32).unwrap();
        assert_eq!(user.credentials.len(), ScramHash::ALL.len());
        assert!(user.verify_password("1234").unwrap());
        assert!(!user.verify_password("4321").unwrap());
    }

    #[test]
    fn test_subscription_predicates() {
        assert!(Subscription::Both.has_to() && Subscription::Both.has_from());
        assert!(Subscription::To.has_to() && !Subscription::To.has_from());
        assert_eq!(Subscription::parse("from"), Some(Subscription::From));
        assert_eq!(Subscription::parse("bogus"), None);
    }
}
