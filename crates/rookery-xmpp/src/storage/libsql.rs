//! libSQL-backed repository.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};
use minidom::Element;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    decode_stanza, encode_stanza, retry_delay, ArchiveFilters, ArchiveMessage, ArchiveMetadata,
    ArchiveRepository, LockRepository, OfflineRepository, PrivateRepository, Repository, RosterItem,
    RosterNotification, RosterRepository, ScramCredentials, StorageError, Subscription, TxFn, User,
    UserRepository, MAX_TRANSACTION_ATTEMPTS,
};
use crate::auth::ScramHash;
use crate::parser::element_to_string;
use crate::stanza::Stanza;

/// How long a named lock lease survives a crashed holder.
const LOCK_LEASE: Duration = Duration::from_secs(30);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    username TEXT PRIMARY KEY,
    credentials TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    message TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_offline_username ON offline_messages(username);

CREATE TABLE IF NOT EXISTS roster_items (
    username TEXT NOT NULL,
    jid TEXT NOT NULL,
    name TEXT NOT NULL,
    subscription TEXT NOT NULL,
    ask INTEGER NOT NULL,
    groups TEXT NOT NULL,
    PRIMARY KEY (username, jid)
);

CREATE TABLE IF NOT EXISTS roster_notifications (
    contact TEXT NOT NULL,
    jid TEXT NOT NULL,
    presence TEXT NOT NULL,
    PRIMARY KEY (contact, jid)
);

CREATE TABLE IF NOT EXISTS roster_versions (
    username TEXT PRIMARY KEY,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS archives (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    archive_id TEXT NOT NULL,
    id TEXT NOT NULL,
    from_jid TEXT NOT NULL,
    to_jid TEXT NOT NULL,
    message TEXT NOT NULL,
    stamp TEXT NOT NULL,
    UNIQUE (archive_id, id)
);

CREATE TABLE IF NOT EXISTS private_storage (
    username TEXT NOT NULL,
    namespace TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (username, namespace)
);

CREATE TABLE IF NOT EXISTS locks (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

impl From<libsql::Error> for StorageError {
    fn from(e: libsql::Error) -> Self {
        let message = e.to_string();
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("database is locked") || lowered.contains("busy") {
            StorageError::Retryable(message)
        } else {
            StorageError::Database(message)
        }
    }
}

/// Repository over a local libSQL database file.
///
/// Every call goes through one connection. A transaction holds that
/// connection for its whole duration, so concurrent callers queue behind it.
pub struct LibSqlRepository {
    _db: Arc<Database>,
    conn: Arc<Mutex<Connection>>,
    owner: String,
    in_tx: bool,
}

impl LibSqlRepository {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Builder::new_local(path.as_ref()).build().await?;
        Self::from_database(db).await
    }

    /// Private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_database(db).await
    }

    async fn from_database(db: Database) -> Result<Self, StorageError> {
        let conn = db.connect()?;
        conn.execute_batch(SCHEMA).await?;
        debug!("Storage schema ready");
        Ok(Self {
            _db: Arc::new(db),
            conn: Arc::new(Mutex::new(conn)),
            owner: Uuid::new_v4().to_string(),
            in_tx: false,
        })
    }

    async fn execute(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64, StorageError> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(sql, params).await?)
    }

    async fn query_strings(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        columns: i32,
    ) -> Result<Vec<Vec<String>>, StorageError> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(sql, params).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let mut values = Vec::with_capacity(columns as usize);
            for idx in 0..columns {
                values.push(row.get::<String>(idx)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    async fn query_i64(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<i64>, StorageError> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for LibSqlRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibSqlRepository")
            .field("owner", &self.owner)
            .field("in_tx", &self.in_tx)
            .finish()
    }
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("stamp '{}': {}", raw, e)))
}

fn roster_item_from_row(username: &str, row: Vec<String>) -> Result<RosterItem, StorageError> {
    let [jid, name, subscription, ask, groups]: [String; 5] = row
        .try_into()
        .map_err(|_| StorageError::Serialization("roster row shape".into()))?;
    Ok(RosterItem {
        username: username.to_string(),
        jid,
        name,
        subscription: Subscription::parse(&subscription)
            .ok_or_else(|| StorageError::Serialization(format!("subscription '{}'", subscription)))?,
        ask: ask == "1",
        groups: serde_json::from_str(&groups).map_err(|e| StorageError::Serialization(e.to_string()))?,
    })
}

fn archive_message_from_row(archive_id: &str, row: Vec<String>) -> Result<ArchiveMessage, StorageError> {
    let [id, from, to, message, stamp]: [String; 5] = row
        .try_into()
        .map_err(|_| StorageError::Serialization("archive row shape".into()))?;
    Ok(ArchiveMessage {
        archive_id: archive_id.to_string(),
        id,
        from,
        to,
        message: decode_stanza(&message)?,
        stamp: parse_stamp(&stamp)?,
    })
}

#[async_trait]
impl UserRepository for LibSqlRepository {
    #[instrument(skip(self, user), fields(username = %user.username))]
    async fn upsert_user(&self, user: &User) -> Result<(), StorageError> {
        let credentials =
            serde_json::to_string(&user.credentials).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.execute(
            "INSERT INTO users (username, credentials) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE SET credentials = excluded.credentials",
            libsql::params![user.username.clone(), credentials],
        )
        .await?;
        Ok(())
    }

    async fn fetch_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let rows = self
            .query_strings(
                "SELECT credentials FROM users WHERE username = ?1",
                libsql::params![username.to_string()],
                1,
            )
            .await?;
        let Some(raw) = rows.into_iter().next().and_then(|r| r.into_iter().next()) else {
            return Ok(None);
        };
        let credentials: std::collections::BTreeMap<ScramHash, ScramCredentials> =
            serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(User {
            username: username.to_string(),
            credentials,
        }))
    }

    async fn delete_user(&self, username: &str) -> Result<(), StorageError> {
        self.execute("DELETE FROM users WHERE username = ?1", libsql::params![username.to_string()])
            .await?;
        Ok(())
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StorageError> {
        let count = self
            .query_i64("SELECT COUNT(*) FROM users WHERE username = ?1", libsql::params![username.to_string()])
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }
}

#[async_trait]
impl OfflineRepository for LibSqlRepository {
    async fn insert_offline_message(&self, username: &str, message: &Stanza) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO offline_messages (username, message) VALUES (?1, ?2)",
            libsql::params![username.to_string(), encode_stanza(message)?],
        )
        .await?;
        Ok(())
    }

    async fn count_offline_messages(&self, username: &str) -> Result<usize, StorageError> {
        let count = self
            .query_i64(
                "SELECT COUNT(*) FROM offline_messages WHERE username = ?1",
                libsql::params![username.to_string()],
            )
            .await?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    async fn fetch_offline_messages(&self, username: &str) -> Result<Vec<Stanza>, StorageError> {
        self.query_strings(
            "SELECT message FROM offline_messages WHERE username = ?1 ORDER BY seq",
            libsql::params![username.to_string()],
            1,
        )
        .await?
        .iter()
        .map(|row| decode_stanza(&row[0]))
        .collect()
    }

    async fn delete_offline_messages(&self, username: &str) -> Result<(), StorageError> {
        self.execute(
            "DELETE FROM offline_messages WHERE username = ?1",
            libsql::params![username.to_string()],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RosterRepository for LibSqlRepository {
    #[instrument(skip(self, item), fields(username = %item.username, jid = %item.jid))]
    async fn upsert_roster_item(&self, item: &RosterItem) -> Result<(), StorageError> {
        let groups = serde_json::to_string(&item.groups).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.execute(
            "INSERT INTO roster_items (username, jid, name, subscription, ask, groups)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(username, jid) DO UPDATE SET
                name = excluded.name,
                subscription = excluded.subscription,
                ask = excluded.ask,
                groups = excluded.groups",
            libsql::params![
                item.username.clone(),
                item.jid.clone(),
                item.name.clone(),
                item.subscription.as_str(),
                if item.ask { 1i64 } else { 0i64 },
                groups,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_roster_item(&self, username: &str, jid: &str) -> Result<(), StorageError> {
        self.execute(
            "DELETE FROM roster_items WHERE username = ?1 AND jid = ?2",
            libsql::params![username.to_string(), jid.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn fetch_roster_item(&self, username: &str, jid: &str) -> Result<Option<RosterItem>, StorageError> {
        let rows = self
            .query_strings(
                "SELECT jid, name, subscription, CAST(ask AS TEXT), groups
                 FROM roster_items WHERE username = ?1 AND jid = ?2",
                libsql::params![username.to_string(), jid.to_string()],
                5,
            )
            .await?;
        rows.into_iter()
            .next()
            .map(|row| roster_item_from_row(username, row))
            .transpose()
    }

    async fn fetch_roster_items(&self, username: &str) -> Result<Vec<RosterItem>, StorageError> {
        self.query_strings(
            "SELECT jid, name, subscription, CAST(ask AS TEXT), groups
             FROM roster_items WHERE username = ?1 ORDER BY jid",
            libsql::params![username.to_string()],
            5,
        )
        .await?
        .into_iter()
        .map(|row| roster_item_from_row(username, row))
        .collect()
    }

    async fn upsert_roster_notification(&self, notification: &RosterNotification) -> Result<(), StorageError> {
        self.execute(
            "INSERT INTO roster_notifications (contact, jid, presence) VALUES (?1, ?2, ?3)
             ON CONFLICT(contact, jid) DO UPDATE SET presence = excluded.presence",
            libsql::params![
                notification.contact.clone(),
                notification.jid.clone(),
                encode_stanza(&notification.presence)?,
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_roster_notification(&self, contact: &str, jid: &str) -> Result<(), StorageError> {
        self.execute(
            "DELETE FROM roster_notifications WHERE contact = ?1 AND jid = ?2",
            libsql::params![contact.to_string(), jid.to_string()],
        )
        .await?;
        Ok(())
    }

    async fn fetch_roster_notification(
        &self,
        contact: &str,
        jid: &str,
    ) -> Result<Option<RosterNotification>, StorageError> {
        let rows = self
            .query_strings(
                "SELECT presence FROM roster_notifications WHERE contact = ?1 AND jid = ?2",
                libsql::params![contact.to_string(), jid.to_string()],
                1,
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(RosterNotification {
                contact: contact.to_string(),
                jid: jid.to_string(),
                presence: decode_stanza(&row[0])?,
            })),
            None => Ok(None),
        }
    }

    async fn fetch_roster_notifications(&self, contact: &str) -> Result<Vec<RosterNotification>, StorageError> {
        self.query_strings(
            "SELECT jid, presence FROM roster_notifications WHERE contact = ?1 ORDER BY jid",
            libsql::params![contact.to_string()],
            2,
        )
        .await?
        .into_iter()
        .map(|row| {
            Ok(RosterNotification {
                contact: contact.to_string(),
                jid: row[0].clone(),
                presence: decode_stanza(&row[1])?,
            })
        })
        .collect()
    }

    async fn touch_roster_version(&self, username: &str) -> Result<i64, StorageError> {
        self.execute(
            "INSERT INTO roster_versions (username, version) VALUES (?1, 1)
             ON CONFLICT(username) DO UPDATE SET version = version + 1",
            libsql::params![username.to_string()],
        )
        .await?;
        self.fetch_roster_version(username).await
    }

    async fn fetch_roster_version(&self, username: &str) -> Result<i64, StorageError> {
        let version = self
            .query_i64(
                "SELECT version FROM roster_versions WHERE username = ?1",
                libsql::params![username.to_string()],
            )
            .await?;
        Ok(version.unwrap_or(0))
    }

    async fn delete_roster(&self, username: &str) -> Result<(), StorageError> {
        for sql in [
            "DELETE FROM roster_items WHERE username = ?1",
            "DELETE FROM roster_notifications WHERE contact = ?1",
            "DELETE FROM roster_versions WHERE username = ?1",
        ] {
            self.execute(sql, libsql::params![username.to_string()]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveRepository for LibSqlRepository {
    #[instrument(skip(self, message), fields(archive_id = %message.archive_id, id = %message.id))]
    async fn insert_archive_message(&self, message: &ArchiveMessage) -> Result<(), StorageError> {
        self.execute(
            "INSERT OR IGNORE INTO archives (archive_id, id, from_jid, to_jid, message, stamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            libsql::params![
                message.archive_id.clone(),
                message.id.clone(),
                message.from.clone(),
                message.to.clone(),
                encode_stanza(&message.message)?,
                message.stamp.to_rfc3339(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn fetch_archive_messages(
        &self,
        archive_id: &str,
        filters: &ArchiveFilters,
    ) -> Result<Vec<ArchiveMessage>, StorageError> {
        let messages = self
            .query_strings(
                "SELECT id, from_jid, to_jid, message, stamp FROM archives WHERE archive_id = ?1 ORDER BY seq",
                libsql::params![archive_id.to_string()],
                5,
            )
            .await?
            .into_iter()
            .map(|row| archive_message_from_row(archive_id, row))
            .collect::<Result<Vec<_>, _>>()?;
        filters.apply(messages)
    }

    async fn fetch_archive_metadata(&self, archive_id: &str) -> Result<Option<ArchiveMetadata>, StorageError> {
        let mut bounds = Vec::with_capacity(2);
        for order in ["ASC", "DESC"] {
            let sql = format!(
                "SELECT id, stamp FROM archives WHERE archive_id = ?1 ORDER BY seq {} LIMIT 1",
                order
            );
            let rows = self
                .query_strings(&sql, libsql::params![archive_id.to_string()], 2)
                .await?;
            match rows.into_iter().next() {
                Some(row) => bounds.push((row[0].clone(), parse_stamp(&row[1])?)),
                None => return Ok(None),
            }
        }
        let (end_id, end_timestamp) = bounds.pop().ok_or_else(|| StorageError::NotFound(archive_id.into()))?;
        let (start_id, start_timestamp) = bounds.pop().ok_or_else(|| StorageError::NotFound(archive_id.into()))?;
        Ok(Some(ArchiveMetadata {
            start_id,
            start_timestamp,
            end_id,
            end_timestamp,
        }))
    }

    async fn delete_archive_oldest_messages(&self, archive_id: &str, max_elements: usize) -> Result<(), StorageError> {
        let removed = self
            .execute(
                "DELETE FROM archives WHERE archive_id = ?1 AND seq NOT IN (
                    SELECT seq FROM archives WHERE archive_id = ?1 ORDER BY seq DESC LIMIT ?2
                 )",
                libsql::params![archive_id.to_string(), max_elements as i64],
            )
            .await?;
        if removed > 0 {
            debug!(archive_id, removed, "Trimmed archive");
        }
        Ok(())
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<(), StorageError> {
        self.execute("DELETE FROM archives WHERE archive_id = ?1", libsql::params![archive_id.to_string()])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PrivateRepository for LibSqlRepository {
    async fn upsert_private(&self, username: &str, namespace: &str, element: &Element) -> Result<(), StorageError> {
        let data = element_to_string(element).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.execute(
            "INSERT INTO private_storage (username, namespace, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(username, namespace) DO UPDATE SET data = excluded.data",
            libsql::params![username.to_string(), namespace.to_string(), data],
        )
        .await?;
        Ok(())
    }

    async fn fetch_private(&self, username: &str, namespace: &str) -> Result<Option<Element>, StorageError> {
        let rows = self
            .query_strings(
                "SELECT data FROM private_storage WHERE username = ?1 AND namespace = ?2",
                libsql::params![username.to_string(), namespace.to_string()],
                1,
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => row[0]
                .parse::<Element>()
                .map(Some)
                .map_err(|e| StorageError::Serialization(format!("private element: {}", e))),
            None => Ok(None),
        }
    }

    async fn delete_private(&self, username: &str) -> Result<(), StorageError> {
        self.execute(
            "DELETE FROM private_storage WHERE username = ?1",
            libsql::params![username.to_string()],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockRepository for LibSqlRepository {
    #[instrument(skip(self))]
    async fn lock(&self, name: &str) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            let now = Utc::now().timestamp_millis();
            self.execute("DELETE FROM locks WHERE expires_at < ?1", libsql::params![now])
                .await?;
            let acquired = self
                .execute(
                    "INSERT OR IGNORE INTO locks (name, owner, expires_at) VALUES (?1, ?2, ?3)",
                    libsql::params![
                        name.to_string(),
                        self.owner.clone(),
                        now + LOCK_LEASE.as_millis() as i64
                    ],
                )
                .await?;
            if acquired == 1 {
                return Ok(());
            }
            attempt += 1;
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }

    async fn unlock(&self, name: &str) -> Result<(), StorageError> {
        let released = self
            .execute(
                "DELETE FROM locks WHERE name = ?1 AND owner = ?2",
                libsql::params![name.to_string(), self.owner.clone()],
            )
            .await?;
        if released == 0 {
            return Err(StorageError::NotFound(format!("lock {} is not held", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for LibSqlRepository {
    async fn in_transaction(&self, f: &TxFn) -> Result<(), StorageError> {
        if self.in_tx {
            return f(self).await;
        }
        let conn = self.conn.lock().await;
        let view = LibSqlRepository {
            _db: self._db.clone(),
            conn: Arc::new(Mutex::new(conn.clone())),
            owner: self.owner.clone(),
            in_tx: true,
        };

        let mut attempt = 0;
        loop {
            let result = match conn.execute("BEGIN IMMEDIATE", ()).await {
                Ok(_) => match f(&view).await {
                    Ok(()) => match conn.execute("COMMIT", ()).await {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            if let Err(rb) = conn.execute("ROLLBACK", ()).await {
                                warn!(error = %rb, "Rollback after failed commit failed");
                            }
                            Err(StorageError::from(e))
                        }
                    },
                    Err(e) => {
                        if let Err(rb) = conn.execute("ROLLBACK", ()).await {
                            warn!(error = %rb, "Rollback failed");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(StorageError::from(e)),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_TRANSACTION_ATTEMPTS => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Retrying transaction");
                    tokio::time::sleep(retry_delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
