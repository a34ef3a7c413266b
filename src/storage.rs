//! SQLite storage layer for petlink.
//!
//! Holds the social state of the device: friends, friend requests, message
//! history and the outbound retry queue. Handles schema creation and keeps
//! the invariants the rest of the crate relies on:
//!
//! - message status only advances (pending -> delivered -> read, or
//!   pending -> failed); a transition that would move backwards is a no-op
//!   returning `false`;
//! - an outbound_queue row exists exactly while its message is undelivered
//!   and is removed in the same transaction as the status transition;
//! - accepting a friend request and inserting the friend row happen in one
//!   transaction, and re-accepting is idempotent.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::ONLINE_WINDOW_SECS;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    NotFound(String),
    AlreadyExists(String),
    Constraint(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
            StorageError::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            StorageError::Constraint(msg) => write!(f, "constraint violated: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Lifecycle of a friend request. Terminal once non-pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Accepted => "accepted",
            RequestStatus::Rejected => "rejected",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "accepted" => Some(RequestStatus::Accepted),
            "rejected" => Some(RequestStatus::Rejected),
            "expired" => Some(RequestStatus::Expired),
            _ => None,
        }
    }
}

/// Delivery state of a stored message. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// Friend row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRow {
    pub device_id: String,
    pub display_name: String,
    pub last_addr: Option<String>,
    pub last_port: Option<u16>,
    pub last_seen: Option<u64>,
    pub established_at: u64,
}

impl FriendRow {
    /// Seen recently enough to count as reachable.
    pub fn is_online(&self, now: u64) -> bool {
        self.last_seen
            .is_some_and(|seen| now.saturating_sub(seen) <= ONLINE_WINDOW_SECS)
    }
}

/// Friend request row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequestRow {
    pub id: i64,
    pub from_device_id: String,
    pub from_display_name: String,
    pub from_addr: String,
    pub from_port: u16,
    pub status: RequestStatus,
    pub received_at: u64,
    pub responded_at: Option<u64>,
    pub expires_at: u64,
}

/// Message row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub message_id: String,
    pub from_device_id: String,
    pub from_display_name: String,
    pub to_device_id: String,
    pub content_type: String,
    pub content: String,
    pub category: Option<String>,
    pub direction: Direction,
    pub status: MessageStatus,
    pub sent_at: u64,
    pub delivered_at: Option<u64>,
    pub read_at: Option<u64>,
}

/// Outbound queue row. Exists iff the referenced message is undelivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message_id: String,
    pub to_device_id: String,
    pub to_addr: String,
    pub to_port: u16,
    pub envelope: String,
    pub attempts: u32,
    pub next_retry_at: u64,
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// The store lock shared by the engines and the retry scheduler.
pub type SharedStorage = Arc<Mutex<Storage>>;

pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Wrap a storage in the shared lock used across threads.
    pub fn into_shared(self) -> SharedStorage {
        Arc::new(Mutex::new(self))
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS friends (
                device_id       TEXT PRIMARY KEY,
                display_name    TEXT NOT NULL,
                last_addr       TEXT,
                last_port       INTEGER,
                last_seen       INTEGER,
                established_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS friend_requests (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                from_device_id      TEXT NOT NULL,
                from_display_name   TEXT NOT NULL,
                from_addr           TEXT NOT NULL,
                from_port           INTEGER NOT NULL,
                status              TEXT NOT NULL DEFAULT 'pending',
                received_at         INTEGER NOT NULL,
                responded_at        INTEGER,
                expires_at          INTEGER NOT NULL,
                UNIQUE(from_device_id)
            );

            CREATE TABLE IF NOT EXISTS messages (
                message_id          TEXT PRIMARY KEY,
                from_device_id      TEXT NOT NULL,
                from_display_name   TEXT NOT NULL,
                to_device_id        TEXT NOT NULL,
                content_type        TEXT NOT NULL,
                content             TEXT NOT NULL,
                category            TEXT,
                direction           TEXT NOT NULL,
                status              TEXT NOT NULL,
                sent_at             INTEGER NOT NULL,
                delivered_at        INTEGER,
                read_at             INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_peer
                ON messages(from_device_id, sent_at);
            CREATE INDEX IF NOT EXISTS idx_messages_status
                ON messages(status, sent_at);

            CREATE TABLE IF NOT EXISTS outbound_queue (
                message_id      TEXT PRIMARY KEY,
                to_device_id    TEXT NOT NULL,
                to_addr         TEXT NOT NULL,
                to_port         INTEGER NOT NULL,
                envelope        TEXT NOT NULL,
                attempts        INTEGER NOT NULL DEFAULT 0,
                next_retry_at   INTEGER NOT NULL,
                last_error      TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_due
                ON outbound_queue(next_retry_at);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Friends
    // -----------------------------------------------------------------------

    pub fn insert_friend(&self, row: &FriendRow) -> Result<(), StorageError> {
        if self.is_friend(&row.device_id)? {
            return Err(StorageError::AlreadyExists(format!(
                "friend {}",
                row.device_id
            )));
        }
        self.conn.execute(
            "INSERT INTO friends (device_id, display_name, last_addr, last_port, last_seen, established_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.device_id,
                row.display_name,
                row.last_addr,
                row.last_port,
                row.last_seen.map(|t| t as i64),
                row.established_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_friend(&self, device_id: &str) -> Result<Option<FriendRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT device_id, display_name, last_addr, last_port, last_seen, established_at
                 FROM friends WHERE device_id = ?1",
                params![device_id],
                Self::friend_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_friends(&self) -> Result<Vec<FriendRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, display_name, last_addr, last_port, last_seen, established_at
             FROM friends ORDER BY display_name, device_id",
        )?;
        let rows = stmt.query_map([], Self::friend_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn remove_friend(&self, device_id: &str) -> Result<bool, StorageError> {
        let changed = self
            .conn
            .execute("DELETE FROM friends WHERE device_id = ?1", params![device_id])?;
        Ok(changed > 0)
    }

    pub fn is_friend(&self, device_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM friends WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn friend_count(&self) -> Result<usize, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM friends", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Refresh the last known address and last-seen time of a friend.
    pub fn update_friend_contact(
        &self,
        device_id: &str,
        addr: &str,
        port: u16,
        seen_at: u64,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE friends SET last_addr = ?2, last_port = ?3, last_seen = ?4
             WHERE device_id = ?1",
            params![device_id, addr, port, seen_at as i64],
        )?;
        Ok(changed > 0)
    }

    fn friend_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRow> {
        Ok(FriendRow {
            device_id: row.get(0)?,
            display_name: row.get(1)?,
            last_addr: row.get(2)?,
            last_port: row.get::<_, Option<i64>>(3)?.map(|p| p as u16),
            last_seen: row.get::<_, Option<i64>>(4)?.map(|t| t as u64),
            established_at: row.get::<_, i64>(5)? as u64,
        })
    }

    // -----------------------------------------------------------------------
    // Friend requests
    // -----------------------------------------------------------------------

    /// Record an inbound friend request.
    ///
    /// A second request from the same sender refreshes the existing row
    /// instead of duplicating it. A sender whose previous request was
    /// rejected or expired starts over as pending. An accepted row is left
    /// untouched while the peers are still friends, but revives to pending
    /// once the friendship has been removed so the peer can ask again.
    pub fn upsert_pending_request(
        &self,
        from_device_id: &str,
        from_display_name: &str,
        from_addr: &str,
        from_port: u16,
        received_at: u64,
        expires_at: u64,
    ) -> Result<FriendRequestRow, StorageError> {
        self.conn.execute(
            "INSERT INTO friend_requests
                 (from_device_id, from_display_name, from_addr, from_port, status, received_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6)
             ON CONFLICT(from_device_id) DO UPDATE SET
                 from_display_name = excluded.from_display_name,
                 from_addr = excluded.from_addr,
                 from_port = excluded.from_port,
                 status = 'pending',
                 received_at = excluded.received_at,
                 responded_at = NULL,
                 expires_at = excluded.expires_at
             WHERE friend_requests.status != 'accepted'
                OR NOT EXISTS (SELECT 1 FROM friends
                               WHERE device_id = excluded.from_device_id)",
            params![
                from_device_id,
                from_display_name,
                from_addr,
                from_port,
                received_at as i64,
                expires_at as i64,
            ],
        )?;
        self.get_request_from(from_device_id)?
            .ok_or_else(|| StorageError::NotFound(format!("friend request from {from_device_id}")))
    }

    pub fn get_request(&self, id: i64) -> Result<Option<FriendRequestRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, from_device_id, from_display_name, from_addr, from_port,
                        status, received_at, responded_at, expires_at
                 FROM friend_requests WHERE id = ?1",
                params![id],
                Self::request_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_request_from(
        &self,
        from_device_id: &str,
    ) -> Result<Option<FriendRequestRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, from_device_id, from_display_name, from_addr, from_port,
                        status, received_at, responded_at, expires_at
                 FROM friend_requests WHERE from_device_id = ?1",
                params![from_device_id],
                Self::request_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_requests(
        &self,
        status: Option<RequestStatus>,
    ) -> Result<Vec<FriendRequestRow>, StorageError> {
        let base = "SELECT id, from_device_id, from_display_name, from_addr, from_port,
                           status, received_at, responded_at, expires_at
                    FROM friend_requests";
        let rows = match status {
            Some(status) => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{base} WHERE status = ?1 ORDER BY received_at"))?;
                let rows = stmt.query_map(params![status.as_str()], Self::request_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{base} ORDER BY received_at"))?;
                let rows = stmt.query_map([], Self::request_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(rows)
    }

    /// Accept a friend request and insert the friend row in one transaction.
    ///
    /// Idempotent: re-accepting an already-accepted request returns the
    /// existing friend without inserting anything. Rejected and expired
    /// requests are terminal and fail with `Constraint`.
    pub fn accept_request_tx(&self, id: i64, now: u64) -> Result<FriendRow, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let request = tx
            .query_row(
                "SELECT id, from_device_id, from_display_name, from_addr, from_port,
                        status, received_at, responded_at, expires_at
                 FROM friend_requests WHERE id = ?1",
                params![id],
                Self::request_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("friend request {id}")))?;

        match request.status {
            RequestStatus::Accepted => {
                let friend = tx
                    .query_row(
                        "SELECT device_id, display_name, last_addr, last_port, last_seen, established_at
                         FROM friends WHERE device_id = ?1",
                        params![request.from_device_id],
                        Self::friend_from_row,
                    )
                    .optional()?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("friend {}", request.from_device_id))
                    })?;
                tx.commit()?;
                return Ok(friend);
            }
            RequestStatus::Rejected | RequestStatus::Expired => {
                return Err(StorageError::Constraint(format!(
                    "friend request {id} is {}",
                    request.status.as_str()
                )));
            }
            RequestStatus::Pending => {}
        }

        tx.execute(
            "UPDATE friend_requests SET status = 'accepted', responded_at = ?2 WHERE id = ?1",
            params![id, now as i64],
        )?;
        tx.execute(
            "INSERT INTO friends (device_id, display_name, last_addr, last_port, last_seen, established_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                 last_addr = excluded.last_addr,
                 last_port = excluded.last_port,
                 last_seen = excluded.last_seen",
            params![
                request.from_device_id,
                request.from_display_name,
                request.from_addr,
                request.from_port,
                now as i64,
                now as i64,
            ],
        )?;
        let friend = tx.query_row(
            "SELECT device_id, display_name, last_addr, last_port, last_seen, established_at
             FROM friends WHERE device_id = ?1",
            params![request.from_device_id],
            Self::friend_from_row,
        )?;
        tx.commit()?;
        Ok(friend)
    }

    /// Mark a pending request rejected. Returns `false` if it was not pending.
    pub fn mark_request_rejected(&self, id: i64, now: u64) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE friend_requests SET status = 'rejected', responded_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now as i64],
        )?;
        Ok(changed > 0)
    }

    /// Transition overdue pending requests to expired. Returns the count.
    pub fn sweep_expired(&self, now: u64) -> Result<usize, StorageError> {
        let changed = self.conn.execute(
            "UPDATE friend_requests SET status = 'expired', responded_at = ?1
             WHERE status = 'pending' AND expires_at <= ?1",
            params![now as i64],
        )?;
        Ok(changed)
    }

    fn request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FriendRequestRow> {
        let status: String = row.get(5)?;
        Ok(FriendRequestRow {
            id: row.get(0)?,
            from_device_id: row.get(1)?,
            from_display_name: row.get(2)?,
            from_addr: row.get(3)?,
            from_port: row.get::<_, i64>(4)? as u16,
            status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Pending),
            received_at: row.get::<_, i64>(6)? as u64,
            responded_at: row.get::<_, Option<i64>>(7)?.map(|t| t as u64),
            expires_at: row.get::<_, i64>(8)? as u64,
        })
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Insert an outgoing message and its queue entry in one transaction.
    ///
    /// Both rows are durable before any delivery attempt is made.
    pub fn insert_outgoing_tx(
        &self,
        message: &MessageRow,
        entry: &QueueEntry,
    ) -> Result<(), StorageError> {
        if message.message_id != entry.message_id {
            return Err(StorageError::Constraint(
                "queue entry does not reference its message".to_string(),
            ));
        }
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO messages
                 (message_id, from_device_id, from_display_name, to_device_id,
                  content_type, content, category, direction, status,
                  sent_at, delivered_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL)",
            params![
                message.message_id,
                message.from_device_id,
                message.from_display_name,
                message.to_device_id,
                message.content_type,
                message.content,
                message.category,
                message.direction.as_str(),
                message.status.as_str(),
                message.sent_at as i64,
            ],
        )?;
        tx.execute(
            "INSERT INTO outbound_queue
                 (message_id, to_device_id, to_addr, to_port, envelope, attempts, next_retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.message_id,
                entry.to_device_id,
                entry.to_addr,
                entry.to_port,
                entry.envelope,
                entry.attempts,
                entry.next_retry_at as i64,
                entry.last_error,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Insert a received message. Returns `false` when the message id is
    /// already known (duplicate delivery).
    pub fn insert_received(&self, message: &MessageRow) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO messages
                 (message_id, from_device_id, from_display_name, to_device_id,
                  content_type, content, category, direction, status,
                  sent_at, delivered_at, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)",
            params![
                message.message_id,
                message.from_device_id,
                message.from_display_name,
                message.to_device_id,
                message.content_type,
                message.content,
                message.category,
                message.direction.as_str(),
                message.status.as_str(),
                message.sent_at as i64,
                message.delivered_at.map(|t| t as i64),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<MessageRow>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT message_id, from_device_id, from_display_name, to_device_id,
                        content_type, content, category, direction, status,
                        sent_at, delivered_at, read_at
                 FROM messages WHERE message_id = ?1",
                params![message_id],
                Self::message_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn has_message(&self, message_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All messages exchanged with one peer, oldest first.
    pub fn conversation(
        &self,
        peer_device_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, from_device_id, from_display_name, to_device_id,
                    content_type, content, category, direction, status,
                    sent_at, delivered_at, read_at
             FROM messages
             WHERE from_device_id = ?1 OR to_device_id = ?1
             ORDER BY sent_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![peer_device_id, limit as i64], Self::message_from_row)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Received messages, newest first.
    pub fn inbox(&self, limit: usize) -> Result<Vec<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, from_device_id, from_display_name, to_device_id,
                    content_type, content, category, direction, status,
                    sent_at, delivered_at, read_at
             FROM messages WHERE direction = 'received'
             ORDER BY sent_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], Self::message_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn unread_count(&self) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE direction = 'received' AND status = 'delivered'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Advance a pending message to delivered and drop its queue entry in
    /// one transaction.
    ///
    /// Queue entries without a message row (protocol notices) are simply
    /// dequeued. Returns `false` when nothing changed, so a repeated call
    /// never moves a status backwards.
    pub fn mark_delivered_tx(&self, message_id: &str, now: u64) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let advanced = tx.execute(
            "UPDATE messages SET status = 'delivered', delivered_at = ?2
             WHERE message_id = ?1 AND status = 'pending'",
            params![message_id, now as i64],
        )?;
        let dequeued = tx.execute(
            "DELETE FROM outbound_queue WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.commit()?;
        Ok(advanced > 0 || dequeued > 0)
    }

    /// Advance a pending message to failed and drop its queue entry in one
    /// transaction. Same no-message and no-op semantics as
    /// [`Self::mark_delivered_tx`].
    pub fn mark_failed_tx(&self, message_id: &str) -> Result<bool, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let advanced = tx.execute(
            "UPDATE messages SET status = 'failed' WHERE message_id = ?1 AND status = 'pending'",
            params![message_id],
        )?;
        let dequeued = tx.execute(
            "DELETE FROM outbound_queue WHERE message_id = ?1",
            params![message_id],
        )?;
        tx.commit()?;
        Ok(advanced > 0 || dequeued > 0)
    }

    /// Advance a delivered message to read. Returns `false` for any other
    /// starting status.
    pub fn mark_read(&self, message_id: &str, now: u64) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE messages SET status = 'read', read_at = ?2
             WHERE message_id = ?1 AND status = 'delivered'",
            params![message_id, now as i64],
        )?;
        Ok(changed > 0)
    }

    fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
        let direction: String = row.get(7)?;
        let status: String = row.get(8)?;
        Ok(MessageRow {
            message_id: row.get(0)?,
            from_device_id: row.get(1)?,
            from_display_name: row.get(2)?,
            to_device_id: row.get(3)?,
            content_type: row.get(4)?,
            content: row.get(5)?,
            category: row.get(6)?,
            direction: Direction::parse(&direction).unwrap_or(Direction::Received),
            status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Pending),
            sent_at: row.get::<_, i64>(9)? as u64,
            delivered_at: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
            read_at: row.get::<_, Option<i64>>(11)?.map(|t| t as u64),
        })
    }

    // -----------------------------------------------------------------------
    // Outbound queue
    // -----------------------------------------------------------------------

    /// Queue a standalone entry, used for protocol notices that have no
    /// message row. Chat messages go through [`Self::insert_outgoing_tx`].
    pub fn enqueue_entry(&self, entry: &QueueEntry) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO outbound_queue
                 (message_id, to_device_id, to_addr, to_port, envelope, attempts, next_retry_at, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.message_id,
                entry.to_device_id,
                entry.to_addr,
                entry.to_port,
                entry.envelope,
                entry.attempts,
                entry.next_retry_at as i64,
                entry.last_error,
            ],
        )?;
        Ok(())
    }

    /// Queue entries due for a delivery attempt, oldest due first.
    pub fn due_queue_entries(&self, now: u64, limit: usize) -> Result<Vec<QueueEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, to_device_id, to_addr, to_port, envelope, attempts, next_retry_at, last_error
             FROM outbound_queue WHERE next_retry_at <= ?1
             ORDER BY next_retry_at LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now as i64, limit as i64], Self::queue_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Record a failed attempt and push the entry's next retry time out.
    pub fn reschedule_entry(
        &self,
        message_id: &str,
        attempts: u32,
        next_retry_at: u64,
        err: &str,
    ) -> Result<bool, StorageError> {
        let changed = self.conn.execute(
            "UPDATE outbound_queue SET attempts = ?2, next_retry_at = ?3, last_error = ?4
             WHERE message_id = ?1",
            params![message_id, attempts, next_retry_at as i64, err],
        )?;
        Ok(changed > 0)
    }

    pub fn queue_entry(&self, message_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT message_id, to_device_id, to_addr, to_port, envelope, attempts, next_retry_at, last_error
                 FROM outbound_queue WHERE message_id = ?1",
                params![message_id],
                Self::queue_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn queue_len(&self) -> Result<usize, StorageError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM outbound_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn queue_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
        Ok(QueueEntry {
            message_id: row.get(0)?,
            to_device_id: row.get(1)?,
            to_addr: row.get(2)?,
            to_port: row.get::<_, i64>(3)? as u16,
            envelope: row.get(4)?,
            attempts: row.get::<_, i64>(5)? as u32,
            next_retry_at: row.get::<_, i64>(6)? as u64,
            last_error: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn friend(device_id: &str) -> FriendRow {
        FriendRow {
            device_id: device_id.to_string(),
            display_name: format!("pet-{device_id}"),
            last_addr: Some("10.0.0.2".to_string()),
            last_port: Some(5199),
            last_seen: Some(1000),
            established_at: 1000,
        }
    }

    fn outgoing(message_id: &str) -> (MessageRow, QueueEntry) {
        let message = MessageRow {
            message_id: message_id.to_string(),
            from_device_id: "me".to_string(),
            from_display_name: "Me".to_string(),
            to_device_id: "peer".to_string(),
            content_type: "text".to_string(),
            content: "hello".to_string(),
            category: None,
            direction: Direction::Sent,
            status: MessageStatus::Pending,
            sent_at: 2000,
            delivered_at: None,
            read_at: None,
        };
        let entry = QueueEntry {
            message_id: message_id.to_string(),
            to_device_id: "peer".to_string(),
            to_addr: "10.0.0.2".to_string(),
            to_port: 5199,
            envelope: "{}".to_string(),
            attempts: 0,
            next_retry_at: 2000,
            last_error: None,
        };
        (message, entry)
    }

    #[test]
    fn removed_friend_can_request_again() {
        let storage = Storage::open_in_memory().unwrap();
        let request = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 100, 100 + 86400)
            .unwrap();
        storage.accept_request_tx(request.id, 150).unwrap();

        // While the friendship stands, a repeat request changes nothing.
        let still = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 180, 180 + 86400)
            .unwrap();
        assert_eq!(still.status, RequestStatus::Accepted);

        assert!(storage.remove_friend("peer").unwrap());
        let revived = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 200, 200 + 86400)
            .unwrap();
        assert_eq!(revived.status, RequestStatus::Pending);
        let friend = storage.accept_request_tx(revived.id, 250).unwrap();
        assert_eq!(friend.device_id, "peer");
    }

    #[test]
    fn online_window_tracks_last_seen() {
        let mut row = friend("a");
        row.last_seen = Some(1000);
        assert!(row.is_online(1000 + ONLINE_WINDOW_SECS));
        assert!(!row.is_online(1001 + ONLINE_WINDOW_SECS));
        row.last_seen = None;
        assert!(!row.is_online(1000));
    }

    #[test]
    fn duplicate_friend_insert_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        storage.insert_friend(&friend("a")).unwrap();
        assert!(matches!(
            storage.insert_friend(&friend("a")),
            Err(StorageError::AlreadyExists(_))
        ));
        assert_eq!(storage.friend_count().unwrap(), 1);
    }

    #[test]
    fn repeated_request_refreshes_single_row() {
        let storage = Storage::open_in_memory().unwrap();
        let first = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 100, 100 + 86400)
            .unwrap();
        let second = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.9", 5200, 200, 200 + 86400)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.from_addr, "10.0.0.9");
        assert_eq!(second.received_at, 200);
        assert_eq!(storage.list_requests(None).unwrap().len(), 1);
    }

    #[test]
    fn accept_is_transactional_and_idempotent() {
        let storage = Storage::open_in_memory().unwrap();
        let request = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 100, 100 + 86400)
            .unwrap();
        let friend = storage.accept_request_tx(request.id, 150).unwrap();
        assert_eq!(friend.device_id, "peer");
        assert_eq!(storage.friend_count().unwrap(), 1);

        // Second accept changes nothing.
        let again = storage.accept_request_tx(request.id, 300).unwrap();
        assert_eq!(again.device_id, "peer");
        assert_eq!(storage.friend_count().unwrap(), 1);
        let row = storage.get_request(request.id).unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Accepted);
        assert_eq!(row.responded_at, Some(150));
    }

    #[test]
    fn rejected_request_is_terminal_but_can_restart() {
        let storage = Storage::open_in_memory().unwrap();
        let request = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 100, 100 + 86400)
            .unwrap();
        assert!(storage.mark_request_rejected(request.id, 150).unwrap());
        assert!(matches!(
            storage.accept_request_tx(request.id, 200),
            Err(StorageError::Constraint(_))
        ));
        // A fresh request from the same device starts over as pending.
        let revived = storage
            .upsert_pending_request("peer", "Peer", "10.0.0.2", 5199, 300, 300 + 86400)
            .unwrap();
        assert_eq!(revived.status, RequestStatus::Pending);
        assert_eq!(revived.responded_at, None);
    }

    #[test]
    fn sweep_expires_only_overdue_pending() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .upsert_pending_request("a", "A", "10.0.0.2", 5199, 100, 500)
            .unwrap();
        storage
            .upsert_pending_request("b", "B", "10.0.0.3", 5199, 100, 2000)
            .unwrap();
        assert_eq!(storage.sweep_expired(1000).unwrap(), 1);
        let expired = storage
            .list_requests(Some(RequestStatus::Expired))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].from_device_id, "a");
        assert_eq!(
            storage
                .list_requests(Some(RequestStatus::Pending))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn outgoing_message_and_queue_entry_inserted_together() {
        let storage = Storage::open_in_memory().unwrap();
        let (message, entry) = outgoing("m1");
        storage.insert_outgoing_tx(&message, &entry).unwrap();
        assert_eq!(storage.queue_len().unwrap(), 1);
        let stored = storage.get_message("m1").unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
    }

    #[test]
    fn delivery_advances_status_and_dequeues_atomically() {
        let storage = Storage::open_in_memory().unwrap();
        let (message, entry) = outgoing("m1");
        storage.insert_outgoing_tx(&message, &entry).unwrap();

        assert!(storage.mark_delivered_tx("m1", 2100).unwrap());
        assert_eq!(storage.queue_len().unwrap(), 0);
        let stored = storage.get_message("m1").unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Delivered);
        assert_eq!(stored.delivered_at, Some(2100));

        // Status never moves backwards.
        assert!(!storage.mark_delivered_tx("m1", 2200).unwrap());
        assert!(!storage.mark_failed_tx("m1").unwrap());
    }

    #[test]
    fn failed_message_dequeued_and_terminal() {
        let storage = Storage::open_in_memory().unwrap();
        let (message, entry) = outgoing("m1");
        storage.insert_outgoing_tx(&message, &entry).unwrap();
        assert!(storage.mark_failed_tx("m1").unwrap());
        assert_eq!(storage.queue_len().unwrap(), 0);
        assert_eq!(
            storage.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Failed
        );
        assert!(!storage.mark_read("m1", 2300).unwrap());
    }

    #[test]
    fn read_only_after_delivered() {
        let storage = Storage::open_in_memory().unwrap();
        let (message, entry) = outgoing("m1");
        storage.insert_outgoing_tx(&message, &entry).unwrap();
        assert!(!storage.mark_read("m1", 2100).unwrap());
        storage.mark_delivered_tx("m1", 2100).unwrap();
        assert!(storage.mark_read("m1", 2200).unwrap());
        assert_eq!(
            storage.get_message("m1").unwrap().unwrap().status,
            MessageStatus::Read
        );
    }

    #[test]
    fn duplicate_received_message_ignored() {
        let storage = Storage::open_in_memory().unwrap();
        let (mut message, _) = outgoing("m1");
        message.direction = Direction::Received;
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(2000);
        assert!(storage.insert_received(&message).unwrap());
        assert!(!storage.insert_received(&message).unwrap());
        assert_eq!(storage.unread_count().unwrap(), 1);
    }

    #[test]
    fn queued_notice_without_message_row_dequeues() {
        let storage = Storage::open_in_memory().unwrap();
        let (_, mut entry) = outgoing("notice-1");
        entry.message_id = "notice-1".to_string();
        storage.enqueue_entry(&entry).unwrap();
        assert_eq!(storage.queue_len().unwrap(), 1);
        assert!(storage.mark_delivered_tx("notice-1", 2100).unwrap());
        assert_eq!(storage.queue_len().unwrap(), 0);
        assert!(!storage.mark_delivered_tx("notice-1", 2200).unwrap());
    }

    #[test]
    fn due_entries_ordered_and_reschedulable() {
        let storage = Storage::open_in_memory().unwrap();
        for (id, due) in [("m1", 3000u64), ("m2", 1000), ("m3", 9000)] {
            let (mut message, mut entry) = outgoing(id);
            message.message_id = id.to_string();
            entry.message_id = id.to_string();
            entry.next_retry_at = due;
            storage.insert_outgoing_tx(&message, &entry).unwrap();
        }
        let due = storage.due_queue_entries(3500, 10).unwrap();
        assert_eq!(
            due.iter().map(|e| e.message_id.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m1"]
        );

        assert!(storage.reschedule_entry("m2", 1, 5000, "timeout").unwrap());
        let entry = storage.queue_entry("m2").unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_retry_at, 5000);
        assert_eq!(entry.last_error.as_deref(), Some("timeout"));
        assert_eq!(storage.due_queue_entries(3500, 10).unwrap().len(), 1);
    }
}
