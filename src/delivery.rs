//! Store-and-forward message delivery.
//!
//! Outgoing messages are made durable first: the message row and its queue
//! entry are committed in one transaction before any network attempt, so a
//! crash right after `send` returns loses nothing. Delivery then happens
//! opportunistically: one immediate attempt, after that the retry scheduler
//! drives the queue with exponential backoff until delivery succeeds or the
//! attempt budget is spent.
//!
//! The engine is generic over [`Wire`] so tests can script unreachable
//! peers without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::{
    DEFAULT_PORT, MAX_CONTENT_CHARS, QUEUE_BATCH_LIMIT, RETRY_BASE_DELAY_SECS,
    RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_SECS,
};
use crate::friends::FriendEngine;
use crate::plog;
use crate::protocol::{ContentType, Envelope, LocalIdentity};
use crate::storage::{
    Direction, MessageRow, MessageStatus, QueueEntry, SharedStorage, Storage, StorageError,
};
use crate::transport::Wire;

#[derive(Debug)]
pub enum DeliveryError {
    /// The peer is not a mutual friend. Nothing was persisted.
    NotFriend(String),
    InvalidContent(String),
    /// No known address for the peer.
    NoAddress(String),
    Store(StorageError),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::NotFriend(id) => write!(f, "not friends with {id}"),
            DeliveryError::InvalidContent(msg) => write!(f, "invalid content: {msg}"),
            DeliveryError::NoAddress(id) => write!(f, "no known address for {id}"),
            DeliveryError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<StorageError> for DeliveryError {
    fn from(e: StorageError) -> Self {
        DeliveryError::Store(e)
    }
}

/// Retry delay after `attempts` completed attempts, capped.
pub fn backoff_delay(attempts: u32) -> u64 {
    let shift = attempts.min(31);
    RETRY_BASE_DELAY_SECS
        .saturating_mul(1u64 << shift)
        .min(RETRY_MAX_DELAY_SECS)
}

pub struct DeliveryEngine<W: Wire> {
    storage: SharedStorage,
    wire: W,
    identity: LocalIdentity,
}

impl<W: Wire> DeliveryEngine<W> {
    pub fn new(storage: SharedStorage, wire: W, identity: LocalIdentity) -> Self {
        Self {
            storage,
            wire,
            identity,
        }
    }

    fn store(&self) -> MutexGuard<'_, Storage> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a message to a friend and attempt immediate delivery.
    ///
    /// Returns the message id. The message is durable before this returns,
    /// whether or not the immediate attempt succeeded.
    pub fn send(
        &self,
        to_device_id: &str,
        content_type: ContentType,
        content: &str,
        category: Option<String>,
        now: u64,
    ) -> Result<String, DeliveryError> {
        if content.trim().is_empty() {
            return Err(DeliveryError::InvalidContent("empty".to_string()));
        }
        let chars = content.chars().count();
        if chars > MAX_CONTENT_CHARS {
            return Err(DeliveryError::InvalidContent(format!(
                "{chars} chars exceeds {MAX_CONTENT_CHARS}"
            )));
        }

        let envelope =
            Envelope::chat_message(&self.identity, now, content_type, content, category);
        let entry = {
            let store = self.store();
            let friend = store
                .get_friend(to_device_id)?
                .ok_or_else(|| DeliveryError::NotFriend(to_device_id.to_string()))?;
            let addr = friend
                .last_addr
                .ok_or_else(|| DeliveryError::NoAddress(to_device_id.to_string()))?;
            let port = friend.last_port.unwrap_or(DEFAULT_PORT);

            let message = MessageRow {
                message_id: envelope.message_id.clone(),
                from_device_id: self.identity.device_id.clone(),
                from_display_name: self.identity.display_name.clone(),
                to_device_id: to_device_id.to_string(),
                content_type: envelope
                    .content_type
                    .map(ContentType::as_str)
                    .unwrap_or("text")
                    .to_string(),
                content: content.to_string(),
                category: envelope.category.clone(),
                direction: Direction::Sent,
                status: MessageStatus::Pending,
                sent_at: now,
                delivered_at: None,
                read_at: None,
            };
            let entry = QueueEntry {
                message_id: envelope.message_id.clone(),
                to_device_id: to_device_id.to_string(),
                to_addr: addr,
                to_port: port,
                envelope: serde_json::to_string(&envelope)
                    .map_err(|e| DeliveryError::InvalidContent(e.to_string()))?,
                attempts: 0,
                next_retry_at: now,
                last_error: None,
            };
            store.insert_outgoing_tx(&message, &entry)?;
            entry
        };

        // Durable; now try the wire once without holding the lock.
        self.attempt(&entry, &envelope, now)?;
        Ok(envelope.message_id)
    }

    /// One delivery attempt for a queue entry. Records the outcome.
    fn attempt(
        &self,
        entry: &QueueEntry,
        envelope: &Envelope,
        now: u64,
    ) -> Result<(), DeliveryError> {
        match self
            .wire
            .send_envelope(&entry.to_addr, entry.to_port, envelope)
        {
            Ok(()) => {
                let store = self.store();
                store.mark_delivered_tx(&entry.message_id, now)?;
                store.update_friend_contact(&entry.to_device_id, &entry.to_addr, entry.to_port, now)?;
                plog!("delivered {}", crate::logging::msg_id(&entry.message_id));
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                let attempts = entry.attempts + 1;
                let store = self.store();
                if attempts >= RETRY_MAX_ATTEMPTS {
                    store.mark_failed_tx(&entry.message_id)?;
                    plog!(
                        "giving up on {} after {attempts} attempts: {e}",
                        crate::logging::msg_id(&entry.message_id)
                    );
                } else {
                    let delay = backoff_delay(attempts - 1);
                    store.reschedule_entry(
                        &entry.message_id,
                        attempts,
                        now + delay,
                        &e.to_string(),
                    )?;
                    plog!(
                        "retry {} in {delay}s (attempt {attempts}): {e}",
                        crate::logging::msg_id(&entry.message_id)
                    );
                }
                Ok(())
            }
            Err(e) => {
                self.store().mark_failed_tx(&entry.message_id)?;
                plog!(
                    "peer refused {}: {e}",
                    crate::logging::msg_id(&entry.message_id)
                );
                Ok(())
            }
        }
    }

    /// One pass over the due queue entries.
    ///
    /// Snapshots the due batch under the lock, then attempts delivery with
    /// the lock released; each outcome re-acquires it briefly. Returns the
    /// number of messages delivered this pass.
    pub fn process_queue(&self, now: u64) -> Result<usize, DeliveryError> {
        let due = self.store().due_queue_entries(now, QUEUE_BATCH_LIMIT as usize)?;
        let mut delivered = 0;
        for entry in due {
            if entry.attempts >= RETRY_MAX_ATTEMPTS {
                self.store().mark_failed_tx(&entry.message_id)?;
                continue;
            }
            let envelope: Envelope = match serde_json::from_str(&entry.envelope) {
                Ok(envelope) => envelope,
                Err(e) => {
                    plog!(
                        "dropping unparseable queued envelope {}: {e}",
                        crate::logging::msg_id(&entry.message_id)
                    );
                    self.store().mark_failed_tx(&entry.message_id)?;
                    continue;
                }
            };
            self.attempt(&entry, &envelope, now)?;
            if let Some(message) = self.store().get_message(&entry.message_id)? {
                if message.status == MessageStatus::Delivered {
                    delivered += 1;
                }
            }
        }
        Ok(delivered)
    }

    /// Persist a received chat message. `Ok(None)` means a duplicate.
    pub fn receive(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        now: u64,
    ) -> Result<Option<MessageRow>, DeliveryError> {
        let store = self.store();
        if !store.is_friend(&envelope.from_device_id)? {
            return Err(DeliveryError::NotFriend(envelope.from_device_id.clone()));
        }
        let row = MessageRow {
            message_id: envelope.message_id.clone(),
            from_device_id: envelope.from_device_id.clone(),
            from_display_name: envelope.from_display_name.clone(),
            to_device_id: self.identity.device_id.clone(),
            content_type: envelope
                .content_type
                .map(ContentType::as_str)
                .unwrap_or("text")
                .to_string(),
            content: envelope.content.clone().unwrap_or_default(),
            category: envelope.category.clone(),
            direction: Direction::Received,
            status: MessageStatus::Delivered,
            sent_at: envelope.timestamp,
            delivered_at: Some(now),
            read_at: None,
        };
        if !store.insert_received(&row)? {
            plog!(
                "duplicate message {} ignored",
                crate::logging::msg_id(&row.message_id)
            );
            return Ok(None);
        }
        let (addr, port) = envelope.reply_addr(sender_addr, DEFAULT_PORT);
        store.update_friend_contact(&envelope.from_device_id, &addr, port, now)?;
        Ok(Some(row))
    }

    pub fn mark_read(&self, message_id: &str, now: u64) -> Result<bool, DeliveryError> {
        Ok(self.store().mark_read(message_id, now)?)
    }

    pub fn conversation(
        &self,
        peer_device_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, DeliveryError> {
        Ok(self.store().conversation(peer_device_id, limit)?)
    }

    pub fn inbox(&self, limit: usize) -> Result<Vec<MessageRow>, DeliveryError> {
        Ok(self.store().inbox(limit)?)
    }

    pub fn unread_count(&self) -> Result<usize, DeliveryError> {
        Ok(self.store().unread_count()?)
    }

    pub fn queue_len(&self) -> Result<usize, DeliveryError> {
        Ok(self.store().queue_len()?)
    }
}

// ---------------------------------------------------------------------------
// Retry scheduler
// ---------------------------------------------------------------------------

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Background thread that drives the retry queue and the expiry sweep.
///
/// Never holds the store lock across a wire call; the engine's
/// snapshot/release/re-acquire discipline guarantees that. On startup the
/// first tick naturally picks up whatever the queue held when the process
/// last stopped.
pub struct RetryScheduler {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RetryScheduler {
    pub fn start<W: Wire + 'static>(
        engine: Arc<DeliveryEngine<W>>,
        friends: Arc<FriendEngine>,
        queue_tick: Duration,
        sweep_tick: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("petlink-retry".to_string())
            .spawn(move || {
                let mut last_queue: Option<Instant> = None;
                let mut last_sweep: Option<Instant> = None;
                while !stop.load(Ordering::SeqCst) {
                    if last_queue.map_or(true, |t| t.elapsed() >= queue_tick) {
                        if let Err(e) = engine.process_queue(unix_now()) {
                            plog!("queue pass failed: {e}");
                        }
                        last_queue = Some(Instant::now());
                    }
                    if last_sweep.map_or(true, |t| t.elapsed() >= sweep_tick) {
                        match friends.sweep_expired(unix_now()) {
                            Ok(0) => {}
                            Ok(n) => plog!("expired {n} friend request(s)"),
                            Err(e) => plog!("expiry sweep failed: {e}"),
                        }
                        last_sweep = Some(Instant::now());
                    }
                    thread::sleep(Duration::from_millis(100));
                }
            })?;
        Ok(RetryScheduler {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::storage::FriendRow;
    use crate::transport::TransportError;

    /// Wire that fails the first `failures` sends, then succeeds.
    struct ScriptedWire {
        failures: Mutex<u32>,
        reject: bool,
    }

    impl ScriptedWire {
        fn failing(failures: u32) -> Self {
            Self {
                failures: Mutex::new(failures),
                reject: false,
            }
        }

        fn rejecting() -> Self {
            Self {
                failures: Mutex::new(u32::MAX),
                reject: true,
            }
        }
    }

    impl Wire for ScriptedWire {
        fn send_envelope(
            &self,
            _addr: &str,
            _port: u16,
            _envelope: &Envelope,
        ) -> Result<(), TransportError> {
            let mut left = self.failures.lock().unwrap();
            if *left == 0 {
                return Ok(());
            }
            *left = left.saturating_sub(1);
            if self.reject {
                Err(TransportError::Rejected)
            } else {
                Err(TransportError::Unreachable(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
        }

        fn probe(&self, _addr: &str, _port: u16) -> bool {
            *self.failures.lock().unwrap() == 0
        }
    }

    fn engine(wire: ScriptedWire) -> DeliveryEngine<ScriptedWire> {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_friend(&FriendRow {
                device_id: "peer".to_string(),
                display_name: "Peer".to_string(),
                last_addr: Some("10.0.0.2".to_string()),
                last_port: Some(5199),
                last_seen: Some(1000),
                established_at: 1000,
            })
            .unwrap();
        DeliveryEngine::new(
            storage.into_shared(),
            wire,
            LocalIdentity::new("device-me", "Me", 5199),
        )
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff_delay(0), 30);
        assert_eq!(backoff_delay(1), 60);
        assert_eq!(backoff_delay(2), 120);
        assert_eq!(backoff_delay(6), 1800);
        assert_eq!(backoff_delay(60), 1800);
    }

    #[test]
    fn send_to_non_friend_persists_nothing() {
        let engine = engine(ScriptedWire::failing(0));
        let err = engine
            .send("stranger", ContentType::Text, "hi", None, 1000)
            .unwrap_err();
        assert!(matches!(err, DeliveryError::NotFriend(_)));
        assert_eq!(engine.queue_len().unwrap(), 0);
        assert!(engine.conversation("stranger", 10).unwrap().is_empty());
    }

    #[test]
    fn content_validated_before_persistence() {
        let engine = engine(ScriptedWire::failing(0));
        assert!(matches!(
            engine.send("peer", ContentType::Text, "  ", None, 1000),
            Err(DeliveryError::InvalidContent(_))
        ));
        let long = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            engine.send("peer", ContentType::Text, &long, None, 1000),
            Err(DeliveryError::InvalidContent(_))
        ));
        assert_eq!(engine.queue_len().unwrap(), 0);
    }

    #[test]
    fn immediate_delivery_marks_delivered() {
        let engine = engine(ScriptedWire::failing(0));
        let id = engine
            .send("peer", ContentType::Text, "hello", None, 1000)
            .unwrap();
        assert_eq!(engine.queue_len().unwrap(), 0);
        let messages = engine.conversation("peer", 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, id);
        assert_eq!(messages[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn unreachable_peer_leaves_message_queued_with_backoff() {
        let engine = engine(ScriptedWire::failing(1));
        let id = engine
            .send("peer", ContentType::Text, "hello", None, 1000)
            .unwrap();
        // Still pending and queued for now + 30s.
        let entry = engine.store().queue_entry(&id).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_retry_at, 1030);
        assert!(entry.last_error.is_some());

        // Not due yet: nothing happens.
        assert_eq!(engine.process_queue(1010).unwrap(), 0);
        assert_eq!(engine.queue_len().unwrap(), 1);

        // Due and the wire recovered: delivered.
        assert_eq!(engine.process_queue(1030).unwrap(), 1);
        assert_eq!(engine.queue_len().unwrap(), 0);
        let message = engine.store().get_message(&id).unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Delivered);
    }

    #[test]
    fn backoff_schedule_grows_per_attempt() {
        let engine = engine(ScriptedWire::failing(u32::MAX));
        let id = engine
            .send("peer", ContentType::Text, "hello", None, 1000)
            .unwrap();
        let entry = engine.store().queue_entry(&id).unwrap().unwrap();
        assert_eq!((entry.attempts, entry.next_retry_at), (1, 1030));

        engine.process_queue(1030).unwrap();
        let entry = engine.store().queue_entry(&id).unwrap().unwrap();
        assert_eq!((entry.attempts, entry.next_retry_at), (2, 1030 + 60));

        engine.process_queue(1090).unwrap();
        let entry = engine.store().queue_entry(&id).unwrap().unwrap();
        assert_eq!((entry.attempts, entry.next_retry_at), (3, 1090 + 120));
    }

    #[test]
    fn attempt_budget_exhaustion_fails_message() {
        let engine = engine(ScriptedWire::failing(u32::MAX));
        let id = engine
            .send("peer", ContentType::Text, "hello", None, 1000)
            .unwrap();
        let mut now = 1000;
        for _ in 0..RETRY_MAX_ATTEMPTS {
            now += 2000; // past any backoff
            engine.process_queue(now).unwrap();
        }
        assert_eq!(engine.queue_len().unwrap(), 0);
        let message = engine.store().get_message(&id).unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[test]
    fn peer_rejection_fails_without_retry() {
        let engine = engine(ScriptedWire::rejecting());
        let id = engine
            .send("peer", ContentType::Text, "hello", None, 1000)
            .unwrap();
        assert_eq!(engine.queue_len().unwrap(), 0);
        let message = engine.store().get_message(&id).unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[test]
    fn receive_rejects_strangers_and_tolerates_duplicates() {
        let engine = engine(ScriptedWire::failing(0));
        let peer = LocalIdentity::new("peer", "Peer", 5199);
        let envelope =
            Envelope::chat_message(&peer, 900, ContentType::Emoji, "\u{1F436}", None);

        let row = engine.receive(&envelope, "10.0.0.2", 1000).unwrap().unwrap();
        assert_eq!(row.status, MessageStatus::Delivered);
        assert_eq!(engine.unread_count().unwrap(), 1);

        // Same envelope again: ignored.
        assert!(engine.receive(&envelope, "10.0.0.2", 1001).unwrap().is_none());
        assert_eq!(engine.unread_count().unwrap(), 1);

        let stranger = LocalIdentity::new("stranger", "Who", 5199);
        let envelope =
            Envelope::chat_message(&stranger, 900, ContentType::Text, "hi", None);
        assert!(matches!(
            engine.receive(&envelope, "10.0.0.9", 1002),
            Err(DeliveryError::NotFriend(_))
        ));
    }

    #[test]
    fn read_receipt_advances_received_message() {
        let engine = engine(ScriptedWire::failing(0));
        let peer = LocalIdentity::new("peer", "Peer", 5199);
        let envelope = Envelope::chat_message(&peer, 900, ContentType::Text, "hi", None);
        let row = engine.receive(&envelope, "10.0.0.2", 1000).unwrap().unwrap();

        assert!(engine.mark_read(&row.message_id, 1100).unwrap());
        assert_eq!(engine.unread_count().unwrap(), 0);
        assert!(!engine.mark_read(&row.message_id, 1200).unwrap());
    }
}
