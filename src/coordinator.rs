//! The one object the application embeds.
//!
//! `SocialCoordinator` wires together the transport server, the discovery
//! announcer, the retry scheduler and the handler registry, and exposes the
//! small surface the device UI calls. All UI-visible work happens on the
//! caller's thread: network threads only queue events, and the application
//! loop calls [`SocialCoordinator::pump_events`] once per tick to drain and
//! dispatch them.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bridge::{event_channel, EventQueue, NetEvent};
use crate::config::{DeviceConfig, DISCOVERY_PORT, QUEUE_TICK, SWEEP_TICK};
use crate::delivery::{backoff_delay, DeliveryEngine, DeliveryError, RetryScheduler};
use crate::discovery::{self, Announcer, PeerInfo};
use crate::friends::{FriendEngine, FriendError};
use crate::handlers::{HandlerContext, HandlerRegistry, Notifications};
use crate::plog;
use crate::protocol::{ContentType, Envelope, LocalIdentity};
use crate::storage::{
    FriendRequestRow, FriendRow, MessageRow, QueueEntry, SharedStorage, Storage, StorageError,
};
use crate::transport::{Server, TcpWire, TransportError, Wire};

#[derive(Debug)]
pub enum CoordinatorError {
    Transport(TransportError),
    Friend(FriendError),
    Delivery(DeliveryError),
    Store(StorageError),
    Io(std::io::Error),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Transport(e) => write!(f, "transport: {e}"),
            CoordinatorError::Friend(e) => write!(f, "friends: {e}"),
            CoordinatorError::Delivery(e) => write!(f, "delivery: {e}"),
            CoordinatorError::Store(e) => write!(f, "store: {e}"),
            CoordinatorError::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<TransportError> for CoordinatorError {
    fn from(e: TransportError) -> Self {
        CoordinatorError::Transport(e)
    }
}

impl From<FriendError> for CoordinatorError {
    fn from(e: FriendError) -> Self {
        CoordinatorError::Friend(e)
    }
}

impl From<DeliveryError> for CoordinatorError {
    fn from(e: DeliveryError) -> Self {
        CoordinatorError::Delivery(e)
    }
}

impl From<StorageError> for CoordinatorError {
    fn from(e: StorageError) -> Self {
        CoordinatorError::Store(e)
    }
}

impl From<std::io::Error> for CoordinatorError {
    fn from(e: std::io::Error) -> Self {
        CoordinatorError::Io(e)
    }
}

/// Answer to a pending friend request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Accept,
    Reject,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Deliver an acceptance notice, falling back to the retry queue when the
/// requester is unreachable so both sides still converge later.
pub fn send_accept_notice<W: Wire>(
    wire: &W,
    storage: &SharedStorage,
    identity: &LocalIdentity,
    friend: &FriendRow,
    now: u64,
) {
    let Some(addr) = friend.last_addr.clone() else {
        plog!("no address for {}, skipping acceptance notice", friend.device_id);
        return;
    };
    let port = friend.last_port.unwrap_or(crate::config::DEFAULT_PORT);
    let envelope = Envelope::friend_accepted(identity, now);
    match wire.send_envelope(&addr, port, &envelope) {
        Ok(()) => {}
        Err(e) if e.is_retryable() => {
            plog!("queuing acceptance notice for {}: {e}", friend.device_id);
            let entry = QueueEntry {
                message_id: envelope.message_id.clone(),
                to_device_id: friend.device_id.clone(),
                to_addr: addr,
                to_port: port,
                envelope: serde_json::to_string(&envelope).unwrap_or_default(),
                attempts: 1,
                next_retry_at: now + backoff_delay(0),
                last_error: Some(e.to_string()),
            };
            let store = storage.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = store.enqueue_entry(&entry) {
                plog!("could not queue acceptance notice: {e}");
            }
        }
        Err(e) => plog!("acceptance notice refused by {}: {e}", friend.device_id),
    }
}

pub struct SocialCoordinator {
    identity: LocalIdentity,
    storage: SharedStorage,
    friends: Arc<FriendEngine>,
    delivery: Arc<DeliveryEngine<TcpWire>>,
    registry: HandlerRegistry<TcpWire>,
    notifications: Notifications,
    queue: EventQueue,
    server: Server,
    announcer: Option<Announcer>,
    scheduler: RetryScheduler,
}

impl SocialCoordinator {
    /// Bind the listener, start the background threads and return the
    /// running subsystem. A bind failure is fatal; a discovery bind failure
    /// only disables the announcer.
    pub fn start(
        config: &DeviceConfig,
        storage: Storage,
        notifications: Notifications,
    ) -> Result<Self, CoordinatorError> {
        let storage = storage.into_shared();
        let (events, queue) = event_channel();

        let provisional =
            LocalIdentity::new(config.device_id.clone(), config.display_name.clone(), config.port);
        let server = Server::start(
            &format!("0.0.0.0:{}", config.port),
            provisional,
            events.clone(),
        )?;
        // The OS may have picked the port; advertise the real one.
        let identity = LocalIdentity::new(
            config.device_id.clone(),
            config.display_name.clone(),
            server.local_addr().port(),
        );

        let announcer = match Announcer::start(identity.clone(), DISCOVERY_PORT, events) {
            Ok(announcer) => Some(announcer),
            Err(e) => {
                plog!("discovery announcer disabled: {e}");
                None
            }
        };

        let friends = Arc::new(FriendEngine::new(
            Arc::clone(&storage),
            identity.device_id.clone(),
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            Arc::clone(&storage),
            TcpWire,
            identity.clone(),
        ));
        let scheduler = RetryScheduler::start(
            Arc::clone(&delivery),
            Arc::clone(&friends),
            QUEUE_TICK,
            SWEEP_TICK,
        )?;

        Ok(SocialCoordinator {
            identity,
            storage,
            friends,
            delivery,
            registry: HandlerRegistry::with_defaults(),
            notifications,
            queue,
            server,
            announcer,
            scheduler,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn listen_port(&self) -> u16 {
        self.server.local_addr().port()
    }

    // -----------------------------------------------------------------------
    // Friend operations
    // -----------------------------------------------------------------------

    /// Ask a discovered peer to become a friend.
    pub fn send_friend_request(&self, peer: &PeerInfo) -> Result<(), CoordinatorError> {
        let envelope = Envelope::friend_request(&self.identity, unix_now());
        TcpWire.send_envelope(&peer.addr, peer.port, &envelope)?;
        plog!(
            "friend request sent to {} ({})",
            crate::logging::device_id(&peer.device_id),
            peer.display_name
        );
        Ok(())
    }

    /// Accept or reject a pending request.
    ///
    /// On accept the friend row is committed first; the acceptance notice
    /// then goes out best-effort and falls back to the retry queue, so an
    /// unreachable requester still converges later.
    pub fn respond_to_request(
        &self,
        request_id: i64,
        response: Response,
    ) -> Result<(), CoordinatorError> {
        let now = unix_now();
        match response {
            Response::Reject => Ok(self.friends.reject(request_id, now)?),
            Response::Accept => {
                let outcome = self.friends.accept(request_id, now)?;
                if outcome.newly_accepted {
                    send_accept_notice(&TcpWire, &self.storage, &self.identity, &outcome.friend, now);
                }
                Ok(())
            }
        }
    }

    pub fn list_friends(&self) -> Result<Vec<FriendRow>, CoordinatorError> {
        Ok(self.friends.list_friends()?)
    }

    pub fn pending_requests(&self) -> Result<Vec<FriendRequestRow>, CoordinatorError> {
        Ok(self.friends.pending_requests(unix_now())?)
    }

    pub fn remove_friend(&self, device_id: &str) -> Result<bool, CoordinatorError> {
        Ok(self.friends.remove_friend(device_id)?)
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Queue a message to a friend. Returns its message id.
    pub fn send_message(
        &self,
        to_device_id: &str,
        content_type: ContentType,
        content: &str,
        category: Option<String>,
    ) -> Result<String, CoordinatorError> {
        Ok(self
            .delivery
            .send(to_device_id, content_type, content, category, unix_now())?)
    }

    pub fn conversation(
        &self,
        peer_device_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRow>, CoordinatorError> {
        Ok(self.delivery.conversation(peer_device_id, limit)?)
    }

    pub fn inbox(&self, limit: usize) -> Result<Vec<MessageRow>, CoordinatorError> {
        Ok(self.delivery.inbox(limit)?)
    }

    pub fn unread_count(&self) -> Result<usize, CoordinatorError> {
        Ok(self.delivery.unread_count()?)
    }

    pub fn mark_read(&self, message_id: &str) -> Result<bool, CoordinatorError> {
        Ok(self.delivery.mark_read(message_id, unix_now())?)
    }

    pub fn queue_len(&self) -> Result<usize, CoordinatorError> {
        Ok(self.delivery.queue_len()?)
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Probe the LAN and collect peers until the timeout.
    pub fn discover_peers(&self, timeout: Duration) -> Result<Vec<PeerInfo>, CoordinatorError> {
        Ok(discovery::discover(&self.identity, DISCOVERY_PORT, timeout)?)
    }

    // -----------------------------------------------------------------------
    // Event pump
    // -----------------------------------------------------------------------

    /// Drain the event bridge and dispatch on the caller's thread.
    ///
    /// The application loop must call this every tick; UI callbacks fire
    /// from inside. Returns the number of events handled.
    pub fn pump_events(&mut self) -> usize {
        let events = self.queue.drain();
        let count = events.len();
        let now = unix_now();
        for event in events {
            match event {
                NetEvent::Envelope {
                    envelope,
                    sender_addr,
                } => {
                    let mut ctx = HandlerContext {
                        friends: self.friends.as_ref(),
                        delivery: self.delivery.as_ref(),
                        notifications: &mut self.notifications,
                        now,
                    };
                    self.registry.dispatch(&envelope, &sender_addr, &mut ctx);
                }
                NetEvent::PeerSeen(peer) => {
                    let store = self.storage.lock().unwrap_or_else(|e| e.into_inner());
                    match store.update_friend_contact(&peer.device_id, &peer.addr, peer.port, now) {
                        Ok(true) => {}
                        Ok(false) => {} // not a friend, nothing to refresh
                        Err(e) => plog!("could not refresh {}: {e}", peer.device_id),
                    }
                }
            }
        }
        count
    }

    /// Stop all background threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        if let Some(announcer) = self.announcer.as_mut() {
            announcer.shutdown();
        }
        self.server.shutdown();
    }
}

impl Drop for SocialCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
