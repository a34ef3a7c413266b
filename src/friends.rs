//! Friend request state machine.
//!
//! Requests arrive over the wire, sit as `pending` rows, and reach a
//! terminal state through accept, reject or the periodic expiry sweep.
//! Friendship is established independently on each side: the acceptor
//! inserts its friend row inside the accept transaction, the original
//! requester inserts its own when the acceptance notice arrives.
//! Network side effects (sending the acceptance notice) belong to the
//! coordinator, not this engine.

use std::sync::MutexGuard;

use crate::config::{DEFAULT_PORT, FRIEND_REQUEST_TTL_SECS, MAX_FRIENDS};
use crate::plog;
use crate::protocol::Envelope;
use crate::storage::{
    FriendRequestRow, FriendRow, RequestStatus, SharedStorage, Storage, StorageError,
};

#[derive(Debug)]
pub enum FriendError {
    NotFound(i64),
    /// The request passed its expiry window before it was accepted.
    Expired(i64),
    /// Accept or reject on a request already in a terminal state.
    AlreadyResolved { id: i64, status: RequestStatus },
    /// The friend list is full.
    LimitReached,
    Store(StorageError),
}

impl std::fmt::Display for FriendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FriendError::NotFound(id) => write!(f, "friend request {id} not found"),
            FriendError::Expired(id) => write!(f, "friend request {id} expired"),
            FriendError::AlreadyResolved { id, status } => {
                write!(f, "friend request {id} already {}", status.as_str())
            }
            FriendError::LimitReached => write!(f, "friend limit reached ({MAX_FRIENDS})"),
            FriendError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for FriendError {}

impl From<StorageError> for FriendError {
    fn from(e: StorageError) -> Self {
        FriendError::Store(e)
    }
}

/// Result of [`FriendEngine::accept`].
#[derive(Debug)]
pub struct AcceptOutcome {
    pub friend: FriendRow,
    /// False when the request had already been accepted, so the caller must
    /// not send another acceptance notice.
    pub newly_accepted: bool,
}

pub struct FriendEngine {
    storage: SharedStorage,
    device_id: String,
}

impl FriendEngine {
    pub fn new(storage: SharedStorage, device_id: impl Into<String>) -> Self {
        Self {
            storage,
            device_id: device_id.into(),
        }
    }

    fn store(&self) -> MutexGuard<'_, Storage> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an inbound friend request envelope.
    ///
    /// Returns `Ok(None)` when nothing new was recorded: the request came
    /// from ourselves or from an existing friend. A repeat request from the
    /// same pending sender refreshes the stored row in place.
    pub fn receive_request(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        now: u64,
    ) -> Result<Option<FriendRequestRow>, FriendError> {
        if envelope.from_device_id == self.device_id {
            plog!("ignoring friend request from self");
            return Ok(None);
        }
        let (addr, port) = envelope.reply_addr(sender_addr, DEFAULT_PORT);
        let store = self.store();
        if store.is_friend(&envelope.from_device_id)? {
            store.update_friend_contact(&envelope.from_device_id, &addr, port, now)?;
            return Ok(None);
        }
        let row = store.upsert_pending_request(
            &envelope.from_device_id,
            &envelope.from_display_name,
            &addr,
            port,
            now,
            now + FRIEND_REQUEST_TTL_SECS,
        )?;
        plog!(
            "friend request from {} ({})",
            crate::logging::device_id(&row.from_device_id),
            row.from_display_name
        );
        Ok(Some(row))
    }

    /// Accept a pending request and create the friend row.
    ///
    /// Idempotent for already-accepted requests. Overdue requests are swept
    /// to expired instead of accepted.
    pub fn accept(&self, id: i64, now: u64) -> Result<AcceptOutcome, FriendError> {
        let store = self.store();
        store.sweep_expired(now)?;
        let request = store
            .get_request(id)?
            .ok_or(FriendError::NotFound(id))?;
        match request.status {
            RequestStatus::Pending => {}
            RequestStatus::Accepted => {
                return Ok(AcceptOutcome {
                    friend: store.accept_request_tx(id, now)?,
                    newly_accepted: false,
                })
            }
            RequestStatus::Expired => return Err(FriendError::Expired(id)),
            RequestStatus::Rejected => {
                return Err(FriendError::AlreadyResolved {
                    id,
                    status: request.status,
                })
            }
        }
        if store.friend_count()? >= MAX_FRIENDS {
            return Err(FriendError::LimitReached);
        }
        Ok(AcceptOutcome {
            friend: store.accept_request_tx(id, now)?,
            newly_accepted: true,
        })
    }

    /// Mark a pending request rejected. No network side effect.
    pub fn reject(&self, id: i64, now: u64) -> Result<(), FriendError> {
        let store = self.store();
        if store.mark_request_rejected(id, now)? {
            return Ok(());
        }
        match store.get_request(id)? {
            None => Err(FriendError::NotFound(id)),
            Some(request) => Err(FriendError::AlreadyResolved {
                id,
                status: request.status,
            }),
        }
    }

    /// Transition overdue pending requests to expired.
    pub fn sweep_expired(&self, now: u64) -> Result<usize, FriendError> {
        Ok(self.store().sweep_expired(now)?)
    }

    /// The peer we asked accepted: record them as a friend on our side.
    ///
    /// Idempotent: an already-known friend just gets its contact info
    /// refreshed, so replayed acceptance notices never duplicate rows.
    pub fn handle_accept_notice(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        now: u64,
    ) -> Result<FriendRow, FriendError> {
        let (addr, port) = envelope.reply_addr(sender_addr, DEFAULT_PORT);
        let store = self.store();
        if let Some(existing) = store.get_friend(&envelope.from_device_id)? {
            store.update_friend_contact(&existing.device_id, &addr, port, now)?;
            return store
                .get_friend(&existing.device_id)?
                .ok_or(FriendError::Store(StorageError::NotFound(
                    existing.device_id,
                )));
        }
        if store.friend_count()? >= MAX_FRIENDS {
            return Err(FriendError::LimitReached);
        }
        let row = FriendRow {
            device_id: envelope.from_device_id.clone(),
            display_name: envelope.from_display_name.clone(),
            last_addr: Some(addr),
            last_port: Some(port),
            last_seen: Some(now),
            established_at: now,
        };
        store.insert_friend(&row)?;
        plog!(
            "now friends with {} ({})",
            crate::logging::device_id(&row.device_id),
            row.display_name
        );
        Ok(row)
    }

    /// Pending requests after sweeping the overdue ones.
    pub fn pending_requests(&self, now: u64) -> Result<Vec<FriendRequestRow>, FriendError> {
        let store = self.store();
        store.sweep_expired(now)?;
        Ok(store.list_requests(Some(RequestStatus::Pending))?)
    }

    pub fn list_friends(&self) -> Result<Vec<FriendRow>, FriendError> {
        Ok(self.store().list_friends()?)
    }

    pub fn is_friend(&self, device_id: &str) -> Result<bool, FriendError> {
        Ok(self.store().is_friend(device_id)?)
    }

    pub fn remove_friend(&self, device_id: &str) -> Result<bool, FriendError> {
        Ok(self.store().remove_friend(device_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::LocalIdentity;
    use crate::storage::Storage;

    fn engine() -> FriendEngine {
        let storage = Storage::open_in_memory().unwrap().into_shared();
        FriendEngine::new(storage, "device-me")
    }

    fn request_envelope(name: &str) -> Envelope {
        let identity = LocalIdentity::new(format!("device-{name}"), name.to_string(), 5199);
        Envelope::friend_request(&identity, 100)
    }

    #[test]
    fn request_from_self_ignored() {
        let engine = engine();
        let identity = LocalIdentity::new("device-me", "Me", 5199);
        let envelope = Envelope::friend_request(&identity, 100);
        assert!(engine
            .receive_request(&envelope, "10.0.0.2", 100)
            .unwrap()
            .is_none());
        assert!(engine.pending_requests(100).unwrap().is_empty());
    }

    #[test]
    fn accept_flow_creates_friend_once() {
        let engine = engine();
        let row = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        let outcome = engine.accept(row.id, 150).unwrap();
        assert!(outcome.newly_accepted);
        assert_eq!(outcome.friend.device_id, "device-peer");
        assert!(engine.is_friend("device-peer").unwrap());

        // Repeat accept is a no-op returning the same friend.
        let again = engine.accept(row.id, 200).unwrap();
        assert!(!again.newly_accepted);
        assert_eq!(again.friend.device_id, "device-peer");
        assert_eq!(engine.list_friends().unwrap().len(), 1);
    }

    #[test]
    fn request_from_existing_friend_not_recorded() {
        let engine = engine();
        let row = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        engine.accept(row.id, 150).unwrap();
        assert!(engine
            .receive_request(&request_envelope("peer"), "10.0.0.9", 200)
            .unwrap()
            .is_none());
        // Contact info still refreshed from the new request.
        let friends = engine.list_friends().unwrap();
        assert_eq!(friends[0].last_addr.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn removal_allows_a_fresh_request() {
        let engine = engine();
        let row = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        engine.accept(row.id, 150).unwrap();
        assert!(engine.remove_friend("device-peer").unwrap());

        let revived = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 200)
            .unwrap()
            .unwrap();
        assert_eq!(revived.status, RequestStatus::Pending);
        let outcome = engine.accept(revived.id, 250).unwrap();
        assert!(outcome.newly_accepted);
        assert!(engine.is_friend("device-peer").unwrap());
    }

    #[test]
    fn overdue_request_expires_instead_of_accepting() {
        let engine = engine();
        let row = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        let too_late = row.expires_at + 1;
        assert!(matches!(
            engine.accept(row.id, too_late),
            Err(FriendError::Expired(_))
        ));
        assert!(!engine.is_friend("device-peer").unwrap());
        assert!(engine.pending_requests(too_late).unwrap().is_empty());
    }

    #[test]
    fn reject_is_terminal() {
        let engine = engine();
        let row = engine
            .receive_request(&request_envelope("peer"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        engine.reject(row.id, 150).unwrap();
        assert!(matches!(
            engine.accept(row.id, 200),
            Err(FriendError::AlreadyResolved { .. })
        ));
        assert!(matches!(
            engine.reject(row.id, 200),
            Err(FriendError::AlreadyResolved { .. })
        ));
    }

    #[test]
    fn friend_limit_enforced_at_accept() {
        let engine = engine();
        for i in 0..MAX_FRIENDS {
            let row = engine
                .receive_request(&request_envelope(&format!("peer{i}")), "10.0.0.2", 100)
                .unwrap()
                .unwrap();
            engine.accept(row.id, 150).unwrap();
        }
        let row = engine
            .receive_request(&request_envelope("overflow"), "10.0.0.2", 100)
            .unwrap()
            .unwrap();
        assert!(matches!(
            engine.accept(row.id, 150),
            Err(FriendError::LimitReached)
        ));
    }

    #[test]
    fn accept_notice_converges_both_sides() {
        let engine = engine();
        let identity = LocalIdentity::new("device-peer", "Peer", 5199);
        let notice = Envelope::friend_accepted(&identity, 100);
        let friend = engine.handle_accept_notice(&notice, "10.0.0.2", 100).unwrap();
        assert_eq!(friend.device_id, "device-peer");

        // Replayed notice refreshes instead of duplicating.
        let again = engine.handle_accept_notice(&notice, "10.0.0.3", 200).unwrap();
        assert_eq!(again.last_addr.as_deref(), Some("10.0.0.3"));
        assert_eq!(engine.list_friends().unwrap().len(), 1);
    }
}
