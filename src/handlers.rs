//! Per-kind envelope dispatch.
//!
//! Every validated envelope drained from the bridge passes through the
//! [`HandlerRegistry`]: one handler per [`EnvelopeKind`], each encapsulating
//! the persistence for its kind and firing the matching UI callback.
//! Unknown kinds are logged and dropped rather than treated as errors, so
//! newer peers can speak to older devices.
//!
//! Application-specific side effects (screen updates, sounds) belong in the
//! [`Notifications`] callbacks, not in new handlers.

use std::collections::HashMap;

use crate::delivery::DeliveryEngine;
use crate::friends::FriendEngine;
use crate::plog;
use crate::protocol::{Envelope, EnvelopeKind};
use crate::storage::{FriendRequestRow, FriendRow, MessageRow};
use crate::transport::Wire;

/// UI callbacks fired from `pump_events` on the application thread.
#[derive(Default)]
pub struct Notifications {
    pub on_friend_request: Option<Box<dyn FnMut(&FriendRequestRow) + Send>>,
    pub on_request_accepted: Option<Box<dyn FnMut(&FriendRow) + Send>>,
    pub on_message: Option<Box<dyn FnMut(&MessageRow) + Send>>,
}

/// Everything a handler may touch while processing one envelope.
pub struct HandlerContext<'a, W: Wire> {
    pub friends: &'a FriendEngine,
    pub delivery: &'a DeliveryEngine<W>,
    pub notifications: &'a mut Notifications,
    pub now: u64,
}

/// Processes envelopes of a single kind.
pub trait EnvelopeHandler<W: Wire>: Send {
    /// Returns `true` when the envelope changed local state.
    fn handle(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        ctx: &mut HandlerContext<'_, W>,
    ) -> bool;
}

pub struct HandlerRegistry<W: Wire> {
    handlers: HashMap<EnvelopeKind, Box<dyn EnvelopeHandler<W>>>,
}

impl<W: Wire> HandlerRegistry<W> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the standard protocol handlers installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EnvelopeKind::FriendRequest, Box::new(FriendRequestHandler));
        registry.register(
            EnvelopeKind::FriendRequestAccepted,
            Box::new(FriendAcceptedHandler),
        );
        registry.register(EnvelopeKind::Message, Box::new(ChatMessageHandler));
        registry
    }

    pub fn register(&mut self, kind: EnvelopeKind, handler: Box<dyn EnvelopeHandler<W>>) {
        self.handlers.insert(kind, handler);
    }

    /// Route one envelope to at most one handler.
    pub fn dispatch(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        ctx: &mut HandlerContext<'_, W>,
    ) -> bool {
        match self.handlers.get(&envelope.kind) {
            Some(handler) => handler.handle(envelope, sender_addr, ctx),
            None => {
                plog!(
                    "no handler for {} envelope {}",
                    envelope.kind.as_str(),
                    crate::logging::msg_id(&envelope.message_id)
                );
                false
            }
        }
    }
}

impl<W: Wire> Default for HandlerRegistry<W> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Standard handlers
// ---------------------------------------------------------------------------

pub struct FriendRequestHandler;

impl<W: Wire> EnvelopeHandler<W> for FriendRequestHandler {
    fn handle(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        ctx: &mut HandlerContext<'_, W>,
    ) -> bool {
        match ctx.friends.receive_request(envelope, sender_addr, ctx.now) {
            Ok(Some(row)) => {
                if let Some(cb) = ctx.notifications.on_friend_request.as_mut() {
                    cb(&row);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                plog!("friend request rejected: {e}");
                false
            }
        }
    }
}

pub struct FriendAcceptedHandler;

impl<W: Wire> EnvelopeHandler<W> for FriendAcceptedHandler {
    fn handle(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        ctx: &mut HandlerContext<'_, W>,
    ) -> bool {
        match ctx.friends.handle_accept_notice(envelope, sender_addr, ctx.now) {
            Ok(friend) => {
                if let Some(cb) = ctx.notifications.on_request_accepted.as_mut() {
                    cb(&friend);
                }
                true
            }
            Err(e) => {
                plog!("acceptance notice dropped: {e}");
                false
            }
        }
    }
}

pub struct ChatMessageHandler;

impl<W: Wire> EnvelopeHandler<W> for ChatMessageHandler {
    fn handle(
        &self,
        envelope: &Envelope,
        sender_addr: &str,
        ctx: &mut HandlerContext<'_, W>,
    ) -> bool {
        match ctx.delivery.receive(envelope, sender_addr, ctx.now) {
            Ok(Some(row)) => {
                if let Some(cb) = ctx.notifications.on_message.as_mut() {
                    cb(&row);
                }
                true
            }
            Ok(None) => false, // duplicate
            Err(e) => {
                plog!("message dropped: {e}");
                false
            }
        }
    }
}
