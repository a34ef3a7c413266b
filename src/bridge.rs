//! Hand-off between network threads and the application loop.
//!
//! Transport and discovery threads push events here; the application drains
//! them once per tick from its own thread, so all state mutation and UI
//! callbacks run on the caller's thread. The channel is unbounded and FIFO,
//! so no event is dropped and ordering from a single producer is preserved.

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::discovery::PeerInfo;
use crate::protocol::Envelope;

/// An event produced by a network thread.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A validated envelope arrived; `sender_addr` is the observed peer IP.
    Envelope {
        envelope: Envelope,
        sender_addr: String,
    },
    /// A peer announced itself on the local network.
    PeerSeen(PeerInfo),
}

pub type EventSender = Sender<NetEvent>;

/// Consumer side of the bridge, owned by the application loop.
pub struct EventQueue {
    rx: Receiver<NetEvent>,
}

impl EventQueue {
    /// Take everything currently queued without blocking.
    pub fn drain(&self) -> Vec<NetEvent> {
        self.rx.try_iter().collect()
    }
}

pub fn event_channel() -> (EventSender, EventQueue) {
    let (tx, rx) = channel();
    (tx, EventQueue { rx })
}
