//! End-to-end flows between two coordinators over loopback TCP.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use petlink::config::DeviceConfig;
use petlink::coordinator::{Response, SocialCoordinator};
use petlink::discovery::PeerInfo;
use petlink::handlers::Notifications;
use petlink::protocol::ContentType;
use petlink::storage::Storage;

#[derive(Default)]
struct Seen {
    requests: Vec<String>,
    accepted: Vec<String>,
    messages: Vec<String>,
}

struct Node {
    coordinator: SocialCoordinator,
    seen: Arc<Mutex<Seen>>,
    device_id: String,
}

fn node(name: &str) -> Node {
    let config = DeviceConfig {
        device_id: format!("device-{name}"),
        display_name: name.to_string(),
        port: 0, // let the OS pick a loopback port
    };
    let seen: Arc<Mutex<Seen>> = Arc::default();
    let (req, acc, msg) = (Arc::clone(&seen), Arc::clone(&seen), Arc::clone(&seen));
    let notifications = Notifications {
        on_friend_request: Some(Box::new(move |row| {
            req.lock().unwrap().requests.push(row.from_device_id.clone());
        })),
        on_request_accepted: Some(Box::new(move |friend| {
            acc.lock().unwrap().accepted.push(friend.device_id.clone());
        })),
        on_message: Some(Box::new(move |message| {
            msg.lock().unwrap().messages.push(message.content.clone());
        })),
    };
    let storage = Storage::open_in_memory().unwrap();
    let coordinator = SocialCoordinator::start(&config, storage, notifications).unwrap();
    Node {
        coordinator,
        seen,
        device_id: config.device_id,
    }
}

fn peer_info(target: &Node) -> PeerInfo {
    PeerInfo {
        device_id: target.device_id.clone(),
        display_name: target.device_id.clone(),
        addr: "127.0.0.1".to_string(),
        port: target.coordinator.listen_port(),
    }
}

/// Pump until `done` returns true or the deadline passes.
fn pump_until(node: &mut Node, done: impl Fn(&Node) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        node.coordinator.pump_events();
        if done(node) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn friend_request_accept_and_message_flow() {
    let mut alice = node("alice");
    let mut bob = node("bob");

    // Alice asks Bob.
    alice.coordinator.send_friend_request(&peer_info(&bob)).unwrap();
    assert!(pump_until(&mut bob, |n| {
        !n.seen.lock().unwrap().requests.is_empty()
    }));
    assert_eq!(
        bob.seen.lock().unwrap().requests.as_slice(),
        ["device-alice"]
    );

    // Bob accepts; the notice flows back to Alice.
    let pending = bob.coordinator.pending_requests().unwrap();
    assert_eq!(pending.len(), 1);
    bob.coordinator
        .respond_to_request(pending[0].id, Response::Accept)
        .unwrap();
    assert!(pump_until(&mut alice, |n| {
        !n.seen.lock().unwrap().accepted.is_empty()
    }));
    assert!(alice
        .coordinator
        .list_friends()
        .unwrap()
        .iter()
        .any(|f| f.device_id == "device-bob"));
    assert!(bob
        .coordinator
        .list_friends()
        .unwrap()
        .iter()
        .any(|f| f.device_id == "device-alice"));

    // Now a chat message, delivered and surfaced via the callback.
    let id = alice
        .coordinator
        .send_message("device-bob", ContentType::Text, "hi bob!", None)
        .unwrap();
    assert!(pump_until(&mut bob, |n| {
        !n.seen.lock().unwrap().messages.is_empty()
    }));
    assert_eq!(bob.seen.lock().unwrap().messages.as_slice(), ["hi bob!"]);
    assert_eq!(bob.coordinator.unread_count().unwrap(), 1);

    // Delivered immediately, nothing left queued on Alice's side.
    assert_eq!(alice.coordinator.queue_len().unwrap(), 0);
    let sent = alice.coordinator.conversation("device-bob", 10).unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, id);

    // Read receipt is local to Bob.
    let inbox = bob.coordinator.inbox(10).unwrap();
    assert!(bob.coordinator.mark_read(&inbox[0].message_id).unwrap());
    assert_eq!(bob.coordinator.unread_count().unwrap(), 0);

    alice.coordinator.shutdown();
    bob.coordinator.shutdown();
}

#[test]
fn message_to_stranger_rejected_without_state() {
    let alice = node("alice");
    let err = alice
        .coordinator
        .send_message("device-nobody", ContentType::Text, "hi", None)
        .unwrap_err();
    assert!(format!("{err}").contains("not friends"));
    assert_eq!(alice.coordinator.queue_len().unwrap(), 0);
}

#[test]
fn rejecting_a_request_sends_nothing_back() {
    let mut alice = node("alice");
    let mut bob = node("bob");

    alice.coordinator.send_friend_request(&peer_info(&bob)).unwrap();
    assert!(pump_until(&mut bob, |n| {
        !n.seen.lock().unwrap().requests.is_empty()
    }));

    let pending = bob.coordinator.pending_requests().unwrap();
    bob.coordinator
        .respond_to_request(pending[0].id, Response::Reject)
        .unwrap();

    // Alice never hears back and neither side has a friend row.
    assert!(!pump_until(&mut alice, |n| {
        !n.seen.lock().unwrap().accepted.is_empty()
    }));
    assert!(alice.coordinator.list_friends().unwrap().is_empty());
    assert!(bob.coordinator.list_friends().unwrap().is_empty());

    alice.coordinator.shutdown();
    bob.coordinator.shutdown();
}
