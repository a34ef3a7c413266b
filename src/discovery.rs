//! LAN discovery over UDP multicast.
//!
//! Each device runs an [`Announcer`] that beacons its presence to the
//! multicast group and answers probe datagrams directly. [`discover`] sends
//! one probe and collects distinct announces until its deadline. Datagrams
//! are small JSON objects tagged by `kind`.
//!
//! Multicast join failures are logged but not fatal: unicast probes and
//! replies still work on networks that block multicast.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::bridge::{EventSender, NetEvent};
use crate::config::{ANNOUNCE_INTERVAL, DISCOVERY_GROUP, SERVICE_NAME};
use crate::plog;
use crate::protocol::LocalIdentity;

const RECV_BUF_BYTES: usize = 2048;
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// A peer seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub device_id: String,
    pub display_name: String,
    pub addr: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Datagram {
    Probe {
        device_id: String,
    },
    Announce {
        service: String,
        device_id: String,
        display_name: String,
        port: u16,
    },
}

fn group_addr(discovery_port: u16) -> SocketAddr {
    // DISCOVERY_GROUP is a compile-time constant and always parses.
    let group: Ipv4Addr = DISCOVERY_GROUP.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
    SocketAddr::from((group, discovery_port))
}

fn announce_bytes(identity: &LocalIdentity) -> Vec<u8> {
    serde_json::to_vec(&Datagram::Announce {
        service: SERVICE_NAME.to_string(),
        device_id: identity.device_id.clone(),
        display_name: identity.display_name.clone(),
        port: identity.port,
    })
    .unwrap_or_default()
}

fn open_socket(bind_port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", bind_port))?;
    socket.set_multicast_ttl_v4(1)?;
    if let Ok(group) = DISCOVERY_GROUP.parse::<Ipv4Addr>() {
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            plog!("multicast join failed, unicast only: {e}");
        }
    }
    socket.set_read_timeout(Some(POLL_TIMEOUT))?;
    Ok(socket)
}

// ---------------------------------------------------------------------------
// Announcer
// ---------------------------------------------------------------------------

/// Background presence beacon and probe responder.
pub struct Announcer {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Announcer {
    pub fn start(
        identity: LocalIdentity,
        discovery_port: u16,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let socket = open_socket(discovery_port)?;
        let local_port = socket.local_addr()?.port();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("petlink-announce".to_string())
            .spawn(move || announce_loop(socket, identity, discovery_port, events, stop))?;
        Ok(Announcer {
            local_port,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn announce_loop(
    socket: UdpSocket,
    identity: LocalIdentity,
    discovery_port: u16,
    events: EventSender,
    shutdown: Arc<AtomicBool>,
) {
    let announce = announce_bytes(&identity);
    let group = group_addr(discovery_port);
    let mut buf = [0u8; RECV_BUF_BYTES];
    let mut last_beacon: Option<Instant> = None;

    while !shutdown.load(Ordering::SeqCst) {
        if last_beacon.map_or(true, |t| t.elapsed() >= ANNOUNCE_INTERVAL) {
            let _ = socket.send_to(&announce, group);
            last_beacon = Some(Instant::now());
        }
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                plog!("discovery recv failed: {e}");
                continue;
            }
        };
        match serde_json::from_slice::<Datagram>(&buf[..n]) {
            Ok(Datagram::Probe { device_id }) if device_id != identity.device_id => {
                let _ = socket.send_to(&announce, from);
            }
            Ok(Datagram::Announce {
                service,
                device_id,
                display_name,
                port,
            }) if service == SERVICE_NAME && device_id != identity.device_id => {
                let _ = events.send(NetEvent::PeerSeen(PeerInfo {
                    device_id,
                    display_name,
                    addr: from.ip().to_string(),
                    port,
                }));
            }
            Ok(_) => {} // our own datagram looped back
            Err(e) => plog!("dropping malformed discovery datagram from {from}: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Active discovery
// ---------------------------------------------------------------------------

/// Probe the group and collect distinct peers until the deadline.
pub fn discover(
    identity: &LocalIdentity,
    discovery_port: u16,
    timeout: Duration,
) -> std::io::Result<Vec<PeerInfo>> {
    let socket = open_socket(0)?;
    let probe = serde_json::to_vec(&Datagram::Probe {
        device_id: identity.device_id.clone(),
    })
    .unwrap_or_default();
    socket.send_to(&probe, group_addr(discovery_port))?;
    Ok(collect_announces(&socket, identity, Instant::now() + timeout))
}

fn collect_announces(
    socket: &UdpSocket,
    identity: &LocalIdentity,
    deadline: Instant,
) -> Vec<PeerInfo> {
    let mut peers: Vec<PeerInfo> = Vec::new();
    let mut buf = [0u8; RECV_BUF_BYTES];
    while Instant::now() < deadline {
        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(_) => continue,
        };
        if let Ok(Datagram::Announce {
            service,
            device_id,
            display_name,
            port,
        }) = serde_json::from_slice::<Datagram>(&buf[..n])
        {
            if service != SERVICE_NAME || device_id == identity.device_id {
                continue;
            }
            if peers.iter().any(|p| p.device_id == device_id) {
                continue;
            }
            peers.push(PeerInfo {
                device_id,
                display_name,
                addr: from.ip().to_string(),
                port,
            });
        }
    }
    peers
}
