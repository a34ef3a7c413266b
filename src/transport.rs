//! TCP transport: one framed envelope per connection.
//!
//! The server accepts connections on a background thread, reads exactly one
//! frame from each, validates it, answers with an ack frame and hands the
//! envelope to the application thread through the event bridge. Sending
//! opens a fresh connection, writes one frame, half-closes the write side
//! and waits for the peer's ack.
//!
//! Delivery code depends on the [`Wire`] trait rather than on sockets so
//! failure behaviour can be scripted in tests.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::bridge::{EventSender, NetEvent};
use crate::config::{CONNECT_TIMEOUT, IO_TIMEOUT, MAX_ENVELOPE_BYTES};
use crate::plog;
use crate::protocol::{
    decode_frame, encode_frame, AckStatus, Envelope, EnvelopeError, EnvelopeKind, FrameError,
    LocalIdentity,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TransportError {
    /// Could not bind the listen socket. Fatal at startup.
    Bind(std::io::Error),
    /// Peer could not be reached. Retryable.
    Unreachable(std::io::Error),
    Io(std::io::Error),
    Frame(FrameError),
    Invalid(EnvelopeError),
    /// Peer acknowledged with `rejected`.
    Rejected,
    /// Peer closed without a usable ack.
    NoAck,
    BadAddress(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Bind(e) => write!(f, "bind failed: {e}"),
            TransportError::Unreachable(e) => write!(f, "peer unreachable: {e}"),
            TransportError::Io(e) => write!(f, "io error: {e}"),
            TransportError::Frame(e) => write!(f, "frame error: {e}"),
            TransportError::Invalid(e) => write!(f, "invalid envelope: {e}"),
            TransportError::Rejected => write!(f, "peer rejected envelope"),
            TransportError::NoAck => write!(f, "no ack from peer"),
            TransportError::BadAddress(addr) => write!(f, "bad address: {addr}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        TransportError::Frame(e)
    }
}

impl From<EnvelopeError> for TransportError {
    fn from(e: EnvelopeError) -> Self {
        TransportError::Invalid(e)
    }
}

impl TransportError {
    /// Whether a later retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::Io(_) | TransportError::NoAck
        )
    }
}

// ---------------------------------------------------------------------------
// Wire seam
// ---------------------------------------------------------------------------

/// Outbound side of the transport. Implemented over TCP in production and
/// by scripted fakes in tests.
pub trait Wire: Send + Sync {
    fn send_envelope(&self, addr: &str, port: u16, envelope: &Envelope)
        -> Result<(), TransportError>;
    fn probe(&self, addr: &str, port: u16) -> bool;
}

/// Production [`Wire`]: fresh TCP connection per envelope.
pub struct TcpWire;

impl Wire for TcpWire {
    fn send_envelope(
        &self,
        addr: &str,
        port: u16,
        envelope: &Envelope,
    ) -> Result<(), TransportError> {
        let target = resolve(addr, port)?;
        let mut stream =
            TcpStream::connect_timeout(&target, CONNECT_TIMEOUT).map_err(TransportError::Unreachable)?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .map_err(TransportError::Io)?;
        stream
            .set_write_timeout(Some(IO_TIMEOUT))
            .map_err(TransportError::Io)?;

        let frame = encode_frame(envelope)?;
        stream.write_all(&frame).map_err(TransportError::Io)?;
        // Half-close signals end-of-envelope; the ack still flows back.
        stream.shutdown(Shutdown::Write).map_err(TransportError::Io)?;

        let ack = read_one_frame(&mut stream)?;
        match (ack.kind, ack.ack_status) {
            (EnvelopeKind::Ack, Some(AckStatus::Received)) => Ok(()),
            (EnvelopeKind::Ack, Some(AckStatus::Rejected)) => Err(TransportError::Rejected),
            _ => Err(TransportError::NoAck),
        }
    }

    fn probe(&self, addr: &str, port: u16) -> bool {
        match resolve(addr, port) {
            Ok(target) => TcpStream::connect_timeout(&target, CONNECT_TIMEOUT).is_ok(),
            Err(_) => false,
        }
    }
}

fn resolve(addr: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (addr, port)
        .to_socket_addrs()
        .map_err(|_| TransportError::BadAddress(format!("{addr}:{port}")))?
        .next()
        .ok_or_else(|| TransportError::BadAddress(format!("{addr}:{port}")))
}

/// Read frames off a stream until one whole envelope decodes.
fn read_one_frame(stream: &mut TcpStream) -> Result<Envelope, TransportError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        match decode_frame(&buf) {
            Ok((envelope, _)) => return Ok(envelope),
            Err(FrameError::NeedMore) => {}
            Err(e) => return Err(e.into()),
        }
        let n = stream.read(&mut chunk).map_err(TransportError::Io)?;
        if n == 0 {
            return Err(TransportError::NoAck);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_ENVELOPE_BYTES + 4 {
            return Err(TransportError::Frame(FrameError::TooLarge {
                bytes: buf.len(),
            }));
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Listening side of the transport. One accept loop thread; one short-lived
/// handler thread per connection.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind and start accepting. Bind failure is fatal to the caller.
    pub fn start(
        bind_addr: &str,
        identity: LocalIdentity,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(bind_addr).map_err(TransportError::Bind)?;
        let local_addr = listener.local_addr().map_err(TransportError::Bind)?;
        listener.set_nonblocking(true).map_err(TransportError::Bind)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("petlink-accept".to_string())
            .spawn(move || accept_loop(listener, identity, events, stop))
            .map_err(TransportError::Io)?;

        plog!("listening on {local_addr}");
        Ok(Server {
            local_addr,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and wait for it to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    identity: LocalIdentity,
    events: EventSender,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let identity = identity.clone();
                let events = events.clone();
                let spawned = thread::Builder::new()
                    .name("petlink-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, peer_addr, &identity, &events) {
                            plog!("connection from {peer_addr} failed: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    plog!("could not spawn connection handler: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                plog!("accept failed: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    identity: &LocalIdentity,
    events: &EventSender,
) -> Result<(), TransportError> {
    // Some platforms hand out streams inheriting the listener's
    // non-blocking flag; reads must block up to the timeout.
    stream.set_nonblocking(false).map_err(TransportError::Io)?;
    stream
        .set_read_timeout(Some(IO_TIMEOUT))
        .map_err(TransportError::Io)?;
    stream
        .set_write_timeout(Some(IO_TIMEOUT))
        .map_err(TransportError::Io)?;

    let envelope = read_one_frame(&mut stream)?;
    let now = unix_now();

    if let Err(e) = envelope.validate() {
        plog!("rejecting envelope {} from {peer_addr}: {e}", envelope.message_id);
        let ack = Envelope::ack(identity, now, envelope.message_id.clone(), AckStatus::Rejected);
        let _ = stream.write_all(&encode_frame(&ack)?);
        let _ = stream.shutdown(Shutdown::Both);
        return Err(e.into());
    }

    let ack = Envelope::ack(identity, now, envelope.message_id.clone(), AckStatus::Received);
    stream
        .write_all(&encode_frame(&ack)?)
        .map_err(TransportError::Io)?;
    let _ = stream.shutdown(Shutdown::Both);

    // Channel closure means the application is gone; nothing left to do.
    let _ = events.send(NetEvent::Envelope {
        envelope,
        sender_addr: peer_addr.ip().to_string(),
    });
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
