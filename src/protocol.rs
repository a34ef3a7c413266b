//! Petlink wire protocol types.
//!
//! ## Spec summary
//! - Envelopes are serialized as JSON and framed with a 4-byte big-endian
//!   length prefix; one envelope per connection.
//! - Message IDs are derived from canonical content bytes plus a random salt
//!   and encoded as URL-safe base64 without padding.
//! - `Envelope` is self-describing via its `kind` tag; unknown kinds
//!   deserialize into `EnvelopeKind::Unknown` so receivers can log and drop
//!   them without failing the whole frame (forward compatibility).
//! - A single `Ack` frame answers every delivered envelope.
//!
//! These types are intentionally small and self-contained so they can be
//! reused across the transport layer and the storage backend.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{MAX_CONTENT_CHARS, MAX_ENVELOPE_BYTES};

/// Supported protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Types of envelopes exchanged between devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    FriendRequest,
    FriendRequestAccepted,
    Message,
    Ack,
    /// Any kind this build does not know about. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::FriendRequest => "friend_request",
            EnvelopeKind::FriendRequestAccepted => "friend_request_accepted",
            EnvelopeKind::Message => "message",
            EnvelopeKind::Ack => "ack",
            EnvelopeKind::Unknown => "unknown",
        }
    }
}

/// Content types a chat message may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Emoji,
    Preset,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Emoji => "emoji",
            ContentType::Preset => "preset",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ContentType::Text),
            "emoji" => Some(ContentType::Emoji),
            "preset" => Some(ContentType::Preset),
            _ => None,
        }
    }
}

/// Delivery status carried in an ack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Rejected,
}

/// A single unit exchanged between devices.
///
/// `from_addr`/`from_port` advertise where the sender can be reached for the
/// reply path; receivers fall back to the observed socket address when the
/// advertised one is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Envelope {
    pub version: u32,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub message_id: String,
    pub from_device_id: String,
    pub from_display_name: String,
    #[serde(default, rename = "from_address")]
    pub from_addr: Option<String>,
    #[serde(default)]
    pub from_port: Option<u16>,
    pub timestamp: u64,
    // Message-kind fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    // Ack-kind fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_status: Option<AckStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    UnsupportedVersion(u32),
    MissingField(&'static str),
    ContentTooLong { chars: usize },
    EmptyContent,
    InvalidKind,
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::UnsupportedVersion(v) => write!(f, "unsupported version: {v}"),
            EnvelopeError::MissingField(name) => write!(f, "missing field: {name}"),
            EnvelopeError::ContentTooLong { chars } => {
                write!(f, "content too long: {chars} chars (max {MAX_CONTENT_CHARS})")
            }
            EnvelopeError::EmptyContent => write!(f, "content is empty"),
            EnvelopeError::InvalidKind => write!(f, "invalid envelope kind"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Sending-side identity stamped onto every outgoing envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub device_id: String,
    pub display_name: String,
    pub addr: Option<String>,
    pub port: u16,
}

impl LocalIdentity {
    pub fn new(
        device_id: impl Into<String>,
        display_name: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            display_name: display_name.into(),
            addr: None,
            port,
        }
    }
}

/// Compute a message id from content bytes plus a random salt.
pub fn new_message_id(sender_id: &str, timestamp: u64, content: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update(timestamp.to_le_bytes());
    hasher.update(content.as_bytes());
    hasher.update(salt);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

impl Envelope {
    fn base(kind: EnvelopeKind, identity: &LocalIdentity, timestamp: u64) -> Self {
        Envelope {
            version: PROTOCOL_VERSION,
            kind,
            message_id: new_message_id(&identity.device_id, timestamp, kind.as_str()),
            from_device_id: identity.device_id.clone(),
            from_display_name: identity.display_name.clone(),
            from_addr: identity.addr.clone(),
            from_port: Some(identity.port),
            timestamp,
            content_type: None,
            content: None,
            category: None,
            ack_message_id: None,
            ack_status: None,
        }
    }

    /// Build a friend request envelope.
    pub fn friend_request(identity: &LocalIdentity, timestamp: u64) -> Self {
        Self::base(EnvelopeKind::FriendRequest, identity, timestamp)
    }

    /// Build a friend-request acceptance notice.
    pub fn friend_accepted(identity: &LocalIdentity, timestamp: u64) -> Self {
        Self::base(EnvelopeKind::FriendRequestAccepted, identity, timestamp)
    }

    /// Build a chat message envelope.
    pub fn chat_message(
        identity: &LocalIdentity,
        timestamp: u64,
        content_type: ContentType,
        content: impl Into<String>,
        category: Option<String>,
    ) -> Self {
        let content = content.into();
        let mut envelope = Self::base(EnvelopeKind::Message, identity, timestamp);
        envelope.message_id = new_message_id(&identity.device_id, timestamp, &content);
        envelope.content_type = Some(content_type);
        envelope.content = Some(content);
        envelope.category = category;
        envelope
    }

    /// Build an acknowledgment frame for a delivered envelope.
    pub fn ack(
        identity: &LocalIdentity,
        timestamp: u64,
        ack_message_id: impl Into<String>,
        status: AckStatus,
    ) -> Self {
        let mut envelope = Self::base(EnvelopeKind::Ack, identity, timestamp);
        envelope.ack_message_id = Some(ack_message_id.into());
        envelope.ack_status = Some(status);
        envelope
    }

    /// Validate version and kind-specific required fields.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != PROTOCOL_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        if self.message_id.is_empty() {
            return Err(EnvelopeError::MissingField("message_id"));
        }
        if self.from_device_id.is_empty() {
            return Err(EnvelopeError::MissingField("from_device_id"));
        }
        match self.kind {
            EnvelopeKind::Message => {
                if self.content_type.is_none() {
                    return Err(EnvelopeError::MissingField("content_type"));
                }
                let content = self
                    .content
                    .as_deref()
                    .ok_or(EnvelopeError::MissingField("content"))?;
                if content.trim().is_empty() {
                    return Err(EnvelopeError::EmptyContent);
                }
                let chars = content.chars().count();
                if chars > MAX_CONTENT_CHARS {
                    return Err(EnvelopeError::ContentTooLong { chars });
                }
                Ok(())
            }
            EnvelopeKind::Ack => {
                if self.ack_message_id.is_none() {
                    return Err(EnvelopeError::MissingField("ack_message_id"));
                }
                if self.ack_status.is_none() {
                    return Err(EnvelopeError::MissingField("ack_status"));
                }
                Ok(())
            }
            EnvelopeKind::FriendRequest | EnvelopeKind::FriendRequestAccepted => Ok(()),
            EnvelopeKind::Unknown => Err(EnvelopeError::InvalidKind),
        }
    }

    /// Reply-path address for this envelope, preferring the advertised one.
    pub fn reply_addr(&self, observed_ip: &str, default_port: u16) -> (String, u16) {
        let addr = self
            .from_addr
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| observed_ip.to_string());
        let port = self.from_port.unwrap_or(default_port);
        (addr, port)
    }
}

// ---------------------------------------------------------------------------
// Framing: 4-byte big-endian length prefix + JSON body
// ---------------------------------------------------------------------------

const LEN_SIZE: usize = 4;

#[derive(Debug)]
pub enum FrameError {
    /// The buffer does not hold a complete frame yet.
    NeedMore,
    /// Declared or actual size exceeds [`MAX_ENVELOPE_BYTES`].
    TooLarge { bytes: usize },
    /// The body is not a valid envelope.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::NeedMore => write!(f, "incomplete frame"),
            FrameError::TooLarge { bytes } => {
                write!(f, "frame too large: {bytes} bytes (max {MAX_ENVELOPE_BYTES})")
            }
            FrameError::Malformed(e) => write!(f, "malformed envelope: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Malformed(e)
    }
}

/// Encode an envelope into a single frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_ENVELOPE_BYTES {
        return Err(FrameError::TooLarge { bytes: body.len() });
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode one frame from the front of `bytes`.
///
/// Returns the envelope and the number of bytes consumed. With a partial
/// buffer, returns [`FrameError::NeedMore`]; the caller should read more
/// data and retry. Oversized frames are rejected from the length prefix
/// alone, before any parsing.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_ENVELOPE_BYTES {
        return Err(FrameError::TooLarge { bytes: len });
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    let envelope: Envelope = serde_json::from_slice(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((envelope, LEN_SIZE + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity::new("device-a", "Buddy", 5199)
    }

    #[test]
    fn chat_envelope_roundtrips_through_frame() {
        let envelope = Envelope::chat_message(
            &identity(),
            1_700_000_000,
            ContentType::Text,
            "hi there",
            Some("greeting".to_string()),
        );
        let frame = encode_frame(&envelope).expect("encode");
        let (decoded, consumed) = decode_frame(&frame).expect("decode");
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn partial_frame_needs_more() {
        let envelope = Envelope::friend_request(&identity(), 1_700_000_000);
        let frame = encode_frame(&envelope).expect("encode");
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameError::NeedMore)
        ));
        assert!(matches!(decode_frame(&frame[..2]), Err(FrameError::NeedMore)));
    }

    #[test]
    fn oversized_length_prefix_rejected_before_parse() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(64_u32 * 1024).to_be_bytes());
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame(&frame),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn unknown_kind_deserializes_as_unknown() {
        let raw = serde_json::json!({
            "version": 1,
            "type": "group_invite",
            "message_id": "m1",
            "from_device_id": "device-z",
            "from_display_name": "Ziggy",
            "timestamp": 1_700_000_000u64,
        });
        let envelope: Envelope = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(envelope.kind, EnvelopeKind::Unknown);
        assert!(envelope.validate().is_err());
    }

    #[test]
    fn message_validation_enforces_content_rules() {
        let mut envelope =
            Envelope::chat_message(&identity(), 0, ContentType::Text, "x", None);
        envelope.content = Some("   ".to_string());
        assert_eq!(envelope.validate(), Err(EnvelopeError::EmptyContent));

        let long = "a".repeat(MAX_CONTENT_CHARS + 1);
        let envelope = Envelope::chat_message(&identity(), 0, ContentType::Text, long, None);
        assert!(matches!(
            envelope.validate(),
            Err(EnvelopeError::ContentTooLong { .. })
        ));
    }

    #[test]
    fn ack_requires_target_and_status() {
        let mut ack = Envelope::ack(&identity(), 0, "m-123", AckStatus::Received);
        assert!(ack.validate().is_ok());
        ack.ack_status = None;
        assert!(ack.validate().is_err());
    }

    #[test]
    fn message_ids_are_salted() {
        let a = new_message_id("device-a", 42, "same");
        let b = new_message_id("device-a", 42, "same");
        assert_ne!(a, b);
    }
}
