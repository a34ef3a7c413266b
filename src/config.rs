//! Protocol and device configuration.
//!
//! All tunables live here as constants so behaviour is deterministic and
//! testable.  The per-device identity (`DeviceConfig`) is stored in a
//! `device.toml` next to the database and loaded once at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Default TCP port for the envelope listener.
pub const DEFAULT_PORT: u16 = 5199;

/// mDNS-style service name the device advertises under.
pub const SERVICE_NAME: &str = "_petlink._tcp";

/// Multicast group used for LAN discovery datagrams.
pub const DISCOVERY_GROUP: &str = "239.255.51.99";

/// UDP port for discovery datagrams.
pub const DISCOVERY_PORT: u16 = 5198;

/// Timeout for establishing an outbound TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read/write timeout on an established connection.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Default duration of a discovery scan.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval between discovery beacon announcements.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(4);

/// Hard cap on a serialized envelope frame, enforced before parsing.
pub const MAX_ENVELOPE_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// Social
// ---------------------------------------------------------------------------

/// Maximum message content length in characters.
pub const MAX_CONTENT_CHARS: usize = 500;

/// Pending friend requests expire after this window.
pub const FRIEND_REQUEST_TTL_SECS: u64 = 24 * 3600;

/// Maximum number of friends a device will keep.
pub const MAX_FRIENDS: usize = 20;

/// A friend counts as online if seen within this window.
pub const ONLINE_WINDOW_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Outbound retry
// ---------------------------------------------------------------------------

/// First retry delay; doubles per attempt.
pub const RETRY_BASE_DELAY_SECS: u64 = 30;

/// Backoff ceiling.
pub const RETRY_MAX_DELAY_SECS: u64 = 1800;

/// Attempts before a queued message is marked failed.
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Retry scheduler tick interval.
pub const QUEUE_TICK: Duration = Duration::from_secs(5);

/// How often pending friend requests are swept for expiry.
pub const SWEEP_TICK: Duration = Duration::from_secs(60);

/// Due queue entries processed per scheduler tick.
pub const QUEUE_BATCH_LIMIT: u32 = 10;

// ---------------------------------------------------------------------------
// Device identity
// ---------------------------------------------------------------------------

/// Per-device identity persisted in `device.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable unique id, derived from random bytes at init.
    pub device_id: String,
    /// Human-readable name shown to peers (the pet's name).
    pub display_name: String,
    /// TCP port the envelope listener binds.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Toml(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl DeviceConfig {
    /// Create a fresh identity with a random device id.
    pub fn generate(display_name: impl Into<String>, port: u16) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let digest = Sha256::digest(seed);
        let device_id = URL_SAFE_NO_PAD.encode(&digest[..16]);
        Self {
            device_id,
            display_name: display_name.into(),
            port,
        }
    }

    /// Load from `dir/device.toml`.
    pub fn load(dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = config_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let config = toml::from_str(&raw).map_err(|e| ConfigError::Toml(e.to_string()))?;
        Ok(Some(config))
    }

    /// Write to `dir/device.toml`, creating the directory if needed.
    pub fn save(&self, dir: &Path) -> Result<(), ConfigError> {
        fs::create_dir_all(dir)?;
        let raw = toml::to_string_pretty(self).map_err(|e| ConfigError::Toml(e.to_string()))?;
        fs::write(config_path(dir), raw)?;
        Ok(())
    }
}

fn config_path(dir: &Path) -> PathBuf {
    dir.join("device.toml")
}

/// Database path inside a device data directory.
pub fn db_path(dir: &Path) -> PathBuf {
    dir.join("petlink.db")
}
