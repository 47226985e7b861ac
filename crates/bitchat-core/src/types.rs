//! Core types for the BitChat protocol
//!
//! Newtype wrappers for the identifiers that cross every layer of the
//! engine: peer ids, fingerprints, timestamps and packet TTLs.

use std::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a peer (8-byte prefix of the identity fingerprint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Special broadcast peer ID (all 0xFF)
    pub const BROADCAST: Self = Self([0xFF; 8]);

    /// Create a new PeerId from 8 bytes
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create a PeerId from the first 8 bytes of a longer identifier
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let len = bytes.len().min(8);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether this is the broadcast address
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for PeerId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        if bytes.len() != 8 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        Ok(Self::from_bytes(&bytes))
    }
}

// ----------------------------------------------------------------------------
// Fingerprint
// ----------------------------------------------------------------------------

/// SHA-256 fingerprint of a peer's static public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create a new fingerprint from 32 bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the short PeerId (first 8 bytes)
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_bytes(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since the Unix epoch, sender-stamped on the wire
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from raw milliseconds
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since `earlier` (saturating)
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// This timestamp shifted forward by `millis`
    pub fn plus_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

// ----------------------------------------------------------------------------
// Time-to-Live
// ----------------------------------------------------------------------------

/// Remaining forwarding hops for a mesh packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ttl(u8);

impl Ttl {
    /// Default TTL for new packets
    pub const DEFAULT: Self = Self(7);

    /// Maximum TTL value
    pub const MAX: Self = Self(7);

    /// Create a new TTL
    pub fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Decrement, returning None once exhausted
    pub fn decrement(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Self(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for Ttl {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of current time, abstracted so tests can drive virtual time
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually advanced time source for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl ManualTimeSource {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now
            .fetch_add(millis, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
