//! Error types for the BitChat protocol
//!
//! One enum per concern, unified under [`BitchatError`]. Errors are reported
//! to callers and the event bus; they never cross component boundaries as
//! panics.

// ----------------------------------------------------------------------------
// Packet Errors
// ----------------------------------------------------------------------------

/// Wire-format decoding and validation failures
///
/// All of these are non-fatal to the link: the offending frame is dropped
/// and logged.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("truncated header: need {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },
    #[error("truncated payload: declared {declared} bytes, {remaining} remain")]
    TruncatedPayload { declared: usize, remaining: usize },
    #[error("unknown protocol version {0}")]
    UnknownVersion(u8),
    #[error("unsupported message type 0x{0:02x}")]
    UnsupportedType(u8),
    #[error("malformed packet: {0}")]
    Malformed(String),
}

// ----------------------------------------------------------------------------
// Crypto Errors
// ----------------------------------------------------------------------------

/// Failures from the Noise layer and the standalone AEAD primitives
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("invalid nonce length: expected {expected}, got {got}")]
    InvalidNonceLength { expected: usize, got: usize },
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("replay detected: nonce {0} already seen or below window")]
    ReplayDetected(u64),
    #[error("signature verification failed")]
    SignatureVerificationFailed,
}

// ----------------------------------------------------------------------------
// Session Errors
// ----------------------------------------------------------------------------

/// Noise session lifecycle failures
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session with peer {peer_id}")]
    SessionNotFound { peer_id: String },
    #[error("handshake with peer {peer_id} failed: {reason}")]
    HandshakeFailed { peer_id: String, reason: String },
    #[error("handshake with peer {peer_id} timed out")]
    HandshakeTimeout { peer_id: String },
    #[error("invalid session state for peer {peer_id}: expected {expected}, got {actual}")]
    InvalidState {
        peer_id: String,
        expected: String,
        actual: String,
    },
    #[error("session with peer {peer_id} is dead")]
    SessionDead { peer_id: String },
}

// ----------------------------------------------------------------------------
// Fragmentation Errors
// ----------------------------------------------------------------------------

/// Fragmenter and reassembler failures
#[derive(Debug, thiserror::Error)]
pub enum FragmentationError {
    #[error("invalid fragment header: {reason}")]
    InvalidHeader { reason: String },
    #[error("fragment group conflict: {reason}")]
    GroupConflict { reason: String },
    #[error("message too large to fragment: {fragments} fragments (max {max})")]
    TooManyFragments { fragments: usize, max: usize },
    #[error("fragment group timed out after {timeout_ms}ms")]
    FragmentTimeout { timeout_ms: u64 },
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failures in transports and the router above them
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {transport}")]
    TransportUnavailable { transport: String },
    #[error("peer {peer_id} is unreachable")]
    Unreachable { peer_id: String },
    #[error("send queue for peer {peer_id} is full (capacity {capacity})")]
    SendQueueFull { peer_id: String, capacity: usize },
    #[error("link error: {0}")]
    Link(String),
}

// ----------------------------------------------------------------------------
// Pending File Errors
// ----------------------------------------------------------------------------

/// Pending file manager failures
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("pending file quota exceeded: {needed} bytes do not fit in {max_total_bytes}")]
    QuotaExceeded {
        needed: usize,
        max_total_bytes: usize,
    },
    #[error("no pending file with id {0}")]
    NotFound(String),
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the BitChat engine
#[derive(Debug, thiserror::Error)]
pub enum BitchatError {
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("fragmentation error: {0}")]
    Fragmentation(#[from] FragmentationError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("file error: {0}")]
    File(#[from] FileError),

    #[error("noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("peer is blocked")]
    Blocked,

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl BitchatError {
    /// Shorthand for a malformed-packet error
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        BitchatError::Packet(PacketError::Malformed(reason.into()))
    }

    /// Shorthand for an unreachable-peer error
    pub fn unreachable(peer_id: crate::types::PeerId) -> Self {
        BitchatError::Transport(TransportError::Unreachable {
            peer_id: peer_id.to_string(),
        })
    }

    /// Shorthand for a handshake timeout
    pub fn handshake_timeout(peer_id: crate::types::PeerId) -> Self {
        BitchatError::Session(SessionError::HandshakeTimeout {
            peer_id: peer_id.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, BitchatError>;
pub type BitchatResult<T> = Result<T>;
