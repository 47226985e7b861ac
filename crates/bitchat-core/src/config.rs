//! Centralized configuration
//!
//! One struct per subsystem, with defaults matching the protocol
//! specification and a `testing()` preset per struct that shrinks every
//! timeout so the deterministic tests run fast.

use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Noise session lifecycle parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum time for a handshake to complete
    pub handshake_timeout: Duration,
    /// Maximum idle time before an established session is torn down
    pub idle_timeout: Duration,
    /// Receive-side replay window, in nonces
    pub replay_window: usize,
    /// Decrypted messages parked ahead of the next expected nonce
    pub reorder_budget: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            replay_window: 1024,
            reorder_budget: 32,
        }
    }
}

impl SessionConfig {
    pub fn testing() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Fragmentation Configuration
// ----------------------------------------------------------------------------

/// Fragmenter and reassembler parameters
#[derive(Debug, Clone)]
pub struct FragmentationConfig {
    /// Largest encoded frame the link carries without splitting
    pub max_fragment_size: usize,
    /// Reassembly buffer lifetime
    pub reassembly_timeout: Duration,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            max_fragment_size: 512,
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

impl FragmentationConfig {
    pub fn testing() -> Self {
        Self {
            reassembly_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Dedup Configuration
// ----------------------------------------------------------------------------

/// Flood-routing duplicate suppression parameters
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// LRU capacity, in packet keys
    pub capacity: usize,
    /// Freshness window: an entry older than this no longer counts
    pub window: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            window: Duration::from_secs(60),
        }
    }
}

impl DedupConfig {
    pub fn testing() -> Self {
        Self {
            capacity: 64,
            window: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// Pipeline Configuration
// ----------------------------------------------------------------------------

/// Public message pipeline parameters
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batching window before a flush
    pub batch_window: Duration,
    /// Window within which identical normalized content is a duplicate
    pub dedup_window: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(100),
            dedup_window: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn testing() -> Self {
        Self {
            batch_window: Duration::from_millis(10),
            dedup_window: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Pending File Configuration
// ----------------------------------------------------------------------------

/// Bounds for the in-memory pending file hold
#[derive(Debug, Clone)]
pub struct PendingFileConfig {
    /// Maximum number of pending transfers
    pub max_pending_count: usize,
    /// Maximum total held bytes
    pub max_total_bytes: usize,
    /// Entry lifetime before expiration
    pub expiration: Duration,
}

impl Default for PendingFileConfig {
    fn default() -> Self {
        Self {
            max_pending_count: 10,
            max_total_bytes: 5 * 1024 * 1024,
            expiration: Duration::from_secs(300),
        }
    }
}

impl PendingFileConfig {
    pub fn testing() -> Self {
        Self {
            max_pending_count: 4,
            max_total_bytes: 1024,
            expiration: Duration::from_secs(1),
        }
    }
}

// ----------------------------------------------------------------------------
// Router Configuration
// ----------------------------------------------------------------------------

/// Message router and outbox parameters
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// How long a queued private message may wait for a reachable transport
    pub outbox_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            outbox_ttl: Duration::from_secs(300),
        }
    }
}

impl RouterConfig {
    pub fn testing() -> Self {
        Self {
            outbox_ttl: Duration::from_millis(500),
        }
    }
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Top-level mesh transport parameters
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Announce beacon interval
    pub announce_interval: Duration,
    /// Housekeeping tick (reassembly reap, session timeouts, queue expiry)
    pub maintenance_interval: Duration,
    /// How long a queued private message waits for a session
    pub private_send_ttl: Duration,
    /// Command channel depth into the mesh loop
    pub command_buffer: usize,
    pub session: SessionConfig,
    pub fragmentation: FragmentationConfig,
    pub dedup: DedupConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(10),
            maintenance_interval: Duration::from_millis(100),
            private_send_ttl: Duration::from_secs(300),
            command_buffer: 64,
            session: SessionConfig::default(),
            fragmentation: FragmentationConfig::default(),
            dedup: DedupConfig::default(),
        }
    }
}

impl MeshConfig {
    pub fn testing() -> Self {
        Self {
            announce_interval: Duration::from_millis(100),
            maintenance_interval: Duration::from_millis(20),
            private_send_ttl: Duration::from_millis(500),
            command_buffer: 64,
            session: SessionConfig::testing(),
            fragmentation: FragmentationConfig::testing(),
            dedup: DedupConfig::testing(),
        }
    }

    /// Shared handle for handing the same config to several tasks
    pub fn into_shared(self) -> Arc<MeshConfig> {
        Arc::new(self)
    }
}
