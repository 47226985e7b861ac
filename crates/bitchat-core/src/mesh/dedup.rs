//! Flood-routing duplicate suppression
//!
//! A packet is processed at most once per node, keyed by the sender, the
//! sender-stamped timestamp, and a 16-byte prefix of the payload hash. Keys
//! live in an LRU with a freshness window: an entry that has aged out of the
//! window no longer counts as a duplicate.

use std::num::NonZeroUsize;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::config::DedupConfig;
use crate::protocol::wire::BitchatPacket;
use crate::types::{PeerId, Timestamp};

/// Bytes of the payload hash that participate in the dedup key
pub const DEDUP_PAYLOAD_PREFIX_LEN: usize = 16;

// ----------------------------------------------------------------------------
// Packet Key
// ----------------------------------------------------------------------------

/// Dedup identity of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketKey([u8; 32]);

impl PacketKey {
    /// Key for an inbound packet
    pub fn for_packet(packet: &BitchatPacket) -> Self {
        Self::new(packet.sender_id, packet.timestamp, &packet.payload)
    }

    /// Key from the raw parts
    pub fn new(sender: PeerId, timestamp: Timestamp, payload: &[u8]) -> Self {
        let payload_hash: [u8; 32] = Sha256::digest(payload).into();

        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(timestamp.as_millis().to_be_bytes());
        hasher.update(&payload_hash[..DEDUP_PAYLOAD_PREFIX_LEN]);
        Self(hasher.finalize().into())
    }
}

// ----------------------------------------------------------------------------
// Dedup Cache
// ----------------------------------------------------------------------------

/// LRU of recently seen packet keys
pub struct DedupCache {
    seen: LruCache<PacketKey, Timestamp>,
    window_ms: u64,
}

impl DedupCache {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            seen: LruCache::new(
                NonZeroUsize::new(config.capacity.max(1)).expect("capacity is nonzero"),
            ),
            window_ms: config.window.as_millis() as u64,
        }
    }

    /// Record the packet and report whether it was already seen within the
    /// freshness window.
    pub fn check_and_record(&mut self, packet: &BitchatPacket, now: Timestamp) -> bool {
        let key = PacketKey::for_packet(packet);
        let duplicate = match self.seen.get(&key) {
            Some(first_seen) => now.millis_since(*first_seen) <= self.window_ms,
            None => false,
        };
        if !duplicate {
            self.seen.put(key, now);
        }
        duplicate
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Drop all state
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::MessageType;
    use std::time::Duration;

    fn packet(sender: u8, ts: u64, payload: &[u8]) -> BitchatPacket {
        BitchatPacket::new(
            MessageType::Message,
            PeerId::new([sender; 8]),
            Timestamp::new(ts),
            payload.to_vec(),
        )
    }

    fn cache() -> DedupCache {
        DedupCache::new(&DedupConfig {
            capacity: 8,
            window: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_first_sighting_is_fresh() {
        let mut cache = cache();
        let now = Timestamp::new(0);
        assert!(!cache.check_and_record(&packet(1, 100, b"hello"), now));
        assert!(cache.check_and_record(&packet(1, 100, b"hello"), now));
    }

    #[test]
    fn test_distinct_keys_are_fresh() {
        let mut cache = cache();
        let now = Timestamp::new(0);
        assert!(!cache.check_and_record(&packet(1, 100, b"hello"), now));
        assert!(!cache.check_and_record(&packet(2, 100, b"hello"), now));
        assert!(!cache.check_and_record(&packet(1, 101, b"hello"), now));
        assert!(!cache.check_and_record(&packet(1, 100, b"other"), now));
    }

    #[test]
    fn test_ttl_does_not_change_key() {
        // a relayed copy differs only in TTL and must still be a duplicate
        let mut cache = cache();
        let now = Timestamp::new(0);
        let original = packet(1, 100, b"hello");
        let mut relayed = original.clone();
        relayed.ttl = relayed.ttl.decrement().unwrap();

        assert!(!cache.check_and_record(&original, now));
        assert!(cache.check_and_record(&relayed, now));
    }

    #[test]
    fn test_window_expiry() {
        let mut cache = cache();
        let p = packet(1, 100, b"hello");
        assert!(!cache.check_and_record(&p, Timestamp::new(0)));
        assert!(cache.check_and_record(&p, Timestamp::new(59_000)));
        // aged out of the freshness window: processed again
        assert!(!cache.check_and_record(&p, Timestamp::new(61_000)));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = cache();
        let now = Timestamp::new(0);
        for i in 0..16u8 {
            cache.check_and_record(&packet(i, 100, b"x"), now);
        }
        assert_eq!(cache.len(), 8);
        // the oldest entries were evicted and read as fresh again
        assert!(!cache.check_and_record(&packet(0, 100, b"x"), now));
    }
}
