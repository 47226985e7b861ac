//! Fragmentation and reassembly for MTU-limited links
//!
//! A packet whose encoding exceeds the link MTU is split into `Fragment`
//! packets. Each fragment payload carries a 13-byte header:
//!
//! ```text
//! fragment_id(8) | index(u16 BE) | total(u16 BE) | original_type(1) | chunk
//! ```
//!
//! All fragments of one reassembly share `(sender, fragment_id)`. Arrival
//! order is arbitrary, duplicates are idempotent, and a malformed fragment
//! poisons only its own group.

use std::collections::HashMap;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, warn};

use crate::errors::{FragmentationError, Result};
use crate::protocol::wire::{BitchatPacket, MessageType};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Fragment payload header length
pub const FRAGMENT_HEADER_LEN: usize = 13;

/// Upper bound on fragments per message
pub const MAX_FRAGMENTS: usize = 4096;

// ----------------------------------------------------------------------------
// Fragment Header
// ----------------------------------------------------------------------------

/// Metadata prefix of every fragment payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Random id shared by all fragments of one reassembly
    pub fragment_id: [u8; 8],
    /// 0-based fragment position
    pub index: u16,
    /// Total fragments in the group
    pub total: u16,
    /// Message type of the original packet
    pub original_type: u8,
}

impl FragmentHeader {
    pub fn new(fragment_id: [u8; 8], index: u16, total: u16, original_type: u8) -> Self {
        Self {
            fragment_id,
            index,
            total,
            original_type,
        }
    }

    /// Serialize to the 13-byte wire prefix
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut bytes = [0u8; FRAGMENT_HEADER_LEN];
        bytes[..8].copy_from_slice(&self.fragment_id);
        bytes[8..10].copy_from_slice(&self.index.to_be_bytes());
        bytes[10..12].copy_from_slice(&self.total.to_be_bytes());
        bytes[12] = self.original_type;
        bytes
    }

    /// Parse the wire prefix; does not validate index/total consistency
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(FragmentationError::InvalidHeader {
                reason: format!("{} bytes is too short for a fragment header", bytes.len()),
            }
            .into());
        }
        let mut fragment_id = [0u8; 8];
        fragment_id.copy_from_slice(&bytes[..8]);
        Ok(Self {
            fragment_id,
            index: u16::from_be_bytes([bytes[8], bytes[9]]),
            total: u16::from_be_bytes([bytes[10], bytes[11]]),
            original_type: bytes[12],
        })
    }
}

// ----------------------------------------------------------------------------
// Fragment
// ----------------------------------------------------------------------------

/// A parsed fragment payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub chunk: Vec<u8>,
}

impl Fragment {
    /// Serialize header + chunk into a Fragment packet payload
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.chunk.len());
        payload.extend_from_slice(&self.header.to_bytes());
        payload.extend_from_slice(&self.chunk);
        payload
    }

    /// Parse a Fragment packet payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let header = FragmentHeader::from_bytes(payload)?;
        Ok(Self {
            header,
            chunk: payload[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

// ----------------------------------------------------------------------------
// Fragmenter
// ----------------------------------------------------------------------------

/// Splits oversized packets into fragment packets
#[derive(Debug, Default)]
pub struct Fragmenter;

impl Fragmenter {
    /// Whether `packet` needs splitting for a link with the given MTU
    pub fn needs_fragmentation(packet: &BitchatPacket, mtu: usize) -> bool {
        packet.structural_len() > mtu
    }

    /// Split the binary encoding of `packet` into Fragment packets that fit
    /// `mtu`, preserving sender, TTL, timestamp and recipient on the
    /// envelope and the original type in the fragment header.
    pub fn fragment(packet: &BitchatPacket, mtu: usize) -> Result<Vec<BitchatPacket>> {
        let encoded = packet.encode(false)?;

        // Envelope overhead of a fragment packet from the same sender.
        let envelope = BitchatPacket {
            payload: Vec::new(),
            message_type: MessageType::Fragment,
            signature: None,
            ..packet.clone()
        };
        let chunk_size = mtu
            .saturating_sub(envelope.structural_len())
            .saturating_sub(FRAGMENT_HEADER_LEN);
        if chunk_size == 0 {
            return Err(FragmentationError::InvalidHeader {
                reason: format!("mtu of {} leaves no room for fragment data", mtu),
            }
            .into());
        }

        Self::split(&encoded, packet.message_type.as_u8(), chunk_size).map(|fragments| {
            fragments
                .into_iter()
                .map(|fragment| BitchatPacket {
                    payload: fragment.to_payload(),
                    ..envelope.clone()
                })
                .collect()
        })
    }

    /// Split raw bytes into fragments of `chunk_size` under a fresh random id
    pub fn split(data: &[u8], original_type: u8, chunk_size: usize) -> Result<Vec<Fragment>> {
        let total = data.len().div_ceil(chunk_size).max(1);
        if total > MAX_FRAGMENTS {
            return Err(FragmentationError::TooManyFragments {
                fragments: total,
                max: MAX_FRAGMENTS,
            }
            .into());
        }

        let mut fragment_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut fragment_id);

        Ok(data
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| Fragment {
                header: FragmentHeader::new(
                    fragment_id,
                    index as u16,
                    total as u16,
                    original_type,
                ),
                chunk: chunk.to_vec(),
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Reassembler
// ----------------------------------------------------------------------------

type GroupKey = (PeerId, [u8; 8]);

/// In-flight reassembly state for one fragment group
#[derive(Debug)]
struct ReassemblyBuffer {
    total: u16,
    original_type: u8,
    chunks: Vec<Option<Vec<u8>>>,
    received: usize,
    first_seen: Timestamp,
}

impl ReassemblyBuffer {
    fn new(header: &FragmentHeader, now: Timestamp) -> Self {
        Self {
            total: header.total,
            original_type: header.original_type,
            chunks: vec![None; header.total as usize],
            received: 0,
            first_seen: now,
        }
    }

    /// Insert a chunk; duplicates are no-ops. Returns completion.
    fn insert(&mut self, index: u16, chunk: Vec<u8>) -> bool {
        let slot = &mut self.chunks[index as usize];
        if slot.is_none() {
            *slot = Some(chunk);
            self.received += 1;
        }
        self.received == self.total as usize
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in self.chunks.into_iter().flatten() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// Reassembles fragment groups keyed by `(sender, fragment_id)`
///
/// Malformed groups are quarantined until the reassembly timeout so a bad
/// shard cannot resurrect a dropped buffer.
pub struct Reassembler {
    buffers: HashMap<GroupKey, ReassemblyBuffer>,
    poisoned: HashMap<GroupKey, Timestamp>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            poisoned: HashMap::new(),
            timeout,
        }
    }

    /// Feed one fragment packet payload.
    ///
    /// Returns the reassembled original encoding exactly once, when the last
    /// missing chunk arrives. Expired buffers are reaped lazily here as well
    /// as by the periodic [`Reassembler::expire`] tick.
    pub fn add_fragment(
        &mut self,
        sender: PeerId,
        payload: &[u8],
        now: Timestamp,
    ) -> Result<Option<Vec<u8>>> {
        self.expire(now);

        let fragment = Fragment::from_payload(payload)?;
        let header = fragment.header;
        let key = (sender, header.fragment_id);

        if self.poisoned.contains_key(&key) {
            debug!(sender = %sender, "fragment for poisoned group dropped");
            return Ok(None);
        }

        if header.total == 0 || header.index >= header.total {
            self.poison(key, now);
            return Err(FragmentationError::InvalidHeader {
                reason: format!("index {} out of range for total {}", header.index, header.total),
            }
            .into());
        }

        if let Some(existing) = self.buffers.get(&key) {
            if existing.total != header.total || existing.original_type != header.original_type {
                self.poison(key, now);
                return Err(FragmentationError::GroupConflict {
                    reason: "total or inner type conflicts with earlier fragments".into(),
                }
                .into());
            }
        }

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(&header, now));

        if buffer.insert(header.index, fragment.chunk) {
            let buffer = self.buffers.remove(&key).expect("buffer present");
            debug!(sender = %sender, total = header.total, "fragment group reassembled");
            return Ok(Some(buffer.assemble()));
        }
        Ok(None)
    }

    /// Drop buffers and quarantine entries older than the timeout
    pub fn expire(&mut self, now: Timestamp) {
        let timeout_ms = self.timeout.as_millis() as u64;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.millis_since(buffer.first_seen) <= timeout_ms);
        if self.buffers.len() < before {
            warn!(
                reaped = before - self.buffers.len(),
                "expired incomplete fragment groups"
            );
        }
        self.poisoned
            .retain(|_, since| now.millis_since(*since) <= timeout_ms);
    }

    /// Number of in-flight groups
    pub fn pending_groups(&self) -> usize {
        self.buffers.len()
    }

    /// Drop all state
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.poisoned.clear();
    }

    fn poison(&mut self, key: GroupKey, now: Timestamp) {
        warn!(sender = %key.0, "malformed fragment, dropping group");
        self.buffers.remove(&key);
        self.poisoned.insert(key, now);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire::MessageType;

    fn sender() -> PeerId {
        PeerId::new([1, 2, 3, 4, 5, 6, 7, 8])
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(Duration::from_secs(30))
    }

    #[test]
    fn test_header_roundtrip() {
        let header = FragmentHeader::new([9; 8], 5, 10, 0x02);
        let parsed = FragmentHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_too_short() {
        assert!(FragmentHeader::from_bytes(&[0x00, 0x01, 0x02]).is_err());
    }

    #[test]
    fn test_split_sizes() {
        let data = vec![0xAB; 1000];
        let fragments = Fragmenter::split(&data, 0x02, 400).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].chunk.len(), 400);
        assert_eq!(fragments[2].chunk.len(), 200);
        assert!(fragments
            .iter()
            .all(|f| f.header.fragment_id == fragments[0].header.fragment_id));
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1200).collect();
        let fragments = Fragmenter::split(&data, 0x02, 100).unwrap();
        let mut reassembler = reassembler();
        let now = Timestamp::new(0);

        let mut result = None;
        for fragment in fragments.iter().rev() {
            if let Some(bytes) = reassembler
                .add_fragment(sender(), &fragment.to_payload(), now)
                .unwrap()
            {
                result = Some(bytes);
            }
        }
        assert_eq!(result.unwrap(), data);
        assert_eq!(reassembler.pending_groups(), 0);
    }

    #[test]
    fn test_duplicates_are_idempotent() {
        let data = vec![0x42; 300];
        let fragments = Fragmenter::split(&data, 0x02, 100).unwrap();
        let mut reassembler = reassembler();
        let now = Timestamp::new(0);

        let mut deliveries = 0;
        for fragment in [&fragments[0], &fragments[0], &fragments[1], &fragments[1], &fragments[2]]
        {
            if reassembler
                .add_fragment(sender(), &fragment.to_payload(), now)
                .unwrap()
                .is_some()
            {
                deliveries += 1;
            }
        }
        assert_eq!(deliveries, 1);
    }

    #[test]
    fn test_malformed_header_poisons_group() {
        let data = vec![0x42; 300];
        let fragments = Fragmenter::split(&data, 0x02, 100).unwrap();
        let mut reassembler = reassembler();
        let now = Timestamp::new(0);

        // index out of range under the same group id
        let bad = Fragment {
            header: FragmentHeader::new(fragments[0].header.fragment_id, 9, 3, 0x02),
            chunk: vec![0xFF; 10],
        };
        reassembler
            .add_fragment(sender(), &fragments[0].to_payload(), now)
            .unwrap();
        assert!(reassembler
            .add_fragment(sender(), &bad.to_payload(), now)
            .is_err());

        // the rest of the group can no longer complete
        for fragment in &fragments[1..] {
            assert!(reassembler
                .add_fragment(sender(), &fragment.to_payload(), now)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_malformed_group_does_not_affect_others() {
        let mut reassembler = reassembler();
        let now = Timestamp::new(0);

        let bad = Fragment {
            header: FragmentHeader::new([0xEE; 8], 0, 0, 0x02),
            chunk: vec![],
        };
        assert!(reassembler.add_fragment(sender(), &bad.to_payload(), now).is_err());

        let data = vec![0x42; 300];
        let fragments = Fragmenter::split(&data, 0x02, 100).unwrap();
        let mut result = None;
        for fragment in &fragments {
            if let Some(bytes) = reassembler
                .add_fragment(sender(), &fragment.to_payload(), now)
                .unwrap()
            {
                result = Some(bytes);
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_expiry_reaps_stale_buffers() {
        let data = vec![0x42; 300];
        let fragments = Fragmenter::split(&data, 0x02, 100).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(30));

        reassembler
            .add_fragment(sender(), &fragments[0].to_payload(), Timestamp::new(0))
            .unwrap();
        assert_eq!(reassembler.pending_groups(), 1);

        reassembler.expire(Timestamp::new(31_000));
        assert_eq!(reassembler.pending_groups(), 0);

        // late fragments recreate a fresh buffer that can never complete
        // within this group, and a full resend still works
        let mut result = None;
        for fragment in &fragments {
            if let Some(bytes) = reassembler
                .add_fragment(sender(), &fragment.to_payload(), Timestamp::new(32_000))
                .unwrap()
            {
                result = Some(bytes);
            }
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_fragment_packets_roundtrip() {
        let packet = BitchatPacket::new(
            MessageType::Message,
            sender(),
            Timestamp::new(1_700_000_000_000),
            vec![0x37; 3000],
        );
        assert!(Fragmenter::needs_fragmentation(&packet, 512));

        let fragments = Fragmenter::fragment(&packet, 512).unwrap();
        assert!(fragments.len() > 1);
        for fragment in &fragments {
            assert!(fragment.structural_len() <= 512);
            assert_eq!(fragment.message_type, MessageType::Fragment);
            assert_eq!(fragment.sender_id, packet.sender_id);
            assert_eq!(fragment.timestamp, packet.timestamp);
        }

        let mut reassembler = reassembler();
        let now = Timestamp::new(0);
        let mut result = None;
        for fragment in &fragments {
            if let Some(bytes) = reassembler
                .add_fragment(fragment.sender_id, &fragment.payload, now)
                .unwrap()
            {
                result = Some(bytes);
            }
        }
        let reassembled = BitchatPacket::decode(&result.unwrap()).unwrap();
        assert_eq!(reassembled, packet);
    }
}
