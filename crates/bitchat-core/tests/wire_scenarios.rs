//! Wire-level scenarios: fragmentation under adversarial delivery orders,
//! dedup/TTL routing properties, XChaCha vectors, pending-file bounds, and
//! pipeline ordering.

use std::time::Duration;

use bitchat_core::config::{DedupConfig, PendingFileConfig, PipelineConfig};
use bitchat_core::event::null_emitter;
use bitchat_core::files::PendingFileManager;
use bitchat_core::mesh::dedup::DedupCache;
use bitchat_core::noise::xchacha;
use bitchat_core::pipeline::{PublicMessage, PublicPipeline, TimelineMode};
use bitchat_core::protocol::{Fragment, FragmentHeader, Fragmenter, Reassembler};
use bitchat_core::types::ManualTimeSource;
use bitchat_core::{BitchatPacket, MessageType, PeerId, Timestamp};

fn sender() -> PeerId {
    "1122334455667788".parse().unwrap()
}

fn three_kb_message() -> BitchatPacket {
    BitchatPacket::new(
        MessageType::Message,
        sender(),
        Timestamp::new(1_700_000_000_000),
        vec![0x5A; 3000],
    )
}

/// Deterministic shuffle, good enough to scramble delivery order
fn shuffle<T>(items: &mut Vec<T>, seed: u64) {
    let mut state = seed | 1;
    for i in (1..items.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

#[test]
fn scenario_3kb_message_shuffled_fragments() {
    let packet = three_kb_message();
    let encoded = packet.encode(false).unwrap();
    let mut fragments =
        Fragmenter::split(&encoded, MessageType::Message.as_u8(), 400).unwrap();
    assert_eq!(fragments.len(), 8);

    for seed in [1u64, 7, 42, 1234] {
        shuffle(&mut fragments, seed);
        let mut reassembler = Reassembler::new(Duration::from_secs(30));
        let now = Timestamp::new(0);

        let mut deliveries = Vec::new();
        for fragment in &fragments {
            if let Some(bytes) = reassembler
                .add_fragment(sender(), &fragment.to_payload(), now)
                .unwrap()
            {
                deliveries.push(bytes);
            }
        }

        assert_eq!(deliveries.len(), 1, "seed {}", seed);
        let reassembled = BitchatPacket::decode(&deliveries[0]).unwrap();
        assert_eq!(reassembled.payload.len(), 3000);
        assert_eq!(reassembled, packet);
    }
}

#[test]
fn scenario_duplicate_fragment_single_delivery() {
    let packet = three_kb_message();
    let encoded = packet.encode(false).unwrap();
    let fragments = Fragmenter::split(&encoded, MessageType::Message.as_u8(), 400).unwrap();

    let mut reassembler = Reassembler::new(Duration::from_secs(30));
    let now = Timestamp::new(0);
    let mut deliveries = 0;

    // index 0 delivered twice up front, then the rest
    for fragment in std::iter::once(&fragments[0]).chain(fragments.iter()) {
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
fn scenario_corrupt_fragment_header_no_delivery() {
    let packet = three_kb_message();
    let encoded = packet.encode(false).unwrap();
    let fragments = Fragmenter::split(&encoded, MessageType::Message.as_u8(), 400).unwrap();

    let mut reassembler = Reassembler::new(Duration::from_secs(30));
    let now = Timestamp::new(0);
    let mut deliveries = 0;

    // fragment 0 replaced by a payload too short to parse
    assert!(reassembler.add_fragment(sender(), &[0x00, 0x01, 0x02], now).is_err());
    for fragment in &fragments[1..] {
        if reassembler
            .add_fragment(sender(), &fragment.to_payload(), now)
            .unwrap()
            .is_some()
        {
            deliveries += 1;
        }
    }
    assert_eq!(deliveries, 0);
}

#[test]
fn malformed_group_isolated_from_healthy_group() {
    let mut reassembler = Reassembler::new(Duration::from_secs(30));
    let now = Timestamp::new(0);

    // poisoned group: conflicting totals under one id
    let poisoned_id = [0xAB; 8];
    let first = Fragment {
        header: FragmentHeader::new(poisoned_id, 0, 4, MessageType::Message.as_u8()),
        chunk: vec![1; 10],
    };
    let conflicting = Fragment {
        header: FragmentHeader::new(poisoned_id, 1, 5, MessageType::Message.as_u8()),
        chunk: vec![2; 10],
    };
    reassembler
        .add_fragment(sender(), &first.to_payload(), now)
        .unwrap();
    assert!(reassembler
        .add_fragment(sender(), &conflicting.to_payload(), now)
        .is_err());

    // a healthy group from the same sender still completes
    let packet = three_kb_message();
    let encoded = packet.encode(false).unwrap();
    let fragments = Fragmenter::split(&encoded, MessageType::Message.as_u8(), 600).unwrap();
    let mut delivered = None;
    for fragment in &fragments {
        if let Some(bytes) = reassembler
            .add_fragment(sender(), &fragment.to_payload(), now)
            .unwrap()
        {
            delivered = Some(bytes);
        }
    }
    assert_eq!(
        BitchatPacket::decode(&delivered.unwrap()).unwrap(),
        packet
    );
}

#[test]
fn dedup_delivers_each_key_once_within_window() {
    let mut cache = DedupCache::new(&DedupConfig::default());
    let now = Timestamp::new(0);

    let mut fresh = 0;
    for round in 0..3 {
        for i in 0..50u64 {
            let packet = BitchatPacket::new(
                MessageType::Message,
                sender(),
                Timestamp::new(i),
                vec![i as u8; 32],
            );
            if !cache.check_and_record(&packet, now) {
                fresh += 1;
            }
        }
        let _ = round;
    }
    // 50 distinct keys, each fresh exactly once across all three rounds
    assert_eq!(fresh, 50);
}

#[test]
fn ttl_decrements_and_bottoms_out() {
    let mut packet = three_kb_message();
    let mut hops = 0;
    while packet.ttl.value() > 1 {
        let ttl_before = packet.ttl.value();
        packet.ttl = packet.ttl.decrement().unwrap();
        assert_eq!(packet.ttl.value(), ttl_before - 1);
        hops += 1;
    }
    assert_eq!(hops, 6);
    // ttl 1: consumed, never forwarded; decrement to 0 is the floor
    assert_eq!(packet.ttl.decrement().unwrap().value(), 0);
    assert!(packet.ttl.decrement().unwrap().decrement().is_none());
}

#[test]
fn scenario_xchacha_round_trip_and_tamper() {
    let key = [0x42u8; 32];
    let nonce = [0x24u8; 24];
    let plaintext = b"Hello, XChaCha20-Poly1305!";

    let ciphertext = xchacha::seal(&key, &nonce, b"", plaintext).unwrap();
    assert_eq!(
        xchacha::open(&key, &nonce, b"", &ciphertext).unwrap(),
        plaintext
    );

    for i in 0..ciphertext.len() {
        let mut tampered = ciphertext.clone();
        tampered[i] ^= 0x80;
        assert!(xchacha::open(&key, &nonce, b"", &tampered).is_err());
    }
}

#[test]
fn scenario_pending_file_eviction_by_size() {
    let clock = ManualTimeSource::new(1_000);
    let manager = PendingFileManager::new(
        PendingFileConfig {
            max_pending_count: 100,
            max_total_bytes: 500,
            expiration: Duration::from_secs(300),
        },
        std::sync::Arc::new(clock.clone()),
        null_emitter(),
    );
    let peer = sender();

    let first = manager
        .add(peer, "a", None, None, vec![0; 200], false)
        .unwrap();
    clock.advance(1);
    manager.add(peer, "a", None, None, vec![0; 200], false).unwrap();
    clock.advance(1);
    manager.add(peer, "a", None, None, vec![0; 300], false).unwrap();

    assert!(manager.get(&first.id).is_none());
    assert_eq!(manager.stats(), (2, 500));
}

#[test]
fn scenario_pipeline_ordering_and_dedup() {
    let mut pipeline = PublicPipeline::new(
        PipelineConfig::default(),
        TimelineMode::MeshLocal,
        null_emitter(),
    );
    let t = 1_700_000_000_000u64;

    pipeline.enqueue(
        PublicMessage {
            id: "a".into(),
            sender: sender(),
            nickname: None,
            content: "Same".into(),
            timestamp: Timestamp::new(t + 10_000),
        },
        Timestamp::new(t),
    );
    pipeline.enqueue(
        PublicMessage {
            id: "b".into(),
            sender: sender(),
            nickname: None,
            content: "Same".into(),
            timestamp: Timestamp::new(t + 10_200),
        },
        Timestamp::new(t),
    );

    pipeline.flush(Timestamp::new(t + 200));
    assert_eq!(pipeline.timeline().len(), 1);
    assert_eq!(pipeline.timeline()[0].content, "Same");
    assert_eq!(pipeline.timeline()[0].id, "a");
}

#[test]
fn pipeline_flush_is_sorted_within_batch() {
    let mut pipeline = PublicPipeline::new(
        PipelineConfig::default(),
        TimelineMode::Geohash,
        null_emitter(),
    );
    let now = Timestamp::new(0);
    for (id, ts) in [("d", 400u64), ("a", 100), ("c", 300), ("b", 200)] {
        pipeline.enqueue(
            PublicMessage {
                id: id.into(),
                sender: sender(),
                nickname: None,
                content: format!("msg {}", id),
                timestamp: Timestamp::new(ts),
            },
            now,
        );
    }
    pipeline.flush(now);

    let stamps: Vec<u64> = pipeline
        .timeline()
        .iter()
        .map(|m| m.timestamp.as_millis())
        .collect();
    let mut sorted = stamps.clone();
    sorted.sort();
    assert_eq!(stamps, sorted);
}
