//! Public message pipeline
//!
//! Inbound broadcast messages from any transport are batched for a short
//! window, sorted by timestamp (message id breaking ties), deduplicated by
//! normalized content across transports, and inserted into the timeline.
//! Insertion position depends on the active channel: the local mesh view
//! appends (recent-first UX), a geohash channel inserts chronologically.

use std::collections::HashMap;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::event::{AppEvent, EventEmitter};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Public Message
// ----------------------------------------------------------------------------

/// One broadcast chat message as the pipeline sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicMessage {
    pub id: String,
    pub sender: PeerId,
    pub nickname: Option<String>,
    pub content: String,
    pub timestamp: Timestamp,
}

/// Insertion policy of the active channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineMode {
    /// Local mesh view: late arrivals append to the tail
    MeshLocal,
    /// Location channel: messages sit at their chronological position
    Geohash,
}

// ----------------------------------------------------------------------------
// Pipeline
// ----------------------------------------------------------------------------

/// Batched ordering + content dedup in front of the timeline
pub struct PublicPipeline {
    config: PipelineConfig,
    mode: TimelineMode,
    pending: Vec<PublicMessage>,
    batch_started: Option<Timestamp>,
    /// normalized content -> timestamp of the last accepted copy
    dedup: HashMap<String, Timestamp>,
    timeline: Vec<PublicMessage>,
    events: EventEmitter,
}

impl PublicPipeline {
    pub fn new(config: PipelineConfig, mode: TimelineMode, events: EventEmitter) -> Self {
        Self {
            config,
            mode,
            pending: Vec::new(),
            batch_started: None,
            dedup: HashMap::new(),
            timeline: Vec::new(),
            events,
        }
    }

    /// Switch the insertion policy (channel change); the timeline resets
    pub fn set_mode(&mut self, mode: TimelineMode) {
        if self.mode != mode {
            self.mode = mode;
            self.timeline.clear();
            self.pending.clear();
            self.batch_started = None;
        }
    }

    /// Queue one inbound broadcast message
    pub fn enqueue(&mut self, message: PublicMessage, now: Timestamp) {
        if self.batch_started.is_none() {
            self.batch_started = Some(now);
        }
        self.pending.push(message);
    }

    /// Flush if the batching window elapsed; returns the number inserted
    pub fn flush_due(&mut self, now: Timestamp) -> usize {
        match self.batch_started {
            Some(started)
                if now.millis_since(started) >= self.config.batch_window.as_millis() as u64 =>
            {
                self.flush(now)
            }
            _ => 0,
        }
    }

    /// Flush unconditionally
    pub fn flush(&mut self, now: Timestamp) -> usize {
        self.batch_started = None;
        if self.pending.is_empty() {
            return 0;
        }

        let mut batch = std::mem::take(&mut self.pending);
        batch.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });

        self.prune_dedup(now);

        let window_ms = self.config.dedup_window.as_millis() as u64;
        let mut inserted = 0;
        for message in batch {
            let key = normalize_content(&message.content);
            if let Some(seen_at) = self.dedup.get(&key) {
                let gap = message
                    .timestamp
                    .as_millis()
                    .abs_diff(seen_at.as_millis());
                if gap <= window_ms {
                    debug!(id = %message.id, "duplicate public message dropped");
                    continue;
                }
            }
            self.dedup.insert(key, message.timestamp);
            self.insert(message);
            inserted += 1;
        }
        inserted
    }

    /// Current timeline, in display order
    pub fn timeline(&self) -> &[PublicMessage] {
        &self.timeline
    }

    /// Drop all state (panic clear)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.timeline.clear();
        self.dedup.clear();
        self.batch_started = None;
    }

    fn insert(&mut self, message: PublicMessage) {
        self.events.emit(AppEvent::PublicMessageReceived {
            peer_id: message.sender,
            message_id: message.id.clone(),
            content: message.content.clone(),
            timestamp: message.timestamp,
        });
        match self.mode {
            TimelineMode::MeshLocal => self.timeline.push(message),
            TimelineMode::Geohash => {
                // after any entries with the same timestamp, so batch order holds
                let at = self
                    .timeline
                    .partition_point(|m| m.timestamp <= message.timestamp);
                self.timeline.insert(at, message);
            }
        }
    }

    fn prune_dedup(&mut self, now: Timestamp) {
        let window_ms = self.config.dedup_window.as_millis() as u64;
        self.dedup
            .retain(|_, seen_at| now.millis_since(*seen_at) <= window_ms.saturating_mul(2));
    }
}

/// Dedup key: lowercase, trimmed, internal whitespace collapsed
pub fn normalize_content(content: &str) -> String {
    content
        .trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::null_emitter;

    fn message(id: &str, ts: u64, content: &str) -> PublicMessage {
        PublicMessage {
            id: id.to_string(),
            sender: PeerId::new([1; 8]),
            nickname: None,
            content: content.to_string(),
            timestamp: Timestamp::new(ts),
        }
    }

    fn pipeline(mode: TimelineMode) -> PublicPipeline {
        PublicPipeline::new(PipelineConfig::default(), mode, null_emitter())
    }

    #[test]
    fn test_normalize_content() {
        assert_eq!(normalize_content("  Hello   World \n"), "hello world");
        assert_eq!(normalize_content("SAME"), "same");
    }

    #[test]
    fn test_flush_sorts_by_timestamp_then_id() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        let now = Timestamp::new(0);
        pipeline.enqueue(message("b", 2_000, "two"), now);
        pipeline.enqueue(message("c", 1_000, "one-c"), now);
        pipeline.enqueue(message("a", 1_000, "one-a"), now);
        assert_eq!(pipeline.flush(now), 3);

        let ids: Vec<&str> = pipeline.timeline().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_dedup_within_window() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        let base = 1_700_000_000_000u64;
        let now = Timestamp::new(base);
        pipeline.enqueue(message("a", base + 10_000, "Same"), now);
        pipeline.enqueue(message("b", base + 10_200, "Same"), now);
        assert_eq!(pipeline.flush(now), 1);
        assert_eq!(pipeline.timeline().len(), 1);
        assert_eq!(pipeline.timeline()[0].content, "Same");
    }

    #[test]
    fn test_dedup_normalizes_content() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        let now = Timestamp::new(0);
        pipeline.enqueue(message("a", 1_000, "hello world"), now);
        pipeline.enqueue(message("b", 1_100, "  HELLO   world "), now);
        assert_eq!(pipeline.flush(now), 1);
    }

    #[test]
    fn test_dedup_across_flushes_but_not_across_window() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        pipeline.enqueue(message("a", 1_000, "same"), Timestamp::new(1_000));
        assert_eq!(pipeline.flush(Timestamp::new(1_000)), 1);

        // within the 30 s window: dropped
        pipeline.enqueue(message("b", 20_000, "same"), Timestamp::new(20_000));
        assert_eq!(pipeline.flush(Timestamp::new(20_000)), 0);

        // far outside the window: accepted again
        pipeline.enqueue(message("c", 60_000, "same"), Timestamp::new(60_000));
        assert_eq!(pipeline.flush(Timestamp::new(60_000)), 1);
    }

    #[test]
    fn test_mesh_local_appends_old_arrivals() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        pipeline.enqueue(message("new", 5_000, "newest"), Timestamp::new(0));
        pipeline.flush(Timestamp::new(0));
        pipeline.enqueue(message("old", 1_000, "older"), Timestamp::new(200));
        pipeline.flush(Timestamp::new(200));

        let ids: Vec<&str> = pipeline.timeline().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_geohash_inserts_chronologically() {
        let mut pipeline = pipeline(TimelineMode::Geohash);
        pipeline.enqueue(message("new", 5_000, "newest"), Timestamp::new(0));
        pipeline.flush(Timestamp::new(0));
        pipeline.enqueue(message("old", 1_000, "older"), Timestamp::new(200));
        pipeline.flush(Timestamp::new(200));

        let ids: Vec<&str> = pipeline.timeline().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["old", "new"]);
    }

    #[test]
    fn test_batch_window_gating() {
        let mut pipeline = pipeline(TimelineMode::MeshLocal);
        pipeline.enqueue(message("a", 1_000, "hi"), Timestamp::new(0));
        assert_eq!(pipeline.flush_due(Timestamp::new(50)), 0);
        assert_eq!(pipeline.flush_due(Timestamp::new(100)), 1);
        // nothing pending, nothing flushed
        assert_eq!(pipeline.flush_due(Timestamp::new(300)), 0);
    }
}
