//! Pending file manager
//!
//! Bounded in-memory hold for inbound file transfers awaiting user
//! acceptance. Admission may evict older entries (oldest first) to stay
//! inside the count and byte budgets; entries expire on a periodic tick.
//! File bytes live only in memory and are wiped on panic clear.
//!
//! The manager is shared between the mesh loop (adds) and the UI thread
//! (accept/decline), so all state sits behind one mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PendingFileConfig;
use crate::errors::{FileError, Result};
use crate::event::{AppEvent, EventEmitter};
use crate::types::{PeerId, TimeSource, Timestamp};

// ----------------------------------------------------------------------------
// Pending Transfer
// ----------------------------------------------------------------------------

/// One inbound file waiting for the user
#[derive(Debug, Clone)]
pub struct PendingFileTransfer {
    pub id: String,
    pub sender_peer_id: PeerId,
    pub sender_nickname: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub content: Vec<u8>,
    pub timestamp: Timestamp,
    pub is_private: bool,
}

impl PendingFileTransfer {
    /// Held bytes
    pub fn file_size(&self) -> usize {
        self.content.len()
    }

    /// Name to show the user: the sender's file name, or one derived from
    /// the mime type
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.file_name {
            if !name.is_empty() {
                return name.clone();
            }
        }
        format!("file.{}", extension_for_mime(self.mime_type.as_deref()))
    }
}

fn extension_for_mime(mime: Option<&str>) -> &'static str {
    match mime {
        Some("image/png") => "png",
        Some("image/jpeg") => "jpg",
        Some("image/gif") => "gif",
        Some("image/webp") => "webp",
        Some("audio/mpeg") => "mp3",
        Some("audio/ogg") => "ogg",
        Some("video/mp4") => "mp4",
        Some("application/pdf") => "pdf",
        Some("text/plain") => "txt",
        _ => "bin",
    }
}

// ----------------------------------------------------------------------------
// Manager
// ----------------------------------------------------------------------------

/// Bounded, evicting hold of pending transfers
pub struct PendingFileManager {
    config: PendingFileConfig,
    inner: Mutex<HashMap<String, PendingFileTransfer>>,
    time: Arc<dyn TimeSource>,
    events: EventEmitter,
}

impl PendingFileManager {
    pub fn new(
        config: PendingFileConfig,
        time: Arc<dyn TimeSource>,
        events: EventEmitter,
    ) -> Self {
        Self {
            config,
            inner: Mutex::new(HashMap::new()),
            time,
            events,
        }
    }

    /// Admit an inbound transfer, evicting older entries as needed.
    ///
    /// Returns `None` (after emitting nothing) when the file cannot fit the
    /// byte budget even with the queue emptied.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        sender_peer_id: PeerId,
        sender_nickname: &str,
        file_name: Option<String>,
        mime_type: Option<String>,
        content: Vec<u8>,
        is_private: bool,
    ) -> Option<PendingFileTransfer> {
        if content.len() > self.config.max_total_bytes {
            debug!(
                size = content.len(),
                "rejecting file larger than the whole byte budget"
            );
            return None;
        }

        let mut inner = self.inner.lock().expect("pending file lock");

        // Count bound: evict the single oldest entry.
        if inner.len() >= self.config.max_pending_count {
            if let Some(id) = oldest_id(&inner) {
                inner.remove(&id);
                self.events.emit(AppEvent::PendingFileRemoved { id });
            }
        }

        // Byte bound: evict oldest-first until the newcomer fits.
        let mut total: usize = inner.values().map(|f| f.file_size()).sum();
        while total + content.len() > self.config.max_total_bytes {
            let Some(id) = oldest_id(&inner) else {
                return None;
            };
            if let Some(evicted) = inner.remove(&id) {
                total -= evicted.file_size();
                self.events.emit(AppEvent::PendingFileRemoved { id });
            }
        }

        let transfer = PendingFileTransfer {
            id: Uuid::new_v4().to_string(),
            sender_peer_id,
            sender_nickname: sender_nickname.to_string(),
            file_name,
            mime_type,
            content,
            timestamp: self.time.now(),
            is_private,
        };
        info!(
            id = %transfer.id,
            from = %sender_peer_id,
            size = transfer.file_size(),
            "pending file added"
        );
        self.events.emit(AppEvent::PendingFileAdded {
            id: transfer.id.clone(),
            peer_id: sender_peer_id,
            file_size: transfer.file_size(),
        });
        inner.insert(transfer.id.clone(), transfer.clone());
        Some(transfer)
    }

    /// Look up one transfer
    pub fn get(&self, id: &str) -> Option<PendingFileTransfer> {
        self.inner
            .lock()
            .expect("pending file lock")
            .get(id)
            .cloned()
    }

    /// All pending transfers, newest first
    pub fn all(&self) -> Vec<PendingFileTransfer> {
        let inner = self.inner.lock().expect("pending file lock");
        let mut all: Vec<_> = inner.values().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all
    }

    /// Accept: remove from the queue first, then hand to the save handler.
    /// The entry is gone even if the handler fails.
    pub fn accept<F, T>(&self, id: &str, save: F) -> Result<T>
    where
        F: FnOnce(PendingFileTransfer) -> Result<T>,
    {
        let transfer = self
            .inner
            .lock()
            .expect("pending file lock")
            .remove(id)
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        self.events.emit(AppEvent::PendingFileRemoved {
            id: id.to_string(),
        });
        save(transfer)
    }

    /// Decline and drop one transfer
    pub fn decline(&self, id: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("pending file lock")
            .remove(id)
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        self.events.emit(AppEvent::PendingFileRemoved {
            id: id.to_string(),
        });
        Ok(())
    }

    /// Drop everything (panic clear included)
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().expect("pending file lock");
        for id in inner.keys().cloned().collect::<Vec<_>>() {
            self.events.emit(AppEvent::PendingFileRemoved { id });
        }
        inner.clear();
    }

    /// `(count, total_bytes)` currently held
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.lock().expect("pending file lock");
        (inner.len(), inner.values().map(|f| f.file_size()).sum())
    }

    /// Expire entries older than the configured lifetime; driven by the
    /// mesh loop's 30-second tick
    pub fn expire_tick(&self) {
        let now = self.time.now();
        let lifetime_ms = self.config.expiration.as_millis() as u64;
        let mut inner = self.inner.lock().expect("pending file lock");
        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, f)| now.millis_since(f.timestamp) > lifetime_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            inner.remove(&id);
            debug!(id = %id, "pending file expired");
            self.events.emit(AppEvent::PendingFileRemoved { id });
        }
    }
}

fn oldest_id(inner: &HashMap<String, PendingFileTransfer>) -> Option<String> {
    inner
        .values()
        .min_by_key(|f| f.timestamp)
        .map(|f| f.id.clone())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::null_emitter;
    use crate::types::ManualTimeSource;
    use std::time::Duration;

    fn manager(config: PendingFileConfig) -> (PendingFileManager, ManualTimeSource) {
        let clock = ManualTimeSource::new(1_000);
        let manager =
            PendingFileManager::new(config, Arc::new(clock.clone()), null_emitter());
        (manager, clock)
    }

    fn sender() -> PeerId {
        PeerId::new([1; 8])
    }

    #[test]
    fn test_add_and_stats() {
        let (manager, _) = manager(PendingFileConfig::default());
        let added = manager
            .add(sender(), "alice", None, None, vec![0; 100], false)
            .unwrap();
        assert_eq!(added.file_size(), 100);
        assert_eq!(manager.stats(), (1, 100));
    }

    #[test]
    fn test_count_bound_evicts_single_oldest() {
        let (manager, clock) = manager(PendingFileConfig {
            max_pending_count: 2,
            ..PendingFileConfig::default()
        });
        let a = manager
            .add(sender(), "a", None, None, vec![0; 10], false)
            .unwrap();
        clock.advance(10);
        let b = manager
            .add(sender(), "b", None, None, vec![0; 10], false)
            .unwrap();
        clock.advance(10);
        let c = manager
            .add(sender(), "c", None, None, vec![0; 10], false)
            .unwrap();

        assert!(manager.get(&a.id).is_none());
        assert!(manager.get(&b.id).is_some());
        assert!(manager.get(&c.id).is_some());
        assert_eq!(manager.stats().0, 2);
    }

    #[test]
    fn test_size_bound_evicts_oldest_until_fit() {
        let (manager, clock) = manager(PendingFileConfig {
            max_pending_count: 100,
            max_total_bytes: 500,
            expiration: Duration::from_secs(300),
        });
        let first = manager
            .add(sender(), "a", None, None, vec![0; 200], false)
            .unwrap();
        clock.advance(10);
        let second = manager
            .add(sender(), "b", None, None, vec![0; 200], false)
            .unwrap();
        clock.advance(10);
        let third = manager
            .add(sender(), "c", None, None, vec![0; 300], false)
            .unwrap();

        // the first 200-byte file made room for the 300-byte newcomer
        assert!(manager.get(&first.id).is_none());
        assert!(manager.get(&second.id).is_some());
        assert!(manager.get(&third.id).is_some());
        assert_eq!(manager.stats(), (2, 500));
    }

    #[test]
    fn test_oversize_file_rejected() {
        let (manager, _) = manager(PendingFileConfig {
            max_total_bytes: 100,
            ..PendingFileConfig::default()
        });
        assert!(manager
            .add(sender(), "a", None, None, vec![0; 101], false)
            .is_none());
        assert_eq!(manager.stats(), (0, 0));
    }

    #[test]
    fn test_bounds_hold_after_any_sequence() {
        let config = PendingFileConfig {
            max_pending_count: 3,
            max_total_bytes: 250,
            expiration: Duration::from_secs(300),
        };
        let (manager, clock) = manager(config.clone());
        for i in 0..20usize {
            clock.advance(1);
            manager.add(sender(), "x", None, None, vec![0; 40 + i * 7], false);
            let (count, total) = manager.stats();
            assert!(count <= config.max_pending_count);
            assert!(total <= config.max_total_bytes);
        }
    }

    #[test]
    fn test_accept_removes_then_saves() {
        let (manager, _) = manager(PendingFileConfig::default());
        let added = manager
            .add(sender(), "a", Some("pic.png".into()), None, vec![1, 2, 3], true)
            .unwrap();

        let saved = manager
            .accept(&added.id, |transfer| {
                Ok(format!("/downloads/{}", transfer.display_name()))
            })
            .unwrap();
        assert_eq!(saved, "/downloads/pic.png");
        assert!(manager.get(&added.id).is_none());

        match manager.accept(&added.id, |_| Ok(())) {
            Err(crate::BitchatError::File(FileError::NotFound(_))) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_decline_and_clear() {
        let (manager, _) = manager(PendingFileConfig::default());
        let added = manager
            .add(sender(), "a", None, None, vec![0; 10], false)
            .unwrap();
        manager.decline(&added.id).unwrap();
        assert!(manager.decline(&added.id).is_err());

        manager.add(sender(), "a", None, None, vec![0; 10], false);
        manager.add(sender(), "a", None, None, vec![0; 10], false);
        manager.clear_all();
        assert_eq!(manager.stats(), (0, 0));
    }

    #[test]
    fn test_expiration_tick() {
        let (manager, clock) = manager(PendingFileConfig {
            expiration: Duration::from_secs(300),
            ..PendingFileConfig::default()
        });
        manager.add(sender(), "a", None, None, vec![0; 10], false);
        clock.advance(299_000);
        manager.expire_tick();
        assert_eq!(manager.stats().0, 1);
        clock.advance(2_000);
        manager.expire_tick();
        assert_eq!(manager.stats().0, 0);
    }

    #[test]
    fn test_display_name_from_mime() {
        let (manager, _) = manager(PendingFileConfig::default());
        let added = manager
            .add(
                sender(),
                "a",
                None,
                Some("image/png".into()),
                vec![0; 4],
                false,
            )
            .unwrap();
        assert_eq!(added.display_name(), "file.png");
    }
}
