//! Per-connection peer state and reconnect backoff

use std::time::Duration;

use rand::Rng;

use crate::config::BleLinkConfig;

/// Connection lifecycle for one remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Failed,
}

/// Bookkeeping for one remote BLE device
#[derive(Debug)]
pub struct BlePeer {
    /// btleplug peripheral id, stringly to stay platform-neutral
    pub address: String,
    pub state: ConnectionState,
    /// consecutive failed connection attempts
    pub failures: u32,
    /// next attempt is allowed after this instant
    pub retry_at: Option<tokio::time::Instant>,
}

impl BlePeer {
    pub fn new(address: String) -> Self {
        Self {
            address,
            state: ConnectionState::Discovered,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether a connection attempt may start now
    pub fn can_attempt(&self, now: tokio::time::Instant) -> bool {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => false,
            _ => self.retry_at.map_or(true, |at| now >= at),
        }
    }

    pub fn mark_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.failures = 0;
        self.retry_at = None;
    }

    /// Record a failure and schedule the next attempt with exponential
    /// backoff (floor to ceiling) and ±20 % jitter
    pub fn mark_failed(&mut self, config: &BleLinkConfig, now: tokio::time::Instant) {
        self.state = ConnectionState::Failed;
        self.failures = self.failures.saturating_add(1);
        self.retry_at = Some(now + backoff_delay(config, self.failures));
    }

    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Discovered;
    }
}

/// Exponential backoff with jitter for the given failure count
pub fn backoff_delay(config: &BleLinkConfig, failures: u32) -> Duration {
    let base = config
        .backoff_min
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(config.backoff_max);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(base.as_secs_f64() * jitter).min(config.backoff_max)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_progression() {
        let config = BleLinkConfig::default();
        for failures in 1..10 {
            let delay = backoff_delay(&config, failures);
            assert!(delay >= Duration::from_secs_f64(0.8));
            assert!(delay <= config.backoff_max);
        }
        // deep failure counts saturate at the ceiling (minus jitter slack)
        let deep = backoff_delay(&config, 30);
        assert!(deep >= Duration::from_secs_f64(30.0 * 0.8));
    }

    #[test]
    fn test_connection_lifecycle() {
        let config = BleLinkConfig::default();
        let now = tokio::time::Instant::now();
        let mut peer = BlePeer::new("aa:bb:cc:dd:ee:ff".into());

        assert!(peer.can_attempt(now));
        peer.mark_connecting();
        assert!(!peer.can_attempt(now));
        peer.mark_connected();
        assert!(peer.is_connected());

        peer.mark_disconnected();
        peer.mark_failed(&config, now);
        assert!(!peer.can_attempt(now));
        assert!(peer.can_attempt(now + Duration::from_secs(31)));
    }
}
