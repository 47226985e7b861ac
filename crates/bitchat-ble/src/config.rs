//! BLE link configuration

use std::time::Duration;

/// Tuning for the BLE mesh link
#[derive(Debug, Clone)]
pub struct BleLinkConfig {
    /// Prefix for the advertised device name
    pub device_name_prefix: String,
    /// Timeout for one connection attempt
    pub connection_timeout: Duration,
    /// How long one scan burst runs before connecting to discoveries
    pub scan_interval: Duration,
    /// Per-peer outbound frame queue depth; overflow drops the frame
    pub write_queue_depth: usize,
    /// Reconnect backoff floor
    pub backoff_min: Duration,
    /// Reconnect backoff ceiling
    pub backoff_max: Duration,
    /// Assumed ATT MTU when the stack does not report one
    pub assumed_att_mtu: usize,
    /// Largest whole frame handed to the link before the mesh fragments;
    /// frames themselves are chunked at the ATT payload size on the air
    pub max_frame_len: usize,
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        Self {
            device_name_prefix: "BitChat".to_string(),
            connection_timeout: Duration::from_secs(10),
            scan_interval: Duration::from_secs(5),
            write_queue_depth: 128,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            assumed_att_mtu: 247,
            max_frame_len: 512,
        }
    }
}

impl BleLinkConfig {
    pub fn with_device_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.device_name_prefix = prefix.into();
        self
    }

    /// Application bytes per ATT write: the MTU minus 3 bytes of ATT header
    pub fn effective_mtu(&self) -> usize {
        self.assumed_att_mtu.saturating_sub(3)
    }
}
