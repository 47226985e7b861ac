//! Relay transport configuration

use nostr_sdk::Keys;

/// Settings for the Nostr fallback transport
#[derive(Debug, Clone)]
pub struct NostrConfig {
    /// Relay websocket URLs
    pub relays: Vec<String>,
    /// Long-term relay identity; generated fresh when absent
    pub keys: Option<Keys>,
    /// Kind of the inner (sealed) message event
    pub dm_kind: u16,
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.primal.net".to_string(),
            ],
            keys: None,
            dm_kind: 14,
        }
    }
}

impl NostrConfig {
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_keys(mut self, keys: Keys) -> Self {
        self.keys = Some(keys);
        self
    }
}
