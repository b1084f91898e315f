//! Peer activity: how many other devices have been heard from recently.
//!
//! There is no handshake on the broadcast medium, so liveness is inferred:
//! every foreign message id heard counts as a sign of another participant,
//! and explicit presence heartbeats count per device. Advisory only; the
//! relay protocol never consults it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use pulse_core::wire::MessageId;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PeerKey {
    Message(MessageId),
    Device(String),
}

#[derive(Debug)]
pub struct PeerActivity {
    window: Duration,
    last_seen: HashMap<PeerKey, Instant>,
}

impl PeerActivity {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// A fragment of a foreign message was heard.
    pub fn observe_message(&mut self, id: MessageId, now: Instant) {
        self.last_seen.insert(PeerKey::Message(id), now);
    }

    /// A presence heartbeat from `device` was heard.
    pub fn observe_presence(&mut self, device: &str, now: Instant) {
        self.last_seen.insert(PeerKey::Device(device.to_string()), now);
    }

    /// Count entries seen within the liveness window, dropping the rest.
    pub fn active_count(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.last_seen.len();
        self.last_seen
            .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        let removed = before - self.last_seen.len();
        if removed > 0 {
            tracing::debug!(removed, "expired peer activity entries");
        }
        self.last_seen.len()
    }

    /// Devices that announced themselves and are still live.
    pub fn active_devices(&mut self, now: Instant) -> Vec<String> {
        self.active_count(now);
        let mut devices: Vec<String> = self
            .last_seen
            .keys()
            .filter_map(|k| match k {
                PeerKey::Device(d) => Some(d.clone()),
                PeerKey::Message(_) => None,
            })
            .collect();
        devices.sort();
        devices
    }

    pub fn reset(&mut self) {
        self.last_seen.clear();
    }
}
