//! Configuration system for Pulse.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PULSE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/pulse/config.toml
//!   3. ~/.config/pulse/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::DEFAULT_FRAGMENT_CAPACITY;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub node: NodeConfig,
    pub medium: MediumConfig,
    pub relay: RelayConfig,
    pub peers: PeersConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier this device stamps on queries and heartbeats.
    /// Empty = derived from the hostname at startup.
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediumConfig {
    /// Network interface carrying the broadcast medium. Empty = auto-detect.
    pub interface: String,
    /// UDP port frames are multicast to.
    pub port: u16,
    /// Data bytes per fragment.
    pub fragment_capacity: usize,
    /// Scheduler tick. One frame leaves the device per tick.
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the online backend, including the `/api` prefix.
    pub backend_url: String,
    /// Timeout for a single backend call.
    pub backend_timeout_secs: u64,
    /// Upper bound on each dedup set.
    pub dedup_capacity: usize,
    /// Dedup entries older than this are forgotten.
    pub dedup_ttl_secs: u64,
    /// Partial reassemblies older than this are evicted. 0 = never.
    pub reassembly_max_age_secs: u64,
    /// How often the daemon probes the backend for connectivity.
    pub connectivity_probe_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Peers not heard from within this window are no longer counted.
    pub liveness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Local HTTP API port (bound on 127.0.0.1).
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
        }
    }
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: 9300,
            fragment_capacity: DEFAULT_FRAGMENT_CAPACITY,
            tick_interval_ms: 250,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8080/api".to_string(),
            backend_timeout_secs: 20,
            dedup_capacity: 4096,
            dedup_ttl_secs: 3600,
            reassembly_max_age_secs: 120,
            connectivity_probe_secs: 5,
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self { liveness_secs: 30 }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 9380 }
    }
}

impl MediumConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl RelayConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }

    /// At least one second; a zero TTL would forget every id on insert.
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs.max(1))
    }

    pub fn connectivity_probe(&self) -> Duration {
        Duration::from_secs(self.connectivity_probe_secs.max(1))
    }

    /// `None` when eviction of partial reassemblies is disabled.
    pub fn reassembly_max_age(&self) -> Option<Duration> {
        (self.reassembly_max_age_secs > 0).then(|| Duration::from_secs(self.reassembly_max_age_secs))
    }
}

impl PeersConfig {
    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("pulse")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PulseConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            PulseConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a specific file without applying env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PULSE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PulseConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply PULSE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PULSE_NODE__DEVICE_ID") {
            self.node.device_id = v;
        }
        if let Some(v) = lookup("PULSE_MEDIUM__INTERFACE") {
            self.medium.interface = v;
        }
        if let Some(p) = lookup("PULSE_MEDIUM__PORT").and_then(|v| v.parse().ok()) {
            self.medium.port = p;
        }
        if let Some(c) = lookup("PULSE_MEDIUM__FRAGMENT_CAPACITY").and_then(|v| v.parse().ok()) {
            self.medium.fragment_capacity = c;
        }
        if let Some(t) = lookup("PULSE_MEDIUM__TICK_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.medium.tick_interval_ms = t;
        }
        if let Some(v) = lookup("PULSE_RELAY__BACKEND_URL") {
            self.relay.backend_url = v;
        }
        if let Some(t) = lookup("PULSE_RELAY__BACKEND_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.relay.backend_timeout_secs = t;
        }
        if let Some(c) = lookup("PULSE_RELAY__DEDUP_CAPACITY").and_then(|v| v.parse().ok()) {
            self.relay.dedup_capacity = c;
        }
        if let Some(t) = lookup("PULSE_RELAY__DEDUP_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.relay.dedup_ttl_secs = t;
        }
        if let Some(a) = lookup("PULSE_RELAY__REASSEMBLY_MAX_AGE_SECS").and_then(|v| v.parse().ok())
        {
            self.relay.reassembly_max_age_secs = a;
        }
        if let Some(p) = lookup("PULSE_RELAY__CONNECTIVITY_PROBE_SECS").and_then(|v| v.parse().ok())
        {
            self.relay.connectivity_probe_secs = p;
        }
        if let Some(l) = lookup("PULSE_PEERS__LIVENESS_SECS").and_then(|v| v.parse().ok()) {
            self.peers.liveness_secs = l;
        }
        if let Some(p) = lookup("PULSE_API__PORT").and_then(|v| v.parse().ok()) {
            self.api.port = p;
        }
    }
}
