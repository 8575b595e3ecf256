//! Runtime configuration for the transport, cache, worker and loader.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial TOML
//! table only overrides the keys it names. Durations are integer
//! milliseconds in `*_ms` fields with `Duration` accessors.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MdiError;

/// WebSocket transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Server URL (`ws://host:port/path`). TLS is not built in.
    pub url: String,
    /// Reconnect after unexpected closes.
    pub auto_reconnect: bool,
    /// Give up after this many consecutive attempts. `0` retries forever.
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Interval between outbound pings while connected. `0` disables.
    pub ping_interval_ms: u64,
    /// Close the socket when no heartbeat or pong arrives for this long.
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Depth of the handle-to-driver command channel.
    pub command_buffer: usize,
    /// Frames held while disconnected; past this the oldest is dropped.
    /// `0` keeps everything.
    pub max_queued: usize,
}

/// Where the L2 tier keeps its entries.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    Disk {
        path: PathBuf,
    },
}

/// Two-tier cache and prefetch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_max_entries: usize,
    pub l2_max_bytes: u64,
    pub l2_ttl_ms: u64,
    /// Slices queued ahead of a sequential scan.
    pub prefetch_count: usize,
    /// Recent indices remembered per file.
    pub history_len: usize,
    pub storage: StorageConfig,
    /// How often the loader sweeps expired L2 entries. `0` disables.
    pub purge_interval_ms: u64,
}

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Run operations on a dedicated thread.
    pub use_background: bool,
    /// Run synchronously when the thread cannot be started.
    pub fallback_to_sync: bool,
    pub call_timeout_ms: u64,
    /// Bounded request queue depth.
    pub queue_depth: usize,
}

/// Slice loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub request_timeout_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".into(),
            auto_reconnect: true,
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            ping_interval_ms: 15_000,
            heartbeat_timeout_ms: 45_000,
            connect_timeout_ms: 10_000,
            command_buffer: 256,
            max_queued: 1_024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 100,
            l2_max_bytes: 500 * 1024 * 1024,
            l2_ttl_ms: 24 * 60 * 60 * 1000,
            prefetch_count: 5,
            history_len: 10,
            storage: StorageConfig::Memory,
            purge_interval_ms: 60_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            use_background: true,
            fallback_to_sync: true,
            call_timeout_ms: 5_000,
            queue_depth: 64,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

// ── Accessors / validation ───────────────────────────────────────

impl TransportConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        (self.heartbeat_timeout_ms > 0).then(|| Duration::from_millis(self.heartbeat_timeout_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MdiError> {
        if !self.url.starts_with("ws://") {
            return Err(MdiError::Configuration(format!(
                "transport url must be ws://, got {}",
                self.url
            )));
        }
        if self.reconnect_base_delay_ms == 0 || self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(MdiError::Configuration(
                "reconnect delays must satisfy 0 < base <= max".into(),
            ));
        }
        if self.command_buffer == 0 {
            return Err(MdiError::Configuration("command_buffer must be > 0".into()));
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn l2_ttl(&self) -> Duration {
        Duration::from_millis(self.l2_ttl_ms)
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        (self.purge_interval_ms > 0).then(|| Duration::from_millis(self.purge_interval_ms))
    }

    pub fn validate(&self) -> Result<(), MdiError> {
        if self.l1_max_entries == 0 {
            return Err(MdiError::Configuration("l1_max_entries must be > 0".into()));
        }
        if self.history_len < 2 {
            return Err(MdiError::Configuration(
                "history_len must hold at least two accesses".into(),
            ));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Synchronous-only configuration.
    pub fn inline() -> Self {
        Self {
            use_background: false,
            ..Self::default()
        }
    }
}

impl LoaderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
