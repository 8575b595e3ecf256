//! Configuration for the viewer client.

use std::path::Path;

use serde::{Deserialize, Serialize};

use mdi_core::{CacheConfig, LoaderConfig, MdiError, TransportConfig, WorkerConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// WebSocket connection and reconnection.
    pub transport: TransportConfig,
    /// L1/L2 cache and prefetch.
    pub cache: CacheConfig,
    /// Decode and pixel-transform offload.
    pub worker: WorkerConfig,
    /// Request timeouts.
    pub loader: LoaderConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive, e.g. `"info"` or `"mdi_core=debug"`.
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ViewerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        std::fs::write(path, Self::default().to_toml()?)
    }

    pub fn to_toml(&self) -> std::io::Result<String> {
        toml::to_string_pretty(self).map_err(std::io::Error::other)
    }

    /// Apply `--server` and check every section.
    pub fn resolve(mut self, server: Option<String>) -> Result<Self, MdiError> {
        if let Some(url) = server {
            self.transport.url = url;
        }
        self.transport.validate()?;
        self.cache.validate()?;
        Ok(self)
    }
}

// ── Tests ────────────────────────────────────────────────────────
