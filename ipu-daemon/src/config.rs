//! Configuration for the IPU daemon.

use std::path::Path;

use serde::{Deserialize, Serialize};

use ipu_core::{Configuration, IpuError, PoolGeometry};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Reserved memory pool.
    pub pool: PoolConfig,
    /// Control listener.
    pub control: ControlConfig,
    /// Simulated frame source.
    pub simulation: SimulationConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Pipeline configuration installed at boot.
    pub pipeline: Configuration,
}

/// Reserved memory pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Physical start address.
    pub base: u64,
    /// Bytes reserved.
    pub size: u64,
    /// Bytes per slot; a multiple of 16.
    pub slot_size: u64,
    /// Number of slots (0 = as many as fit).
    pub slot_count: usize,
}

/// Control listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Address to bind.
    pub listen_addr: String,
    /// TCP port for control connections.
    pub port: u16,
    /// Init and start the pipeline from `[pipeline]` at boot.
    pub autostart: bool,
}

/// Simulated frame source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Generate frames while the pipeline runs.
    pub enabled: bool,
    /// Frames per second.
    pub fps: u32,
    /// End every n-th frame in a drop error (0 = never).
    pub drop_every: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            control: ControlConfig::default(),
            simulation: SimulationConfig::default(),
            logging: LoggingConfig::default(),
            pipeline: Configuration::hd_default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base: 0x1000_0000,
            size: 8 * 0x20_0000,
            slot_size: 0x20_0000,
            slot_count: 0,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".into(),
            port: 7340,
            autostart: true,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 30,
            drop_every: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DaemonConfig {
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
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Validated pool geometry.
    pub fn geometry(&self) -> Result<PoolGeometry, IpuError> {
        PoolGeometry::new(
            self.pool.base,
            self.pool.size,
            self.pool.slot_size,
            self.pool.slot_count,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────
