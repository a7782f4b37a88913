//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Session lifecycle settings.
    pub session: SessionConfig,
    /// Reconnection policy.
    pub reconnect: ReconnectConfig,
    /// Outbound state broadcast rates.
    pub sync: SyncConfig,
    /// Chunked asset transfer settings.
    pub transfer: TransferConfig,
    /// Remote state smoothing settings.
    pub filter: FilterConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Name shown to other participants.
    pub display_name: String,
    /// How long create/join may stay in `Connecting` before failing.
    pub connect_timeout_ms: u64,
    /// Maximum number of peers a host admits, itself included.
    pub max_peers: usize,
    /// Interval between heartbeat pings.
    pub heartbeat_interval_ms: u64,
    /// Keep disconnected peers around as ghosts instead of deleting them.
    pub retain_ghosts: bool,
}

/// Reconnection policy after signaling loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first full reconnection attempt.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
    /// Full reconnection attempts before the session fails.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0).
    pub jitter: f64,
}

/// Outbound pose/expression broadcast configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Pose broadcast rate (Hz).
    pub pose_rate_hz: u32,
    /// Expression broadcast rate (Hz).
    pub expression_rate_hz: u32,
    /// Minimum per-channel change before expressions are re-sent.
    pub expression_threshold: f32,
}

/// Chunked transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes per chunk message.
    pub chunk_size: usize,
    /// Pacing delay between consecutive chunks.
    pub chunk_delay_ms: u64,
    /// Rounds of `chunk-request` before a transfer fails.
    pub max_retries: u32,
    /// Delay between request rounds while chunks are missing.
    pub retry_interval_ms: u64,
    /// How long a sender keeps a finished source buffer for re-requests.
    pub source_retention_ms: u64,
    /// Upper bound on chunks per asset; larger transfers are refused.
    pub max_chunks: usize,
}

/// Remote state filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Cutoff frequency (Hz) for a signal at rest.
    pub min_cutoff: f32,
    /// How strongly speed raises the cutoff.
    pub beta: f32,
    /// Cutoff frequency (Hz) used to smooth the derivative estimate.
    pub derivative_cutoff: f32,
    /// Render delay behind the newest sample.
    pub interpolation_delay_ms: u64,
    /// Samples retained per channel.
    pub buffer_len: usize,
    /// Exponential blend factor applied to interpolated output (0..=1).
    pub smoothing: f32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "Guest".to_string(),
            connect_timeout_ms: 10_000,
            max_peers: 8,
            heartbeat_interval_ms: 5_000,
            retain_ghosts: true,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 3,
            jitter: 0.0,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            pose_rate_hz: 30,
            expression_rate_hz: 10,
            expression_threshold: 0.01,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16_000,
            chunk_delay_ms: 20,
            max_retries: 5,
            retry_interval_ms: 2_000,
            source_retention_ms: 60_000,
            max_chunks: 4_096,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_cutoff: 1.0,
            beta: 0.3,
            derivative_cutoff: 1.0,
            interpolation_delay_ms: 50,
            buffer_len: 8,
            smoothing: 0.5,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for Marionette, e.g. `~/.config/marionette`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("marionette")
}

// --- Load / Save / Reload ---

/// File name inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// when it does not exist.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if path.exists() {
            let config = read_file(&path)?;
            log::info!("Loaded config from {}", path.display());
            return Ok(config);
        }

        let config = Config::default();
        config.save(config_dir)?;
        log::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    /// Write this config to `config_dir/config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let write_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ConfigError::Write { path, source }
        };
        std::fs::create_dir_all(config_dir).map_err(write_err(config_dir))?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .struct_names(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Serialize)?;

        let path = config_dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, text).map_err(write_err(&path))
    }

    /// Re-read the file. Returns `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_file(&config_dir.join(CONFIG_FILE_NAME))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config changed on disk");
        Ok(Some(fresh))
    }
}
