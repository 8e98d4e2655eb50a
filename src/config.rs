//! Run configuration, loaded from TOML.
//!
//! ```toml
//! root = "/data/acquisition"
//! poll_interval_ms = 1000
//!
//! [instrument]
//! kind = "sequential"
//! nrow = 4
//! ncol = 6
//! tile_type = "tiff3d"
//!
//! [conversion]
//! intensity_threshold = 108
//! rel_error = 0.2
//!
//! [compression]
//! quantization_factor = 2
//! background = 108
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::converter::ConversionParameters;
use crate::coordinates::AcquisitionGrid;
use crate::enums::TileType;
use crate::store::CompressionSettings;
use crate::tile::DEFAULT_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which acquisition instrument produces the tiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InstrumentConfig {
    /// `{row}_{col}.{ext}` tiles written in raster order.
    Sequential {
        nrow: usize,
        ncol: usize,
        #[serde(default)]
        tile_type: TileType,
        /// Glob suffix after `{row}_{col}`; defaults to `tif` for file
        /// types and nothing for folder types.
        #[serde(default)]
        extension: Option<String>,
        #[serde(default)]
        channel: u32,
    },
    /// ClearScope; the grid is read from `0001/*_AcquireSettings.txt`.
    Clearscope,
}

/// Retry of tiles whose storage access failed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per tile, 1 disables retries.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, `attempt` counting from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.backoff_ms as f64 * factor).min(u64::MAX as f64) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory the instrument writes into.
    pub root: PathBuf,

    pub instrument: InstrumentConfig,

    #[serde(default = "default_channels")]
    pub n_channels: u32,

    /// Square sensor edge length, used to reshape raw dumps.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Abort the run after this many seconds.
    #[serde(default)]
    pub max_run_secs: Option<u64>,

    /// Conversion is skipped entirely when absent.
    #[serde(default)]
    pub conversion: Option<ConversionParameters>,

    #[serde(default)]
    pub compression: Option<CompressionSettings>,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// Also write logs to this file.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_channels() -> u32 {
    1
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

fn default_poll_interval() -> u64 {
    1000
}

impl PipelineConfig {
    pub fn new(root: impl Into<PathBuf>, instrument: InstrumentConfig) -> Self {
        Self {
            root: root.into(),
            instrument,
            n_channels: default_channels(),
            frame_size: default_frame_size(),
            poll_interval_ms: default_poll_interval(),
            max_run_secs: None,
            conversion: None,
            compression: None,
            retry: RetryPolicy::default(),
            log_file: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_run(&self) -> Option<Duration> {
        self.max_run_secs.map(Duration::from_secs)
    }

    /// Grid for sequential instruments; ClearScope learns it at startup.
    pub fn grid(&self) -> Option<AcquisitionGrid> {
        match self.instrument {
            InstrumentConfig::Sequential { nrow, ncol, .. } => Some(AcquisitionGrid::new(nrow, ncol)),
            InstrumentConfig::Clearscope => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(grid) = self.grid() {
            if grid.nrow == 0 || grid.ncol == 0 {
                return Err(ConfigError::Invalid(format!(
                    "grid must be at least 1x1, got {}x{}",
                    grid.nrow, grid.ncol
                )));
            }
        }
        if let InstrumentConfig::Sequential {
            tile_type: TileType::Apr,
            ..
        } = self.instrument
        {
            if self.conversion.is_some() {
                return Err(ConfigError::Invalid(
                    "apr tiles are already converted, remove [conversion]".to_string(),
                ));
            }
        }
        if self.n_channels == 0 {
            return Err(ConfigError::Invalid("n_channels must be at least 1".to_string()));
        }
        if self.frame_size == 0 {
            return Err(ConfigError::Invalid("frame_size must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        if let Some(params) = &self.conversion {
            params
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(compression) = &self.compression {
            if compression.quantization_factor < 1 {
                return Err(ConfigError::Invalid(
                    "quantization_factor must be at least 1".to_string(),
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
