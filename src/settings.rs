//! ClearScope `*_AcquireSettings.txt` parsing.
//!
//! The instrument writes the file when an acquisition starts, before any
//! tile. It is read once to learn the grid dimensions.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinates::AcquisitionGrid;

static SETTING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w*) = (.*)$").expect("settings pattern is valid"));

pub const SETTINGS_SUFFIX: &str = "_AcquireSettings.txt";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file {path} is missing key {key}")]
    MissingKey { path: PathBuf, key: &'static str },

    #[error("settings key {key} in {path} is not a positive integer: {value:?}")]
    InvalidValue {
        path: PathBuf,
        key: &'static str,
        value: SettingValue,
    },

    #[error("waiting for acquisition settings was cancelled")]
    Cancelled,

    #[error("invalid settings search pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl SettingValue {
    fn parse(raw: &str) -> Self {
        match raw {
            "True" => SettingValue::Bool(true),
            "False" => SettingValue::Bool(false),
            _ => match raw.parse::<f64>() {
                Ok(value) if value.is_finite() => SettingValue::Number(value),
                _ => SettingValue::Text(raw.to_string()),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SettingValue::Number(value) => Some(*value),
            _ => None,
        }
    }
}

/// Typed `key = value` mapping read from an acquisition settings file.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionSettings {
    pub path: PathBuf,
    pub values: HashMap<String, SettingValue>,
}

impl AcquisitionSettings {
    pub fn parse(path: impl Into<PathBuf>, content: &str) -> Self {
        let values = content
            .lines()
            .filter_map(|line| SETTING_LINE.captures(line.trim_end_matches('\r')))
            .map(|caps| (caps[1].to_string(), SettingValue::parse(&caps[2])))
            .collect();
        Self {
            path: path.into(),
            values,
        }
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(path, &content))
    }

    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.values.get(key)
    }

    /// Grid scanned by the instrument: `ScanGridY` rows by `ScanGridX` columns.
    pub fn grid(&self) -> Result<AcquisitionGrid, SettingsError> {
        let nrow = self.dimension("ScanGridY")?;
        let ncol = self.dimension("ScanGridX")?;
        Ok(AcquisitionGrid::new(nrow, ncol))
    }

    /// Number of planes per tile, when the instrument reports it.
    pub fn stack_depth(&self) -> Option<usize> {
        self.get("StackDepths")
            .and_then(SettingValue::as_f64)
            .map(|v| v as usize)
    }

    fn dimension(&self, key: &'static str) -> Result<usize, SettingsError> {
        let value = self.get(key).ok_or_else(|| SettingsError::MissingKey {
            path: self.path.clone(),
            key,
        })?;
        match value.as_f64() {
            Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as usize),
            _ => Err(SettingsError::InvalidValue {
                path: self.path.clone(),
                key,
                value: value.clone(),
            }),
        }
    }
}

/// First settings file in `dir`, if the instrument has written one.
pub fn find_settings_file(dir: &Path) -> Result<Option<PathBuf>, SettingsError> {
    let pattern = format!(
        "{}/*{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        SETTINGS_SUFFIX
    );
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)?.filter_map(Result::ok).collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Block until the settings file shows up in `dir`, then parse it.
///
/// There is no timeout: the acquisition may not have started yet. The wait
/// ends early only when `cancel` fires.
pub async fn wait_for_settings(
    dir: &Path,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<AcquisitionSettings, SettingsError> {
    info!(dir = %dir.display(), "Waiting for acquisition settings");
    loop {
        if let Some(path) = find_settings_file(dir)? {
            info!(path = %path.display(), "Acquisition settings found");
            return AcquisitionSettings::load(&path);
        }
        debug!("Acquisition settings not written yet");
        tokio::select! {
            _ = cancel.cancelled() => return Err(SettingsError::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "ScanGridX = 13\nScanGridY = 17\nStackDepths = 1200\n\
        Objective = 10x\nLaserOn = True\nShutter = False\nExposure = 2.5\nnot a setting\n";

    #[test]
    fn test_parse_typed_values() {
        let settings = AcquisitionSettings::parse("s.txt", SAMPLE);
        assert_eq!(settings.get("ScanGridX"), Some(&SettingValue::Number(13.0)));
        assert_eq!(settings.get("LaserOn"), Some(&SettingValue::Bool(true)));
        assert_eq!(settings.get("Shutter"), Some(&SettingValue::Bool(false)));
        assert_eq!(settings.get("Exposure"), Some(&SettingValue::Number(2.5)));
        assert_eq!(
            settings.get("Objective"),
            Some(&SettingValue::Text("10x".to_string()))
        );
        assert_eq!(settings.values.len(), 7);
        assert_eq!(settings.stack_depth(), Some(1200));
    }

    #[test]
    fn test_grid_uses_y_for_rows() {
        let settings = AcquisitionSettings::parse("s.txt", SAMPLE);
        assert_eq!(settings.grid().unwrap(), AcquisitionGrid::new(17, 13));
    }

    #[test]
    fn test_grid_requires_keys() {
        let settings = AcquisitionSettings::parse("s.txt", "ScanGridX = 4\n");
        assert!(matches!(
            settings.grid(),
            Err(SettingsError::MissingKey { key: "ScanGridY", .. })
        ));

        let settings = AcquisitionSettings::parse("s.txt", "ScanGridX = 4\nScanGridY = many\n");
        assert!(matches!(
            settings.grid(),
            Err(SettingsError::InvalidValue { key: "ScanGridY", .. })
        ));
    }

    #[tokio::test]
    async fn test_wait_for_settings_finds_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240101_AcquireSettings.txt"), SAMPLE).unwrap();
        let cancel = CancellationToken::new();
        let settings = wait_for_settings(dir.path(), Duration::from_millis(5), &cancel)
            .await
            .unwrap();
        assert_eq!(settings.grid().unwrap().len(), 17 * 13);
    }

    #[tokio::test]
    async fn test_wait_for_settings_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_settings(dir.path(), Duration::from_millis(5), &cancel).await;
        assert!(matches!(result, Err(SettingsError::Cancelled)));
    }
}
