use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application configuration
///
/// Persisted as JSON in the platform config directory; unknown or missing
/// fields fall back to defaults so old settings files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Automatically start scanning on startup
    pub auto_scan_on_startup: bool,

    /// Bottle capacity used for volume computation, in milliliters
    pub bottle_capacity_ml: u32,

    /// Readings with a distance below this are treated as "no bottle
    /// present" and forced to level 0, in millimeters
    pub min_valid_distance_mm: f64,

    /// How many readings each calibration step collects before reducing
    pub calibration_samples: usize,

    /// Scan deadline, in seconds
    pub scan_timeout_secs: u64,

    /// Connection attempt deadline, in seconds
    pub connect_timeout_secs: u64,

    /// How long to wait after a deep-sleep command before assuming the
    /// peripheral dropped the link, in seconds
    pub sleep_grace_secs: u64,

    /// Log verbosity
    pub log_level: LogLevel,

    /// Path to save settings
    #[serde(skip)]
    pub settings_path: PathBuf,
}

/// Log verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        write!(f, "{}", name)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auto_scan_on_startup: true,
            bottle_capacity_ml: 750,
            min_valid_distance_mm: 40.0,
            calibration_samples: 10,
            scan_timeout_secs: 15,
            connect_timeout_secs: 10,
            sleep_grace_secs: 5,
            log_level: LogLevel::Info,
            settings_path: default_settings_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default settings path, falling back to
    /// defaults when no settings file exists yet.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(default_settings_path())
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::debug!("No settings file at {:?}, using defaults", path);
            let mut config = Self::default();
            config.settings_path = path;
            return Ok(config);
        }
        let raw = fs::read_to_string(&path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.settings_path = path;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to its settings path.
    pub fn save(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(&self.settings_path, raw)?;
        log::debug!("Settings saved to {:?}", self.settings_path);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bottle_capacity_ml == 0 {
            return Err(ConfigError::Invalid(
                "bottle_capacity_ml must be positive".to_string(),
            ));
        }
        if !self.min_valid_distance_mm.is_finite() || self.min_valid_distance_mm < 0.0 {
            return Err(ConfigError::Invalid(
                "min_valid_distance_mm must be a non-negative number".to_string(),
            ));
        }
        if self.calibration_samples == 0 {
            return Err(ConfigError::Invalid(
                "calibration_samples must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_bottle_capacity_ml(mut self, capacity_ml: u32) -> Self {
        self.bottle_capacity_ml = capacity_ml;
        self
    }

    pub fn with_scan_timeout_secs(mut self, secs: u64) -> Self {
        self.scan_timeout_secs = secs;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn sleep_grace(&self) -> Duration {
        Duration::from_secs(self.sleep_grace_secs)
    }
}

/// Get the default settings path
fn default_settings_path() -> PathBuf {
    dirs_next::config_dir()
        .map(|config_dir| config_dir.join("aquasense").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}
