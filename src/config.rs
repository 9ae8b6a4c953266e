//! Configuration for the standard sequencer.

use crate::core::policy::{PolicyEntry, PolicyTable};
use crate::error::SequencerError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Suffix of the engine-added epoch column.
pub const EPOCH_SUFFIX: &str = "_epoch";

/// Upper bound for the grid period and the gap threshold (10 000 years).
pub const MAX_INTERVAL_MS: u64 = 10_000 * 365 * 24 * 60 * 60 * 1000;

/// Parameters of the sequencing engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencerConfig {
    /// Feature holding the event timestamp
    pub timestamp_column: String,

    /// Feature holding the event category, if events are grouped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_column: Option<String>,

    /// Policy overrides keyed by feature name or type key
    #[serde(default)]
    pub overwrite: PolicyTable,

    /// Replacement for the built-in default policy table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<PolicyTable>,

    /// Period of the resampling grid (milliseconds)
    #[serde(with = "millis_serde")]
    pub resampling_rate: Duration,

    /// Largest gap between events of one session (milliseconds)
    #[serde(with = "millis_serde")]
    pub gap_threshold: Duration,

    /// Rows per emitted sequence
    pub sequence_length: usize,

    /// Rows between the starts of consecutive sequences
    pub sequence_shift: usize,

    /// Time zone for timestamps without an explicit offset
    #[serde(default = "default_timezone")]
    pub source_timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            timestamp_column: "timestamp".to_string(),
            category_column: None,
            overwrite: PolicyTable::new(),
            defaults: None,
            resampling_rate: Duration::from_millis(1000),
            gap_threshold: Duration::from_millis(60_000),
            sequence_length: 16,
            sequence_shift: 1,
            source_timezone: default_timezone(),
        }
    }
}

impl SequencerConfig {
    pub fn new(timestamp_column: impl Into<String>) -> Self {
        Self {
            timestamp_column: timestamp_column.into(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, column: impl Into<String>) -> Self {
        self.category_column = Some(column.into());
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, entry: PolicyEntry) -> Self {
        self.overwrite.insert(key.into(), entry);
        self
    }

    pub fn with_defaults(mut self, defaults: PolicyTable) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn with_resampling_rate_ms(mut self, millis: u64) -> Self {
        self.resampling_rate = Duration::from_millis(millis);
        self
    }

    pub fn with_gap_threshold_ms(mut self, millis: u64) -> Self {
        self.gap_threshold = Duration::from_millis(millis);
        self
    }

    pub fn with_sequence(mut self, length: usize, shift: usize) -> Self {
        self.sequence_length = length;
        self.sequence_shift = shift;
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.source_timezone = tz.into();
        self
    }

    /// Name of the engine-added epoch column.
    pub fn epoch_column(&self) -> String {
        format!("{}{EPOCH_SUFFIX}", self.timestamp_column)
    }

    /// Grid period in milliseconds, saturating at [`MAX_INTERVAL_MS`].
    pub fn resampling_rate_ms(&self) -> i64 {
        bounded_millis(self.resampling_rate)
    }

    /// Gap threshold as a chrono duration, saturating at [`MAX_INTERVAL_MS`].
    pub fn gap_threshold_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(bounded_millis(self.gap_threshold))
    }

    /// Parse the configured source time zone.
    pub fn timezone(&self) -> Result<Tz, SequencerError> {
        self.source_timezone.parse::<Tz>().map_err(|_| {
            SequencerError::Config(format!("unknown time zone '{}'", self.source_timezone))
        })
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), SequencerError> {
        let fail = |msg: String| Err(SequencerError::Config(msg));

        if self.timestamp_column.trim().is_empty() {
            return fail("timestamp_column must not be empty".to_string());
        }
        if self.category_column.as_deref() == Some(self.timestamp_column.as_str()) {
            return fail("category_column must differ from timestamp_column".to_string());
        }
        if self.resampling_rate.as_millis() == 0 {
            return fail("resampling_rate must be at least 1 ms".to_string());
        }
        if self.resampling_rate.as_millis() > u128::from(MAX_INTERVAL_MS) {
            return fail(format!("resampling_rate must be at most {MAX_INTERVAL_MS} ms"));
        }
        if self.gap_threshold.as_millis() > u128::from(MAX_INTERVAL_MS) {
            return fail(format!("gap_threshold must be at most {MAX_INTERVAL_MS} ms"));
        }
        if self.sequence_length == 0 {
            return fail("sequence_length must be at least 1".to_string());
        }
        if self.sequence_shift == 0 {
            return fail("sequence_shift must be at least 1".to_string());
        }
        self.timezone()?;
        Ok(())
    }
}

fn bounded_millis(duration: Duration) -> i64 {
    let millis = duration.as_millis().min(u128::from(MAX_INTERVAL_MS));
    i64::try_from(millis).unwrap_or(i64::MAX)
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Engine parameters
    pub sequencer: SequencerConfig,

    /// Path for exported sequences
    pub export_path: PathBuf,

    /// Path for storing run statistics
    pub data_path: PathBuf,

    /// Worker threads used by the local runner
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("standard-sequencer");

        Self {
            sequencer: SequencerConfig::default(),
            export_path: data_dir.join("exports"),
            data_path: data_dir,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a file, or defaults if it does not exist.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::config_path())
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("standard-sequencer")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.export_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
}

/// Serde support for Duration as integer milliseconds.
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
