//! Application settings.
//!
//! Settings live in `<data_dir>/tabletalk/config.json`. A missing or
//! unreadable file yields the defaults, so a fresh install works without any
//! setup. The AI credential is never stored here; it is read from
//! `OPENAI_API_KEY` and kept as a [`SecretString`].

use crate::error::{EdaError, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    pub delimiter: char,
    pub has_header: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AggregateConfig {
    /// Worker pool size. 0 means one worker per available core.
    pub workers: usize,
    pub partition_timeout_secs: u64,
    /// Reservoir bound per numeric column, used for quartiles and anomalies.
    pub sample_size: usize,
    pub seed: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            partition_timeout_secs: 60,
            sample_size: 10_000,
            seed: 0x5eed_7ab1_e7a1_4b00,
        }
    }
}

impl AggregateConfig {
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        }
    }

    pub fn partition_timeout(&self) -> Duration {
        Duration::from_secs(self.partition_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Standard deviations from the mean beyond which a value is an outlier.
    pub outlier_k: f64,
    /// |r| above which a pair is reported as strongly correlated.
    pub strong_correlation: f64,
    /// Maximum distinct values tracked per text column.
    pub category_cap: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            outlier_k: 3.0,
            strong_correlation: 0.5,
            category_cap: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_records_per_dataset: usize,
    pub max_bytes_per_dataset: Option<u64>,
    /// Number of recent records handed to the LLM collaborator.
    pub context_window: usize,
    /// Memory log location. `None` uses the standard data directory.
    pub path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_records_per_dataset: 200,
            max_bytes_per_dataset: None,
            context_window: 5,
            path: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AIConfig {
    pub enabled: bool,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for AIConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gpt-4o".to_owned(),
            temperature: 0.1,
            max_tokens: 2000,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    pub ingest: IngestConfig,
    pub aggregate: AggregateConfig,
    pub analysis: AnalysisConfig,
    pub memory: MemoryConfig,
    pub ai: AIConfig,
}

impl Settings {
    /// Rejects values the pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.ingest.delimiter.is_ascii() {
            return Err(EdaError::Configuration(format!(
                "delimiter must be a single ASCII character, got '{}'",
                self.ingest.delimiter
            )));
        }
        if self.aggregate.sample_size == 0 {
            return Err(EdaError::Configuration(
                "aggregate.sample_size must be at least 1".to_owned(),
            ));
        }
        if self.aggregate.partition_timeout_secs == 0 {
            return Err(EdaError::Configuration(
                "aggregate.partition_timeout_secs must be at least 1".to_owned(),
            ));
        }
        if !(self.analysis.outlier_k.is_finite() && self.analysis.outlier_k > 0.0) {
            return Err(EdaError::Configuration(format!(
                "analysis.outlier_k must be positive, got {}",
                self.analysis.outlier_k
            )));
        }
        if !(0.0..=1.0).contains(&self.analysis.strong_correlation) {
            return Err(EdaError::Configuration(format!(
                "analysis.strong_correlation must be within [0, 1], got {}",
                self.analysis.strong_correlation
            )));
        }
        if self.memory.max_records_per_dataset == 0 {
            return Err(EdaError::Configuration(
                "memory.max_records_per_dataset must be at least 1".to_owned(),
            ));
        }
        if self.memory.max_bytes_per_dataset == Some(0) {
            return Err(EdaError::Configuration(
                "memory.max_bytes_per_dataset must be positive when set".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn memory_path(&self) -> PathBuf {
        self.memory
            .path
            .clone()
            .unwrap_or_else(|| crate::utils::standard_paths().memory_file)
    }
}

/// Reads the LLM credential from the environment.
pub fn api_key_from_env() -> Option<SecretString> {
    std::env::var(API_KEY_ENV)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .map(|k| SecretString::new(k.into()))
}

pub fn get_config_path() -> PathBuf {
    crate::utils::standard_paths().base_dir.join("config.json")
}

pub fn load_settings() -> Settings {
    let path = get_config_path();
    if path.exists()
        && let Ok(content) = std::fs::read_to_string(&path)
    {
        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => return settings,
            Err(e) => {
                tracing::warn!("Ignoring invalid settings at {}: {e}", path.display());
            }
        }
    }

    Settings::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!((settings.analysis.outlier_k - 3.0).abs() < f64::EPSILON);
        assert_eq!(settings.aggregate.sample_size, 10_000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.analysis.outlier_k = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(EdaError::Configuration(_))
        ));

        let mut settings = Settings::default();
        settings.memory.max_records_per_dataset = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.ingest.delimiter = '§';
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "aggregate": { "workers": 2 } }"#).unwrap_or_default();
        assert_eq!(settings.aggregate.workers, 2);
        assert_eq!(settings.aggregate.sample_size, 10_000);
        assert_eq!(settings.memory.context_window, 5);
    }

    #[test]
    fn test_effective_workers_never_zero() {
        let cfg = AggregateConfig::default();
        assert!(cfg.effective_workers() >= 1);
    }
}
