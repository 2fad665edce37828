use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Top-level configuration shared by the baseline, anomaly, and drift
/// features. Loaded from TOML by the CLI; tests and embedders construct it
/// directly.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Directory of source images to ingest.
    pub source_data: PathBuf,
    /// Directory tree for result CSVs, flagged images, and diagnostics.
    pub output_data: PathBuf,
    /// Baseline archive consumed by detection and drift tasks.
    #[serde(default)]
    pub baseline: Option<PathBuf>,
    /// Optional CSV mapping image filename to a ground-truth label, joined
    /// into the anomaly output for later verification.
    #[serde(default)]
    pub label_file: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

fn default_batch_size() -> usize {
    50
}
fn default_epochs() -> usize {
    15
}
fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.png".to_string(),
        "**/*.jpg".to_string(),
        "**/*.jpeg".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Registry key of the reconstruction model plugin.
    #[serde(default = "default_plugin")]
    pub plugin: String,
    /// Images are decoded to grayscale and resized to this square side.
    #[serde(default = "default_input_side")]
    pub input_side: u32,
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            plugin: default_plugin(),
            input_side: default_input_side(),
            latent_dim: default_latent_dim(),
            learning_rate: default_learning_rate(),
        }
    }
}

fn default_plugin() -> String {
    "dense".to_string()
}
fn default_input_side() -> u32 {
    32
}
fn default_latent_dim() -> usize {
    16
}
fn default_learning_rate() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// An item is anomalous when its reconstruction error exceeds
    /// `mean + sigma_k * stddev` of the baseline error distribution.
    #[serde(default = "default_sigma_k")]
    pub sigma_k: f32,
    /// A batch is drifted when its KS distance from the reference (or the
    /// previous batch) exceeds this value.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// Cap on the number of per-item errors retained in a distribution
    /// sample, bounding baseline archive size.
    #[serde(default = "default_max_reference_sample")]
    pub max_reference_sample: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            sigma_k: default_sigma_k(),
            drift_threshold: default_drift_threshold(),
            max_reference_sample: default_max_reference_sample(),
        }
    }
}

fn default_sigma_k() -> f32 {
    3.0
}
fn default_drift_threshold() -> f64 {
    0.25
}
fn default_max_reference_sample() -> usize {
    10_000
}

impl Config {
    /// Build a config with defaults for everything but the two required paths.
    pub fn new(source_data: impl Into<PathBuf>, output_data: impl Into<PathBuf>) -> Self {
        Self {
            source_data: source_data.into(),
            output_data: output_data.into(),
            baseline: None,
            label_file: None,
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            include_globs: default_include_globs(),
            model: ModelConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be >= 1".into()));
        }
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be >= 1".into()));
        }
        if self.include_globs.is_empty() {
            return Err(Error::InvalidConfig(
                "include_globs must not be empty".into(),
            ));
        }
        if self.model.input_side == 0 {
            return Err(Error::InvalidConfig("model.input_side must be >= 1".into()));
        }
        if self.model.latent_dim == 0 {
            return Err(Error::InvalidConfig("model.latent_dim must be >= 1".into()));
        }
        if self.model.learning_rate <= 0.0 {
            return Err(Error::InvalidConfig(
                "model.learning_rate must be > 0".into(),
            ));
        }
        if self.scoring.sigma_k <= 0.0 {
            return Err(Error::InvalidConfig("scoring.sigma_k must be > 0".into()));
        }
        if self.scoring.drift_threshold <= 0.0 || self.scoring.drift_threshold > 1.0 {
            return Err(Error::InvalidConfig(
                "scoring.drift_threshold must be in (0.0, 1.0]".into(),
            ));
        }
        if self.scoring.max_reference_sample == 0 {
            return Err(Error::InvalidConfig(
                "scoring.max_reference_sample must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidConfig(format!("failed to read config {}: {}", path.display(), e))
    })?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {}", e)))?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::new("/tmp/in", "/tmp/out");
        assert!(config.validate().is_ok());
        assert_eq!(config.model.plugin, "dense");
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = Config::new("/tmp/in", "/tmp/out");
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn drift_threshold_bounds() {
        let mut config = Config::new("/tmp/in", "/tmp/out");
        config.scoring.drift_threshold = 0.0;
        assert!(config.validate().is_err());
        config.scoring.drift_threshold = 1.5;
        assert!(config.validate().is_err());
        config.scoring.drift_threshold = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            source_data = "/data/images"
            output_data = "/data/out"
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.epochs, 15);
        assert!(config.validate().is_ok());
    }
}
