//! Configuration management
//!
//! Compiled-in defaults reproduce the reference training run; a TOML file
//! can override any subset of them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data::{CoarseMapping, Normalization, PrimaryLevel, Psi, CINIC_MEAN, CINIC_STD};
use crate::error::{Error, Result};
use crate::model::FunctionalIndexing;

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the `train` and `test` image folders
    pub root: PathBuf,
    pub batch_size: usize,
    pub shuffle: bool,
    pub mean: [f64; 3],
    pub std: [f64; 3],
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./dataset/cinic10"),
            batch_size: 128,
            shuffle: true,
            mean: CINIC_MEAN,
            std: CINIC_STD,
        }
    }
}

impl DataConfig {
    pub fn normalization(&self) -> Normalization {
        Normalization {
            mean: self.mean,
            std: self.std,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Auxiliary classes per primary class
    pub psi: Vec<i64>,
    pub primary_level: PrimaryLevel,
    pub mask_epsilon: f64,
    pub functional_indexing: FunctionalIndexing,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            psi: vec![5; 10],
            primary_level: PrimaryLevel::Fine,
            mask_epsilon: 1e-8,
            functional_indexing: FunctionalIndexing::Faithful,
        }
    }
}

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub total_epochs: usize,
    pub start_epoch: usize,
    /// Checkpoint loaded into the multi-task network before training
    pub resume_from: Option<PathBuf>,
    pub learning_rate: f64,
    pub lr_step: usize,
    pub lr_gamma: f64,
    pub generator_learning_rate: f64,
    pub generator_weight_decay: f64,
    /// Inner step size of the meta update
    pub meta_learning_rate: f64,
    pub meta_lr_step: usize,
    pub meta_lr_gamma: f64,
    pub entropy_weight: f64,
    pub log_file: PathBuf,
    pub seed: Option<i64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            total_epochs: 30,
            start_epoch: 0,
            resume_from: None,
            learning_rate: 0.01,
            lr_step: 50,
            lr_gamma: 0.5,
            generator_learning_rate: 1e-3,
            generator_weight_decay: 5e-4,
            meta_learning_rate: 0.01,
            meta_lr_step: 10,
            meta_lr_gamma: 0.5,
            entropy_weight: 0.2,
            log_file: PathBuf::from("pri5log.txt"),
            seed: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from file or use default
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validated task split
    pub fn psi(&self) -> Result<Psi> {
        Psi::new(self.model.psi.clone())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let psi = self.psi()?;
        let num_classes = self.model.primary_level.num_classes(&CoarseMapping::cinic10());
        if psi.num_primary() != num_classes {
            return Err(Error::InvalidPsi(format!(
                "{} entries for {:?} labels with {} classes",
                psi.num_primary(),
                self.model.primary_level,
                num_classes
            )));
        }

        if self.data.batch_size == 0 {
            return Err(Error::config("data.batch_size must be positive"));
        }
        if self.data.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::config("data.std entries must be positive"));
        }
        if self.model.mask_epsilon < 0.0 {
            return Err(Error::config("model.mask_epsilon must not be negative"));
        }

        let training = &self.training;
        if training.start_epoch > training.total_epochs {
            return Err(Error::config(format!(
                "training.start_epoch {} is past total_epochs {}",
                training.start_epoch, training.total_epochs
            )));
        }
        if training.lr_step == 0 || training.meta_lr_step == 0 {
            return Err(Error::config("learning rate step sizes must be positive"));
        }
        Ok(())
    }
}
