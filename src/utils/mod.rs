//! Utility module
//!
//! This module provides:
//! - Configuration management
//! - Logging setup and the epoch log file

mod config;
mod logging;

pub use config::{Config, DataConfig, LoggingConfig, ModelConfig, TrainingConfig};
pub use logging::{setup_logging, EpochLog};
