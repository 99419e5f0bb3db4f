//! # Meta-learned auxiliary labels for a multi-task ResNet-32
//!
//! A multi-task ResNet-32 learns a primary classification task (CINIC-10
//! fine or coarse labels) together with an auxiliary task whose labels are
//! produced by a second network, the label generator. The generator is
//! trained by a second-order meta objective: how well the multi-task
//! network does on the primary task after one SGD step on the combined
//! loss.
//!
//! ## Modules
//!
//! - `data`: label hierarchy, psi and mask, batch sources
//! - `model`: residual backbone, label generator, multi-task network,
//!   functional forward over typed parameter mappings
//! - `training`: losses, metrics, schedules, checkpoints and the meta-training loop
//! - `utils`: configuration and logging
//!
//! ## Example
//!
//! ```no_run
//! use meta_aux_resnet::{Config, SyntheticImages, Trainer, TrainingSession};
//! use tch::Device;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let device = Device::cuda_if_available();
//!
//!     let session = TrainingSession::new(&config, device)?;
//!     let mut trainer = Trainer::new(session, &config.training, "./pri5model/")?;
//!
//!     let mut train = SyntheticImages::new(256, 10, 32, config.data.batch_size, device)?;
//!     let mut test = SyntheticImages::new(128, 10, 32, config.data.batch_size, device)?;
//!     let history = trainer.train(&mut train, &mut test)?;
//!     println!("{}", history.len());
//!
//!     Ok(())
//! }
//! ```

pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod utils;

// Re-export main types for convenience
pub use data::{BatchSource, CoarseMapping, ImageBatch, ImageFolder, Normalization, PrimaryLevel, Psi, SyntheticImages};
pub use error::{Error, Result};
pub use model::{FunctionalIndexing, LabelGenerator, MultiTaskNetwork, ParamKey, Weights};
pub use training::{CheckpointWriter, EpochCost, StepLr, Trainer, TrainingSession};
pub use utils::{setup_logging, Config};
