//! Training module
//!
//! This module provides:
//! - Focal loss and the auxiliary entropy regulariser
//! - Accuracy, gradient cosine similarity and the per-epoch cost record
//! - Step learning-rate schedules
//! - Checkpoint writing and strict loading
//! - The training session (per-batch steps) and the epoch loop

mod checkpoint;
mod losses;
mod metrics;
mod schedule;
mod session;
mod trainer;

pub use checkpoint::{checkpoint_name, load_strict, CheckpointWriter};
pub use losses::{model_entropy, model_fit, FitTarget};
pub use metrics::{accuracy, gradient_cosine, EpochCost, NUM_COSTS};
pub use schedule::StepLr;
pub use session::TrainingSession;
pub use trainer::Trainer;
