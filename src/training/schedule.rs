//! Step learning-rate schedules

use serde::{Deserialize, Serialize};

/// Multiply the rate by `gamma` every `step_size` epochs.
///
/// The rate is a pure function of the absolute epoch, so a resumed run at
/// epoch `e` uses the same rate as an uninterrupted one. The scheduler is
/// advanced before each epoch, which makes epoch `e` use
/// `base · gamma^⌊(e + 1) / step_size⌋`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLr {
    pub base: f64,
    pub step_size: usize,
    pub gamma: f64,
}

impl StepLr {
    pub fn new(base: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base,
            step_size: step_size.max(1),
            gamma,
        }
    }

    /// Rate used during `epoch` (0-based)
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let decays = (epoch + 1) / self.step_size;
        self.base * self.gamma.powi(decays as i32)
    }
}
