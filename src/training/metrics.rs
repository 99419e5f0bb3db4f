//! Evaluation metrics and the per-epoch cost record

use std::fmt;

use tch::{Kind, Tensor};

use crate::error::{Error, Result};

/// Number of values logged per epoch
pub const NUM_COSTS: usize = 9;

/// First slot of the primary-update pass (loss, accuracy, cosine similarity)
pub const PRIMARY_SLOTS: usize = 0;
/// First slot of the meta-update pass (pre loss/acc, post loss/acc)
pub const META_SLOTS: usize = 3;
/// First slot of the evaluation pass (loss, accuracy)
pub const TEST_SLOTS: usize = 7;

/// Running averages of one epoch
///
/// Slots: primary loss, primary accuracy, gradient cosine similarity,
/// meta loss and accuracy before the step, primary loss and accuracy after
/// the step, test loss, test accuracy.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochCost {
    values: [f64; NUM_COSTS],
}

impl EpochCost {
    /// Empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value / num_batches` for each value, starting at `first_slot`
    pub fn add(&mut self, first_slot: usize, values: &[f64], num_batches: usize) {
        let scale = num_batches.max(1) as f64;
        for (slot, value) in self.values[first_slot..].iter_mut().zip(values) {
            *slot += value / scale;
        }
    }

    /// All slots in order
    pub fn values(&self) -> &[f64; NUM_COSTS] {
        &self.values
    }

    pub fn primary_loss(&self) -> f64 {
        self.values[0]
    }

    pub fn primary_accuracy(&self) -> f64 {
        self.values[1]
    }

    pub fn cosine_similarity(&self) -> f64 {
        self.values[2]
    }

    pub fn test_loss(&self) -> f64 {
        self.values[7]
    }

    pub fn test_accuracy(&self) -> f64 {
        self.values[8]
    }

    /// The line appended to the training log for `epoch` after `iteration`
    /// primary updates
    pub fn log_line(&self, epoch: usize, iteration: usize) -> String {
        let v = &self.values;
        format!(
            "EPOCH: {:04} Iter {:04} | TRAIN [LOSS|ACC.]: PRI {:.4} {:.4} COSSIM {:.4} || \
             META [LOSS|ACC.]: PRE {:.4} {:.4} AFTER {:.4} {:.4} || TEST: {:.4} {:.4}",
            epoch, iteration, v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]
        )
    }
}

impl fmt::Display for EpochCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pri {:.4}/{:.4} cos {:.4} | test {:.4}/{:.4}",
            self.primary_loss(),
            self.primary_accuracy(),
            self.cosine_similarity(),
            self.test_loss(),
            self.test_accuracy()
        )
    }
}

/// Fraction of rows whose argmax matches `labels`, over `divisor` samples
pub fn accuracy(predictions: &Tensor, labels: &Tensor, divisor: usize) -> Result<f64> {
    let correct = predictions
        .argmax(1, false)
        .eq_tensor(labels)
        .sum(Kind::Float);
    Ok(f64::try_from(&correct)? / divisor.max(1) as f64)
}

/// Mean per-tensor cosine similarity between two gradient lists.
///
/// Each pair is compared along dimension 0 and the resulting similarities
/// are averaged; the per-tensor values are then averaged again.
pub fn gradient_cosine(first: &[Tensor], second: &[Tensor]) -> Result<f64> {
    if first.len() != second.len() {
        return Err(Error::GradientMismatch {
            expected: first.len(),
            found: second.len(),
        });
    }
    if first.is_empty() {
        return Ok(0.0);
    }

    let mut total = 0.0;
    for (g1, g2) in first.iter().zip(second) {
        let similarity = Tensor::f_cosine_similarity(g1, g2, 0, 1e-8)?.mean(Kind::Float);
        total += f64::try_from(&similarity)?;
    }
    Ok(total / first.len() as f64)
}
