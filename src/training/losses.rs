//! Loss functions for the multi-task network
//!
//! Predictions are probability distributions (the heads end in a softmax),
//! so both losses work on probabilities rather than logits.

use tch::{Kind, Tensor};

/// Added inside every logarithm
const LOG_EPSILON: f64 = 1e-20;

/// Target of a fit: hard class labels or a soft distribution
#[derive(Debug, Clone, Copy)]
pub enum FitTarget<'a> {
    /// Integer labels, turned into one-hot rows over `num_classes`
    Hard { labels: &'a Tensor, num_classes: i64 },
    /// Per-sample distribution used as is (generated auxiliary labels)
    Soft(&'a Tensor),
}

/// Focal loss per sample
///
/// `Σ_c -t_c · (1 - p_c)² · log(p_c + ε)`, not reduced over the batch.
pub fn model_fit(predictions: &Tensor, target: FitTarget<'_>) -> Tensor {
    let target = match target {
        FitTarget::Hard { labels, num_classes } => labels.onehot(num_classes),
        FitTarget::Soft(distribution) => distribution.shallow_clone(),
    };

    let focal_weight = (1.0f64 - predictions).pow_tensor_scalar(2);
    let log_p = (predictions + LOG_EPSILON).log();
    let loss = target * focal_weight * log_p;
    -loss.sum_dim_intlist([1i64].as_slice(), false, Kind::Float)
}

/// Entropy-style regulariser on the batch-mean distribution
///
/// `Σ_c p̄_c · log(p̄_c + ε)` with `p̄` the mean prediction over the batch.
/// Minimising it spreads the batch over many auxiliary classes.
pub fn model_entropy(predictions: &Tensor) -> Tensor {
    let mean = predictions.mean_dim(Some([0i64].as_slice()), false, Kind::Float);
    let loss = &mean * (&mean + LOG_EPSILON).log();
    loss.sum(Kind::Float)
}
