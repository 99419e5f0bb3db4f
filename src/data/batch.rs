//! Batches and the batch source seam
//!
//! The training loop only sees `BatchSource`; where the images come from
//! (an image folder on disk, synthetic noise) stays behind it.

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::Result;

/// CINIC-10 per-channel mean
pub const CINIC_MEAN: [f64; 3] = [0.47889522, 0.47227842, 0.43047404];
/// CINIC-10 per-channel standard deviation
pub const CINIC_STD: [f64; 3] = [0.24205776, 0.23828046, 0.25874835];

/// One batch of normalised images with their raw class labels
#[derive(Debug)]
pub struct ImageBatch {
    /// Images of shape (N, 3, H, W)
    pub images: Tensor,
    /// Raw class labels of shape (N)
    pub labels: Tensor,
}

impl ImageBatch {
    /// Number of samples in the batch
    pub fn len(&self) -> i64 {
        self.labels.size()[0]
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the batch to a device
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            images: self.images.to_device(device),
            labels: self.labels.to_device(device),
        }
    }
}

/// Anything that yields image batches epoch after epoch
pub trait BatchSource {
    /// Batches per epoch
    fn num_batches(&self) -> usize;

    /// Nominal batch size
    fn batch_size(&self) -> usize;

    /// Start a new epoch
    fn reset(&mut self);

    /// Next batch of the current epoch
    fn next_batch(&mut self) -> Option<Result<ImageBatch>>;
}

/// Fixed per-channel normalisation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub mean: [f64; 3],
    pub std: [f64; 3],
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            mean: CINIC_MEAN,
            std: CINIC_STD,
        }
    }
}

impl Normalization {
    /// Normalise a batch of images.
    ///
    /// `uint8` input is scaled to [0, 1] first; float input is taken as
    /// already scaled.
    pub fn apply(&self, images: &Tensor) -> Tensor {
        let device = images.device();
        let scaled = if images.kind() == Kind::Uint8 {
            images.to_kind(Kind::Float) / 255.0
        } else {
            images.to_kind(Kind::Float)
        };
        let mean = Tensor::from_slice(&self.mean)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .to_device(device);
        let std = Tensor::from_slice(&self.std)
            .to_kind(Kind::Float)
            .view([1, 3, 1, 1])
            .to_device(device);
        (scaled - mean) / std
    }
}
