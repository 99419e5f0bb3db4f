//! Synthetic image source for smoke runs

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tch::{Device, Tensor};

use super::batch::{BatchSource, ImageBatch};
use super::loader::DataLoader;
use crate::error::{Error, Result};

/// Pixel values are drawn uniformly from this range, roughly the spread of
/// normalised CINIC-10 images
const PIXEL_RANGE: std::ops::Range<f32> = -2.0..2.0;

/// Random normalised images with random labels, generated once
///
/// Data comes from a generator seeded per source, so it does not depend on
/// the global libtorch seed: the same seed always gives the same images.
#[derive(Debug)]
pub struct SyntheticImages {
    images: Tensor,
    labels: Tensor,
    loader: DataLoader,
}

impl SyntheticImages {
    /// Create `num_samples` images of `image_size`² pixels over `num_classes` labels
    pub fn new(
        num_samples: usize,
        num_classes: i64,
        image_size: i64,
        batch_size: usize,
        device: Device,
    ) -> Result<Self> {
        Self::with_seed(num_samples, num_classes, image_size, batch_size, device, 0)
    }

    /// Same as `new`, drawing from a generator seeded with `seed`
    pub fn with_seed(
        num_samples: usize,
        num_classes: i64,
        image_size: i64,
        batch_size: usize,
        device: Device,
        seed: u64,
    ) -> Result<Self> {
        if num_samples == 0 || num_classes <= 0 || image_size <= 0 {
            return Err(Error::data_source(format!(
                "synthetic source needs samples, classes and pixels (got {}, {}, {})",
                num_samples, num_classes, image_size
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let n = num_samples as i64;
        let pixels: Vec<f32> = (0..n * 3 * image_size * image_size)
            .map(|_| rng.gen_range(PIXEL_RANGE))
            .collect();
        let labels: Vec<i64> = (0..n).map(|_| rng.gen_range(0..num_classes)).collect();

        Ok(Self {
            images: Tensor::from_slice(&pixels)
                .view([n, 3, image_size, image_size])
                .to_device(device),
            labels: Tensor::from_slice(&labels).to_device(device),
            loader: DataLoader::new(num_samples, batch_size, false),
        })
    }
}

impl BatchSource for SyntheticImages {
    fn num_batches(&self) -> usize {
        self.loader.num_batches()
    }

    fn batch_size(&self) -> usize {
        self.loader.batch_size()
    }

    fn reset(&mut self) {
        self.loader.reset();
    }

    fn next_batch(&mut self) -> Option<Result<ImageBatch>> {
        let indices = self.loader.next_batch()?;
        let index = Tensor::from_slice(&indices).to_device(self.images.device());
        Some(Ok(ImageBatch {
            images: self.images.index_select(0, &index),
            labels: self.labels.index_select(0, &index),
        }))
    }
}
