//! Label generator network
//!
//! Produces soft auxiliary labels restricted to the auxiliary classes owned
//! by each sample's primary class (masked softmax).

use tch::{nn, Kind, Tensor};

use super::backbone::{Backbone, FEATURE_DIM};
use super::layers::{self, WeightInit};
use crate::data::Psi;
use crate::error::Result;

/// Hidden widths of the classifier head
const HEAD_DIMS: [i64; 2] = [128, 64];

/// Backbone plus a three-layer head over `psi.total()` auxiliary classes
#[derive(Debug)]
pub struct LabelGenerator {
    backbone: Backbone,
    head: Vec<nn::Linear>,
    /// (num_primary, num_auxiliary) mask, 1 on owned columns and epsilon elsewhere
    mask: Tensor,
    psi: Psi,
}

impl LabelGenerator {
    /// Create the generator; weights are Xavier-normal initialised
    pub fn new(vs: &nn::Path, psi: Psi, mask_epsilon: f64) -> Self {
        let init = WeightInit::XavierNormal;
        let backbone = Backbone::new(vs, init);

        let classifier = vs / "classifier";
        let head = vec![
            layers::linear(&classifier / 0, FEATURE_DIM, HEAD_DIMS[0], init),
            layers::linear(&classifier / 2, HEAD_DIMS[0], HEAD_DIMS[1], init),
            layers::linear(&classifier / 4, HEAD_DIMS[1], psi.total(), init),
        ];
        let mask = psi.mask(mask_epsilon, vs.device());

        Self {
            backbone,
            head,
            mask,
            psi,
        }
    }

    /// Task split the generator was built for
    pub fn psi(&self) -> &Psi {
        &self.psi
    }

    /// Raw auxiliary logits, (N, psi.total())
    pub fn logits(&self, images: &Tensor, train: bool) -> Tensor {
        let features = self.backbone.forward_t(images, train).pooled();
        let last = self.head.len() - 1;
        self.head.iter().enumerate().fold(features, |x, (i, layer)| {
            let x = x.apply(layer);
            if i < last {
                x.relu()
            } else {
                x
            }
        })
    }

    /// Auxiliary label distribution for each image given its primary label.
    ///
    /// Rows sum to one and put (up to the mask epsilon) all of their mass on
    /// the auxiliary classes owned by the primary label. Labels outside
    /// `[0, psi.num_primary())` fail the mask lookup.
    pub fn generate(&self, images: &Tensor, primary: &Tensor, train: bool) -> Result<Tensor> {
        let logits = self.logits(images, train);
        let mask = self.mask.f_index_select(0, primary)?;
        Ok(masked_softmax(&logits, &mask))
    }
}

/// `exp(x) · mask / Σ exp(x) · mask` along the class axis.
///
/// The row maximum cancels in the ratio; subtracting it keeps `exp` finite.
pub fn masked_softmax(logits: &Tensor, mask: &Tensor) -> Tensor {
    let shifted = logits - logits.amax([1i64].as_slice(), true);
    let weighted = shifted.exp() * mask;
    let total = weighted.sum_dim_intlist([1i64].as_slice(), true, Kind::Float);
    weighted / total
}
