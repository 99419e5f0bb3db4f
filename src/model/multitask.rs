//! Multi-task ResNet-32
//!
//! A shared backbone with two softmax heads: the primary task over
//! `psi.num_primary()` classes and the auxiliary task over `psi.total()`
//! classes. Besides the usual forward pass, the network can run on an
//! external `Weights` mapping, which is how the meta step evaluates the
//! one-step-adapted parameters without touching the real ones.

use tch::{nn, Kind, Tensor};

use super::backbone::{Backbone, FunctionalIndexing, FEATURE_DIM};
use super::layers::{self, WeightInit};
use super::params::{ParamKey, Site, Task, Weights};
use crate::data::Psi;
use crate::error::Result;

/// Hidden widths of each classifier head
const HEAD_DIMS: [i64; 2] = [128, 64];

/// Three linear layers with ReLU in between and a softmax on top
#[derive(Debug)]
struct Head {
    task: Task,
    layers: Vec<nn::Linear>,
}

impl Head {
    fn new(vs: &nn::Path, task: Task, out_dim: i64, init: WeightInit) -> Self {
        let path = vs / task.name();
        let dims = [FEATURE_DIM, HEAD_DIMS[0], HEAD_DIMS[1], out_dim];
        let layers = dims
            .windows(2)
            .enumerate()
            .map(|(i, pair)| layers::linear(&path / (2 * i), pair[0], pair[1], init))
            .collect();
        Self { task, layers }
    }

    fn key(&self, layer: usize, bias: bool) -> ParamKey {
        let site = Site::Head {
            task: self.task,
            layer,
        };
        if bias {
            ParamKey::bias(site)
        } else {
            ParamKey::weight(site)
        }
    }

    fn forward(&self, features: &Tensor) -> Tensor {
        let last = self.layers.len() - 1;
        let logits = self.layers.iter().enumerate().fold(features.shallow_clone(), |x, (i, layer)| {
            let x = x.apply(layer);
            if i < last {
                x.relu()
            } else {
                x
            }
        });
        logits.softmax(1, Kind::Float)
    }

    fn forward_with(&self, features: &Tensor, weights: &Weights) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut x = features.shallow_clone();
        for i in 0..self.layers.len() {
            x = layers::linear_with(&x, weights.get(self.key(i, false))?, weights.get(self.key(i, true))?);
            if i < last {
                x = x.relu();
            }
        }
        Ok(x.softmax(1, Kind::Float))
    }

    fn collect(&self, weights: &mut Weights) {
        for (i, layer) in self.layers.iter().enumerate() {
            weights.insert(self.key(i, false), &layer.ws);
            if let Some(bs) = &layer.bs {
                weights.insert(self.key(i, true), bs);
            }
        }
    }
}

/// Multi-task ResNet-32 (primary and auxiliary heads)
#[derive(Debug)]
pub struct MultiTaskNetwork {
    backbone: Backbone,
    primary: Head,
    auxiliary: Head,
    num_primary: i64,
    num_auxiliary: i64,
}

impl MultiTaskNetwork {
    /// Create the network; weights are Xavier-uniform initialised
    pub fn new(vs: &nn::Path, psi: &Psi) -> Self {
        let init = WeightInit::XavierUniform;
        Self {
            backbone: Backbone::new(vs, init),
            primary: Head::new(vs, Task::Primary, psi.num_primary(), init),
            auxiliary: Head::new(vs, Task::Auxiliary, psi.total(), init),
            num_primary: psi.num_primary(),
            num_auxiliary: psi.total(),
        }
    }

    /// Number of primary classes
    pub fn num_primary(&self) -> i64 {
        self.num_primary
    }

    /// Number of auxiliary classes
    pub fn num_auxiliary(&self) -> i64 {
        self.num_auxiliary
    }

    /// Forward pass with the network's own parameters.
    ///
    /// Returns (primary, auxiliary) probability distributions.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> (Tensor, Tensor) {
        let features = self.backbone.forward_t(images, train).pooled();
        (self.primary.forward(&features), self.auxiliary.forward(&features))
    }

    /// Forward pass reading every parameter from `weights`.
    ///
    /// Batch norm always uses the statistics of the current batch. With
    /// `FunctionalIndexing::Faithful` and `self.weights()` this reproduces
    /// `forward_t(images, true)`.
    pub fn forward_with(
        &self,
        images: &Tensor,
        weights: &Weights,
        indexing: FunctionalIndexing,
    ) -> Result<(Tensor, Tensor)> {
        let features = self.backbone.forward_with(images, weights, indexing)?.pooled();
        Ok((
            self.primary.forward_with(&features, weights)?,
            self.auxiliary.forward_with(&features, weights)?,
        ))
    }

    /// Owned parameters as a mapping of shallow handles
    pub fn weights(&self) -> Weights {
        let mut weights = Weights::new();
        self.backbone.collect(&mut weights);
        self.primary.collect(&mut weights);
        self.auxiliary.collect(&mut weights);
        weights
    }

    /// Owned parameters shared by both tasks (everything but the heads)
    pub fn shared_weights(&self) -> Weights {
        self.weights().filter(ParamKey::is_shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::params::{BlockPart, Kind as ParamKind, Stage};
    use tch::Device;

    fn network() -> (nn::VarStore, MultiTaskNetwork) {
        tch::manual_seed(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let psi = Psi::uniform(10, 5).unwrap();
        let net = MultiTaskNetwork::new(&vs.root(), &psi);
        (vs, net)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn test_output_distributions() {
        let (_vs, net) = network();
        let images = Tensor::randn([4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let (primary, auxiliary) = net.forward_t(&images, true);

        assert_eq!(primary.size(), vec![4, 10]);
        assert_eq!(auxiliary.size(), vec![4, 50]);
        let sums = auxiliary.sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
        assert!(max_diff(&sums, &Tensor::ones([4], (Kind::Float, Device::Cpu))) < 1e-5);
    }

    #[test]
    fn test_weights_cover_every_trainable_variable() {
        let (vs, net) = network();
        let weights = net.weights();
        assert_eq!(weights.len(), vs.trainable_variables().len());

        let names: Vec<String> = weights.keys().map(|k| k.name()).collect();
        let variables = vs.variables();
        for name in &names {
            assert!(variables.contains_key(name), "{} not in var store", name);
        }

        // 12 head tensors: 2 heads x 3 layers x (weight, bias)
        assert_eq!(net.shared_weights().len() + 12, weights.len());
    }

    #[test]
    fn test_functional_forward_matches_owned_forward() {
        let (_vs, net) = network();
        let images = Tensor::randn([4, 3, 8, 8], (Kind::Float, Device::Cpu));

        let (owned_primary, owned_auxiliary) = net.forward_t(&images, true);
        let (primary, auxiliary) = net
            .forward_with(&images, &net.weights(), FunctionalIndexing::Faithful)
            .unwrap();

        assert!(max_diff(&owned_primary, &primary) < 1e-5);
        assert!(max_diff(&owned_auxiliary, &auxiliary) < 1e-5);
    }

    #[test]
    fn test_legacy_forward_yields_distributions() {
        let (_vs, net) = network();
        let images = Tensor::randn([4, 3, 8, 8], (Kind::Float, Device::Cpu));
        let (primary, auxiliary) = net
            .forward_with(&images, &net.weights(), FunctionalIndexing::Legacy)
            .unwrap();

        assert_eq!(primary.size(), vec![4, 10]);
        assert_eq!(auxiliary.size(), vec![4, 50]);
        let sums = primary.sum_dim_intlist([1i64].as_slice(), false, Kind::Float);
        assert!(max_diff(&sums, &Tensor::ones([4], (Kind::Float, Device::Cpu))) < 1e-5);
    }

    #[test]
    fn test_missing_weight_is_reported() {
        let (_vs, net) = network();
        let images = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let mut weights = net.weights();
        weights.remove(&ParamKey::block(Stage::Layer3, 2, BlockPart::Norm2, ParamKind::Bias));

        match net.forward_with(&images, &weights, FunctionalIndexing::Faithful) {
            Err(Error::MissingWeight(name)) => assert_eq!(name, "layer3.2.left.4.bias"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
