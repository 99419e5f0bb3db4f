//! Typed parameter registry
//!
//! Every trainable tensor of the multi-task network is addressed by a
//! `ParamKey`. Functional forward passes read weights through these keys, and
//! `ParamKey::name` renders the dotted checkpoint name of the same tensor.

use std::collections::BTreeMap;
use std::fmt;

use tch::Tensor;

use crate::error::{Error, Result};

/// Residual stage of the backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Layer1,
    Layer2,
    Layer3,
}

impl Stage {
    /// Module name of the stage
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Layer1 => "layer1",
            Stage::Layer2 => "layer2",
            Stage::Layer3 => "layer3",
        }
    }
}

/// Sub-layer of a residual block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockPart {
    Conv1,
    Norm1,
    Conv2,
    Norm2,
    ShortcutConv,
    ShortcutNorm,
}

impl BlockPart {
    fn path(&self) -> &'static str {
        match self {
            BlockPart::Conv1 => "left.0",
            BlockPart::Norm1 => "left.1",
            BlockPart::Conv2 => "left.3",
            BlockPart::Norm2 => "left.4",
            BlockPart::ShortcutConv => "shortcut.0",
            BlockPart::ShortcutNorm => "shortcut.1",
        }
    }
}

/// Classifier head of the multi-task network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Task {
    Primary,
    Auxiliary,
}

impl Task {
    /// Module name of the head
    pub fn name(&self) -> &'static str {
        match self {
            Task::Primary => "classifier1",
            Task::Auxiliary => "classifier2",
        }
    }
}

/// Where a parameter lives in the architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Site {
    StemConv,
    StemNorm,
    Block {
        stage: Stage,
        block: usize,
        part: BlockPart,
    },
    /// `layer` counts linear layers of the head: 0, 1, 2
    Head { task: Task, layer: usize },
}

/// Weight or bias of a site
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Weight,
    Bias,
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Weight => "weight",
            Kind::Bias => "bias",
        }
    }
}

/// Key of one trainable tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamKey {
    pub site: Site,
    pub kind: Kind,
}

impl ParamKey {
    pub fn new(site: Site, kind: Kind) -> Self {
        Self { site, kind }
    }

    pub fn weight(site: Site) -> Self {
        Self::new(site, Kind::Weight)
    }

    pub fn bias(site: Site) -> Self {
        Self::new(site, Kind::Bias)
    }

    /// Residual block sub-layer key
    pub fn block(stage: Stage, block: usize, part: BlockPart, kind: Kind) -> Self {
        Self::new(Site::Block { stage, block, part }, kind)
    }

    /// Whether the tensor belongs to the backbone shared by both heads
    pub fn is_shared(&self) -> bool {
        !matches!(self.site, Site::Head { .. })
    }

    /// Dotted name as stored in checkpoints, e.g. `layer2.0.shortcut.1.bias`
    pub fn name(&self) -> String {
        let module = match self.site {
            Site::StemConv => "conv1.0".to_string(),
            Site::StemNorm => "conv1.1".to_string(),
            Site::Block { stage, block, part } => {
                format!("{}.{}.{}", stage.name(), block, part.path())
            }
            // linear layers sit at 0, 2, 4 of the head, ReLUs in between
            Site::Head { task, layer } => format!("{}.{}", task.name(), 2 * layer),
        };
        format!("{}.{}", module, self.kind.name())
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Ordered mapping from parameter keys to tensors
#[derive(Debug, Default)]
pub struct Weights {
    entries: BTreeMap<ParamKey, Tensor>,
}

impl Weights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor; the mapping keeps a shallow handle to it
    pub fn insert(&mut self, key: ParamKey, tensor: &Tensor) {
        self.entries.insert(key, tensor.shallow_clone());
    }

    /// Drop a key
    pub fn remove(&mut self, key: &ParamKey) -> Option<Tensor> {
        self.entries.remove(key)
    }

    /// Look up a tensor; a missing key is a configuration error
    pub fn get(&self, key: ParamKey) -> Result<&Tensor> {
        self.entries
            .get(&key)
            .ok_or_else(|| Error::MissingWeight(key.name()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.entries.keys()
    }

    /// Shallow handles to all tensors, in key order
    pub fn tensors(&self) -> Vec<Tensor> {
        self.entries.values().map(Tensor::shallow_clone).collect()
    }

    /// Subset of the mapping whose keys satisfy `keep`
    pub fn filter(&self, keep: impl Fn(&ParamKey) -> bool) -> Weights {
        let entries = self
            .entries
            .iter()
            .filter(|(key, _)| keep(key))
            .map(|(key, tensor)| (*key, tensor.shallow_clone()))
            .collect();
        Weights { entries }
    }

    /// One SGD step expressed as graph arithmetic: `θ - lr · g` per key.
    ///
    /// `grads` must be in key order (as produced from `tensors()`). The result
    /// stays linked to both the parameters and the gradients, so a loss on the
    /// returned weights can be differentiated through the step.
    pub fn sgd_step(&self, grads: &[Tensor], lr: f64) -> Result<Weights> {
        if grads.len() != self.entries.len() {
            return Err(Error::GradientMismatch {
                expected: self.entries.len(),
                found: grads.len(),
            });
        }

        let entries = self
            .entries
            .iter()
            .zip(grads)
            .map(|((key, param), grad)| (*key, param - grad * lr))
            .collect();
        Ok(Weights { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind as TensorKind};

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(ParamKey::weight(Site::StemConv).name(), "conv1.0.weight");
        assert_eq!(ParamKey::bias(Site::StemNorm).name(), "conv1.1.bias");
        assert_eq!(
            ParamKey::block(Stage::Layer2, 0, BlockPart::ShortcutNorm, Kind::Bias).name(),
            "layer2.0.shortcut.1.bias"
        );
        assert_eq!(
            ParamKey::block(Stage::Layer3, 3, BlockPart::Conv2, Kind::Weight).name(),
            "layer3.3.left.3.weight"
        );
        assert_eq!(
            ParamKey::weight(Site::Head { task: Task::Auxiliary, layer: 2 }).name(),
            "classifier2.4.weight"
        );
    }

    #[test]
    fn test_shared_keys() {
        assert!(ParamKey::weight(Site::StemConv).is_shared());
        assert!(!ParamKey::bias(Site::Head { task: Task::Primary, layer: 0 }).is_shared());
    }

    #[test]
    fn test_missing_weight() {
        let weights = Weights::new();
        let key = ParamKey::weight(Site::StemConv);
        match weights.get(key) {
            Err(Error::MissingWeight(name)) => assert_eq!(name, "conv1.0.weight"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sgd_step_is_differentiable() {
        let param = Tensor::from_slice(&[1.0f32, 2.0]).set_requires_grad(true);
        let mut weights = Weights::new();
        let key = ParamKey::weight(Site::StemConv);
        weights.insert(key, &param);

        let loss = (&param * &param).sum(TensorKind::Float);
        let grads = Tensor::run_backward(&[&loss], &weights.tensors(), true, true);
        let fast = weights.sgd_step(&grads, 0.1).unwrap();

        // θ⁺ = θ - 0.1 · 2θ = 0.8 θ
        let adapted = fast.get(key).unwrap();
        assert!((adapted.double_value(&[1]) - 1.6).abs() < 1e-6);

        // d/dθ Σ θ⁺ = 0.8 per entry, only visible through the second-order graph
        let meta = adapted.sum(TensorKind::Float);
        let meta_grad = Tensor::run_backward(&[&meta], &[&param], false, false);
        assert!((meta_grad[0].double_value(&[0]) - 0.8).abs() < 1e-6);
        assert_eq!(meta_grad[0].device(), Device::Cpu);
    }

    #[test]
    fn test_sgd_step_rejects_length_mismatch() {
        let mut weights = Weights::new();
        weights.insert(ParamKey::weight(Site::StemConv), &Tensor::from_slice(&[1.0f32]));
        assert!(matches!(
            weights.sgd_step(&[], 0.1),
            Err(Error::GradientMismatch { expected: 1, found: 0 })
        ));
    }
}
