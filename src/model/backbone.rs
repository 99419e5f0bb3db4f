//! Convolutional backbone: stem and three residual stages
//!
//! Both networks use this feature extractor with their own weights. Stage
//! outputs are returned as a `StageOutputs` value and each stage receives
//! the outputs produced so far; no intermediate result is stored on the
//! backbone itself.

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

use super::layers::{self, WeightInit};
use super::params::{BlockPart, Kind, ParamKey, Site, Stage, Weights};
use super::residual::ResidualBlock;
use crate::error::Result;

/// Stem width
pub const STEM_CHANNELS: i64 = 64;

/// (stage, output channels, blocks, stride of the first block)
const STAGES: [(Stage, i64, usize, i64); 3] = [
    (Stage::Layer1, 64, 5, 1),
    (Stage::Layer2, 128, 5, 2),
    (Stage::Layer3, 256, 4, 2),
];

/// Width of the pooled feature vector
pub const FEATURE_DIM: i64 = 256;

/// How functional mode maps residual stages onto parameter keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FunctionalIndexing {
    /// Same architecture as owned mode, block by block
    #[default]
    Faithful,
    /// Key selection of the first published training script: every stage
    /// collapses to a single unit built from block 0 and block 1 tensors
    /// (see `Backbone::legacy_stage`)
    Legacy,
}

/// Activations of every backbone level for one forward pass
#[derive(Debug)]
pub struct StageOutputs {
    pub stem: Tensor,
    pub stages: Vec<Tensor>,
}

impl StageOutputs {
    fn new(stem: Tensor) -> Self {
        Self {
            stem,
            stages: Vec::with_capacity(STAGES.len()),
        }
    }

    /// Output of the most recent level, the input of the next stage
    pub fn last(&self) -> &Tensor {
        self.stages.last().unwrap_or(&self.stem)
    }

    /// Output of the final stage, pooled to (N, FEATURE_DIM)
    pub fn pooled(&self) -> Tensor {
        layers::global_pool(self.last())
    }
}

#[derive(Debug)]
struct ResidualStage {
    stage: Stage,
    blocks: Vec<ResidualBlock>,
}

/// Stem plus three residual stages
#[derive(Debug)]
pub struct Backbone {
    stem_conv: nn::Conv2D,
    stem_norm: nn::BatchNorm,
    stages: Vec<ResidualStage>,
}

impl Backbone {
    /// Create the backbone under `vs` (`conv1`, `layer1` .. `layer3`)
    pub fn new(vs: &nn::Path, init: WeightInit) -> Self {
        let stem = vs / "conv1";
        let stem_conv = layers::conv2d(&stem / 0, 3, STEM_CHANNELS, 3, 1, 1, init);
        let stem_norm = layers::batch_norm(&stem / 1, STEM_CHANNELS);

        let mut in_channels = STEM_CHANNELS;
        let mut stages = Vec::with_capacity(STAGES.len());
        for (stage, channels, num_blocks, stride) in STAGES {
            let path = vs / stage.name();
            let blocks = (0..num_blocks)
                .map(|index| {
                    let stride = if index == 0 { stride } else { 1 };
                    let block = ResidualBlock::new(&(&path / index), stage, index, in_channels, channels, stride, init);
                    in_channels = channels;
                    block
                })
                .collect();
            stages.push(ResidualStage { stage, blocks });
        }

        Self {
            stem_conv,
            stem_norm,
            stages,
        }
    }

    /// Forward pass with the backbone's own parameters
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> StageOutputs {
        let stem = xs.apply(&self.stem_conv).apply_t(&self.stem_norm, train).relu();
        let mut outputs = StageOutputs::new(stem);
        for stage in &self.stages {
            let out = stage
                .blocks
                .iter()
                .fold(outputs.last().shallow_clone(), |x, block| block.forward_t(&x, train));
            outputs.stages.push(out);
        }
        outputs
    }

    /// Forward pass reading every weight from `weights`
    pub fn forward_with(
        &self,
        xs: &Tensor,
        weights: &Weights,
        indexing: FunctionalIndexing,
    ) -> Result<StageOutputs> {
        let stem = layers::conv_with(xs, weights.get(ParamKey::weight(Site::StemConv))?, 1, 1);
        let stem = layers::norm_with(
            &stem,
            weights.get(ParamKey::weight(Site::StemNorm))?,
            weights.get(ParamKey::bias(Site::StemNorm))?,
        )
        .relu();

        let mut outputs = StageOutputs::new(stem);
        for stage in &self.stages {
            let out = match indexing {
                FunctionalIndexing::Faithful => {
                    let mut x = outputs.last().shallow_clone();
                    for block in &stage.blocks {
                        x = block.forward_with(&x, weights)?;
                    }
                    x
                }
                FunctionalIndexing::Legacy => Self::legacy_stage(stage.stage, &outputs, weights)?,
            };
            outputs.stages.push(out);
        }
        Ok(outputs)
    }

    /// One stage as computed by the legacy key selection.
    ///
    /// Only the arithmetic that reaches the stage output is evaluated:
    /// - `layer1`: block 0's left path, where the second norm takes
    ///   `left.1.weight` with `left.4.bias`; no shortcut, no final relu.
    /// - `layer2`/`layer3`: block 0's first conv at stride 1 on the stage
    ///   input, then block 1's `left.1` norm, relu, block 1's `left.3` conv
    ///   and a norm with block 1's `left.1.weight` and `left.4.bias`. The
    ///   strided branch and its shortcut are overwritten by the legacy
    ///   loop and never contribute, so spatial size is kept.
    fn legacy_stage(stage: Stage, outputs: &StageOutputs, weights: &Weights) -> Result<Tensor> {
        let input = outputs.last();
        let key = |block, part, kind| ParamKey::block(stage, block, part, kind);
        let norm_block = match stage {
            Stage::Layer1 => 0,
            Stage::Layer2 | Stage::Layer3 => 1,
        };

        let out = layers::conv_with(input, weights.get(key(0, BlockPart::Conv1, Kind::Weight))?, 1, 1);
        let out = layers::norm_with(
            &out,
            weights.get(key(norm_block, BlockPart::Norm1, Kind::Weight))?,
            weights.get(key(norm_block, BlockPart::Norm1, Kind::Bias))?,
        )
        .relu();
        let out = layers::conv_with(&out, weights.get(key(norm_block, BlockPart::Conv2, Kind::Weight))?, 1, 1);
        Ok(layers::norm_with(
            &out,
            weights.get(key(norm_block, BlockPart::Norm1, Kind::Weight))?,
            weights.get(key(norm_block, BlockPart::Norm2, Kind::Bias))?,
        ))
    }

    /// Register every trainable tensor of the backbone
    pub fn collect(&self, weights: &mut Weights) {
        weights.insert(ParamKey::weight(Site::StemConv), &self.stem_conv.ws);
        if let Some(ws) = &self.stem_norm.ws {
            weights.insert(ParamKey::weight(Site::StemNorm), ws);
        }
        if let Some(bs) = &self.stem_norm.bs {
            weights.insert(ParamKey::bias(Site::StemNorm), bs);
        }
        for stage in &self.stages {
            for block in &stage.blocks {
                block.collect(weights);
            }
        }
    }

    /// Number of residual blocks per stage
    pub fn blocks_per_stage(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.blocks.len()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind as TensorKind};

    #[test]
    fn test_resnet32_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), WeightInit::XavierUniform);
        assert_eq!(backbone.blocks_per_stage(), vec![5, 5, 4]);

        let mut weights = Weights::new();
        backbone.collect(&mut weights);
        assert_eq!(weights.len(), vs.trainable_variables().len());
        assert!(vs.variables().contains_key("layer2.0.shortcut.0.weight"));
        assert!(!vs.variables().contains_key("layer1.0.shortcut.0.weight"));
    }

    #[test]
    fn test_stage_outputs() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), WeightInit::XavierUniform);
        let xs = Tensor::randn([2, 3, 8, 8], (TensorKind::Float, Device::Cpu));

        let outputs = backbone.forward_t(&xs, true);
        assert_eq!(outputs.stem.size(), vec![2, 64, 8, 8]);
        assert_eq!(outputs.stages[0].size(), vec![2, 64, 8, 8]);
        assert_eq!(outputs.stages[1].size(), vec![2, 128, 4, 4]);
        assert_eq!(outputs.stages[2].size(), vec![2, 256, 2, 2]);
        assert_eq!(outputs.pooled().size(), vec![2, FEATURE_DIM]);
    }

    #[test]
    fn test_legacy_indexing_keeps_resolution() {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = Backbone::new(&vs.root(), WeightInit::XavierUniform);
        let mut weights = Weights::new();
        backbone.collect(&mut weights);

        let xs = Tensor::randn([2, 3, 8, 8], (TensorKind::Float, Device::Cpu));
        let outputs = backbone
            .forward_with(&xs, &weights, FunctionalIndexing::Legacy)
            .unwrap();
        assert_eq!(outputs.stages[1].size(), vec![2, 128, 8, 8]);
        assert_eq!(outputs.stages[2].size(), vec![2, 256, 8, 8]);
        assert_eq!(outputs.pooled().size(), vec![2, FEATURE_DIM]);
    }
}
