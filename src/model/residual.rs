//! Residual block shared by both networks

use tch::{nn, Tensor};

use super::layers::{self, WeightInit};
use super::params::{BlockPart, Kind, ParamKey, Stage, Weights};
use crate::error::Result;

/// Projection shortcut: 1x1 convolution and batch norm
#[derive(Debug)]
struct Projection {
    conv: nn::Conv2D,
    norm: nn::BatchNorm,
}

/// Basic residual block
///
/// `conv3x3(stride) → bn → relu → conv3x3 → bn`, plus a shortcut that is the
/// identity when shapes agree and a projection otherwise, then relu.
#[derive(Debug)]
pub struct ResidualBlock {
    stage: Stage,
    index: usize,
    stride: i64,
    conv1: nn::Conv2D,
    norm1: nn::BatchNorm,
    conv2: nn::Conv2D,
    norm2: nn::BatchNorm,
    shortcut: Option<Projection>,
}

impl ResidualBlock {
    /// Create block `index` of `stage` under `vs`
    pub fn new(
        vs: &nn::Path,
        stage: Stage,
        index: usize,
        in_channels: i64,
        out_channels: i64,
        stride: i64,
        init: WeightInit,
    ) -> Self {
        let left = vs / "left";
        let conv1 = layers::conv2d(&left / 0, in_channels, out_channels, 3, stride, 1, init);
        let norm1 = layers::batch_norm(&left / 1, out_channels);
        let conv2 = layers::conv2d(&left / 3, out_channels, out_channels, 3, 1, 1, init);
        let norm2 = layers::batch_norm(&left / 4, out_channels);

        let shortcut = if stride != 1 || in_channels != out_channels {
            let path = vs / "shortcut";
            Some(Projection {
                conv: layers::conv2d(&path / 0, in_channels, out_channels, 1, stride, 0, init),
                norm: layers::batch_norm(&path / 1, out_channels),
            })
        } else {
            None
        };

        Self {
            stage,
            index,
            stride,
            conv1,
            norm1,
            conv2,
            norm2,
            shortcut,
        }
    }

    /// Key of one of this block's tensors
    pub fn key(&self, part: BlockPart, kind: Kind) -> ParamKey {
        ParamKey::block(self.stage, self.index, part, kind)
    }

    pub fn has_projection(&self) -> bool {
        self.shortcut.is_some()
    }

    /// Forward pass with the block's own parameters
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let out = xs
            .apply(&self.conv1)
            .apply_t(&self.norm1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.norm2, train);

        let shortcut = match &self.shortcut {
            Some(projection) => xs.apply(&projection.conv).apply_t(&projection.norm, train),
            None => xs.shallow_clone(),
        };

        (out + shortcut).relu()
    }

    /// Forward pass reading every weight from `weights`
    pub fn forward_with(&self, xs: &Tensor, weights: &Weights) -> Result<Tensor> {
        let w = |part, kind| weights.get(self.key(part, kind));

        let out = layers::conv_with(xs, w(BlockPart::Conv1, Kind::Weight)?, self.stride, 1);
        let out = layers::norm_with(&out, w(BlockPart::Norm1, Kind::Weight)?, w(BlockPart::Norm1, Kind::Bias)?)
            .relu();
        let out = layers::conv_with(&out, w(BlockPart::Conv2, Kind::Weight)?, 1, 1);
        let out = layers::norm_with(&out, w(BlockPart::Norm2, Kind::Weight)?, w(BlockPart::Norm2, Kind::Bias)?);

        let shortcut = if self.has_projection() {
            let projected = layers::conv_with(xs, w(BlockPart::ShortcutConv, Kind::Weight)?, self.stride, 0);
            layers::norm_with(
                &projected,
                w(BlockPart::ShortcutNorm, Kind::Weight)?,
                w(BlockPart::ShortcutNorm, Kind::Bias)?,
            )
        } else {
            xs.shallow_clone()
        };

        Ok((out + shortcut).relu())
    }

    /// Register the block's trainable tensors
    pub fn collect(&self, weights: &mut Weights) {
        let mut put = |part, kind, tensor: Option<&Tensor>| {
            if let Some(tensor) = tensor {
                weights.insert(self.key(part, kind), tensor);
            }
        };

        put(BlockPart::Conv1, Kind::Weight, Some(&self.conv1.ws));
        put(BlockPart::Norm1, Kind::Weight, self.norm1.ws.as_ref());
        put(BlockPart::Norm1, Kind::Bias, self.norm1.bs.as_ref());
        put(BlockPart::Conv2, Kind::Weight, Some(&self.conv2.ws));
        put(BlockPart::Norm2, Kind::Weight, self.norm2.ws.as_ref());
        put(BlockPart::Norm2, Kind::Bias, self.norm2.bs.as_ref());
        if let Some(projection) = &self.shortcut {
            put(BlockPart::ShortcutConv, Kind::Weight, Some(&projection.conv.ws));
            put(BlockPart::ShortcutNorm, Kind::Weight, projection.norm.ws.as_ref());
            put(BlockPart::ShortcutNorm, Kind::Bias, projection.norm.bs.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind as TensorKind};

    #[test]
    fn test_identity_and_projection_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let identity = ResidualBlock::new(&(vs.root() / "a"), Stage::Layer1, 0, 16, 16, 1, WeightInit::XavierUniform);
        let projected = ResidualBlock::new(&(vs.root() / "b"), Stage::Layer2, 0, 16, 32, 2, WeightInit::XavierUniform);
        assert!(!identity.has_projection());
        assert!(projected.has_projection());

        let xs = Tensor::randn([2, 16, 8, 8], (TensorKind::Float, Device::Cpu));
        assert_eq!(identity.forward_t(&xs, true).size(), vec![2, 16, 8, 8]);
        assert_eq!(projected.forward_t(&xs, true).size(), vec![2, 32, 4, 4]);
    }

    #[test]
    fn test_collect_registers_every_tensor() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResidualBlock::new(&(vs.root() / "b"), Stage::Layer2, 0, 16, 32, 2, WeightInit::XavierUniform);
        let mut weights = Weights::new();
        block.collect(&mut weights);
        // 2 convs + 2 norms (w, b) + projection conv + norm (w, b)
        assert_eq!(weights.len(), 9);
        assert_eq!(weights.len(), vs.trainable_variables().len());
    }

    #[test]
    fn test_functional_matches_owned() {
        let vs = nn::VarStore::new(Device::Cpu);
        let block = ResidualBlock::new(&(vs.root() / "b"), Stage::Layer2, 0, 8, 16, 2, WeightInit::XavierNormal);
        let mut weights = Weights::new();
        block.collect(&mut weights);

        let xs = Tensor::randn([4, 8, 8, 8], (TensorKind::Float, Device::Cpu));
        let owned = block.forward_t(&xs, true);
        let functional = block.forward_with(&xs, &weights).unwrap();
        let diff = (owned - functional).abs().max().double_value(&[]);
        assert!(diff < 1e-5, "difference {}", diff);
    }
}
