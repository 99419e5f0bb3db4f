//! Layer constructors and functional kernels
//!
//! Constructors register variables in a `VarStore` with the requested
//! initialisation. The functional kernels run the same arithmetic as the
//! `tch::nn` modules but take their weights as arguments, so both forward
//! modes of a network share one definition of every layer.

use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

/// Variance-scaling initialisation for conv and linear weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightInit {
    /// N(0, 2 / (fan_in + fan_out))
    XavierNormal,
    /// U(-b, b) with b = sqrt(6 / (fan_in + fan_out))
    XavierUniform,
}

impl WeightInit {
    /// Concrete initialiser for a weight with the given fans
    pub fn init(&self, fan_in: i64, fan_out: i64) -> nn::Init {
        let fans = (fan_in + fan_out) as f64;
        match self {
            WeightInit::XavierNormal => nn::Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fans).sqrt(),
            },
            WeightInit::XavierUniform => {
                let bound = (6.0 / fans).sqrt();
                nn::Init::Uniform {
                    lo: -bound,
                    up: bound,
                }
            }
        }
    }
}

/// Square convolution without bias
pub fn conv2d(
    path: nn::Path,
    in_channels: i64,
    out_channels: i64,
    kernel_size: i64,
    stride: i64,
    padding: i64,
    init: WeightInit,
) -> nn::Conv2D {
    let receptive = kernel_size * kernel_size;
    nn::conv2d(
        path,
        in_channels,
        out_channels,
        kernel_size,
        nn::ConvConfig {
            stride,
            padding,
            bias: false,
            ws_init: init.init(in_channels * receptive, out_channels * receptive),
            ..Default::default()
        },
    )
}

/// Batch normalisation with scale 1 and shift 0
pub fn batch_norm(path: nn::Path, channels: i64) -> nn::BatchNorm {
    nn::batch_norm2d(
        path,
        channels,
        nn::BatchNormConfig {
            ws_init: nn::Init::Const(1.0),
            bs_init: nn::Init::Const(0.0),
            ..Default::default()
        },
    )
}

/// Fully connected layer with zero bias
pub fn linear(path: nn::Path, in_dim: i64, out_dim: i64, init: WeightInit) -> nn::Linear {
    nn::linear(
        path,
        in_dim,
        out_dim,
        nn::LinearConfig {
            ws_init: init.init(in_dim, out_dim),
            bs_init: Some(nn::Init::Const(0.0)),
            bias: true,
        },
    )
}

/// Convolution with an external weight
pub(crate) fn conv_with(xs: &Tensor, weight: &Tensor, stride: i64, padding: i64) -> Tensor {
    xs.conv2d(
        weight,
        None::<Tensor>,
        [stride, stride],
        [padding, padding],
        [1, 1],
        1,
    )
}

/// Batch normalisation from the current batch statistics, no running buffers
pub(crate) fn norm_with(xs: &Tensor, weight: &Tensor, bias: &Tensor) -> Tensor {
    let config = nn::BatchNormConfig::default();
    xs.batch_norm(
        Some(weight),
        Some(bias),
        None::<&Tensor>,
        None::<&Tensor>,
        true,
        config.momentum,
        config.eps,
        config.cudnn_enabled,
    )
}

/// Affine layer with an external weight and bias
pub(crate) fn linear_with(xs: &Tensor, weight: &Tensor, bias: &Tensor) -> Tensor {
    xs.linear(weight, Some(bias))
}

/// Global average pool over the (square) spatial extent, flattened
pub(crate) fn global_pool(xs: &Tensor) -> Tensor {
    let side = xs.size()[3];
    xs.avg_pool2d([side, side], [side, side], [0, 0], false, true, None::<i64>)
        .flatten(1, -1)
}
