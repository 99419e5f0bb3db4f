//! Network architectures
//!
//! This module provides:
//! - Layer constructors and the functional kernels behind both forward modes
//! - The typed parameter registry used by functional forward passes
//! - The residual block and the ResNet-32 backbone
//! - The label generator and the multi-task network

mod backbone;
mod label_generator;
mod layers;
mod multitask;
mod params;
mod residual;

pub use backbone::{Backbone, FunctionalIndexing, StageOutputs, FEATURE_DIM, STEM_CHANNELS};
pub use label_generator::{masked_softmax, LabelGenerator};
pub use layers::WeightInit;
pub use multitask::MultiTaskNetwork;
pub use params::{BlockPart, Kind, ParamKey, Site, Stage, Task, Weights};
pub use residual::ResidualBlock;
