//! Data module for labels and image batches
//!
//! This module provides:
//! - The CINIC-10 label hierarchy, psi and the auxiliary mask
//! - The `BatchSource` seam consumed by the training loop
//! - Image-folder and synthetic batch sources

mod batch;
mod image_folder;
mod labels;
mod loader;
mod synthetic;

pub use batch::{BatchSource, ImageBatch, Normalization, CINIC_MEAN, CINIC_STD};
pub use image_folder::ImageFolder;
pub use labels::{CoarseMapping, LabelPair, PrimaryLevel, Psi};
pub use loader::DataLoader;
pub use synthetic::SyntheticImages;
