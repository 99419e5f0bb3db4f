//! Image-folder datasets (CINIC-10 layout)
//!
//! `root/<split>/<class>/<image>`; class directories are sorted by name and
//! numbered from zero, which reproduces the CINIC-10 label order.

use std::fs;
use std::path::{Path, PathBuf};

use tch::{Kind, Tensor};
use tracing::{debug, info};

use super::batch::{BatchSource, ImageBatch, Normalization};
use super::loader::DataLoader;
use crate::error::{Error, Result};

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// An image folder held in memory as `uint8`
#[derive(Debug)]
pub struct ImageFolder {
    /// Images of shape (N, 3, H, W), `uint8`
    images: Tensor,
    /// Class index per image
    labels: Tensor,
    /// Class directory names, index = label
    classes: Vec<String>,
    normalization: Normalization,
    loader: DataLoader,
}

impl ImageFolder {
    /// Decode every image below `dir`
    pub fn load<P: AsRef<Path>>(
        dir: P,
        batch_size: usize,
        shuffle: bool,
        normalization: Normalization,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let classes = class_directories(dir)?;
        if classes.is_empty() {
            return Err(Error::data_source(format!(
                "no class directories found in {}",
                dir.display()
            )));
        }

        let mut images = Vec::new();
        let mut labels = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let files = image_files(&dir.join(class))?;
            debug!("{}: {} images in class {}", dir.display(), files.len(), class);
            for file in files {
                let image = tch::vision::image::load(&file)?;
                if image.size()[0] != 3 {
                    return Err(Error::data_source(format!(
                        "{} has {} channels, expected 3",
                        file.display(),
                        image.size()[0]
                    )));
                }
                images.push(image);
                labels.push(label as i64);
            }
        }

        if images.is_empty() {
            return Err(Error::data_source(format!("no images found in {}", dir.display())));
        }

        let images = Tensor::f_stack(&images, 0)?;
        info!(
            "Loaded {} images in {} classes from {}",
            labels.len(),
            classes.len(),
            dir.display()
        );

        Ok(Self {
            loader: DataLoader::new(labels.len(), batch_size, shuffle),
            images,
            labels: Tensor::from_slice(&labels),
            classes,
            normalization,
        })
    }

    /// Number of images
    pub fn len(&self) -> usize {
        self.labels.size()[0] as usize
    }

    /// Whether the folder is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Class names in label order
    pub fn classes(&self) -> &[String] {
        &self.classes
    }
}

impl BatchSource for ImageFolder {
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
        let index = Tensor::from_slice(&indices);
        let batch = self
            .images
            .f_index_select(0, &index)
            .and_then(|images| {
                let labels = self.labels.f_index_select(0, &index)?;
                Ok(ImageBatch {
                    images: self.normalization.apply(&images),
                    labels: labels.to_kind(Kind::Int64),
                })
            })
            .map_err(Error::from);
        Some(batch)
    }
}

fn class_directories(dir: &Path) -> Result<Vec<String>> {
    let mut classes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            classes.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    classes.sort();
    Ok(classes)
}

fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
