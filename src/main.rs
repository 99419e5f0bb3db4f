//! Train the multi-task ResNet-32 with a meta-learned label generator
//!
//! Reads CINIC-10 from `data.root/{train,test}` (or a synthetic source),
//! writes one checkpoint per epoch into `--outf` and appends one summary
//! line per epoch to the training log.

use anyhow::{Context, Result};
use clap::Parser;
use tch::Device;
use tracing::info;

use meta_aux_resnet::{setup_logging, BatchSource, Config, ImageFolder, SyntheticImages, Trainer, TrainingSession};

/// Samples per synthetic split: (train, test)
const SYNTHETIC_SAMPLES: (usize, usize) = (512, 256);
const SYNTHETIC_IMAGE_SIZE: i64 = 32;

#[derive(Parser)]
#[command(name = "meta_aux_train")]
#[command(about = "Multi-task ResNet-32 with meta-learned auxiliary labels")]
struct Args {
    /// Directory for the per-epoch model checkpoints
    #[arg(long, default_value = "./pri5model/")]
    outf: String,

    /// Configuration file overriding the built-in defaults
    #[arg(short, long)]
    config: Option<String>,

    /// Train on random images instead of the CINIC-10 folders
    #[arg(long)]
    synthetic: bool,
}

fn load_sources(config: &Config, synthetic: bool, device: Device) -> Result<(Box<dyn BatchSource>, Box<dyn BatchSource>)> {
    let batch_size = config.data.batch_size;

    if synthetic {
        info!("Using synthetic images");
        let seed = config.training.seed.unwrap_or(0) as u64;
        let train =
            SyntheticImages::with_seed(SYNTHETIC_SAMPLES.0, 10, SYNTHETIC_IMAGE_SIZE, batch_size, device, seed)?;
        let test =
            SyntheticImages::with_seed(SYNTHETIC_SAMPLES.1, 10, SYNTHETIC_IMAGE_SIZE, batch_size, device, seed + 1)?;
        return Ok((Box::new(train), Box::new(test)));
    }

    let root = &config.data.root;
    let normalization = config.data.normalization();
    let train = ImageFolder::load(root.join("train"), batch_size, config.data.shuffle, normalization)
        .with_context(|| format!("loading training images from {}", root.display()))?;
    let test = ImageFolder::load(root.join("test"), batch_size, false, normalization)
        .with_context(|| format!("loading test images from {}", root.display()))?;
    info!("Loaded {} training and {} test images", train.len(), test.len());

    Ok((Box::new(train), Box::new(test)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("reading config {}", path))?,
        None => Config::default(),
    };
    setup_logging(&config.logging.level)?;
    config.validate()?;

    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    let (mut train, mut test) = load_sources(&config, args.synthetic, device)?;

    let mut session = TrainingSession::new(&config, device)?;
    if let Some(checkpoint) = &config.training.resume_from {
        session
            .resume(checkpoint)
            .with_context(|| format!("resuming from {}", checkpoint.display()))?;
    }

    let mut trainer = Trainer::new(session, &config.training, &args.outf)?;
    let history = trainer.train(train.as_mut(), test.as_mut())?;

    if let Some(last) = history.last() {
        info!("Final epoch: {}", last);
    }
    Ok(())
}
