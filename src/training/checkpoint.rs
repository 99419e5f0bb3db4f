//! Checkpoint files for the multi-task network
//!
//! One file per epoch, named `net_<epoch + 1:03>.pth`, holding every
//! variable of the network's VarStore (batch-norm running statistics
//! included) under dotted names.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tch::{nn, Tensor};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// File name of the checkpoint written after `epoch` (0-based)
pub fn checkpoint_name(epoch: usize) -> String {
    format!("net_{:03}.pth", epoch + 1)
}

/// Writes numbered checkpoints into one directory
#[derive(Debug, Clone)]
pub struct CheckpointWriter {
    dir: PathBuf,
}

impl CheckpointWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save `vs` as the checkpoint of `epoch`.
    ///
    /// The file is written under a hidden temporary name first and renamed
    /// into place, so a crash never leaves a truncated `net_XXX.pth`.
    pub fn save(&self, vs: &nn::VarStore, epoch: usize) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let name = checkpoint_name(epoch);
        let target = self.dir.join(&name);
        let partial = self.dir.join(format!(".{}.partial", name));

        vs.save(&partial)?;
        fs::rename(&partial, &target)?;

        info!("Saved checkpoint {}", target.display());
        Ok(target)
    }
}

/// Load `path` into `vs`, requiring the exact same set of names and shapes
pub fn load_strict<P: AsRef<Path>>(vs: &mut nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let shown = path.display().to_string();

    let stored: HashMap<String, Tensor> = Tensor::load_multi_with_device(path, vs.device())?
        .into_iter()
        .collect();
    let variables = vs.variables();

    let mut missing: Vec<&String> = variables.keys().filter(|name| !stored.contains_key(*name)).collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(Error::checkpoint_mismatch(shown, format!("missing {:?}", missing)));
    }

    let mut unexpected: Vec<&String> = stored.keys().filter(|name| !variables.contains_key(*name)).collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(Error::checkpoint_mismatch(shown, format!("unexpected {:?}", unexpected)));
    }

    for (name, variable) in &variables {
        let value = &stored[name];
        if variable.size() != value.size() {
            return Err(Error::checkpoint_mismatch(
                shown,
                format!("{}: expected {:?}, found {:?}", name, variable.size(), value.size()),
            ));
        }
    }

    tch::no_grad(|| -> Result<()> {
        for (name, variable) in &variables {
            let mut variable = variable.shallow_clone();
            variable.f_copy_(&stored[name])?;
        }
        Ok(())
    })?;

    debug!("Copied {} tensors from {}", variables.len(), shown);
    info!("Loaded checkpoint {}", shown);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Psi;
    use crate::model::MultiTaskNetwork;
    use tch::{Device, Kind};
    use tempfile::TempDir;

    fn network(psi: &Psi) -> (nn::VarStore, MultiTaskNetwork) {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = MultiTaskNetwork::new(&vs.root(), psi);
        (vs, net)
    }

    #[test]
    fn test_checkpoint_name() {
        assert_eq!(checkpoint_name(0), "net_001.pth");
        assert_eq!(checkpoint_name(29), "net_030.pth");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let psi = Psi::uniform(10, 5).unwrap();

        tch::manual_seed(1);
        let (saved_vs, saved) = network(&psi);
        let writer = CheckpointWriter::new(dir.path().join("model"));
        let path = writer.save(&saved_vs, 4).unwrap();
        assert_eq!(path.file_name().unwrap(), "net_005.pth");

        let leftovers: Vec<_> = fs::read_dir(writer.dir()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);

        tch::manual_seed(2);
        let (mut loaded_vs, loaded) = network(&psi);
        load_strict(&mut loaded_vs, &path).unwrap();

        let images = Tensor::randn([2, 3, 8, 8], (Kind::Float, Device::Cpu));
        let (expected, _) = saved.forward_t(&images, false);
        let (actual, _) = loaded.forward_t(&images, false);
        assert!((expected - actual).abs().max().double_value(&[]) < 1e-6);
    }

    #[test]
    fn test_mismatched_network_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (vs, _net) = network(&Psi::uniform(10, 5).unwrap());
        let path = CheckpointWriter::new(dir.path()).save(&vs, 0).unwrap();

        let (mut other_vs, _other) = network(&Psi::uniform(10, 3).unwrap());
        match load_strict(&mut other_vs, &path) {
            Err(Error::CheckpointMismatch { reason, .. }) => assert!(reason.contains("classifier2.4")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
