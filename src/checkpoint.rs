use crate::error::Result;
use crate::optim::AdamState;
use crate::params::ParamVec;
use crate::rng::Rng;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Master state after a round: parameters, optimizer moments and the master
/// RNG, so a resumed run draws the same batch sizes and seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run: usize,
    pub epoch: usize,
    pub step: usize,
    pub master: ParamVec,
    pub optimizer: AdamState,
    pub rng: Rng,
}

impl Checkpoint {
    pub fn file_name(run: usize, epoch: usize) -> String {
        format!("r{}-epoch-{}.bin", run, epoch)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<PathBuf> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(Self::file_name(self.run, self.epoch));
        let writer = BufWriter::new(File::create(&path)?);
        bincode::serialize_into(writer, self)?;
        info!("[Master] checkpoint saved to {}", path.display());
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let checkpoint: Checkpoint = bincode::deserialize_from(reader)?;
        info!(
            "[Master] loaded checkpoint {} (run {}, epoch {}, step {})",
            path.as_ref().display(),
            checkpoint.run,
            checkpoint.epoch,
            checkpoint.step
        );
        Ok(checkpoint)
    }
}
