use crate::attack::AttackKind;
use crate::error::{FedError, Result};
use crate::nn::Activation;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "fedpg-br")]
    FedPgBr,
    #[serde(rename = "svrpg")]
    Svrpg,
    #[serde(rename = "gomdp")]
    Gomdp,
}

impl Algorithm {
    pub fn is_robust(&self) -> bool {
        matches!(self, Algorithm::FedPgBr)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub env_name: String,
    pub gamma: f64,
    pub hidden_units: Vec<usize>,
    pub activation: Activation,
    pub max_epi_len: usize,

    pub num_worker: usize,
    pub num_byzantine: usize,
    pub attack_type: AttackKind,
    pub attack_scale: f64,

    pub algorithm: Algorithm,
    pub batch_size: usize,
    pub batch_size_min: usize,
    pub batch_size_max: usize,
    pub mini_batch: usize,
    pub inner_steps: usize,

    pub delta: f64,
    pub sigma: f64,
    pub alpha: f64,

    pub lr: f64,
    pub max_trajectories: usize,
    pub do_sample_for_training: bool,

    pub val_size: usize,
    pub val_max_steps: usize,

    pub seeds: Vec<u64>,
    pub save_dir: String,
    pub no_saving: bool,
    pub telemetry_path: Option<String>,
    pub summary_path: Option<String>,
    pub summary_points: usize,

    pub worker_threads: usize,
    pub worker_stack_size_mb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env_name: "CartPole-v1".to_string(),
            gamma: 0.999,
            hidden_units: vec![16, 16],
            activation: Activation::Relu,
            max_epi_len: 500,
            num_worker: 10,
            num_byzantine: 0,
            attack_type: AttackKind::None,
            attack_scale: 2.5,
            algorithm: Algorithm::FedPgBr,
            batch_size: 16,
            batch_size_min: 12,
            batch_size_max: 20,
            mini_batch: 4,
            inner_steps: 2,
            delta: 0.6,
            sigma: 0.06,
            alpha: 0.4,
            lr: 1e-3,
            max_trajectories: 5000,
            do_sample_for_training: true,
            val_size: 10,
            val_max_steps: 1000,
            seeds: vec![1],
            save_dir: "outputs".to_string(),
            no_saving: false,
            telemetry_path: None,
            summary_path: None,
            summary_points: 200,
            worker_threads: 0,
            worker_stack_size_mb: 4,
        }
    }
}

impl Config {
    /// Reads a JSON config. Missing keys keep their defaults. A relative path
    /// that does not exist is retried two levels up (running from
    /// `target/release`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if path.is_relative() => {
                let alt = Path::new("../..").join(path);
                match File::open(&alt) {
                    Ok(f) => {
                        info!("[System] Config found in parent directory.");
                        f
                    }
                    Err(_) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |param: &str, msg: &str| Err(FedError::config(param, msg));

        if self.num_worker == 0 {
            return fail("num_worker", "need at least one worker");
        }
        if self.num_byzantine > self.num_worker {
            return fail("num_byzantine", "cannot exceed num_worker");
        }
        if !(self.gamma > 0.0 && self.gamma <= 1.0) {
            return fail("gamma", "must lie in (0, 1]");
        }
        if self.hidden_units.iter().any(|&h| h == 0) {
            return fail("hidden_units", "layer widths must be positive");
        }
        if self.max_epi_len == 0 {
            return fail("max_epi_len", "must be positive");
        }
        match self.algorithm {
            Algorithm::FedPgBr => {
                if self.batch_size_min == 0 || self.batch_size_min > self.batch_size_max {
                    return fail("batch_size_min", "need 0 < batch_size_min <= batch_size_max");
                }
            }
            Algorithm::Svrpg | Algorithm::Gomdp => {
                if self.batch_size == 0 {
                    return fail("batch_size", "must be positive");
                }
            }
        }
        if self.algorithm != Algorithm::Gomdp && self.mini_batch == 0 {
            return fail("mini_batch", "must be positive");
        }
        if !(self.sigma > 0.0) {
            return fail("sigma", "must be positive");
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return fail("delta", "must lie in (0, 1)");
        }
        if !(self.alpha >= 0.0 && self.alpha < 1.0) {
            return fail("alpha", "must lie in [0, 1)");
        }
        if !(self.lr > 0.0) {
            return fail("lr", "must be positive");
        }
        if self.val_max_steps == 0 {
            return fail("val_max_steps", "must be positive");
        }
        if self.seeds.is_empty() {
            return fail("seeds", "need at least one run seed");
        }
        Ok(())
    }

    /// Worker pool width; 0 in the config means one thread per worker.
    pub fn pool_threads(&self) -> usize {
        if self.worker_threads == 0 {
            self.num_worker
        } else {
            self.worker_threads
        }
    }

    pub fn byzantine_mask(&self) -> Vec<bool> {
        (0..self.num_worker).map(|i| i < self.num_byzantine).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let c = Config::from_json(r#"{ "num_worker": 5, "num_byzantine": 2, "attack_type": "sign-flipping" }"#).unwrap();
        assert_eq!(c.num_worker, 5);
        assert_eq!(c.attack_type, AttackKind::SignFlipping);
        assert_eq!(c.algorithm, Algorithm::FedPgBr);
        assert_eq!(c.byzantine_mask(), vec![true, true, false, false, false]);
    }

    #[test]
    fn algorithm_and_activation_names() {
        let c = Config::from_json(r#"{ "algorithm": "svrpg", "activation": "tanh" }"#).unwrap();
        assert_eq!(c.algorithm, Algorithm::Svrpg);
        assert_eq!(c.activation, Activation::Tanh);
        assert!(Config::from_json(r#"{ "algorithm": "fedavg" }"#).is_err());
    }

    #[test]
    fn inverted_batch_bounds_are_rejected() {
        let err = Config::from_json(r#"{ "batch_size_min": 30, "batch_size_max": 20 }"#).unwrap_err();
        match err {
            FedError::InvalidConfig { param, .. } => assert_eq!(param, "batch_size_min"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn pool_defaults_to_federation_width() {
        let c = Config::from_json(r#"{ "num_worker": 7 }"#).unwrap();
        assert_eq!(c.pool_threads(), 7);
        let c = Config::from_json(r#"{ "num_worker": 7, "worker_threads": 3 }"#).unwrap();
        assert_eq!(c.pool_threads(), 3);
    }

    #[test]
    fn too_many_byzantine_is_rejected() {
        assert!(Config::from_json(r#"{ "num_worker": 3, "num_byzantine": 4 }"#).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "lr": 0.01, "seeds": [3, 4] }"#).unwrap();
        let c = Config::load(&path).unwrap();
        assert_eq!(c.seeds, vec![3, 4]);
        assert!((c.lr - 0.01).abs() < 1e-15);
    }
}
