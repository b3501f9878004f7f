pub mod aggregator;
pub mod attack;
pub mod autograd;
pub mod checkpoint;
pub mod config;
pub mod env;
pub mod error;
pub mod metrics;
pub mod nn;
pub mod optim;
pub mod params;
pub mod policy;
pub mod rng;
pub mod rollout;
pub mod simd;
pub mod trainer;
pub mod updater;
pub mod worker;

#[cfg(test)]
mod grad_check;
#[cfg(test)]
mod scenarios;

pub use config::{Algorithm, Config};
pub use error::{FedError, Result};
