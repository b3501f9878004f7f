use crate::attack::AttackKind;
use crate::env::Environment;
use crate::error::{FedError, Result};
use crate::params::{GradientVector, ParamVec};
use crate::policy::Policy;
use crate::rng::Rng;
use crate::rollout::{collect_trajectories, surrogate_loss, RolloutConfig};
use log::{debug, info};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker: usize,
    pub gradient: GradientVector,
    pub loss: f64,
    pub mean_return: f64,
    pub mean_length: f64,
}

pub struct Worker<P: Policy> {
    pub id: usize,
    pub is_byzantine: bool,
    attack: AttackKind,
    attack_scale: f64,
    policy: P,
    env: Box<dyn Environment>,
    rollout: RolloutConfig,
}

impl<P: Policy> Worker<P> {
    pub fn new(
        id: usize,
        is_byzantine: bool,
        attack: AttackKind,
        attack_scale: f64,
        policy: P,
        env: Box<dyn Environment>,
        rollout: RolloutConfig,
    ) -> Self {
        Worker {
            id,
            is_byzantine,
            attack,
            attack_scale,
            policy,
            env,
            rollout,
        }
    }

    pub fn train_one_epoch(&mut self, params: &ParamVec, batch_size: usize, seed: u64) -> Result<WorkerReport> {
        self.policy.load_parameters(params)?;
        self.env.seed(seed);
        let mut rng = Rng::from_seed(seed);

        let mut config = self.rollout;
        if self.is_byzantine {
            config.random_action = self.attack == AttackKind::RandomAction;
            config.flip_reward = self.attack == AttackKind::RewardFlipping;
        }
        let batch = collect_trajectories(&self.policy, self.env.as_mut(), batch_size, &config, &mut rng)?;

        self.policy.zero_grad();
        let loss = surrogate_loss(&self.policy, &batch)?;
        loss.backward();
        let mut gradient = self.policy.gradients();
        if self.is_byzantine {
            self.attack.corrupt_gradient(&mut gradient, self.attack_scale, &mut rng);
        }

        Ok(WorkerReport {
            worker: self.id,
            gradient,
            loss: loss.item(),
            mean_return: batch.mean_return(),
            mean_length: batch.mean_length(),
        })
    }
}

pub struct WorkerPool {
    pool: Arc<ThreadPool>,
    num_threads: usize,
}

impl WorkerPool {
    /// `num_threads == 0` picks one thread per core, keeping one core free.
    pub fn new(num_threads: usize, stack_size_mb: usize) -> Result<Self> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let num_threads = if num_threads == 0 {
            if cores > 2 {
                cores - 1
            } else {
                cores
            }
        } else {
            num_threads
        };
        let stack_size = if stack_size_mb == 0 {
            4 * 1024 * 1024
        } else {
            stack_size_mb * 1024 * 1024
        };

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("fed-worker-{}", i))
            .stack_size(stack_size)
            .build()
            .map_err(|e| FedError::config("worker_stack_size_mb", e.to_string()))?;

        info!("[Worker] pool initialized with {} threads", num_threads);

        Ok(Self {
            pool: Arc::new(pool),
            num_threads,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.num_threads
    }

    /// Runs every worker once, in parallel, and returns the reports in
    /// worker order. A panic, an error, or a gradient shaped unlike `params`
    /// in any worker fails the round.
    pub fn run_round<P: Policy>(
        &self,
        workers: &mut [Worker<P>],
        params: &ParamVec,
        batch_size: usize,
        seeds: &[u64],
    ) -> Result<Vec<WorkerReport>> {
        if seeds.len() != workers.len() {
            return Err(FedError::config(
                "seeds",
                format!("{} seeds for {} workers", seeds.len(), workers.len()),
            ));
        }

        let results: Vec<(usize, std::thread::Result<Result<WorkerReport>>)> = self.pool.install(|| {
            workers
                .par_iter_mut()
                .zip(seeds.par_iter())
                .map(|(w, &seed)| {
                    let id = w.id;
                    (id, panic::catch_unwind(AssertUnwindSafe(|| w.train_one_epoch(params, batch_size, seed))))
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(Ok(report)) => {
                    params.check_compatible(&report.gradient)?;
                    debug!(
                        "[Worker] {} loss {:.4} return {:.2} len {:.1}",
                        id, report.loss, report.mean_return, report.mean_length
                    );
                    reports.push(report);
                }
                Ok(Err(e)) => return Err(e),
                Err(err) => {
                    return Err(FedError::WorkerFailure {
                        worker: id,
                        message: panic_message(err.as_ref()),
                    })
                }
            }
        }
        Ok(reports)
    }
}

fn panic_message(err: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = err.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked with unknown error".to_string()
    }
}
