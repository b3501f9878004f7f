// --- Round Orchestration ---

use crate::aggregator::{aggregate_plain, Aggregation, FilterRule, RobustAggregator};
use crate::attack::{AttackSimulator, VarianceAttack};
use crate::checkpoint::Checkpoint;
use crate::config::{Algorithm, Config};
use crate::env::{make_env, Environment};
use crate::error::{FedError, Result};
use crate::metrics::{DetectionScores, GroupDistances, RoundTelemetry, RunLog, TelemetrySink};
use crate::optim::Adam;
use crate::params::ParamVec;
use crate::policy::{CategoricalMlp, Policy};
use crate::rng::Rng;
use crate::rollout::{evaluate, EnvSampler, Evaluation, RolloutConfig};
use crate::updater::{InnerBudget, InnerLoopConfig, VarianceReducedUpdater};
use crate::worker::{Worker, WorkerPool};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    pub batch_size: usize,
    pub inner_steps: usize,
    pub step: usize,
}

impl RoundState {
    /// Charges one round to the trajectory counter. Workers sample in
    /// parallel, so with W > 1 the `B` per worker and the master's `b N_t`
    /// are averaged over the W + 1 participants.
    pub fn advance(&mut self, num_workers: usize, mini_batch: usize) {
        let inner = mini_batch * self.inner_steps;
        self.step += if num_workers > 1 {
            ((self.batch_size * num_workers + inner) as f64 / (1 + num_workers) as f64).round() as usize
        } else {
            self.batch_size + inner
        };
    }
}

pub struct Trainer {
    config: Config,
    run: usize,
    master: CategoricalMlp,
    old_master: CategoricalMlp,
    optimizer: Adam,
    workers: Vec<Worker<CategoricalMlp>>,
    aggregator: Option<RobustAggregator>,
    updater: Option<VarianceReducedUpdater>,
    sampler: EnvSampler,
    val_env: Box<dyn Environment>,
    rng: Rng,
    state: RoundState,
    epoch: usize,
    is_byzantine: Vec<bool>,
}

impl Trainer {
    pub fn new(config: &Config, run: usize, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = Rng::from_seed(seed);

        let env = make_env(&config.env_name)?;
        let (obs_dim, num_actions) = (env.observation_dim(), env.num_actions());
        let master = CategoricalMlp::new(obs_dim, &config.hidden_units, num_actions, config.activation, rng.next_u64())?;
        let old_master = master.replicate();
        let optimizer = Adam::new(master.parameters(), config.lr);

        let rollout = RolloutConfig::new(config.gamma, config.max_epi_len, config.do_sample_for_training);
        let is_byzantine = config.byzantine_mask();
        let workers = (0..config.num_worker)
            .map(|i| -> Result<Worker<CategoricalMlp>> {
                Ok(Worker::new(
                    i,
                    is_byzantine[i],
                    config.attack_type,
                    config.attack_scale,
                    master.replicate(),
                    make_env(&config.env_name)?,
                    rollout,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let aggregator = if config.algorithm.is_robust() {
            Some(RobustAggregator::new(config.sigma, config.delta, config.alpha)?)
        } else {
            None
        };
        let updater = match config.algorithm {
            Algorithm::FedPgBr => Some(VarianceReducedUpdater::new(InnerLoopConfig::new(
                config.mini_batch,
                InnerBudget::Geometric,
            ))?),
            Algorithm::Svrpg => Some(VarianceReducedUpdater::new(InnerLoopConfig::new(
                config.mini_batch,
                InnerBudget::Fixed(config.inner_steps),
            ))?),
            Algorithm::Gomdp => None,
        };

        Ok(Trainer {
            config: config.clone(),
            run,
            master,
            old_master,
            optimizer,
            workers,
            aggregator,
            updater,
            sampler: EnvSampler::new(env, rollout),
            val_env: make_env(&config.env_name)?,
            rng,
            state: RoundState::default(),
            epoch: 0,
            is_byzantine,
        })
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn master(&self) -> &CategoricalMlp {
        &self.master
    }

    pub fn resume(&mut self, checkpoint: Checkpoint) -> Result<()> {
        self.master.load_parameters(&checkpoint.master)?;
        self.optimizer.load_state(checkpoint.optimizer)?;
        self.rng = checkpoint.rng;
        self.state.step = checkpoint.step;
        self.epoch = checkpoint.epoch + 1;
        info!(
            "[Master] resuming run {} at epoch {} step {}",
            self.run, self.epoch, self.state.step
        );
        Ok(())
    }

    pub fn load_parameters(&mut self, params: &ParamVec) -> Result<()> {
        self.master.load_parameters(params)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            run: self.run,
            epoch: self.epoch,
            step: self.state.step,
            master: self.master.get_parameters(),
            optimizer: self.optimizer.state(),
            rng: self.rng.clone(),
        }
    }

    pub fn validate(&mut self) -> Result<Evaluation> {
        self.val_env.seed(self.rng.next_range(1, 99_999) as u64);
        evaluate(
            &self.master,
            self.val_env.as_mut(),
            self.config.val_size,
            self.config.val_max_steps,
            &mut self.rng,
        )
    }

    fn draw_batch_size(&mut self) -> usize {
        match self.config.algorithm {
            Algorithm::FedPgBr => self.rng.next_range(self.config.batch_size_min, self.config.batch_size_max),
            Algorithm::Svrpg | Algorithm::Gomdp => self.config.batch_size,
        }
    }

    fn aggregate(&self, gradients: &[ParamVec], batch_size: usize) -> Result<Aggregation> {
        let aggregation = match &self.aggregator {
            Some(a) => a.aggregate(gradients, batch_size)?,
            None => aggregate_plain(gradients)?,
        };
        if aggregation.rule == FilterRule::Degenerate {
            warn!(
                "[Filter] every worker rejected at epoch {}; check sigma ({})",
                self.epoch, self.config.sigma
            );
        }
        Ok(aggregation)
    }

    /// One full round. Returns its telemetry; does not emit it.
    pub fn train_round(&mut self, pool: &WorkerPool) -> Result<RoundTelemetry> {
        let w = self.config.num_worker;
        self.state.batch_size = self.draw_batch_size();
        let batch_size = self.state.batch_size;

        let seeds: Vec<u64> = (0..w).map(|_| self.rng.next_range(1, 99_999) as u64).collect();
        let params = self.master.get_parameters();
        let reports = pool.run_round(&mut self.workers, &params, batch_size, &seeds)?;

        let collected: Vec<ParamVec> = reports.iter().map(|r| r.gradient.clone()).collect();
        let gradients = if self.config.attack_type.is_server_side() && self.config.num_byzantine > 0 {
            let byzantine: Vec<usize> = (0..self.config.num_byzantine).collect();
            VarianceAttack::default().craft(&collected, &byzantine, &mut self.rng)
        } else {
            collected
        };

        self.old_master.load_parameters(&params)?;
        let aggregation = self.aggregate(&gradients, batch_size)?;

        let (inner_steps, mini_batch, early_stopped, mean_grad) = match &self.updater {
            Some(updater) => {
                let outcome = updater.update(
                    &self.master,
                    &self.old_master,
                    &mut self.optimizer,
                    aggregation.control_variate.as_ref(),
                    batch_size,
                    &mut self.sampler,
                    &mut self.rng,
                )?;
                (outcome.steps, self.config.mini_batch, outcome.early_stopped, outcome.mean_applied())
            }
            None => match &aggregation.control_variate {
                Some(mu) => {
                    let applied = VarianceReducedUpdater::apply_plain(&self.master, &mut self.optimizer, mu)?;
                    let mean = applied.iter().sum::<f64>() / applied.len().max(1) as f64;
                    (0, 0, false, mean)
                }
                None => {
                    warn!("[Master] no aggregate gradient at epoch {}; skipping update", self.epoch);
                    (0, 0, false, 0.0)
                }
            },
        };

        self.state.inner_steps = inner_steps;
        self.state.advance(w, mini_batch);

        let validation = if self.config.val_size > 0 {
            Some(self.validate()?)
        } else {
            None
        };

        let detection = if self.aggregator.is_some() && self.config.num_byzantine > 0 {
            Some(DetectionScores::compute(&self.is_byzantine, &aggregation.good_set))
        } else {
            None
        };

        let n = reports.len().max(1) as f64;
        let telemetry = RoundTelemetry {
            run: self.run,
            epoch: self.epoch,
            step: self.state.step,
            batch_size,
            mean_loss: reports.iter().map(|r| r.loss).sum::<f64>() / n,
            mean_return: reports.iter().map(|r| r.mean_return).sum::<f64>() / n,
            mean_length: reports.iter().map(|r| r.mean_length).sum::<f64>() / n,
            good_count: aggregation.good_count(),
            rule: aggregation.rule,
            threshold: self.aggregator.as_ref().map(|_| aggregation.threshold),
            detection,
            distances: GroupDistances::compute(&aggregation.distances, &self.is_byzantine),
            lr: self.optimizer.lr(),
            inner_steps,
            early_stopped,
            mean_grad,
            val_return: validation.map(|v| v.mean_return),
            val_length: validation.map(|v| v.mean_length),
        };

        if !self.config.no_saving {
            self.checkpoint().save(&self.config.save_dir)?;
        }
        self.epoch += 1;
        Ok(telemetry)
    }

    pub fn run(&mut self, pool: &WorkerPool, sinks: &mut [Box<dyn TelemetrySink>]) -> Result<RunLog> {
        let seed = self.config.seeds.get(self.run).copied().unwrap_or_default();
        let mut log = RunLog::new(self.run, seed);
        info!(
            "[Master] run {} ({:?}, {} workers, {} Byzantine, attack {:?})",
            self.run, self.config.algorithm, self.config.num_worker, self.config.num_byzantine, self.config.attack_type
        );
        while self.state.step <= self.config.max_trajectories {
            let telemetry = self.train_round(pool)?;
            for sink in sinks.iter_mut() {
                sink.record(&telemetry)?;
            }
            log.push(telemetry);
        }
        for sink in sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(log)
    }
}

pub fn run_experiment(
    config: &Config,
    pool: &WorkerPool,
    resume: Option<Checkpoint>,
    sinks: &mut [Box<dyn TelemetrySink>],
) -> Result<Vec<RunLog>> {
    match resume {
        Some(checkpoint) => {
            let seed = *config.seeds.get(checkpoint.run).ok_or_else(|| {
                FedError::config("seeds", format!("checkpoint is from run {}, no seed configured", checkpoint.run))
            })?;
            let mut trainer = Trainer::new(config, checkpoint.run, seed)?;
            trainer.resume(checkpoint)?;
            Ok(vec![trainer.run(pool, sinks)?])
        }
        None => config
            .seeds
            .iter()
            .enumerate()
            .map(|(run, &seed)| Trainer::new(config, run, seed)?.run(pool, sinks))
            .collect(),
    }
}

/// Validation of a saved policy. Optimizer and RNG state are ignored.
pub fn evaluate_checkpoint<P: AsRef<Path>>(config: &Config, path: P) -> Result<Evaluation> {
    let checkpoint = Checkpoint::load(path)?;
    let seed = config.seeds.get(checkpoint.run).copied().unwrap_or_default();
    let mut trainer = Trainer::new(config, checkpoint.run, seed)?;
    trainer.load_parameters(&checkpoint.master)?;
    trainer.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            num_worker: 3,
            hidden_units: vec![8],
            batch_size: 2,
            batch_size_min: 2,
            batch_size_max: 3,
            mini_batch: 1,
            inner_steps: 2,
            max_epi_len: 30,
            max_trajectories: 6,
            val_size: 1,
            val_max_steps: 30,
            sigma: 10.0,
            no_saving: true,
            ..Config::default()
        }
    }

    #[test]
    fn step_accounting_multi_worker() {
        let mut s = RoundState {
            batch_size: 16,
            inner_steps: 3,
            step: 100,
        };
        s.advance(10, 4);
        // (16 * 10 + 4 * 3) / 11 = 15.636...
        assert_eq!(s.step, 116);
    }

    #[test]
    fn step_accounting_single_worker() {
        let mut s = RoundState {
            batch_size: 16,
            inner_steps: 3,
            step: 0,
        };
        s.advance(1, 4);
        assert_eq!(s.step, 28);
    }

    #[test]
    fn run_stops_after_budget_and_step_never_decreases() {
        let config = small_config();
        let pool = WorkerPool::new(2, 0).unwrap();
        let mut trainer = Trainer::new(&config, 0, 17).unwrap();
        let log = trainer.run(&pool, &mut []).unwrap();
        assert!(!log.rounds.is_empty());
        assert!(log.last_step() > config.max_trajectories);
        for pair in log.rounds.windows(2) {
            assert!(pair[1].step > pair[0].step);
        }
        assert!(log.rounds.iter().all(|r| r.val_return.is_some()));
    }

    #[test]
    fn batch_size_stays_in_bounds() {
        let config = small_config();
        let pool = WorkerPool::new(2, 0).unwrap();
        let mut trainer = Trainer::new(&config, 0, 3).unwrap();
        for _ in 0..3 {
            let t = trainer.train_round(&pool).unwrap();
            assert!((2..=3).contains(&t.batch_size));
        }
    }

    #[test]
    fn gomdp_uses_no_inner_loop() {
        let config = Config {
            algorithm: Algorithm::Gomdp,
            ..small_config()
        };
        let pool = WorkerPool::new(2, 0).unwrap();
        let mut trainer = Trainer::new(&config, 0, 5).unwrap();
        let before = trainer.master().get_parameters();
        let t = trainer.train_round(&pool).unwrap();
        assert_eq!(t.inner_steps, 0);
        assert_eq!(t.rule, FilterRule::PassThrough);
        assert!(t.threshold.is_none());
        // (2 * 3 + 0) / 4 = 1.5, rounded away from zero
        assert_eq!(t.step, 2);
        assert_ne!(trainer.master().get_parameters(), before);
    }

    #[test]
    fn resume_restores_master_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            no_saving: false,
            save_dir: dir.path().to_string_lossy().into_owned(),
            ..small_config()
        };
        let pool = WorkerPool::new(2, 0).unwrap();
        let mut trainer = Trainer::new(&config, 0, 9).unwrap();
        trainer.train_round(&pool).unwrap();
        let path = dir.path().join(Checkpoint::file_name(0, 0));
        let saved = Checkpoint::load(&path).unwrap();

        let mut resumed = Trainer::new(&config, 0, 9).unwrap();
        resumed.resume(saved.clone()).unwrap();
        assert_eq!(resumed.master().get_parameters(), saved.master);
        assert_eq!(resumed.epoch(), 1);
        assert_eq!(resumed.state().step, saved.step);
        assert_eq!(resumed.checkpoint().rng, saved.rng);
    }

    #[test]
    fn evaluate_checkpoint_loads_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config();
        let trainer = Trainer::new(&config, 0, 4).unwrap();
        let path = trainer.checkpoint().save(dir.path()).unwrap();
        let eval = evaluate_checkpoint(&config, path).unwrap();
        assert!(eval.mean_length >= 1.0 && eval.mean_length <= 30.0);
    }
}
