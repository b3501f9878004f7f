// --- SVRPG inner loop ---
// Steps along g(theta_n) - w * g(theta_0) + mu, where w re-weights the inner
// batch as if drawn from the round's starting parameters theta_0. The loop
// stops once the mean importance ratio leaves the band around one.

use crate::autograd::Tensor;
use crate::error::{FedError, Result};
use crate::optim::Adam;
use crate::params::ParamVec;
use crate::policy::Policy;
use crate::rng::Rng;
use crate::rollout::{surrogate_loss, TrajectorySource};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InnerBudget {
    Fixed(usize),
    /// `N_t` ~ Geometric(`b / (B + b)`) on `{1, 2, ...}`, mean `(B + b) / b`.
    Geometric,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InnerLoopConfig {
    pub mini_batch: usize,
    pub budget: InnerBudget,
    pub ratio_low: f64,
    pub ratio_high: f64,
}

impl InnerLoopConfig {
    pub fn new(mini_batch: usize, budget: InnerBudget) -> Self {
        InnerLoopConfig {
            mini_batch,
            budget,
            ratio_low: 0.995,
            ratio_high: 1.005,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InnerLoopOutcome {
    /// Effective `N_t` for step accounting. An early stop at the first
    /// iteration truncates it to 0 even though the fallback step is taken.
    pub steps: usize,
    pub corrected: usize,
    pub planned: usize,
    pub early_stopped: bool,
    pub fallback: bool,
    pub ratio_means: Vec<f64>,
    pub applied: Vec<Vec<f64>>,
}

impl InnerLoopOutcome {
    pub fn mean_applied(&self) -> f64 {
        let (sum, n) = self
            .applied
            .iter()
            .flatten()
            .fold((0.0, 0usize), |(s, n), g| (s + g, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }
}

pub struct VarianceReducedUpdater {
    config: InnerLoopConfig,
}

impl VarianceReducedUpdater {
    pub fn new(config: InnerLoopConfig) -> Result<Self> {
        if config.mini_batch == 0 {
            return Err(FedError::config("mini_batch", "must be positive"));
        }
        if !(config.ratio_low <= 1.0 && 1.0 <= config.ratio_high) {
            return Err(FedError::config("ratio band", "must contain 1"));
        }
        Ok(VarianceReducedUpdater { config })
    }

    pub fn plan(&self, outer_batch: usize, rng: &mut Rng) -> usize {
        match self.config.budget {
            InnerBudget::Fixed(n) => n,
            InnerBudget::Geometric => {
                let b = self.config.mini_batch as f64;
                rng.next_geometric(b / (outer_batch as f64 + b)) + 1
            }
        }
    }

    /// Runs the inner loop, stepping `optimizer` (which owns `master`'s
    /// parameters). `old_policy` holds the round's starting parameters and is
    /// never stepped.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        master: &dyn Policy,
        old_policy: &dyn Policy,
        optimizer: &mut Adam,
        control_variate: Option<&ParamVec>,
        outer_batch: usize,
        sampler: &mut dyn TrajectorySource,
        rng: &mut Rng,
    ) -> Result<InnerLoopOutcome> {
        if outer_batch == 0 {
            return Err(FedError::InvalidBatchSize);
        }
        let b = self.config.mini_batch;
        let mut outcome = InnerLoopOutcome {
            planned: self.plan(outer_batch, rng),
            ..Default::default()
        };

        let mu = match control_variate {
            Some(mu) => mu,
            None => {
                // Nothing trusted this round: one plain step on fresh data.
                let batch = sampler.sample(master, b, rng)?;
                optimizer.zero_grad();
                surrogate_loss(master, &batch)?.backward();
                outcome.applied.push(master.gradients().flatten());
                optimizer.step();
                outcome.steps = 1;
                outcome.fallback = true;
                return Ok(outcome);
            }
        };

        for n in 0..outcome.planned {
            let batch = sampler.sample(master, b, rng)?;
            let weights = batch.weights_tensor();

            optimizer.zero_grad();
            let new_logp = master.log_prob(&batch.observations, &batch.actions);
            (-((&new_logp * &weights).mean())).backward();
            let grad_new = master.gradients();

            let old_logp = old_policy.log_prob(&batch.observations, &batch.actions);
            let ratio = (old_logp.detach() - new_logp.detach()).exp();
            let ratio_values = ratio.values();
            let ratio_mean = ratio_values.iter().sum::<f64>() / ratio_values.len().max(1) as f64;
            outcome.ratio_means.push(ratio_mean);

            if !ratio_mean.is_finite()
                || ratio_mean.abs() < self.config.ratio_low
                || ratio_mean.abs() > self.config.ratio_high
            {
                debug!(
                    "[Master] importance ratio {:.5} left [{}, {}] at iteration {}/{}",
                    ratio_mean, self.config.ratio_low, self.config.ratio_high, n, outcome.planned
                );
                outcome.early_stopped = true;
                if n == 0 {
                    // grad_new is still on the parameters.
                    outcome.applied.push(grad_new.flatten());
                    optimizer.step();
                    outcome.fallback = true;
                }
                break;
            }

            old_policy.zero_grad();
            let ratio = Tensor::new(ratio_values, ratio.shape.clone());
            (-((old_logp * weights * ratio).mean())).backward();
            let grad_old = old_policy.gradients();

            let mut direction = grad_new;
            direction.add_scaled(&grad_old, -1.0)?;
            direction.add_scaled(mu, 1.0)?;
            master.set_gradients(&direction)?;
            optimizer.step();

            outcome.applied.push(direction.flatten());
            outcome.steps += 1;
            outcome.corrected += 1;
        }

        Ok(outcome)
    }

    pub fn apply_plain(master: &dyn Policy, optimizer: &mut Adam, mu: &ParamVec) -> Result<Vec<f64>> {
        master.set_gradients(mu)?;
        optimizer.step();
        Ok(mu.flatten())
    }
}
