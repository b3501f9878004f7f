use crate::autograd::Tensor;
use crate::env::Environment;
use crate::error::{FedError, Result};
use crate::policy::Policy;
use crate::rng::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutConfig {
    pub gamma: f64,
    pub max_episode_len: usize,
    pub sample: bool,
    pub random_action: bool,
    pub flip_reward: bool,
}

impl RolloutConfig {
    pub fn new(gamma: f64, max_episode_len: usize, sample: bool) -> Self {
        RolloutConfig {
            gamma,
            max_episode_len,
            sample,
            random_action: false,
            flip_reward: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrajectoryBatch {
    pub observations: Vec<Vec<f64>>,
    pub actions: Vec<usize>,
    /// Discounted reward-to-go per step.
    pub weights: Vec<f64>,
    pub log_probs: Vec<f64>,
    pub returns: Vec<f64>,
    pub lengths: Vec<usize>,
}

impl TrajectoryBatch {
    pub fn num_steps(&self) -> usize {
        self.actions.len()
    }

    pub fn num_episodes(&self) -> usize {
        self.returns.len()
    }

    pub fn mean_return(&self) -> f64 {
        mean(&self.returns)
    }

    pub fn mean_length(&self) -> f64 {
        mean(&self.lengths.iter().map(|&l| l as f64).collect::<Vec<_>>())
    }

    pub fn weights_tensor(&self) -> Tensor {
        Tensor::new(self.weights.clone(), vec![self.weights.len()])
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

pub fn collect_trajectories(
    policy: &dyn Policy,
    env: &mut dyn Environment,
    num_episodes: usize,
    config: &RolloutConfig,
    rng: &mut Rng,
) -> Result<TrajectoryBatch> {
    if num_episodes == 0 {
        return Err(FedError::EmptyBatch);
    }
    let num_actions = env.num_actions();
    let mut batch = TrajectoryBatch::default();

    for _ in 0..num_episodes {
        let mut obs = env.reset();
        let mut rewards = Vec::new();
        let mut episode_return = 0.0;

        for _ in 0..config.max_episode_len {
            let (action, logp) = if config.random_action {
                let a = rng.next_u64_bounded(num_actions as u64) as usize;
                (a, -(num_actions as f64).ln())
            } else {
                policy.sample_action(&obs, rng, config.sample)
            };
            let tr = env.step(action);
            episode_return += tr.reward;
            rewards.push(if config.flip_reward { -tr.reward } else { tr.reward });
            batch.observations.push(std::mem::replace(&mut obs, tr.observation));
            batch.actions.push(action);
            batch.log_probs.push(logp);
            if tr.done {
                break;
            }
        }

        let mut running = 0.0;
        let mut to_go = vec![0.0; rewards.len()];
        for (t, r) in rewards.iter().enumerate().rev() {
            running = r + config.gamma * running;
            to_go[t] = running;
        }
        batch.weights.extend(to_go);
        batch.returns.push(episode_return);
        batch.lengths.push(rewards.len());
    }

    Ok(batch)
}

/// REINFORCE surrogate `-mean(log_prob * weight)`; its gradient is the
/// policy-gradient estimate for the batch.
pub fn surrogate_loss(policy: &dyn Policy, batch: &TrajectoryBatch) -> Result<Tensor> {
    if batch.num_steps() == 0 {
        return Err(FedError::EmptyBatch);
    }
    let logp = policy.log_prob(&batch.observations, &batch.actions);
    Ok(-((logp * batch.weights_tensor()).mean()))
}

pub trait TrajectorySource {
    fn sample(&mut self, policy: &dyn Policy, num_episodes: usize, rng: &mut Rng) -> Result<TrajectoryBatch>;
}

pub struct EnvSampler {
    env: Box<dyn Environment>,
    config: RolloutConfig,
}

impl EnvSampler {
    pub fn new(env: Box<dyn Environment>, config: RolloutConfig) -> Self {
        EnvSampler { env, config }
    }
}

impl TrajectorySource for EnvSampler {
    fn sample(&mut self, policy: &dyn Policy, num_episodes: usize, rng: &mut Rng) -> Result<TrajectoryBatch> {
        self.env.seed(rng.next_range(1, 99_999) as u64);
        collect_trajectories(policy, self.env.as_mut(), num_episodes, &self.config, rng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub mean_return: f64,
    pub mean_length: f64,
}

pub fn evaluate(
    policy: &dyn Policy,
    env: &mut dyn Environment,
    episodes: usize,
    max_steps: usize,
    rng: &mut Rng,
) -> Result<Evaluation> {
    let config = RolloutConfig::new(1.0, max_steps, false);
    let batch = collect_trajectories(policy, env, episodes, &config, rng)?;
    Ok(Evaluation {
        mean_return: batch.mean_return(),
        mean_length: batch.mean_length(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::CartPole;
    use crate::nn::Activation;
    use crate::policy::CategoricalMlp;

    fn setup() -> (CategoricalMlp, CartPole, Rng) {
        let policy = CategoricalMlp::new(4, &[8], 2, Activation::Relu, 5).unwrap();
        let mut env = CartPole::new();
        env.seed(21);
        (policy, env, Rng::from_seed(9))
    }

    #[test]
    fn weights_are_discounted_reward_to_go() {
        let (policy, mut env, mut rng) = setup();
        let config = RolloutConfig::new(0.9, 200, true);
        let batch = collect_trajectories(&policy, &mut env, 1, &config, &mut rng).unwrap();
        let n = batch.lengths[0];
        assert_eq!(batch.num_steps(), n);
        // Last step of the episode keeps only its own reward.
        assert!((batch.weights[n - 1] - 1.0).abs() < 1e-12);
        if n > 1 {
            assert!((batch.weights[n - 2] - 1.9).abs() < 1e-12);
        }
        assert!((batch.returns[0] - n as f64).abs() < 1e-12);
    }

    #[test]
    fn episode_length_is_capped() {
        let (policy, mut env, mut rng) = setup();
        let config = RolloutConfig::new(0.99, 5, true);
        let batch = collect_trajectories(&policy, &mut env, 3, &config, &mut rng).unwrap();
        assert!(batch.lengths.iter().all(|&l| l <= 5));
        assert_eq!(batch.num_episodes(), 3);
    }

    #[test]
    fn flipped_rewards_give_negative_weights() {
        let (policy, mut env, mut rng) = setup();
        let mut config = RolloutConfig::new(0.99, 50, true);
        config.flip_reward = true;
        let batch = collect_trajectories(&policy, &mut env, 2, &config, &mut rng).unwrap();
        assert!(batch.weights.iter().all(|&w| w < 0.0));
        // Logged returns are the environment's, not the flipped ones.
        assert!(batch.returns.iter().all(|&r| r > 0.0));
    }

    #[test]
    fn zero_episodes_is_an_error() {
        let (policy, mut env, mut rng) = setup();
        let config = RolloutConfig::new(0.99, 50, true);
        assert!(matches!(
            collect_trajectories(&policy, &mut env, 0, &config, &mut rng),
            Err(FedError::EmptyBatch)
        ));
    }

    #[test]
    fn surrogate_loss_produces_gradients() {
        let (policy, mut env, mut rng) = setup();
        let config = RolloutConfig::new(0.99, 50, true);
        let batch = collect_trajectories(&policy, &mut env, 2, &config, &mut rng).unwrap();
        let loss = surrogate_loss(&policy, &batch).unwrap();
        loss.backward();
        assert!(policy.gradients().norm() > 0.0);
    }
}
