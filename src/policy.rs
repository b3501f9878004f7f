use crate::autograd::Tensor;
use crate::error::{FedError, Result};
use crate::nn::{Activation, Linear, Module};
use crate::params::ParamVec;
use crate::rng::Rng;

/// A differentiable stochastic policy over discrete actions.
pub trait Policy: Send {
    fn parameters(&self) -> Vec<Tensor>;

    /// Log-probabilities of `actions[t]` under `observations[t]`, shape `[T]`,
    /// attached to the graph.
    fn log_prob(&self, observations: &[Vec<f64>], actions: &[usize]) -> Tensor;

    /// Graph-free action selection. Greedy (argmax) when `sample` is false.
    fn sample_action(&self, observation: &[f64], rng: &mut Rng, sample: bool) -> (usize, f64);

    fn replicate(&self) -> Self
    where
        Self: Sized;

    fn get_parameters(&self) -> ParamVec {
        ParamVec::from_tensors(&self.parameters())
    }

    fn load_parameters(&self, params: &ParamVec) -> Result<()> {
        let tensors = self.parameters();
        ParamVec::from_tensors(&tensors).check_compatible(params)?;
        for (t, values) in tensors.iter().zip(params.tensors()) {
            t.data.write().unwrap().copy_from_slice(values);
        }
        Ok(())
    }

    fn zero_grad(&self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    fn gradients(&self) -> ParamVec {
        ParamVec::from_grads(&self.parameters())
    }

    fn set_gradients(&self, grads: &ParamVec) -> Result<()> {
        let tensors = self.parameters();
        ParamVec::from_tensors(&tensors).check_compatible(grads)?;
        for (t, values) in tensors.iter().zip(grads.tensors()) {
            t.grad.write().unwrap().copy_from_slice(values);
        }
        Ok(())
    }
}

pub struct CategoricalMlp {
    layers: Vec<Linear>,
    activation: Activation,
}

impl CategoricalMlp {
    pub fn new(
        obs_dim: usize,
        hidden_units: &[usize],
        num_actions: usize,
        activation: Activation,
        seed: u64,
    ) -> Result<Self> {
        if obs_dim == 0 || num_actions == 0 {
            return Err(FedError::config("hidden_units", "policy needs non-empty input and output"));
        }
        if hidden_units.iter().any(|&h| h == 0) {
            return Err(FedError::config("hidden_units", "hidden layer width must be positive"));
        }
        let mut sizes = Vec::with_capacity(hidden_units.len() + 2);
        sizes.push(obs_dim);
        sizes.extend_from_slice(hidden_units);
        sizes.push(num_actions);
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, w)| Linear::new(w[0], w[1], seed.wrapping_add(i as u64)))
            .collect();
        Ok(CategoricalMlp { layers, activation })
    }

    fn obs_dim(&self) -> usize {
        self.layers[0].in_features
    }

    fn logits(&self, x: &Tensor) -> Tensor {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h);
            if i < last {
                h = self.activation.apply(&h);
            }
        }
        h
    }

    fn probabilities(&self, observation: &[f64]) -> Vec<f64> {
        let last = self.layers.len() - 1;
        let mut h = observation.to_vec();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward_inference(&h);
            if i < last {
                self.activation.apply_inplace(&mut h);
            }
        }
        let max = h.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0;
        for v in h.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in h.iter_mut() {
            *v /= sum;
        }
        h
    }
}

impl Policy for CategoricalMlp {
    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn log_prob(&self, observations: &[Vec<f64>], actions: &[usize]) -> Tensor {
        let dim = self.obs_dim();
        let mut flat = Vec::with_capacity(observations.len() * dim);
        for obs in observations {
            flat.extend_from_slice(obs);
        }
        let x = Tensor::new(flat, vec![observations.len(), dim]);
        self.logits(&x).log_softmax().select_rows(actions)
    }

    fn sample_action(&self, observation: &[f64], rng: &mut Rng, sample: bool) -> (usize, f64) {
        let probs = self.probabilities(observation);
        let action = if sample {
            let u = rng.next_f64();
            let mut acc = 0.0;
            let mut chosen = probs.len() - 1;
            for (a, &p) in probs.iter().enumerate() {
                acc += p;
                if u < acc {
                    chosen = a;
                    break;
                }
            }
            chosen
        } else {
            probs
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (a, &p)| if p > best.1 { (a, p) } else { best })
                .0
        };
        (action, probs[action].max(f64::MIN_POSITIVE).ln())
    }

    fn replicate(&self) -> Self {
        CategoricalMlp {
            layers: self.layers.iter().map(|l| l.replicate()).collect(),
            activation: self.activation,
        }
    }
}
