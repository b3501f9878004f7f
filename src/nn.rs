use crate::autograd::Tensor;
use crate::simd::add_scaled_row;
use serde::{Deserialize, Serialize};

pub trait Module {
    fn forward(&self, input: &Tensor) -> Tensor;
    fn parameters(&self) -> Vec<Tensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
        }
    }

    pub fn apply_inplace(&self, xs: &mut [f64]) {
        match self {
            Activation::Relu => xs.iter_mut().for_each(|x| *x = x.max(0.0)),
            Activation::Tanh => xs.iter_mut().for_each(|x| *x = x.tanh()),
        }
    }
}

/// Dense layer, `y = x W + b` with `W: [in, out]`.
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, seed: u64) -> Self {
        // Xavier initialization
        let limit = (6.0 / (in_features + out_features) as f64).sqrt();
        Linear {
            weight: Tensor::rand(vec![in_features, out_features], -limit, limit, seed),
            bias: Tensor::zeros(vec![out_features]),
            in_features,
            out_features,
        }
    }

    pub fn replicate(&self) -> Self {
        Linear {
            weight: self.weight.deep_clone(),
            bias: self.bias.deep_clone(),
            in_features: self.in_features,
            out_features: self.out_features,
        }
    }

    /// Graph-free forward over a single row, for acting in the environment.
    pub fn forward_inference(&self, input: &[f64]) -> Vec<f64> {
        let w = self.weight.data.read().unwrap();
        let mut out = self.bias.values();
        for (i, &x) in input.iter().enumerate().take(self.in_features) {
            if x == 0.0 {
                continue;
            }
            add_scaled_row(&mut out, &w[i * self.out_features..(i + 1) * self.out_features], x);
        }
        out
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let x = if input.shape.len() == 1 {
            input.reshape(vec![1, input.shape[0]])
        } else {
            input.clone()
        };
        let rows = x.shape[0];
        x.matmul(&self.weight) + self.bias.broadcast_rows(rows)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}
