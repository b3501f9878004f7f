use crate::autograd::Tensor;
use crate::error::{FedError, Result};
use serde::{Deserialize, Serialize};

// --- Optimizer (Adam) ---

/// Moments and step count, everything needed to resume bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub m: Vec<Vec<f64>>,
    pub v: Vec<Vec<f64>>,
    pub t: usize,
    pub lr: f64,
}

pub struct Adam {
    params: Vec<Tensor>,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    t: usize,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
}

impl Adam {
    pub fn new(params: Vec<Tensor>, lr: f64) -> Self {
        let m = params.iter().map(|p| vec![0.0; p.len()]).collect();
        let v = params.iter().map(|p| vec![0.0; p.len()]).collect();
        Adam {
            params,
            m,
            v,
            t: 0,
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn steps_taken(&self) -> usize {
        self.t
    }

    /// Descends along the gradients currently stored on the parameters.
    pub fn step(&mut self) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);
        for (i, param) in self.params.iter().enumerate() {
            let grad = param.grad.read().unwrap();
            let mut data = param.data.write().unwrap();
            for j in 0..data.len() {
                let g = grad[j];
                self.m[i][j] = self.beta1 * self.m[i][j] + (1.0 - self.beta1) * g;
                self.v[i][j] = self.beta2 * self.v[i][j] + (1.0 - self.beta2) * g * g;
                let m_hat = self.m[i][j] / bc1;
                let v_hat = self.v[i][j] / bc2;
                data[j] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    pub fn zero_grad(&self) {
        for p in &self.params {
            p.zero_grad();
        }
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            m: self.m.clone(),
            v: self.v.clone(),
            t: self.t,
            lr: self.lr,
        }
    }

    pub fn load_state(&mut self, state: AdamState) -> Result<()> {
        if state.m.len() != self.params.len() || state.v.len() != self.params.len() {
            return Err(FedError::TensorCountMismatch {
                expected: self.params.len(),
                actual: state.m.len(),
            });
        }
        for (index, ((p, m), v)) in self.params.iter().zip(&state.m).zip(&state.v).enumerate() {
            if m.len() != p.len() || v.len() != p.len() {
                return Err(FedError::StructuralMismatch {
                    index,
                    expected: p.shape.clone(),
                    actual: vec![m.len()],
                });
            }
        }
        self.m = state.m;
        self.v = state.v;
        self.t = state.t;
        self.lr = state.lr;
        Ok(())
    }
}
