use crate::error::{FedError, Result};
use crate::params::ParamVec;
use crate::rng::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackKind {
    None,
    RandomNoise,
    SignFlipping,
    ZeroGradient,
    RandomAction,
    RewardFlipping,
    /// Honest in the worker; the server-side simulator rewrites the
    /// Byzantine gradients before aggregation.
    #[serde(alias = "FedScsPG-attack")]
    VarianceAttack,
}

impl AttackKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "none" | "" => Ok(AttackKind::None),
            "random-noise" => Ok(AttackKind::RandomNoise),
            "sign-flipping" => Ok(AttackKind::SignFlipping),
            "zero-gradient" => Ok(AttackKind::ZeroGradient),
            "random-action" => Ok(AttackKind::RandomAction),
            "reward-flipping" => Ok(AttackKind::RewardFlipping),
            "variance-attack" | "FedScsPG-attack" => Ok(AttackKind::VarianceAttack),
            other => Err(FedError::Unknown {
                kind: "attack",
                name: other.to_string(),
            }),
        }
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self, AttackKind::VarianceAttack)
    }

    pub fn corrupt_gradient(&self, grad: &mut ParamVec, scale: f64, rng: &mut Rng) {
        match self {
            AttackKind::RandomNoise => {
                for i in 0..grad.num_tensors() {
                    for g in grad.tensor_mut(i).iter_mut() {
                        *g = rng.next_f64_normal() * scale;
                    }
                }
            }
            AttackKind::SignFlipping => grad.scale(-scale),
            AttackKind::ZeroGradient => grad.scale(0.0),
            _ => {}
        }
    }
}

pub trait AttackSimulator {
    /// Returns a new list; `gradients` itself stays as collected.
    fn craft(&self, gradients: &[ParamVec], byzantine: &[usize], rng: &mut Rng) -> Vec<ParamVec>;
}

/// Places every Byzantine gradient at the Byzantine mean plus `k` times their
/// spread along one random direction, tensor by tensor. The spread is the
/// largest pairwise distance among the Byzantine gradients, an estimate of
/// `2 sigma`, so the crafted point sits just outside the honest cloud.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceAttack {
    pub k: f64,
}

impl Default for VarianceAttack {
    fn default() -> Self {
        VarianceAttack { k: 1.5 }
    }
}

impl AttackSimulator for VarianceAttack {
    fn craft(&self, gradients: &[ParamVec], byzantine: &[usize], rng: &mut Rng) -> Vec<ParamVec> {
        let mut out = gradients.to_vec();
        let bad: Vec<usize> = byzantine.iter().copied().filter(|&i| i < gradients.len()).collect();
        if bad.is_empty() {
            return out;
        }

        for t in 0..gradients[bad[0]].num_tensors() {
            let rows: Vec<&[f64]> = bad.iter().map(|&i| gradients[i].tensors()[t].as_slice()).collect();
            let len = rows[0].len();

            let mut spread: f64 = 0.0;
            for a in 0..rows.len() {
                for b in (a + 1)..rows.len() {
                    let d = rows[a]
                        .iter()
                        .zip(rows[b].iter())
                        .map(|(x, y)| (x - y) * (x - y))
                        .sum::<f64>()
                        .sqrt();
                    spread = spread.max(d);
                }
            }

            let mut mean = vec![0.0; len];
            for row in &rows {
                for (m, v) in mean.iter_mut().zip(row.iter()) {
                    *m += v / rows.len() as f64;
                }
            }

            let dir = rng.unit_direction(len);
            let crafted: Vec<f64> = mean
                .iter()
                .zip(dir.iter())
                .map(|(m, d)| m + d * spread * self.k)
                .collect();
            for &i in &bad {
                out[i].tensor_mut(t).copy_from_slice(&crafted);
            }
        }
        out
    }
}
