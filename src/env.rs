use crate::error::{FedError, Result};
use crate::rng::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Vec<f64>,
    pub reward: f64,
    pub done: bool,
}

pub trait Environment: Send {
    fn seed(&mut self, seed: u64);
    fn reset(&mut self) -> Vec<f64>;
    fn step(&mut self, action: usize) -> Transition;
    fn observation_dim(&self) -> usize;
    fn num_actions(&self) -> usize;
}

pub fn make_env(name: &str) -> Result<Box<dyn Environment>> {
    match name {
        "CartPole-v1" | "cartpole" => Ok(Box::new(CartPole::new())),
        other => Err(FedError::Unknown {
            kind: "environment",
            name: other.to_string(),
        }),
    }
}

// --- CartPole ---

const GRAVITY: f64 = 9.8;
const CART_MASS: f64 = 1.0;
const POLE_MASS: f64 = 0.1;
const POLE_LENGTH: f64 = 0.5; // half length
const FORCE_MAG: f64 = 10.0;
const DT: f64 = 0.02;
const X_THRESHOLD: f64 = 2.4;
const THETA_THRESHOLD: f64 = 12.0 * std::f64::consts::PI / 180.0;
const INIT_RANGE: f64 = 0.05;

/// Pole balancing on a cart. Reward 1 per step; the episode ends when the
/// pole leans past 12 degrees or the cart leaves the track.
#[derive(Debug, Clone)]
pub struct CartPole {
    state: [f64; 4],
    rng: Rng,
    done: bool,
}

impl CartPole {
    pub fn new() -> Self {
        CartPole {
            state: [0.0; 4],
            rng: Rng::from_seed(0),
            done: true,
        }
    }
}

impl Default for CartPole {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for CartPole {
    fn seed(&mut self, seed: u64) {
        self.rng = Rng::from_seed(seed);
    }

    fn reset(&mut self) -> Vec<f64> {
        for s in self.state.iter_mut() {
            *s = -INIT_RANGE + 2.0 * INIT_RANGE * self.rng.next_f64();
        }
        self.done = false;
        self.state.to_vec()
    }

    fn step(&mut self, action: usize) -> Transition {
        if self.done {
            return Transition {
                observation: self.state.to_vec(),
                reward: 0.0,
                done: true,
            };
        }
        let [x, x_dot, theta, theta_dot] = self.state;
        let force = if action == 1 { FORCE_MAG } else { -FORCE_MAG };
        let total_mass = CART_MASS + POLE_MASS;
        let pole_mass_length = POLE_MASS * POLE_LENGTH;
        let (sin_theta, cos_theta) = theta.sin_cos();

        let temp = (force + pole_mass_length * theta_dot * theta_dot * sin_theta) / total_mass;
        let theta_acc = (GRAVITY * sin_theta - cos_theta * temp)
            / (POLE_LENGTH * (4.0 / 3.0 - POLE_MASS * cos_theta * cos_theta / total_mass));
        let x_acc = temp - pole_mass_length * theta_acc * cos_theta / total_mass;

        // Explicit Euler
        self.state = [
            x + DT * x_dot,
            x_dot + DT * x_acc,
            theta + DT * theta_dot,
            theta_dot + DT * theta_acc,
        ];
        self.done = self.state[0].abs() > X_THRESHOLD || self.state[2].abs() > THETA_THRESHOLD;

        Transition {
            observation: self.state.to_vec(),
            reward: 1.0,
            done: self.done,
        }
    }

    fn observation_dim(&self) -> usize {
        4
    }

    fn num_actions(&self) -> usize {
        2
    }
}
