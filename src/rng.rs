use rand_core::{Error, RngCore};
use serde::{Deserialize, Serialize};

// --- Pseudo-Random Number Generator (Hand-rolled) ---
// Algorithm: xoshiro256** (StarStar)
// Reference: https://prng.di.unimi.it/
// The whole state is four words, so it is serialised into checkpoints and a
// resumed run continues the exact same stream.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rng {
    state: [u64; 4],
}

impl Rng {
    pub fn from_seed(mut seed: u64) -> Self {
        // SplitMix64 expands one 64-bit seed into the four xoshiro words.
        let sm64 = |s: &mut u64| -> u64 {
            *s = s.wrapping_add(0x9e3779b97f4a7c15);
            let mut z = *s;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
            z ^ (z >> 31)
        };

        Rng {
            state: [
                sm64(&mut seed),
                sm64(&mut seed),
                sm64(&mut seed),
                sm64(&mut seed),
            ],
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let result = self.state[1].wrapping_mul(5).rotate_left(7).wrapping_mul(9);

        let t = self.state[1] << 17;

        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];

        self.state[2] ^= t;

        self.state[3] = self.state[3].rotate_left(45);

        result
    }

    // Uniform in [0.0, 1.0): (u64 >> 11) * 2^-53
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        let v = self.next_u64() >> 11;
        (v as f64) * (1.0 / 9007199254740992.0)
    }

    // Box-Muller, returns one standard normal sample.
    #[inline]
    pub fn next_f64_normal(&mut self) -> f64 {
        let u1 = loop {
            let u = self.next_f64();
            if u > 0.0 {
                break u;
            }
        };
        let u2 = self.next_f64();

        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;

        r * theta.cos()
    }

    // Rejection sampling in [0, range), no modulo bias.
    pub fn next_u64_bounded(&mut self, range: u64) -> u64 {
        let threshold = (0u64.wrapping_sub(range)) % range;
        loop {
            let x = self.next_u64();
            if x >= threshold {
                return x % range;
            }
        }
    }

    /// Uniform integer in the closed interval `[low, high]`.
    pub fn next_range(&mut self, low: usize, high: usize) -> usize {
        debug_assert!(low <= high);
        low + self.next_u64_bounded((high - low) as u64 + 1) as usize
    }

    /// Number of failures before the first success of a Bernoulli(`p`)
    /// sequence. Support `{0, 1, 2, ...}`, mean `(1 - p) / p`.
    pub fn next_geometric(&mut self, p: f64) -> usize {
        if p >= 1.0 {
            return 0;
        }
        // Inverse CDF: floor(ln U / ln(1 - p)) with U in (0, 1].
        let u = 1.0 - self.next_f64();
        (u.ln() / (1.0 - p).ln()).floor() as usize
    }

    /// Random direction on the unit sphere of the max-norm cube: each
    /// component uniform in [-1, 1), then L2-normalised.
    pub fn unit_direction(&mut self, dim: usize) -> Vec<f64> {
        let mut v: Vec<f64> = (0..dim).map(|_| self.next_f64() * 2.0 - 1.0).collect();
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        Rng::next_u64(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        let mut i = 0;
        while i < dest.len() {
            let bytes = Rng::next_u64(self).to_le_bytes();
            let n = std::cmp::min(dest.len() - i, 8);
            dest[i..i + n].copy_from_slice(&bytes[..n]);
            i += n;
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
