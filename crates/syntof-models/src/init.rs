//! Seeded weight initializers.
//!
//! Weights are drawn on the host from a [`ChaCha8Rng`] so that identical seeds
//! give bit-identical tensors on every backend.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

/// Standard deviation of a unit normal truncated to [-2, 2].
const TRUNCATED_NORMAL_STD: f64 = 0.879_625_661_034_239_8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightInit {
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`
    #[default]
    GlorotUniform,
    /// Truncated normal, variance `2 / (fan_in + fan_out)`
    GlorotNormal,
    /// Truncated normal, variance `2 / fan_in`
    HeNormal,
    /// Truncated normal, variance `1 / fan_in`; pairs with SELU
    LecunNormal,
}

impl WeightInit {
    /// Draw a `[fan_in, fan_out]` kernel, row-major.
    pub fn sample(self, fan_in: usize, fan_out: usize, rng: &mut ChaCha8Rng) -> Vec<f32> {
        let n = fan_in * fan_out;
        let fan_in_f = fan_in.max(1) as f64;
        let fan_avg = ((fan_in + fan_out) as f64 / 2.0).max(1.0);
        match self {
            WeightInit::GlorotUniform => {
                let limit = (3.0 / fan_avg).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit);
                (0..n).map(|_| dist.sample(rng) as f32).collect()
            }
            WeightInit::GlorotNormal => truncated_normal(n, (1.0 / fan_avg).sqrt(), rng),
            WeightInit::HeNormal => truncated_normal(n, (2.0 / fan_in_f).sqrt(), rng),
            WeightInit::LecunNormal => truncated_normal(n, (1.0 / fan_in_f).sqrt(), rng),
        }
    }
}

/// Normal samples with standard deviation `std`, redrawn outside two deviations.
fn truncated_normal(n: usize, std: f64, rng: &mut ChaCha8Rng) -> Vec<f32> {
    let scale = std / TRUNCATED_NORMAL_STD;
    (0..n)
        .map(|_| loop {
            let z: f64 = rng.sample(StandardNormal);
            if z.abs() <= 2.0 {
                break (z * scale) as f32;
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_glorot_uniform_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = WeightInit::GlorotUniform.sample(10, 6, &mut rng);
        let limit = (6.0f64 / 16.0).sqrt() as f32;
        assert_eq!(w.len(), 60);
        assert!(w.iter().all(|v| v.abs() <= limit + 1e-6));
    }

    #[test]
    fn test_truncated_normal_bounds_and_spread() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let w = WeightInit::HeNormal.sample(200, 100, &mut rng);
        let std = (2.0f64 / 200.0).sqrt();
        let bound = (2.0 * std / TRUNCATED_NORMAL_STD) as f32;
        assert!(w.iter().all(|v| v.abs() <= bound + 1e-6));

        let mean = w.iter().map(|&v| v as f64).sum::<f64>() / w.len() as f64;
        let var = w.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / w.len() as f64;
        assert!((var.sqrt() - std).abs() / std < 0.05, "std {} vs {}", var.sqrt(), std);
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = WeightInit::LecunNormal.sample(8, 4, &mut ChaCha8Rng::seed_from_u64(42));
        let b = WeightInit::LecunNormal.sample(8, 4, &mut ChaCha8Rng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
