//! Bayesian optimization over a bounded integer domain.
//!
//! A Gaussian-process surrogate with an RBF kernel is fit to the evaluations so
//! far, and the next point maximizes expected improvement on a grid over the
//! domain. Objectives are minimized.
//!
//! # Algorithm
//!
//! 1. Evaluate `initial_points` stratified random points
//! 2. Fit the GP to standardized, negated objective values
//! 3. Propose the EI maximizer, rounded and clamped into the domain
//! 4. Stop after `max_iter` proposals or when a proposal was already evaluated

use std::ops::RangeInclusive;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use syntof_core::{Result, SyntofError, EPSILON};

/// Grid resolution for EI maximization.
const GRID_SIZE: usize = 100;

/// Minimum predictive standard deviation for a non-zero EI.
const MIN_SIGMA: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BayesOptConfig {
    pub initial_points: usize,
    pub max_iter: usize,
    pub seed: u64,
    /// RBF length scale on the domain rescaled to `[0, 1]`.
    pub length_scale: f64,
    pub noise_var: f64,
}

impl Default for BayesOptConfig {
    fn default() -> Self {
        Self {
            initial_points: 3,
            max_iter: 50,
            seed: 12121,
            length_scale: 0.2,
            noise_var: 0.01,
        }
    }
}

impl BayesOptConfig {
    pub const fn with_initial_points(mut self, initial_points: usize) -> Self {
        self.initial_points = initial_points;
        self
    }

    pub const fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Best point found and the evaluation trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    pub x: usize,
    pub value: f64,
    /// `(x, value)` in evaluation order.
    pub evaluations: Vec<(usize, f64)>,
}

#[derive(Debug, Clone)]
pub struct DiscreteBayesOpt {
    lower: usize,
    upper: usize,
    config: BayesOptConfig,
    observations: Vec<(usize, f64)>,
}

impl DiscreteBayesOpt {
    pub fn new(domain: RangeInclusive<usize>, config: BayesOptConfig) -> Result<Self> {
        let (lower, upper) = domain.into_inner();
        if lower > upper {
            return Err(SyntofError::config(format!("empty search domain {lower}..={upper}")));
        }
        if config.length_scale <= 0.0 || config.noise_var < 0.0 {
            return Err(SyntofError::config("GP length scale must be positive and noise non-negative"));
        }
        Ok(Self {
            lower,
            upper,
            config,
            observations: Vec::new(),
        })
    }

    /// Nearest domain value; out-of-domain values are clamped with a warning.
    pub fn clamp(&self, x: f64) -> usize {
        let rounded = x.round();
        if rounded < self.lower as f64 || rounded > self.upper as f64 || !rounded.is_finite() {
            tracing::warn!(value = x, lower = self.lower, upper = self.upper, "clamping proposal into domain");
        }
        if !rounded.is_finite() || rounded <= self.lower as f64 {
            self.lower
        } else if rounded >= self.upper as f64 {
            self.upper
        } else {
            rounded as usize
        }
    }

    pub fn observations(&self) -> &[(usize, f64)] {
        &self.observations
    }

    /// Minimize `objective` over the domain.
    pub fn minimize<F>(&mut self, mut objective: F) -> Result<Optimum>
    where
        F: FnMut(usize) -> Result<f64>,
    {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        for x in self.initial_design(&mut rng) {
            self.evaluate(x, &mut objective)?;
        }

        for iteration in 0..self.config.max_iter {
            if self.lower == self.upper {
                break;
            }
            let proposal = self.clamp(self.maximize_ei());
            if self.observations.iter().any(|&(x, _)| x == proposal) {
                tracing::debug!(iteration, proposal, "proposal already evaluated, stopping");
                break;
            }
            self.evaluate(proposal, &mut objective)?;
        }

        let &(x, value) = self
            .observations
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| SyntofError::config("optimizer made no evaluations"))?;
        Ok(Optimum {
            x,
            value,
            evaluations: self.observations.clone(),
        })
    }

    fn evaluate<F>(&mut self, x: usize, objective: &mut F) -> Result<()>
    where
        F: FnMut(usize) -> Result<f64>,
    {
        let value = objective(x)?;
        if !value.is_finite() {
            return Err(SyntofError::NonFinite(format!("objective at {x}")));
        }
        self.observations.push((x, value));
        Ok(())
    }

    /// One uniform draw from each of `initial_points` equal strata of the domain.
    fn initial_design(&self, rng: &mut ChaCha8Rng) -> Vec<usize> {
        let n = self.config.initial_points.max(1);
        let span = (self.upper - self.lower + 1) as f64;
        (0..n)
            .map(|i| {
                let u = (i as f64 + rng.gen::<f64>()) / n as f64;
                self.clamp(self.lower as f64 + (u * span).floor())
            })
            .collect()
    }

    fn unit(&self, x: f64) -> f64 {
        if self.upper == self.lower {
            0.0
        } else {
            (x - self.lower as f64) / (self.upper - self.lower) as f64
        }
    }

    fn maximize_ei(&self) -> f64 {
        let gp = GaussianProcess::fit(
            self.observations.iter().map(|&(x, _)| self.unit(x as f64)).collect(),
            self.observations.iter().map(|&(_, y)| y).collect(),
            self.config.length_scale,
            self.config.noise_var,
        );

        let span = (self.upper - self.lower) as f64;
        let mut best = (self.lower as f64, f64::NEG_INFINITY);
        for i in 0..=GRID_SIZE {
            let x = self.lower as f64 + span * i as f64 / GRID_SIZE as f64;
            let ei = gp.expected_improvement(self.unit(x));
            if ei > best.1 {
                best = (x, ei);
            }
        }
        best.0
    }
}

/// GP regression on negated, standardized targets, so improvement is an increase.
struct GaussianProcess {
    x: Vec<f64>,
    alpha: DVector<f64>,
    chol: Option<nalgebra::Cholesky<f64, nalgebra::Dyn>>,
    length_scale: f64,
    best: f64,
}

impl GaussianProcess {
    fn fit(x: Vec<f64>, y: Vec<f64>, length_scale: f64, noise_var: f64) -> Self {
        let n = y.len();
        let mean = y.iter().sum::<f64>() / n as f64;
        let std = (y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64)
            .sqrt()
            .max(EPSILON);
        let targets = DVector::from_iterator(n, y.iter().map(|v| -(v - mean) / std));

        let kernel = DMatrix::from_fn(n, n, |i, j| {
            rbf(x[i], x[j], length_scale) + if i == j { noise_var + EPSILON } else { 0.0 }
        });
        let chol = kernel.cholesky();
        let alpha = chol
            .as_ref()
            .map(|c| c.solve(&targets))
            .unwrap_or_else(|| DVector::zeros(n));
        let best = targets.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Self {
            x,
            alpha,
            chol,
            length_scale,
            best,
        }
    }

    fn predict(&self, x: f64) -> (f64, f64) {
        let k_star = DVector::from_iterator(self.x.len(), self.x.iter().map(|&xi| rbf(x, xi, self.length_scale)));
        let mean = k_star.dot(&self.alpha);
        let reduction = self.chol.as_ref().map_or(0.0, |c| k_star.dot(&c.solve(&k_star)));
        (mean, (1.0 - reduction).max(0.0))
    }

    /// `EI(x) = (mu - f_best) Phi(z) + sigma phi(z)`, `z = (mu - f_best) / sigma`
    fn expected_improvement(&self, x: f64) -> f64 {
        let (mean, variance) = self.predict(x);
        let sigma = variance.sqrt();
        if sigma < MIN_SIGMA {
            return 0.0;
        }
        let z = (mean - self.best) / sigma;
        ((mean - self.best) * standard_normal_cdf(z) + sigma * standard_normal_pdf(z)).max(0.0)
    }
}

fn rbf(a: f64, b: f64, length_scale: f64) -> f64 {
    let d = a - b;
    (-0.5 * d * d / (length_scale * length_scale)).exp()
}

fn standard_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn standard_normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Abramowitz and Stegun 7.1.26.
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254_829_592;
    const A2: f64 = -0.284_496_736;
    const A3: f64 = 1.421_413_741;
    const A4: f64 = -1.453_152_027;
    const A5: f64 = 1.061_405_429;
    const P: f64 = 0.327_591_1;

    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}
