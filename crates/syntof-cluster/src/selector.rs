//! Cluster-count selection from the elbow of the distortion curve.
//!
//! For every candidate `K` in `k_min..=max_k` an exact k-means fit gives the
//! distortion, the mean Euclidean distance from a point to its nearest
//! centroid. A continuous piecewise-linear model is fit to `(K, distortion)`
//! with a segment count chosen by Bayesian optimization over
//! `min_segments..=max_segments`, minimizing
//!
//! ```text
//! SSR(segments) + penalty * mean(distortion) * segments
//! ```
//!
//! The selected order is `ceil(breaks[segments - 1])`, the last interior
//! breakpoint (the scan minimum for a single segment).

use std::path::Path;

use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use syntof_core::{ensure_finite, RngKey, Result, SyntofError};

use crate::bayes_opt::{BayesOptConfig, DiscreteBayesOpt};
use crate::kmeans::{self, KMeansConfig};
use crate::piecewise::{PiecewiseLinearFit, PiecewiseModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSelectionConfig {
    pub k_min: usize,
    pub max_k: usize,
    /// Fraction of rows drawn with replacement before resampling; 1 keeps all.
    pub subsampling_frac: f64,
    /// Fixed-size resample with replacement; 0 uses the rows as they are.
    pub resample_size: usize,
    /// Fit the elbow to the running minimum of the distortions instead of the raw curve.
    pub smooth_distortions: bool,
    /// Per-segment penalty relative to the mean distortion.
    pub penalty: f64,
    pub min_segments: usize,
    pub max_segments: usize,
    /// k-means restarts per candidate.
    pub n_init: usize,
    /// Seed of the subsampling draws and the per-candidate k-means keys.
    pub seed: u64,
    pub bayes: BayesOptConfig,
}

impl Default for OrderSelectionConfig {
    fn default() -> Self {
        Self {
            k_min: 5,
            max_k: 40,
            subsampling_frac: 0.1,
            resample_size: 100_000,
            smooth_distortions: false,
            penalty: 0.001,
            min_segments: 2,
            max_segments: 3,
            n_init: 20,
            seed: 1,
            bayes: BayesOptConfig::default(),
        }
    }
}

impl OrderSelectionConfig {
    pub const fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    pub const fn with_k_min(mut self, k_min: usize) -> Self {
        self.k_min = k_min;
        self
    }

    pub fn with_subsampling(mut self, frac: f64, resample_size: usize) -> Self {
        self.subsampling_frac = frac;
        self.resample_size = resample_size;
        self
    }

    pub const fn with_smoothing(mut self, smooth_distortions: bool) -> Self {
        self.smooth_distortions = smooth_distortions;
        self
    }

    pub const fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.k_min == 0 || self.k_min >= self.max_k {
            return Err(SyntofError::config(format!(
                "candidate range {}..={} needs 0 < k_min < max_k",
                self.k_min, self.max_k
            )));
        }
        if !(self.subsampling_frac > 0.0 && self.subsampling_frac <= 1.0) {
            return Err(SyntofError::config("subsampling fraction must be in (0, 1]"));
        }
        if self.min_segments == 0 || self.min_segments > self.max_segments {
            return Err(SyntofError::config("segment domain must be non-empty and positive"));
        }
        Ok(())
    }

    pub fn candidates(&self) -> Vec<usize> {
        (self.k_min..=self.max_k).collect()
    }
}

/// Outcome of one cluster-order selection.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderSelection {
    pub k: usize,
    pub candidates: Vec<usize>,
    /// The series the model is fit to: `raw_distortions`, or their running
    /// minimum when smoothing is enabled.
    pub distortions: Vec<f64>,
    pub raw_distortions: Vec<f64>,
    pub segments: usize,
    pub model: PiecewiseModel,
}

impl OrderSelection {
    pub fn breaks(&self) -> &[f64] {
        &self.model.breaks
    }

    /// Write the distortion curve and the fitted segments as a PNG.
    pub fn plot(&self, path: &Path) -> Result<()> {
        crate::plot::plot_distortion(self, path)
    }
}

/// Select the number of clusters for an embedding `[N, E]`.
pub fn select_cluster_count(embedding: ArrayView2<'_, f32>, config: &OrderSelectionConfig) -> Result<OrderSelection> {
    config.validate()?;
    ensure_finite(embedding.iter(), "embedding")?;
    if embedding.nrows() < config.max_k {
        return Err(SyntofError::config(format!(
            "{} rows cannot support {} clusters",
            embedding.nrows(),
            config.max_k
        )));
    }

    let sample = subsample(embedding, config);
    let candidates = config.candidates();
    let keys = RngKey::new(config.seed).split(candidates.len());

    let raw_distortions: Vec<f64> = candidates
        .par_iter()
        .zip(keys.into_par_iter())
        .map(|(&k, key)| {
            let fit = kmeans::fit(
                sample.view(),
                &KMeansConfig::new(k).with_n_init(config.n_init).with_seed(key.seed()),
            )?;
            Ok(fit.mean_distance(sample.view()))
        })
        .collect::<Result<_>>()?;

    let distortions = if config.smooth_distortions {
        running_minimum(&raw_distortions)
    } else {
        raw_distortions.clone()
    };
    let x: Vec<f64> = candidates.iter().map(|&k| k as f64).collect();
    let curve = PiecewiseLinearFit::new(x, distortions.clone())?;

    let mean_distortion = distortions.iter().sum::<f64>() / distortions.len() as f64;
    let penalty = config.penalty * mean_distortion;
    let mut optimizer = DiscreteBayesOpt::new(config.min_segments..=config.max_segments, config.bayes)?;
    let optimum = optimizer.minimize(|segments| Ok(curve.fit(segments)?.ssr + penalty * segments as f64))?;

    let segments = optimum.x;
    let model = curve.fit(segments)?;
    let k = selected_order(&model, config);

    tracing::info!(k, segments, breaks = ?model.breaks, "selected cluster count");
    Ok(OrderSelection {
        k,
        candidates,
        distortions,
        raw_distortions,
        segments,
        model,
    })
}

/// `ceil` of the last interior breakpoint, kept inside the scanned range.
fn selected_order(model: &PiecewiseModel, config: &OrderSelectionConfig) -> usize {
    let segments = model.segments();
    let breakpoint = model.breaks[segments - 1].ceil();
    if segments == 1 {
        tracing::warn!("single-segment fit, falling back to the first candidate");
    }
    (breakpoint.max(config.k_min as f64) as usize).min(config.max_k)
}

fn running_minimum(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(f64::INFINITY, |min, &v| {
            *min = min.min(v);
            Some(*min)
        })
        .collect()
}

/// Draw `subsampling_frac * N` rows with replacement, then resample to a fixed size.
fn subsample(embedding: ArrayView2<'_, f32>, config: &OrderSelectionConfig) -> Array2<f32> {
    let mut rows = embedding.to_owned();
    if config.subsampling_frac < 1.0 {
        let n = ((config.subsampling_frac * embedding.nrows() as f64) as usize).max(config.max_k);
        rows = draw_rows(rows.view(), n, config.seed);
    }
    if config.resample_size > 0 {
        rows = draw_rows(rows.view(), config.resample_size, config.seed);
    }
    rows
}

fn draw_rows(data: ArrayView2<'_, f32>, n: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..data.nrows())).collect();
    data.select(Axis(0), &indices)
}
