//! K-means on host matrices.
//!
//! Two variants share one entry point, [`fit`]:
//!
//! - [`KMeansVariant::Exact`]: Lloyd iterations from k-means++ seeds, restarted
//!   `n_init` times, best inertia kept
//! - [`KMeansVariant::MiniBatch`]: per-center learning-rate updates on random
//!   batches, labels from a final full assignment pass
//!
//! Restarts run in parallel on the current rayon pool; each restart draws from
//! its own key split off `seed`, so results do not depend on the thread count.

use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use syntof_core::{squared_distances_host, RngKey, Result, SyntofError};

/// Iterations without improvement of the smoothed batch inertia before a
/// mini-batch run stops.
const MAX_NO_IMPROVEMENT: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KMeansVariant {
    #[default]
    Exact,
    MiniBatch { batch_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    /// Independent restarts; the lowest inertia wins.
    pub n_init: usize,
    /// Lloyd iterations, or passes over the data for the mini-batch variant.
    pub max_iter: usize,
    /// Convergence threshold on the squared centroid shift, relative to the
    /// mean per-feature variance of the data.
    pub tolerance: f64,
    pub variant: KMeansVariant,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            n_init: 10,
            max_iter: 300,
            tolerance: 1e-4,
            variant: KMeansVariant::Exact,
            seed: 0,
        }
    }
}

impl KMeansConfig {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            ..Default::default()
        }
    }

    /// Mini-batch defaults: 3 restarts over batches of 1024 rows.
    pub fn mini_batch(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            n_init: 3,
            max_iter: 100,
            variant: KMeansVariant::MiniBatch { batch_size: 1024 },
            ..Default::default()
        }
    }

    pub const fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init;
        self
    }

    pub const fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub const fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub const fn with_variant(mut self, variant: KMeansVariant) -> Self {
        self.variant = variant;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self, n_rows: usize) -> Result<()> {
        if self.n_clusters == 0 {
            return Err(SyntofError::config("k-means needs at least one cluster"));
        }
        if self.n_init == 0 || self.max_iter == 0 {
            return Err(SyntofError::config("k-means n_init and max_iter must be positive"));
        }
        if let KMeansVariant::MiniBatch { batch_size: 0 } = self.variant {
            return Err(SyntofError::config("mini-batch size must be positive"));
        }
        if n_rows < self.n_clusters {
            return Err(SyntofError::config(format!(
                "{} clusters requested for {n_rows} points",
                self.n_clusters
            )));
        }
        Ok(())
    }
}

/// Result of one k-means fit.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    /// `[K, D]`
    pub centroids: Array2<f32>,
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
    pub n_iter: usize,
}

impl KMeansFit {
    pub fn n_clusters(&self) -> usize {
        self.centroids.nrows()
    }

    /// Points per cluster, empty clusters included.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_clusters()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// Relabel so cluster 0 is the most populated; ties keep their order.
    pub fn reorder_by_population(self) -> Self {
        let counts = self.counts();
        let mut order: Vec<usize> = (0..counts.len()).collect();
        order.sort_by(|&a, &b| counts[b].cmp(&counts[a]));

        let mut new_label = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_label[old] = new;
        }
        Self {
            centroids: self.centroids.select(Axis(0), &order),
            labels: self.labels.iter().map(|&l| new_label[l]).collect(),
            inertia: self.inertia,
            n_iter: self.n_iter,
        }
    }

    /// Mean Euclidean distance from each point of `data` to its nearest centroid.
    pub fn mean_distance(&self, data: ArrayView2<'_, f32>) -> f64 {
        let (_, dist_sq) = assign(data, self.centroids.view());
        if dist_sq.is_empty() {
            return 0.0;
        }
        dist_sq.iter().map(|&d| f64::from(d).sqrt()).sum::<f64>() / dist_sq.len() as f64
    }

    /// Nearest-centroid labels for new points.
    pub fn predict(&self, data: ArrayView2<'_, f32>) -> Vec<usize> {
        assign(data, self.centroids.view()).0
    }
}

/// Fit k-means to the rows of `data`.
pub fn fit(data: ArrayView2<'_, f32>, config: &KMeansConfig) -> Result<KMeansFit> {
    config.validate(data.nrows())?;
    syntof_core::ensure_finite(data.iter(), "k-means input")?;

    let keys = RngKey::new(config.seed).split(config.n_init);
    let fits: Vec<KMeansFit> = keys
        .into_par_iter()
        .map(|key| {
            let mut rng = key.rng();
            match config.variant {
                KMeansVariant::Exact => lloyd(data, config, &mut rng),
                KMeansVariant::MiniBatch { batch_size } => mini_batch(data, config, batch_size, &mut rng),
            }
        })
        .collect();

    // First minimum wins so ties resolve the same way on any pool size
    let best = fits
        .into_iter()
        .reduce(|best, fit| if fit.inertia < best.inertia { fit } else { best })
        .ok_or_else(|| SyntofError::config("k-means produced no fit"))?;

    if !best.inertia.is_finite() {
        return Err(SyntofError::NonFinite("k-means inertia".to_string()));
    }
    tracing::trace!(k = config.n_clusters, inertia = best.inertia, iterations = best.n_iter, "k-means fit");
    Ok(best)
}

/// Labels and squared distances of the nearest centroid for every row.
fn assign(data: ArrayView2<'_, f32>, centroids: ArrayView2<'_, f32>) -> (Vec<usize>, Vec<f32>) {
    let dist_sq = squared_distances_host(data, centroids);
    dist_sq
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0usize, f32::INFINITY), |best, (j, &d)| if d < best.1 { (j, d) } else { best })
        })
        .unzip()
}

/// k-means++ seeding: first center uniform, then proportional to squared
/// distance from the nearest chosen center.
fn kmeans_plus_plus(data: ArrayView2<'_, f32>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f32> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut closest: Vec<f32> = squared_distances_host(data, centroids.slice(ndarray::s![0..1, ..]))
        .column(0)
        .to_vec();

    for c in 1..k {
        let total: f64 = closest.iter().map(|&d| f64::from(d)).sum();
        let chosen = if total <= 0.0 {
            // All remaining points coincide with a center
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = n - 1;
            for (i, &d) in closest.iter().enumerate() {
                target -= f64::from(d);
                if target <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.row_mut(c).assign(&data.row(chosen));

        let fresh = squared_distances_host(data, centroids.slice(ndarray::s![c..c + 1, ..]));
        for (d, &f) in closest.iter_mut().zip(fresh.column(0).iter()) {
            *d = d.min(f);
        }
    }
    centroids
}

/// Mean per-feature variance, the scale of the convergence threshold.
fn mean_variance(data: ArrayView2<'_, f32>) -> f64 {
    data.var_axis(Axis(0), 0.0)
        .mean()
        .map(f64::from)
        .unwrap_or(0.0)
}

fn lloyd(data: ArrayView2<'_, f32>, config: &KMeansConfig, rng: &mut ChaCha8Rng) -> KMeansFit {
    let k = config.n_clusters;
    let threshold = config.tolerance * mean_variance(data);
    let mut centroids = kmeans_plus_plus(data, k, rng);
    let (mut labels, mut dist_sq) = assign(data, centroids.view());
    let mut n_iter = 0;

    for iteration in 1..=config.max_iter {
        n_iter = iteration;
        let mut sums = Array2::<f64>::zeros((k, data.ncols()));
        let mut counts = vec![0usize; k];
        for (row, &label) in data.outer_iter().zip(labels.iter()) {
            counts[label] += 1;
            for (s, &v) in sums.row_mut(label).iter_mut().zip(row.iter()) {
                *s += f64::from(v);
            }
        }

        let mut updated = Array2::<f32>::zeros((k, data.ncols()));
        for c in 0..k {
            if counts[c] == 0 {
                // Relocate an empty cluster to the point farthest from its center
                let far = dist_sq
                    .iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (i, &d)| if d > best.1 { (i, d) } else { best })
                    .0;
                updated.row_mut(c).assign(&data.row(far));
                dist_sq[far] = 0.0;
            } else {
                let inv = 1.0 / counts[c] as f64;
                for (u, &s) in updated.row_mut(c).iter_mut().zip(sums.row(c).iter()) {
                    *u = (s * inv) as f32;
                }
            }
        }

        let shift: f64 = (&updated - &centroids).iter().map(|&d| f64::from(d) * f64::from(d)).sum();
        centroids = updated;
        let (new_labels, new_dist) = assign(data, centroids.view());
        let stable = new_labels == labels;
        labels = new_labels;
        dist_sq = new_dist;
        if stable || shift <= threshold {
            break;
        }
    }

    KMeansFit {
        inertia: dist_sq.iter().map(|&d| f64::from(d)).sum(),
        centroids,
        labels,
        n_iter,
    }
}

fn mini_batch(data: ArrayView2<'_, f32>, config: &KMeansConfig, batch_size: usize, rng: &mut ChaCha8Rng) -> KMeansFit {
    let n = data.nrows();
    let k = config.n_clusters;
    let batch_size = batch_size.min(n);
    let threshold = config.tolerance * mean_variance(data);

    // Seed on a random subset of three batches
    let init_size = (3 * batch_size).max(k).min(n);
    let init_rows: Vec<usize> = (0..init_size).map(|_| rng.gen_range(0..n)).collect();
    let init_data = data.select(Axis(0), &init_rows);
    let mut centroids = kmeans_plus_plus(init_data.view(), k, rng);

    let mut counts = vec![0f64; k];
    let steps = config.max_iter * n.div_ceil(batch_size);
    let mut smoothed: Option<f64> = None;
    let mut best_smoothed = f64::INFINITY;
    let mut no_improvement = 0usize;
    let mut n_iter = 0;
    let alpha = (batch_size as f64 * 2.0 / (n as f64 + 1.0)).min(1.0);

    for step in 1..=steps {
        n_iter = step;
        let rows: Vec<usize> = (0..batch_size).map(|_| rng.gen_range(0..n)).collect();
        let batch = data.select(Axis(0), &rows);
        let (labels, dist_sq) = assign(batch.view(), centroids.view());

        let previous = centroids.clone();
        for (row, &label) in batch.outer_iter().zip(labels.iter()) {
            counts[label] += 1.0;
            let eta = (1.0 / counts[label]) as f32;
            for (c, &v) in centroids.row_mut(label).iter_mut().zip(row.iter()) {
                *c += eta * (v - *c);
            }
        }

        let shift: f64 = (&centroids - &previous).iter().map(|&d| f64::from(d) * f64::from(d)).sum();
        if shift <= threshold {
            break;
        }

        let batch_inertia = dist_sq.iter().map(|&d| f64::from(d)).sum::<f64>() / batch_size as f64;
        let ewa = match smoothed {
            Some(prev) => prev * (1.0 - alpha) + batch_inertia * alpha,
            None => batch_inertia,
        };
        smoothed = Some(ewa);
        if ewa < best_smoothed {
            best_smoothed = ewa;
            no_improvement = 0;
        } else {
            no_improvement += 1;
            if no_improvement >= MAX_NO_IMPROVEMENT {
                break;
            }
        }
    }

    let (labels, dist_sq) = assign(data, centroids.view());
    KMeansFit {
        inertia: dist_sq.iter().map(|&d| f64::from(d)).sum(),
        centroids,
        labels,
        n_iter,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use syntof_core::normalized_mutual_info;

    fn blobs(per_blob: usize, centers: &[[f32; 2]], seed: u64) -> (Array2<f32>, Vec<usize>) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let noise = Normal::new(0.0f32, 0.5).unwrap();
        let mut values = Vec::new();
        let mut truth = Vec::new();
        for (label, center) in centers.iter().enumerate() {
            for _ in 0..per_blob {
                values.push(center[0] + noise.sample(&mut rng));
                values.push(center[1] + noise.sample(&mut rng));
                truth.push(label);
            }
        }
        (Array2::from_shape_vec((truth.len(), 2), values).unwrap(), truth)
    }

    const CENTERS: [[f32; 2]; 3] = [[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]];

    #[test]
    fn test_exact_recovers_blobs() {
        let (data, truth) = blobs(50, &CENTERS, 7);
        let fit = fit(data.view(), &KMeansConfig::new(3).with_seed(3)).unwrap();
        assert_eq!(fit.n_clusters(), 3);
        assert_relative_eq!(normalized_mutual_info(&truth, &fit.labels).unwrap(), 1.0, epsilon = 1e-9);
        assert_eq!(fit.counts(), vec![50, 50, 50]);
    }

    #[test]
    fn test_mini_batch_recovers_blobs() {
        let (data, truth) = blobs(200, &CENTERS, 11);
        let config = KMeansConfig::mini_batch(3)
            .with_variant(KMeansVariant::MiniBatch { batch_size: 64 })
            .with_seed(5);
        let fit = fit(data.view(), &config).unwrap();
        assert!(normalized_mutual_info(&truth, &fit.labels).unwrap() > 0.95);
    }

    #[test]
    fn test_same_seed_same_labels() {
        let (data, _) = blobs(40, &CENTERS, 2);
        let config = KMeansConfig::new(4).with_seed(9).with_n_init(3);
        let a = fit(data.view(), &config).unwrap();
        let b = fit(data.view(), &config).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_reorder_by_population() {
        let fit = KMeansFit {
            centroids: ndarray::array![[0.0f32], [1.0], [2.0]],
            labels: vec![0, 2, 2, 2, 1, 1],
            inertia: 0.0,
            n_iter: 1,
        };
        let reordered = fit.reorder_by_population();
        assert_eq!(reordered.counts(), vec![3, 2, 1]);
        assert_eq!(reordered.centroids, ndarray::array![[2.0f32], [1.0], [0.0]]);
        assert_eq!(reordered.labels, vec![2, 0, 0, 0, 1, 1]);
    }

    #[test]
    fn test_mean_distance() {
        let fit = KMeansFit {
            centroids: ndarray::array![[0.0f32, 0.0]],
            labels: vec![0, 0],
            inertia: 0.0,
            n_iter: 1,
        };
        let data = ndarray::array![[3.0f32, 4.0], [0.0, 1.0]];
        assert_relative_eq!(fit.mean_distance(data.view()), 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_more_clusters_than_points() {
        let data = Array2::<f32>::zeros((2, 2));
        assert!(fit(data.view(), &KMeansConfig::new(3)).is_err());
    }
}
