//! Synthetic event data with known cluster membership.

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use syntof_core::{EventMatrix, Result, RngKey, SyntofError};

/// Gaussian blobs spread across several sample "files".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobConfig {
    pub n_clusters: usize,
    pub events_per_sample: usize,
    pub n_samples: usize,
    pub n_channels: usize,
    /// Distance of each center from the origin.
    pub separation: f32,
    pub stddev: f32,
    pub seed: u64,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            n_clusters: 5,
            events_per_sample: 400,
            n_samples: 3,
            n_channels: 12,
            separation: 8.0,
            stddev: 0.6,
            seed: 42,
        }
    }
}

impl BlobConfig {
    pub const fn with_clusters(mut self, n_clusters: usize) -> Self {
        self.n_clusters = n_clusters;
        self
    }

    pub const fn with_samples(mut self, n_samples: usize, events_per_sample: usize) -> Self {
        self.n_samples = n_samples;
        self.events_per_sample = events_per_sample;
        self
    }

    pub const fn with_channels(mut self, n_channels: usize) -> Self {
        self.n_channels = n_channels;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Generated samples plus the true cluster of every event, in row order.
#[derive(Debug, Clone)]
pub struct SyntheticData {
    pub samples: Vec<EventMatrix>,
    pub truth: Vec<usize>,
    pub centers: Array2<f32>,
}

impl SyntheticData {
    pub fn n_events(&self) -> usize {
        self.truth.len()
    }
}

pub fn channel_names(n_channels: usize) -> Vec<String> {
    (0..n_channels).map(|j| format!("marker{j:02}")).collect()
}

/// Draw blobs whose centers sit at random directions `separation` from the origin.
pub fn gaussian_blobs(config: &BlobConfig) -> Result<SyntheticData> {
    if config.n_clusters == 0 || config.n_channels == 0 || config.n_samples == 0 {
        return Err(SyntofError::config("blob generator needs clusters, channels and samples"));
    }
    let noise = Normal::new(0.0f32, config.stddev)
        .map_err(|e| SyntofError::config(format!("invalid blob stddev: {e}")))?;

    let keys = RngKey::new(config.seed).split(config.n_samples + 1);
    let mut center_rng = keys[0].rng();
    let mut centers = Array2::<f32>::zeros((config.n_clusters, config.n_channels));
    for mut center in centers.rows_mut() {
        center.mapv_inplace(|_| noise.sample(&mut center_rng) / config.stddev.max(f32::EPSILON));
        let norm = center.dot(&center).sqrt().max(f32::EPSILON);
        center.mapv_inplace(|v| v / norm * config.separation);
    }

    let columns = channel_names(config.n_channels);
    let mut samples = Vec::with_capacity(config.n_samples);
    let mut truth = Vec::with_capacity(config.n_samples * config.events_per_sample);
    for (s, key) in keys[1..].iter().enumerate() {
        let mut rng = key.rng();
        let mut values = Array2::<f32>::zeros((config.events_per_sample, config.n_channels));
        for mut row in values.rows_mut() {
            let cluster = rng.gen_range(0..config.n_clusters);
            for (v, &c) in row.iter_mut().zip(centers.row(cluster).iter()) {
                *v = c + noise.sample(&mut rng);
            }
            truth.push(cluster);
        }
        samples.push(EventMatrix::new(format!("synthetic_blobs_S{s}.csv"), columns.clone(), values)?);
    }

    tracing::debug!(clusters = config.n_clusters, events = truth.len(), "generated synthetic blobs");
    Ok(SyntheticData {
        samples,
        truth,
        centers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shapes_and_truth() {
        let config = BlobConfig::default().with_samples(2, 50).with_channels(4).with_clusters(3);
        let data = gaussian_blobs(&config).unwrap();
        assert_eq!(data.samples.len(), 2);
        assert_eq!(data.n_events(), 100);
        assert!(data.truth.iter().all(|&c| c < 3));
        assert_eq!(data.samples[1].sample_id(), "S1");
        assert_eq!(data.centers.dim(), (3, 4));
    }

    #[test]
    fn test_centers_at_separation() {
        let data = gaussian_blobs(&BlobConfig::default()).unwrap();
        for center in data.centers.rows() {
            let norm = center.dot(&center).sqrt();
            assert!((norm - 8.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_deterministic() {
        let config = BlobConfig::default().with_seed(7);
        let a = gaussian_blobs(&config).unwrap();
        let b = gaussian_blobs(&config).unwrap();
        assert_eq!(a.truth, b.truth);
        assert_eq!(a.samples[0].values, b.samples[0].values);
    }

    #[test]
    fn test_rejects_empty() {
        assert!(gaussian_blobs(&BlobConfig::default().with_clusters(0)).is_err());
    }
}
