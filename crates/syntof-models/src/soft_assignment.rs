//! Student's-t soft assignment layer.

use burn::module::{Ignored, Module, Param};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use syntof_core::{squared_distances, student_t_kernel, tensor_from_array, tensor_to_array, Result, SyntofError};

use crate::init::WeightInit;

/// Seed of the placeholder centroids drawn before k-means seeding.
pub const CENTROID_INIT_SEED: u64 = 1;

/// Cluster centroids `[K, E]` and the Student's-t kernel over them.
///
/// `forward` maps an embedding `[N, E]` to `Q [N, K]`:
///
/// ```text
/// q[i,j] = (1 + ||z_i - mu_j||^2 / alpha)^(-(alpha + 1) / 2) / sum_j' (...)
/// ```
#[derive(Module, Debug)]
pub struct SoftAssignment<B: Backend> {
    pub centroids: Param<Tensor<B, 2>>,
    alpha: Ignored<f64>,
}

impl<B: Backend> SoftAssignment<B> {
    /// Glorot-uniform centroids; overwritten by k-means before training.
    pub fn new(n_clusters: usize, dim: usize, alpha: f64, device: &B::Device) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(CENTROID_INIT_SEED);
        let values = WeightInit::GlorotUniform.sample(n_clusters, dim, &mut rng);
        let centroids = Tensor::from_data(TensorData::new(values, [n_clusters, dim]), device);
        Self {
            centroids: Param::from_tensor(centroids),
            alpha: Ignored(alpha),
        }
    }

    pub fn from_centroids(centroids: &Array2<f32>, alpha: f64, device: &B::Device) -> Self {
        Self {
            centroids: Param::from_tensor(tensor_from_array(centroids, device)),
            alpha: Ignored(alpha),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha.0
    }

    pub fn n_clusters(&self) -> usize {
        self.centroids.val().dims()[0]
    }

    pub fn dim(&self) -> usize {
        self.centroids.val().dims()[1]
    }

    pub fn centroids(&self) -> Result<Array2<f32>> {
        tensor_to_array(self.centroids.val())
    }

    /// Replace the centroids; the shape must stay `[K, E]`.
    pub fn set_centroids(&mut self, centroids: &Array2<f32>, device: &B::Device) -> Result<()> {
        let (k, e) = centroids.dim();
        if k != self.n_clusters() {
            return Err(SyntofError::dims("centroid count", self.n_clusters(), k));
        }
        if e != self.dim() {
            return Err(SyntofError::dims("centroid width", self.dim(), e));
        }
        self.centroids = Param::from_tensor(tensor_from_array(centroids, device));
        Ok(())
    }

    pub fn forward(&self, embedding: Tensor<B, 2>) -> Tensor<B, 2> {
        let dist_sq = squared_distances(embedding, self.centroids.val());
        student_t_kernel(dist_sq, self.alpha.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use syntof_core::{init_cpu_device, CpuBackend};

    type B = CpuBackend;

    #[test]
    fn test_new_is_deterministic() {
        let device = init_cpu_device();
        let a = SoftAssignment::<B>::new(4, 3, 1.0, &device).centroids().unwrap();
        let b = SoftAssignment::<B>::new(4, 3, 1.0, &device).centroids().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.dim(), (4, 3));
    }

    #[test]
    fn test_set_centroids_checks_shape() {
        let device = init_cpu_device();
        let mut layer = SoftAssignment::<B>::new(2, 2, 1.0, &device);
        let good = ndarray::array![[0.0f32, 0.0], [5.0, 5.0]];
        layer.set_centroids(&good, &device).unwrap();
        assert_eq!(layer.centroids().unwrap(), good);

        let bad = ndarray::array![[0.0f32, 0.0, 1.0], [5.0, 5.0, 1.0]];
        assert!(layer.set_centroids(&bad, &device).is_err());
    }

    #[test]
    fn test_forward_rows_stochastic() {
        let device = init_cpu_device();
        let layer = SoftAssignment::<B>::from_centroids(&ndarray::array![[0.0f32, 0.0], [4.0, 0.0]], 1.0, &device);
        let z = tensor_from_array::<B>(&ndarray::array![[0.0f32, 0.0], [4.0, 0.0], [2.0, 0.0]], &device);
        let q = tensor_to_array(layer.forward(z)).unwrap();
        for row in q.outer_iter() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        // d2 = 0 and 16: q = 1 / (1 + 1/17)
        assert_relative_eq!(q[[0, 0]], 17.0 / 18.0, epsilon = 1e-5);
        assert_relative_eq!(q[[2, 0]], 0.5, epsilon = 1e-6);
    }
}
