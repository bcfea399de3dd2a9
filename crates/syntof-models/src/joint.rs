//! Joint deep-clustering model: dual-branch embedding plus soft assignment.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand_chacha::ChaCha8Rng;

use crate::dual::DualBranchModel;
use crate::soft_assignment::SoftAssignment;

#[derive(Debug, Clone)]
pub struct ClusteringOutput<B: Backend> {
    /// `[N, K]`
    pub q: Tensor<B, 2>,
    pub embedding: Tensor<B, 2>,
    pub reconstruction_a: Tensor<B, 2>,
    pub reconstruction_b: Tensor<B, 2>,
}

/// Outputs `[Q, reconstruction_a, reconstruction_b]` from one or two inputs.
#[derive(Module, Debug)]
pub struct DeepClusteringModel<B: Backend> {
    pub embedding: DualBranchModel<B>,
    pub assignment: SoftAssignment<B>,
}

impl<B: Backend> DeepClusteringModel<B> {
    pub fn new(embedding: DualBranchModel<B>, assignment: SoftAssignment<B>) -> Self {
        Self {
            embedding,
            assignment,
        }
    }

    pub fn n_clusters(&self) -> usize {
        self.assignment.n_clusters()
    }

    pub fn forward_pair(&self, x_a: Tensor<B, 2>, x_b: Tensor<B, 2>) -> ClusteringOutput<B> {
        let out = self.embedding.forward_pair(x_a, x_b);
        ClusteringOutput {
            q: self.assignment.forward(out.embedding.clone()),
            embedding: out.embedding,
            reconstruction_a: out.reconstruction_a,
            reconstruction_b: out.reconstruction_b,
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> ClusteringOutput<B> {
        self.forward_pair(x.clone(), x)
    }

    pub fn forward_train_pair(&self, x_a: Tensor<B, 2>, x_b: Tensor<B, 2>, rng: &mut ChaCha8Rng) -> ClusteringOutput<B> {
        let out = self.embedding.forward_train_pair(x_a, x_b, rng);
        ClusteringOutput {
            q: self.assignment.forward(out.embedding.clone()),
            embedding: out.embedding,
            reconstruction_a: out.reconstruction_a,
            reconstruction_b: out.reconstruction_b,
        }
    }

    /// Soft assignment only.
    pub fn predict_q(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.assignment.forward(self.embedding.embed(x))
    }
}
