//! Two autoencoders joined at the bottleneck.

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use syntof_core::{Result, SyntofError};

use crate::autoencoder::Autoencoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchId {
    A,
    B,
}

impl BranchId {
    pub const ALL: [BranchId; 2] = [BranchId::A, BranchId::B];

    pub const fn as_str(self) -> &'static str {
        match self {
            BranchId::A => "a",
            BranchId::B => "b",
        }
    }
}

impl std::fmt::Display for BranchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct JointOutput<B: Backend> {
    /// `[N, h_a + h_b]`, branch A columns first
    pub embedding: Tensor<B, 2>,
    pub reconstruction_a: Tensor<B, 2>,
    pub reconstruction_b: Tensor<B, 2>,
}

/// Dual-branch embedding model.
///
/// Each branch is an independently built and pretrained autoencoder; the joint
/// embedding is the concatenation of their bottlenecks. The branches usually
/// share one input matrix but may be fed different ones through
/// [`DualBranchModel::forward_pair`].
#[derive(Module, Debug)]
pub struct DualBranchModel<B: Backend> {
    pub branch_a: Autoencoder<B>,
    pub branch_b: Autoencoder<B>,
}

impl<B: Backend> DualBranchModel<B> {
    pub fn new(branch_a: Autoencoder<B>, branch_b: Autoencoder<B>) -> Self {
        Self { branch_a, branch_b }
    }

    pub fn branch(&self, id: BranchId) -> &Autoencoder<B> {
        match id {
            BranchId::A => &self.branch_a,
            BranchId::B => &self.branch_b,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.branch_a.bottleneck_dim() + self.branch_b.bottleneck_dim()
    }

    /// Check that one `[N, width]` matrix can feed both branches.
    pub fn check_shared_input(&self, width: usize) -> Result<()> {
        for id in BranchId::ALL {
            let expected = self.branch(id).input_dim();
            if expected != width {
                return Err(SyntofError::dims(format!("branch {id} input"), expected, width));
            }
        }
        Ok(())
    }

    pub fn embed(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.embed_pair(x.clone(), x)
    }

    pub fn embed_pair(&self, x_a: Tensor<B, 2>, x_b: Tensor<B, 2>) -> Tensor<B, 2> {
        Tensor::cat(vec![self.branch_a.encode(x_a), self.branch_b.encode(x_b)], 1)
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> JointOutput<B> {
        self.forward_pair(x.clone(), x)
    }

    pub fn forward_pair(&self, x_a: Tensor<B, 2>, x_b: Tensor<B, 2>) -> JointOutput<B> {
        let a = self.branch_a.forward(x_a);
        let b = self.branch_b.forward(x_b);
        JointOutput {
            embedding: Tensor::cat(vec![a.bottleneck, b.bottleneck], 1),
            reconstruction_a: a.reconstruction,
            reconstruction_b: b.reconstruction,
        }
    }

    /// Training pass; both branches draw stochastic stages from `rng`, A first.
    pub fn forward_train_pair(&self, x_a: Tensor<B, 2>, x_b: Tensor<B, 2>, rng: &mut ChaCha8Rng) -> JointOutput<B> {
        let a = self.branch_a.forward_train(x_a, rng);
        let b = self.branch_b.forward_train(x_b, rng);
        JointOutput {
            embedding: Tensor::cat(vec![a.bottleneck, b.bottleneck], 1),
            reconstruction_a: a.reconstruction,
            reconstruction_b: b.reconstruction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::ArchitectureSpec;
    use syntof_core::{init_cpu_device, tensor_from_array, tensor_to_array, CpuBackend};

    type B = CpuBackend;

    fn dual(device: &<B as Backend>::Device) -> DualBranchModel<B> {
        DualBranchModel::new(
            ArchitectureSpec::new(vec![6, 4, 3]).with_seed(1).build(device).unwrap(),
            ArchitectureSpec::new(vec![6, 4, 2]).with_seed(2).build(device).unwrap(),
        )
    }

    #[test]
    fn test_embedding_concatenates_bottlenecks() {
        let device = init_cpu_device();
        let model = dual(&device);
        let host = ndarray::Array2::from_shape_fn((5, 6), |(i, j)| (i as f32 - j as f32) * 0.2);
        let x = tensor_from_array::<B>(&host, &device);

        let joint = tensor_to_array(model.embed(x.clone())).unwrap();
        assert_eq!(joint.dim(), (5, model.embedding_dim()));

        let a = tensor_to_array(model.branch_a.encode(x.clone())).unwrap();
        let b = tensor_to_array(model.branch_b.encode(x)).unwrap();
        assert_eq!(joint.slice(ndarray::s![.., 0..3]), a);
        assert_eq!(joint.slice(ndarray::s![.., 3..5]), b);
    }

    #[test]
    fn test_forward_pair_accepts_distinct_inputs() {
        let device = init_cpu_device();
        let model = DualBranchModel::<B>::new(
            ArchitectureSpec::new(vec![6, 2]).build(&device).unwrap(),
            ArchitectureSpec::new(vec![3, 1]).build(&device).unwrap(),
        );
        let x_a = tensor_from_array::<B>(&ndarray::Array2::ones((4, 6)), &device);
        let x_b = tensor_from_array::<B>(&ndarray::Array2::ones((4, 3)), &device);
        let out = model.forward_pair(x_a, x_b);
        assert_eq!(out.embedding.dims(), [4, 3]);
        assert_eq!(out.reconstruction_b.dims(), [4, 3]);
        assert!(model.check_shared_input(6).is_err());
    }
}
