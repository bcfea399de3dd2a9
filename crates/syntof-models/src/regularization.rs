//! Regularization stages.
//!
//! Each variant of the base autoencoder is a list of named stages layered on
//! the same dense topology. Stages always run in a fixed order, so any
//! combination is well defined:
//!
//! ```text
//! dense -> BatchNorm -> activation -> GaussianNoise -> L2Normalize
//!       -> Dropout -> GaussianDropout -> AlphaDropout
//! ```
//!
//! | stage | layers | train | inference |
//! |-------|--------|-------|-----------|
//! | `BatchNorm` | hidden + bottleneck | batch statistics, learned affine | running statistics |
//! | `GaussianNoise` | encoder hidden | `x + N(0, s)` | identity |
//! | `L2Normalize` | bottleneck | unit rows | unit rows |
//! | `Dropout` | decoder hidden | inverted dropout | identity |
//! | `GaussianDropout` | decoder hidden | `x * N(1, sqrt(r / (1 - r)))` | identity |
//! | `AlphaDropout` | decoder hidden | SELU-preserving dropout | identity |
//!
//! Stochastic stages draw their noise on the host from the caller's RNG.

use burn::module::{Module, Param, RunningState};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use syntof_core::{Result, SyntofError};

use crate::architecture::LayerRole;

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;
const BATCH_NORM_EPSILON: f64 = 1e-3;
/// Weight of the batch statistics in the running averages.
const BATCH_NORM_MOMENTUM: f64 = 0.1;
const L2_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegularizationStage {
    BatchNorm,
    GaussianNoise { stddev: f64 },
    L2Normalize,
    Dropout { rate: f64 },
    GaussianDropout { rate: f64 },
    AlphaDropout { rate: f64 },
}

impl RegularizationStage {
    /// Position in the fixed stage order.
    pub const fn rank(&self) -> u8 {
        match self {
            RegularizationStage::BatchNorm => 0,
            RegularizationStage::GaussianNoise { .. } => 1,
            RegularizationStage::L2Normalize => 2,
            RegularizationStage::Dropout { .. } => 3,
            RegularizationStage::GaussianDropout { .. } => 4,
            RegularizationStage::AlphaDropout { .. } => 5,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            RegularizationStage::BatchNorm => "batch_norm",
            RegularizationStage::GaussianNoise { .. } => "gaussian_noise",
            RegularizationStage::L2Normalize => "l2_normalize",
            RegularizationStage::Dropout { .. } => "dropout",
            RegularizationStage::GaussianDropout { .. } => "gaussian_dropout",
            RegularizationStage::AlphaDropout { .. } => "alpha_dropout",
        }
    }

    pub const fn applies_to(&self, role: LayerRole) -> bool {
        match self {
            RegularizationStage::BatchNorm => !matches!(role, LayerRole::Output),
            RegularizationStage::GaussianNoise { .. } => matches!(role, LayerRole::EncoderHidden),
            RegularizationStage::L2Normalize => matches!(role, LayerRole::Bottleneck),
            RegularizationStage::Dropout { .. }
            | RegularizationStage::GaussianDropout { .. }
            | RegularizationStage::AlphaDropout { .. } => matches!(role, LayerRole::DecoderHidden),
        }
    }

    /// Runs between the dense layer and its activation.
    pub const fn is_pre_activation(&self) -> bool {
        matches!(self, RegularizationStage::BatchNorm)
    }

    /// Only active while training.
    pub const fn is_stochastic(&self) -> bool {
        matches!(
            self,
            RegularizationStage::GaussianNoise { .. }
                | RegularizationStage::Dropout { .. }
                | RegularizationStage::GaussianDropout { .. }
                | RegularizationStage::AlphaDropout { .. }
        )
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            RegularizationStage::GaussianNoise { stddev } if !(stddev >= 0.0 && stddev.is_finite()) => {
                Err(SyntofError::config(format!("gaussian noise stddev {stddev} must be >= 0")))
            }
            RegularizationStage::Dropout { rate }
            | RegularizationStage::GaussianDropout { rate }
            | RegularizationStage::AlphaDropout { rate }
                if !(0.0..1.0).contains(&rate) =>
            {
                Err(SyntofError::config(format!("{} rate {rate} must be in [0, 1)", self.name())))
            }
            _ => Ok(()),
        }
    }

    /// Apply a parameter-free stage.
    ///
    /// Stochastic stages are the identity when `rng` is `None`. `BatchNorm` is
    /// owned by the layer ([`BatchNormAffine`]) and is the identity here.
    pub fn apply<B: Backend>(&self, x: Tensor<B, 2>, rng: Option<&mut ChaCha8Rng>) -> Tensor<B, 2> {
        match *self {
            RegularizationStage::BatchNorm => x,
            RegularizationStage::L2Normalize => {
                let norm = x.clone().powf_scalar(2.0).sum_dim(1).clamp_min(L2_EPSILON).sqrt();
                x / norm
            }
            RegularizationStage::GaussianNoise { stddev } => match rng {
                Some(rng) => {
                    let noise = host_tensor::<B>(x.dims(), &x.device(), |_| {
                        stddev * rng.sample::<f64, _>(StandardNormal)
                    });
                    x + noise
                }
                None => x,
            },
            RegularizationStage::Dropout { rate } => match rng {
                Some(rng) if rate > 0.0 => {
                    let keep = 1.0 - rate;
                    let mask = host_tensor::<B>(x.dims(), &x.device(), |_| {
                        if rng.gen::<f64>() < keep {
                            1.0 / keep
                        } else {
                            0.0
                        }
                    });
                    x * mask
                }
                _ => x,
            },
            RegularizationStage::GaussianDropout { rate } => match rng {
                Some(rng) if rate > 0.0 => {
                    let stddev = (rate / (1.0 - rate)).sqrt();
                    let factor = host_tensor::<B>(x.dims(), &x.device(), |_| {
                        1.0 + stddev * rng.sample::<f64, _>(StandardNormal)
                    });
                    x * factor
                }
                _ => x,
            },
            RegularizationStage::AlphaDropout { rate } => match rng {
                Some(rng) if rate > 0.0 => {
                    let alpha_p = -SELU_ALPHA * SELU_SCALE;
                    let a = ((1.0 - rate) * (1.0 + rate * alpha_p * alpha_p)).powf(-0.5);
                    let b = -a * alpha_p * rate;
                    let kept = host_tensor::<B>(x.dims(), &x.device(), |_| {
                        if rng.gen::<f64>() >= rate {
                            1.0
                        } else {
                            0.0
                        }
                    });
                    let dropped = kept.clone().neg().add_scalar(1.0).mul_scalar(alpha_p);
                    (x * kept + dropped).mul_scalar(a).add_scalar(b)
                }
                _ => x,
            },
        }
    }
}

/// Sort stages into the fixed order, keeping the last entry of each kind.
pub fn canonical_stages(stages: &[RegularizationStage]) -> Vec<RegularizationStage> {
    let mut out: Vec<RegularizationStage> = Vec::with_capacity(stages.len());
    for stage in stages {
        if let Some(existing) = out.iter_mut().find(|s| s.rank() == stage.rank()) {
            *existing = *stage;
        } else {
            out.push(*stage);
        }
    }
    out.sort_by_key(RegularizationStage::rank);
    out
}

/// Scaled exponential linear unit.
pub fn selu<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let positive = x.clone().clamp_min(0.0);
    let negative = x.clamp_max(0.0).exp().sub_scalar(1.0).mul_scalar(SELU_ALPHA);
    (positive + negative).mul_scalar(SELU_SCALE)
}

/// Batch normalization of the columns of a `[N, D]` activation.
///
/// Training passes normalize with the batch statistics and fold them into the
/// running mean and variance. Inference passes use the running statistics, so
/// a row's output does not depend on the rows batched with it.
#[derive(Module, Debug)]
pub struct BatchNormAffine<B: Backend> {
    /// `[1, D]`
    pub gamma: Param<Tensor<B, 2>>,
    /// `[1, D]`
    pub beta: Param<Tensor<B, 2>>,
    /// `[1, D]`
    pub running_mean: RunningState<Tensor<B, 2>>,
    /// `[1, D]`
    pub running_var: RunningState<Tensor<B, 2>>,
}

impl<B: Backend> BatchNormAffine<B> {
    pub fn new(width: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([1, width], device)),
            beta: Param::from_tensor(Tensor::zeros([1, width], device)),
            running_mean: RunningState::new(Tensor::zeros([1, width], device)),
            running_var: RunningState::new(Tensor::ones([1, width], device)),
        }
    }

    /// Normalize with the statistics of `x` and update the running statistics.
    pub fn forward_train(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mean = x.clone().mean_dim(0);
        let centered = x - mean.clone();
        let var = centered.clone().powf_scalar(2.0).mean_dim(0);

        let running_mean = self.running_mean.value_sync();
        let running_var = self.running_var.value_sync();
        self.running_mean.update(
            running_mean
                .mul_scalar(1.0 - BATCH_NORM_MOMENTUM)
                .add(mean.detach().mul_scalar(BATCH_NORM_MOMENTUM))
                .detach(),
        );
        self.running_var.update(
            running_var
                .mul_scalar(1.0 - BATCH_NORM_MOMENTUM)
                .add(var.clone().detach().mul_scalar(BATCH_NORM_MOMENTUM))
                .detach(),
        );

        self.affine(centered / var.add_scalar(BATCH_NORM_EPSILON).sqrt())
    }

    /// Normalize with the running statistics.
    pub fn forward_inference(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let mean = self.running_mean.value();
        let var = self.running_var.value();
        self.affine((x - mean) / var.add_scalar(BATCH_NORM_EPSILON).sqrt())
    }

    /// Replace the running statistics, e.g. with persisted ones.
    pub fn set_running(&mut self, mean: Tensor<B, 2>, var: Tensor<B, 2>) {
        self.running_mean = RunningState::new(mean);
        self.running_var = RunningState::new(var);
    }

    fn affine(&self, normalized: Tensor<B, 2>) -> Tensor<B, 2> {
        normalized * self.gamma.val() + self.beta.val()
    }
}

/// Build a `[rows, cols]` tensor from a host generator called once per element.
fn host_tensor<B: Backend>(
    dims: [usize; 2],
    device: &B::Device,
    mut f: impl FnMut(usize) -> f64,
) -> Tensor<B, 2> {
    let values: Vec<f32> = (0..dims[0] * dims[1]).map(|i| f(i) as f32).collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}
