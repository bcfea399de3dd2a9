//! Typed autoencoder architecture descriptor.
//!
//! An [`ArchitectureSpec`] lists the encoder widths `[D, h1, ..., hk]`; the
//! decoder mirrors them. [`ArchitectureSpec::layers`] expands the widths into
//! [`LayerRecord`]s, each tagged with a [`LayerRole`], and the autoencoder is
//! built from those records. The bottleneck is addressed by role, never by name.
//!
//! ```text
//! widths [8, 4, 2]:
//!   layer 0  EncoderHidden  8 -> 4  activation
//!   layer 1  Bottleneck     4 -> 2  linear
//!   layer 2  DecoderHidden  2 -> 4  activation
//!   layer 3  Output         4 -> 8  linear
//! ```

use burn::tensor::activation::{leaky_relu, relu};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use syntof_core::{Result, SyntofError};

use crate::autoencoder::Autoencoder;
use crate::init::WeightInit;
use crate::regularization::{canonical_stages, selu, RegularizationStage};

const LEAKY_RELU_SLOPE: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Selu,
    /// Negative slope 0.3
    LeakyRelu,
    Linear,
}

impl Activation {
    pub fn apply<B: Backend>(self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        match self {
            Activation::Relu => relu(x),
            Activation::Selu => selu(x),
            Activation::LeakyRelu => leaky_relu(x, LEAKY_RELU_SLOPE),
            Activation::Linear => x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerRole {
    EncoderHidden,
    Bottleneck,
    DecoderHidden,
    Output,
}

/// One dense layer of the expanded topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub index: usize,
    pub role: LayerRole,
    pub in_dim: usize,
    pub out_dim: usize,
    pub activation: Activation,
}

/// Named variants of the base topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoencoderVariant {
    #[default]
    Plain,
    /// Gaussian noise (stddev 1) after encoder hidden layers
    Noise,
    /// Gaussian dropout (0.3) after decoder hidden layers
    Dropout,
    /// L2-normalized bottleneck
    L2,
    /// Batch normalization before activations and on the bottleneck
    BatchNorm,
    /// SELU with LeCun normal init and alpha dropout (0.3)
    SelfNormalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    /// `[D, h1, ..., hk]`; `hk` is the bottleneck width
    pub widths: Vec<usize>,
    pub activation: Activation,
    pub init: WeightInit,
    pub seed: u64,
    #[serde(default)]
    pub stages: Vec<RegularizationStage>,
}

impl ArchitectureSpec {
    pub fn new(widths: Vec<usize>) -> Self {
        Self {
            widths,
            activation: Activation::Relu,
            init: WeightInit::GlorotUniform,
            seed: 0,
            stages: Vec::new(),
        }
    }

    pub fn variant(widths: Vec<usize>, variant: AutoencoderVariant) -> Self {
        let spec = Self::new(widths);
        match variant {
            AutoencoderVariant::Plain => spec,
            AutoencoderVariant::Noise => spec.with_stage(RegularizationStage::GaussianNoise { stddev: 1.0 }),
            AutoencoderVariant::Dropout => spec.with_stage(RegularizationStage::GaussianDropout { rate: 0.3 }),
            AutoencoderVariant::L2 => spec.with_stage(RegularizationStage::L2Normalize),
            AutoencoderVariant::BatchNorm => spec.with_stage(RegularizationStage::BatchNorm),
            AutoencoderVariant::SelfNormalizing => spec
                .with_activation(Activation::Selu)
                .with_init(WeightInit::LecunNormal)
                .with_stage(RegularizationStage::AlphaDropout { rate: 0.3 }),
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Add a stage; a stage of the same kind is replaced.
    pub fn with_stage(mut self, stage: RegularizationStage) -> Self {
        self.stages.push(stage);
        self.stages = canonical_stages(&self.stages);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.widths.len() < 2 {
            return Err(SyntofError::config(format!(
                "autoencoder needs at least [input, bottleneck] widths, got {:?}",
                self.widths
            )));
        }
        if self.widths.contains(&0) {
            return Err(SyntofError::config(format!("zero layer width in {:?}", self.widths)));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }

    pub fn input_dim(&self) -> usize {
        self.widths.first().copied().unwrap_or(0)
    }

    pub fn bottleneck_dim(&self) -> usize {
        self.widths.last().copied().unwrap_or(0)
    }

    /// Stages in their fixed order.
    pub fn ordered_stages(&self) -> Vec<RegularizationStage> {
        canonical_stages(&self.stages)
    }

    /// Expand the widths into encoder and mirrored decoder layers.
    pub fn layers(&self) -> Vec<LayerRecord> {
        let w = &self.widths;
        if w.len() < 2 {
            return Vec::new();
        }
        let k = w.len() - 1;
        let mut records = Vec::with_capacity(2 * k);

        for i in 0..k {
            let role = if i + 1 == k {
                LayerRole::Bottleneck
            } else {
                LayerRole::EncoderHidden
            };
            records.push((role, w[i], w[i + 1]));
        }
        for i in (0..k).rev() {
            let role = if i == 0 {
                LayerRole::Output
            } else {
                LayerRole::DecoderHidden
            };
            records.push((role, w[i + 1], w[i]));
        }

        records
            .into_iter()
            .enumerate()
            .map(|(index, (role, in_dim, out_dim))| LayerRecord {
                index,
                role,
                in_dim,
                out_dim,
                activation: match role {
                    LayerRole::EncoderHidden | LayerRole::DecoderHidden => self.activation,
                    LayerRole::Bottleneck | LayerRole::Output => Activation::Linear,
                },
            })
            .collect()
    }

    /// Index of the bottleneck layer.
    pub fn bottleneck_index(&self) -> usize {
        self.widths.len().saturating_sub(2)
    }

    /// Build a freshly initialized autoencoder.
    pub fn build<B: Backend>(&self, device: &B::Device) -> Result<Autoencoder<B>> {
        Autoencoder::new(self.clone(), device)
    }
}
