//! Symmetric fully-connected autoencoder.

use burn::module::{Ignored, Module, Param};
use burn::nn::Linear;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use syntof_core::{Result, SyntofError};

use crate::architecture::{ArchitectureSpec, LayerRecord, LayerRole};
use crate::checkpoint::NamedTensor;
use crate::regularization::{canonical_stages, BatchNormAffine, RegularizationStage};

/// Dense layer plus its optional batch-normalization affine.
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    pub linear: Linear<B>,
    pub norm: Option<BatchNormAffine<B>>,
}

/// Outputs of one autoencoder pass.
#[derive(Debug, Clone)]
pub struct AutoencoderOutput<B: Backend> {
    /// `[N, h_k]`
    pub bottleneck: Tensor<B, 2>,
    /// `[N, D]`
    pub reconstruction: Tensor<B, 2>,
}

/// D -> h_k -> D autoencoder built from an [`ArchitectureSpec`].
#[derive(Module, Debug)]
pub struct Autoencoder<B: Backend> {
    pub layers: Vec<DenseLayer<B>>,
    spec: Ignored<ArchitectureSpec>,
    records: Ignored<Vec<LayerRecord>>,
}

impl<B: Backend> Autoencoder<B> {
    /// Initialize all layers from the spec's seed; biases start at zero.
    pub fn new(mut spec: ArchitectureSpec, device: &B::Device) -> Result<Self> {
        spec.validate()?;
        spec.stages = canonical_stages(&spec.stages);
        let records = spec.layers();
        let mut rng = ChaCha8Rng::seed_from_u64(spec.seed);
        let batch_norm = spec.stages.contains(&RegularizationStage::BatchNorm);

        let layers = records
            .iter()
            .map(|record| {
                let kernel = spec.init.sample(record.in_dim, record.out_dim, &mut rng);
                let weight = Tensor::from_data(TensorData::new(kernel, [record.in_dim, record.out_dim]), device);
                let linear = Linear {
                    weight: Param::from_tensor(weight),
                    bias: Some(Param::from_tensor(Tensor::zeros([record.out_dim], device))),
                };
                let norm = (batch_norm && RegularizationStage::BatchNorm.applies_to(record.role))
                    .then(|| BatchNormAffine::new(record.out_dim, device));
                DenseLayer { linear, norm }
            })
            .collect();

        Ok(Self {
            layers,
            spec: Ignored(spec),
            records: Ignored(records),
        })
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.spec.0
    }

    pub fn records(&self) -> &[LayerRecord] {
        &self.records.0
    }

    pub fn input_dim(&self) -> usize {
        self.spec.0.input_dim()
    }

    pub fn bottleneck_dim(&self) -> usize {
        self.spec.0.bottleneck_dim()
    }

    fn apply_layer(&self, index: usize, x: Tensor<B, 2>, rng: Option<&mut ChaCha8Rng>) -> Tensor<B, 2> {
        let layer = &self.layers[index];
        let record = &self.records.0[index];

        let mut h = layer.linear.forward(x);
        if let Some(norm) = &layer.norm {
            h = if rng.is_some() {
                norm.forward_train(h)
            } else {
                norm.forward_inference(h)
            };
        }
        h = record.activation.apply(h);

        let mut rng = rng;
        for stage in &self.spec.0.stages {
            if !stage.is_pre_activation() && stage.applies_to(record.role) {
                h = stage.apply(h, rng.as_deref_mut());
            }
        }
        h
    }

    fn run(&self, input: Tensor<B, 2>, mut rng: Option<&mut ChaCha8Rng>) -> AutoencoderOutput<B> {
        let mut h = input;
        let mut bottleneck = h.clone();
        for index in 0..self.layers.len() {
            h = self.apply_layer(index, h, rng.as_deref_mut());
            if self.records.0[index].role == LayerRole::Bottleneck {
                bottleneck = h.clone();
            }
        }
        AutoencoderOutput {
            bottleneck,
            reconstruction: h,
        }
    }

    /// Deterministic pass: stochastic stages are off and batch normalization
    /// uses the running statistics.
    pub fn forward(&self, input: Tensor<B, 2>) -> AutoencoderOutput<B> {
        self.run(input, None)
    }

    /// Training pass: stochastic stages draw from `rng` and batch
    /// normalization updates its running statistics.
    pub fn forward_train(&self, input: Tensor<B, 2>, rng: &mut ChaCha8Rng) -> AutoencoderOutput<B> {
        self.run(input, Some(rng))
    }

    /// Encoder only, deterministic.
    pub fn encode(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let end = self.spec.0.bottleneck_index();
        (0..=end).fold(input, |h, index| self.apply_layer(index, h, None))
    }

    /// Decoder only, deterministic.
    pub fn decode(&self, code: Tensor<B, 2>) -> Tensor<B, 2> {
        let start = self.spec.0.bottleneck_index() + 1;
        (start..self.layers.len()).fold(code, |h, index| self.apply_layer(index, h, None))
    }

    /// Every parameter and running statistic as a host tensor, named
    /// `layer{i}.{weight|bias|gamma|beta|running_mean|running_var}`.
    pub fn named_tensors(&self) -> Result<Vec<NamedTensor>> {
        let mut out = Vec::with_capacity(self.layers.len() * 2);
        for (i, layer) in self.layers.iter().enumerate() {
            out.push(NamedTensor::from_tensor(format!("layer{i}.weight"), layer.linear.weight.val())?);
            if let Some(bias) = &layer.linear.bias {
                out.push(NamedTensor::from_tensor(format!("layer{i}.bias"), bias.val())?);
            }
            if let Some(norm) = &layer.norm {
                out.push(NamedTensor::from_tensor(format!("layer{i}.gamma"), norm.gamma.val())?);
                out.push(NamedTensor::from_tensor(format!("layer{i}.beta"), norm.beta.val())?);
                out.push(NamedTensor::from_tensor(format!("layer{i}.running_mean"), norm.running_mean.value())?);
                out.push(NamedTensor::from_tensor(format!("layer{i}.running_var"), norm.running_var.value())?);
            }
        }
        Ok(out)
    }

    /// Replace every parameter with the tensor of the same name.
    ///
    /// Fails with the first missing name or shape disagreement.
    pub fn load_named<'a, F>(mut self, device: &B::Device, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<&'a NamedTensor>,
    {
        let fetch = |name: String, shape: Vec<usize>| -> Result<&'a NamedTensor> {
            let tensor = lookup(&name)
                .ok_or_else(|| SyntofError::Tensor(format!("missing tensor '{name}'")))?;
            if tensor.shape != shape {
                return Err(SyntofError::Tensor(format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    tensor.shape, shape
                )));
            }
            Ok(tensor)
        };

        for (i, (layer, record)) in self.layers.iter_mut().zip(self.records.0.iter()).enumerate() {
            let weight = fetch(format!("layer{i}.weight"), vec![record.in_dim, record.out_dim])?;
            layer.linear.weight = Param::from_tensor(weight.to_tensor2(device)?);

            if layer.linear.bias.is_some() {
                let bias = fetch(format!("layer{i}.bias"), vec![record.out_dim])?;
                layer.linear.bias = Some(Param::from_tensor(bias.to_tensor1(device)));
            }
            if let Some(norm) = layer.norm.as_mut() {
                let gamma = fetch(format!("layer{i}.gamma"), vec![1, record.out_dim])?;
                let beta = fetch(format!("layer{i}.beta"), vec![1, record.out_dim])?;
                norm.gamma = Param::from_tensor(gamma.to_tensor2(device)?);
                norm.beta = Param::from_tensor(beta.to_tensor2(device)?);
                let mean = fetch(format!("layer{i}.running_mean"), vec![1, record.out_dim])?;
                let var = fetch(format!("layer{i}.running_var"), vec![1, record.out_dim])?;
                norm.set_running(mean.to_tensor2(device)?, var.to_tensor2(device)?);
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::AutoencoderVariant;
    use syntof_core::{init_cpu_device, tensor_from_array, tensor_to_array, CpuBackend};

    type B = CpuBackend;

    fn input(rows: usize, cols: usize) -> ndarray::Array2<f32> {
        ndarray::Array2::from_shape_fn((rows, cols), |(i, j)| ((i * cols + j) as f32 * 0.37).sin())
    }

    #[test]
    fn test_shapes() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::new(vec![8, 4, 2]).build::<B>(&device).unwrap();
        let out = model.forward(tensor_from_array(&input(5, 8), &device));
        assert_eq!(out.bottleneck.dims(), [5, 2]);
        assert_eq!(out.reconstruction.dims(), [5, 8]);
        assert_eq!(model.records().len(), 4);
        assert_eq!(model.records().iter().filter(|r| r.role == LayerRole::Bottleneck).count(), 1);
    }

    #[test]
    fn test_same_seed_bit_identical() {
        let device = init_cpu_device();
        let spec = ArchitectureSpec::variant(vec![8, 6, 3], AutoencoderVariant::BatchNorm).with_seed(84);
        let a = spec.build::<B>(&device).unwrap().named_tensors().unwrap();
        let b = spec.build::<B>(&device).unwrap().named_tensors().unwrap();
        assert_eq!(a, b);

        let c = spec.clone().with_seed(85).build::<B>(&device).unwrap().named_tensors().unwrap();
        assert_ne!(a[0].values, c[0].values);
    }

    #[test]
    fn test_encode_decode_match_forward() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::new(vec![6, 5, 3]).with_seed(3).build::<B>(&device).unwrap();
        let x = tensor_from_array::<B>(&input(4, 6), &device);
        let out = model.forward(x.clone());
        let code = model.encode(x);
        let recon = model.decode(code.clone());

        let a = tensor_to_array(out.bottleneck).unwrap();
        let b = tensor_to_array(code).unwrap();
        assert_eq!(a, b);
        assert_eq!(tensor_to_array(out.reconstruction).unwrap(), tensor_to_array(recon).unwrap());
    }

    #[test]
    fn test_l2_bottleneck_unit_norm() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::variant(vec![6, 4, 3], AutoencoderVariant::L2)
            .build::<B>(&device)
            .unwrap();
        let code = tensor_to_array(model.encode(tensor_from_array(&input(7, 6), &device))).unwrap();
        for row in code.outer_iter() {
            let norm = row.dot(&row).sqrt();
            assert!((norm - 1.0).abs() < 1e-4 || norm < 1e-6, "norm {norm}");
        }
    }

    #[test]
    fn test_noise_only_in_training() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::variant(vec![6, 4, 2], AutoencoderVariant::Noise)
            .build::<B>(&device)
            .unwrap();
        let x = tensor_from_array::<B>(&input(3, 6), &device);
        let clean_a = tensor_to_array(model.forward(x.clone()).bottleneck).unwrap();
        let clean_b = tensor_to_array(model.forward(x.clone()).bottleneck).unwrap();
        assert_eq!(clean_a, clean_b);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let noisy = tensor_to_array(model.forward_train(x, &mut rng).bottleneck).unwrap();
        assert_ne!(clean_a, noisy);
    }

    #[test]
    fn test_single_feature_input() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::new(vec![1, 2, 1]).build::<B>(&device).unwrap();
        let out = model.forward(tensor_from_array(&input(4, 1), &device));
        assert_eq!(out.bottleneck.dims(), [4, 1]);
        let values = tensor_to_array(out.reconstruction).unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_load_named_round_trip() {
        let device = init_cpu_device();
        let spec = ArchitectureSpec::new(vec![5, 3, 2]);
        let source = spec.clone().with_seed(1).build::<B>(&device).unwrap();
        let tensors = source.named_tensors().unwrap();

        let target = spec.with_seed(2).build::<B>(&device).unwrap();
        let loaded = target
            .load_named(&device, |name| tensors.iter().find(|t| t.name == name))
            .unwrap();
        assert_eq!(loaded.named_tensors().unwrap(), tensors);
    }

    #[test]
    fn test_load_named_rejects_wrong_shape() {
        let device = init_cpu_device();
        let small = ArchitectureSpec::new(vec![5, 3, 2]).build::<B>(&device).unwrap();
        let tensors = small.named_tensors().unwrap();
        let big = ArchitectureSpec::new(vec![5, 4, 2]).build::<B>(&device).unwrap();
        assert!(big.load_named(&device, |name| tensors.iter().find(|t| t.name == name)).is_err());
    }
}
