//! Burn backend aliases and host <-> tensor conversion.
//!
//! CPU (`NdArray`) is the default backend. The `gpu` feature adds `Wgpu`, which is
//! used when the caller asks for it; there is no other placement policy.

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array2, ArrayView2};

use crate::error::{Result, SyntofError};

pub type CpuBackend = NdArray<f32>;
pub type TrainBackend = Autodiff<CpuBackend>;

pub fn init_cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

#[cfg(feature = "gpu")]
pub type WgpuBackend = burn::backend::Wgpu;
#[cfg(feature = "gpu")]
pub type GpuTrainBackend = Autodiff<WgpuBackend>;

#[cfg(feature = "gpu")]
pub fn init_gpu_device() -> burn::backend::wgpu::WgpuDevice {
    // Burn picks the best available adapter for the default device
    burn::backend::wgpu::WgpuDevice::default()
}

/// Upload a host matrix `[N, D]` to the device.
pub fn tensor_from_view<B: Backend>(view: ArrayView2<'_, f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = view.dim();
    let values: Vec<f32> = view.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

/// Upload an owned host matrix `[N, D]` to the device.
pub fn tensor_from_array<B: Backend>(array: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    tensor_from_view(array.view(), device)
}

/// Download a `[N, D]` tensor into a host matrix.
pub fn tensor_to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f32>> {
    let [rows, cols] = tensor.dims();
    let values: Vec<f32> = tensor
        .into_data()
        .convert::<f32>()
        .to_vec()
        .map_err(|e| SyntofError::Tensor(format!("{e:?}")))?;
    Array2::from_shape_vec((rows, cols), values).map_err(|e| SyntofError::Tensor(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_array_round_trip() {
        let device = init_cpu_device();
        let host = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let tensor: Tensor<CpuBackend, 2> = tensor_from_array(&host, &device);
        assert_eq!(tensor.dims(), [2, 3]);
        let back = tensor_to_array(tensor).expect("download");
        assert_eq!(back, host);
    }

    #[test]
    fn test_single_column_round_trip() {
        let device = init_cpu_device();
        let host = Array2::from_shape_vec((4, 1), vec![0.5f32, -1.0, 2.0, 3.5]).unwrap();
        let tensor: Tensor<TrainBackend, 2> = tensor_from_array(&host, &device);
        let back = tensor_to_array(tensor).expect("download");
        assert_eq!(back, host);
    }
}
