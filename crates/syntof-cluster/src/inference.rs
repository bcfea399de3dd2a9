//! Chunked forward passes over host matrices.
//!
//! Rows are uploaded `chunk_rows` at a time. Every pass is deterministic and
//! row-wise (batch normalization uses its running statistics), so outputs do
//! not depend on the chunk size.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{s, Array2, ArrayView2};
use syntof_core::{argmax_rows, ensure_finite, tensor_from_view, tensor_to_array, Result, SyntofError};
use syntof_models::{DeepClusteringModel, DualBranchModel};

/// Default rows per uploaded chunk.
pub const DEFAULT_CHUNK_ROWS: usize = 1 << 16;

fn map_chunks<B, F>(
    features: ArrayView2<'_, f32>,
    out_cols: usize,
    chunk_rows: usize,
    device: &B::Device,
    f: F,
) -> Result<Array2<f32>>
where
    B: Backend,
    F: Fn(Tensor<B, 2>) -> Tensor<B, 2>,
{
    if chunk_rows == 0 {
        return Err(SyntofError::config("chunk size must be positive"));
    }
    let n = features.nrows();
    let mut out = Array2::<f32>::zeros((n, out_cols));
    let mut start = 0;
    while start < n {
        let end = (start + chunk_rows).min(n);
        let x = tensor_from_view::<B>(features.slice(s![start..end, ..]), device);
        let y = tensor_to_array(f(x))?;
        if y.ncols() != out_cols {
            return Err(SyntofError::dims("chunk output width", out_cols, y.ncols()));
        }
        out.slice_mut(s![start..end, ..]).assign(&y);
        start = end;
    }
    Ok(out)
}

/// Joint embedding `[N, h_a + h_b]`.
pub fn embed<B: Backend>(
    model: &DualBranchModel<B>,
    features: ArrayView2<'_, f32>,
    chunk_rows: usize,
    device: &B::Device,
) -> Result<Array2<f32>> {
    model.check_shared_input(features.ncols())?;
    let out = map_chunks(features, model.embedding_dim(), chunk_rows, device, |x| model.embed(x))?;
    ensure_finite(out.iter(), "joint embedding")?;
    Ok(out)
}

/// Soft assignments `Q [N, K]`.
pub fn soft_assignments<B: Backend>(
    model: &DeepClusteringModel<B>,
    features: ArrayView2<'_, f32>,
    chunk_rows: usize,
    device: &B::Device,
) -> Result<Array2<f32>> {
    model.embedding.check_shared_input(features.ncols())?;
    let out = map_chunks(features, model.n_clusters(), chunk_rows, device, |x| model.predict_q(x))?;
    ensure_finite(out.iter(), "soft assignment")?;
    Ok(out)
}

/// Hard labels, the row-wise argmax of `Q`.
pub fn predict_labels<B: Backend>(
    model: &DeepClusteringModel<B>,
    features: ArrayView2<'_, f32>,
    chunk_rows: usize,
    device: &B::Device,
) -> Result<Vec<usize>> {
    let q = soft_assignments(model, features, chunk_rows, device)?;
    Ok(argmax_rows(q.view()))
}
