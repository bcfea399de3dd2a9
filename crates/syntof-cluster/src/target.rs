//! Sharpened target distributions for self-training.
//!
//! ```text
//! w[i,j] = q[i,j]^2 / sum_i q[i,j]        p[i,j] = w[i,j] / sum_j w[i,j]
//! ```
//!
//! The weighted form scales column `j` of `Q` by a priority `u[j]` first; `u` is
//! a sorted, normalized draw of `K` unit exponentials, so later clusters are
//! favoured.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::Exp1;
use serde::{Deserialize, Serialize};
use syntof_core::{ensure_finite, Result, SyntofError, EPSILON};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Standard,
    /// Priority-weighted; fresh weights are drawn at every refresh.
    Weighted,
}

/// `P` from a row-stochastic `Q [N, K]`.
pub fn target_distribution(q: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
    ensure_finite(q.iter(), "soft assignment")?;
    sharpen(q.to_owned())
}

/// `P` from `Q` scaled column-wise by `weights [K]`.
pub fn weighted_target_distribution(q: ArrayView2<'_, f32>, weights: &Array1<f32>) -> Result<Array2<f32>> {
    if weights.len() != q.ncols() {
        return Err(SyntofError::dims("priority weights", q.ncols(), weights.len()));
    }
    ensure_finite(q.iter(), "soft assignment")?;
    sharpen(&q * &weights.view().insert_axis(Axis(0)))
}

/// Sorted unit-exponential draws normalized to sum to one.
pub fn priority_weights<R: Rng + ?Sized>(n_clusters: usize, rng: &mut R) -> Array1<f32> {
    let mut draws: Vec<f64> = (0..n_clusters).map(|_| rng.sample(Exp1)).collect();
    draws.sort_by(f64::total_cmp);
    let total: f64 = draws.iter().sum::<f64>().max(EPSILON);
    draws.into_iter().map(|u| (u / total) as f32).collect()
}

fn sharpen(mut q: Array2<f32>) -> Result<Array2<f32>> {
    q.mapv_inplace(|v| v * v);
    let column_sums = q.sum_axis(Axis(0)).mapv(|s| s + EPSILON as f32);
    q /= &column_sums.insert_axis(Axis(0));
    let row_sums = q.sum_axis(Axis(1)).mapv(|s| s + EPSILON as f32);
    q /= &row_sums.insert_axis(Axis(1));
    ensure_finite(q.iter(), "target distribution")?;
    Ok(q)
}
