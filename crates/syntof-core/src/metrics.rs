//! Clustering and reconstruction metrics.
//!
//! - [`normalized_mutual_info`]: agreement between two labelings, arithmetic normalization
//! - [`stability_matrix`]: pairwise NMI across repetitions
//! - [`r_square`]: coefficient of determination for reconstructions
//! - [`delta_label`]: fraction of points whose hard label changed

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};

use crate::error::{Result, SyntofError};
use crate::EPSILON;

/// Normalized mutual information with arithmetic-mean normalization.
///
/// ```text
/// NMI = I(U; V) / ((H(U) + H(V)) / 2)
/// ```
///
/// Two single-cluster labelings are identical and score 1.
pub fn normalized_mutual_info(a: &[usize], b: &[usize]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(SyntofError::dims("normalized_mutual_info", a.len(), b.len()));
    }
    let n = a.len();
    if n == 0 {
        return Ok(1.0);
    }

    let mut joint: HashMap<(usize, usize), usize> = HashMap::new();
    let mut count_a: HashMap<usize, usize> = HashMap::new();
    let mut count_b: HashMap<usize, usize> = HashMap::new();
    for (&u, &v) in a.iter().zip(b.iter()) {
        *joint.entry((u, v)).or_default() += 1;
        *count_a.entry(u).or_default() += 1;
        *count_b.entry(v).or_default() += 1;
    }

    let nf = n as f64;
    let entropy = |counts: &HashMap<usize, usize>| -> f64 {
        counts
            .values()
            .map(|&c| {
                let p = c as f64 / nf;
                -p * p.ln()
            })
            .sum()
    };
    let h_a = entropy(&count_a);
    let h_b = entropy(&count_b);

    if count_a.len() == 1 && count_b.len() == 1 {
        return Ok(1.0);
    }

    let mut mi = 0.0;
    for (&(u, v), &c) in &joint {
        let p_uv = c as f64 / nf;
        let p_u = count_a[&u] as f64 / nf;
        let p_v = count_b[&v] as f64 / nf;
        mi += p_uv * (p_uv / (p_u * p_v)).ln();
    }

    let denom = 0.5 * (h_a + h_b);
    if denom <= f64::EPSILON {
        return Ok(1.0);
    }
    Ok((mi / denom).clamp(0.0, 1.0))
}

/// Symmetric matrix of pairwise NMI between labelings (diagonal is 1).
pub fn stability_matrix(labelings: &[Vec<usize>]) -> Result<Array2<f64>> {
    let r = labelings.len();
    let mut out = Array2::<f64>::eye(r);
    for i in 0..r {
        for j in (i + 1)..r {
            let score = normalized_mutual_info(&labelings[i], &labelings[j])?;
            out[[i, j]] = score;
            out[[j, i]] = score;
        }
    }
    Ok(out)
}

/// Coefficient of determination over all entries.
///
/// ```text
/// R² = 1 - SS_res / (SS_tot + eps)
/// ```
/// where `SS_tot` is taken around the per-column mean of `truth`.
pub fn r_square(truth: ArrayView2<'_, f32>, prediction: ArrayView2<'_, f32>) -> Result<f64> {
    if truth.dim() != prediction.dim() {
        return Err(SyntofError::dims("r_square", truth.ncols(), prediction.ncols()));
    }
    let mut ss_res = 0.0f64;
    let mut ss_tot = 0.0f64;
    for (col_t, col_p) in truth.columns().into_iter().zip(prediction.columns()) {
        let mean = col_t.iter().map(|&v| v as f64).sum::<f64>() / col_t.len().max(1) as f64;
        for (&t, &p) in col_t.iter().zip(col_p.iter()) {
            ss_res += (t as f64 - p as f64).powi(2);
            ss_tot += (t as f64 - mean).powi(2);
        }
    }
    Ok(1.0 - ss_res / (ss_tot + EPSILON))
}

/// Fraction of positions where the two label vectors differ.
pub fn delta_label(previous: &[usize], current: &[usize]) -> Result<f64> {
    if previous.len() != current.len() {
        return Err(SyntofError::dims("delta_label", previous.len(), current.len()));
    }
    if current.is_empty() {
        return Ok(0.0);
    }
    let changed = previous.iter().zip(current).filter(|(a, b)| a != b).count();
    Ok(changed as f64 / current.len() as f64)
}

/// Row-wise argmax.
pub fn argmax_rows(values: ArrayView2<'_, f32>) -> Vec<usize> {
    values
        .outer_iter()
        .map(|row| {
            let mut best = 0;
            let mut best_val = f32::NEG_INFINITY;
            for (j, &v) in row.iter().enumerate() {
                if v > best_val {
                    best = j;
                    best_val = v;
                }
            }
            best
        })
        .collect()
}
