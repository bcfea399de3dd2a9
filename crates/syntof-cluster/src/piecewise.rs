//! Continuous piecewise-linear least-squares fits.
//!
//! A fit with `s` segments over `x` in `[x0, xn]` has breakpoints
//! `x0 = b0 < b1 < ... < bs = xn` and the model
//!
//! ```text
//! y(x) = c0 + c1 (x - x0) + sum_{j=1}^{s-1} c_{j+1} max(0, x - b_j)
//! ```
//!
//! Interior breakpoints are located by an exhaustive search over a uniform
//! grid followed by compass-search refinement; coefficients are the SVD
//! least-squares solution for the chosen breakpoints.

use nalgebra::{DMatrix, DVector};
use syntof_core::{Result, SyntofError};

/// Grid intervals across `[x0, xn]` for the coarse breakpoint search.
const GRID_INTERVALS: usize = 64;

/// Refinement stops once the step is this fraction of the x range.
const MIN_STEP_FRACTION: f64 = 1e-6;

/// Observations to fit, sorted by `x`.
#[derive(Debug, Clone)]
pub struct PiecewiseLinearFit {
    x: Vec<f64>,
    y: Vec<f64>,
}

/// A fitted piecewise-linear model.
#[derive(Debug, Clone, PartialEq)]
pub struct PiecewiseModel {
    /// Breakpoints including both endpoints, `segments + 1` values.
    pub breaks: Vec<f64>,
    pub coefficients: Vec<f64>,
    /// Sum of squared residuals.
    pub ssr: f64,
}

impl PiecewiseModel {
    pub fn segments(&self) -> usize {
        self.breaks.len() - 1
    }

    pub fn predict(&self, x: f64) -> f64 {
        let x0 = self.breaks[0];
        let interior = &self.breaks[1..self.breaks.len() - 1];
        let mut y = self.coefficients[0] + self.coefficients[1] * (x - x0);
        for (b, c) in interior.iter().zip(&self.coefficients[2..]) {
            y += c * (x - b).max(0.0);
        }
        y
    }
}

impl PiecewiseLinearFit {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() {
            return Err(SyntofError::dims("piecewise fit y", x.len(), y.len()));
        }
        if x.len() < 2 {
            return Err(SyntofError::config("piecewise fit needs at least two points"));
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(SyntofError::NonFinite("piecewise fit input".to_string()));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SyntofError::config("piecewise fit x must be strictly increasing"));
        }
        Ok(Self { x, y })
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    fn x_range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    /// Fit `segments` continuous line segments.
    pub fn fit(&self, segments: usize) -> Result<PiecewiseModel> {
        if segments == 0 {
            return Err(SyntofError::config("piecewise fit needs at least one segment"));
        }
        let interior_count = segments - 1;
        if interior_count > GRID_INTERVALS - 1 {
            return Err(SyntofError::config(format!("{segments} segments exceed the breakpoint grid")));
        }
        let (x0, xn) = self.x_range();

        let mut interior = if interior_count == 0 {
            Vec::new()
        } else {
            let grid: Vec<f64> = (1..GRID_INTERVALS)
                .map(|i| x0 + (xn - x0) * i as f64 / GRID_INTERVALS as f64)
                .collect();
            let mut best = (f64::INFINITY, Vec::new());
            let mut chosen = Vec::with_capacity(interior_count);
            self.grid_search(&grid, 0, interior_count, &mut chosen, &mut best);
            self.refine(best.1, (xn - x0) / GRID_INTERVALS as f64)
        };
        interior.sort_by(f64::total_cmp);

        let (ssr, coefficients) = self.least_squares(&interior);
        if !ssr.is_finite() {
            return Err(SyntofError::NonFinite("piecewise fit residuals".to_string()));
        }
        let mut breaks = Vec::with_capacity(segments + 1);
        breaks.push(x0);
        breaks.extend(interior);
        breaks.push(xn);
        Ok(PiecewiseModel {
            breaks,
            coefficients,
            ssr,
        })
    }

    /// Sum of squared residuals for a set of interior breakpoints.
    pub fn ssr(&self, interior: &[f64]) -> f64 {
        self.least_squares(interior).0
    }

    fn least_squares(&self, interior: &[f64]) -> (f64, Vec<f64>) {
        let x0 = self.x[0];
        let n = self.x.len();
        let design = DMatrix::from_fn(n, interior.len() + 2, |i, j| match j {
            0 => 1.0,
            1 => self.x[i] - x0,
            _ => (self.x[i] - interior[j - 2]).max(0.0),
        });
        let target = DVector::from_column_slice(&self.y);

        match design.clone().svd(true, true).solve(&target, 1e-12) {
            Ok(beta) => {
                let residual = &design * &beta - &target;
                (residual.norm_squared(), beta.iter().copied().collect())
            }
            Err(_) => (f64::INFINITY, vec![0.0; interior.len() + 2]),
        }
    }

    /// Every strictly increasing choice of `remaining` grid points from `start`.
    fn grid_search(
        &self,
        grid: &[f64],
        start: usize,
        remaining: usize,
        chosen: &mut Vec<f64>,
        best: &mut (f64, Vec<f64>),
    ) {
        if remaining == 0 {
            let ssr = self.ssr(chosen);
            if ssr < best.0 {
                *best = (ssr, chosen.clone());
            }
            return;
        }
        for i in start..=grid.len() - remaining {
            chosen.push(grid[i]);
            self.grid_search(grid, i + 1, remaining - 1, chosen, best);
            chosen.pop();
        }
    }

    /// Compass search around a starting set of breakpoints.
    fn refine(&self, mut current: Vec<f64>, initial_step: f64) -> Vec<f64> {
        let (x0, xn) = self.x_range();
        let min_step = (xn - x0) * MIN_STEP_FRACTION;
        let mut current_ssr = self.ssr(&current);
        let mut step = initial_step;

        while step > min_step {
            let mut improved = false;
            for j in 0..current.len() {
                for direction in [1.0, -1.0] {
                    let mut candidate = current.clone();
                    candidate[j] = (candidate[j] + direction * step).clamp(x0, xn);
                    candidate.sort_by(f64::total_cmp);
                    let ssr = self.ssr(&candidate);
                    if ssr < current_ssr {
                        current = candidate;
                        current_ssr = ssr;
                        improved = true;
                    }
                }
            }
            if !improved {
                step /= 2.0;
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn elbow(x: f64) -> f64 {
        if x < 12.0 {
            40.0 - 3.0 * x
        } else {
            4.0 - 0.1 * (x - 12.0)
        }
    }

    #[test]
    fn test_recovers_single_break() {
        let x: Vec<f64> = (5..=30).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|&v| elbow(v)).collect();
        let model = PiecewiseLinearFit::new(x, y).unwrap().fit(2).unwrap();
        assert_eq!(model.segments(), 2);
        assert_relative_eq!(model.breaks[0], 5.0);
        assert_relative_eq!(model.breaks[2], 30.0);
        assert_relative_eq!(model.breaks[1], 12.0, epsilon = 1e-3);
        assert!(model.ssr < 1e-6);
        assert_relative_eq!(model.predict(20.0), elbow(20.0), epsilon = 1e-4);
    }

    #[test]
    fn test_more_segments_never_worse() {
        let x: Vec<f64> = (5..=25).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|&v| 10.0 / v + 0.01 * v).collect();
        let fit = PiecewiseLinearFit::new(x, y).unwrap();
        let one = fit.fit(1).unwrap();
        let two = fit.fit(2).unwrap();
        let three = fit.fit(3).unwrap();
        assert!(two.ssr <= one.ssr + 1e-12);
        assert!(three.ssr <= two.ssr + 1e-12);
        assert!(three.breaks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_single_segment_is_line() {
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let y = vec![2.0, 4.0, 6.0, 8.0];
        let model = PiecewiseLinearFit::new(x, y).unwrap().fit(1).unwrap();
        assert_eq!(model.breaks, vec![1.0, 4.0]);
        assert_relative_eq!(model.coefficients[1], 2.0, epsilon = 1e-9);
        assert!(model.ssr < 1e-12);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(PiecewiseLinearFit::new(vec![1.0], vec![1.0]).is_err());
        assert!(PiecewiseLinearFit::new(vec![2.0, 1.0], vec![1.0, 1.0]).is_err());
        assert!(PiecewiseLinearFit::new(vec![1.0, 2.0], vec![1.0, f64::NAN]).is_err());
    }
}
