//! Distortion-curve diagnostic plot.

use std::path::Path;

use plotters::prelude::*;
use syntof_core::{Result, SyntofError};

use crate::selector::OrderSelection;

/// Points sampled along the fitted piecewise model.
const CURVE_POINTS: usize = 1000;

fn plot_error<E: std::fmt::Display>(e: E) -> SyntofError {
    SyntofError::Io(std::io::Error::other(e.to_string()))
}

/// Observed distortions as markers, the fitted model as a line, and the
/// selected order as a vertical rule.
pub fn plot_distortion(selection: &OrderSelection, path: &Path) -> Result<()> {
    let x_min = selection.candidates.first().copied().unwrap_or(0) as f64;
    let x_max = selection.candidates.last().copied().unwrap_or(1) as f64;
    let y_max = selection
        .raw_distortions
        .iter()
        .copied()
        .fold(0.0f64, f64::max);
    let y_min = selection
        .distortions
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min)
        .min(y_max);
    let pad = ((y_max - y_min) * 0.1).max(1e-6);

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(format!("Distortion, selected K = {}", selection.k), ("sans-serif", 30))
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, (y_min - pad)..(y_max + pad))
        .map_err(plot_error)?;

    chart
        .configure_mesh()
        .x_desc("K")
        .y_desc("Mean distance to centroid")
        .x_label_formatter(&|x| format!("{:.0}", x))
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(
            selection
                .candidates
                .iter()
                .zip(&selection.raw_distortions)
                .map(|(&k, &d)| Circle::new((k as f64, d), 4, BLUE.filled())),
        )
        .map_err(plot_error)?;

    chart
        .draw_series(LineSeries::new(
            (0..=CURVE_POINTS).map(|i| {
                let x = x_min + (x_max - x_min) * i as f64 / CURVE_POINTS as f64;
                (x, selection.model.predict(x))
            }),
            &RED,
        ))
        .map_err(plot_error)?;

    let k = selection.k as f64;
    chart
        .draw_series(LineSeries::new(vec![(k, y_min - pad), (k, y_max + pad)], BLACK.mix(0.5)))
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    tracing::debug!(path = %path.display(), "wrote distortion plot");
    Ok(())
}
