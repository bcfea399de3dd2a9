//! Feature matrix assembly and standardization.
//!
//! Raw per-sample event matrices are concatenated into one [`FeatureMatrix`]
//! after dropping denylisted channels. A [`StandardScaler`] is fit once on a
//! reference matrix and then re-applied unchanged to any later matrix; applying
//! it to a matrix with different columns fails before touching any value.

use ndarray::{concatenate, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyntofError};
use crate::EPSILON;

/// Channels excluded from clustering in the reference pipeline.
pub const DEFAULT_DENYLIST: [&str; 10] = [
    "b-Amyloid_X40",
    "b-Amyloid_X42",
    "p-Tau",
    "a-Synuclein_pS129",
    "EAAT1",
    "GFAP",
    "Casp3_Acti",
    "3NT",
    "LC3B",
    "K48-Ubiquitin",
];

/// Events from one source (one sample file), columns named by channel.
#[derive(Debug, Clone)]
pub struct EventMatrix {
    pub source: String,
    pub columns: Vec<String>,
    pub values: Array2<f32>,
}

impl EventMatrix {
    pub fn new(source: impl Into<String>, columns: Vec<String>, values: Array2<f32>) -> Result<Self> {
        if values.ncols() != columns.len() {
            return Err(SyntofError::dims("event matrix columns", columns.len(), values.ncols()));
        }
        Ok(Self {
            source: source.into(),
            columns,
            values,
        })
    }

    /// Sample identity: the part of the source name after the last `_`, without extension.
    pub fn sample_id(&self) -> String {
        sample_id_from_source(&self.source)
    }
}

/// Derive a sample identity from a file name such as `batch3_ctrl_S12.csv` -> `S12`.
pub fn sample_id_from_source(source: &str) -> String {
    let file = source.rsplit(['/', '\\']).next().unwrap_or(source);
    let stem = match file.rfind('.') {
        Some(idx) if idx > 0 => &file[..idx],
        _ => file,
    };
    stem.rsplit('_').next().unwrap_or(stem).to_string()
}

/// N x D matrix with named columns and a per-row sample identity.
#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f32>,
    pub sample: Vec<String>,
}

impl FeatureMatrix {
    /// Concatenate sources row-wise, dropping denylisted channels.
    ///
    /// All sources must share the same column list (after filtering).
    pub fn concatenate<S: AsRef<str>>(sources: &[EventMatrix], denylist: &[S]) -> Result<Self> {
        let first = sources
            .first()
            .ok_or_else(|| SyntofError::config("no event matrices to concatenate"))?;

        let keep: Vec<usize> = first
            .columns
            .iter()
            .enumerate()
            .filter(|(_, name)| !denylist.iter().any(|d| d.as_ref() == name.as_str()))
            .map(|(i, _)| i)
            .collect();
        let columns: Vec<String> = keep.iter().map(|&i| first.columns[i].clone()).collect();

        let mut blocks = Vec::with_capacity(sources.len());
        let mut sample = Vec::new();
        for source in sources {
            if source.columns != first.columns {
                return Err(SyntofError::SchemaMismatch {
                    expected: first.columns.clone(),
                    actual: source.columns.clone(),
                });
            }
            blocks.push(source.values.select(Axis(1), &keep));
            let id = source.sample_id();
            sample.extend(std::iter::repeat(id).take(source.values.nrows()));
        }

        let views: Vec<_> = blocks.iter().map(|b| b.view()).collect();
        let values = concatenate(Axis(0), &views).map_err(|e| SyntofError::Tensor(e.to_string()))?;
        tracing::debug!(rows = values.nrows(), cols = values.ncols(), sources = sources.len(), "feature matrix assembled");

        Ok(Self {
            columns,
            values,
            sample,
        })
    }

    /// Wrap an unnamed matrix with generated column names.
    pub fn from_values(values: Array2<f32>) -> Self {
        let columns = (0..values.ncols()).map(|i| format!("f{i}")).collect();
        let sample = vec![String::from("0"); values.nrows()];
        Self {
            columns,
            values,
            sample,
        }
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }
}

/// Per-column standardization (zero mean, unit population variance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub columns: Vec<String>,
    pub mean: Array1<f32>,
    pub scale: Array1<f32>,
}

impl StandardScaler {
    /// Fit on a reference matrix. Constant columns get scale 1.
    pub fn fit(matrix: &FeatureMatrix) -> Result<Self> {
        let n = matrix.n_rows();
        if n == 0 {
            return Err(SyntofError::config("cannot fit a scaler on zero rows"));
        }
        let d = matrix.n_features();
        let mut mean = Array1::<f32>::zeros(d);
        let mut scale = Array1::<f32>::ones(d);
        for (j, col) in matrix.values.columns().into_iter().enumerate() {
            let m = col.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
            let var = col.iter().map(|&v| (v as f64 - m).powi(2)).sum::<f64>() / n as f64;
            let std = var.sqrt();
            mean[j] = m as f32;
            scale[j] = if std < EPSILON { 1.0 } else { std as f32 };
        }
        Ok(Self {
            columns: matrix.columns.clone(),
            mean,
            scale,
        })
    }

    fn check_schema(&self, matrix: &FeatureMatrix) -> Result<()> {
        if matrix.columns != self.columns {
            return Err(SyntofError::SchemaMismatch {
                expected: self.columns.clone(),
                actual: matrix.columns.clone(),
            });
        }
        Ok(())
    }

    pub fn transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.check_schema(matrix)?;
        let values = (&matrix.values - &self.mean.view().insert_axis(Axis(0)))
            / &self.scale.view().insert_axis(Axis(0));
        Ok(FeatureMatrix {
            columns: matrix.columns.clone(),
            values,
            sample: matrix.sample.clone(),
        })
    }

    pub fn inverse_transform(&self, matrix: &FeatureMatrix) -> Result<FeatureMatrix> {
        self.check_schema(matrix)?;
        let values = &matrix.values * &self.scale.view().insert_axis(Axis(0))
            + &self.mean.view().insert_axis(Axis(0));
        Ok(FeatureMatrix {
            columns: matrix.columns.clone(),
            values,
            sample: matrix.sample.clone(),
        })
    }

    pub fn fit_transform(matrix: &FeatureMatrix) -> Result<(Self, FeatureMatrix)> {
        let scaler = Self::fit(matrix)?;
        let scaled = scaler.transform(matrix)?;
        Ok((scaler, scaled))
    }
}
