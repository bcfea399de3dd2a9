//! Error type shared by the synTOF library crates.

use std::path::PathBuf;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyntofError>;

/// Fatal conditions raised by the deep-clustering core.
#[derive(Debug, thiserror::Error)]
pub enum SyntofError {
    /// Apply-time columns differ from the columns a transform was fit on.
    #[error("column schema mismatch: fitted on {expected:?}, got {actual:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    /// A matrix does not have the width a component was built for.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// No persisted weights exist for the requested key.
    #[error("missing {kind} weights for '{identifier}' repetition {repetition}: {path}")]
    MissingWeights {
        kind: String,
        identifier: String,
        repetition: usize,
        path: PathBuf,
    },

    /// Persisted weights exist but cannot be loaded into the requested architecture.
    #[error("incompatible weights in {path}: {reason}")]
    IncompatibleWeights { path: PathBuf, reason: String },

    /// NaN or infinite values surfaced in a numeric result.
    #[error("non-finite values in {0}")]
    NonFinite(String),

    /// A configuration value is out of its valid domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Tensor data could not be converted between host and device.
    #[error("tensor conversion failed: {0}")]
    Tensor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyntofError {
    /// Shorthand for [`SyntofError::InvalidConfig`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Shorthand for [`SyntofError::DimensionMismatch`].
    pub fn dims(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }
}

/// Fails with [`SyntofError::NonFinite`] if any value is NaN or infinite.
pub fn ensure_finite<'a, I>(values: I, what: &str) -> Result<()>
where
    I: IntoIterator<Item = &'a f32>,
{
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(SyntofError::NonFinite(what.to_string()))
    }
}
