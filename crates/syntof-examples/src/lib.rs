//! # syntof-examples
//!
//! Pipeline orchestration, CSV exchange and synthetic data for the synTOF
//! binaries.
//!
//! - [`pipeline`]: [`PipelineConfig`] (TOML) and the repetition-parallel
//!   [`Pipeline`] stages `pretrain`, `select_cluster_counts`, `fit_predict`,
//!   `predict` and `hidden`
//! - [`io`]: event CSV import; labels, hidden and cluster-count tables
//! - [`synthetic`]: Gaussian blobs with known membership for demos and tests

pub mod io;
pub mod pipeline;
pub mod synthetic;

pub use pipeline::*;
pub use synthetic::*;
