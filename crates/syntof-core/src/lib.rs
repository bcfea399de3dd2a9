//! # syntof-core
//!
//! Core types and backend plumbing for the synTOF deep-clustering workspace.
//!
//! This crate provides the pieces every other crate leans on:
//!
//! - [`backend`]: Burn backend aliases (`NdArray` on CPU, `Wgpu` behind the `gpu`
//!   feature) and host <-> tensor conversions
//! - [`preprocess`]: [`FeatureMatrix`] assembly with a channel denylist and a
//!   [`StandardScaler`] that is fit once and re-applied to held-out data
//! - [`determinism`]: [`RngKey`] splitting and the scoped [`DeterminismConfig`]
//! - [`distance`]: point-to-centroid distances and the Student's-t kernel
//! - [`metrics`]: normalized mutual information, R² and label-change rate
//! - [`config`]: data/output/weights directory configuration
//! - [`error`]: the [`SyntofError`] type returned by all library crates
//!
//! ## Backends
//!
//! ```rust,ignore
//! use syntof_core::backend::{init_cpu_device, TrainBackend};
//!
//! let device = init_cpu_device();
//! // Models are generic over `B: Backend`; training runs on `TrainBackend`.
//! ```

#![recursion_limit = "256"] // Required for burn-wgpu

pub mod backend;
pub mod config;
pub mod determinism;
pub mod distance;
pub mod error;
pub mod metrics;
pub mod preprocess;

pub use backend::*;
pub use config::*;
pub use determinism::*;
pub use distance::*;
pub use error::*;
pub use metrics::*;
pub use preprocess::*;

/// Guard added to every normalization denominator.
pub const EPSILON: f64 = 1e-7;
