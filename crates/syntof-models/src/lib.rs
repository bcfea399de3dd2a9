//! # syntof-models
//!
//! Burn modules for synTOF deep clustering.
//!
//! - [`architecture`]: [`ArchitectureSpec`] with typed [`LayerRecord`]s and
//!   named variants
//! - [`regularization`]: fixed-order [`RegularizationStage`] list (noise,
//!   dropouts, batch normalization, L2-normalized bottleneck)
//! - [`autoencoder`]: the symmetric [`Autoencoder`] module
//! - [`dual`]: [`DualBranchModel`], two autoencoders joined at the bottleneck
//! - [`soft_assignment`]: the Student's-t [`SoftAssignment`] layer
//! - [`joint`]: [`DeepClusteringModel`], embedding plus soft assignment
//! - [`checkpoint`]: SafeTensors [`WeightStore`] keyed by identifier and repetition
//!
//! ```rust,ignore
//! use syntof_models::{ArchitectureSpec, AutoencoderVariant, DualBranchModel};
//!
//! let spec_a = ArchitectureSpec::new(vec![30, 512, 256, 128, 10]).with_seed(84);
//! let spec_b = ArchitectureSpec::variant(vec![30, 512, 256, 128, 5], AutoencoderVariant::Noise);
//! let model = DualBranchModel::new(spec_a.build(&device)?, spec_b.build(&device)?);
//! let embedding = model.embed(features); // [N, 15]
//! ```

#![recursion_limit = "256"]
#![allow(clippy::must_use_candidate)]

pub mod architecture;
pub mod autoencoder;
pub mod checkpoint;
pub mod dual;
pub mod init;
pub mod joint;
pub mod regularization;
pub mod soft_assignment;

pub use architecture::*;
pub use autoencoder::*;
pub use checkpoint::*;
pub use dual::*;
pub use init::*;
pub use joint::*;
pub use regularization::*;
pub use soft_assignment::*;
