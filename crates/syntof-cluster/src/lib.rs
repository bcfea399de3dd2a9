//! # syntof-cluster
//!
//! Clustering algorithms and training loops for synTOF deep clustering.
//!
//! - [`kmeans`]: exact (Lloyd + k-means++) and mini-batch k-means on host arrays
//! - [`target`]: the sharpened target distribution `P`, optionally weighted by
//!   sorted exponential cluster priorities
//! - [`piecewise`]: continuous piecewise-linear least-squares fits
//! - [`bayes_opt`]: Gaussian-process Bayesian optimization over an integer range
//! - [`selector`]: elbow-based cluster-count selection on an embedding
//! - [`pretrain`]: per-branch autoencoder pretraining with early stopping
//! - [`trainer`]: the deep-clustering state machine
//! - [`inference`]: chunked embedding, soft assignment and label prediction
//!
//! ## Workflow
//!
//! ```rust,ignore
//! use syntof_cluster::{
//!     fit_clustering, inference, select_cluster_count, ClusteringConfig,
//!     OrderSelectionConfig, PretrainConfig, Pretrainer,
//! };
//! use syntof_core::DeterminismConfig;
//! use syntof_observers::TracingObserver;
//!
//! let determinism = DeterminismConfig::for_repetition(3);
//! let pretrainer = Pretrainer::new(PretrainConfig::default(), determinism, &device);
//! let (dual, reports) = pretrainer.fit_dual(&spec_a, &spec_b, features.view(), 3, &mut TracingObserver::default())?;
//!
//! let hidden = inference::embed(&dual.valid(), features.view(), inference::DEFAULT_CHUNK_ROWS, &device)?;
//! let selection = select_cluster_count(hidden.view(), &OrderSelectionConfig::default())?;
//!
//! let config = ClusteringConfig::new(selection.k);
//! let result = fit_clustering(dual, features.view(), &config, &determinism, &mut TracingObserver::default(), &device)?;
//! println!("{} clusters, stopped: {:?}", result.occupied_clusters(), result.stop);
//! ```

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub mod bayes_opt;
pub mod inference;
pub mod kmeans;
pub mod piecewise;
pub mod plot;
pub mod pretrain;
pub mod selector;
pub mod target;
pub mod trainer;

pub use bayes_opt::*;
pub use kmeans::{KMeansConfig, KMeansFit, KMeansVariant};
pub use piecewise::*;
pub use plot::*;
pub use pretrain::*;
pub use selector::*;
pub use target::*;
pub use trainer::*;
