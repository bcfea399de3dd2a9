//! # syntof-observers
//!
//! Observation hooks for the synTOF training loops.
//!
//! Observers collect data during autoencoder pretraining and deep-clustering
//! refinement without changing either loop. The pretraining loop calls
//! [`TrainingObserver::on_epoch`] once per epoch; the clustering trainer calls
//! [`TrainingObserver::on_refresh`] at every target refresh and
//! [`TrainingObserver::on_finish`] once it stops.
//!
//! ```rust,ignore
//! use syntof_observers::{HistoryObserver, TracingObserver};
//!
//! let mut observer = (HistoryObserver::new(), TracingObserver::default());
//! let result = trainer.fit(&features, &mut observer)?;
//! let history = observer.0.into_history();
//! ```

#![allow(clippy::must_use_candidate)] // getters

pub mod history;
pub mod observer;

pub use history::*;
pub use observer::*;
