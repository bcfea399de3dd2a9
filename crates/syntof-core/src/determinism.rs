//! Deterministic seeding for repetitions.
//!
//! Every random draw in a training run (weight initialization, k-means restarts,
//! subsampling, noise stages, priority weights) comes from a stream split off one
//! repetition seed. Nothing here touches process-wide state: a
//! [`DeterminismConfig`] is passed into each training entry point and
//! [`DeterminismConfig::apply`] returns a [`DeterminismScope`] that pins the
//! numeric thread count only for the closures run inside it.
//!
//! ```rust
//! use syntof_core::determinism::{DeterminismConfig, RngStream};
//! use rand::Rng;
//!
//! let config = DeterminismConfig::for_repetition(3);
//! let mut a = config.rng(RngStream::KMeans);
//! let mut b = config.rng(RngStream::KMeans);
//! assert_eq!(a.gen::<u64>(), b.gen::<u64>());
//! ```

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyntofError};

/// Multiplier applied to the repetition index to obtain its seed.
pub const REPETITION_SEED_STRIDE: u64 = 42;

/// An RNG key for deterministic random number generation.
///
/// Keys are plain u64 seeds; splitting runs ChaCha8 over the seed so children
/// are independent of each other and reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey(pub u64);

impl RngKey {
    pub fn new(seed: u64) -> Self {
        RngKey(seed)
    }

    /// Split this key into `n` independent keys.
    pub fn split(self, n: usize) -> Vec<RngKey> {
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![self];
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.0);
        (0..n).map(|_| RngKey(rng.next_u64())).collect()
    }

    /// Derive the child key for a named stream.
    pub fn fold_in(self, stream: u64) -> RngKey {
        let mixed = self.0 ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        RngKey(ChaCha8Rng::seed_from_u64(mixed).next_u64())
    }

    pub fn seed(&self) -> u64 {
        self.0
    }

    pub fn rng(&self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.0)
    }
}

/// Independent random streams used inside one repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RngStream {
    Weights,
    KMeans,
    Subsample,
    Noise,
    Priority,
    Shuffle,
}

impl RngStream {
    const fn id(self) -> u64 {
        match self {
            RngStream::Weights => 1,
            RngStream::KMeans => 2,
            RngStream::Subsample => 3,
            RngStream::Noise => 4,
            RngStream::Priority => 5,
            RngStream::Shuffle => 6,
        }
    }
}

/// Seed and thread budget for one training call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismConfig {
    pub seed: u64,
    /// Worker threads for data-parallel numeric work inside the scope.
    pub threads: usize,
}

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self { seed: 1, threads: 1 }
    }
}

impl DeterminismConfig {
    pub const fn new(seed: u64) -> Self {
        Self { seed, threads: 1 }
    }

    /// Seed derived from the repetition index (`42 * i`).
    pub const fn for_repetition(repetition: usize) -> Self {
        Self::new(REPETITION_SEED_STRIDE * repetition as u64)
    }

    pub const fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn key(&self) -> RngKey {
        RngKey::new(self.seed)
    }

    /// Fresh generator for a stream; identical calls yield identical sequences.
    pub fn rng(&self, stream: RngStream) -> ChaCha8Rng {
        self.key().fold_in(stream.id()).rng()
    }

    /// Seed for a stream, for APIs that take a raw seed.
    pub fn stream_seed(&self, stream: RngStream) -> u64 {
        self.key().fold_in(stream.id()).seed()
    }

    /// Enter the scope: a dedicated thread pool sized to `threads`.
    ///
    /// The pool is torn down when the scope is dropped.
    pub fn apply(&self) -> Result<DeterminismScope> {
        if self.threads == 0 {
            return Err(SyntofError::config("determinism threads must be >= 1"));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("syntof-det-{i}"))
            .build()
            .map_err(|e| SyntofError::config(format!("thread pool: {e}")))?;
        tracing::debug!(seed = self.seed, threads = self.threads, "determinism scope entered");
        Ok(DeterminismScope {
            config: *self,
            pool,
        })
    }
}

/// Active determinism settings; see [`DeterminismConfig::apply`].
pub struct DeterminismScope {
    config: DeterminismConfig,
    pool: rayon::ThreadPool,
}

impl DeterminismScope {
    /// Run `f` with rayon work confined to this scope's pool.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(f)
    }

    pub fn config(&self) -> &DeterminismConfig {
        &self.config
    }

    pub fn rng(&self, stream: RngStream) -> ChaCha8Rng {
        self.config.rng(stream)
    }
}

impl Drop for DeterminismScope {
    fn drop(&mut self) {
        tracing::debug!(seed = self.config.seed, "determinism scope exited");
    }
}
