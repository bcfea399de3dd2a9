//! Deep embedded clustering: self-training of the joint model against a
//! sharpened target distribution.
//!
//! ```text
//! Init -> CentroidSeeding -> Refresh -> BatchTrain -> ... -> Refresh -> ...
//!                                 |                    |
//!                             Converged          MaxIterReached
//! ```
//!
//! - `Init`: joint embedding of the full matrix from the current branches
//! - `CentroidSeeding`: k-means on the embedding, optionally relabelled by
//!   descending population, copied into the soft-assignment layer
//! - `Refresh`: `Q` for every row, target `P`, hard labels and the fraction of
//!   labels that changed; after the first refresh a change below `tol` ends
//!   training
//! - `BatchTrain`: one optimizer step on the next contiguous chunk of rows;
//!   the chunk pointer wraps after the last (possibly shorter) chunk
//!
//! The loss is `w_c KL(P || Q) + w_a MSE_a + w_b MSE_b`. Labels returned are
//! those of the last refresh.

use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use syntof_core::{
    argmax_rows, delta_label, tensor_from_array, tensor_from_view, DeterminismConfig, Result, RngStream,
    SyntofError, EPSILON,
};
use syntof_models::{DeepClusteringModel, DualBranchModel, SoftAssignment};
use syntof_observers::{
    FinishRecord, HistoryObserver, LossBreakdown, RefreshRecord, StopReason, TrainingHistory, TrainingObserver,
};

use crate::inference::{self, DEFAULT_CHUNK_ROWS};
use crate::kmeans::{self, KMeansConfig, KMeansVariant};
use crate::target::{priority_weights, target_distribution, weighted_target_distribution, TargetKind};

/// Relative weights of the three loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub clustering: f64,
    pub reconstruction_a: f64,
    pub reconstruction_b: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            clustering: 0.5,
            reconstruction_a: 0.25,
            reconstruction_b: 0.25,
        }
    }
}

impl LossWeights {
    /// Every term at one half.
    pub const fn balanced() -> Self {
        Self {
            clustering: 0.5,
            reconstruction_a: 0.5,
            reconstruction_b: 0.5,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.clustering, self.reconstruction_a, self.reconstruction_b];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(SyntofError::config(format!("loss weights must be non-negative, got {all:?}")));
        }
        Ok(())
    }
}

/// How the centroids are initialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedingConfig {
    pub variant: KMeansVariant,
    pub n_init: usize,
    /// Relabel so centroid 0 holds the most points.
    pub reorder_by_population: bool,
}

impl Default for SeedingConfig {
    fn default() -> Self {
        Self {
            variant: KMeansVariant::Exact,
            n_init: 5,
            reorder_by_population: false,
        }
    }
}

impl SeedingConfig {
    /// Mini-batch k-means with population ordering.
    pub const fn mini_batch() -> Self {
        Self {
            variant: KMeansVariant::MiniBatch { batch_size: 1024 },
            n_init: 3,
            reorder_by_population: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub n_clusters: usize,
    /// Label-change fraction below which training stops.
    pub tol: f64,
    pub update_interval: usize,
    pub max_iter: usize,
    pub batch_size: usize,
    pub loss_weights: LossWeights,
    pub seeding: SeedingConfig,
    pub target: TargetKind,
    pub learning_rate: f64,
    /// Student's-t degrees of freedom.
    pub alpha: f64,
    /// Rows per forward pass when recomputing `Q` for the whole matrix.
    pub predict_chunk_rows: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            n_clusters: 15,
            tol: 0.03,
            update_interval: 140,
            max_iter: 20_000,
            batch_size: 256,
            loss_weights: LossWeights::default(),
            seeding: SeedingConfig::default(),
            target: TargetKind::Standard,
            learning_rate: 1e-3,
            alpha: 1.0,
            predict_chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }
}

impl ClusteringConfig {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            ..Default::default()
        }
    }

    pub const fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub const fn with_update_interval(mut self, update_interval: usize) -> Self {
        self.update_interval = update_interval;
        self
    }

    pub const fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_loss_weights(mut self, loss_weights: LossWeights) -> Self {
        self.loss_weights = loss_weights;
        self
    }

    pub const fn with_seeding(mut self, seeding: SeedingConfig) -> Self {
        self.seeding = seeding;
        self
    }

    pub const fn with_target(mut self, target: TargetKind) -> Self {
        self.target = target;
        self
    }

    pub const fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn validate(&self, n_rows: usize) -> Result<()> {
        if self.n_clusters == 0 || self.n_clusters > n_rows {
            return Err(SyntofError::config(format!(
                "{} clusters requested for {n_rows} rows",
                self.n_clusters
            )));
        }
        if self.update_interval == 0 || self.batch_size == 0 || self.predict_chunk_rows == 0 {
            return Err(SyntofError::config("update interval, batch size and chunk size must be positive"));
        }
        if self.alpha <= 0.0 || self.learning_rate <= 0.0 {
            return Err(SyntofError::config("alpha and learning rate must be positive"));
        }
        self.loss_weights.validate()
    }
}

/// Phases of the clustering loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerState {
    Init,
    CentroidSeeding,
    Refresh,
    BatchTrain,
    Converged,
    MaxIterReached,
}

impl TrainerState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, TrainerState::Converged | TrainerState::MaxIterReached)
    }
}

/// Outcome of [`fit_clustering`].
#[derive(Debug)]
pub struct ClusteringResult<B: AutodiffBackend> {
    pub labels: Vec<usize>,
    /// k-means labels the centroids were seeded from.
    pub seeding_labels: Vec<usize>,
    pub model: DeepClusteringModel<B>,
    pub stop: StopReason,
    pub iterations: usize,
    pub history: TrainingHistory,
}

impl<B: AutodiffBackend> ClusteringResult<B> {
    pub fn converged(&self) -> bool {
        self.stop == StopReason::Converged
    }

    /// Clusters holding at least one row.
    pub fn occupied_clusters(&self) -> usize {
        occupied(&self.labels, self.model.n_clusters())
    }
}

fn occupied(labels: &[usize], n_clusters: usize) -> usize {
    let mut seen = vec![false; n_clusters];
    for &label in labels {
        seen[label] = true;
    }
    seen.into_iter().filter(|&s| s).count()
}

/// Running means of the loss terms between refreshes.
#[derive(Debug, Default)]
struct LossAccumulator {
    sum: LossBreakdown,
    batches: usize,
}

impl LossAccumulator {
    fn add(&mut self, loss: LossBreakdown) {
        self.sum.total += loss.total;
        self.sum.clustering += loss.clustering;
        self.sum.reconstruction_a += loss.reconstruction_a;
        self.sum.reconstruction_b += loss.reconstruction_b;
        self.batches += 1;
    }

    fn take(&mut self) -> LossBreakdown {
        let n = self.batches.max(1) as f64;
        let mean = LossBreakdown {
            total: self.sum.total / n,
            clustering: self.sum.clustering / n,
            reconstruction_a: self.sum.reconstruction_a / n,
            reconstruction_b: self.sum.reconstruction_b / n,
        };
        *self = Self::default();
        mean
    }
}

/// `KL(P || Q)` summed over clusters, averaged over rows; both sides clipped to `[eps, 1]`.
fn kl_divergence<B: AutodiffBackend>(p: Tensor<B, 2>, q: Tensor<B, 2>) -> Tensor<B, 1> {
    let p = p.clamp(EPSILON, 1.0);
    let q = q.clamp(EPSILON, 1.0);
    (p.clone() * (p.log() - q.log())).sum_dim(1).mean()
}

fn mse<B: AutodiffBackend>(prediction: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    (prediction - target).powf_scalar(2.0).mean()
}

fn scalar<B: AutodiffBackend>(tensor: Tensor<B, 1>, what: &str) -> Result<f64> {
    let value: f64 = tensor.into_scalar().elem();
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SyntofError::NonFinite(what.to_string()))
    }
}

/// Train the joint model on `features` (shared by both branches) until the
/// labels stabilize or `max_iter` batches have run.
pub fn fit_clustering<B, O>(
    embedding: DualBranchModel<B>,
    features: ArrayView2<'_, f32>,
    config: &ClusteringConfig,
    determinism: &DeterminismConfig,
    observer: &mut O,
    device: &B::Device,
) -> Result<ClusteringResult<B>>
where
    B: AutodiffBackend,
    O: TrainingObserver + Send,
{
    config.validate(features.nrows())?;
    embedding.check_shared_input(features.ncols())?;

    let scope = determinism.apply()?;
    let kmeans_seed = scope.config().stream_seed(RngStream::KMeans);
    let mut noise_rng = scope.rng(RngStream::Noise);
    let mut priority_rng = scope.rng(RngStream::Priority);
    let config = *config;

    scope.install(move || {
        let n = features.nrows();
        let mut observers = (HistoryObserver::new(), observer);
        let mut optim = AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-7)
            .init::<B, DeepClusteringModel<B>>();

        let dim = embedding.embedding_dim();
        let mut model = DeepClusteringModel::new(
            embedding,
            SoftAssignment::new(config.n_clusters, dim, config.alpha, device),
        );
        let mut state = TrainerState::Init;
        let mut joint: Option<Array2<f32>> = None;
        let mut seeding_labels = Vec::new();
        let mut labels: Vec<usize> = Vec::new();
        let mut last_delta: Option<f64> = None;
        let mut target = Array2::<f32>::zeros((0, 0));
        let mut losses = LossAccumulator::default();
        let mut iteration = 0usize;
        let mut index = 0usize;

        while !state.is_terminal() {
            state = match state {
                TrainerState::Init => {
                    let z = inference::embed(&model.embedding.valid(), features, config.predict_chunk_rows, device)?;
                    tracing::debug!(rows = n, dim = z.ncols(), "joint embedding computed");
                    joint = Some(z);
                    TrainerState::CentroidSeeding
                }

                TrainerState::CentroidSeeding => {
                    let z = joint
                        .take()
                        .ok_or_else(|| SyntofError::config("centroid seeding before embedding"))?;
                    let kmeans_config = KMeansConfig::new(config.n_clusters)
                        .with_n_init(config.seeding.n_init)
                        .with_variant(config.seeding.variant)
                        .with_seed(kmeans_seed);
                    let mut fit = kmeans::fit(z.view(), &kmeans_config)?;
                    if config.seeding.reorder_by_population {
                        fit = fit.reorder_by_population();
                    }
                    model.assignment.set_centroids(&fit.centroids, device)?;
                    tracing::info!(
                        k = config.n_clusters,
                        inertia = fit.inertia,
                        occupied = occupied(&fit.labels, config.n_clusters),
                        "centroids seeded"
                    );
                    seeding_labels = fit.labels.clone();
                    labels = fit.labels;
                    TrainerState::Refresh
                }

                TrainerState::Refresh => {
                    let q = inference::soft_assignments(&model.valid(), features, config.predict_chunk_rows, device)?;
                    target = match config.target {
                        TargetKind::Standard => target_distribution(q.view())?,
                        TargetKind::Weighted => {
                            let weights = priority_weights(config.n_clusters, &mut priority_rng);
                            weighted_target_distribution(q.view(), &weights)?
                        }
                    };
                    let current = argmax_rows(q.view());
                    let delta = delta_label(&labels, &current)?;
                    labels = current;
                    let first = iteration == 0;
                    last_delta = (!first).then_some(delta);

                    observers.on_refresh(&RefreshRecord {
                        iteration,
                        n_clusters: config.n_clusters,
                        occupied_clusters: occupied(&labels, config.n_clusters),
                        delta_label: last_delta,
                        loss: losses.take(),
                    });

                    if !first && delta < config.tol {
                        tracing::info!(iteration, delta, tol = config.tol, "label change below tolerance");
                        TrainerState::Converged
                    } else if iteration >= config.max_iter {
                        TrainerState::MaxIterReached
                    } else {
                        TrainerState::BatchTrain
                    }
                }

                TrainerState::BatchTrain => {
                    let (start, end) = if (index + 1) * config.batch_size > n {
                        let range = (index * config.batch_size, n);
                        index = 0;
                        range
                    } else {
                        let range = (index * config.batch_size, (index + 1) * config.batch_size);
                        index += 1;
                        range
                    };

                    let x = tensor_from_view::<B>(features.slice(s![start..end, ..]), device);
                    let p = tensor_from_array::<B>(&target.slice(s![start..end, ..]).to_owned(), device);
                    let out = model.forward_train_pair(x.clone(), x.clone(), &mut noise_rng);

                    let kl = kl_divergence(p, out.q);
                    let mse_a = mse(out.reconstruction_a, x.clone());
                    let mse_b = mse(out.reconstruction_b, x);
                    let weights = config.loss_weights;
                    let total = kl.clone().mul_scalar(weights.clustering)
                        + mse_a.clone().mul_scalar(weights.reconstruction_a)
                        + mse_b.clone().mul_scalar(weights.reconstruction_b);

                    losses.add(LossBreakdown {
                        total: scalar(total.clone(), "clustering loss")?,
                        clustering: scalar(kl, "KL divergence")?,
                        reconstruction_a: scalar(mse_a, "reconstruction loss a")?,
                        reconstruction_b: scalar(mse_b, "reconstruction loss b")?,
                    });

                    let grads = GradientsParams::from_grads(total.backward(), &model);
                    model = optim.step(config.learning_rate, model, grads);
                    iteration += 1;

                    if iteration >= config.max_iter {
                        TrainerState::MaxIterReached
                    } else if iteration % config.update_interval == 0 {
                        TrainerState::Refresh
                    } else {
                        TrainerState::BatchTrain
                    }
                }

                TrainerState::Converged | TrainerState::MaxIterReached => state,
            };
        }

        let stop = if state == TrainerState::Converged {
            StopReason::Converged
        } else {
            tracing::info!(iterations = iteration, "iteration ceiling reached before labels stabilized");
            StopReason::MaxIterReached
        };
        observers.on_finish(&FinishRecord {
            iterations: iteration,
            reason: stop,
            last_delta_label: last_delta,
        });

        Ok(ClusteringResult {
            labels,
            seeding_labels,
            model,
            stop,
            iterations: iteration,
            history: observers.0.into_history(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use syntof_core::{init_cpu_device, TrainBackend};
    use syntof_models::{Activation, ArchitectureSpec};
    use syntof_observers::NoopObserver;

    type B = TrainBackend;

    #[test]
    fn test_kl_zero_for_identical() {
        let device = init_cpu_device();
        let p = tensor_from_array::<B>(&ndarray::array![[0.2f32, 0.8], [0.5, 0.5]], &device);
        let kl: f64 = kl_divergence(p.clone(), p).into_scalar().elem();
        assert_relative_eq!(kl, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_kl_known_value() {
        let device = init_cpu_device();
        let p = tensor_from_array::<B>(&ndarray::array![[1.0f32, 0.0]], &device);
        let q = tensor_from_array::<B>(&ndarray::array![[0.5f32, 0.5]], &device);
        let kl: f64 = kl_divergence(p, q).into_scalar().elem();
        assert_relative_eq!(kl, std::f64::consts::LN_2, epsilon = 1e-4);
    }

    #[test]
    fn test_loss_accumulator_means_and_resets() {
        let mut acc = LossAccumulator::default();
        acc.add(LossBreakdown {
            total: 1.0,
            clustering: 2.0,
            reconstruction_a: 3.0,
            reconstruction_b: 4.0,
        });
        acc.add(LossBreakdown::default());
        let mean = acc.take();
        assert_relative_eq!(mean.total, 0.5);
        assert_relative_eq!(mean.reconstruction_b, 2.0);
        assert_eq!(acc.take(), LossBreakdown::default());
    }

    #[test]
    fn test_validate_config() {
        assert!(ClusteringConfig::new(0).validate(10).is_err());
        assert!(ClusteringConfig::new(11).validate(10).is_err());
        assert!(ClusteringConfig::new(3).with_batch_size(0).validate(10).is_err());
        let bad = LossWeights {
            clustering: -1.0,
            ..LossWeights::default()
        };
        assert!(ClusteringConfig::new(3).with_loss_weights(bad).validate(10).is_err());
        assert!(ClusteringConfig::new(3).validate(10).is_ok());
    }

    fn two_groups() -> Array2<f32> {
        Array2::from_shape_fn((40, 2), |(i, j)| {
            let base = if i < 20 { -3.0 } else { 3.0 };
            base + ((i * 5 + j * 3) % 7) as f32 * 0.05
        })
    }

    fn tiny_dual(device: &<B as burn::tensor::backend::Backend>::Device) -> DualBranchModel<B> {
        DualBranchModel::new(
            ArchitectureSpec::new(vec![2, 2])
                .with_activation(Activation::Linear)
                .with_seed(1)
                .build(device)
                .unwrap(),
            ArchitectureSpec::new(vec![2, 2])
                .with_activation(Activation::Linear)
                .with_seed(2)
                .build(device)
                .unwrap(),
        )
    }

    #[test]
    fn test_max_iter_stop_and_wrapping_batches() {
        let device = init_cpu_device();
        let config = ClusteringConfig::new(2)
            .with_tol(-1.0)
            .with_batch_size(16)
            .with_update_interval(2)
            .with_max_iter(5);
        let result = fit_clustering(
            tiny_dual(&device),
            two_groups().view(),
            &config,
            &DeterminismConfig::new(3),
            &mut NoopObserver,
            &device,
        )
        .unwrap();

        assert_eq!(result.stop, StopReason::MaxIterReached);
        assert_eq!(result.iterations, 5);
        assert_eq!(result.labels.len(), 40);
        // Refreshes at 0, 2 and 4
        let iterations: Vec<usize> = result.history.refreshes.iter().map(|r| r.iteration).collect();
        assert_eq!(iterations, vec![0, 2, 4]);
        assert_eq!(result.history.refreshes[0].delta_label, None);
        assert_eq!(result.history.finish.as_ref().map(|f| f.reason), Some(StopReason::MaxIterReached));
    }

    #[test]
    fn test_converges_on_separated_groups() {
        let device = init_cpu_device();
        let config = ClusteringConfig::new(2)
            .with_tol(0.01)
            .with_batch_size(8)
            .with_update_interval(3);
        let result = fit_clustering(
            tiny_dual(&device),
            two_groups().view(),
            &config,
            &DeterminismConfig::new(1),
            &mut NoopObserver,
            &device,
        )
        .unwrap();

        assert!(result.converged());
        assert!(result.iterations < config.max_iter);
        assert_eq!(result.history.refreshes.len(), result.iterations / 3 + 1);
        assert_eq!(result.model.assignment.centroids().unwrap().dim(), (2, 4));
        assert_eq!(result.occupied_clusters(), 2);
    }

    #[test]
    fn test_seeding_deterministic() {
        let device = init_cpu_device();
        let config = ClusteringConfig::new(2).with_max_iter(1);
        let run = || {
            fit_clustering(
                tiny_dual(&device),
                two_groups().view(),
                &config,
                &DeterminismConfig::new(7),
                &mut NoopObserver,
                &device,
            )
            .unwrap()
            .seeding_labels
        };
        assert_eq!(run(), run());
    }
}
