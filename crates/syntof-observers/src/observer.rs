use serde::{Deserialize, Serialize};

/// Loss terms averaged over the batches since the previous record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossBreakdown {
    pub total: f64,
    /// KL(P || Q)
    pub clustering: f64,
    pub reconstruction_a: f64,
    pub reconstruction_b: f64,
}

/// One pretraining epoch of a single autoencoder branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub branch: String,
    pub repetition: usize,
    pub epoch: usize,
    pub loss: f64,
    pub r_square: f64,
}

/// State of the clustering loop at a target refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRecord {
    pub iteration: usize,
    pub n_clusters: usize,
    /// Clusters holding at least one point under the current hard labels
    pub occupied_clusters: usize,
    /// None at the first refresh
    pub delta_label: Option<f64>,
    pub loss: LossBreakdown,
}

/// How the clustering loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Converged,
    MaxIterReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishRecord {
    pub iterations: usize,
    pub reason: StopReason,
    pub last_delta_label: Option<f64>,
}

/// Interface for objects that inspect training while it runs.
///
/// All hooks default to doing nothing, so an observer implements only the
/// events it cares about.
pub trait TrainingObserver {
    /// Called after every pretraining epoch.
    fn on_epoch(&mut self, _record: &EpochRecord) {}

    /// Called at every refresh of the target distribution, including the first.
    fn on_refresh(&mut self, _record: &RefreshRecord) {}

    /// Called once when the clustering loop stops.
    fn on_finish(&mut self, _record: &FinishRecord) {}
}

/// Observer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl TrainingObserver for NoopObserver {}

impl<T: TrainingObserver + ?Sized> TrainingObserver for &mut T {
    fn on_epoch(&mut self, record: &EpochRecord) {
        (**self).on_epoch(record);
    }

    fn on_refresh(&mut self, record: &RefreshRecord) {
        (**self).on_refresh(record);
    }

    fn on_finish(&mut self, record: &FinishRecord) {
        (**self).on_finish(record);
    }
}

impl<A: TrainingObserver, B: TrainingObserver> TrainingObserver for (A, B) {
    fn on_epoch(&mut self, record: &EpochRecord) {
        self.0.on_epoch(record);
        self.1.on_epoch(record);
    }

    fn on_refresh(&mut self, record: &RefreshRecord) {
        self.0.on_refresh(record);
        self.1.on_refresh(record);
    }

    fn on_finish(&mut self, record: &FinishRecord) {
        self.0.on_finish(record);
        self.1.on_finish(record);
    }
}

/// Forwards every record to `tracing`.
///
/// Refreshes go out at `debug`, the final outcome at `info`; epochs are logged
/// every `epoch_stride` epochs.
#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    pub epoch_stride: usize,
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self { epoch_stride: 10 }
    }
}

impl TrainingObserver for TracingObserver {
    fn on_epoch(&mut self, record: &EpochRecord) {
        if self.epoch_stride > 0 && record.epoch % self.epoch_stride == 0 {
            tracing::debug!(
                branch = %record.branch,
                repetition = record.repetition,
                epoch = record.epoch,
                loss = record.loss,
                r_square = record.r_square,
                "pretrain epoch"
            );
        }
    }

    fn on_refresh(&mut self, record: &RefreshRecord) {
        tracing::debug!(
            iteration = record.iteration,
            occupied = record.occupied_clusters,
            delta_label = ?record.delta_label,
            loss = record.loss.total,
            kl = record.loss.clustering,
            "target refresh"
        );
    }

    fn on_finish(&mut self, record: &FinishRecord) {
        match record.reason {
            StopReason::Converged => tracing::info!(
                iterations = record.iterations,
                delta_label = ?record.last_delta_label,
                "clustering converged"
            ),
            StopReason::MaxIterReached => tracing::info!(
                iterations = record.iterations,
                delta_label = ?record.last_delta_label,
                "clustering reached iteration ceiling without converging"
            ),
        }
    }
}
