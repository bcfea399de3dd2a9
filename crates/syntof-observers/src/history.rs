//! In-memory training history.

use serde::{Deserialize, Serialize};

use crate::observer::{EpochRecord, FinishRecord, RefreshRecord, TrainingObserver};

/// Everything observed during one training call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
    pub refreshes: Vec<RefreshRecord>,
    pub finish: Option<FinishRecord>,
}

impl TrainingHistory {
    /// Losses per epoch for one branch, in order.
    pub fn epoch_losses(&self, branch: &str) -> Vec<f64> {
        self.epochs
            .iter()
            .filter(|r| r.branch == branch)
            .map(|r| r.loss)
            .collect()
    }

    pub fn delta_labels(&self) -> Vec<f64> {
        self.refreshes.iter().filter_map(|r| r.delta_label).collect()
    }

    /// CSV header matching [`TrainingHistory::refresh_rows`].
    pub fn refresh_header() -> &'static str {
        "iteration,n_clusters,occupied,delta_label,loss,kl,mse_a,mse_b"
    }

    pub fn refresh_rows(&self) -> Vec<String> {
        self.refreshes
            .iter()
            .map(|r| {
                format!(
                    "{},{},{},{},{:.6},{:.6},{:.6},{:.6}",
                    r.iteration,
                    r.n_clusters,
                    r.occupied_clusters,
                    r.delta_label.map(|d| format!("{d:.6}")).unwrap_or_default(),
                    r.loss.total,
                    r.loss.clustering,
                    r.loss.reconstruction_a,
                    r.loss.reconstruction_b
                )
            })
            .collect()
    }
}

/// Observer that keeps every record.
#[derive(Debug, Clone, Default)]
pub struct HistoryObserver {
    history: TrainingHistory,
}

impl HistoryObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn into_history(self) -> TrainingHistory {
        self.history
    }
}

impl TrainingObserver for HistoryObserver {
    fn on_epoch(&mut self, record: &EpochRecord) {
        self.history.epochs.push(record.clone());
    }

    fn on_refresh(&mut self, record: &RefreshRecord) {
        self.history.refreshes.push(record.clone());
    }

    fn on_finish(&mut self, record: &FinishRecord) {
        self.history.finish = Some(record.clone());
    }
}
