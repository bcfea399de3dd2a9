//! Autoencoder pretraining.
//!
//! Each branch is trained on its own to reconstruct the standardized features
//! under mean squared error, with Adam (Keras Nadam defaults for the learning
//! rate, betas and epsilon), shuffled mini-batches and early stopping on the
//! epoch training loss.

use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use ndarray::{ArrayView2, Axis};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use syntof_core::{
    r_square, tensor_from_array, tensor_to_array, DeterminismConfig, Result, RngStream, SyntofError,
};
use syntof_models::{ArchitectureSpec, Autoencoder, BranchId, DualBranchModel};
use syntof_observers::{EpochRecord, TrainingObserver};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PretrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Epochs without improvement before stopping.
    pub patience: usize,
    /// Minimum loss decrease that counts as an improvement.
    pub min_delta: f64,
    pub shuffle: bool,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 5000,
            batch_size: 1 << 15,
            learning_rate: 1e-3,
            patience: 1,
            min_delta: 0.0,
            shuffle: true,
        }
    }
}

impl PretrainConfig {
    pub const fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub const fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(SyntofError::config("pretraining epochs and batch size must be positive"));
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(SyntofError::config("pretraining learning rate must be positive"));
        }
        Ok(())
    }
}

/// Loss curve of one pretrained branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainReport {
    pub branch: BranchId,
    pub repetition: usize,
    pub losses: Vec<f64>,
    pub r_squares: Vec<f64>,
    pub early_stopped: bool,
}

impl PretrainReport {
    pub fn epochs_run(&self) -> usize {
        self.losses.len()
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.losses.last().copied()
    }

    pub fn summary(&self) -> String {
        format!(
            "branch {} rep {}: {} epochs, final loss={:.5}, R2={:.4}, early_stopped={}",
            self.branch,
            self.repetition,
            self.epochs_run(),
            self.final_loss().unwrap_or(f64::NAN),
            self.r_squares.last().copied().unwrap_or(f64::NAN),
            self.early_stopped
        )
    }
}

impl std::fmt::Display for PretrainReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Keras-style early stopping on a monitored loss.
#[derive(Debug, Clone)]
struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl EarlyStopping {
    fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Record an epoch; true when training should stop.
    fn update(&mut self, loss: f64) -> bool {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }
}

fn mse<B: AutodiffBackend>(prediction: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    (prediction - target).powf_scalar(2.0).mean()
}

/// Pretraining settings shared by both branches of a repetition.
#[derive(Debug, Clone)]
pub struct Pretrainer<'a, B: AutodiffBackend> {
    pub config: PretrainConfig,
    pub determinism: DeterminismConfig,
    device: &'a B::Device,
}

impl<'a, B: AutodiffBackend> Pretrainer<'a, B> {
    pub fn new(config: PretrainConfig, determinism: DeterminismConfig, device: &'a B::Device) -> Self {
        Self {
            config,
            determinism,
            device,
        }
    }

    /// Weight seed of a branch; the branches of one repetition differ.
    pub fn branch_seed(&self, branch: BranchId) -> u64 {
        let base = self.determinism.stream_seed(RngStream::Weights);
        match branch {
            BranchId::A => base,
            BranchId::B => base.wrapping_add(1),
        }
    }

    /// Build both branches with repetition-derived seeds and pretrain them.
    pub fn fit_dual<O>(
        &self,
        spec_a: &ArchitectureSpec,
        spec_b: &ArchitectureSpec,
        features: ArrayView2<'_, f32>,
        repetition: usize,
        observer: &mut O,
    ) -> Result<(DualBranchModel<B>, [PretrainReport; 2])>
    where
        O: TrainingObserver + Send,
    {
        let model_a = spec_a.clone().with_seed(self.branch_seed(BranchId::A)).build::<B>(self.device)?;
        let model_b = spec_b.clone().with_seed(self.branch_seed(BranchId::B)).build::<B>(self.device)?;
        let (model_a, report_a) = self.fit(model_a, features, BranchId::A, repetition, observer)?;
        let (model_b, report_b) = self.fit(model_b, features, BranchId::B, repetition, observer)?;
        Ok((DualBranchModel::new(model_a, model_b), [report_a, report_b]))
    }

    /// Train one autoencoder to reconstruct `features`.
    pub fn fit<O>(
        &self,
        model: Autoencoder<B>,
        features: ArrayView2<'_, f32>,
        branch: BranchId,
        repetition: usize,
        observer: &mut O,
    ) -> Result<(Autoencoder<B>, PretrainReport)>
    where
        O: TrainingObserver + Send,
    {
        self.config.validate()?;
        if features.ncols() != model.input_dim() {
            return Err(SyntofError::dims(format!("branch {branch} input"), model.input_dim(), features.ncols()));
        }
        if features.nrows() == 0 {
            return Err(SyntofError::config("cannot pretrain on an empty matrix"));
        }

        let scope = self.determinism.apply()?;
        let config = self.config;
        let device = self.device;
        let mut shuffle_rng = scope.rng(RngStream::Shuffle);
        let mut noise_rng = scope.rng(RngStream::Noise);

        scope.install(move || {
            let mut model = model;
            let mut optim = AdamConfig::new()
                .with_beta_1(0.9)
                .with_beta_2(0.999)
                .with_epsilon(1e-7)
                .init::<B, Autoencoder<B>>();
            let mut stopper = EarlyStopping::new(config.patience, config.min_delta);
            let mut order: Vec<usize> = (0..features.nrows()).collect();
            let mut report = PretrainReport {
                branch,
                repetition,
                losses: Vec::new(),
                r_squares: Vec::new(),
                early_stopped: false,
            };

            for epoch in 0..config.epochs {
                if config.shuffle {
                    order.shuffle(&mut shuffle_rng);
                }

                let mut loss_sum = 0.0;
                let mut r2_sum = 0.0;
                for rows in order.chunks(config.batch_size) {
                    let batch = features.select(Axis(0), rows);
                    let x = tensor_from_array::<B>(&batch, device);
                    let out = model.forward_train(x.clone(), &mut noise_rng);
                    let loss = mse(out.reconstruction.clone(), x);

                    let loss_value: f64 = loss.clone().into_scalar().elem();
                    if !loss_value.is_finite() {
                        return Err(SyntofError::NonFinite(format!("branch {branch} loss at epoch {epoch}")));
                    }
                    let reconstruction = tensor_to_array(out.reconstruction.inner())?;
                    let weight = rows.len() as f64;
                    loss_sum += loss_value * weight;
                    r2_sum += r_square(batch.view(), reconstruction.view())? * weight;

                    let grads = GradientsParams::from_grads(loss.backward(), &model);
                    model = optim.step(config.learning_rate, model, grads);
                }

                let n = features.nrows() as f64;
                let epoch_loss = loss_sum / n;
                let epoch_r2 = r2_sum / n;
                report.losses.push(epoch_loss);
                report.r_squares.push(epoch_r2);
                observer.on_epoch(&EpochRecord {
                    branch: branch.to_string(),
                    repetition,
                    epoch,
                    loss: epoch_loss,
                    r_square: epoch_r2,
                });

                if stopper.update(epoch_loss) {
                    report.early_stopped = true;
                    break;
                }
            }

            tracing::info!(%branch, repetition, epochs = report.epochs_run(), loss = ?report.final_loss(), "pretraining finished");
            Ok((model, report))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syntof_core::{init_cpu_device, TrainBackend};
    use syntof_observers::HistoryObserver;

    type B = TrainBackend;

    fn features() -> ndarray::Array2<f32> {
        ndarray::Array2::from_shape_fn((64, 4), |(i, j)| ((i * 7 + j * 3) % 11) as f32 / 5.0 - 1.0)
    }

    #[test]
    fn test_early_stopping_patience_one() {
        let mut stopper = EarlyStopping::new(1, 0.0);
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(0.5));
        assert!(stopper.update(0.5));
    }

    #[test]
    fn test_early_stopping_patience_two() {
        let mut stopper = EarlyStopping::new(2, 0.0);
        assert!(!stopper.update(1.0));
        assert!(!stopper.update(1.1));
        assert!(!stopper.update(0.9));
        assert!(!stopper.update(0.95));
        assert!(stopper.update(0.92));
    }

    #[test]
    fn test_loss_decreases() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::new(vec![4, 8, 2]).with_seed(3).build::<B>(&device).unwrap();
        let config = PretrainConfig::default()
            .with_epochs(40)
            .with_batch_size(16)
            .with_learning_rate(0.01)
            .with_patience(40);
        let trainer = Pretrainer::<B>::new(config, DeterminismConfig::new(5), &device);
        let mut history = HistoryObserver::new();
        let (_, report) = trainer
            .fit(model, features().view(), BranchId::A, 0, &mut history)
            .unwrap();

        assert_eq!(report.epochs_run(), history.history().epochs.len());
        let first = report.losses[0];
        let last = report.final_loss().unwrap();
        assert!(last < first, "loss {first} -> {last}");
    }

    #[test]
    fn test_same_seed_same_losses() {
        let device = init_cpu_device();
        let config = PretrainConfig::default().with_epochs(3).with_batch_size(16);
        let run = || {
            let trainer = Pretrainer::<B>::new(config, DeterminismConfig::new(9), &device);
            let spec_a = ArchitectureSpec::new(vec![4, 3, 2]);
            let spec_b = ArchitectureSpec::new(vec![4, 2]);
            let (_, reports) = trainer
                .fit_dual(&spec_a, &spec_b, features().view(), 0, &mut syntof_observers::NoopObserver)
                .unwrap();
            reports
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_rejects_width_mismatch() {
        let device = init_cpu_device();
        let model = ArchitectureSpec::new(vec![5, 2]).build::<B>(&device).unwrap();
        let trainer = Pretrainer::<B>::new(PretrainConfig::default(), DeterminismConfig::default(), &device);
        let result = trainer.fit(model, features().view(), BranchId::B, 0, &mut syntof_observers::NoopObserver);
        assert!(matches!(result, Err(SyntofError::DimensionMismatch { .. })));
    }
}
