//! Repetition orchestration for the synTOF deep-clustering pipeline.
//!
//! Stages, each run for every repetition in parallel:
//!
//! 1. `pretrain`: train both autoencoder branches, persist their weights
//! 2. `select_cluster_counts`: embed with the pretrained branches and choose K
//! 3. `fit_predict`: deep clustering from the pretrained branches, persist the
//!    joint model and return labels
//! 4. `predict` / `hidden`: reload joint models and label or embed new data
//!
//! A failing repetition is logged and reported in its [`RepetitionOutcome`];
//! the remaining repetitions are unaffected.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use syntof_cluster::{
    fit_clustering, inference, select_cluster_count, ClusteringConfig, LossWeights, OrderSelection,
    OrderSelectionConfig, PretrainConfig, PretrainReport, Pretrainer,
};
use syntof_core::{
    stability_matrix, DeterminismConfig, FeatureMatrix, PathConfig, RngStream, StandardScaler, DEFAULT_DENYLIST,
};
use syntof_models::{ArchitectureSpec, AutoencoderVariant, BranchId, WeightStore};
use syntof_observers::{StopReason, TracingObserver, TrainingHistory};

use crate::io;

/// Hidden widths and regularization variant of one branch; the input width
/// comes from the data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    pub hidden: Vec<usize>,
    pub variant: AutoencoderVariant,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            hidden: vec![512, 256, 128, 10],
            variant: AutoencoderVariant::Plain,
        }
    }
}

impl BranchConfig {
    pub fn new(hidden: Vec<usize>) -> Self {
        Self {
            hidden,
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: AutoencoderVariant) -> Self {
        self.variant = variant;
        self
    }

    pub fn spec(&self, input_dim: usize) -> ArchitectureSpec {
        let mut widths = Vec::with_capacity(self.hidden.len() + 1);
        widths.push(input_dim);
        widths.extend_from_slice(&self.hidden);
        ArchitectureSpec::variant(widths, self.variant)
    }
}

/// Everything a run needs besides paths; loadable from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Key for persisted weights and exported tables.
    pub identifier: String,
    pub branch_a: BranchConfig,
    pub branch_b: BranchConfig,
    pub repetitions: usize,
    /// Worker threads inside each repetition's determinism scope.
    pub threads_per_repetition: usize,
    pub denylist: Vec<String>,
    pub pretrain: PretrainConfig,
    pub selection: OrderSelectionConfig,
    /// `n_clusters` is replaced per repetition.
    pub clustering: ClusteringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            identifier: "syntof".to_string(),
            branch_a: BranchConfig::new(vec![512, 256, 128, 10]),
            branch_b: BranchConfig::new(vec![512, 256, 128, 5]),
            repetitions: 10,
            threads_per_repetition: 1,
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
            pretrain: PretrainConfig::default(),
            selection: OrderSelectionConfig::default(),
            clustering: ClusteringConfig::default()
                .with_batch_size(1 << 15)
                .with_tol(0.03)
                .with_loss_weights(LossWeights::balanced()),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&text).with_context(|| format!("Invalid pipeline config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_toml(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize pipeline config")?;
        fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_branches(mut self, branch_a: BranchConfig, branch_b: BranchConfig) -> Self {
        self.branch_a = branch_a;
        self.branch_b = branch_b;
        self
    }

    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    pub fn with_denylist(mut self, denylist: Vec<String>) -> Self {
        self.denylist = denylist;
        self
    }

    pub fn with_pretrain(mut self, pretrain: PretrainConfig) -> Self {
        self.pretrain = pretrain;
        self
    }

    pub fn with_selection(mut self, selection: OrderSelectionConfig) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_clustering(mut self, clustering: ClusteringConfig) -> Self {
        self.clustering = clustering;
        self
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.identifier.is_empty(), "identifier must not be empty");
        anyhow::ensure!(
            !self.identifier.contains(['/', '\\']),
            "identifier {:?} must not contain path separators",
            self.identifier
        );
        anyhow::ensure!(self.repetitions > 0, "at least one repetition is required");
        anyhow::ensure!(self.threads_per_repetition > 0, "threads_per_repetition must be >= 1");
        anyhow::ensure!(
            !self.branch_a.hidden.is_empty() && !self.branch_b.hidden.is_empty(),
            "both branches need at least a bottleneck width"
        );
        self.pretrain.validate()?;
        self.selection.validate()?;
        Ok(())
    }

    pub fn determinism(&self, repetition: usize) -> DeterminismConfig {
        DeterminismConfig::for_repetition(repetition).with_threads(self.threads_per_repetition)
    }
}

/// Result of one stage for one repetition.
#[derive(Debug)]
pub struct RepetitionOutcome<T> {
    pub repetition: usize,
    pub result: Result<T>,
}

impl<T> RepetitionOutcome<T> {
    fn capture(repetition: usize, stage: &str, f: impl FnOnce() -> Result<T>) -> Self {
        let result = f();
        match &result {
            Ok(_) => tracing::info!(repetition, stage, "repetition finished"),
            Err(e) => tracing::error!(repetition, stage, error = %format!("{e:#}"), "repetition failed"),
        }
        Self { repetition, result }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// `(repetition, value)` for every successful repetition, in repetition order.
pub fn successes<T>(outcomes: Vec<RepetitionOutcome<T>>) -> Vec<(usize, T)> {
    outcomes
        .into_iter()
        .filter_map(|o| o.result.ok().map(|v| (o.repetition, v)))
        .collect()
}

pub fn failures<T>(outcomes: &[RepetitionOutcome<T>]) -> Vec<usize> {
    outcomes.iter().filter(|o| !o.is_ok()).map(|o| o.repetition).collect()
}

/// Deep-clustering outcome of one repetition.
#[derive(Debug, Clone)]
pub struct FitSummary {
    pub n_clusters: usize,
    pub labels: Vec<usize>,
    pub stop: StopReason,
    pub iterations: usize,
    pub history: TrainingHistory,
    pub weights: PathBuf,
}

/// Outcome of [`Pipeline::run`].
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub n_clusters: Vec<(usize, usize)>,
    pub labels: Vec<(usize, Vec<usize>)>,
    pub failed: Vec<usize>,
    /// Pairwise NMI between the successful repetitions.
    pub stability: Array2<f64>,
    pub labels_path: PathBuf,
    pub cluster_numbers_path: PathBuf,
    pub hidden_path: Option<PathBuf>,
}

pub struct Pipeline<B: AutodiffBackend> {
    config: PipelineConfig,
    paths: PathConfig,
    store: WeightStore,
    device: B::Device,
}

impl<B: AutodiffBackend> Pipeline<B> {
    pub fn new(config: PipelineConfig, paths: PathConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        paths.ensure_dirs().context("Failed to create pipeline directories")?;
        let store = WeightStore::new(paths.weights_dir());
        Ok(Self {
            config,
            paths,
            store,
            device,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathConfig {
        &self.paths
    }

    pub fn store(&self) -> &WeightStore {
        &self.store
    }

    fn scaler_path(&self) -> PathBuf {
        self.paths
            .weights_dir()
            .join(format!("{}_scaler.json", self.config.identifier))
    }

    /// Output file `<output_dir>/<prefix>_<identifier>.<ext>`.
    pub fn output_path(&self, prefix: &str, ext: &str) -> PathBuf {
        self.paths
            .output_dir()
            .join(format!("{prefix}_{}.{ext}", self.config.identifier))
    }

    fn specs(&self, input_dim: usize) -> (ArchitectureSpec, ArchitectureSpec) {
        (self.config.branch_a.spec(input_dim), self.config.branch_b.spec(input_dim))
    }

    fn repetitions(&self) -> Vec<usize> {
        (0..self.config.repetitions).collect()
    }

    /// Concatenate the matching CSV files of the data directory, minus denylisted channels.
    pub fn load_features(&self, prefix: Option<&str>) -> Result<FeatureMatrix> {
        let sources = io::read_event_dir(self.paths.data_dir(), prefix)?;
        let features = FeatureMatrix::concatenate(&sources, &self.config.denylist)?;
        tracing::info!(
            files = sources.len(),
            rows = features.n_rows(),
            channels = features.n_features(),
            "loaded features"
        );
        Ok(features)
    }

    /// Fit the scaler on reference data, persist it and return the standardized matrix.
    pub fn standardize_reference(&self, raw: &FeatureMatrix) -> Result<FeatureMatrix> {
        let (scaler, scaled) = StandardScaler::fit_transform(raw)?;
        io::save_scaler(&self.scaler_path(), &scaler)?;
        Ok(scaled)
    }

    /// Apply the persisted reference scaler to new data.
    pub fn standardize(&self, raw: &FeatureMatrix) -> Result<FeatureMatrix> {
        let scaler = io::load_scaler(&self.scaler_path())
            .context("No reference scaler; run pretraining on reference data first")?;
        Ok(scaler.transform(raw)?)
    }

    pub fn pretrain(&self, features: &FeatureMatrix) -> Vec<RepetitionOutcome<[PretrainReport; 2]>> {
        let (spec_a, spec_b) = self.specs(features.n_features());
        self.repetitions()
            .into_par_iter()
            .map(|rep| {
                RepetitionOutcome::capture(rep, "pretrain", || {
                    let pretrainer = Pretrainer::<B>::new(self.config.pretrain, self.config.determinism(rep), &self.device);
                    let (dual, reports) = pretrainer.fit_dual(
                        &spec_a,
                        &spec_b,
                        features.values.view(),
                        rep,
                        &mut TracingObserver::default(),
                    )?;
                    for id in BranchId::ALL {
                        self.store
                            .save_branch(&self.config.identifier, id, rep, dual.branch(id))?;
                    }
                    Ok(reports)
                })
            })
            .collect()
    }

    /// Choose K for every repetition and write the `cluster_numbers` table.
    pub fn select_cluster_counts(&self, features: &FeatureMatrix) -> Vec<RepetitionOutcome<OrderSelection>> {
        let (spec_a, spec_b) = self.specs(features.n_features());
        let outcomes: Vec<RepetitionOutcome<OrderSelection>> = self
            .repetitions()
            .into_par_iter()
            .map(|rep| {
                RepetitionOutcome::capture(rep, "select_cluster_counts", || {
                    let dual = self.store.load_dual::<B::InnerBackend>(
                        &self.config.identifier,
                        rep,
                        &spec_a,
                        &spec_b,
                        &self.device,
                    )?;
                    let hidden = inference::embed(
                        &dual,
                        features.values.view(),
                        self.config.clustering.predict_chunk_rows,
                        &self.device,
                    )?;
                    let seed = self.config.determinism(rep).stream_seed(RngStream::Subsample);
                    let selection = select_cluster_count(hidden.view(), &self.config.selection.clone().with_seed(seed))?;

                    let plot = self.output_path(&format!("distortions_rep{rep}"), "png");
                    if let Err(e) = selection.plot(&plot) {
                        tracing::warn!(repetition = rep, error = %e, "could not draw distortion plot");
                    }
                    Ok(selection)
                })
            })
            .collect();

        let n_clusters: Vec<(usize, usize)> = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok().map(|s| (o.repetition, s.k)))
            .collect();
        if !n_clusters.is_empty() {
            if let Err(e) = io::write_cluster_numbers(&self.cluster_numbers_path(), &n_clusters) {
                tracing::error!(error = %e, "could not write cluster numbers");
            }
        }
        outcomes
    }

    pub fn cluster_numbers_path(&self) -> PathBuf {
        self.output_path("cluster_numbers", "csv")
    }

    /// Cluster counts written by the last [`Pipeline::select_cluster_counts`].
    pub fn load_cluster_numbers(&self) -> Result<Vec<(usize, usize)>> {
        let path = self.cluster_numbers_path();
        let n_clusters = io::read_cluster_numbers(&path)
            .with_context(|| format!("No cluster counts for '{}'; run cluster-count selection first", self.config.identifier))?;
        let repetitions = self.config.repetitions;
        if let Some(&(rep, _)) = n_clusters.iter().find(|&&(rep, _)| rep >= repetitions) {
            anyhow::bail!("{}: repetition {rep} outside 0..{repetitions}", path.display());
        }
        Ok(n_clusters)
    }

    /// Deep clustering for each `(repetition, n_clusters)` pair.
    pub fn fit_predict(&self, features: &FeatureMatrix, n_clusters: &[(usize, usize)]) -> Vec<RepetitionOutcome<FitSummary>> {
        let (spec_a, spec_b) = self.specs(features.n_features());
        n_clusters
            .par_iter()
            .map(|&(rep, k)| {
                RepetitionOutcome::capture(rep, "fit_predict", || {
                    let dual = self
                        .store
                        .load_dual::<B>(&self.config.identifier, rep, &spec_a, &spec_b, &self.device)?;
                    let config = ClusteringConfig {
                        n_clusters: k,
                        ..self.config.clustering
                    };
                    let result = fit_clustering(
                        dual,
                        features.values.view(),
                        &config,
                        &self.config.determinism(rep),
                        &mut TracingObserver::default(),
                        &self.device,
                    )?;
                    let weights = self.store.save_joint(&self.config.identifier, rep, &result.model)?;
                    Ok(FitSummary {
                        n_clusters: k,
                        labels: result.labels,
                        stop: result.stop,
                        iterations: result.iterations,
                        history: result.history,
                        weights,
                    })
                })
            })
            .collect()
    }

    /// Hard labels for `features` from every persisted joint model.
    pub fn predict(&self, features: &FeatureMatrix) -> Vec<RepetitionOutcome<Vec<usize>>> {
        self.repetitions()
            .into_par_iter()
            .map(|rep| {
                RepetitionOutcome::capture(rep, "predict", || {
                    let model = self
                        .store
                        .load_joint::<B::InnerBackend>(&self.config.identifier, rep, &self.device)?;
                    Ok(inference::predict_labels(
                        &model,
                        features.values.view(),
                        self.config.clustering.predict_chunk_rows,
                        &self.device,
                    )?)
                })
            })
            .collect()
    }

    /// Joint embeddings of `features` from every persisted joint model.
    pub fn hidden(&self, features: &FeatureMatrix) -> Vec<RepetitionOutcome<Array2<f32>>> {
        self.repetitions()
            .into_par_iter()
            .map(|rep| {
                RepetitionOutcome::capture(rep, "hidden", || {
                    let model = self
                        .store
                        .load_joint::<B::InnerBackend>(&self.config.identifier, rep, &self.device)?;
                    Ok(inference::embed(
                        &model.embedding,
                        features.values.view(),
                        self.config.clustering.predict_chunk_rows,
                        &self.device,
                    )?)
                })
            })
            .collect()
    }

    /// Write a labels table and its cluster counts; returns the labels path.
    pub fn export_labels(&self, name: &str, labels: &[(usize, Vec<usize>)], sample: &[String]) -> Result<PathBuf> {
        let path = self.output_path(&format!("synTOF_{name}"), "csv");
        io::write_labels(&path, labels, sample)?;
        io::write_counts(&self.output_path(&format!("counts_{name}"), "csv"), labels)?;
        Ok(path)
    }

    pub fn export_hidden(&self, hidden: &[(usize, Array2<f32>)], sample: &[String]) -> Result<PathBuf> {
        let path = self.output_path("hidden", "csv");
        io::write_hidden(&path, hidden, sample)?;
        Ok(path)
    }

    /// All stages on the reference files matching `prefix`.
    ///
    /// The effective configuration is written next to the exported tables.
    pub fn run(&self, prefix: Option<&str>, export_hidden: bool) -> Result<RunSummary> {
        self.config.save_toml(&self.output_path("pipeline", "toml"))?;
        let raw = self.load_features(prefix)?;
        let features = self.standardize_reference(&raw)?;
        let mut failed = Vec::new();

        let pretrained = self.pretrain(&features);
        failed.extend(failures(&pretrained));
        anyhow::ensure!(pretrained.iter().any(|o| o.is_ok()), "pretraining failed for every repetition");

        let selections = self.select_cluster_counts(&features);
        failed.extend(failures(&selections));
        let n_clusters: Vec<(usize, usize)> = successes(selections)
            .into_iter()
            .map(|(rep, s)| (rep, s.k))
            .collect();
        anyhow::ensure!(!n_clusters.is_empty(), "cluster-count selection failed for every repetition");
        tracing::info!(?n_clusters, "selected cluster counts");

        let fits = self.fit_predict(&features, &n_clusters);
        failed.extend(failures(&fits));
        let labels: Vec<(usize, Vec<usize>)> = successes(fits)
            .into_iter()
            .map(|(rep, fit)| (rep, fit.labels))
            .collect();
        anyhow::ensure!(!labels.is_empty(), "deep clustering failed for every repetition");

        let labels_path = self.export_labels("labels", &labels, &features.sample)?;
        let labelings: Vec<Vec<usize>> = labels.iter().map(|(_, l)| l.clone()).collect();
        let stability = stability_matrix(&labelings)?;

        let hidden_path = if export_hidden {
            let hidden = self.hidden(&features);
            failed.extend(failures(&hidden));
            Some(self.export_hidden(&successes(hidden), &features.sample)?)
        } else {
            None
        };

        failed.sort_unstable();
        failed.dedup();
        Ok(RunSummary {
            n_clusters,
            labels,
            failed,
            stability,
            labels_path,
            cluster_numbers_path: self.cluster_numbers_path(),
            hidden_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_matches_reference_run() {
        let config = PipelineConfig::default();
        assert_eq!(config.repetitions, 10);
        assert_eq!(config.branch_a.hidden, vec![512, 256, 128, 10]);
        assert_eq!(config.branch_b.hidden, vec![512, 256, 128, 5]);
        assert_eq!(config.denylist.len(), 10);
        assert_eq!(config.clustering.batch_size, 1 << 15);
        assert_eq!(config.determinism(3).seed, 126);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_branch_spec_prepends_input() {
        let spec = BranchConfig::new(vec![8, 3]).spec(20);
        assert_eq!(spec.widths, vec![20, 8, 3]);
    }

    #[test]
    fn test_toml_round_trip_and_partial_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = PipelineConfig::default().with_identifier("BA9LowNo").with_repetitions(3);
        config.save_toml(&path).unwrap();
        assert_eq!(PipelineConfig::from_toml_file(&path).unwrap(), config);

        fs::write(&path, "identifier = \"x\"\n[pretrain]\nepochs = 7\n").unwrap();
        let partial = PipelineConfig::from_toml_file(&path).unwrap();
        assert_eq!(partial.pretrain.epochs, 7);
        assert_eq!(partial.pretrain.batch_size, PretrainConfig::default().batch_size);
        assert_eq!(partial.repetitions, 10);
    }

    #[test]
    fn test_toml_round_trip_without_resampling() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        let config = PipelineConfig::default().with_selection(
            OrderSelectionConfig::default()
                .with_subsampling(1.0, 0)
                .with_smoothing(true),
        );
        config.save_toml(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("resample_size = 0"), "{text}");

        let loaded = PipelineConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded.selection.resample_size, 0);
        assert!(loaded.selection.smooth_distortions);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_rejects_bad_identifier() {
        assert!(PipelineConfig::default().with_identifier("").validate().is_err());
        assert!(PipelineConfig::default().with_identifier("a/b").validate().is_err());
        assert!(PipelineConfig::default().with_repetitions(0).validate().is_err());
    }

    #[test]
    fn test_outcome_partitioning() {
        let outcomes = vec![
            RepetitionOutcome::capture(0, "test", || Ok(1)),
            RepetitionOutcome::capture(1, "test", || Err(anyhow::anyhow!("boom"))),
            RepetitionOutcome::capture(2, "test", || Ok(3)),
        ];
        assert_eq!(failures(&outcomes), vec![1]);
        assert_eq!(successes(outcomes), vec![(0, 1), (2, 3)]);
    }
}
