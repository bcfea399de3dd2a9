//! Pipeline stages against a temporary directory tree.

use std::fs;

use syntof_cluster::{ClusteringConfig, OrderSelectionConfig, PretrainConfig};
use syntof_core::{init_cpu_device, normalized_mutual_info, PathConfig, TrainBackend};
use syntof_examples::io;
use syntof_examples::{failures, gaussian_blobs, successes, BlobConfig, BranchConfig, Pipeline, PipelineConfig};
use tempfile::tempdir;

fn small_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_identifier("blobs")
        .with_repetitions(2)
        .with_denylist(vec!["marker05".to_string()])
        .with_branches(BranchConfig::new(vec![8, 3]), BranchConfig::new(vec![8, 2]))
        .with_pretrain(PretrainConfig::default().with_epochs(5).with_batch_size(128).with_patience(5))
        .with_selection(
            OrderSelectionConfig::default()
                .with_k_min(2)
                .with_max_k(8)
                .with_subsampling(1.0, 0)
                .with_n_init(2),
        )
        .with_clustering(
            ClusteringConfig::default()
                .with_batch_size(128)
                .with_update_interval(10)
                .with_max_iter(100),
        )
}

#[test]
fn test_stages_round_trip_through_disk() {
    let root = tempdir().unwrap();
    let paths = PathConfig::builder().base_dir(root.path()).build();
    paths.ensure_dirs().unwrap();

    let data = gaussian_blobs(&BlobConfig::default().with_clusters(3).with_samples(2, 150).with_channels(6)).unwrap();
    for sample in &data.samples {
        io::write_events(&paths.data_dir().join(&sample.source), sample).unwrap();
    }

    let pipeline = Pipeline::<TrainBackend>::new(small_config(), paths.clone(), init_cpu_device()).unwrap();
    let raw = pipeline.load_features(Some("synthetic")).unwrap();
    assert_eq!(raw.n_rows(), 300);
    assert_eq!(raw.n_features(), 5);
    let features = pipeline.standardize_reference(&raw).unwrap();

    println!("\n=== pretrain ===");
    let pretrained = pipeline.pretrain(&features);
    assert!(failures(&pretrained).is_empty());
    for rep in 0..2 {
        assert!(pipeline.store().branch_path("blobs", syntof_models::BranchId::A, rep).exists());
        assert!(pipeline.store().branch_path("blobs", syntof_models::BranchId::B, rep).exists());
    }

    println!("\n=== select_cluster_counts ===");
    let selections = successes(pipeline.select_cluster_counts(&features));
    assert_eq!(selections.len(), 2);
    let n_clusters: Vec<(usize, usize)> = selections.iter().map(|(rep, s)| (*rep, s.k)).collect();
    assert!(n_clusters.iter().all(|&(_, k)| (2..=8).contains(&k)));
    assert_eq!(pipeline.load_cluster_numbers().unwrap(), n_clusters);

    println!("\n=== fit_predict ===");
    let fits = successes(pipeline.fit_predict(&features, &[(0, 3), (1, 3)]));
    assert_eq!(fits.len(), 2);
    for (_, fit) in &fits {
        assert!(fit.weights.exists());
        assert_eq!(fit.labels.len(), 300);
        assert!(fit.iterations <= 100);
    }

    println!("\n=== predict on re-standardized data ===");
    let again = pipeline.standardize(&raw).unwrap();
    let predicted = successes(pipeline.predict(&again));
    assert_eq!(predicted.len(), 2);
    for ((_, fit), (_, labels)) in fits.iter().zip(&predicted) {
        let agreement = normalized_mutual_info(&fit.labels, labels).unwrap();
        assert!(agreement > 0.8, "fit/predict agreement {agreement}");
    }
    let path = pipeline.export_labels("pred", &predicted, &again.sample).unwrap();
    let header = fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();
    assert_eq!(header, ",0,1,sample");

    println!("\n=== hidden ===");
    let hidden = successes(pipeline.hidden(&again));
    assert!(hidden.iter().all(|(_, h)| h.dim() == (300, 5)));
    let hidden_path = pipeline.export_hidden(&hidden, &again.sample).unwrap();
    assert!(hidden_path.exists());
}

#[test]
fn test_missing_weights_isolated_per_repetition() {
    let root = tempdir().unwrap();
    let paths = PathConfig::builder().base_dir(root.path()).build();
    let pipeline = Pipeline::<TrainBackend>::new(small_config(), paths, init_cpu_device()).unwrap();

    let data = gaussian_blobs(&BlobConfig::default().with_clusters(2).with_samples(1, 40).with_channels(5)).unwrap();
    let features = syntof_core::FeatureMatrix::concatenate::<&str>(&data.samples, &[]).unwrap();

    let outcomes = pipeline.predict(&features);
    assert_eq!(failures(&outcomes), vec![0, 1]);
    let message = format!("{:#}", outcomes[0].result.as_ref().unwrap_err());
    assert!(message.contains("missing"), "{message}");
    assert!(pipeline.load_cluster_numbers().is_err());

    // Tables keep the ids of the repetitions that survived.
    fs::create_dir_all(pipeline.paths().output_dir()).unwrap();
    let n = features.n_rows();
    let labels = vec![(0, vec![0; n]), (2, vec![1; n])];
    let path = pipeline.export_labels("partial", &labels, &features.sample).unwrap();
    let header = fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();
    assert_eq!(header, ",0,2,sample");
    let counts = fs::read_to_string(path.with_file_name("counts_partial_blobs.csv")).unwrap();
    assert_eq!(counts.lines().next(), Some("cluster,0,2"));

    let hidden = vec![(2, ndarray::Array2::<f32>::zeros((n, 2)))];
    let hidden_path = pipeline.export_hidden(&hidden, &features.sample).unwrap();
    let header = fs::read_to_string(&hidden_path).unwrap().lines().next().unwrap().to_string();
    assert_eq!(header, ",2_0,2_1,sample");
}

#[test]
fn test_standardize_requires_reference_scaler() {
    let root = tempdir().unwrap();
    let paths = PathConfig::builder().base_dir(root.path()).build();
    let pipeline = Pipeline::<TrainBackend>::new(small_config(), paths, init_cpu_device()).unwrap();
    let data = gaussian_blobs(&BlobConfig::default().with_samples(1, 10)).unwrap();
    let features = syntof_core::FeatureMatrix::concatenate::<&str>(&data.samples, &[]).unwrap();
    assert!(pipeline.standardize(&features).is_err());
}
