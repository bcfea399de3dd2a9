//! End-to-end tests: pretraining, order selection and deep clustering on
//! synthetic blobs with known membership.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use syntof_cluster::{
    fit_clustering, inference, select_cluster_count, ClusteringConfig, OrderSelectionConfig, PretrainConfig,
    Pretrainer, SeedingConfig, TargetKind,
};
use syntof_core::{init_cpu_device, normalized_mutual_info, DeterminismConfig, TrainBackend};
use syntof_models::{Activation, ArchitectureSpec};
use syntof_observers::{HistoryObserver, NoopObserver, StopReason};

type B = TrainBackend;

/// `k` Gaussian blobs in `dim` dimensions, centers 12 apart on the axes, sigma 0.5.
fn blobs(k: usize, per_blob: usize, dim: usize, seed: u64) -> (Array2<f32>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = Normal::new(0.0f32, 0.5).expect("normal");
    let mut values = Array2::zeros((k * per_blob, dim));
    let mut truth = Vec::with_capacity(k * per_blob);
    for c in 0..k {
        for i in 0..per_blob {
            let row = c * per_blob + i;
            for j in 0..dim {
                let center = if j == c % dim { 12.0 } else { 0.0 };
                values[[row, j]] = center + noise.sample(&mut rng);
            }
            truth.push(c);
        }
    }
    (values, truth)
}

fn specs() -> (ArchitectureSpec, ArchitectureSpec) {
    (
        ArchitectureSpec::new(vec![6, 8, 3]).with_activation(Activation::LeakyRelu),
        ArchitectureSpec::new(vec![6, 8, 2]).with_activation(Activation::LeakyRelu),
    )
}

#[test]
fn test_pretrain_then_cluster_recovers_blobs() {
    let device = init_cpu_device();
    let (features, truth) = blobs(4, 250, 8, 11);
    let spec_a = ArchitectureSpec::new(vec![8, 4, 2]).with_activation(Activation::LeakyRelu);
    let spec_b = spec_a.clone();
    let determinism = DeterminismConfig::for_repetition(1);

    println!("\n=== Pretraining both branches ===");
    let pretrain = PretrainConfig::default()
        .with_epochs(15)
        .with_batch_size(64)
        .with_learning_rate(5e-3)
        .with_patience(15);
    let mut history = HistoryObserver::new();
    let (dual, reports) = Pretrainer::<B>::new(pretrain, determinism, &device)
        .fit_dual(&spec_a, &spec_b, features.view(), 1, &mut history)
        .expect("pretraining");
    for report in &reports {
        println!("{}", report.summary());
        assert_eq!(report.epochs_run(), 15);
    }
    assert_eq!(history.history().epochs.len(), 30);

    println!("\n=== Deep clustering ===");
    let config = ClusteringConfig::new(4)
        .with_batch_size(128)
        .with_update_interval(5)
        .with_max_iter(200)
        .with_learning_rate(1e-3);
    let result = fit_clustering(dual, features.view(), &config, &determinism, &mut NoopObserver, &device)
        .expect("clustering");

    let seeding_nmi = normalized_mutual_info(&truth, &result.seeding_labels).expect("nmi");
    let final_nmi = normalized_mutual_info(&truth, &result.labels).expect("nmi");
    println!(
        "stop {:?} after {} iterations, NMI seeding {:.3}, final {:.3}",
        result.stop, result.iterations, seeding_nmi, final_nmi
    );
    assert!(seeding_nmi > 0.9, "seeding NMI {seeding_nmi}");
    assert!(final_nmi > 0.9, "final NMI {final_nmi}");
    assert!(result.iterations <= 200);
    assert_eq!(result.history.finish.map(|f| f.iterations), Some(result.iterations));

    let labels = inference::predict_labels(&result.model, features.view(), 128, &device).expect("predict");
    assert_eq!(labels.len(), features.nrows());
}

#[test]
fn test_weighted_target_with_population_ordering() {
    let device = init_cpu_device();
    let (features, _) = blobs(3, 60, 6, 5);
    let (spec_a, spec_b) = specs();
    let determinism = DeterminismConfig::new(9);
    let dual = syntof_models::DualBranchModel::<B>::new(
        spec_a.with_seed(1).build(&device).expect("branch a"),
        spec_b.with_seed(2).build(&device).expect("branch b"),
    );

    let config = ClusteringConfig::new(3)
        .with_seeding(SeedingConfig::mini_batch())
        .with_target(TargetKind::Weighted)
        .with_batch_size(32)
        .with_update_interval(4)
        .with_max_iter(12)
        .with_tol(-1.0);
    let result = fit_clustering(dual, features.view(), &config, &determinism, &mut NoopObserver, &device)
        .expect("clustering");

    assert_eq!(result.stop, StopReason::MaxIterReached);
    assert_eq!(result.iterations, 12);

    // Population ordering puts the largest seeding cluster first
    let mut counts = [0usize; 3];
    for &label in &result.seeding_labels {
        counts[label] += 1;
    }
    assert!(counts.windows(2).all(|w| w[0] >= w[1]), "counts {counts:?}");
}

#[test]
fn test_order_selection_on_pretrained_embedding() {
    let device = init_cpu_device();
    let (features, _) = blobs(6, 50, 6, 3);
    let (spec_a, spec_b) = specs();
    let (dual, _) = Pretrainer::<B>::new(
        PretrainConfig::default().with_epochs(5).with_batch_size(64),
        DeterminismConfig::new(2),
        &device,
    )
    .fit_dual(&spec_a, &spec_b, features.view(), 0, &mut NoopObserver)
    .expect("pretraining");

    let hidden = inference::embed(&dual, features.view(), 1024, &device).expect("embed");
    assert_eq!(hidden.dim(), (300, 5));

    let config = OrderSelectionConfig::default()
        .with_k_min(2)
        .with_max_k(12)
        .with_subsampling(1.0, 0)
        .with_smoothing(true)
        .with_n_init(3);
    let selection = select_cluster_count(hidden.view(), &config).expect("selection");
    println!("selected K = {} with {} segments", selection.k, selection.segments);
    assert!((2..=12).contains(&selection.k));
    assert!(selection.distortions.windows(2).all(|w| w[1] <= w[0]));
}
