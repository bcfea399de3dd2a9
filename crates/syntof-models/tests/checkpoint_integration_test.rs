//! Weight persistence across every autoencoder variant.

use approx::assert_abs_diff_eq;
use burn::tensor::{Tensor, TensorData};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use syntof_core::{init_cpu_device, tensor_to_array, CpuBackend, SyntofError};
use syntof_models::{
    ArchitectureSpec, AutoencoderVariant, BranchId, DeepClusteringModel, DualBranchModel, SoftAssignment, WeightStore,
};
use tempfile::tempdir;

const VARIANTS: [AutoencoderVariant; 6] = [
    AutoencoderVariant::Plain,
    AutoencoderVariant::Noise,
    AutoencoderVariant::Dropout,
    AutoencoderVariant::L2,
    AutoencoderVariant::BatchNorm,
    AutoencoderVariant::SelfNormalizing,
];

fn batch(rows: usize, cols: usize) -> Tensor<CpuBackend, 2> {
    let values: Vec<f32> = (0..rows * cols).map(|i| ((i * 7 % 13) as f32 - 6.0) / 3.0).collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), &init_cpu_device())
}

#[test]
fn test_joint_round_trip_every_variant() {
    let device = init_cpu_device();
    let dir = tempdir().expect("tempdir");
    let store = WeightStore::new(dir.path());

    for (rep, variant) in VARIANTS.into_iter().enumerate() {
        let spec_a = ArchitectureSpec::variant(vec![6, 10, 3], variant).with_seed(rep as u64);
        let spec_b = ArchitectureSpec::variant(vec![6, 8, 2], variant).with_seed(100 + rep as u64);
        let dual = DualBranchModel::new(
            spec_a.build::<CpuBackend>(&device).expect("build a"),
            spec_b.build::<CpuBackend>(&device).expect("build b"),
        );
        let model = DeepClusteringModel::new(dual, SoftAssignment::new(4, 5, 1.0, &device));

        store.save_joint("roundtrip", rep, &model).expect("save joint");
        let loaded = store
            .load_joint::<CpuBackend>("roundtrip", rep, &device)
            .expect("load joint");

        let x = batch(12, 6);
        let before = tensor_to_array(model.predict_q(x.clone())).expect("q before");
        let after = tensor_to_array(loaded.predict_q(x)).expect("q after");
        println!("{variant:?}: max |dq| = {}", (&before - &after).mapv(f32::abs).fold(0.0f32, |a, &b| a.max(b)));
        for (b, a) in before.iter().zip(after.iter()) {
            assert_abs_diff_eq!(*b, *a, epsilon = 1e-6);
        }
        assert_eq!(loaded.n_clusters(), 4);
        assert_eq!(loaded.assignment.alpha(), 1.0);
    }
}

#[test]
fn test_branch_round_trip_and_architecture_guard() {
    let device = init_cpu_device();
    let dir = tempdir().expect("tempdir");
    let store = WeightStore::new(dir.path());

    let spec = ArchitectureSpec::variant(vec![5, 7, 2], AutoencoderVariant::BatchNorm).with_seed(3);
    let branch = spec.build::<CpuBackend>(&device).expect("build");
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    for _ in 0..3 {
        branch.forward_train(batch(16, 5), &mut rng);
    }
    store.save_branch("guard", BranchId::B, 0, &branch).expect("save");

    let loaded = store
        .load_branch::<CpuBackend>("guard", BranchId::B, 0, &spec, &device)
        .expect("load with the same architecture");
    let x = batch(9, 5);
    let before = tensor_to_array(branch.encode(x.clone())).expect("encode");
    let after = tensor_to_array(loaded.encode(x)).expect("encode");
    for (b, a) in before.iter().zip(after.iter()) {
        assert_abs_diff_eq!(*b, *a, epsilon = 1e-6);
    }
    let names: Vec<String> = loaded.named_tensors().expect("tensors").into_iter().map(|t| t.name).collect();
    assert!(names.iter().any(|n| n == "layer0.running_mean"));
    assert_eq!(loaded.named_tensors().expect("tensors"), branch.named_tensors().expect("tensors"));

    let wider = ArchitectureSpec::variant(vec![5, 9, 2], AutoencoderVariant::BatchNorm);
    let err = store
        .load_branch::<CpuBackend>("guard", BranchId::B, 0, &wider, &device)
        .unwrap_err();
    assert!(matches!(err, SyntofError::IncompatibleWeights { .. }), "{err}");

    let plain = ArchitectureSpec::new(vec![5, 7, 2]);
    let err = store
        .load_branch::<CpuBackend>("guard", BranchId::B, 0, &plain, &device)
        .unwrap_err();
    assert!(matches!(err, SyntofError::IncompatibleWeights { .. }), "{err}");
}

#[test]
fn test_load_dual_requires_both_branches() {
    let device = init_cpu_device();
    let dir = tempdir().expect("tempdir");
    let store = WeightStore::new(dir.path());

    let spec_a = ArchitectureSpec::new(vec![4, 6, 2]);
    let spec_b = ArchitectureSpec::new(vec![4, 6, 1]);
    let branch_a = spec_a.build::<CpuBackend>(&device).expect("build");
    store.save_branch("half", BranchId::A, 2, &branch_a).expect("save");

    let err = store
        .load_dual::<CpuBackend>("half", 2, &spec_a, &spec_b, &device)
        .unwrap_err();
    assert!(matches!(err, SyntofError::MissingWeights { repetition: 2, .. }), "{err}");
}
