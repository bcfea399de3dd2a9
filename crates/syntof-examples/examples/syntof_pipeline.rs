//! synTOF deep-clustering pipeline.
//!
//! Runs the stages of a synTOF session over CSV event files (one file per
//! sample, header row of channel names) found in the data directory.
//!
//! # Usage
//!
//! ```bash
//! # Everything: pretrain, choose K, cluster, export labels and embeddings
//! cargo run --example syntof_pipeline --release -- \
//!   --base-dir /mnt/syntof --identifier BA9LowNo run --prefix BA9_LowNo --hidden
//!
//! # Individual stages
//! cargo run --example syntof_pipeline --release -- pretrain --prefix BA9_LowNo
//! cargo run --example syntof_pipeline --release -- select-k --prefix BA9_LowNo
//! cargo run --example syntof_pipeline --release -- fit --prefix BA9_LowNo --clusters 14,15,16
//! cargo run --example syntof_pipeline --release -- fit --prefix BA9_LowNo   # uses select-k's table
//!
//! # Label held-out samples with the persisted joint models
//! cargo run --example syntof_pipeline --release -- predict --prefix BA9_LBD --name predLBD
//!
//! # Synthetic demo, no input files needed
//! cargo run --example syntof_pipeline --release -- --base-dir /tmp/syntof demo
//! ```
//!
//! Logging is controlled with `RUST_LOG` (e.g. `RUST_LOG=syntof_cluster=debug`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use syntof_cluster::{OrderSelectionConfig, PretrainConfig};
use syntof_core::config::{PathArgs, PathConfig};
use syntof_core::normalized_mutual_info;
use syntof_examples::io;
use syntof_examples::{
    failures, gaussian_blobs, successes, BlobConfig, BranchConfig, Pipeline, PipelineConfig,
};
use tracing_subscriber::EnvFilter;

#[cfg(not(feature = "gpu"))]
type Backend = syntof_core::TrainBackend;
#[cfg(feature = "gpu")]
type Backend = syntof_core::GpuTrainBackend;

/// synTOF: dual-autoencoder deep clustering of single-synapse mass cytometry events
#[derive(Parser, Debug)]
#[command(author, version, about = "Deep embedded clustering for synTOF event data")]
struct Cli {
    /// Pipeline configuration (TOML); defaults reproduce the reference session
    #[arg(long, env = "SYNTOF_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the run identifier
    #[arg(long)]
    identifier: Option<String>,

    /// Override the number of repetitions
    #[arg(long)]
    repetitions: Option<usize>,

    /// Path configuration (data, output and weights directories)
    #[command(flatten)]
    paths: PathArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pretrain both autoencoder branches for every repetition
    Pretrain {
        /// Reference files: CSV names starting with this prefix
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Choose the cluster count of every repetition from its distortion curve
    SelectK {
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Deep clustering from pretrained branches; exports labels
    Fit {
        #[arg(long)]
        prefix: Option<String>,

        /// Cluster count per repetition (comma-separated); read from the select-k table when omitted
        #[arg(long, value_delimiter = ',')]
        clusters: Vec<usize>,
    },
    /// Label new samples with the persisted joint models
    Predict {
        #[arg(long)]
        prefix: Option<String>,

        /// Table name for the exported labels
        #[arg(long, default_value = "pred")]
        name: String,
    },
    /// Export the joint embedding of every repetition
    Hidden {
        #[arg(long)]
        prefix: Option<String>,
    },
    /// All stages on the reference files
    Run {
        #[arg(long)]
        prefix: Option<String>,

        /// Also export the joint embeddings
        #[arg(long)]
        hidden: bool,
    },
    /// Generate synthetic blobs and run all stages on them
    Demo {
        #[arg(long, default_value = "5")]
        clusters: usize,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

fn print_banner() {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         synTOF Deep Clustering                               ║");
    println!("║         Dual-autoencoder DEC with automatic cluster count    ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");
}

fn print_failures(stage: &str, failed: &[usize]) {
    if !failed.is_empty() {
        println!("  ✗ {stage} failed for repetitions {failed:?} (see log)");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    print_banner();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_toml_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(identifier) = &cli.identifier {
        config = config.with_identifier(identifier.clone());
    }
    if let Some(repetitions) = cli.repetitions {
        config = config.with_repetitions(repetitions);
    }

    let paths = PathConfig::from_path_args(cli.paths.clone());
    paths.print_summary();
    println!();

    #[cfg(not(feature = "gpu"))]
    let device = syntof_core::init_cpu_device();
    #[cfg(feature = "gpu")]
    let device = syntof_core::init_gpu_device();

    match cli.command {
        Command::Pretrain { prefix } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let raw = pipeline.load_features(prefix.as_deref())?;
            let features = pipeline.standardize_reference(&raw)?;
            println!("Pretraining {} repetitions on {} events...", pipeline.config().repetitions, features.n_rows());
            let outcomes = pipeline.pretrain(&features);
            print_failures("pretraining", &failures(&outcomes));
            for (_, reports) in successes(outcomes) {
                for report in reports {
                    println!("  ✓ {report}");
                }
            }
        }

        Command::SelectK { prefix } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let features = pipeline.standardize(&pipeline.load_features(prefix.as_deref())?)?;
            let outcomes = pipeline.select_cluster_counts(&features);
            print_failures("selection", &failures(&outcomes));
            let counts: Vec<usize> = successes(outcomes)
                .into_iter()
                .map(|(rep, selection)| {
                    println!("  rep {rep}: K = {} ({} segments)", selection.k, selection.segments);
                    selection.k
                })
                .collect();
            println!("\nCluster counts: {}", counts.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(","));
            println!("Written to {}", pipeline.cluster_numbers_path().display());
        }

        Command::Fit { prefix, clusters } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let features = pipeline.standardize(&pipeline.load_features(prefix.as_deref())?)?;

            let n_clusters: Vec<(usize, usize)> = if clusters.is_empty() {
                println!("No --clusters given, reading {}", pipeline.cluster_numbers_path().display());
                pipeline.load_cluster_numbers()?
            } else {
                anyhow::ensure!(
                    clusters.len() == pipeline.config().repetitions,
                    "{} cluster counts given for {} repetitions",
                    clusters.len(),
                    pipeline.config().repetitions
                );
                clusters.into_iter().enumerate().collect()
            };

            let outcomes = pipeline.fit_predict(&features, &n_clusters);
            print_failures("clustering", &failures(&outcomes));
            let fits = successes(outcomes);
            for (rep, fit) in &fits {
                println!(
                    "  ✓ rep {rep}: K = {}, {:?} after {} iterations",
                    fit.n_clusters, fit.stop, fit.iterations
                );
            }
            let labels: Vec<(usize, Vec<usize>)> = fits.into_iter().map(|(rep, fit)| (rep, fit.labels)).collect();
            let path = pipeline.export_labels("labels", &labels, &features.sample)?;
            println!("\nLabels written to {}", path.display());
        }

        Command::Predict { prefix, name } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let features = pipeline.standardize(&pipeline.load_features(prefix.as_deref())?)?;
            let outcomes = pipeline.predict(&features);
            print_failures("prediction", &failures(&outcomes));
            let labels = successes(outcomes);
            anyhow::ensure!(!labels.is_empty(), "no joint model could label the data");
            let path = pipeline.export_labels(&name, &labels, &features.sample)?;
            println!("Labels for {} events written to {}", features.n_rows(), path.display());
        }

        Command::Hidden { prefix } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let features = pipeline.standardize(&pipeline.load_features(prefix.as_deref())?)?;
            let outcomes = pipeline.hidden(&features);
            print_failures("embedding", &failures(&outcomes));
            let path = pipeline.export_hidden(&successes(outcomes), &features.sample)?;
            println!("Embeddings written to {}", path.display());
        }

        Command::Run { prefix, hidden } => {
            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let summary = pipeline.run(prefix.as_deref(), hidden)?;
            print_failures("pipeline", &summary.failed);
            println!("Cluster counts: {:?}", summary.n_clusters);
            println!("Labels written to {}", summary.labels_path.display());
            if let Some(path) = &summary.hidden_path {
                println!("Embeddings written to {}", path.display());
            }
            println!("Pairwise NMI between repetitions:\n{:.3}", summary.stability);
        }

        Command::Demo { clusters, seed } => {
            let blobs = BlobConfig::default().with_clusters(clusters).with_seed(seed);
            let data = gaussian_blobs(&blobs)?;
            paths.ensure_dirs().context("Failed to create demo directories")?;
            for sample in &data.samples {
                let name = PathBuf::from(&sample.source);
                io::write_events(&paths.data_dir().join(&name), sample)?;
            }
            println!(
                "Wrote {} synthetic samples ({} events, {} true clusters) to {}",
                data.samples.len(),
                data.n_events(),
                clusters,
                paths.data_dir().display()
            );

            let config = config
                .with_identifier("demo")
                .with_repetitions(cli.repetitions.unwrap_or(2))
                .with_denylist(Vec::new())
                .with_branches(BranchConfig::new(vec![32, 16, 3]), BranchConfig::new(vec![32, 16, 2]))
                .with_pretrain(PretrainConfig::default().with_epochs(30).with_batch_size(256).with_patience(3))
                .with_selection(
                    OrderSelectionConfig::default()
                        .with_k_min(2)
                        .with_max_k(12)
                        .with_subsampling(1.0, 0)
                        .with_n_init(5),
                );
            let clustering = config.clustering.with_batch_size(256).with_update_interval(20);
            let config = config.with_clustering(clustering);

            let pipeline = Pipeline::<Backend>::new(config, paths, device)?;
            let summary = pipeline.run(Some("synthetic_blobs"), false)?;
            print_failures("demo", &summary.failed);
            for (rep, labels) in &summary.labels {
                let nmi = normalized_mutual_info(&data.truth, labels)?;
                println!("  rep {rep}: NMI against truth = {nmi:.3}");
            }
            println!("Labels written to {}", summary.labels_path.display());
        }
    }

    Ok(())
}
