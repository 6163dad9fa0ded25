//! mhaug CLI - multi-view augmented GNN training from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Generate a synthetic planted-partition dataset
//! mhaug generate -o graph.json --nodes 2000 --classes 5
//!
//! # Inspect it
//! mhaug stats graph.json --num-parts 4
//!
//! # Train with 4 workers, overriding parts of a JSON config
//! mhaug train --dataset graph.json --config train.json --num-parts 4 --epochs 10
//!
//! # Dry run: score augmentations without writing masks
//! mhaug --log-level debug train --nodes 500 --no-commit
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use mhaug_core::{Dataset, PlantedPartition};
use mhaug_nn::{TrainConfig, Trainer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mhaug")]
#[command(about = "Multi-view augmented GNN node classification", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a GraphSAGE model with Metropolis-Hastings augmentation
    Train {
        /// Dataset file (JSON); a synthetic graph is generated if omitted
        #[arg(long)]
        dataset: Option<PathBuf>,

        /// Training config (JSON); flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of partitions / worker threads
        #[arg(long)]
        num_parts: Option<usize>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Fan-out per layer, input layer first (e.g. "10,25")
        #[arg(long)]
        fan_out: Option<String>,

        /// Learning rate
        #[arg(long)]
        lr: Option<f64>,

        /// 0 = joint soft loss, 1 = asymmetric Jensen-Shannon
        #[arg(long)]
        option_loss: Option<u8>,

        /// Pad per-worker train seeds to the same length
        #[arg(long)]
        pad_data: bool,

        /// Score augmentations but never write masks
        #[arg(long)]
        no_commit: bool,

        #[arg(long)]
        seed: Option<u64>,

        /// Nodes of the synthetic graph (without --dataset)
        #[arg(long, default_value = "1000")]
        nodes: usize,

        /// Write the run summary as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a synthetic planted-partition dataset
    Generate {
        /// Output file (JSON)
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "1000")]
        nodes: usize,

        #[arg(long, default_value = "4")]
        classes: usize,

        #[arg(long, default_value = "16")]
        feature_dim: usize,

        /// Incoming edges per node
        #[arg(long, default_value = "8")]
        avg_degree: usize,

        /// Probability that an edge stays inside its class
        #[arg(long, default_value = "0.8")]
        homophily: f64,

        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Show statistics about a dataset
    Stats {
        /// Input file (JSON)
        input: PathBuf,

        /// Partitions to report
        #[arg(long, default_value = "1")]
        num_parts: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level: Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level {:?}", cli.log_level))?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Train {
            dataset,
            config,
            num_parts,
            epochs,
            batch_size,
            fan_out,
            lr,
            option_loss,
            pad_data,
            no_commit,
            seed,
            nodes,
            output,
        } => {
            let mut train = match config {
                Some(path) => TrainConfig::from_json_file(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => TrainConfig::default(),
            };
            if let Some(n) = num_parts {
                train.num_parts = n;
            }
            if let Some(n) = epochs {
                train.num_epochs = n;
            }
            if let Some(n) = batch_size {
                train.batch_size = n;
            }
            if let Some(f) = fan_out {
                train = train.with_fan_out(f);
            }
            if let Some(lr) = lr {
                train = train.with_learning_rate(lr);
            }
            if let Some(o) = option_loss {
                train.option_loss = o;
            }
            if let Some(s) = seed {
                train.seed = s;
            }
            train.pad_data |= pad_data;
            if no_commit {
                train.augment.commit = false;
            }
            cmd_train(train, dataset.as_deref(), nodes, output.as_deref())
        }
        Commands::Generate {
            output,
            nodes,
            classes,
            feature_dim,
            avg_degree,
            homophily,
            seed,
        } => {
            let generator = PlantedPartition {
                avg_degree,
                homophily,
                ..PlantedPartition::default()
            }
            .with_num_nodes(nodes)
            .with_num_classes(classes)
            .with_feature_dim(feature_dim)
            .with_seed(seed);
            cmd_generate(&generator, &output)
        }
        Commands::Stats { input, num_parts } => cmd_stats(&input, num_parts),
    }
}

fn load_dataset(path: &Path) -> Result<Dataset> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));
    let dataset = Dataset::from_json_file(path)
        .with_context(|| format!("Failed to load dataset {}", path.display()))?;
    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
    Ok(dataset)
}

fn cmd_train(
    config: TrainConfig,
    dataset: Option<&Path>,
    nodes: usize,
    output: Option<&Path>,
) -> Result<()> {
    config.validate().context("Invalid training config")?;

    let dataset = match dataset {
        Some(path) => load_dataset(path)?,
        None => PlantedPartition::default()
            .with_num_nodes(nodes)
            .with_seed(config.seed)
            .generate()
            .context("Failed to generate synthetic dataset")?,
    };
    let (store, splits) = dataset
        .into_store(config.num_parts)
        .context("Failed to partition graph")?;
    let (train, val, test) = splits.counts();
    if train == 0 {
        bail!("dataset has no training nodes");
    }
    tracing::info!(train, val, test, "dataset ready");

    let trainer = Trainer::new(config)?;
    let summary = trainer
        .fit(Arc::new(store), &splits)
        .context("Training failed")?;

    println!(
        "Summary of node classification(GraphSAGE) | TrainEpochTime(mean) {:.4} | \
         TestAccuracy {:.4}",
        summary.mean_epoch_time, summary.test_acc
    );

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Summary written to {}", path.display());
    }
    Ok(())
}

fn cmd_generate(generator: &PlantedPartition, output: &Path) -> Result<()> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Generating {} nodes...", generator.num_nodes));

    let dataset = generator.generate().context("Failed to generate dataset")?;
    dataset
        .to_json_file(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    pb.finish_with_message(format!("Generated in {:.2?}", start.elapsed()));
    println!(
        "Wrote {} nodes, {} edges to {}",
        dataset.num_nodes,
        dataset.edges.len(),
        output.display()
    );
    Ok(())
}

fn cmd_stats(input: &Path, num_parts: usize) -> Result<()> {
    let dataset = load_dataset(input)?;
    let (train, val, test) = dataset.splits.counts();
    let (store, _) = dataset
        .into_store(num_parts)
        .context("Failed to partition graph")?;
    let stats = store.stats();

    println!("Graph Statistics");
    println!("================");
    println!("Nodes:          {}", stats.num_nodes);
    println!("Edges:          {}", stats.num_edges);
    println!("Feature dim:    {}", stats.feature_dim);
    println!("Classes:        {}", stats.num_classes);
    println!("Partitions:     {}", stats.num_parts);
    println!("Avg in-degree:  {:.2}", stats.avg_in_degree);
    println!("Max in-degree:  {}", stats.max_in_degree);
    println!("No in-edges:    {}", stats.isolated);
    println!("Train/val/test: {train}/{val}/{test}");

    for part in 0..num_parts {
        let range = store.partition_book().part_nodes(part)?;
        let owned = store.owned_edges(part)?.len();
        println!(
            "  part {part}: nodes {}..{} ({} nodes, {owned} owned edges)",
            range.start,
            range.end,
            range.len()
        );
    }
    Ok(())
}
