//! # DriftScan CLI (`drsc`)
//!
//! The `drsc` binary drives the DriftScan engine from the command line. It
//! loads a TOML configuration, starts the requested background task, polls
//! it to completion, and prints a short summary.
//!
//! ## Usage
//!
//! ```bash
//! drsc --config ./config/driftscan.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `drsc baseline` | Train a reconstruction model and save the baseline archive |
//! | `drsc detect` | Score a directory against the baseline, write verdicts |
//! | `drsc drift <dirs>...` | Measure drift across one or more source directories |
//! | `drsc plugins` | List registered model plugins |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use driftscan::{
    config, AnomalyDetection, BaselineDerivation, DriftDetection, ModelRegistry, TaskState,
};

/// DriftScan CLI — batch-oriented anomaly and drift detection for image
/// datasets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/driftscan.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "drsc",
    about = "DriftScan — batch-oriented anomaly and drift detection for image datasets",
    version,
    long_about = "DriftScan trains a reconstruction model on clean data, packages it as a \
    baseline archive, and scores new data against it: per-item anomaly verdicts and per-batch \
    drift measurements, written incrementally as CSV results."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/driftscan.toml")]
    config: PathBuf,

    /// Override the configured source directory.
    #[arg(long, global = true)]
    source: Option<PathBuf>,

    /// Override the configured output directory.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Train a reconstruction model on clean data and save the baseline.
    ///
    /// Runs the configured number of epochs over the source directory,
    /// derives the reference error statistics, and writes the baseline as
    /// a single zip archive.
    Baseline {
        /// Where to write the baseline archive.
        #[arg(long, default_value = "driftscan_baseline.zip")]
        out: PathBuf,

        /// Override the configured epoch count.
        #[arg(long)]
        epochs: Option<usize>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Score a source directory against the baseline.
    ///
    /// Writes per-item verdicts to `anomalies/anomaly_output.csv`, copies
    /// flagged images, and emits per-batch cluster diagnostics.
    Detect {
        /// Baseline archive to score against (overrides the config).
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Measure drift across one or more source directories, in order.
    ///
    /// Each directory is one run of the same drift instance: batch
    /// numbering continues across directories and the first batch of each
    /// run is compared against the last batch of the previous one. Results
    /// append to `absolute_drift_results.csv` and
    /// `relative_drift_results.csv`.
    Drift {
        /// Source directories, processed in the given order.
        #[arg(required = true)]
        sources: Vec<PathBuf>,

        /// Baseline archive to compare against (overrides the config).
        #[arg(long)]
        baseline: Option<PathBuf>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// List registered model plugins.
    Plugins,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(ModelRegistry::with_builtins());

    if let Commands::Plugins = cli.command {
        // Doesn't need config.
        println!("{:<12} DESCRIPTION", "PLUGIN");
        for name in registry.names() {
            let plugin = registry.resolve(name)?;
            println!("{:<12} {}", plugin.name(), plugin.description());
        }
        return Ok(());
    }

    let mut cfg = config::load_config(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    if let Some(source) = cli.source {
        cfg.source_data = source;
    }
    if let Some(output) = cli.output {
        cfg.output_data = output;
    }

    match cli.command {
        Commands::Baseline {
            out,
            epochs,
            batch_size,
        } => {
            let feature = BaselineDerivation::new(cfg, registry)?;
            feature.alert(print_alert);
            feature.start(epochs, batch_size)?;
            poll(|| feature.is_task_running()).await;

            if feature.task_state() == TaskState::Completed {
                feature.save(&out)?;
                println!("Baseline saved to {}", out.display());
            } else {
                anyhow::bail!("baseline task ended in state {:?}", feature.task_state());
            }
        }
        Commands::Detect {
            baseline,
            batch_size,
        } => {
            if baseline.is_some() {
                cfg.baseline = baseline;
            }
            let feature = AnomalyDetection::new(cfg.clone(), registry)?;
            feature.alert(print_alert);
            feature.start(batch_size)?;
            poll(|| feature.is_task_running()).await;

            let summary = feature.summary();
            println!(
                "Scored {} items in {} batches: {} flagged, {} skipped",
                summary.items, summary.batches, summary.flagged, summary.skipped
            );
            println!(
                "Results in {}",
                cfg.output_data.join("anomalies/anomaly_output.csv").display()
            );
            if feature.task_state() == TaskState::Failed {
                anyhow::bail!("detection task failed");
            }
        }
        Commands::Drift {
            sources,
            baseline,
            batch_size,
        } => {
            if baseline.is_some() {
                cfg.baseline = baseline;
            }
            let output = cfg.output_data.clone();
            let feature = DriftDetection::new(cfg, registry)?;
            feature.alert(print_alert);

            for source in &sources {
                feature.start(source, batch_size)?;
                poll(|| feature.is_task_running()).await;
                if feature.task_state() != TaskState::Completed {
                    anyhow::bail!(
                        "drift task for {} ended in state {:?}",
                        source.display(),
                        feature.task_state()
                    );
                }
            }

            println!("{:>6} {:>10} {:>9} {:>10} {:>9}", "BATCH", "ABSOLUTE", "DRIFT", "RELATIVE", "DRIFT");
            for m in feature.metrics() {
                let (rel, rel_flag) = match (m.relative, m.relative_detected) {
                    (Some(d), Some(f)) => (format!("{:.4}", d), yes_no(f).to_string()),
                    _ => ("-".to_string(), "-".to_string()),
                };
                println!(
                    "{:>6} {:>10.4} {:>9} {:>10} {:>9}",
                    m.batch,
                    m.absolute,
                    yes_no(m.absolute_detected),
                    rel,
                    rel_flag
                );
            }
            println!("Results in {}", output.display());
        }
        Commands::Plugins => unreachable!(),
    }

    Ok(())
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "YES"
    } else {
        "NO"
    }
}

/// Alert callback shared by all commands: prints the status log of a task
/// that did not complete cleanly.
fn print_alert(status: Option<String>) {
    if let Some(log) = status {
        eprintln!("task alert: {}", log);
    }
}

/// Poll the fire-and-poll lifecycle until the task leaves Running.
async fn poll<F: Fn() -> bool>(is_running: F) {
    while is_running() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
