//! # DriftScan
//!
//! A batch-oriented anomaly and drift detection engine for image datasets.
//!
//! DriftScan trains a reconstruction model on clean data, packages it with
//! its reference error statistics as a baseline archive, and then scores
//! new data against that baseline: per-item anomaly verdicts and per-batch
//! drift measurements, written incrementally as CSV results.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌───────────────┐
//! │  Ingestor  │──▶│ Task Runner │──▶│  Result Sink  │
//! │ scan+batch │   │ train/score │   │ CSVs + images │
//! └────────────┘   └──────┬──────┘   └───────────────┘
//!                         │
//!                  ┌──────┴──────┐
//!                  │  Baseline   │
//!                  │ zip archive │
//!                  └─────────────┘
//! ```
//!
//! All three features share the same lifecycle: `start()` launches a
//! background task and returns immediately, `is_task_running()` is polled,
//! `stop()` cancels at the next batch boundary, and a registered `alert`
//! callback fires once when the task finishes (`None` on clean completion,
//! a status log otherwise).
//!
//! ## Quick Start
//!
//! ```bash
//! drsc baseline --source ./data/clean      # train and save baseline.zip
//! drsc detect --source ./data/day1         # score against the baseline
//! drsc drift --source ./data/day1 ./data/day2
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`registry`] | Model plugin registry |
//! | [`model`] | Reconstruction model trait and built-in autoencoder |
//! | [`ingest`] | Source scanning, batching, and image decoding |
//! | [`score`] | Error distributions, thresholds, and drift distance |
//! | [`baseline`] | Baseline archive (model + reference statistics) |
//! | [`task`] | Fire-and-poll task lifecycle |
//! | [`sink`] | CSV results, flagged-image copies, diagnostics |
//! | [`train`] | Baseline derivation feature |
//! | [`detect`] | Anomaly detection feature |
//! | [`drift`] | Drift detection feature |

pub mod baseline;
pub mod config;
pub mod detect;
pub mod drift;
pub mod error;
pub mod ingest;
pub mod model;
pub mod registry;
pub mod score;
pub mod sink;
pub mod task;
pub mod train;

pub use baseline::BaselinePackage;
pub use config::{load_config, Config};
pub use detect::AnomalyDetection;
pub use drift::DriftDetection;
pub use error::{Error, Result};
pub use registry::ModelRegistry;
pub use task::TaskState;
pub use train::BaselineDerivation;
