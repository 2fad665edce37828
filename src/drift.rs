//! Drift detection: compare the error distribution of successive batches
//! against the baseline reference and against the previous batch.
//!
//! One instance is meant to observe a data stream over time: each `start()`
//! call processes one source directory (typically a day folder), and the
//! instance threads its state across calls. Batch numbering continues from
//! one run to the next, and the first batch of run N+1 is compared against
//! the last batch of run N. Absolute drift (vs. the baseline) is defined
//! for every batch; relative drift (vs. the previous batch) is undefined
//! for the very first batch an instance processes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::baseline::BaselinePackage;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{decode_batch, plan_batches, scan_source};
use crate::registry::ModelRegistry;
use crate::score::{ks_statistic, ErrorDistribution};
use crate::sink::{copy_into_images, DriftSink};
use crate::task::{CancelToken, TaskKind, TaskOutcome, TaskRunner, TaskState};

/// Drift measurements for one processed batch.
#[derive(Debug, Clone)]
pub struct DriftMetric {
    pub batch: usize,
    /// KS distance from the baseline reference distribution.
    pub absolute: f64,
    pub absolute_detected: bool,
    /// KS distance from the previous batch; `None` for the first batch an
    /// instance ever processes.
    pub relative: Option<f64>,
    pub relative_detected: Option<bool>,
}

pub struct DriftDetection {
    config: Config,
    registry: Arc<ModelRegistry>,
    runner: TaskRunner,
    baseline: Arc<BaselinePackage>,
    /// Error sample of the last processed batch, threaded across runs.
    previous: Arc<Mutex<Option<Vec<f32>>>>,
    /// Sequence number of the last processed batch; numbering continues
    /// across `start()` calls.
    last_seq: Arc<AtomicUsize>,
    metrics: Arc<Mutex<Vec<DriftMetric>>>,
}

impl std::fmt::Debug for DriftDetection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftDetection").finish_non_exhaustive()
    }
}

impl DriftDetection {
    /// Load the baseline archive and resolve its model plugin.
    pub fn new(config: Config, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;

        let baseline_path = config.baseline.as_ref().ok_or_else(|| {
            Error::InvalidConfig("drift detection requires a baseline archive path".into())
        })?;
        let baseline = BaselinePackage::load(baseline_path)?;
        registry.resolve(&baseline.manifest.model_type)?;

        Ok(Self {
            config,
            registry,
            runner: TaskRunner::new(TaskKind::Drift),
            baseline: Arc::new(baseline),
            previous: Arc::new(Mutex::new(None)),
            last_seq: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Start a drift task over one source directory.
    ///
    /// May be called repeatedly on the same instance, once per data slice;
    /// each call continues the batch numbering and carries the previous
    /// batch over for relative drift. `batch_size` overrides the configured
    /// value when given. Fails with [`Error::AlreadyRunning`] while a
    /// previous task is in flight.
    pub fn start(&self, source: &Path, batch_size: Option<usize>) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(batch_size) = batch_size {
            if batch_size == 0 {
                return Err(Error::InvalidConfig("batch_size must be >= 1".into()));
            }
            config.batch_size = batch_size;
        }
        let registry = Arc::clone(&self.registry);
        let baseline = Arc::clone(&self.baseline);
        let previous = Arc::clone(&self.previous);
        let last_seq = Arc::clone(&self.last_seq);
        let metrics = Arc::clone(&self.metrics);
        let source: PathBuf = source.to_path_buf();

        self.runner.start(move |cancel| {
            drift_body(
                &config, &registry, &baseline, &source, &previous, &last_seq, &metrics, &cancel,
            )
        })
    }

    pub fn is_task_running(&self) -> bool {
        self.runner.is_running()
    }

    pub fn task_state(&self) -> TaskState {
        self.runner.state()
    }

    pub fn current_task_id(&self) -> Option<Uuid> {
        self.runner.current_task_id()
    }

    /// Request cancellation; honored at the next batch boundary. Rows
    /// already appended to the drift logs stay in place.
    pub fn stop(&self) {
        self.runner.stop();
    }

    /// Register the completion alert. `None` means the task completed
    /// cleanly; otherwise the status log describes the stop or failure.
    pub fn alert<F>(&self, callback: F)
    where
        F: Fn(Option<String>) + Send + 'static,
    {
        self.runner.alert(callback);
    }

    /// All drift measurements this instance has produced, across runs.
    pub fn metrics(&self) -> Vec<DriftMetric> {
        self.metrics.lock().unwrap().clone()
    }

    /// Await task completion instead of polling.
    pub async fn wait(&self) {
        self.runner.wait().await;
    }
}

#[allow(clippy::too_many_arguments)]
fn drift_body(
    config: &Config,
    registry: &ModelRegistry,
    baseline: &BaselinePackage,
    source: &Path,
    previous: &Mutex<Option<Vec<f32>>>,
    last_seq: &AtomicUsize,
    metrics: &Mutex<Vec<DriftMetric>>,
    cancel: &CancelToken,
) -> Result<TaskOutcome> {
    let items = scan_source(source, &config.include_globs)?;
    let first_seq = last_seq.load(Ordering::SeqCst) + 1;
    let batches = plan_batches(&items, config.batch_size, first_seq);

    let model = baseline.restore_model(registry)?;
    let anomaly_threshold = baseline.reference.threshold(config.scoring.sigma_k);
    let drift_threshold = config.scoring.drift_threshold;
    tracing::info!(
        source = %source.display(),
        items = items.len(),
        first_batch = first_seq,
        "drift pass planned"
    );

    let mut sink = DriftSink::open(&config.output_data)?;
    let side = config.model.input_side;

    for batch in &batches {
        if cancel.is_cancelled() {
            return Ok(TaskOutcome::Stopped);
        }

        let (decoded, _skipped) = decode_batch(batch, side);
        if decoded.is_empty() {
            tracing::warn!(batch = batch.seq, "batch had no decodable item, skipping");
            continue;
        }

        let mut distribution = ErrorDistribution::new(config.scoring.max_reference_sample);
        for item in &decoded {
            let score = model.reconstruction_error(item.pixels.view());
            distribution.record(score);
            if score > anomaly_threshold {
                copy_into_images(&config.output_data, &item.record.path, &item.record.relative)?;
            }
        }

        let sample = distribution.sample().to_vec();
        let absolute = ks_statistic(baseline.reference.sample(), &sample);
        let absolute_detected = absolute > drift_threshold;

        let relative = previous
            .lock()
            .unwrap()
            .as_ref()
            .map(|prev| ks_statistic(prev, &sample));
        let relative_detected = relative.map(|d| d > drift_threshold);

        sink.append_absolute(batch.seq, absolute, absolute_detected)?;
        sink.append_relative(batch.seq, relative, relative_detected.unwrap_or(false))?;

        tracing::info!(
            batch = batch.seq,
            absolute,
            absolute_detected,
            relative = relative.unwrap_or(f64::NAN),
            "batch drift measured"
        );

        *previous.lock().unwrap() = Some(sample);
        last_seq.store(batch.seq, Ordering::SeqCst);
        metrics.lock().unwrap().push(DriftMetric {
            batch: batch.seq,
            absolute,
            absolute_detected,
            relative,
            relative_detected,
        });
    }

    Ok(TaskOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_baseline_path_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path(), tmp.path().join("out"));
        let err =
            DriftDetection::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn missing_source_directory_fails_the_task() {
        use crate::score::ErrorDistribution;

        let tmp = TempDir::new().unwrap();
        let baseline_path = tmp.path().join("baseline.zip");
        let mut reference = ErrorDistribution::new(10);
        for v in [0.01f32, 0.02, 0.03] {
            reference.record(v);
        }
        let model = crate::model::DenseAutoencoder::new(64, 4, 0.1);
        use crate::model::ReconstructionModel;
        BaselinePackage::new("dense".into(), 64, reference, model.to_weights().unwrap())
            .save(&baseline_path)
            .unwrap();

        let mut config = Config::new(tmp.path(), tmp.path().join("out"));
        config.baseline = Some(baseline_path);
        let feature =
            DriftDetection::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap();

        feature.start(&tmp.path().join("nope"), None).unwrap();
        feature.wait().await;
        assert_eq!(feature.task_state(), TaskState::Failed);
        assert!(feature.metrics().is_empty());
    }
}
