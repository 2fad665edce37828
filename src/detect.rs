//! Anomaly detection: score a directory of images against a baseline and
//! write per-item verdicts to the result sink.
//!
//! The baseline archive is loaded and the model plugin resolved at
//! construction time, so a bad archive path or unknown model type surfaces
//! before any task starts. Results are flushed per batch; stopping a run
//! leaves all batches processed so far in the output.

use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::baseline::BaselinePackage;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{decode_batch, plan_batches, scan_source};
use crate::registry::ModelRegistry;
use crate::score::{latent_norm, score_batch};
use crate::sink::{read_label_file, AnomalySink};
use crate::task::{CancelToken, TaskKind, TaskOutcome, TaskRunner, TaskState};

/// Counters for the most recent detection run, updated per batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionSummary {
    pub batches: usize,
    pub items: usize,
    pub flagged: usize,
    pub skipped: usize,
}

pub struct AnomalyDetection {
    config: Config,
    registry: Arc<ModelRegistry>,
    runner: TaskRunner,
    baseline: Arc<BaselinePackage>,
    summary: Arc<Mutex<DetectionSummary>>,
}

impl std::fmt::Debug for AnomalyDetection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnomalyDetection").finish_non_exhaustive()
    }
}

impl AnomalyDetection {
    /// Load the baseline archive and resolve its model plugin.
    pub fn new(config: Config, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;

        let baseline_path = config.baseline.as_ref().ok_or_else(|| {
            Error::InvalidConfig("anomaly detection requires a baseline archive path".into())
        })?;
        let baseline = BaselinePackage::load(baseline_path)?;
        registry.resolve(&baseline.manifest.model_type)?;

        Ok(Self {
            config,
            registry,
            runner: TaskRunner::new(TaskKind::Detection),
            baseline: Arc::new(baseline),
            summary: Arc::new(Mutex::new(DetectionSummary::default())),
        })
    }

    /// Start the detection task in the background.
    ///
    /// `batch_size` overrides the configured value when given. Fails with
    /// [`Error::AlreadyRunning`] while a previous task is in flight.
    pub fn start(&self, batch_size: Option<usize>) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(batch_size) = batch_size {
            if batch_size == 0 {
                return Err(Error::InvalidConfig("batch_size must be >= 1".into()));
            }
            config.batch_size = batch_size;
        }
        let registry = Arc::clone(&self.registry);
        let baseline = Arc::clone(&self.baseline);
        let summary = Arc::clone(&self.summary);

        self.runner
            .start(move |cancel| detect_body(&config, &registry, &baseline, &summary, &cancel))
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

    /// Request cancellation; honored at the next batch boundary. Batches
    /// already flushed stay in the output.
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

    /// Counters of the most recent run (live while the task runs).
    pub fn summary(&self) -> DetectionSummary {
        *self.summary.lock().unwrap()
    }

    /// Await task completion instead of polling.
    pub async fn wait(&self) {
        self.runner.wait().await;
    }
}

fn detect_body(
    config: &Config,
    registry: &ModelRegistry,
    baseline: &BaselinePackage,
    summary: &Mutex<DetectionSummary>,
    cancel: &CancelToken,
) -> Result<TaskOutcome> {
    *summary.lock().unwrap() = DetectionSummary::default();

    let items = scan_source(&config.source_data, &config.include_globs)?;
    let batches = plan_batches(&items, config.batch_size, 1);

    let model = baseline.restore_model(registry)?;
    let threshold = baseline.reference.threshold(config.scoring.sigma_k);
    tracing::info!(
        items = items.len(),
        batches = batches.len(),
        threshold,
        "detection pass planned"
    );

    let labels = match &config.label_file {
        Some(path) => Some(read_label_file(path)?),
        None => None,
    };
    let mut sink = AnomalySink::create(&config.output_data, labels)?;
    let side = config.model.input_side;

    for batch in &batches {
        if cancel.is_cancelled() {
            return Ok(TaskOutcome::Stopped);
        }

        let (decoded, skipped) = decode_batch(batch, side);
        let scored = score_batch(
            model.as_ref(),
            &decoded,
            batch.seq,
            threshold,
            config.scoring.max_reference_sample,
        );

        let flagged = sink.write_batch(&scored.verdicts)?;
        let norms: Vec<f32> = decoded
            .iter()
            .map(|item| latent_norm(model.as_ref(), item.pixels.view()))
            .collect();
        sink.write_cluster(batch.seq, &scored.verdicts, &norms)?;

        let mut s = summary.lock().unwrap();
        s.batches += 1;
        s.items += decoded.len();
        s.flagged += flagged;
        s.skipped += skipped;

        tracing::debug!(
            batch = batch.seq,
            items = decoded.len(),
            flagged,
            skipped,
            "batch scored"
        );
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
            AnomalyDetection::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn nonexistent_baseline_archive_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::new(tmp.path(), tmp.path().join("out"));
        config.baseline = Some(tmp.path().join("missing.zip"));
        let err =
            AnomalyDetection::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn baseline_with_unknown_model_type_rejected() {
        use crate::score::ErrorDistribution;

        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("foreign.zip");
        let mut reference = ErrorDistribution::new(10);
        reference.record(0.01);
        BaselinePackage::new("customae".into(), 64, reference, b"{}".to_vec())
            .save(&path)
            .unwrap();

        let mut config = Config::new(tmp.path(), tmp.path().join("out"));
        config.baseline = Some(path);
        let err =
            AnomalyDetection::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap_err();
        assert!(matches!(err, Error::UnknownPlugin(_)));
    }
}
