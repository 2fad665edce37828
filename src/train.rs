//! Baseline derivation: train a reconstruction model on clean data and
//! package it with its reference error statistics.
//!
//! The feature follows the fire-and-poll contract: `start()` launches the
//! training task and returns, callers poll `is_task_running()`, and
//! `save()` persists the baseline archive once the task has completed.
//! Calling `save()` before a successful run is [`Error::NotTrained`].

use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::baseline::BaselinePackage;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingest::{batch_matrix, decode_batch, plan_batches, scan_source};
use crate::registry::ModelRegistry;
use crate::score::ErrorDistribution;
use crate::task::{CancelToken, TaskKind, TaskOutcome, TaskRunner, TaskState};

pub struct BaselineDerivation {
    config: Config,
    registry: Arc<ModelRegistry>,
    runner: TaskRunner,
    trained: Arc<Mutex<Option<BaselinePackage>>>,
}

impl std::fmt::Debug for BaselineDerivation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaselineDerivation").finish_non_exhaustive()
    }
}

impl BaselineDerivation {
    /// Validate the configuration and resolve the model plugin. An unknown
    /// plugin key fails here, before any task is started.
    pub fn new(config: Config, registry: Arc<ModelRegistry>) -> Result<Self> {
        config.validate()?;
        registry.resolve(&config.model.plugin)?;

        Ok(Self {
            config,
            registry,
            runner: TaskRunner::new(TaskKind::Training),
            trained: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the training task in the background.
    ///
    /// `epochs` and `batch_size` override the configured values when given.
    /// Fails with [`Error::AlreadyRunning`] while a previous task is in
    /// flight.
    pub fn start(&self, epochs: Option<usize>, batch_size: Option<usize>) -> Result<()> {
        let epochs = epochs.unwrap_or(self.config.epochs);
        let batch_size = batch_size.unwrap_or(self.config.batch_size);
        if epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be >= 1".into()));
        }
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be >= 1".into()));
        }

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let trained = Arc::clone(&self.trained);

        self.runner.start(move |cancel| {
            train_body(&config, &registry, epochs, batch_size, &cancel, &trained)
        })
    }

    /// Persist the derived baseline as a zip archive.
    ///
    /// Only valid after a training task has completed; a runner that is
    /// idle, running, stopped, or failed has no baseline to save.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if self.runner.state() != TaskState::Completed {
            return Err(Error::NotTrained);
        }
        let guard = self.trained.lock().unwrap();
        let package = guard.as_ref().ok_or(Error::NotTrained)?;
        package.save(path)?;
        tracing::info!(path = %path.display(), "baseline archive saved");
        Ok(())
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

    /// Request cancellation; honored at the next batch boundary.
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

    /// Await task completion instead of polling.
    pub async fn wait(&self) {
        self.runner.wait().await;
    }
}

fn train_body(
    config: &Config,
    registry: &ModelRegistry,
    epochs: usize,
    batch_size: usize,
    cancel: &CancelToken,
    trained: &Mutex<Option<BaselinePackage>>,
) -> Result<TaskOutcome> {
    let items = scan_source(&config.source_data, &config.include_globs)?;
    if items.is_empty() {
        return Err(Error::TaskFailed(format!(
            "no source images matched under {}",
            config.source_data.display()
        )));
    }

    let batches = plan_batches(&items, batch_size, 1);
    tracing::info!(
        items = items.len(),
        batches = batches.len(),
        epochs,
        "training pass planned"
    );

    let plugin = registry.resolve(&config.model.plugin)?;
    let mut model = plugin.create(&config.model)?;
    let side = config.model.input_side;

    for epoch in 1..=epochs {
        let mut epoch_loss = 0.0f32;
        let mut fitted = 0usize;

        for batch in &batches {
            if cancel.is_cancelled() {
                return Ok(TaskOutcome::Stopped);
            }

            let (decoded, _skipped) = decode_batch(batch, side);
            if decoded.is_empty() {
                continue;
            }

            let matrix = batch_matrix(&decoded)?;
            epoch_loss += model.fit_batch(&matrix)?;
            fitted += 1;
        }

        if fitted == 0 {
            return Err(Error::TaskFailed(
                "no batch produced any decodable item".into(),
            ));
        }

        tracing::debug!(epoch, loss = epoch_loss / fitted as f32, "epoch finished");
    }

    // Second pass: the reference error distribution of the trained model
    // over the training set.
    let mut reference = ErrorDistribution::new(config.scoring.max_reference_sample);
    for batch in &batches {
        if cancel.is_cancelled() {
            return Ok(TaskOutcome::Stopped);
        }

        let (decoded, _skipped) = decode_batch(batch, side);
        for item in &decoded {
            reference.record(model.reconstruction_error(item.pixels.view()));
        }
    }

    if reference.is_empty() {
        return Err(Error::TaskFailed(
            "reference pass produced no error samples".into(),
        ));
    }

    tracing::info!(
        mean = reference.mean(),
        std_dev = reference.std_dev(),
        samples = reference.count(),
        "reference statistics derived"
    );

    let package = BaselinePackage::new(
        model.model_type().to_string(),
        model.input_dim(),
        reference,
        model.to_weights()?,
    );
    *trained.lock().unwrap() = Some(package);

    Ok(TaskOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn unknown_plugin_fails_at_construction() {
        let config = {
            let mut c = Config::new("/tmp/in", "/tmp/out");
            c.model.plugin = "unknownae".to_string();
            c
        };
        let err =
            BaselineDerivation::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap_err();
        assert!(matches!(err, Error::UnknownPlugin(_)));
    }

    #[tokio::test]
    async fn save_before_any_run_is_not_trained() {
        let tmp = TempDir::new().unwrap();
        let feature = BaselineDerivation::new(
            Config::new(tmp.path(), tmp.path().join("out")),
            Arc::new(ModelRegistry::with_builtins()),
        )
        .unwrap();

        let err = feature.save(&tmp.path().join("baseline.zip")).unwrap_err();
        assert!(matches!(err, Error::NotTrained));
    }

    #[tokio::test]
    async fn missing_source_directory_fails_the_task() {
        let tmp = TempDir::new().unwrap();
        let config = Config::new(tmp.path().join("nope"), tmp.path().join("out"));
        let feature =
            BaselineDerivation::new(config, Arc::new(ModelRegistry::with_builtins())).unwrap();

        feature.start(Some(1), Some(4)).unwrap();
        feature.wait().await;

        assert_eq!(feature.task_state(), TaskState::Failed);
        assert!(matches!(
            feature.save(&tmp.path().join("baseline.zip")),
            Err(Error::NotTrained)
        ));
    }

    #[test]
    fn zero_epoch_override_rejected() {
        let tmp = TempDir::new().unwrap();
        let feature = BaselineDerivation::new(
            Config::new(tmp.path(), tmp.path().join("out")),
            Arc::new(ModelRegistry::with_builtins()),
        )
        .unwrap();

        assert!(matches!(
            feature.start(Some(0), None),
            Err(Error::InvalidConfig(_))
        ));
    }
}
