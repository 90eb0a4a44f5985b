//! The epoch loop.
//!
//! The orchestrator owns fitting: it pulls augmented batches, drives the model one
//! batch at a time, validates after every epoch and hands the epoch logs to the
//! callbacks in a fixed order (checkpoint, CSV logger, NaN terminator, optional
//! exponential decay, stall policy).

use crate::config::{ExperimentConfig, ExperimentDir};
use crate::data::Batch;
use crate::error::MlError;
use crate::model::SegmentationModel;
use crate::training::callbacks::{
    CallbackAction, CsvLogger, ExponentialDecay, ModelCheckpoint, StallPolicy, StopReason,
    TerminateOnNan, TrainingCallback,
};
use crate::training::checkpoint::CheckpointManager;
use crate::training::class_weights::ClassWeights;
use crate::training::experiment::{RunOutcome, TrainingRun};
use crate::training::metrics::{BatchAccumulator, EpochLogs};
use ndarray::Array4;
use std::time::{Duration, Instant};

pub struct TrainingOrchestrator {
    name: String,
    epochs: usize,
    steps_per_epoch: usize,
    class_weights: ClassWeights,
    checkpoint: ModelCheckpoint,
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl TrainingOrchestrator {
    /// An orchestrator with only the checkpoint callback attached.
    ///
    /// `steps_per_epoch` is raised to 1 so every epoch trains on at least one batch.
    pub fn new(
        name: &str,
        epochs: usize,
        steps_per_epoch: usize,
        class_weights: ClassWeights,
        checkpoint: CheckpointManager,
    ) -> Self {
        Self {
            name: name.to_string(),
            epochs,
            steps_per_epoch: steps_per_epoch.max(1),
            class_weights,
            checkpoint: ModelCheckpoint::new(checkpoint),
            callbacks: Vec::new(),
        }
    }

    /// Attach a callback; it runs after every callback attached before it.
    pub fn with_callback(mut self, callback: Box<dyn TrainingCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// The standard callback stack for an experiment.
    pub fn from_config(
        config: &ExperimentConfig,
        dir: &ExperimentDir,
        steps_per_epoch: usize,
        class_weights: ClassWeights,
    ) -> Self {
        let mut orchestrator = Self::new(
            &config.experiment_name,
            config.epochs,
            steps_per_epoch,
            class_weights,
            CheckpointManager::new(dir.checkpoint_path(), dir.checkpoint_manifest_path()),
        )
        .with_callback(Box::new(CsvLogger::new(dir.log_path())))
        .with_callback(Box::new(TerminateOnNan));

        if config.lr_scheduler {
            orchestrator = orchestrator.with_callback(Box::new(ExponentialDecay::new(config.lr)));
        }

        let policy = StallPolicy::from_config(config);
        tracing::info!(?policy, "Stall policy selected");
        orchestrator.with_callback(policy.into_callback())
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// Callback names in execution order.
    pub fn callback_names(&self) -> Vec<&'static str> {
        std::iter::once(self.checkpoint.name())
            .chain(self.callbacks.iter().map(|cb| cb.name()))
            .collect()
    }

    /// Run the epoch loop to completion, early stop or NaN abort.
    ///
    /// `val_masks` are one-hot. A NaN abort is an outcome, not an error.
    pub fn fit<I>(
        &mut self,
        model: &mut dyn SegmentationModel,
        mut batches: I,
        val_images: &Array4<f32>,
        val_masks: &Array4<f32>,
    ) -> Result<TrainingRun, MlError>
    where
        I: Iterator<Item = Batch>,
    {
        let mut run = TrainingRun::new(
            &self.name,
            self.checkpoint.manager().weights_path().to_path_buf(),
        );
        run.begin()?;
        tracing::info!(
            run_id = %run.id,
            epochs = self.epochs,
            steps_per_epoch = self.steps_per_epoch,
            callbacks = ?self.callback_names(),
            "Starting training"
        );

        self.checkpoint.on_train_begin()?;
        for cb in &mut self.callbacks {
            cb.on_train_begin()?;
        }

        let started = Instant::now();
        let mut outcome = RunOutcome::Converged;

        for epoch in 0..self.epochs {
            for cb in &mut self.callbacks {
                cb.on_epoch_begin(epoch, model)?;
            }
            let lr = model.learning_rate()?;

            let mut acc = BatchAccumulator::default();
            for step in 0..self.steps_per_epoch {
                let (images, masks) = batches.next().ok_or_else(|| {
                    MlError::training(format!(
                        "batch stream ended at epoch {} step {}",
                        epoch + 1,
                        step + 1
                    ))
                })?;
                acc.add(model.train_on_batch(&images, &masks, &self.class_weights)?);
            }
            let val = model.evaluate(val_images, val_masks)?;
            let logs = EpochLogs::new(epoch, acc.mean(), val, lr);

            tracing::info!(
                epoch = epoch + 1,
                loss = logs.loss,
                accuracy = logs.accuracy,
                val_loss = logs.val_loss,
                val_accuracy = logs.val_accuracy,
                lr,
                "Epoch {}/{}",
                epoch + 1,
                self.epochs
            );
            run.record_epoch(logs)?;

            let mut actions = vec![self.checkpoint.on_epoch_end(epoch, &logs, model)?];
            for cb in &mut self.callbacks {
                actions.push(cb.on_epoch_end(epoch, &logs, model)?);
            }

            match strongest_stop(&actions) {
                Some(StopReason::NonFiniteLoss) => {
                    outcome = RunOutcome::NanAborted { epoch };
                    break;
                }
                Some(StopReason::Stalled) => {
                    outcome = RunOutcome::EarlyStopped { epoch };
                    break;
                }
                None => {}
            }
        }

        tracing::info!("Training took {}", format_duration(started.elapsed()));

        run.best_checkpoint = self.checkpoint.last().cloned();
        run.checkpoint_writes = self.checkpoint.writes();
        run.stop(outcome)?;
        run.finalize()?;

        tracing::info!(
            run_id = %run.id,
            ?outcome,
            epochs = run.history.epochs_completed(),
            checkpoint_writes = run.checkpoint_writes,
            best_val_loss = ?run.history.best_val_loss,
            "Stopped training"
        );
        Ok(run)
    }
}

/// A NaN abort outranks a stall.
fn strongest_stop(actions: &[CallbackAction]) -> Option<StopReason> {
    let reasons = actions.iter().filter_map(|action| match action {
        CallbackAction::Stop(reason) => Some(*reason),
        CallbackAction::Continue => None,
    });
    let mut strongest = None;
    for reason in reasons {
        if reason == StopReason::NonFiniteLoss {
            return Some(reason);
        }
        strongest = Some(reason);
    }
    strongest
}

/// `H h M min S sec`.
pub fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h} h {m} min {s} sec")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NUM_CLASSES;
    use crate::model::{BatchLogs, ModelSpec, PixelSoftmaxModel};
    use crate::training::callbacks::EarlyStopping;
    use crate::training::experiment::RunStatus;
    use crate::training::loss::LossFunction;
    use crate::training::optimizer::Adam;
    use crate::training::optimizer::Optimizer;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::TempDir;

    fn batches() -> impl Iterator<Item = Batch> {
        std::iter::repeat_with(|| {
            let images = Array4::<f32>::from_elem((1, 2, 2, 1), 0.5);
            let mut masks = Array4::<f32>::zeros((1, 2, 2, NUM_CLASSES));
            masks.slice_mut(ndarray::s![.., .., .., 1]).fill(1.0);
            (images, masks)
        })
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(dir.join("w.json"), dir.join("checkpoints.json"))
    }

    /// Replays a fixed validation-loss script.
    struct ScriptedModel {
        val_losses: Vec<f64>,
        evaluated: std::cell::Cell<usize>,
        optimizer: Adam,
    }

    impl ScriptedModel {
        fn new(val_losses: Vec<f64>) -> Self {
            Self {
                val_losses,
                evaluated: std::cell::Cell::new(0),
                optimizer: Adam::new(1e-3),
            }
        }
    }

    impl SegmentationModel for ScriptedModel {
        fn compile(&mut self, _loss: LossFunction, _optimizer: Box<dyn Optimizer>) {}

        fn train_on_batch(
            &mut self,
            _images: &Array4<f32>,
            _masks: &Array4<f32>,
            _weights: &ClassWeights,
        ) -> Result<BatchLogs, MlError> {
            Ok(BatchLogs {
                loss: 1.0,
                ..Default::default()
            })
        }

        fn evaluate(&self, _images: &Array4<f32>, _masks: &Array4<f32>) -> Result<BatchLogs, MlError> {
            let i = self.evaluated.get();
            self.evaluated.set(i + 1);
            Ok(BatchLogs {
                loss: self.val_losses[i],
                ..Default::default()
            })
        }

        fn predict(&self, images: &Array4<f32>) -> Result<Array4<f32>, MlError> {
            let (n, h, w, _) = images.dim();
            Ok(Array4::zeros((n, h, w, NUM_CLASSES)))
        }

        fn learning_rate(&self) -> Result<f64, MlError> {
            Ok(self.optimizer.learning_rate())
        }

        fn set_learning_rate(&mut self, lr: f64) -> Result<(), MlError> {
            self.optimizer.set_learning_rate(lr);
            Ok(())
        }

        fn save_weights(&self, path: &Path) -> Result<(), MlError> {
            std::fs::write(path, b"{}")?;
            Ok(())
        }

        fn load_weights(&mut self, _path: &Path) -> Result<(), MlError> {
            Ok(())
        }

        fn architecture(&self) -> serde_json::Value {
            serde_json::json!({ "class_name": "Scripted" })
        }
    }

    fn val() -> (Array4<f32>, Array4<f32>) {
        (
            Array4::zeros((1, 2, 2, 1)),
            Array4::zeros((1, 2, 2, NUM_CLASSES)),
        )
    }

    #[test]
    fn test_fit_runs_all_epochs() {
        let dir = TempDir::new().unwrap();
        let mut model = PixelSoftmaxModel::new(&ModelSpec {
            input_shape: (2, 2, 1),
            num_classes: NUM_CLASSES,
            seed: 0,
            hyperparams: BTreeMap::new(),
        })
        .unwrap();
        model.compile(LossFunction::CrossEntropy, Box::new(Adam::new(1e-2)));

        let mut orchestrator =
            TrainingOrchestrator::new("exp", 3, 2, ClassWeights::uniform(), manager(dir.path()));
        let (_, masks) = batches().next().unwrap();
        let images = Array4::<f32>::from_elem((1, 2, 2, 1), 0.5);
        let run = orchestrator.fit(&mut model, batches(), &images, &masks).unwrap();

        assert_eq!(run.status, RunStatus::Finalized);
        assert_eq!(run.outcome, Some(RunOutcome::Converged));
        assert_eq!(run.history.epochs_completed(), 3);
        // steady descent on a constant target improves every epoch
        assert_eq!(run.checkpoint_writes, 3);
        assert_eq!(run.best_checkpoint.unwrap().epoch, 2);
    }

    #[test]
    fn test_nan_aborts_at_that_epoch() {
        let dir = TempDir::new().unwrap();
        let mut model = ScriptedModel::new(vec![0.5, f64::NAN, 0.1, 0.1]);
        let mut orchestrator =
            TrainingOrchestrator::new("exp", 4, 1, ClassWeights::uniform(), manager(dir.path()))
                .with_callback(Box::new(TerminateOnNan));
        let (images, masks) = val();
        let run = orchestrator.fit(&mut model, batches(), &images, &masks).unwrap();

        assert_eq!(run.outcome, Some(RunOutcome::NanAborted { epoch: 1 }));
        assert_eq!(run.history.epochs_completed(), 2);
        assert_eq!(run.checkpoint_writes, 1);
    }

    #[test]
    fn test_nan_outranks_stall() {
        let dir = TempDir::new().unwrap();
        let mut model = ScriptedModel::new(vec![0.5, f64::NAN]);
        let mut orchestrator =
            TrainingOrchestrator::new("exp", 5, 1, ClassWeights::uniform(), manager(dir.path()))
                .with_callback(Box::new(EarlyStopping::new(1)))
                .with_callback(Box::new(TerminateOnNan));
        let (images, masks) = val();
        let run = orchestrator.fit(&mut model, batches(), &images, &masks).unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::NanAborted { epoch: 1 }));
    }

    #[test]
    fn test_early_stop_and_checkpoint_monotonicity() {
        let dir = TempDir::new().unwrap();
        let mut model = ScriptedModel::new(vec![0.9, 0.7, 0.8, 0.6, 0.65, 0.66, 0.1]);
        let mut orchestrator =
            TrainingOrchestrator::new("exp", 7, 1, ClassWeights::uniform(), manager(dir.path()))
                .with_callback(Box::new(EarlyStopping::new(2)));
        let (images, masks) = val();
        let run = orchestrator.fit(&mut model, batches(), &images, &masks).unwrap();

        assert_eq!(run.outcome, Some(RunOutcome::EarlyStopped { epoch: 5 }));
        let written: Vec<f64> = manager(dir.path())
            .list()
            .unwrap()
            .iter()
            .map(|c| c.val_loss)
            .collect();
        assert_eq!(written, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn test_exhausted_stream_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut model = ScriptedModel::new(vec![0.5; 4]);
        let mut orchestrator =
            TrainingOrchestrator::new("exp", 2, 3, ClassWeights::uniform(), manager(dir.path()));
        let (images, masks) = val();
        let result = orchestrator.fit(&mut model, batches().take(4), &images, &masks);
        assert!(matches!(result, Err(MlError::Training(_))));
    }

    #[test]
    fn test_from_config_callback_order() {
        let dir = TempDir::new().unwrap();
        let config = ExperimentConfig {
            results_dir: dir.path().to_path_buf(),
            lr_scheduler: true,
            reduce_lr_on_plateau: true,
            ..Default::default()
        };
        let exp_dir = ExperimentDir::prepare(&config).unwrap();
        let orchestrator =
            TrainingOrchestrator::from_config(&config, &exp_dir, 0, ClassWeights::uniform());
        assert_eq!(orchestrator.steps_per_epoch(), 1);
        assert_eq!(
            orchestrator.callback_names(),
            vec![
                "model_checkpoint",
                "csv_logger",
                "terminate_on_nan",
                "exponential_decay",
                "reduce_on_plateau"
            ]
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "1 h 2 min 5 sec");
        assert_eq!(format_duration(Duration::from_millis(900)), "0 h 0 min 0 sec");
    }
}
