//! Training callbacks: checkpointing, CSV logging, NaN termination, learning-rate
//! schedules and the stall policy.

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::model::SegmentationModel;
use crate::training::checkpoint::{Checkpoint, CheckpointManager};
use crate::training::metrics::EpochLogs;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;

/// Why a callback asked the epoch loop to halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NonFiniteLoss,
    Stalled,
}

/// Action a callback can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop(StopReason),
}

/// Hook into the epoch loop.
pub trait TrainingCallback: Send {
    fn name(&self) -> &'static str;

    fn on_train_begin(&mut self) -> Result<(), MlError> {
        Ok(())
    }

    fn on_epoch_begin(
        &mut self,
        _epoch: usize,
        _model: &mut dyn SegmentationModel,
    ) -> Result<(), MlError> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &EpochLogs,
        model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError>;
}

/// Writes weights whenever validation loss beats the best seen so far.
#[derive(Debug)]
pub struct ModelCheckpoint {
    manager: CheckpointManager,
    best: f64,
    last: Option<Checkpoint>,
    writes: usize,
}

impl ModelCheckpoint {
    pub fn new(manager: CheckpointManager) -> Self {
        Self {
            manager,
            best: f64::INFINITY,
            last: None,
            writes: 0,
        }
    }

    pub fn best_val_loss(&self) -> f64 {
        self.best
    }

    /// The most recent write, which is also the best one.
    pub fn last(&self) -> Option<&Checkpoint> {
        self.last.as_ref()
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn manager(&self) -> &CheckpointManager {
        &self.manager
    }
}

impl TrainingCallback for ModelCheckpoint {
    fn name(&self) -> &'static str {
        "model_checkpoint"
    }

    fn on_train_begin(&mut self) -> Result<(), MlError> {
        self.best = f64::INFINITY;
        self.last = None;
        self.writes = 0;
        self.manager.reset()
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &EpochLogs,
        model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        if logs.val_loss < self.best {
            tracing::info!(
                epoch = epoch + 1,
                previous = self.best,
                val_loss = logs.val_loss,
                path = %self.manager.weights_path().display(),
                "val_loss improved, saving model"
            );
            let checkpoint = self.manager.save(&*model, epoch, logs.val_loss)?;
            self.best = logs.val_loss;
            self.last = Some(checkpoint);
            self.writes += 1;
        } else {
            tracing::debug!(epoch = epoch + 1, best = self.best, "val_loss did not improve");
        }
        Ok(CallbackAction::Continue)
    }
}

/// Appends one CSV row per epoch.
#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvLogger {
    pub fn new(path: PathBuf) -> Self {
        Self { path, writer: None }
    }
}

impl TrainingCallback for CsvLogger {
    fn name(&self) -> &'static str {
        "csv_logger"
    }

    fn on_train_begin(&mut self) -> Result<(), MlError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let needs_header = file.metadata()?.len() == 0;
        self.writer = Some(
            csv::WriterBuilder::new()
                .has_headers(needs_header)
                .from_writer(file),
        );
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        logs: &EpochLogs,
        _model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        if self.writer.is_none() {
            self.on_train_begin()?;
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.serialize(logs)?;
            writer.flush()?;
        }
        Ok(CallbackAction::Continue)
    }
}

/// Stops training on a NaN or infinite loss.
#[derive(Debug, Default)]
pub struct TerminateOnNan;

impl TrainingCallback for TerminateOnNan {
    fn name(&self) -> &'static str {
        "terminate_on_nan"
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &EpochLogs,
        _model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        if logs.has_non_finite_loss() {
            tracing::warn!(
                epoch = epoch + 1,
                loss = logs.loss,
                val_loss = logs.val_loss,
                "Invalid loss, terminating training"
            );
            return Ok(CallbackAction::Stop(StopReason::NonFiniteLoss));
        }
        Ok(CallbackAction::Continue)
    }
}

pub const DECAY_RATE: f64 = 0.1;

/// `lr = initial_lr * exp(-k * epoch)`, set at the start of every epoch.
#[derive(Debug, Clone)]
pub struct ExponentialDecay {
    pub initial_lr: f64,
    pub k: f64,
}

impl ExponentialDecay {
    pub fn new(initial_lr: f64) -> Self {
        Self {
            initial_lr,
            k: DECAY_RATE,
        }
    }

    pub fn rate_at(&self, epoch: usize) -> f64 {
        self.initial_lr * (-self.k * epoch as f64).exp()
    }
}

impl TrainingCallback for ExponentialDecay {
    fn name(&self) -> &'static str {
        "exponential_decay"
    }

    fn on_epoch_begin(
        &mut self,
        epoch: usize,
        model: &mut dyn SegmentationModel,
    ) -> Result<(), MlError> {
        let lr = self.rate_at(epoch);
        tracing::debug!(epoch = epoch + 1, lr, "Scheduled learning rate");
        model.set_learning_rate(lr)
    }

    fn on_epoch_end(
        &mut self,
        _epoch: usize,
        _logs: &EpochLogs,
        _model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        Ok(CallbackAction::Continue)
    }
}

pub const PLATEAU_FACTOR: f64 = 0.5;
pub const PLATEAU_MIN_LR: f64 = 1e-6;
pub const PLATEAU_MIN_DELTA: f64 = 1e-4;

/// What to do once validation loss stops improving. Exactly one is active per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StallPolicy {
    EarlyStopping {
        patience: usize,
    },
    ReduceOnPlateau {
        patience: usize,
        factor: f64,
        min_lr: f64,
        min_delta: f64,
    },
}

impl StallPolicy {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        if config.reduce_lr_on_plateau {
            Self::ReduceOnPlateau {
                patience: config.patience,
                factor: PLATEAU_FACTOR,
                min_lr: PLATEAU_MIN_LR,
                min_delta: PLATEAU_MIN_DELTA,
            }
        } else {
            Self::EarlyStopping {
                patience: config.patience,
            }
        }
    }

    pub fn into_callback(self) -> Box<dyn TrainingCallback> {
        match self {
            Self::EarlyStopping { patience } => Box::new(EarlyStopping::new(patience)),
            Self::ReduceOnPlateau {
                patience,
                factor,
                min_lr,
                min_delta,
            } => Box::new(ReduceOnPlateau::new(patience, factor, min_lr, min_delta)),
        }
    }
}

/// Stops when validation loss has not improved for `patience` epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
    wait: usize,
    best: Option<f64>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            min_delta: 0.0,
            wait: 0,
            best: None,
        }
    }

    fn observe(&mut self, val_loss: f64) -> CallbackAction {
        match self.best {
            Some(best) if !(val_loss < best - self.min_delta) => {
                self.wait += 1;
                if self.wait >= self.patience {
                    CallbackAction::Stop(StopReason::Stalled)
                } else {
                    CallbackAction::Continue
                }
            }
            _ => {
                self.best = Some(val_loss);
                self.wait = 0;
                CallbackAction::Continue
            }
        }
    }
}

impl TrainingCallback for EarlyStopping {
    fn name(&self) -> &'static str {
        "early_stopping"
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &EpochLogs,
        _model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        let action = self.observe(logs.val_loss);
        if action != CallbackAction::Continue {
            tracing::info!(epoch = epoch + 1, patience = self.patience, "Early stopping");
        }
        Ok(action)
    }
}

/// Multiplies the learning rate by `factor` after `patience` stalled epochs.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    pub patience: usize,
    pub factor: f64,
    pub min_lr: f64,
    pub min_delta: f64,
    wait: usize,
    best: f64,
}

impl ReduceOnPlateau {
    pub fn new(patience: usize, factor: f64, min_lr: f64, min_delta: f64) -> Self {
        Self {
            patience,
            factor,
            min_lr,
            min_delta,
            wait: 0,
            best: f64::INFINITY,
        }
    }

    /// Returns the new learning rate when a reduction is due.
    fn observe(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;
        if current_lr > self.min_lr {
            Some((current_lr * self.factor).max(self.min_lr))
        } else {
            None
        }
    }
}

impl TrainingCallback for ReduceOnPlateau {
    fn name(&self) -> &'static str {
        "reduce_on_plateau"
    }

    fn on_epoch_end(
        &mut self,
        epoch: usize,
        logs: &EpochLogs,
        model: &mut dyn SegmentationModel,
    ) -> Result<CallbackAction, MlError> {
        let current = model.learning_rate()?;
        if let Some(lr) = self.observe(logs.val_loss, current) {
            tracing::info!(epoch = epoch + 1, from = current, to = lr, "Reducing learning rate");
            model.set_learning_rate(lr)?;
        }
        Ok(CallbackAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::NUM_CLASSES;
    use crate::model::{BatchLogs, ModelSpec, PixelSoftmaxModel};
    use crate::training::loss::LossFunction;
    use crate::training::optimizer::Adam;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn model() -> PixelSoftmaxModel {
        let mut model = PixelSoftmaxModel::new(&ModelSpec {
            input_shape: (2, 2, 1),
            num_classes: NUM_CLASSES,
            seed: 3,
            hyperparams: BTreeMap::new(),
        })
        .unwrap();
        model.compile(LossFunction::CrossEntropy, Box::new(Adam::new(1e-3)));
        model
    }

    fn logs(epoch: usize, loss: f64, val_loss: f64) -> EpochLogs {
        EpochLogs::new(
            epoch,
            BatchLogs {
                loss,
                ..Default::default()
            },
            BatchLogs {
                loss: val_loss,
                ..Default::default()
            },
            1e-3,
        )
    }

    #[test]
    fn test_checkpoint_writes_only_on_improvement() {
        let dir = TempDir::new().unwrap();
        let mut cb = ModelCheckpoint::new(CheckpointManager::new(
            dir.path().join("w.json"),
            dir.path().join("checkpoints.json"),
        ));
        let mut model = model();
        for (epoch, val) in [0.8, 0.9, 0.5, 0.5, f64::NAN, 0.3].into_iter().enumerate() {
            cb.on_epoch_end(epoch, &logs(epoch, 1.0, val), &mut model).unwrap();
        }
        assert_eq!(cb.writes(), 3);
        assert_eq!(cb.best_val_loss(), 0.3);
        let epochs: Vec<usize> = cb.manager().list().unwrap().iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 2, 5]);
    }

    #[test]
    fn test_checkpoint_starts_each_run_from_scratch() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(
            dir.path().join("w.json"),
            dir.path().join("checkpoints.json"),
        );
        let mut model = model();
        let mut first = ModelCheckpoint::new(manager.clone());
        first.on_train_begin().unwrap();
        first.on_epoch_end(0, &logs(0, 1.0, 0.2), &mut model).unwrap();

        let mut second = ModelCheckpoint::new(manager.clone());
        second.on_train_begin().unwrap();
        second.on_epoch_end(0, &logs(0, 1.0, 0.6), &mut model).unwrap();

        assert_eq!(second.writes(), 1);
        let losses: Vec<f64> = manager.list().unwrap().iter().map(|c| c.val_loss).collect();
        assert_eq!(losses, vec![0.6]);
    }

    #[test]
    fn test_csv_logger_appends_without_repeating_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("exp.log");
        let mut model = model();
        for run in 0..2 {
            let mut cb = CsvLogger::new(path.clone());
            cb.on_train_begin().unwrap();
            cb.on_epoch_end(0, &logs(0, 0.5 + run as f64, 0.4), &mut model)
                .unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "epoch,loss,accuracy,jaccard_distance,val_loss,val_accuracy,val_jaccard_distance,lr"
        );
        assert!(lines[2].starts_with("0,1.5,"));
    }

    #[test]
    fn test_terminate_on_nan() {
        let mut cb = TerminateOnNan;
        let mut model = model();
        assert_eq!(
            cb.on_epoch_end(0, &logs(0, 0.5, 0.5), &mut model).unwrap(),
            CallbackAction::Continue
        );
        assert_eq!(
            cb.on_epoch_end(1, &logs(1, f64::NAN, 0.5), &mut model).unwrap(),
            CallbackAction::Stop(StopReason::NonFiniteLoss)
        );
        assert_eq!(
            cb.on_epoch_end(1, &logs(1, 0.5, f64::INFINITY), &mut model).unwrap(),
            CallbackAction::Stop(StopReason::NonFiniteLoss)
        );
    }

    #[test]
    fn test_exponential_decay_sets_rate() {
        let mut cb = ExponentialDecay::new(1e-2);
        let mut model = model();
        cb.on_epoch_begin(0, &mut model).unwrap();
        assert!((model.learning_rate().unwrap() - 1e-2).abs() < 1e-12);
        cb.on_epoch_begin(3, &mut model).unwrap();
        let expected = 1e-2 * (-0.3f64).exp();
        assert!((model.learning_rate().unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_early_stopping() {
        let mut cb = EarlyStopping::new(2);
        assert_eq!(cb.observe(0.5), CallbackAction::Continue);
        assert_eq!(cb.observe(0.4), CallbackAction::Continue);
        assert_eq!(cb.observe(0.45), CallbackAction::Continue);
        assert_eq!(cb.observe(0.4), CallbackAction::Stop(StopReason::Stalled));
    }

    #[test]
    fn test_reduce_on_plateau_halves_and_floors() {
        let mut cb = ReduceOnPlateau::new(1, 0.5, 1e-6, 1e-4);
        assert_eq!(cb.observe(0.5, 1e-3), None);
        // within min_delta counts as no improvement
        assert_eq!(cb.observe(0.49995, 1e-3), Some(5e-4));
        assert_eq!(cb.observe(0.6, 1.5e-6), Some(1e-6));
        assert_eq!(cb.observe(0.6, 1e-6), None);
    }

    #[test]
    fn test_stall_policy_selection_is_exclusive() {
        let mut config = ExperimentConfig {
            patience: 7,
            ..Default::default()
        };
        assert_eq!(
            StallPolicy::from_config(&config),
            StallPolicy::EarlyStopping { patience: 7 }
        );
        assert_eq!(
            StallPolicy::from_config(&config).into_callback().name(),
            "early_stopping"
        );

        config.reduce_lr_on_plateau = true;
        let policy = StallPolicy::from_config(&config);
        assert_eq!(
            policy,
            StallPolicy::ReduceOnPlateau {
                patience: 7,
                factor: 0.5,
                min_lr: 1e-6,
                min_delta: 1e-4,
            }
        );
        assert_eq!(policy.into_callback().name(), "reduce_on_plateau");
    }
}
