//! Per-epoch training metrics.

use crate::model::BatchLogs;
use serde::{Deserialize, Serialize};

/// Scalar metrics of one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    /// 0-based epoch index.
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
    pub jaccard_distance: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_jaccard_distance: f64,
    /// Learning rate in effect during the epoch.
    pub lr: f64,
}

impl EpochLogs {
    pub fn new(epoch: usize, train: BatchLogs, val: BatchLogs, lr: f64) -> Self {
        Self {
            epoch,
            loss: train.loss,
            accuracy: train.accuracy,
            jaccard_distance: train.jaccard_distance,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            val_jaccard_distance: val.jaccard_distance,
            lr,
        }
    }

    /// Whether either monitored loss is NaN or infinite.
    pub fn has_non_finite_loss(&self) -> bool {
        !self.loss.is_finite() || !self.val_loss.is_finite()
    }
}

/// Full metric history of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochLogs>,
    pub best_epoch: Option<usize>,
    pub best_val_loss: Option<f64>,
}

impl TrainingHistory {
    pub fn record_epoch(&mut self, logs: EpochLogs) {
        if logs.val_loss.is_finite() && self.best_val_loss.is_none_or(|best| logs.val_loss < best)
        {
            self.best_val_loss = Some(logs.val_loss);
            self.best_epoch = Some(logs.epoch);
        }
        self.epochs.push(logs);
    }

    pub fn epochs_completed(&self) -> usize {
        self.epochs.len()
    }

    pub fn val_loss_history(&self) -> Vec<f64> {
        self.epochs.iter().map(|e| e.val_loss).collect()
    }

    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }
}

/// Running mean of batch logs over an epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchAccumulator {
    sum: BatchLogs,
    count: usize,
}

impl BatchAccumulator {
    pub fn add(&mut self, logs: BatchLogs) {
        self.sum.loss += logs.loss;
        self.sum.accuracy += logs.accuracy;
        self.sum.jaccard_distance += logs.jaccard_distance;
        self.count += 1;
    }

    pub fn mean(&self) -> BatchLogs {
        if self.count == 0 {
            return BatchLogs::default();
        }
        let n = self.count as f64;
        BatchLogs {
            loss: self.sum.loss / n,
            accuracy: self.sum.accuracy / n,
            jaccard_distance: self.sum.jaccard_distance / n,
        }
    }
}
