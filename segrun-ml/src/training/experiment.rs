//! Training run tracking.

use crate::error::MlError;
use crate::training::checkpoint::Checkpoint;
use crate::training::metrics::{EpochLogs, TrainingHistory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Run status. Moves Initialized -> Fitting -> {Converged, EarlyStopped, NanAborted}
/// -> Finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Fitting,
    Converged,
    EarlyStopped,
    NanAborted,
    Finalized,
}

/// How fitting ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The epoch bound was reached.
    Converged,
    EarlyStopped { epoch: usize },
    NanAborted { epoch: usize },
}

impl RunOutcome {
    fn status(self) -> RunStatus {
        match self {
            Self::Converged => RunStatus::Converged,
            Self::EarlyStopped { .. } => RunStatus::EarlyStopped,
            Self::NanAborted { .. } => RunStatus::NanAborted,
        }
    }
}

/// One fitting run of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRun {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    pub outcome: Option<RunOutcome>,
    pub history: TrainingHistory,
    /// Fixed location of the best weights.
    pub checkpoint_path: PathBuf,
    pub best_checkpoint: Option<Checkpoint>,
    pub checkpoint_writes: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TrainingRun {
    pub fn new(name: &str, checkpoint_path: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: RunStatus::Initialized,
            outcome: None,
            history: TrainingHistory::default(),
            checkpoint_path,
            best_checkpoint: None,
            checkpoint_writes: 0,
            started_at: None,
            ended_at: None,
        }
    }

    pub fn begin(&mut self) -> Result<(), MlError> {
        self.transition(RunStatus::Initialized, RunStatus::Fitting)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn record_epoch(&mut self, logs: EpochLogs) -> Result<(), MlError> {
        if self.status != RunStatus::Fitting {
            return Err(MlError::training(format!(
                "cannot record an epoch while {:?}",
                self.status
            )));
        }
        self.history.record_epoch(logs);
        Ok(())
    }

    pub fn stop(&mut self, outcome: RunOutcome) -> Result<(), MlError> {
        self.transition(RunStatus::Fitting, outcome.status())?;
        self.outcome = Some(outcome);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<(), MlError> {
        match self.status {
            RunStatus::Converged | RunStatus::EarlyStopped | RunStatus::NanAborted => {
                self.status = RunStatus::Finalized;
                Ok(())
            }
            other => Err(MlError::training(format!(
                "cannot finalize a run that is {other:?}"
            ))),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status == RunStatus::Finalized
    }

    fn transition(&mut self, from: RunStatus, to: RunStatus) -> Result<(), MlError> {
        if self.status != from {
            return Err(MlError::training(format!(
                "invalid run transition {:?} -> {to:?}",
                self.status
            )));
        }
        self.status = to;
        Ok(())
    }
}
