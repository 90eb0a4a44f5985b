//! Checkpoint management for training runs.

use crate::error::MlError;
use crate::model::SegmentationModel;
use crate::persistence::{atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// One write of the best-weights file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub epoch: usize,
    pub val_loss: f64,
    pub path: PathBuf,
    /// SHA-256 of the weights file as written.
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Owns the fixed weights path and its manifest during fitting.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    weights_path: PathBuf,
    manifest_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(weights_path: PathBuf, manifest_path: PathBuf) -> Self {
        Self {
            weights_path,
            manifest_path,
        }
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights_path
    }

    /// All recorded writes, oldest first.
    pub fn list(&self) -> Result<Vec<Checkpoint>, MlError> {
        Ok(load_json(&self.manifest_path)?.unwrap_or_default())
    }

    /// The entry with the lowest validation loss.
    pub fn best(&self) -> Result<Option<Checkpoint>, MlError> {
        let checkpoints = self.list()?;
        Ok(checkpoints.into_iter().min_by(|a, b| {
            a.val_loss
                .partial_cmp(&b.val_loss)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }

    /// Drop the manifest left by an earlier run in the same directory.
    ///
    /// The weights file itself is left alone; it is only overwritten by [`save`](Self::save).
    pub fn reset(&self) -> Result<(), MlError> {
        match std::fs::remove_file(&self.manifest_path) {
            Ok(()) => {
                tracing::debug!(path = %self.manifest_path.display(), "Cleared checkpoint manifest");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the weights file from `model` and append a manifest entry.
    pub fn save(
        &self,
        model: &dyn SegmentationModel,
        epoch: usize,
        val_loss: f64,
    ) -> Result<Checkpoint, MlError> {
        model.save_weights(&self.weights_path)?;

        let bytes = std::fs::read(&self.weights_path)?;
        let hash = format!("{:x}", Sha256::digest(&bytes));

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            epoch,
            val_loss,
            path: self.weights_path.clone(),
            hash,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut checkpoints = self.list()?;
        checkpoints.push(checkpoint.clone());
        atomic_write_json(&self.manifest_path, &checkpoints)?;

        Ok(checkpoint)
    }

    /// Whether the weights file on disk still matches `checkpoint`.
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<bool, MlError> {
        let bytes = std::fs::read(&checkpoint.path)?;
        Ok(format!("{:x}", Sha256::digest(&bytes)) == checkpoint.hash)
    }
}
