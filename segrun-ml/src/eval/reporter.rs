//! Post-training evaluation of the best checkpoint.

use crate::config::ExperimentDir;
use crate::data::DatasetSplit;
use crate::error::MlError;
use crate::eval::metrics::{ClassificationReport, ConfusionMatrix, jaccard_macro};
use crate::model::SegmentationModel;
use crate::persistence::{atomic_write, atomic_write_yaml};
use crate::training::loss::argmax;
use crate::training::{Checkpoint, CheckpointManager};
use ndarray::{Array3, Array4, ArrayD, Axis, IxDyn, s};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PREDICTIONS_MAGIC: &[u8; 4] = b"SEGP";

/// The `eval.yaml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    #[serde(rename = "val-data")]
    pub val: ClassificationReport,
    #[serde(rename = "train-data")]
    pub train: ClassificationReport,
    #[serde(rename = "val-jaccard-score")]
    pub val_jaccard: f64,
    #[serde(rename = "train-jaccard-score")]
    pub train_jaccard: f64,
    #[serde(rename = "val-confusion_matrix")]
    pub val_confusion: ConfusionMatrix,
}

pub struct EvaluationReporter {
    batch_size: usize,
    checkpoints: CheckpointManager,
    predictions_path: PathBuf,
    report_path: PathBuf,
}

impl EvaluationReporter {
    pub fn new(dir: &ExperimentDir, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            checkpoints: CheckpointManager::new(
                dir.checkpoint_path(),
                dir.checkpoint_manifest_path(),
            ),
            predictions_path: dir.predictions_path(),
            report_path: dir.report_path(),
        }
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    pub fn predictions_path(&self) -> &Path {
        &self.predictions_path
    }

    /// Restore the run's best checkpoint, score both splits and write `eval.yaml`.
    ///
    /// `checkpoint` is the pointer the finished run handed over. A run that never
    /// wrote one fails with [`MlError::NotFound`] even if an older weights file
    /// sits at the same path.
    pub fn evaluate(
        &self,
        model: &mut dyn SegmentationModel,
        split: &DatasetSplit,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<EvaluationReport, MlError> {
        let checkpoint = checkpoint.ok_or_else(|| {
            MlError::not_found(format!(
                "run wrote no checkpoint to {}, nothing to evaluate",
                self.checkpoints.weights_path().display()
            ))
        })?;
        if !checkpoint.path.is_file() {
            return Err(MlError::not_found(format!(
                "checkpoint {} is missing",
                checkpoint.path.display()
            )));
        }
        if !self.checkpoints.verify(checkpoint)? {
            return Err(MlError::evaluation(format!(
                "checkpoint {} changed on disk after epoch {}",
                checkpoint.path.display(),
                checkpoint.epoch + 1
            )));
        }
        model.load_weights(&checkpoint.path)?;
        tracing::info!(
            checkpoint = %checkpoint.path.display(),
            epoch = checkpoint.epoch + 1,
            val_loss = checkpoint.val_loss,
            "Loaded best weights"
        );

        let val_pred = self.predict_labels(&*model, &split.val_images)?;
        let train_pred = self.predict_labels(&*model, &split.train_images)?;

        if let Err(e) = write_predictions(&self.predictions_path, &val_pred) {
            tracing::warn!(
                path = %self.predictions_path.display(),
                error = %e,
                "Could not save validation predictions"
            );
        }

        let val_truth = flatten(&split.val_labels);
        let val_flat = flatten(&val_pred);
        let train_truth = flatten(&split.train_labels);
        let train_flat = flatten(&train_pred);

        let val = ClassificationReport::from_labels(&val_truth, &val_flat)?;
        let val_confusion = ConfusionMatrix::from_labels(&val_truth, &val_flat)?;
        let val_jaccard = jaccard_macro(&val_truth, &val_flat)?;
        tracing::info!("Validation report:\n{}", val.to_text(3));
        tracing::info!("Validation confusion matrix: {:?}", val_confusion.0);
        tracing::info!(jaccard = val_jaccard, "Validation Jaccard score");

        let train = ClassificationReport::from_labels(&train_truth, &train_flat)?;
        let train_jaccard = jaccard_macro(&train_truth, &train_flat)?;
        tracing::info!("Training report:\n{}", train.to_text(3));
        tracing::info!(jaccard = train_jaccard, "Training Jaccard score");

        let report = EvaluationReport {
            val,
            train,
            val_jaccard,
            train_jaccard,
            val_confusion,
        };
        atomic_write_yaml(&self.report_path, &report)?;
        tracing::info!(path = %self.report_path.display(), "Evaluation report written");
        Ok(report)
    }

    /// Per-pixel argmax class, predicted in chunks of `batch_size`.
    fn predict_labels(
        &self,
        model: &dyn SegmentationModel,
        images: &Array4<f32>,
    ) -> Result<Array3<u8>, MlError> {
        let (n, h, w, _) = images.dim();
        let mut labels = Array3::<u8>::zeros((n, h, w));
        let mut start = 0;
        while start < n {
            let end = (start + self.batch_size).min(n);
            let probs = model.predict(&images.slice(s![start..end, .., .., ..]).to_owned())?;
            if probs.dim().0 != end - start || probs.dim().1 != h || probs.dim().2 != w {
                return Err(MlError::model(format!(
                    "prediction shape {:?} does not match input chunk {:?}",
                    probs.dim(),
                    (end - start, h, w)
                )));
            }
            let classes = probs.map_axis(Axis(3), |p| argmax(&p.to_vec()) as u8);
            labels.slice_mut(s![start..end, .., ..]).assign(&classes);
            start = end;
        }
        Ok(labels)
    }
}

fn flatten(labels: &Array3<u8>) -> Vec<u8> {
    labels.iter().copied().collect()
}

/// `SEGP`, `u32` LE rank, rank × `u64` LE dims, then one byte per element.
pub fn write_predictions(path: &Path, labels: &Array3<u8>) -> Result<(), MlError> {
    let shape = labels.shape();
    let mut buf = Vec::with_capacity(8 + 8 * shape.len() + labels.len());
    buf.extend_from_slice(PREDICTIONS_MAGIC);
    buf.extend_from_slice(&(shape.len() as u32).to_le_bytes());
    for &dim in shape {
        buf.extend_from_slice(&(dim as u64).to_le_bytes());
    }
    buf.extend(labels.iter().copied());
    atomic_write(path, &buf)?;
    Ok(())
}

pub fn read_predictions(path: &Path) -> Result<ArrayD<u8>, MlError> {
    let bytes = std::fs::read(path)?;
    let corrupt = |what: &str| MlError::evaluation(format!("{}: {what}", path.display()));

    if bytes.len() < 8 || &bytes[..4] != PREDICTIONS_MAGIC {
        return Err(corrupt("not a prediction artifact"));
    }
    let rank = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let header = 8 + 8 * rank;
    if bytes.len() < header {
        return Err(corrupt("truncated header"));
    }
    let shape: Vec<usize> = bytes[8..header]
        .chunks_exact(8)
        .map(|c| {
            let mut dim = [0u8; 8];
            dim.copy_from_slice(c);
            u64::from_le_bytes(dim) as usize
        })
        .collect();
    let data = bytes[header..].to_vec();
    if data.len() != shape.iter().product::<usize>() {
        return Err(corrupt("payload length does not match shape"));
    }
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}
