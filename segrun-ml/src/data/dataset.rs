//! Dataset split and the loader contract.

use crate::error::MlError;
use ndarray::{Array3, Array4, Axis};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Size of the fixed label space (background, class A, class B).
pub const NUM_CLASSES: usize = 3;

/// Four aligned arrays: index `i` of an image array and its label array describe
/// the same sample.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    /// `N×H×W×C`, pre-normalized.
    pub train_images: Array4<f32>,
    pub val_images: Array4<f32>,
    /// `N×H×W` class indices.
    pub train_labels: Array3<u8>,
    pub val_labels: Array3<u8>,
}

impl DatasetSplit {
    /// Build a split, checking sample alignment, spatial shape and label range.
    pub fn new(
        train_images: Array4<f32>,
        val_images: Array4<f32>,
        train_labels: Array3<u8>,
        val_labels: Array3<u8>,
    ) -> Result<Self, MlError> {
        check_pair("train", &train_images, &train_labels)?;
        check_pair("val", &val_images, &val_labels)?;
        let (_, th, tw, tc) = train_images.dim();
        let (_, vh, vw, vc) = val_images.dim();
        if (th, tw, tc) != (vh, vw, vc) {
            return Err(MlError::dataset(format!(
                "train images {:?} and val images {:?} differ in sample shape",
                train_images.dim(),
                val_images.dim()
            )));
        }
        if train_images.len_of(Axis(0)) == 0 {
            return Err(MlError::dataset("training split is empty"));
        }
        if val_images.len_of(Axis(0)) == 0 {
            return Err(MlError::dataset("validation split is empty"));
        }
        Ok(Self {
            train_images,
            val_images,
            train_labels,
            val_labels,
        })
    }

    /// Per-sample input shape `(H, W, C)`.
    pub fn input_shape(&self) -> (usize, usize, usize) {
        let (_, h, w, c) = self.train_images.dim();
        (h, w, c)
    }

    pub fn train_len(&self) -> usize {
        self.train_images.len_of(Axis(0))
    }

    pub fn val_len(&self) -> usize {
        self.val_images.len_of(Axis(0))
    }
}

fn check_pair(split: &str, images: &Array4<f32>, labels: &Array3<u8>) -> Result<(), MlError> {
    let (n, h, w, _) = images.dim();
    if labels.dim() != (n, h, w) {
        return Err(MlError::dataset(format!(
            "{split} images {:?} are not aligned with labels {:?}",
            images.dim(),
            labels.dim()
        )));
    }
    if let Some(bad) = labels.iter().find(|&&l| l as usize >= NUM_CLASSES) {
        return Err(MlError::dataset(format!(
            "{split} labels contain class {bad}, label space has {NUM_CLASSES} classes"
        )));
    }
    Ok(())
}

/// One-hot encode `N×H×W` class indices into `N×H×W×NUM_CLASSES` masks.
pub fn one_hot(labels: &Array3<u8>) -> Array4<f32> {
    let (n, h, w) = labels.dim();
    let mut out = Array4::zeros((n, h, w, NUM_CLASSES));
    for ((i, y, x), &label) in labels.indexed_iter() {
        out[[i, y, x, label as usize]] = 1.0;
    }
    out
}

/// Source of a [`DatasetSplit`].
pub trait DatasetLoader {
    fn load(&self) -> Result<DatasetSplit, MlError>;
}

/// On-disk layout read by [`JsonDatasetLoader`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDocument {
    /// `[H, W, C]`.
    pub image_shape: [usize; 3],
    pub train_images: Vec<f32>,
    pub val_images: Vec<f32>,
    pub train_labels: Vec<u8>,
    pub val_labels: Vec<u8>,
}

/// Loads a split from a JSON [`DatasetDocument`].
#[derive(Debug, Clone)]
pub struct JsonDatasetLoader {
    path: PathBuf,
}

impl JsonDatasetLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetLoader for JsonDatasetLoader {
    fn load(&self) -> Result<DatasetSplit, MlError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            MlError::dataset(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let doc: DatasetDocument = serde_json::from_str(&content)?;
        let [h, w, c] = doc.image_shape;
        let pixels = h * w;
        if pixels == 0 || c == 0 {
            return Err(MlError::dataset("image_shape must be non-zero"));
        }

        let n_train = doc.train_labels.len() / pixels;
        let n_val = doc.val_labels.len() / pixels;
        let split = DatasetSplit::new(
            Array4::from_shape_vec((n_train, h, w, c), doc.train_images)?,
            Array4::from_shape_vec((n_val, h, w, c), doc.val_images)?,
            Array3::from_shape_vec((n_train, h, w), doc.train_labels)?,
            Array3::from_shape_vec((n_val, h, w), doc.val_labels)?,
        )?;
        tracing::info!(
            train = split.train_len(),
            val = split.val_len(),
            "Loaded dataset from {}",
            self.path.display()
        );
        Ok(split)
    }
}
