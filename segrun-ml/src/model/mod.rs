//! The segmentation-model contract.
//!
//! The orchestrator never looks inside a network: it constructs one through a
//! [`ModelFactory`], compiles it with the selected strategies and drives it batch by
//! batch through [`SegmentationModel`].

pub mod pixel_softmax;

pub use pixel_softmax::{PixelSoftmaxFactory, PixelSoftmaxModel};

use crate::error::MlError;
use crate::training::class_weights::ClassWeights;
use crate::training::loss::{self, LossFunction, argmax};
use crate::training::optimizer::Optimizer;
use ndarray::{Array4, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Scalar metrics of one batch (or one evaluation pass).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchLogs {
    pub loss: f64,
    pub accuracy: f64,
    pub jaccard_distance: f64,
}

/// Construction arguments handed to a [`ModelFactory`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    /// `(H, W, C)`.
    pub input_shape: (usize, usize, usize),
    pub num_classes: usize,
    pub seed: u64,
    /// Opaque architecture hyperparameters from the `model` config mapping.
    pub hyperparams: BTreeMap<String, serde_json::Value>,
}

pub trait ModelFactory {
    fn construct(&self, spec: &ModelSpec) -> Result<Box<dyn SegmentationModel>, MlError>;
}

/// A trainable per-pixel classifier.
pub trait SegmentationModel: Send {
    /// Attach the loss and optimizer used by [`train_on_batch`](Self::train_on_batch).
    fn compile(&mut self, loss: LossFunction, optimizer: Box<dyn Optimizer>);

    /// One optimizer step on a batch of images and one-hot masks. `weights`
    /// multiply each pixel's loss by the weight of its true class.
    fn train_on_batch(
        &mut self,
        images: &Array4<f32>,
        masks: &Array4<f32>,
        weights: &ClassWeights,
    ) -> Result<BatchLogs, MlError>;

    /// Unweighted metrics without updating weights.
    fn evaluate(&self, images: &Array4<f32>, masks: &Array4<f32>) -> Result<BatchLogs, MlError>;

    /// Per-class probability maps, `N×H×W×num_classes`.
    fn predict(&self, images: &Array4<f32>) -> Result<Array4<f32>, MlError>;

    fn learning_rate(&self) -> Result<f64, MlError>;
    fn set_learning_rate(&mut self, lr: f64) -> Result<(), MlError>;

    fn save_weights(&self, path: &Path) -> Result<(), MlError>;
    fn load_weights(&mut self, path: &Path) -> Result<(), MlError>;

    /// Serializable description of the architecture.
    fn architecture(&self) -> serde_json::Value;
}

/// Score a batch given flattened probabilities and targets (rows are pixels).
pub fn score_batch(
    loss_fn: &LossFunction,
    probs: ArrayView2<f32>,
    targets: ArrayView2<f32>,
    weights: &ClassWeights,
) -> BatchLogs {
    let n = probs.nrows();
    if n == 0 {
        return BatchLogs::default();
    }
    let mut correct = 0usize;
    let mut jaccard = 0.0;
    for (p, t) in probs.rows().into_iter().zip(targets.rows()) {
        let (p, t) = (p.to_vec(), t.to_vec());
        if argmax(&p) == argmax(&t) {
            correct += 1;
        }
        jaccard += loss::jaccard(&p, &t, loss::JACCARD_SMOOTH);
    }
    BatchLogs {
        loss: loss_fn.weighted_loss(probs, targets, weights),
        accuracy: correct as f64 / n as f64,
        jaccard_distance: jaccard / n as f64,
    }
}
