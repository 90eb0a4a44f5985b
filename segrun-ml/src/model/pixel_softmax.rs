//! Per-pixel linear softmax classifier.
//!
//! Each pixel's channels map linearly to class logits; there is no spatial context.
//! It implements the full model contract so experiments run end-to-end without an
//! external engine.

use super::{BatchLogs, ModelFactory, ModelSpec, SegmentationModel, score_batch};
use crate::error::MlError;
use crate::persistence::atomic_write_json;
use crate::training::class_weights::ClassWeights;
use crate::training::loss::{LossFunction, argmax};
use crate::training::optimizer::Optimizer;
use ndarray::{Array2, Array4, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CLASS_NAME: &str = "PixelSoftmax";
const DEFAULT_INIT_STD: f64 = 0.01;

#[derive(Debug, Serialize, Deserialize)]
struct WeightsFile {
    class_name: String,
    input_shape: (usize, usize, usize),
    num_classes: usize,
    params: Vec<f32>,
}

pub struct PixelSoftmaxModel {
    input_shape: (usize, usize, usize),
    num_classes: usize,
    seed: u64,
    init_std: f64,
    /// Row-major `num_classes × (channels + 1)`; the last column is the bias.
    params: Vec<f32>,
    loss: Option<LossFunction>,
    optimizer: Option<Box<dyn Optimizer>>,
}

impl PixelSoftmaxModel {
    pub fn new(spec: &ModelSpec) -> Result<Self, MlError> {
        let mut init_std = DEFAULT_INIT_STD;
        for (key, value) in &spec.hyperparams {
            match key.as_str() {
                "init_std" => {
                    init_std = value.as_f64().ok_or_else(|| {
                        MlError::model(format!("init_std must be a number, got {value}"))
                    })?;
                }
                other => tracing::warn!("{CLASS_NAME} ignores hyperparameter '{other}'"),
            }
        }
        let (_, _, channels) = spec.input_shape;
        if channels == 0 || spec.num_classes == 0 {
            return Err(MlError::model("input channels and classes must be non-zero"));
        }

        let mut rng = StdRng::seed_from_u64(spec.seed);
        let params = (0..spec.num_classes * (channels + 1))
            .map(|_| {
                if init_std > 0.0 {
                    rng.gen_range(-init_std..init_std) as f32
                } else {
                    0.0
                }
            })
            .collect();

        Ok(Self {
            input_shape: spec.input_shape,
            num_classes: spec.num_classes,
            seed: spec.seed,
            init_std,
            params,
            loss: None,
            optimizer: None,
        })
    }

    fn channels(&self) -> usize {
        self.input_shape.2
    }

    fn check_input(&self, images: &Array4<f32>) -> Result<(), MlError> {
        let (_, h, w, c) = images.dim();
        if (h, w, c) != self.input_shape {
            return Err(MlError::model(format!(
                "expected samples of shape {:?}, got {:?}",
                self.input_shape,
                (h, w, c)
            )));
        }
        Ok(())
    }

    fn flatten(array: &Array4<f32>) -> Result<Array2<f32>, MlError> {
        let (n, h, w, c) = array.dim();
        Ok(array.to_shape((n * h * w, c))?.to_owned())
    }

    /// Softmax probabilities for flattened pixels (rows).
    fn forward(&self, pixels: ArrayView2<f32>) -> Array2<f32> {
        let stride = self.channels() + 1;
        let mut probs = Array2::zeros((pixels.nrows(), self.num_classes));
        for (x, mut out) in pixels.rows().into_iter().zip(probs.rows_mut()) {
            for (k, logit) in out.iter_mut().enumerate() {
                let row = &self.params[k * stride..(k + 1) * stride];
                *logit = row[stride - 1] + x.iter().zip(row).map(|(a, b)| a * b).sum::<f32>();
            }
            let max = out.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            out.mapv_inplace(|z| (z - max).exp());
            let sum = out.sum();
            out.mapv_inplace(|e| e / sum);
        }
        probs
    }

    fn compiled_loss(&self) -> Result<LossFunction, MlError> {
        self.loss
            .ok_or_else(|| MlError::model("model must be compiled before training"))
    }
}

impl SegmentationModel for PixelSoftmaxModel {
    fn compile(&mut self, loss: LossFunction, optimizer: Box<dyn Optimizer>) {
        tracing::debug!(loss = loss.name(), optimizer = %optimizer.name(), "Compiled {CLASS_NAME}");
        self.loss = Some(loss);
        self.optimizer = Some(optimizer);
    }

    fn train_on_batch(
        &mut self,
        images: &Array4<f32>,
        masks: &Array4<f32>,
        weights: &ClassWeights,
    ) -> Result<BatchLogs, MlError> {
        self.check_input(images)?;
        let loss_fn = self.compiled_loss()?;
        let pixels = Self::flatten(images)?;
        let targets = Self::flatten(masks)?;
        let probs = self.forward(pixels.view());
        let logs = score_batch(&loss_fn, probs.view(), targets.view(), weights);

        let stride = self.channels() + 1;
        let n = pixels.nrows().max(1) as f32;
        let mut grads = vec![0.0f32; self.params.len()];
        let mut d_probs = vec![0.0f32; self.num_classes];
        for ((x, p), t) in pixels.rows().into_iter().zip(probs.rows()).zip(targets.rows()) {
            let (p, t) = (p.to_vec(), t.to_vec());
            let scale = weights.weight(argmax(&t)) as f32 / n;
            loss_fn.pixel_grad(&p, &t, &mut d_probs);
            // Chain through the softmax: dz_j = p_j * (g_j - sum_k g_k p_k).
            let dot: f32 = d_probs.iter().zip(&p).map(|(g, q)| g * q).sum();
            for k in 0..self.num_classes {
                let dz = scale * p[k] * (d_probs[k] - dot);
                let row = &mut grads[k * stride..(k + 1) * stride];
                for (g, xi) in row.iter_mut().zip(x.iter()) {
                    *g += dz * xi;
                }
                row[stride - 1] += dz;
            }
        }

        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| MlError::model("model must be compiled before training"))?;
        optimizer.step(&mut self.params, &grads);
        Ok(logs)
    }

    fn evaluate(&self, images: &Array4<f32>, masks: &Array4<f32>) -> Result<BatchLogs, MlError> {
        self.check_input(images)?;
        let loss_fn = self.compiled_loss()?;
        let probs = self.forward(Self::flatten(images)?.view());
        let targets = Self::flatten(masks)?;
        Ok(score_batch(
            &loss_fn,
            probs.view(),
            targets.view(),
            &ClassWeights::uniform(),
        ))
    }

    fn predict(&self, images: &Array4<f32>) -> Result<Array4<f32>, MlError> {
        self.check_input(images)?;
        let (n, h, w, _) = images.dim();
        let probs = self.forward(Self::flatten(images)?.view());
        Ok(probs.into_shape_with_order((n, h, w, self.num_classes))?)
    }

    fn learning_rate(&self) -> Result<f64, MlError> {
        self.optimizer
            .as_ref()
            .map(|o| o.learning_rate())
            .ok_or_else(|| MlError::model("model has no optimizer"))
    }

    fn set_learning_rate(&mut self, lr: f64) -> Result<(), MlError> {
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| MlError::model("model has no optimizer"))?;
        optimizer.set_learning_rate(lr);
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> Result<(), MlError> {
        let file = WeightsFile {
            class_name: CLASS_NAME.to_string(),
            input_shape: self.input_shape,
            num_classes: self.num_classes,
            params: self.params.clone(),
        };
        atomic_write_json(path, &file)?;
        Ok(())
    }

    fn load_weights(&mut self, path: &Path) -> Result<(), MlError> {
        let content = std::fs::read_to_string(path)?;
        let file: WeightsFile = serde_json::from_str(&content)?;
        if file.class_name != CLASS_NAME
            || file.input_shape != self.input_shape
            || file.num_classes != self.num_classes
            || file.params.len() != self.params.len()
        {
            return Err(MlError::model(format!(
                "weights in {} do not match this architecture",
                path.display()
            )));
        }
        self.params = file.params;
        Ok(())
    }

    fn architecture(&self) -> serde_json::Value {
        serde_json::json!({
            "class_name": CLASS_NAME,
            "config": {
                "input_shape": [self.input_shape.0, self.input_shape.1, self.input_shape.2],
                "num_classes": self.num_classes,
                "seed": self.seed,
                "init_std": self.init_std,
                "trainable_params": self.params.len(),
            }
        })
    }
}

/// Factory used by the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelSoftmaxFactory;

impl ModelFactory for PixelSoftmaxFactory {
    fn construct(&self, spec: &ModelSpec) -> Result<Box<dyn SegmentationModel>, MlError> {
        Ok(Box::new(PixelSoftmaxModel::new(spec)?))
    }
}
