//! Loss strategies and their selection from configuration.
//!
//! Every strategy is defined per pixel over the class axis of a probability map and
//! exposes its gradient with respect to the class probabilities, so any engine that
//! owns the softmax can chain it.

use crate::config::ExperimentConfig;
use crate::error::MlError;
use crate::training::class_weights::ClassWeights;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Probability clip applied inside logarithms.
const EPS: f32 = 1e-7;

/// Smoothing constant of the Jaccard distance.
pub const JACCARD_SMOOTH: f64 = 100.0;

pub const FOCAL_GAMMA: f64 = 2.0;
pub const FOCAL_ALPHA: f64 = 0.25;

/// A selected loss strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossFunction {
    CrossEntropy,
    Jaccard { smooth: f64 },
    /// `alpha * jaccard + (1 - alpha) * cross_entropy`.
    JaccardCrossEntropy { alpha: f64, smooth: f64 },
    Focal { gamma: f64, alpha: f64 },
}

impl LossFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CrossEntropy => "cross-entropy",
            Self::Jaccard { .. } => "jaccard",
            Self::JaccardCrossEntropy { .. } => "jaccard-xentropy",
            Self::Focal { .. } => "focal",
        }
    }

    /// Loss of one pixel. `probs` and `target` run over the class axis.
    pub fn pixel(&self, probs: &[f32], target: &[f32]) -> f64 {
        match *self {
            Self::CrossEntropy => cross_entropy(probs, target),
            Self::Jaccard { smooth } => jaccard(probs, target, smooth),
            Self::JaccardCrossEntropy { alpha, smooth } => {
                alpha * jaccard(probs, target, smooth)
                    + (1.0 - alpha) * cross_entropy(probs, target)
            }
            Self::Focal { gamma, alpha } => focal(probs, target, gamma, alpha),
        }
    }

    /// Writes `d loss / d probs` of one pixel into `grad`.
    pub fn pixel_grad(&self, probs: &[f32], target: &[f32], grad: &mut [f32]) {
        match *self {
            Self::CrossEntropy => cross_entropy_grad(probs, target, 1.0, grad, false),
            Self::Jaccard { smooth } => jaccard_grad(probs, target, smooth, 1.0, grad, false),
            Self::JaccardCrossEntropy { alpha, smooth } => {
                jaccard_grad(probs, target, smooth, alpha, grad, false);
                cross_entropy_grad(probs, target, 1.0 - alpha, grad, true);
            }
            Self::Focal { gamma, alpha } => focal_grad(probs, target, gamma, alpha, grad),
        }
    }

    /// Mean over pixels of `w[true class] * loss(pixel)`. Rows are pixels.
    pub fn weighted_loss(
        &self,
        probs: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        weights: &ClassWeights,
    ) -> f64 {
        let n = probs.nrows();
        if n == 0 {
            return 0.0;
        }
        let total: f64 = probs
            .rows()
            .into_iter()
            .zip(targets.rows())
            .map(|(p, t)| {
                let (p, t) = (p.to_vec(), t.to_vec());
                weights.weight(argmax(&t)) * self.pixel(&p, &t)
            })
            .sum();
        total / n as f64
    }
}

/// Index of the largest entry; ties resolve to the lowest index.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn clip(p: f32) -> f64 {
    p.clamp(EPS, 1.0 - EPS) as f64
}

fn cross_entropy(probs: &[f32], target: &[f32]) -> f64 {
    probs
        .iter()
        .zip(target)
        .map(|(&p, &y)| -(y as f64) * clip(p).ln())
        .sum()
}

fn cross_entropy_grad(probs: &[f32], target: &[f32], scale: f64, grad: &mut [f32], add: bool) {
    for ((g, &p), &y) in grad.iter_mut().zip(probs).zip(target) {
        let d = (-scale * y as f64 / clip(p)) as f32;
        *g = if add { *g + d } else { d };
    }
}

/// Per-pixel Jaccard distance: `(1 - (I + s) / (S - I + s)) * s`.
pub fn jaccard(probs: &[f32], target: &[f32], smooth: f64) -> f64 {
    let (intersection, sum) = jaccard_terms(probs, target);
    let jac = (intersection + smooth) / (sum - intersection + smooth);
    (1.0 - jac) * smooth
}

fn jaccard_terms(probs: &[f32], target: &[f32]) -> (f64, f64) {
    probs
        .iter()
        .zip(target)
        .fold((0.0, 0.0), |(i, s), (&p, &y)| {
            let (p, y) = (p.abs() as f64, y.abs() as f64);
            (i + p * y, s + p + y)
        })
}

fn jaccard_grad(
    probs: &[f32],
    target: &[f32],
    smooth: f64,
    scale: f64,
    grad: &mut [f32],
    add: bool,
) {
    let (intersection, sum) = jaccard_terms(probs, target);
    let denom = sum - intersection + smooth;
    for (g, &y) in grad.iter_mut().zip(target) {
        let y = y as f64;
        let djac = (y * denom - (intersection + smooth) * (1.0 - y)) / (denom * denom);
        let d = (-smooth * djac * scale) as f32;
        *g = if add { *g + d } else { d };
    }
}

fn focal(probs: &[f32], target: &[f32], gamma: f64, alpha: f64) -> f64 {
    probs
        .iter()
        .zip(target)
        .map(|(&p, &y)| {
            let p = clip(p);
            -alpha * y as f64 * (1.0 - p).powf(gamma) * p.ln()
        })
        .sum()
}

fn focal_grad(probs: &[f32], target: &[f32], gamma: f64, alpha: f64, grad: &mut [f32]) {
    for ((g, &p), &y) in grad.iter_mut().zip(probs).zip(target) {
        let p = clip(p);
        let d = alpha
            * y as f64
            * (gamma * (1.0 - p).powf(gamma - 1.0) * p.ln() - (1.0 - p).powf(gamma) / p);
        *g = d as f32;
    }
}

/// Map the configured loss name to a strategy.
///
/// An unset or unrecognized name is a [`MlError::Configuration`]; there is no fallback.
pub fn select_loss(config: &ExperimentConfig) -> Result<LossFunction, MlError> {
    let loss = match config.loss.as_deref() {
        Some("cross-entropy") => LossFunction::CrossEntropy,
        Some("jaccard") => LossFunction::Jaccard {
            smooth: JACCARD_SMOOTH,
        },
        Some("jaccard-xentropy") => LossFunction::JaccardCrossEntropy {
            alpha: config.alpha,
            smooth: JACCARD_SMOOTH,
        },
        Some("focal") => LossFunction::Focal {
            gamma: FOCAL_GAMMA,
            alpha: FOCAL_ALPHA,
        },
        Some(other) => {
            return Err(MlError::configuration(format!(
                "unrecognized loss '{other}', expected one of cross-entropy, jaccard, jaccard-xentropy, focal"
            )));
        }
        None => return Err(MlError::configuration("please specify a loss function")),
    };
    tracing::info!(loss = loss.name(), "Selected loss");
    Ok(loss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn config_with(loss: Option<&str>) -> ExperimentConfig {
        ExperimentConfig {
            loss: loss.map(str::to_string),
            alpha: 0.3,
            ..Default::default()
        }
    }

    #[test]
    fn test_select_known_losses() {
        assert_eq!(
            select_loss(&config_with(Some("cross-entropy"))).unwrap(),
            LossFunction::CrossEntropy
        );
        assert_eq!(select_loss(&config_with(Some("jaccard"))).unwrap().name(), "jaccard");
        assert_eq!(
            select_loss(&config_with(Some("jaccard-xentropy"))).unwrap(),
            LossFunction::JaccardCrossEntropy {
                alpha: 0.3,
                smooth: JACCARD_SMOOTH
            }
        );
        assert_eq!(select_loss(&config_with(Some("focal"))).unwrap().name(), "focal");
    }

    #[test]
    fn test_unknown_or_unset_loss_is_configuration_error() {
        assert!(select_loss(&config_with(Some("unknown-loss"))).unwrap_err().is_configuration());
        assert!(select_loss(&config_with(None)).unwrap_err().is_configuration());
    }

    #[test]
    fn test_cross_entropy_value() {
        let loss = LossFunction::CrossEntropy.pixel(&[0.5, 0.25, 0.25], &[0.0, 1.0, 0.0]);
        assert!((loss - 4.0f64.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_jaccard_perfect_prediction_is_zero() {
        let d = jaccard(&[0.0, 1.0, 0.0], &[0.0, 1.0, 0.0], JACCARD_SMOOTH);
        assert!(d.abs() < 1e-12);
        assert!(jaccard(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0], JACCARD_SMOOTH) > 0.0);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let probs = [0.2f32, 0.5, 0.3];
        let target = [0.0f32, 0.0, 1.0];
        let strategies = [
            LossFunction::CrossEntropy,
            LossFunction::Jaccard { smooth: 1.0 },
            LossFunction::JaccardCrossEntropy {
                alpha: 0.4,
                smooth: 1.0,
            },
            LossFunction::Focal {
                gamma: FOCAL_GAMMA,
                alpha: FOCAL_ALPHA,
            },
        ];
        for loss in strategies {
            let mut grad = [0.0f32; 3];
            loss.pixel_grad(&probs, &target, &mut grad);
            for c in 0..3 {
                let h = 1e-3f32;
                let mut up = probs;
                let mut down = probs;
                up[c] += h;
                down[c] -= h;
                let numeric = (loss.pixel(&up, &target) - loss.pixel(&down, &target)) / (2.0 * h as f64);
                assert!(
                    (numeric - grad[c] as f64).abs() < 1e-2,
                    "{}: class {c}: numeric {numeric} analytic {}",
                    loss.name(),
                    grad[c]
                );
            }
        }
    }

    #[test]
    fn test_weighted_loss_scales_by_true_class() {
        let probs = Array2::from_shape_vec((2, 3), vec![0.5, 0.25, 0.25, 0.5, 0.25, 0.25]).unwrap();
        let targets = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
        let uniform = LossFunction::CrossEntropy.weighted_loss(
            probs.view(),
            targets.view(),
            &ClassWeights::uniform(),
        );
        let weighted = LossFunction::CrossEntropy.weighted_loss(
            probs.view(),
            targets.view(),
            &ClassWeights([1.0, 10.0, 1.0]),
        );
        let (bg, fg) = (2.0f64.ln(), 4.0f64.ln());
        assert!((uniform - (bg + fg) / 2.0).abs() < 1e-6);
        assert!((weighted - (bg + 10.0 * fg) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_argmax_ties_take_first() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), 1);
        assert_eq!(argmax(&[1.0, 0.0, 0.0]), 0);
    }
}
