//! Per-class loss weights against class imbalance.

use crate::data::NUM_CLASSES;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Heuristic vector for `weighted`.
pub const WEIGHTED: [f64; NUM_CLASSES] = [1.0, 100.0, 10.0];
/// Heuristic vector for `heavy-weighted`.
pub const HEAVY_WEIGHTED: [f64; NUM_CLASSES] = [1.0, 1000.0, 100.0];
pub const UNIFORM: [f64; NUM_CLASSES] = [1.0, 1.0, 1.0];

/// One non-negative multiplier per class, indexed by ground-truth class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights(pub [f64; NUM_CLASSES]);

impl ClassWeights {
    pub fn uniform() -> Self {
        Self(UNIFORM)
    }

    pub fn weight(&self, class: usize) -> f64 {
        self.0[class]
    }

    pub fn as_array(&self) -> [f64; NUM_CLASSES] {
        self.0
    }

    /// `n_pixels / (n_present_classes * count_c)` for every class present in `labels`.
    ///
    /// Absent classes keep weight 1. Labels outside the label space are not counted.
    pub fn balanced(labels: &Array3<u8>) -> Self {
        let mut counts = [0usize; NUM_CLASSES];
        let mut ignored = 0usize;
        for &label in labels.iter() {
            match counts.get_mut(label as usize) {
                Some(count) => *count += 1,
                None => ignored += 1,
            }
        }
        if ignored > 0 {
            tracing::warn!(ignored, "Labels outside the label space skipped for weighting");
        }
        let total = (labels.len() - ignored) as f64;
        let present = counts.iter().filter(|&&c| c > 0).count().max(1) as f64;

        let mut weights = UNIFORM;
        for (class, &count) in counts.iter().enumerate() {
            if count == 0 {
                tracing::warn!(class, "Class absent from training labels, weight left at 1");
            } else {
                weights[class] = total / (present * count as f64);
            }
        }
        Self(weights)
    }
}

impl Default for ClassWeights {
    fn default() -> Self {
        Self::uniform()
    }
}

/// Resolve the weight vector for a `class_weights` selector.
///
/// Unknown and absent selectors both disable weighting.
pub fn resolve_class_weights(selector: Option<&str>, train_labels: &Array3<u8>) -> ClassWeights {
    let weights = match selector {
        Some("balanced") => ClassWeights::balanced(train_labels),
        Some("weighted") => ClassWeights(WEIGHTED),
        Some("heavy-weighted") => ClassWeights(HEAVY_WEIGHTED),
        _ => ClassWeights::uniform(),
    };
    tracing::info!(?selector, weights = ?weights.0, "Resolved class weights");
    weights
}
