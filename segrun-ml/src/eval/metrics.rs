//! Segmentation quality metrics over flattened label vectors.

use crate::data::NUM_CLASSES;
use crate::error::MlError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Counts indexed `[truth][predicted]` over the fixed label space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<Vec<u64>>", try_from = "Vec<Vec<u64>>")]
pub struct ConfusionMatrix(pub [[u64; NUM_CLASSES]; NUM_CLASSES]);

impl ConfusionMatrix {
    pub fn from_labels(truth: &[u8], pred: &[u8]) -> Result<Self, MlError> {
        check_lengths(truth, pred)?;
        let mut counts = [[0u64; NUM_CLASSES]; NUM_CLASSES];
        for (&t, &p) in truth.iter().zip(pred) {
            let (t, p) = (t as usize, p as usize);
            if t >= NUM_CLASSES || p >= NUM_CLASSES {
                return Err(MlError::evaluation(format!(
                    "label pair ({t}, {p}) outside the {NUM_CLASSES}-class label space"
                )));
            }
            counts[t][p] += 1;
        }
        Ok(Self(counts))
    }

    pub fn total(&self) -> u64 {
        self.0.iter().flatten().sum()
    }

    fn true_positives(&self, class: usize) -> u64 {
        self.0[class][class]
    }

    /// Pixels of `class` in the ground truth.
    fn support(&self, class: usize) -> u64 {
        self.0[class].iter().sum()
    }

    /// Pixels predicted as `class`.
    fn predicted(&self, class: usize) -> u64 {
        self.0.iter().map(|row| row[class]).sum()
    }
}

impl From<ConfusionMatrix> for Vec<Vec<u64>> {
    fn from(matrix: ConfusionMatrix) -> Self {
        matrix.0.iter().map(|row| row.to_vec()).collect()
    }
}

impl TryFrom<Vec<Vec<u64>>> for ConfusionMatrix {
    type Error = String;

    fn try_from(rows: Vec<Vec<u64>>) -> Result<Self, Self::Error> {
        let mut counts = [[0u64; NUM_CLASSES]; NUM_CLASSES];
        if rows.len() != NUM_CLASSES {
            return Err(format!("expected {NUM_CLASSES} rows, got {}", rows.len()));
        }
        for (dst, row) in counts.iter_mut().zip(rows) {
            *dst = row
                .try_into()
                .map_err(|row: Vec<u64>| format!("expected {NUM_CLASSES} columns, got {}", row.len()))?;
        }
        Ok(Self(counts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "f1-score")]
    pub f1_score: f64,
    pub support: u64,
}

/// Per-class precision, recall, F1 and support with accuracy and averages.
///
/// Serializes to the same mapping layout as a scikit-learn report dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    #[serde(flatten)]
    pub classes: BTreeMap<String, ClassScores>,
    pub accuracy: f64,
    #[serde(rename = "macro avg")]
    pub macro_avg: ClassScores,
    #[serde(rename = "weighted avg")]
    pub weighted_avg: ClassScores,
}

impl ClassificationReport {
    /// Scores for every label present in `truth` or `pred`; undefined ratios are 0.
    pub fn from_labels(truth: &[u8], pred: &[u8]) -> Result<Self, MlError> {
        let matrix = ConfusionMatrix::from_labels(truth, pred)?;
        let labels = present_labels(&matrix);
        let total = matrix.total();

        let mut classes = BTreeMap::new();
        let mut macro_sum = [0.0; 3];
        let mut weighted_sum = [0.0; 3];
        for &class in &labels {
            let tp = matrix.true_positives(class) as f64;
            let support = matrix.support(class);
            let precision = ratio(tp, matrix.predicted(class) as f64);
            let recall = ratio(tp, support as f64);
            let f1_score = ratio(2.0 * precision * recall, precision + recall);

            for (i, v) in [precision, recall, f1_score].into_iter().enumerate() {
                macro_sum[i] += v;
                weighted_sum[i] += v * support as f64;
            }
            classes.insert(
                class.to_string(),
                ClassScores {
                    precision,
                    recall,
                    f1_score,
                    support,
                },
            );
        }

        let n_labels = labels.len() as f64;
        let average = |sum: [f64; 3], denom: f64| ClassScores {
            precision: ratio(sum[0], denom),
            recall: ratio(sum[1], denom),
            f1_score: ratio(sum[2], denom),
            support: total,
        };
        let correct: u64 = (0..NUM_CLASSES).map(|c| matrix.true_positives(c)).sum();

        Ok(Self {
            classes,
            accuracy: ratio(correct as f64, total as f64),
            macro_avg: average(macro_sum, n_labels),
            weighted_avg: average(weighted_sum, total as f64),
        })
    }

    /// Fixed-width text table with `digits` decimals.
    pub fn to_text(&self, digits: usize) -> String {
        let width = self
            .classes
            .keys()
            .map(String::len)
            .chain(["weighted avg".len(), digits])
            .max()
            .unwrap_or(12);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}\n",
            "", "precision", "recall", "f1-score", "support"
        );
        let row = |out: &mut String, name: &str, s: &ClassScores| {
            let _ = writeln!(
                out,
                "{name:>width$}  {:>9.digits$} {:>9.digits$} {:>9.digits$} {:>9}",
                s.precision, s.recall, s.f1_score, s.support
            );
        };
        for (name, scores) in &self.classes {
            row(&mut out, name, scores);
        }
        let _ = writeln!(
            out,
            "\n{:>width$}  {:>9} {:>9} {:>9.digits$} {:>9}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        );
        row(&mut out, "macro avg", &self.macro_avg);
        row(&mut out, "weighted avg", &self.weighted_avg);
        out
    }
}

/// Mean intersection-over-union across the labels present in `truth` or `pred`.
pub fn jaccard_macro(truth: &[u8], pred: &[u8]) -> Result<f64, MlError> {
    let matrix = ConfusionMatrix::from_labels(truth, pred)?;
    let labels = present_labels(&matrix);
    if labels.is_empty() {
        return Ok(0.0);
    }
    let sum: f64 = labels
        .iter()
        .map(|&c| {
            let tp = matrix.true_positives(c) as f64;
            let union = (matrix.support(c) + matrix.predicted(c)) as f64 - tp;
            ratio(tp, union)
        })
        .sum();
    Ok(sum / labels.len() as f64)
}

fn present_labels(matrix: &ConfusionMatrix) -> Vec<usize> {
    (0..NUM_CLASSES)
        .filter(|&c| matrix.support(c) > 0 || matrix.predicted(c) > 0)
        .collect()
}

fn ratio(num: f64, denom: f64) -> f64 {
    if denom == 0.0 { 0.0 } else { num / denom }
}

fn check_lengths(truth: &[u8], pred: &[u8]) -> Result<(), MlError> {
    if truth.len() != pred.len() {
        return Err(MlError::evaluation(format!(
            "{} ground-truth labels but {} predictions",
            truth.len(),
            pred.len()
        )));
    }
    Ok(())
}
