//! Evaluation of the finalized checkpoint.

pub mod metrics;
pub mod reporter;

pub use metrics::{ClassScores, ClassificationReport, ConfusionMatrix, jaccard_macro};
pub use reporter::{EvaluationReport, EvaluationReporter, read_predictions, write_predictions};
