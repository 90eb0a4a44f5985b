//! Training: strategy selection, class weighting and the epoch loop.

pub mod callbacks;
pub mod checkpoint;
pub mod class_weights;
pub mod experiment;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod orchestrator;

pub use callbacks::{CallbackAction, StallPolicy, StopReason, TrainingCallback};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use class_weights::{ClassWeights, resolve_class_weights};
pub use experiment::{RunOutcome, RunStatus, TrainingRun};
pub use loss::{LossFunction, select_loss};
pub use metrics::{EpochLogs, TrainingHistory};
pub use optimizer::{Optimizer, select_optimizer};
pub use orchestrator::TrainingOrchestrator;
