//! # segrun-ml: configuration-driven segmentation experiments
//!
//! Resolves an experiment document into typed options, builds the augmented batch
//! stream, selects the loss, optimizer and class weighting, runs the epoch loop with
//! checkpointing and its stall policy, then scores the best checkpoint.
//!
//! ## Run phases
//!
//! 1. **Config**: [`ExperimentConfig::load`] layers defaults, the YAML document and
//!    `SEGRUN_` environment overrides.
//! 2. **Strategies**: loss and optimizer names resolve to executors or fail with
//!    [`MlError::Configuration`] before any output is created.
//! 3. **Fit**: [`training::TrainingOrchestrator`] drives a [`model::SegmentationModel`].
//! 4. **Evaluate**: [`eval::EvaluationReporter`] writes `eval.yaml`.

// Foundation
pub mod config;
pub mod error;
pub mod persistence;

// Data
pub mod data;

// Model contract
pub mod model;

// Training
pub mod training;

// Evaluation
pub mod eval;

pub mod pipeline;

// Re-exports
pub use config::{CollisionPolicy, ExperimentConfig, ExperimentDir};
pub use error::MlError;
pub use pipeline::{ExperimentOutcome, ExperimentPipeline};
