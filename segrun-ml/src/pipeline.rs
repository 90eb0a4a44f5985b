//! End-to-end experiment run: select strategies, prepare the output directory, load
//! data, train, evaluate.

use crate::config::{ExperimentConfig, ExperimentDir};
use crate::data::{AugmentationPipeline, DatasetLoader, NUM_CLASSES, Prefetcher, one_hot};
use crate::error::MlError;
use crate::eval::{EvaluationReport, EvaluationReporter};
use crate::model::{ModelFactory, ModelSpec};
use crate::persistence::atomic_write_yaml;
use crate::training::{
    ClassWeights, TrainingOrchestrator, TrainingRun, resolve_class_weights, select_loss,
    select_optimizer,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a finished experiment produced.
#[derive(Debug)]
pub struct ExperimentOutcome {
    pub dir: PathBuf,
    pub class_weights: ClassWeights,
    pub run: TrainingRun,
    pub report: EvaluationReport,
}

pub struct ExperimentPipeline<L, F> {
    config: ExperimentConfig,
    loader: L,
    factory: F,
}

impl<L: DatasetLoader, F: ModelFactory> ExperimentPipeline<L, F> {
    pub fn new(config: ExperimentConfig, loader: L, factory: F) -> Self {
        Self {
            config,
            loader,
            factory,
        }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run the experiment.
    ///
    /// Unknown loss or optimizer names fail with [`MlError::Configuration`] before
    /// anything touches the filesystem.
    pub fn run(&self) -> Result<ExperimentOutcome, MlError> {
        let config = &self.config;
        let loss = select_loss(config)?;
        let optimizer = select_optimizer(config)?;

        let dir = ExperimentDir::prepare(config)?;
        let split = self.loader.load()?;
        tracing::info!(
            train = split.train_len(),
            val = split.val_len(),
            input_shape = ?split.input_shape(),
            "Dataset loaded"
        );

        let augmentation = AugmentationPipeline::from_config(config);
        let steps_per_epoch = augmentation.steps_per_epoch(split.train_len());

        let spec = ModelSpec {
            input_shape: split.input_shape(),
            num_classes: NUM_CLASSES,
            seed: config.seed,
            hyperparams: config.model.clone(),
        };
        let mut model = self.factory.construct(&spec)?;
        atomic_write_yaml(&dir.architecture_path(), &model.architecture())?;
        model.compile(loss, optimizer);

        let class_weights =
            resolve_class_weights(config.class_weights.as_deref(), &split.train_labels);

        let mut orchestrator =
            TrainingOrchestrator::from_config(config, &dir, steps_per_epoch, class_weights);
        let val_masks = one_hot(&split.val_labels);
        let batches = augmentation.flow(
            Arc::new(split.train_images.clone()),
            Arc::new(one_hot(&split.train_labels)),
        );

        let run = if config.prefetch_batches > 0 {
            let prefetched = Prefetcher::spawn(batches, config.prefetch_batches)?;
            orchestrator.fit(model.as_mut(), prefetched, &split.val_images, &val_masks)?
        } else {
            orchestrator.fit(model.as_mut(), batches, &split.val_images, &val_masks)?
        };

        let reporter = EvaluationReporter::new(&dir, config.batch_size);
        let report = reporter.evaluate(model.as_mut(), &split, run.best_checkpoint.as_ref())?;

        Ok(ExperimentOutcome {
            dir: dir.root().to_path_buf(),
            class_weights,
            run,
            report,
        })
    }
}
