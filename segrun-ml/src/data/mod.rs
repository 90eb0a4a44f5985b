//! Data side of an experiment: dataset contract, augmentation, batch prefetch.

pub mod augment;
pub mod dataset;
pub mod prefetch;

pub use augment::{AugmentParams, AugmentationPipeline, Batch, PairedBatches};
pub use dataset::{DatasetDocument, DatasetLoader, DatasetSplit, JsonDatasetLoader, NUM_CLASSES, one_hot};
pub use prefetch::Prefetcher;
