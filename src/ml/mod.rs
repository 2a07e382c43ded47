pub mod dataset;
pub mod ml_model;
pub mod training;
pub mod inference;

pub use dataset::{LoadOutcome, LoadSummary, SkippedFile, ShapeBatch, ShapeBatcher, ShapeDataset, ShapeItem};
pub use ml_model::{
    load_sample, preprocess_image, ArchitectureError, ModelConfig, Sample, ShapeClassifier, IMAGE_SIZE,
};
pub use training::{train_model, EpochMetrics, Trainer, TrainingConfig, TrainingError, TrainingSummary};
pub use inference::InferenceEngine;
