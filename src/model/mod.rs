pub mod config;
#[cfg(feature = "ml")]
pub mod model_metadata;
#[cfg(feature = "ml")]
pub mod model_storage;
#[cfg(feature = "ml")]
pub mod inference_config;

#[cfg(feature = "ml")]
pub use model_metadata::ModelMetadata;
#[cfg(feature = "ml")]
pub use model_storage::{
    load_artifact, load_metadata, log_metadata_info, save_model_with_metadata, LoadedArtifact,
    ModelStorageError,
};
#[cfg(feature = "ml")]
pub use inference_config::InferenceConfig;
pub use config::{AppConfig, DeviceType, PathSettings, TrainingSettings};
