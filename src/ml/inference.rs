//! モデル推論機能

use anyhow::{Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use std::path::Path;

use crate::ml::ml_model::{is_image_file, load_sample, pixels_to_tensor, Sample, ShapeClassifier};
use crate::model::{load_artifact, InferenceConfig, ModelStorageError};
use crate::scoring::FilePrediction;
use crate::types::Prediction;

/// 推論エンジン
///
/// 読み込んだモデルを所有し、読み取り専用で使う。
pub struct InferenceEngine<B: Backend> {
    model: ShapeClassifier<B>,
    config: InferenceConfig,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// 学習済みモデルから推論エンジンを作成
    pub fn new(model: ShapeClassifier<B>, config: InferenceConfig, device: B::Device) -> Self {
        Self { model, config, device }
    }

    /// モデルファイルを読み込んで推論エンジンを初期化
    pub fn load(model_path: &Path, device: B::Device) -> Result<Self, ModelStorageError> {
        let artifact = load_artifact(model_path)?;
        let config = InferenceConfig::from_metadata(&artifact.metadata);

        let model = artifact
            .metadata
            .model
            .init::<B>(&device)
            .map_err(|e| ModelStorageError::corrupt(model_path, e.to_string()))?;

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = recorder
            .load(artifact.model_binary, &device)
            .map_err(|e| ModelStorageError::corrupt(model_path, format!("model weights: {:?}", e)))?;
        let model = model.load_record(record);

        Ok(Self { model, config, device })
    }

    /// 前処理済みの1枚を分類
    pub fn predict(&self, sample: &Sample) -> Result<Prediction> {
        let image_size = self.config.model_input_size;
        if sample.size() != image_size {
            anyhow::bail!(
                "sample is {}x{}, the model expects {}x{}",
                sample.size(),
                sample.size(),
                image_size,
                image_size
            );
        }

        let images = pixels_to_tensor::<B>(sample.pixels().to_vec(), 1, image_size, &self.device);
        let probabilities = self
            .model
            .probabilities(images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("failed to read probabilities: {:?}", e))?;

        Prediction::from_probabilities(probabilities)
            .ok_or_else(|| anyhow::anyhow!("model output does not match the class vocabulary"))
    }

    /// 画像ファイルを学習時と同じ前処理で読み込み、分類する
    pub fn classify_image(&self, image_path: &Path) -> Result<Prediction> {
        let sample = load_sample(image_path, self.config.model_input_size)
            .context(format!("Failed to load image {}", image_path.display()))?;
        self.predict(&sample)
    }

    /// フォルダ内の画像をファイル名順に分類する
    ///
    /// 読み込めない画像は警告を出して飛ばす。`limit`は分類できた枚数の上限。
    pub fn classify_directory(&self, dir: &Path, limit: Option<usize>) -> Result<Vec<FilePrediction>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).context(format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            if is_image_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut results = Vec::new();
        for path in paths {
            if limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            let filename = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            match self.classify_image(&path) {
                Ok(prediction) => results.push(FilePrediction { filename, prediction }),
                Err(e) => log::warn!("skipping {}: {:#}", path.display(), e),
            }
        }

        Ok(results)
    }

    pub fn model(&self) -> &ShapeClassifier<B> {
        &self.model
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }
}
