//! モデル学習
//!
//! ミニバッチ学習ループ（Adam + 交差エントロピー）と、
//! 読み込み → 分割 → 学習 → 保存までのパイプラインを提供します。

use anyhow::{Context, Result};
use burn::{
    config::Config,
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use rand::{seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ml::dataset::{ShapeBatch, ShapeBatcher, ShapeDataset, ShapeItem};
use crate::ml::ml_model::{ModelConfig, ShapeClassifier};
use crate::model::config::TrainingSettings;
use crate::model::{load_artifact, save_model_with_metadata, ModelMetadata, ModelStorageError};
use crate::types::stable_argmax;

#[derive(Error, Debug, PartialEq)]
pub enum TrainingError {
    #[error("the training set is empty, nothing to learn from")]
    EmptyTrainingSet,
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("number of epochs must be at least 1")]
    NoEpochs,
    #[error("sample shape mismatch: model expects {expected}x{expected}, dataset has {found}x{found}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("loss is no longer finite at epoch {epoch}, training diverged")]
    NonFiniteLoss { epoch: usize },
    #[error("failed to read logits back from the device: {0}")]
    DeviceRead(String),
}

/// 学習設定
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub optimizer: AdamConfig,
    #[config(default = 10)]
    pub num_epochs: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 1e-3)]
    pub learning_rate: f64,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 0.8)]
    pub train_ratio: f64,
}

impl TrainingConfig {
    pub fn from_settings(settings: &TrainingSettings) -> Self {
        Self::new(AdamConfig::new())
            .with_num_epochs(settings.num_epochs)
            .with_batch_size(settings.batch_size)
            .with_learning_rate(settings.learning_rate)
            .with_seed(settings.seed)
            .with_train_ratio(settings.train_ratio)
    }
}

/// 1エポック分の指標
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_accuracy: f32,
    /// 検証データが空の場合は`None`
    pub valid_loss: Option<f32>,
    pub valid_accuracy: Option<f32>,
}

impl EpochMetrics {
    /// 全ての指標が有限値か（JSONに保存できるのは有限値のみ）
    pub fn is_finite(&self) -> bool {
        self.train_loss.is_finite()
            && self.train_accuracy.is_finite()
            && self.valid_loss.map_or(true, f32::is_finite)
            && self.valid_accuracy.map_or(true, f32::is_finite)
    }
}

/// 損失と正解数の累積
#[derive(Debug, Default)]
struct Accumulator {
    loss_sum: f32,
    correct: usize,
    count: usize,
}

impl Accumulator {
    fn add<B: Backend>(
        &mut self,
        loss: Tensor<B, 1>,
        logits: Tensor<B, 2>,
        labels: &[usize],
    ) -> Result<(), TrainingError> {
        let batch_size = labels.len();
        self.loss_sum += loss.into_scalar().elem::<f32>() * batch_size as f32;
        self.correct += count_correct(logits, labels)?;
        self.count += batch_size;
        Ok(())
    }

    fn mean_loss(&self) -> Option<f32> {
        (self.count > 0).then(|| self.loss_sum / self.count as f32)
    }

    fn accuracy(&self) -> Option<f32> {
        (self.count > 0).then(|| self.correct as f32 / self.count as f32)
    }
}

/// ロジットの行ごとのarg-max（同値は小さいID）と正解ラベルの一致数
fn count_correct<B: Backend>(logits: Tensor<B, 2>, labels: &[usize]) -> Result<usize, TrainingError> {
    let [_, num_classes] = logits.dims();
    let values = logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainingError::DeviceRead(format!("{:?}", e)))?;

    Ok(values
        .chunks(num_classes)
        .zip(labels)
        .filter(|(row, &label)| stable_argmax(row) == Some(label))
        .count())
}

/// モデル・オプティマイザ・設定をまとめた学習器
pub struct Trainer<B: AutodiffBackend> {
    model: ShapeClassifier<B>,
    optim: OptimizerAdaptor<Adam, ShapeClassifier<B>, B>,
    model_config: ModelConfig,
    config: TrainingConfig,
    history: Vec<EpochMetrics>,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// 未学習のモデルで学習器を作成
    pub fn new(model_config: ModelConfig, config: TrainingConfig, device: B::Device) -> Result<Self> {
        let model = model_config.init::<B>(&device)?;
        let optim = config.optimizer.init();

        Ok(Self {
            model,
            optim,
            model_config,
            config,
            history: Vec::new(),
            device,
        })
    }

    /// 保存済みモデルから学習を再開する
    ///
    /// パラメータ・オプティマイザ状態・これまでの履歴を引き継ぐ。
    pub fn resume(path: &Path, config: TrainingConfig, device: B::Device) -> Result<Self> {
        let artifact = load_artifact(path)?;
        let metadata = artifact.metadata;

        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let model = metadata.model.init::<B>(&device)?;
        let record = recorder
            .load(artifact.model_binary, &device)
            .map_err(|e| ModelStorageError::corrupt(path, format!("model weights: {:?}", e)))?;
        let model = model.load_record(record);

        let mut optim = config.optimizer.init();
        match artifact.optimizer_binary {
            Some(bytes) => {
                let record = recorder
                    .load(bytes, &device)
                    .map_err(|e| ModelStorageError::corrupt(path, format!("optimizer state: {:?}", e)))?;
                optim = optim.load_record(record);
            }
            None => log::warn!("artifact has no optimizer state, Adam starts from scratch"),
        }

        log::info!(
            "resuming from {} after {} epoch(s)",
            path.display(),
            metadata.history.len()
        );

        Ok(Self {
            model,
            optim,
            model_config: metadata.model,
            config,
            history: metadata.history,
            device,
        })
    }

    pub fn model(&self) -> &ShapeClassifier<B> {
        &self.model
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn check_inputs(&self, train: &ShapeDataset, valid: &ShapeDataset) -> Result<(), TrainingError> {
        if train.is_empty() {
            return Err(TrainingError::EmptyTrainingSet);
        }
        if self.config.batch_size == 0 {
            return Err(TrainingError::InvalidBatchSize);
        }
        if self.config.num_epochs == 0 {
            return Err(TrainingError::NoEpochs);
        }

        let expected = self.model_config.image_size;
        for dataset in [train, valid] {
            if let Some(item) = dataset.items().iter().find(|item| item.sample.size() != expected) {
                return Err(TrainingError::ShapeMismatch {
                    expected,
                    found: item.sample.size(),
                });
            }
        }
        Ok(())
    }

    /// 学習を実行し、今回の学習分のエポック指標を返す
    ///
    /// 学習データと検証データは変更しない。
    pub fn fit(&mut self, train: &ShapeDataset, valid: &ShapeDataset) -> Result<Vec<EpochMetrics>, TrainingError> {
        self.check_inputs(train, valid)?;

        let image_size = self.model_config.image_size;
        let batcher_train = ShapeBatcher::<B>::new(self.device.clone(), image_size);
        let batcher_valid = ShapeBatcher::<B::InnerBackend>::new(self.device.clone(), image_size);

        let first_epoch = self.history.len() + 1;
        let last_epoch = self.history.len() + self.config.num_epochs;
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let mut run = Vec::with_capacity(self.config.num_epochs);

        for epoch in first_epoch..=last_epoch {
            // エポックごとに並び順だけを変える
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);

            let mut train_acc = Accumulator::default();
            for chunk in indices.chunks(self.config.batch_size) {
                let items: Vec<ShapeItem> = chunk.iter().filter_map(|&i| train.get(i)).collect();
                let batch: ShapeBatch<B> = batcher_train.batch(items, &self.device);

                let model = self.model.clone();
                let output = model.forward_classification(batch.images, batch.targets);
                train_acc.add(output.loss.clone(), output.output, &batch.labels)?;

                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                self.model = self.optim.step(self.config.learning_rate, model, grads);
            }

            // 検証はautodiff無しのモデルで行う
            let model_valid = self.model.valid();
            let mut valid_acc = Accumulator::default();
            for start in (0..valid.len()).step_by(self.config.batch_size) {
                let end = (start + self.config.batch_size).min(valid.len());
                let items: Vec<ShapeItem> = (start..end).filter_map(|i| valid.get(i)).collect();
                let batch: ShapeBatch<B::InnerBackend> = batcher_valid.batch(items, &self.device);

                let output = model_valid.forward_classification(batch.images, batch.targets);
                valid_acc.add(output.loss, output.output, &batch.labels)?;
            }

            let metrics = EpochMetrics {
                epoch,
                train_loss: train_acc.mean_loss().unwrap_or(f32::NAN),
                train_accuracy: train_acc.accuracy().unwrap_or(0.0),
                valid_loss: valid_acc.mean_loss(),
                valid_accuracy: valid_acc.accuracy(),
            };
            log_epoch(&metrics, last_epoch);
            if !metrics.is_finite() {
                return Err(TrainingError::NonFiniteLoss { epoch });
            }

            self.history.push(metrics.clone());
            run.push(metrics);
        }

        Ok(run)
    }

    /// モデル・オプティマイザ状態・メタデータを1ファイルに保存
    pub fn save(&self, path: &Path) -> Result<PathBuf> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let model_binary = recorder
            .record(self.model.clone().into_record(), ())
            .map_err(|e| anyhow::anyhow!("failed to encode model weights: {:?}", e))?;
        let optimizer_binary = recorder
            .record(self.optim.to_record(), ())
            .map_err(|e| anyhow::anyhow!("failed to encode optimizer state: {:?}", e))?;

        let metadata = ModelMetadata::new(
            self.model_config.clone(),
            self.config.clone(),
            self.history.clone(),
            self.model.num_params(),
        );

        let saved = save_model_with_metadata(path, &metadata, &model_binary, Some(&optimizer_binary))?;
        log::info!(
            "model saved as '{}' ({:.2} MB of weights)",
            saved.display(),
            model_binary.len() as f64 / 1024.0 / 1024.0
        );
        Ok(saved)
    }
}

fn log_epoch(metrics: &EpochMetrics, last_epoch: usize) {
    match (metrics.valid_loss, metrics.valid_accuracy) {
        (Some(valid_loss), Some(valid_accuracy)) => log::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4}",
            metrics.epoch, last_epoch, metrics.train_loss, metrics.train_accuracy, valid_loss, valid_accuracy
        ),
        _ => log::info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} (no validation data)",
            metrics.epoch, last_epoch, metrics.train_loss, metrics.train_accuracy
        ),
    }
}

/// 学習結果の概要
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub model_path: PathBuf,
    pub train_size: usize,
    pub valid_size: usize,
    pub history: Vec<EpochMetrics>,
}

/// データ読み込みから保存までを実行する
///
/// `resume_from` が指定された場合はそのモデルから学習を続ける。
pub fn train_model<B: AutodiffBackend>(
    data_dir: &Path,
    output_model_path: &Path,
    config: TrainingConfig,
    resume_from: Option<&Path>,
    device: B::Device,
) -> Result<TrainingSummary> {
    let mut trainer = match resume_from {
        Some(path) => Trainer::<B>::resume(path, config, device)?,
        None => Trainer::<B>::new(ModelConfig::for_vocabulary(), config, device)?,
    };

    log::info!("loading data...");
    let (dataset, summary) = ShapeDataset::from_directory(data_dir, trainer.model_config().image_size)
        .context(format!("Failed to load training data from {}", data_dir.display()))?;
    summary.log();

    if dataset.is_empty() {
        return Err(TrainingError::EmptyTrainingSet)
            .context(format!("no usable images under {}", data_dir.display()));
    }

    let (train, valid) = dataset.split(trainer.config().train_ratio, trainer.config().seed)?;
    log::info!("training samples: {}", train.len());
    log::info!("validation samples: {}", valid.len());

    log::info!("training model...");
    let history = trainer.fit(&train, &valid)?;
    let model_path = trainer.save(output_model_path)?;

    Ok(TrainingSummary {
        model_path,
        train_size: train.len(),
        valid_size: valid.len(),
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::tests::write_shape_images;
    use crate::ml::dataset::LabeledSample;
    use crate::ml::ml_model::{Sample, IMAGE_SIZE};
    use crate::types::ShapeClass;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn quick_config() -> TrainingConfig {
        TrainingConfig::new(AdamConfig::new())
            .with_num_epochs(2)
            .with_batch_size(4)
    }

    fn trainer() -> Trainer<TestBackend> {
        Trainer::new(ModelConfig::for_vocabulary(), quick_config(), Default::default()).unwrap()
    }

    fn blank_dataset(count: usize, size: usize) -> ShapeDataset {
        let items = (0..count)
            .map(|i| LabeledSample {
                path: PathBuf::from(format!("{}.png", i)),
                sample: Sample::new(size, vec![(i % 2) as f32; size * size]).unwrap(),
                label: ShapeClass::from_index(i % ShapeClass::COUNT).unwrap(),
            })
            .collect();
        ShapeDataset::new(items, size)
    }

    #[test]
    fn test_empty_training_set_fails_fast() {
        let mut trainer = trainer();
        let result = trainer.fit(&ShapeDataset::new(Vec::new(), IMAGE_SIZE), &blank_dataset(2, IMAGE_SIZE));
        assert_eq!(result, Err(TrainingError::EmptyTrainingSet));
        assert!(trainer.history().is_empty());
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut trainer = trainer();
        let result = trainer.fit(&blank_dataset(3, 32), &blank_dataset(1, 32));
        assert_eq!(
            result,
            Err(TrainingError::ShapeMismatch { expected: IMAGE_SIZE, found: 32 })
        );
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let mut trainer = Trainer::<TestBackend>::new(
            ModelConfig::for_vocabulary(),
            quick_config().with_batch_size(0),
            Default::default(),
        )
        .unwrap();
        let result = trainer.fit(&blank_dataset(3, IMAGE_SIZE), &blank_dataset(1, IMAGE_SIZE));
        assert_eq!(result, Err(TrainingError::InvalidBatchSize));
    }

    #[test]
    fn test_fit_records_history_per_epoch() {
        let mut trainer = trainer();
        let train = blank_dataset(6, IMAGE_SIZE);
        let valid = blank_dataset(3, IMAGE_SIZE);

        let history = trainer.fit(&train, &valid).unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].epoch, 1);
        assert_eq!(history[1].epoch, 2);
        for metrics in &history {
            assert!(metrics.train_loss.is_finite());
            assert!((0.0..=1.0).contains(&metrics.train_accuracy));
            assert!(metrics.valid_loss.unwrap().is_finite());
            assert!((0.0..=1.0).contains(&metrics.valid_accuracy.unwrap()));
        }
        // 学習・検証データはそのまま
        assert_eq!(train.len(), 6);
        assert_eq!(valid.len(), 3);
    }

    #[test]
    fn test_empty_validation_has_no_metrics() {
        let mut trainer = trainer();
        let history = trainer
            .fit(&blank_dataset(5, IMAGE_SIZE), &ShapeDataset::new(Vec::new(), IMAGE_SIZE))
            .unwrap();
        assert!(history.iter().all(|m| m.valid_loss.is_none() && m.valid_accuracy.is_none()));
    }

    #[test]
    fn test_count_correct_prefers_lower_index_on_ties() {
        let device = Default::default();
        let logits = Tensor::<NdArray, 1>::from_floats([1.0, 1.0, 0.0, 0.0, 2.0, 2.0], &device)
            .reshape([2, 3]);
        assert_eq!(count_correct(logits.clone(), &[0, 1]), Ok(2));
        assert_eq!(count_correct(logits, &[1, 2]), Ok(0));
    }

    #[test]
    fn test_diverged_training_stops_before_history() {
        let mut trainer = trainer();
        let items = (0..4)
            .map(|i| LabeledSample {
                path: PathBuf::from(format!("{}.png", i)),
                sample: Sample::new(IMAGE_SIZE, vec![f32::NAN; IMAGE_SIZE * IMAGE_SIZE]).unwrap(),
                label: ShapeClass::from_index(i % ShapeClass::COUNT).unwrap(),
            })
            .collect();
        let poisoned = ShapeDataset::new(items, IMAGE_SIZE);

        let result = trainer.fit(&poisoned, &ShapeDataset::new(Vec::new(), IMAGE_SIZE));
        assert_eq!(result, Err(TrainingError::NonFiniteLoss { epoch: 1 }));
        assert!(trainer.history().is_empty());

        // 発散前の履歴のみなので保存したモデルは読み戻せる
        let dir = tempfile::tempdir().unwrap();
        let saved = trainer.save(&dir.path().join("model.tar.gz")).unwrap();
        assert!(load_artifact(&saved).is_ok());
    }

    #[test]
    fn test_epoch_metrics_finiteness() {
        let mut metrics = EpochMetrics {
            epoch: 1,
            train_loss: 0.5,
            train_accuracy: 1.0,
            valid_loss: None,
            valid_accuracy: None,
        };
        assert!(metrics.is_finite());
        metrics.valid_loss = Some(f32::INFINITY);
        assert!(!metrics.is_finite());
        metrics.valid_loss = None;
        metrics.train_loss = f32::NAN;
        assert!(!metrics.is_finite());
    }

    #[test]
    fn test_train_model_end_to_end_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        for class in ShapeClass::ALL {
            write_shape_images(&data_dir, class, 4);
        }
        let model_path = dir.path().join("shape_model.tar.gz");

        let summary = train_model::<TestBackend>(
            &data_dir,
            &model_path,
            quick_config().with_num_epochs(1),
            None,
            Default::default(),
        )
        .unwrap();

        assert_eq!(summary.model_path, model_path);
        assert!(model_path.is_file());
        assert_eq!(summary.train_size + summary.valid_size, 12);
        assert_eq!(summary.train_size, 9);
        assert_eq!(summary.history.len(), 1);

        let resumed = train_model::<TestBackend>(
            &data_dir,
            &model_path,
            quick_config().with_num_epochs(1),
            Some(&model_path),
            Default::default(),
        )
        .unwrap();
        assert_eq!(resumed.history.len(), 1);
        assert_eq!(resumed.history[0].epoch, 2);

        let artifact = load_artifact(&model_path).unwrap();
        assert_eq!(artifact.metadata.history.len(), 2);
        assert!(artifact.optimizer_binary.is_some());
    }

    #[test]
    fn test_train_model_without_images_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = train_model::<TestBackend>(
            dir.path(),
            &dir.path().join("model.tar.gz"),
            quick_config(),
            None,
            Default::default(),
        );
        assert!(result.is_err());
    }
}
