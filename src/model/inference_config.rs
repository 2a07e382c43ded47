//! モデルメタデータから推論に必要な情報を取り出す

use crate::model::model_metadata::ModelMetadata;
use crate::types::ShapeClass;

/// モデルメタデータから推論用情報を取得
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// クラスID順のクラス
    pub class_labels: Vec<ShapeClass>,

    /// モデル入力解像度
    pub model_input_size: usize,

    /// 通算学習エポック数
    pub num_epochs: usize,

    pub trained_at: String,
}

impl InferenceConfig {
    /// メタデータからInferenceConfigを作成
    ///
    /// 語彙の整合性は読み込み時に確認済みであること。
    pub fn from_metadata(metadata: &ModelMetadata) -> Self {
        Self {
            class_labels: metadata
                .class_labels
                .iter()
                .filter_map(|name| ShapeClass::from_name(name))
                .collect(),
            model_input_size: metadata.model.image_size,
            num_epochs: metadata.history.len(),
            trained_at: metadata.trained_at.clone(),
        }
    }

    /// 設定情報をログに出す
    pub fn log_info(&self) {
        let names: Vec<&str> = self.class_labels.iter().map(|c| c.name()).collect();
        log::info!("classes: {}", names.join(", "));
        log::info!("model input size: {0}x{0}", self.model_input_size);
        log::info!("epochs trained: {}, trained at {}", self.num_epochs, self.trained_at);
    }
}
