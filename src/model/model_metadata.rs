//! モデルメタデータの定義
//!
//! モデルファイル（tar.gz）内の metadata.json として保存され、
//! 外部スキーマ無しでアーキテクチャを再構築できる情報を持つ。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{EpochMetrics, ModelConfig, TrainingConfig};
use crate::types::ShapeClass;

/// メタデータ形式のバージョン
pub const FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// クラスID順のクラス名
    /// 例: ["circle", "square", "triangle"]
    pub class_labels: Vec<String>,

    /// アーキテクチャ設定（出力幅・入力サイズ・チャネル数）
    pub model: ModelConfig,

    /// 学習設定（オプティマイザ設定を含む）
    pub training: TrainingConfig,

    /// エポックごとの指標（再開した場合は通算）
    #[serde(default)]
    pub history: Vec<EpochMetrics>,

    /// 学習可能パラメータ数
    pub num_params: usize,

    /// モデルの学習時刻（RFC 3339形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        model: ModelConfig,
        training: TrainingConfig,
        history: Vec<EpochMetrics>,
        num_params: usize,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            class_labels: ShapeClass::names(),
            model,
            training,
            history,
            num_params,
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    /// 保存されたクラス語彙が現在の語彙と一致するか確認する
    pub fn check_vocabulary(&self) -> Result<(), String> {
        if self.format_version != FORMAT_VERSION {
            return Err(format!(
                "unsupported metadata format version {} (expected {})",
                self.format_version, FORMAT_VERSION
            ));
        }
        if self.class_labels != ShapeClass::names() {
            return Err(format!(
                "class vocabulary {:?} does not match {:?}",
                self.class_labels,
                ShapeClass::names()
            ));
        }
        if self.model.num_classes != self.class_labels.len() {
            return Err(format!(
                "output layer width {} does not match {} class labels",
                self.model.num_classes,
                self.class_labels.len()
            ));
        }
        Ok(())
    }

    /// メタデータをJSON文字列に変換
    ///
    /// JSONはNaN・無限大を`null`として書き、読み戻せなくなるため拒否する。
    pub fn to_json_string(&self) -> Result<String> {
        if let Some(metrics) = self.history.iter().find(|m| !m.is_finite()) {
            anyhow::bail!("epoch {} has non-finite metrics, refusing to save", metrics.epoch);
        }
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}
