//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・入出力パス・学習設定をJSON形式で保存・読み込みします。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 入出力パス設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathSettings {
    /// クラス別フォルダを含む学習データのルート
    pub data_dir: PathBuf,
    /// 評価用画像フォルダ
    pub test_dir: PathBuf,
    /// 評価用の正解ラベル
    pub ground_truth: PathBuf,
    /// 学習済みモデルの保存先
    pub model_path: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            test_dir: PathBuf::from("data/test"),
            ground_truth: PathBuf::from("data/test/results.json"),
            model_path: PathBuf::from("shape_model.tar.gz"),
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// トレーニングデータの割合
    pub train_ratio: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 入出力パス
    #[serde(default)]
    pub paths: PathSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 設定を読み込む。存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Self::default();
        }

        match Self::load(path) {
            Ok(config) => {
                log::info!("loaded config from {}", path.display());
                config
            }
            Err(e) => {
                log::warn!("failed to read config {} ({}), using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// 設定情報をログに出す
    pub fn log_summary(&self) {
        log::info!("device: {}", self.device_type);
        log::info!(
            "paths: data={}, test={}, ground truth={}, model={}",
            self.paths.data_dir.display(),
            self.paths.test_dir.display(),
            self.paths.ground_truth.display(),
            self.paths.model_path.display()
        );
        log::info!(
            "training: epochs={}, batch size={}, learning rate={}, seed={}, train ratio={}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed,
            self.training.train_ratio
        );
    }
}
