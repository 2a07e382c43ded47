//! 図形分類モデルの学習
//!
//! 使い方: `train [--data-dir data] [--output shape_model.tar.gz] [--epochs 10] ...`

use anyhow::Result;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};

use shape_classifier::ml::{train_model, InferenceEngine, TrainingConfig};
use shape_classifier::model::{log_metadata_info, load_metadata, AppConfig, DeviceType};

/// プレビューで分類する評価画像の枚数
const PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    Cpu,
    Wgpu,
}

impl From<Device> for DeviceType {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => DeviceType::Cpu,
            Device::Wgpu => DeviceType::Wgpu,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Train the circle / square / triangle classifier")]
struct Args {
    /// 設定ファイル（無ければデフォルト設定）
    #[arg(long, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    /// クラス別フォルダ（circle/ square/ triangle/）を含む学習データ
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 学習済みモデルの保存先
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// 学習後のプレビューに使う評価画像フォルダ
    #[arg(long)]
    test_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// 保存済みモデルから学習を再開する
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long, value_enum)]
    device: Option<Device>,
}

impl Args {
    /// コマンドライン引数で設定ファイルの値を上書きする
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.data_dir {
            config.paths.data_dir = dir.clone();
        }
        if let Some(output) = &self.output {
            config.paths.model_path = output.clone();
        }
        if let Some(dir) = &self.test_dir {
            config.paths.test_dir = dir.clone();
        }
        if let Some(epochs) = self.epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.training.learning_rate = learning_rate;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(device) = self.device {
            config.device_type = device.into();
        }
    }
}

fn run<B: AutodiffBackend>(config: &AppConfig, resume: Option<&Path>, device: B::Device) -> Result<()> {
    let training = TrainingConfig::from_settings(&config.training);
    let summary = train_model::<B>(
        &config.paths.data_dir,
        &config.paths.model_path,
        training,
        resume,
        device.clone(),
    )?;

    println!("Training size: {}", summary.train_size);
    println!("Validation size: {}", summary.valid_size);
    for metrics in &summary.history {
        match (metrics.valid_loss, metrics.valid_accuracy) {
            (Some(loss), Some(accuracy)) => println!(
                "epoch {}: loss={:.4}, accuracy={:.4}, val_loss={:.4}, val_accuracy={:.4}",
                metrics.epoch, metrics.train_loss, metrics.train_accuracy, loss, accuracy
            ),
            _ => println!(
                "epoch {}: loss={:.4}, accuracy={:.4}",
                metrics.epoch, metrics.train_loss, metrics.train_accuracy
            ),
        }
    }
    println!("\nmodel saved as '{}'", summary.model_path.display());
    log_metadata_info(&load_metadata(&summary.model_path)?);

    preview::<B::InnerBackend>(&summary.model_path, &config.paths.test_dir, device)
}

/// 保存したモデルで評価画像の先頭数枚を分類して表示する
fn preview<B: burn::tensor::backend::Backend>(model_path: &Path, test_dir: &Path, device: B::Device) -> Result<()> {
    if !test_dir.is_dir() {
        log::info!("no test directory at {}, skipping preview", test_dir.display());
        return Ok(());
    }

    let engine = InferenceEngine::<B>::load(model_path, device)?;
    let predictions = engine.classify_directory(test_dir, Some(PREVIEW_LIMIT))?;

    println!("\ntesting on test images:");
    for item in predictions {
        println!(
            "{}: {} ({:.2})",
            item.filename, item.prediction.class, item.prediction.confidence
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    shape_classifier::init_logging();
    let args = Args::parse();

    let mut config = AppConfig::load_or_default_from(&args.config);
    args.apply(&mut config);
    config.log_summary();

    let resume = args.resume.as_deref();
    match config.device_type {
        DeviceType::Cpu => run::<Autodiff<NdArray>>(&config, resume, NdArrayDevice::Cpu),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            run::<Autodiff<Wgpu>>(&config, resume, WgpuDevice::default())
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            log::warn!("built without the `wgpu` feature, falling back to CPU");
            run::<Autodiff<NdArray>>(&config, resume, NdArrayDevice::Cpu)
        }
    }
}
