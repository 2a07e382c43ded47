//! 学習済みモデルを評価画像と正解ラベルで採点する
//!
//! 使い方: `evaluate [--model shape_model.tar.gz] [--test-dir data/test] [--csv out.csv]`

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use shape_classifier::ground_truth::GroundTruth;
use shape_classifier::ml::InferenceEngine;
use shape_classifier::model::{AppConfig, DeviceType};
use shape_classifier::preflight::check_evaluation_inputs;
use shape_classifier::report::{print_report, write_csv};
use shape_classifier::scoring::score;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Device {
    Cpu,
    Wgpu,
}

#[derive(Parser, Debug)]
#[command(about = "Score the shape classifier against labelled test images")]
struct Args {
    /// 設定ファイル（無ければデフォルト設定）
    #[arg(long, default_value_os_t = AppConfig::default_path())]
    config: PathBuf,

    #[arg(long, short)]
    model: Option<PathBuf>,

    /// 評価画像フォルダ
    #[arg(long)]
    test_dir: Option<PathBuf>,

    /// 正解ラベル（クラス名 → ファイル名リストのJSON）
    #[arg(long)]
    ground_truth: Option<PathBuf>,

    /// 予測結果をCSVに書き出す
    #[arg(long)]
    csv: Option<PathBuf>,

    #[arg(long, value_enum)]
    device: Option<Device>,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(model) = &self.model {
            config.paths.model_path = model.clone();
        }
        if let Some(dir) = &self.test_dir {
            config.paths.test_dir = dir.clone();
        }
        if let Some(path) = &self.ground_truth {
            config.paths.ground_truth = path.clone();
        }
        match self.device {
            Some(Device::Cpu) => config.device_type = DeviceType::Cpu,
            Some(Device::Wgpu) => config.device_type = DeviceType::Wgpu,
            None => {}
        }
    }
}

fn evaluate<B: Backend>(config: &AppConfig, model_path: &Path, csv: Option<&Path>, device: B::Device) -> Result<()> {
    println!("Loading model from {}...", model_path.display());
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    engine.config().log_info();

    println!("Loading correct labels from {}...", config.paths.ground_truth.display());
    let truth = GroundTruth::load(&config.paths.ground_truth)?;
    log::info!("{} labelled files", truth.len());

    let predictions = engine.classify_directory(&config.paths.test_dir, None)?;
    println!("\nTesting {} images...\n", predictions.len());

    let (records, summary) = score(&predictions, &truth);
    print_report(&records, &summary);

    if let Some(csv) = csv {
        write_csv(csv, &records).context(format!("Failed to write {}", csv.display()))?;
        log::info!("predictions written to {}", csv.display());
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    shape_classifier::init_logging();
    let args = Args::parse();

    let mut config = AppConfig::load_or_default_from(&args.config);
    args.apply(&mut config);

    let model_path = config.paths.model_path.clone();
    if let Err(e) = check_evaluation_inputs(&model_path, &config.paths.test_dir, &config.paths.ground_truth) {
        eprintln!("Error: {}", e);
        return Ok(ExitCode::FAILURE);
    }

    let csv = args.csv.as_deref();
    match config.device_type {
        DeviceType::Cpu => evaluate::<NdArray>(&config, &model_path, csv, NdArrayDevice::Cpu)?,
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn::backend::wgpu::{Wgpu, WgpuDevice};
            evaluate::<Wgpu>(&config, &model_path, csv, WgpuDevice::default())?
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            log::warn!("built without the `wgpu` feature, falling back to CPU");
            evaluate::<NdArray>(&config, &model_path, csv, NdArrayDevice::Cpu)?
        }
    }
    Ok(ExitCode::SUCCESS)
}
