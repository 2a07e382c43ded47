//! 機械学習モデルの共通定義
//!
//! 図形分類用のCNNモデルと、学習・推論で共有する前処理を提供します。

use anyhow::Result;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor, TensorData},
    train::ClassificationOutput,
};
use image::imageops::FilterType;
use std::path::Path;
use thiserror::Error;

use crate::types::ShapeClass;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 64;

/// 学習・推論で受け付ける画像拡張子
pub const IMAGE_EXTENSION: &str = "png";

/// リサイズ時の補間方法（学習と推論で必ず同じものを使う）
const RESIZE_FILTER: FilterType = FilterType::CatmullRom;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArchitectureError {
    #[error("input size {image_size}x{image_size} is too small for the network (minimum 18x18)")]
    InputTooSmall { image_size: usize },
    #[error("the output layer needs at least one class")]
    NoClasses,
}

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数（出力層の幅）
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 32)]
    pub conv1_channels: usize,
    #[config(default = 64)]
    pub conv2_channels: usize,
    #[config(default = 64)]
    pub conv3_channels: usize,
    /// 全結合隠れ層のユニット数
    #[config(default = 64)]
    pub hidden_size: usize,
}

impl ModelConfig {
    /// クラス語彙から出力幅を決めた設定
    pub fn for_vocabulary() -> Self {
        Self::new(ShapeClass::COUNT)
    }

    /// Conv3後の特徴マップの一辺
    ///
    /// 3x3 Conv (padding無し) で2減少、2x2 Poolで半分（切り捨て）。
    pub fn feature_map_size(&self) -> Option<usize> {
        let after_conv1 = self.image_size.checked_sub(2)?;
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.checked_sub(2)?;
        let after_pool2 = after_conv2 / 2;
        after_pool2.checked_sub(2).filter(|&size| size > 0)
    }

    /// Flatten後の特徴次元
    pub fn flattened_size(&self) -> Option<usize> {
        self.feature_map_size()
            .map(|size| self.conv3_channels * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ShapeClassifier<B>, ArchitectureError> {
        if self.num_classes == 0 {
            return Err(ArchitectureError::NoClasses);
        }
        let feature_map_size = self.feature_map_size().ok_or(ArchitectureError::InputTooSmall {
            image_size: self.image_size,
        })?;
        let d = self.conv3_channels * feature_map_size * feature_map_size;

        log::debug!("[Model] input: 1 x {0}x{0}", self.image_size);
        log::debug!(
            "[Model] conv3 output: {} x {}x{}",
            self.conv3_channels, feature_map_size, feature_map_size
        );
        log::debug!("[Model] FC1: {} -> {}", d, self.hidden_size);
        log::debug!("[Model] FC2: {} -> {}", self.hidden_size, self.num_classes);

        let model = ShapeClassifier {
            conv1: Conv2dConfig::new([1, self.conv1_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([self.conv1_channels, self.conv2_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([self.conv2_channels, self.conv3_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            fc1: LinearConfig::new(d, self.hidden_size).init(device),
            fc2: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
            activation: Relu::new(),
        };

        log::info!("[Model] trainable parameters: {}", model.num_params());
        Ok(model)
    }
}

/// 図形分類用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 + ReLU -> MaxPool 2x2
/// - Conv 3x3 + ReLU -> MaxPool 2x2
/// - Conv 3x3 + ReLU
/// - Flatten
/// - FC: d -> hidden + ReLU
/// - FC: hidden -> num_classes
/// - Softmax (確率が必要な時のみ)
#[derive(Module, Debug)]
pub struct ShapeClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,

    // 全結合層
    fc1: Linear<B>,
    fc2: Linear<B>,

    activation: Relu,
}

impl<B: Backend> ShapeClassifier<B> {
    /// 順伝播
    ///
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    /// - 戻り値: クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失はロジットに対する交差エントロピー（ターゲットは整数ラベル）。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 前処理済みの1枚の画像
///
/// 輝度を[0, 1]に正規化した `size x size` のグレースケール画素（行優先）。
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    size: usize,
    pixels: Vec<f32>,
}

impl Sample {
    pub fn new(size: usize, pixels: Vec<f32>) -> Result<Self> {
        if pixels.len() != size * size {
            anyhow::bail!(
                "pixel buffer has {} values, expected {} for {}x{}",
                pixels.len(),
                size * size,
                size,
                size
            );
        }
        Ok(Self { size, pixels })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }
}

/// 画像をグレースケール化・リサイズ・正規化する
///
/// 学習時と推論時で同じ経路を通すこと。
pub fn preprocess_image(img: &image::DynamicImage, image_size: usize) -> Sample {
    let gray = img.to_luma8();
    let resized = image::imageops::resize(&gray, image_size as u32, image_size as u32, RESIZE_FILTER);
    let pixels = resized
        .into_raw()
        .into_iter()
        .map(|value| value as f32 / u8::MAX as f32)
        .collect();

    Sample {
        size: image_size,
        pixels,
    }
}

/// 画像ファイルを読み込んで前処理する
pub fn load_sample(path: &Path, image_size: usize) -> Result<Sample> {
    let img = image::open(path)?;
    Ok(preprocess_image(&img, image_size))
}

/// 受け付ける拡張子の画像か（大文字小文字は区別しない）
pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(IMAGE_EXTENSION))
            .unwrap_or(false)
}

/// 平坦化した画素列をバッチテンソル [batch_size, 1, size, size] に変換
pub fn pixels_to_tensor<B: Backend>(
    pixels: Vec<f32>,
    batch_size: usize,
    image_size: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let data = TensorData::new(pixels, [batch_size, 1, image_size, image_size])
        .convert::<B::FloatElem>();
    Tensor::from_data(data, device)
}
