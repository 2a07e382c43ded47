//! 学習データセットの読み込みと分割

use anyhow::{Context, Result};
use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use rand::{seq::SliceRandom, SeedableRng};
use std::path::{Path, PathBuf};

use crate::ml::ml_model::{is_image_file, load_sample, pixels_to_tensor, Sample};
use crate::types::ShapeClass;

/// 読み込みをスキップしたファイル
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// 1ファイルの読み込み結果
#[derive(Debug)]
pub enum LoadOutcome {
    Decoded(Sample),
    Skipped(SkippedFile),
}

impl LoadOutcome {
    pub fn from_path(path: &Path, image_size: usize) -> Self {
        match load_sample(path, image_size) {
            Ok(sample) => LoadOutcome::Decoded(sample),
            Err(e) => LoadOutcome::Skipped(SkippedFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

/// 読み込み結果の集計
#[derive(Debug, Clone, Default)]
pub struct LoadSummary {
    /// クラスID順の読み込み枚数
    pub decoded_per_class: [usize; ShapeClass::COUNT],
    /// クラスフォルダが存在しなかったクラス
    pub missing_classes: Vec<ShapeClass>,
    pub skipped: Vec<SkippedFile>,
}

impl LoadSummary {
    pub fn decoded(&self) -> usize {
        self.decoded_per_class.iter().sum()
    }

    pub fn log(&self) {
        for class in ShapeClass::ALL {
            log::info!("  class '{}': {} images", class, self.decoded_per_class[class.index()]);
        }
        for class in &self.missing_classes {
            log::warn!("class directory '{}' not found, it contributes no samples", class);
        }
        if !self.skipped.is_empty() {
            log::warn!("{} file(s) could not be loaded and were skipped", self.skipped.len());
        }
    }
}

/// 学習データの1件
#[derive(Debug, Clone)]
pub struct LabeledSample {
    pub path: PathBuf,
    pub sample: Sample,
    pub label: ShapeClass,
}

/// 図形画像のデータセット
///
/// クラスID順、同一クラス内はファイル名順に並ぶ。
#[derive(Debug, Clone, Default)]
pub struct ShapeDataset {
    items: Vec<LabeledSample>,
    image_size: usize,
}

impl ShapeDataset {
    pub fn new(items: Vec<LabeledSample>, image_size: usize) -> Self {
        Self { items, image_size }
    }

    /// `data_dir/<クラス名>/*.png` を読み込む
    ///
    /// クラスフォルダが無い場合はそのクラスを0件として続行し、
    /// 読めない画像はスキップして集計に記録する。
    pub fn from_directory(data_dir: &Path, image_size: usize) -> Result<(Self, LoadSummary)> {
        let mut items = Vec::new();
        let mut summary = LoadSummary::default();

        for class in ShapeClass::ALL {
            let class_dir = data_dir.join(class.name());
            if !class_dir.is_dir() {
                summary.missing_classes.push(class);
                continue;
            }

            log::info!("loading {} images...", class);
            let entries = std::fs::read_dir(&class_dir)
                .context(format!("Failed to list class directory: {}", class_dir.display()))?;

            let mut paths = Vec::new();
            for entry in entries {
                let path = entry?.path();
                if is_image_file(&path) {
                    paths.push(path);
                }
            }
            // 分割結果がファイルシステムに依存しないよう名前順にする
            paths.sort();

            for path in paths {
                match LoadOutcome::from_path(&path, image_size) {
                    LoadOutcome::Decoded(sample) => {
                        summary.decoded_per_class[class.index()] += 1;
                        items.push(LabeledSample { path, sample, label: class });
                    }
                    LoadOutcome::Skipped(skipped) => {
                        log::warn!("error loading {}: {}", skipped.path.display(), skipped.reason);
                        summary.skipped.push(skipped);
                    }
                }
            }
        }

        log::info!("loaded {} images from {}", items.len(), data_dir.display());
        Ok((Self { items, image_size }, summary))
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn items(&self) -> &[LabeledSample] {
        &self.items
    }

    /// 指定クラスの件数
    pub fn count_of(&self, class: ShapeClass) -> usize {
        self.items.iter().filter(|item| item.label == class).count()
    }

    /// データセットを学習用と検証用に分割
    ///
    /// シード固定でシャッフルし、先頭 `floor(n * train_ratio)` 件を学習用にする。
    /// クラスごとの層化は行わない。
    pub fn split(self, train_ratio: f64, seed: u64) -> Result<(Self, Self)> {
        if !(train_ratio > 0.0 && train_ratio <= 1.0) {
            anyhow::bail!("train ratio must be in (0, 1], got {}", train_ratio);
        }

        let total_len = self.items.len();
        let mut indices: Vec<usize> = (0..total_len).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        // 30 * 0.8 などが浮動小数誤差で23.999...にならないよう僅かに補正
        let train_len = ((total_len as f64 * train_ratio) + 1e-9).floor() as usize;
        let train_len = train_len.min(total_len);

        let mut slots: Vec<Option<LabeledSample>> = self.items.into_iter().map(Some).collect();
        let mut shuffled = Vec::with_capacity(total_len);
        for idx in indices {
            if let Some(item) = slots[idx].take() {
                shuffled.push(item);
            }
        }

        let valid_items = shuffled.split_off(train_len);
        let train = Self { items: shuffled, image_size: self.image_size };
        let valid = Self { items: valid_items, image_size: self.image_size };
        Ok((train, valid))
    }
}

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct ShapeItem {
    pub pixels: Vec<f32>,
    pub label: usize,
}

impl Dataset<ShapeItem> for ShapeDataset {
    fn get(&self, index: usize) -> Option<ShapeItem> {
        let item = self.items.get(index)?;
        Some(ShapeItem {
            pixels: item.sample.pixels().to_vec(),
            label: item.label.index(),
        })
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// バッチャー
#[derive(Clone)]
pub struct ShapeBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> ShapeBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<B, ShapeItem, ShapeBatch<B>> for ShapeBatcher<B> {
    fn batch(&self, items: Vec<ShapeItem>, _device: &B::Device) -> ShapeBatch<B> {
        let batch_size = items.len();
        let mut all_pixels = Vec::with_capacity(batch_size * self.image_size * self.image_size);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            labels.push(item.label);
        }

        let images = pixels_to_tensor::<B>(all_pixels, batch_size, self.image_size, &self.device);
        let targets_data = TensorData::new(
            labels.iter().map(|&label| label as i64).collect::<Vec<_>>(),
            [batch_size],
        )
        .convert::<B::IntElem>();
        let targets = Tensor::<B, 1, Int>::from_data(targets_data, &self.device);

        ShapeBatch { images, targets, labels }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ShapeBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
    /// 正解率の計算用（CPU側のラベル）
    pub labels: Vec<usize>,
}
