//! 評価前の入力チェック
//!
//! モデル・評価フォルダ・正解ラベルのいずれかが欠けている場合は、
//! 推論に入る前に分かりやすいメッセージで止める。

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreflightError {
    #[error("Model file '{0}' not found! Please train the model first by running `train`")]
    ModelMissing(PathBuf),
    #[error("Test directory '{0}' not found!")]
    TestDirMissing(PathBuf),
    #[error("Results file '{0}' not found!")]
    GroundTruthMissing(PathBuf),
}

/// 評価に必要なファイルが揃っているか確認する（モデル → 評価フォルダ → 正解ラベルの順）
pub fn check_evaluation_inputs(
    model_path: &Path,
    test_dir: &Path,
    ground_truth: &Path,
) -> Result<(), PreflightError> {
    if !model_path.is_file() {
        return Err(PreflightError::ModelMissing(model_path.to_path_buf()));
    }
    if !test_dir.is_dir() {
        return Err(PreflightError::TestDirMissing(test_dir.to_path_buf()));
    }
    if !ground_truth.is_file() {
        return Err(PreflightError::GroundTruthMissing(ground_truth.to_path_buf()));
    }
    Ok(())
}
