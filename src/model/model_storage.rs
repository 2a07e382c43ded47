//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス語彙、アーキテクチャ、学習設定、履歴）
//! - model.bin       - モデルの重み（バイナリ）
//! - optimizer.bin   - オプティマイザの状態（学習再開用、任意）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};
use thiserror::Error;

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";
const OPTIMIZER_ENTRY: &str = "optimizer.bin";

#[derive(Error, Debug)]
pub enum ModelStorageError {
    #[error("model not found: {0}")]
    NotFound(PathBuf),
    #[error("corrupt model file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to read model file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ModelStorageError {
    pub fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        ModelStorageError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ModelStorageError::NotFound(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, ModelStorageError::Corrupt { .. })
    }
}

/// 読み込んだモデルファイルの中身
#[derive(Debug)]
pub struct LoadedArtifact {
    pub metadata: ModelMetadata,
    pub model_binary: Vec<u8>,
    pub optimizer_binary: Option<Vec<u8>>,
}

/// 保存時に実際に書き込むファイルパス
///
/// `.gz`で終わっていればそのまま、そうでなければ`.tar.gz`を付ける。
/// 読み込み側は指定されたパスをそのまま使う。
pub fn artifact_path(path: &Path) -> PathBuf {
    if path.extension().and_then(|s| s.to_str()) == Some("gz") {
        path.to_path_buf()
    } else {
        path.with_extension("tar.gz")
    }
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .context(format!("Failed to add {} to tar", name))
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 戻り値は実際に書き込んだパス。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
    optimizer_binary: Option<&[u8]>,
) -> Result<PathBuf> {
    let tar_gz_path = artifact_path(output_path);

    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    // 書けないメタデータで既存ファイルを潰さないよう先に変換する
    let json_str = metadata.to_json_string()?;

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;
    if let Some(optimizer_binary) = optimizer_binary {
        append_entry(&mut tar_builder, OPTIMIZER_ENTRY, optimizer_binary)?;
    }

    // tarの終端を書いた後、gzipストリームも閉じる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    Ok(tar_gz_path)
}

fn open_archive(path: &Path) -> Result<Archive<GzDecoder<File>>, ModelStorageError> {
    if !path.exists() {
        return Err(ModelStorageError::NotFound(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| ModelStorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Archive::new(GzDecoder::new(file)))
}

/// メタデータ・重み・オプティマイザ状態をまとめて読み込む
///
/// パスは拡張子を含めてそのまま使う。
pub fn load_artifact(path: &Path) -> Result<LoadedArtifact, ModelStorageError> {
    let mut archive = open_archive(path)?;
    let corrupt = |reason: String| ModelStorageError::corrupt(path, reason);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;
    let mut optimizer_binary_opt: Option<Vec<u8>> = None;

    let entries = archive
        .entries()
        .map_err(|e| corrupt(format!("not a tar.gz archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(format!("unreadable archive entry: {}", e)))?;
        let name = entry
            .path()
            .map_err(|e| corrupt(format!("invalid entry name: {}", e)))?
            .to_string_lossy()
            .to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry
                    .read_to_string(&mut json_str)
                    .map_err(|e| corrupt(format!("unreadable {}: {}", METADATA_ENTRY, e)))?;
                let metadata = ModelMetadata::from_json_string(&json_str)
                    .map_err(|e| corrupt(format!("{:#}", e)))?;
                metadata_opt = Some(metadata);
            }
            MODEL_ENTRY | OPTIMIZER_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| corrupt(format!("unreadable {}: {}", name, e)))?;
                if name == MODEL_ENTRY {
                    model_binary_opt = Some(buffer);
                } else {
                    optimizer_binary_opt = Some(buffer);
                }
            }
            _ => log::debug!("ignoring unexpected archive entry {}", name),
        }
    }

    let metadata = metadata_opt
        .ok_or_else(|| corrupt(format!("{} not found in tar.gz archive", METADATA_ENTRY)))?;
    let model_binary = model_binary_opt
        .ok_or_else(|| corrupt(format!("{} not found in tar.gz archive", MODEL_ENTRY)))?;
    metadata.check_vocabulary().map_err(corrupt)?;

    Ok(LoadedArtifact {
        metadata,
        model_binary,
        optimizer_binary: optimizer_binary_opt,
    })
}

/// Tar.gzからモデルメタデータだけを読み込む
pub fn load_metadata(path: &Path) -> Result<ModelMetadata, ModelStorageError> {
    load_artifact(path).map(|artifact| artifact.metadata)
}

/// メタデータをログに出す
pub fn log_metadata_info(metadata: &ModelMetadata) {
    log::info!("=== model metadata ===");
    log::info!("classes: {}", metadata.class_labels.join(", "));
    log::info!("input size: {0}x{0}", metadata.model.image_size);
    log::info!("parameters: {}", metadata.num_params);
    log::info!("epochs trained: {}", metadata.history.len());
    if let Some(last) = metadata.history.last() {
        log::info!(
            "last epoch: loss {:.4}, accuracy {:.4}",
            last.train_loss, last.train_accuracy
        );
    }
    log::info!("trained at: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{ModelConfig, TrainingConfig};
    use burn::optim::AdamConfig;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn metadata() -> ModelMetadata {
        ModelMetadata::new(
            ModelConfig::for_vocabulary(),
            TrainingConfig::new(AdamConfig::new()),
            Vec::new(),
            42,
        )
    }

    #[test]
    fn test_artifact_path_extension() {
        assert_eq!(artifact_path(Path::new("m.tar.gz")), PathBuf::from("m.tar.gz"));
        assert_eq!(artifact_path(Path::new("dir/model")), PathBuf::from("dir/model.tar.gz"));
        assert_eq!(artifact_path(Path::new("model.h5")), PathBuf::from("model.tar.gz"));
    }

    #[test]
    fn test_save_and_load_entries() {
        let dir = tempfile::tempdir().unwrap();
        let saved = save_model_with_metadata(
            &dir.path().join("nested").join("model"),
            &metadata(),
            &[1, 2, 3],
            Some(&[9, 8]),
        )
        .unwrap();
        assert_eq!(saved, dir.path().join("nested").join("model.tar.gz"));

        let artifact = load_artifact(&saved).unwrap();
        assert_eq!(artifact.model_binary, vec![1, 2, 3]);
        assert_eq!(artifact.optimizer_binary, Some(vec![9, 8]));
        assert_eq!(artifact.metadata.num_params, 42);
    }

    #[test]
    fn test_optimizer_state_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[7], None).unwrap();

        let artifact = load_artifact(&path).unwrap();
        assert!(artifact.optimizer_binary.is_none());
        assert_eq!(load_metadata(&path).unwrap().class_labels, metadata().class_labels);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_artifact(&dir.path().join("nothing.tar.gz")).unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_corrupt());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"this is not gzip").unwrap();

        let err = load_artifact(&path).unwrap_err();
        assert!(err.is_corrupt(), "unexpected error: {}", err);
    }

    #[test]
    fn test_existing_file_is_read_as_named() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shape_model.h5");
        std::fs::write(&path, b"garbage").unwrap();

        let err = load_artifact(&path).unwrap_err();
        assert!(err.is_corrupt(), "unexpected error: {}", err);
        match err {
            ModelStorageError::Corrupt { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {}", other),
        }

        // 保存時に付く拡張子は読み込み時には補わない
        let saved = save_model_with_metadata(&dir.path().join("model"), &metadata(), &[1], None).unwrap();
        assert!(saved.is_file());
        assert!(load_artifact(&dir.path().join("model")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_non_finite_history_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        save_model_with_metadata(&path, &metadata(), &[1], None).unwrap();

        let mut diverged = metadata();
        diverged.history.push(crate::ml::EpochMetrics {
            epoch: 1,
            train_loss: f32::NAN,
            train_accuracy: 0.0,
            valid_loss: Some(f32::INFINITY),
            valid_accuracy: Some(0.0),
        });
        assert!(save_model_with_metadata(&path, &diverged, &[2], None).is_err());

        // 以前のファイルは読めるまま残る
        let artifact = load_artifact(&path).unwrap();
        assert_eq!(artifact.model_binary, vec![1]);
        assert!(artifact.metadata.history.is_empty());
    }

    #[test]
    fn test_missing_weights_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");

        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        let json = metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = load_artifact(&path).unwrap_err();
        assert!(err.is_corrupt());
        assert!(err.to_string().contains(MODEL_ENTRY));
    }

    #[test]
    fn test_invalid_metadata_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");

        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let mut builder = Builder::new(encoder);
        append_entry(&mut builder, METADATA_ENTRY, b"{\"format_version\": 1}").unwrap();
        append_entry(&mut builder, MODEL_ENTRY, &[0]).unwrap();
        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        encoder.finish().unwrap();

        assert!(load_artifact(&path).unwrap_err().is_corrupt());
    }
}
