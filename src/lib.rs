//! 図形画像（circle / square / triangle）の分類器
//!
//! - `types` / `ground_truth` / `scoring` / `report` / `preflight`: 評価まわり
//! - `model`: 設定ファイルとモデルファイルの永続化
//! - `ml`: データ読み込み・CNN・学習・推論（`ml` feature）

pub mod types;
pub mod ground_truth;
pub mod scoring;
pub mod report;
pub mod preflight;
pub mod model;
#[cfg(feature = "ml")]
pub mod ml;

pub use types::{Prediction, ShapeClass};

/// ロガー初期化
///
/// `RUST_LOG`があればそれに従い、無ければinfoレベルで出力する。
pub fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => {
            builder.parse_filters(&filters);
        }
        Err(_) => {
            builder.filter_level(log::LevelFilter::Info);
        }
    }
    // テストなどで二重に初期化されても無視する
    let _ = builder.try_init();
}
