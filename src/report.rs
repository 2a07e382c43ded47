//! 評価結果のコンソール出力とCSV書き出し

use anyhow::{Context, Result};
use std::path::Path;

use crate::scoring::{PredictionRecord, Score};

const RULE_WIDTH: usize = 50;

/// 1サンプル分の表示行
///
/// 例: `✓ a.png: predicted=circle, correct=circle, confidence=0.97`
pub fn format_record(record: &PredictionRecord) -> String {
    let status = if record.correct { "✓" } else { "✗" };
    format!(
        "{} {}: predicted={}, correct={}, confidence={:.2}",
        status, record.filename, record.predicted, record.expected, record.confidence
    )
}

/// 集計ブロック
pub fn format_summary(score: &Score) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut lines = vec![
        rule.clone(),
        "Results:".to_string(),
        format!("Total images: {}", score.total),
        format!("Correct predictions: {}", score.correct),
        format!("Wrong predictions: {}", score.incorrect()),
    ];
    if score.unlabeled > 0 {
        lines.push(format!("Unlabeled images: {}", score.unlabeled));
    }
    lines.push(format!("Accuracy: {:.2}%", score.accuracy() * 100.0));
    lines.push(rule);
    lines.join("\n")
}

pub fn print_report(records: &[PredictionRecord], score: &Score) {
    for record in records {
        println!("{}", format_record(record));
    }
    println!();
    println!("{}", format_summary(score));
}

/// 推論結果をCSVに書き出す
pub fn write_csv(path: &Path, records: &[PredictionRecord]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let mut writer = csv::Writer::from_path(path)
        .context(format!("Failed to create CSV file: {}", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;

    log::info!("wrote {} prediction records to {}", records.len(), path.display());
    Ok(())
}
