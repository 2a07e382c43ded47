//! 推論結果と正解ラベルの突き合わせ

use serde::Serialize;

use crate::ground_truth::GroundTruth;
use crate::types::{Prediction, ShapeClass};

/// 正解ラベルが無いサンプルの表示名
pub const UNKNOWN_LABEL: &str = "unknown";

/// ファイル単位の推論結果
#[derive(Debug, Clone)]
pub struct FilePrediction {
    pub filename: String,
    pub prediction: Prediction,
}

/// レポート1行分の結果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRecord {
    pub filename: String,
    pub predicted: ShapeClass,
    /// 正解クラス名（未登録は"unknown"）
    pub expected: String,
    pub confidence: f32,
    pub correct: bool,
}

impl PredictionRecord {
    pub fn is_unlabeled(&self) -> bool {
        self.expected == UNKNOWN_LABEL
    }
}

/// 集計結果
///
/// 正解ラベルの無いサンプルも`total`に含める（正解には数えない）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Score {
    pub total: usize,
    pub correct: usize,
    pub unlabeled: usize,
}

impl Score {
    pub fn from_records(records: &[PredictionRecord]) -> Self {
        Self {
            total: records.len(),
            correct: records.iter().filter(|r| r.correct).count(),
            unlabeled: records.iter().filter(|r| r.is_unlabeled()).count(),
        }
    }

    pub fn incorrect(&self) -> usize {
        self.total - self.correct
    }

    /// 正解率（0.0〜1.0）。評価対象が0件なら0.0
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

/// 推論結果をファイル名で正解ラベルに結合し、集計する
pub fn score(predictions: &[FilePrediction], truth: &GroundTruth) -> (Vec<PredictionRecord>, Score) {
    let records: Vec<PredictionRecord> = predictions
        .iter()
        .map(|item| {
            let expected = truth.label_for(&item.filename);
            if expected.is_none() {
                log::debug!("no ground truth entry for {}", item.filename);
            }
            let correct = expected == Some(item.prediction.class.name());
            PredictionRecord {
                filename: item.filename.clone(),
                predicted: item.prediction.class,
                expected: expected.unwrap_or(UNKNOWN_LABEL).to_string(),
                confidence: item.prediction.confidence,
                correct,
            }
        })
        .collect();

    let score = Score::from_records(&records);
    (records, score)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predicted(filename: &str, class: ShapeClass) -> FilePrediction {
        let mut probabilities = vec![0.1; ShapeClass::COUNT];
        probabilities[class.index()] = 0.8;
        FilePrediction {
            filename: filename.to_string(),
            prediction: Prediction::from_probabilities(probabilities).unwrap(),
        }
    }

    #[test]
    fn test_half_correct() {
        let truth =
            GroundTruth::from_json_str(r#"{"circle": ["a.png"], "square": ["b.png"]}"#).unwrap();
        let predictions = vec![
            predicted("a.png", ShapeClass::Circle),
            predicted("b.png", ShapeClass::Triangle),
        ];

        let (records, score) = score(&predictions, &truth);

        assert_eq!(score.total, 2);
        assert_eq!(score.correct, 1);
        assert_eq!(score.incorrect(), 1);
        assert!((score.accuracy() - 0.5).abs() < 1e-12);

        let b = records.iter().find(|r| r.filename == "b.png").unwrap();
        assert!(!b.correct);
        assert_eq!(b.expected, "square");
        assert_eq!(b.predicted, ShapeClass::Triangle);
    }

    #[test]
    fn test_unlabeled_samples_count_in_total() {
        let truth = GroundTruth::from_json_str(r#"{"circle": ["a.png"]}"#).unwrap();
        let predictions = vec![
            predicted("a.png", ShapeClass::Circle),
            predicted("stray.png", ShapeClass::Circle),
        ];

        let (records, score) = score(&predictions, &truth);

        assert_eq!(score.total, 2);
        assert_eq!(score.correct, 1);
        assert_eq!(score.unlabeled, 1);
        assert!((score.accuracy() - 0.5).abs() < 1e-12);

        let stray = records.iter().find(|r| r.filename == "stray.png").unwrap();
        assert_eq!(stray.expected, UNKNOWN_LABEL);
        assert!(!stray.correct);
    }

    #[test]
    fn test_out_of_vocabulary_label_never_matches() {
        let truth = GroundTruth::from_json_str(r#"{"hexagon": ["h.png"]}"#).unwrap();
        let (records, score) = score(&[predicted("h.png", ShapeClass::Square)], &truth);

        assert_eq!(score.correct, 0);
        assert_eq!(records[0].expected, "hexagon");
        assert!(!records[0].is_unlabeled());
    }

    #[test]
    fn test_empty_evaluation_has_zero_accuracy() {
        let (records, score) = score(&[], &GroundTruth::default());
        assert!(records.is_empty());
        assert_eq!(score.total, 0);
        assert_eq!(score.accuracy(), 0.0);
    }
}
