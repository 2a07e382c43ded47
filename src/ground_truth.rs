//! 評価用の正解ラベル（results.json）の読み込み
//!
//! ファイル形式はクラス名 -> ファイル名一覧のJSONオブジェクト:
//! `{"circle": ["a.png"], "square": ["b.png"]}`
//! 読み込み時にファイル名 -> クラス名へ反転する。

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::types::ShapeClass;

/// ファイル名から正解クラス名を引くマップ
#[derive(Debug, Clone, Default)]
pub struct GroundTruth {
    labels: HashMap<String, String>,
}

impl GroundTruth {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read ground truth file: {}", path.display()))?;
        Self::from_json_str(&content)
            .context(format!("Failed to parse ground truth file: {}", path.display()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        // キー順で走査するため、重複時に採用されるクラスが実行ごとに変わらない
        let by_class: BTreeMap<String, Vec<String>> = serde_json::from_str(json)?;
        Ok(Self::from_class_lists(by_class))
    }

    pub fn from_class_lists(by_class: BTreeMap<String, Vec<String>>) -> Self {
        let mut labels = HashMap::new();

        for (class_name, filenames) in by_class {
            if ShapeClass::from_name(&class_name).is_none() {
                log::warn!("ground truth class '{}' is not part of the vocabulary", class_name);
            }
            for filename in filenames {
                match labels.get(&filename) {
                    Some(existing) => {
                        log::warn!(
                            "'{}' is listed under both '{}' and '{}', keeping '{}'",
                            filename, existing, class_name, existing
                        );
                    }
                    None => {
                        labels.insert(filename, class_name.clone());
                    }
                }
            }
        }

        Self { labels }
    }

    /// 正解クラス名（未登録なら`None`）
    pub fn label_for(&self, filename: &str) -> Option<&str> {
        self.labels.get(filename).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverts_class_lists() {
        let truth = GroundTruth::from_json_str(
            r#"{"circle": ["a.png", "c.png"], "square": ["b.png"]}"#,
        )
        .unwrap();

        assert_eq!(truth.len(), 3);
        assert_eq!(truth.label_for("a.png"), Some("circle"));
        assert_eq!(truth.label_for("c.png"), Some("circle"));
        assert_eq!(truth.label_for("b.png"), Some("square"));
        assert_eq!(truth.label_for("zzz.png"), None);
    }

    #[test]
    fn test_duplicate_filename_keeps_first_class_in_key_order() {
        let truth = GroundTruth::from_json_str(
            r#"{"triangle": ["x.png"], "circle": ["x.png"]}"#,
        )
        .unwrap();

        assert_eq!(truth.label_for("x.png"), Some("circle"));
    }

    #[test]
    fn test_unknown_class_names_are_kept() {
        let truth = GroundTruth::from_json_str(r#"{"hexagon": ["h.png"]}"#).unwrap();
        assert_eq!(truth.label_for("h.png"), Some("hexagon"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(GroundTruth::from_json_str(r#"["a.png"]"#).is_err());
        assert!(GroundTruth::from_json_str("{").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, r#"{"triangle": ["t.png"]}"#).unwrap();

        let truth = GroundTruth::load(&path).unwrap();
        assert_eq!(truth.label_for("t.png"), Some("triangle"));
    }
}
