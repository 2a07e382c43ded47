use serde::{Deserialize, Serialize};

/// 分類対象の図形クラス
///
/// 並び順がそのままクラスIDになる（circle=0, square=1, triangle=2）。
/// モデルの出力幅とレポートのラベル変換はどちらもこの列挙から導出する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeClass {
    Circle,
    Square,
    Triangle,
}

impl ShapeClass {
    /// クラスID順の全クラス
    pub const ALL: [ShapeClass; 3] = [ShapeClass::Circle, ShapeClass::Square, ShapeClass::Triangle];

    /// クラス数
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        match self {
            ShapeClass::Circle => 0,
            ShapeClass::Square => 1,
            ShapeClass::Triangle => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// ディレクトリ名・レポートで使う名前
    pub fn name(self) -> &'static str {
        match self {
            ShapeClass::Circle => "circle",
            ShapeClass::Square => "square",
            ShapeClass::Triangle => "triangle",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|class| class.name() == name)
    }

    /// 語彙の名前一覧（メタデータ保存用）
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|class| class.name().to_string()).collect()
    }
}

impl std::fmt::Display for ShapeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// 最大値のインデックスを返す
///
/// 同値の場合は小さいインデックスを優先する。空スライスは`None`。
pub fn stable_argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &value) in values.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((index, value)),
        }
    }
    best.map(|(index, _)| index)
}

/// 1サンプル分の推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: ShapeClass,
    /// 予測クラスの確率
    pub confidence: f32,
    /// クラスID順の確率
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// クラスID順の確率ベクトルから予測を作る
    pub fn from_probabilities(probabilities: Vec<f32>) -> Option<Self> {
        let index = stable_argmax(&probabilities)?;
        let class = ShapeClass::from_index(index)?;
        Some(Self {
            class,
            confidence: probabilities[index],
            probabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for (i, class) in ShapeClass::ALL.iter().enumerate() {
            assert_eq!(class.index(), i);
            assert_eq!(ShapeClass::from_index(i), Some(*class));
            assert_eq!(ShapeClass::from_name(class.name()), Some(*class));
        }
        assert_eq!(ShapeClass::from_index(3), None);
        assert_eq!(ShapeClass::from_name("hexagon"), None);
    }

    #[test]
    fn test_names_follow_vocabulary_order() {
        assert_eq!(ShapeClass::names(), vec!["circle", "square", "triangle"]);
        assert_eq!(ShapeClass::COUNT, 3);
    }

    #[test]
    fn test_argmax_tie_prefers_lower_index() {
        assert_eq!(stable_argmax(&[0.4, 0.4, 0.2]), Some(0));
        assert_eq!(stable_argmax(&[0.2, 0.4, 0.4]), Some(1));
        assert_eq!(stable_argmax(&[0.1, 0.2, 0.7]), Some(2));
        assert_eq!(stable_argmax(&[]), None);
    }

    #[test]
    fn test_prediction_from_tied_probabilities() {
        let prediction = Prediction::from_probabilities(vec![0.1, 0.45, 0.45]).unwrap();
        assert_eq!(prediction.class, ShapeClass::Square);
        assert!((prediction.confidence - 0.45).abs() < f32::EPSILON);
    }

    #[test]
    fn test_prediction_rejects_out_of_vocabulary_width() {
        assert!(Prediction::from_probabilities(vec![0.0, 0.0, 0.0, 1.0]).is_none());
    }
}
