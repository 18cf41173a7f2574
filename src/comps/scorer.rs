//! Similarity scorers - map a candidate to a 0-100 similarity score
//!
//! Three strategies share [`SimilarityScorer`]: a fixed-weight rule-based
//! scorer (also the fallback), a learned logistic ensemble loaded from a
//! JSON artifact, and the embedding scorer in `embedding.rs`.

use crate::comps::features::{EPSILON, FEATURE_NAMES};
use crate::comps::types::{
    ConfidenceBand, FeatureVector, FilteredCandidate, ScorerVariant, Similarity, SubjectQuery,
    FEATURE_COUNT,
};
use crate::error::{CompError, Result};
use crate::ingestion::write::read_json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Rule-based feature weights, in feature order; they sum to 1.0
pub const RULE_WEIGHTS: FeatureVector = [
    0.20, // living area
    0.05, // lot size
    0.08, // bedrooms
    0.07, // bathrooms
    0.06, // age
    0.14, // proximity
    0.05, // neighborhood
    0.03, // market area
    0.08, // property type
    0.04, // structure type
    0.04, // condition
    0.02, // price
    0.06, // recency
    0.01, // season
    0.02, // feature tags
    0.03, // quality
    0.02, // type compatibility
];

pub const DEFAULT_BLEND: f64 = 0.7;
pub const DEFAULT_CONFIDENCE_BAND: f64 = 5.0;

/// Score a candidate for similarity to the subject.
///
/// Implementations must be thread-safe so one scorer serves every request,
/// and must return finite values in `0.0..=100.0` (see [`sanitise`]).
pub trait SimilarityScorer: Send + Sync {
    fn variant(&self) -> ScorerVariant;

    fn score(
        &self,
        query: &SubjectQuery,
        candidate: &FilteredCandidate<'_>,
        features: &FeatureVector,
    ) -> Result<Similarity>;

    /// Score a whole pool; the default scores one candidate at a time
    fn score_batch(
        &self,
        query: &SubjectQuery,
        candidates: &[FilteredCandidate<'_>],
        features: &[FeatureVector],
    ) -> Vec<Result<Similarity>> {
        candidates
            .iter()
            .zip(features)
            .map(|(candidate, features)| self.score(query, candidate, features))
            .collect()
    }
}

/// Clamp a raw score to 0-100; non-finite values become 0
pub fn sanitise(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    score.clamp(0.0, 100.0)
}

/// Weighted sum of the normalized features with fixed weights
#[derive(Debug, Clone)]
pub struct RuleBasedScorer {
    weights: FeatureVector,
}

impl Default for RuleBasedScorer {
    fn default() -> Self {
        RuleBasedScorer {
            weights: RULE_WEIGHTS,
        }
    }
}

impl RuleBasedScorer {
    pub fn weights(&self) -> &FeatureVector {
        &self.weights
    }

    pub fn score_features(&self, features: &FeatureVector) -> f64 {
        let total: f64 = self.weights.iter().sum();
        if total < EPSILON {
            return 0.0;
        }
        let weighted: f64 = self
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, f)| w * f)
            .sum();
        sanitise(100.0 * weighted / total)
    }
}

impl SimilarityScorer for RuleBasedScorer {
    fn variant(&self) -> ScorerVariant {
        ScorerVariant::Fallback
    }

    fn score(
        &self,
        _query: &SubjectQuery,
        _candidate: &FilteredCandidate<'_>,
        features: &FeatureVector,
    ) -> Result<Similarity> {
        Ok(Similarity {
            score: self.score_features(features),
            band: None,
        })
    }
}

/// Logistic regression over the feature vector
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    /// Probability that the candidate would be selected as a comp
    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        if features.len() != self.weights.len() {
            return Err(CompError::ModelUnavailable(format!(
                "expected {} features, got {}",
                self.weights.len(),
                features.len()
            )));
        }

        let logit: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, f)| w * f)
            .sum::<f64>()
            + self.bias;

        let probability = 1.0 / (1.0 + (-logit).exp());
        if !probability.is_finite() {
            return Err(CompError::ModelUnavailable(
                "model produced a non-finite probability".to_string(),
            ));
        }
        Ok(probability)
    }
}

/// One knot of the monotonic calibration curve
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    pub raw: f64,
    pub calibrated: f64,
}

fn default_blend() -> f64 {
    DEFAULT_BLEND
}

fn default_band() -> f64 {
    DEFAULT_CONFIDENCE_BAND
}

/// Serialized learned-scorer weights
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelArtifact {
    /// Feature order the weights were fitted against
    pub feature_names: Vec<String>,
    pub primary: LogisticModel,
    #[serde(default)]
    pub secondary: Option<LogisticModel>,
    /// Primary model's share of the ensemble
    #[serde(default = "default_blend")]
    pub blend: f64,
    /// Piecewise-linear probability remapping; empty means identity
    #[serde(default)]
    pub calibration: Vec<CalibrationPoint>,
    /// Half-width of the reported confidence band, in score points
    #[serde(default = "default_band")]
    pub confidence_band: f64,
}

impl ModelArtifact {
    /// Load and validate an artifact; any failure is ModelUnavailable
    pub fn load(path: &Path) -> Result<Self> {
        let artifact: ModelArtifact = read_json(path).map_err(|e| {
            CompError::ModelUnavailable(format!("cannot read {}: {}", path.display(), e))
        })?;
        artifact.validate()?;
        info!(
            "✓ Loaded similarity model from {:?} (ensemble: {}, calibration knots: {})",
            path,
            artifact.secondary.is_some(),
            artifact.calibration.len()
        );
        Ok(artifact)
    }

    pub fn validate(&self) -> Result<()> {
        let expected: Vec<&str> = FEATURE_NAMES.to_vec();
        let actual: Vec<&str> = self.feature_names.iter().map(String::as_str).collect();
        if actual != expected {
            return Err(CompError::ModelUnavailable(
                "model feature names do not match the feature extractor".to_string(),
            ));
        }

        for model in std::iter::once(&self.primary).chain(self.secondary.as_ref()) {
            if model.weights.len() != FEATURE_COUNT {
                return Err(CompError::ModelUnavailable(format!(
                    "model has {} weights, expected {}",
                    model.weights.len(),
                    FEATURE_COUNT
                )));
            }
            if !model.bias.is_finite() || model.weights.iter().any(|w| !w.is_finite()) {
                return Err(CompError::ModelUnavailable(
                    "model weights must be finite".to_string(),
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.blend) {
            return Err(CompError::ModelUnavailable(format!(
                "blend must be within [0, 1], got {}",
                self.blend
            )));
        }
        if !self.confidence_band.is_finite() || self.confidence_band < 0.0 {
            return Err(CompError::ModelUnavailable(
                "confidence band must be non-negative".to_string(),
            ));
        }

        let unit = 0.0..=1.0;
        let in_range = self
            .calibration
            .iter()
            .all(|p| unit.contains(&p.raw) && unit.contains(&p.calibrated));
        let monotonic = self
            .calibration
            .windows(2)
            .all(|pair| pair[0].raw < pair[1].raw && pair[0].calibrated <= pair[1].calibrated);
        if !in_range || !monotonic {
            return Err(CompError::ModelUnavailable(
                "calibration curve must be increasing within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }

    /// Remap a probability through the calibration knots, anchored at (0,0) and (1,1)
    pub fn calibrate(&self, probability: f64) -> f64 {
        if self.calibration.is_empty() {
            return probability.clamp(0.0, 1.0);
        }

        let x = probability.clamp(0.0, 1.0);
        let start = CalibrationPoint {
            raw: 0.0,
            calibrated: 0.0,
        };
        let end = CalibrationPoint {
            raw: 1.0,
            calibrated: 1.0,
        };
        let knots: Vec<CalibrationPoint> = std::iter::once(start)
            .chain(self.calibration.iter().copied())
            .chain(std::iter::once(end))
            .collect();

        for pair in knots.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if x <= hi.raw {
                let span = hi.raw - lo.raw;
                if span < EPSILON {
                    return hi.calibrated;
                }
                let t = (x - lo.raw) / span;
                return lo.calibrated + t * (hi.calibrated - lo.calibrated);
            }
        }
        1.0
    }
}

/// Calibrated logistic ensemble
#[derive(Debug, Clone)]
pub struct LearnedScorer {
    artifact: ModelArtifact,
}

impl LearnedScorer {
    pub fn new(artifact: ModelArtifact) -> Result<Self> {
        artifact.validate()?;
        Ok(LearnedScorer { artifact })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(LearnedScorer {
            artifact: ModelArtifact::load(path)?,
        })
    }

    pub fn score_features(&self, features: &[f64]) -> Result<Similarity> {
        let primary = self.artifact.primary.predict(features)?;
        let probability = match &self.artifact.secondary {
            Some(secondary) => {
                let blend = self.artifact.blend;
                blend * primary + (1.0 - blend) * secondary.predict(features)?
            }
            None => primary,
        };

        let score = sanitise(100.0 * self.artifact.calibrate(probability));
        let half_width = self.artifact.confidence_band;
        debug!("Learned probability {:.4} -> score {:.2}", probability, score);

        Ok(Similarity {
            score,
            band: Some(ConfidenceBand {
                low: sanitise(score - half_width),
                high: sanitise(score + half_width),
            }),
        })
    }
}

impl SimilarityScorer for LearnedScorer {
    fn variant(&self) -> ScorerVariant {
        ScorerVariant::Learned
    }

    fn score(
        &self,
        _query: &SubjectQuery,
        _candidate: &FilteredCandidate<'_>,
        features: &FeatureVector,
    ) -> Result<Similarity> {
        self.score_features(features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::write::write_json_atomic;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            feature_names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
            primary: LogisticModel {
                weights: RULE_WEIGHTS.iter().map(|w| w * 12.0).collect(),
                bias: -6.0,
            },
            secondary: None,
            blend: DEFAULT_BLEND,
            calibration: Vec::new(),
            confidence_band: DEFAULT_CONFIDENCE_BAND,
        }
    }

    #[test]
    fn test_rule_weights_sum_to_one() {
        let total: f64 = RULE_WEIGHTS.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rule_based_extremes() {
        let scorer = RuleBasedScorer::default();
        assert!((scorer.score_features(&[1.0; FEATURE_COUNT]) - 100.0).abs() < 1e-9);
        assert_eq!(scorer.score_features(&[0.0; FEATURE_COUNT]), 0.0);
    }

    #[test]
    fn test_sanitise() {
        assert_eq!(sanitise(f64::NAN), 0.0);
        assert_eq!(sanitise(150.0), 100.0);
        assert_eq!(sanitise(-3.0), 0.0);
    }

    #[test]
    fn test_logistic_predict() {
        let model = LogisticModel {
            weights: vec![0.0; 3],
            bias: 0.0,
        };
        assert_eq!(model.predict(&[1.0, 2.0, 3.0]).unwrap(), 0.5);
        assert!(matches!(
            model.predict(&[1.0]),
            Err(CompError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_feature_name_mismatch_is_rejected() {
        let mut bad = artifact();
        bad.feature_names.swap(0, 1);
        assert!(matches!(
            LearnedScorer::new(bad),
            Err(CompError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn test_calibration_is_monotonic() {
        let mut model = artifact();
        model.calibration = vec![
            CalibrationPoint {
                raw: 0.3,
                calibrated: 0.2,
            },
            CalibrationPoint {
                raw: 0.7,
                calibrated: 0.85,
            },
        ];
        model.validate().unwrap();

        assert_eq!(model.calibrate(0.0), 0.0);
        assert!((model.calibrate(0.3) - 0.2).abs() < 1e-12);
        assert!((model.calibrate(0.5) - 0.525).abs() < 1e-12);
        assert_eq!(model.calibrate(1.0), 1.0);

        let mut previous = 0.0;
        for step in 0..=100 {
            let value = model.calibrate(step as f64 / 100.0);
            assert!(value >= previous);
            previous = value;
        }

        model.calibration.reverse();
        assert!(model.validate().is_err());
    }

    #[test]
    fn test_ensemble_blend() {
        let mut model = artifact();
        model.primary = LogisticModel {
            weights: vec![0.0; FEATURE_COUNT],
            bias: 10.0,
        };
        model.secondary = Some(LogisticModel {
            weights: vec![0.0; FEATURE_COUNT],
            bias: -10.0,
        });
        let scorer = LearnedScorer::new(model).unwrap();

        let similarity = scorer.score_features(&[0.5; FEATURE_COUNT]).unwrap();
        assert!((similarity.score - 70.0).abs() < 0.01);
        let band = similarity.band.unwrap();
        assert!((band.high - band.low - 10.0).abs() < 0.02);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(42);
        let rule = RuleBasedScorer::default();

        for _ in 0..200 {
            let mut model = artifact();
            model.primary.weights = (0..FEATURE_COUNT).map(|_| rng.gen_range(-50.0..50.0)).collect();
            model.primary.bias = rng.gen_range(-50.0..50.0);
            let learned = LearnedScorer::new(model).unwrap();

            let mut features = [0.0; FEATURE_COUNT];
            for value in features.iter_mut() {
                *value = rng.gen_range(0.0..=1.0);
            }

            let learned_score = learned.score_features(&features).unwrap();
            assert!((0.0..=100.0).contains(&learned_score.score));
            let band = learned_score.band.unwrap();
            assert!(band.low >= 0.0 && band.high <= 100.0);
            assert!((0.0..=100.0).contains(&rule.score_features(&features)));
        }
    }

    #[test]
    fn test_load_round_trip_and_missing_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("model.json");
        write_json_atomic(&path, &artifact(), 1).unwrap();
        assert!(LearnedScorer::load(&path).is_ok());

        let missing = LearnedScorer::load(&temp.path().join("absent.json"));
        assert!(matches!(missing, Err(CompError::ModelUnavailable(_))));
    }
}
