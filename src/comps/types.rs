//! Request, intermediate and response types for the scoring core

use crate::comps::adjust::Adjustments;
use crate::error::{CompError, Result};
use crate::ingestion::parse::NormalizeOptions;
use crate::ingestion::{PropertyRecord, RawRecord, SaleRecord};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_DISTANCE_KM: f64 = 50.0;
pub const DEFAULT_MAX_DAYS_SINCE_SALE: i64 = 730;
pub const DEFAULT_TOP_K: usize = 3;

/// Number of normalized features per (subject, candidate) pair
pub const FEATURE_COUNT: usize = 17;

pub type FeatureVector = [f64; FEATURE_COUNT];

/// A subject plus the parameters of one recommendation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectQuery {
    pub subject: PropertyRecord,
    pub max_distance_km: f64,
    pub max_days_since_sale: i64,
    pub estimated_value: Option<f64>,
    /// Appraisal date; fixes "now" for recency and seasonality
    pub as_of: NaiveDate,
}

impl SubjectQuery {
    pub fn new(subject: PropertyRecord) -> Self {
        SubjectQuery {
            subject,
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            max_days_since_sale: DEFAULT_MAX_DAYS_SINCE_SALE,
            estimated_value: None,
            as_of: Utc::now().date_naive(),
        }
    }

    /// Reject bad parameters before any filtering happens
    pub fn validate(&self) -> Result<()> {
        if !self.max_distance_km.is_finite() || self.max_distance_km <= 0.0 {
            return Err(CompError::Configuration(format!(
                "max_distance_km must be positive, got {}",
                self.max_distance_km
            )));
        }
        if self.max_days_since_sale <= 0 {
            return Err(CompError::Configuration(format!(
                "max_days_since_sale must be positive, got {}",
                self.max_days_since_sale
            )));
        }
        if let Some(value) = self.estimated_value {
            if !value.is_finite() || value <= 0.0 {
                return Err(CompError::Configuration(format!(
                    "estimated_value must be positive, got {}",
                    value
                )));
            }
        }
        if !(self.subject.living_area.is_finite() && self.subject.living_area > 0.0) {
            return Err(CompError::Configuration(
                "subject living area must be positive".to_string(),
            ));
        }
        if !self.subject.location.is_valid() {
            return Err(CompError::Configuration(
                "subject coordinates are out of range".to_string(),
            ));
        }
        Ok(())
    }
}

/// Wire form of a recommendation request: a raw subject record plus
/// optional overrides of the deployment defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubjectRequest {
    pub subject: RawRecord,
    #[serde(default)]
    pub max_distance_km: Option<f64>,
    #[serde(default)]
    pub max_days_since_sale: Option<i64>,
    #[serde(default)]
    pub estimated_value: Option<f64>,
    #[serde(default)]
    pub as_of: Option<NaiveDate>,
}

/// Deployment defaults applied to requests that omit a parameter
#[derive(Debug, Clone)]
pub struct QueryDefaults {
    pub max_distance_km: f64,
    pub max_days_since_sale: i64,
    pub normalize: NormalizeOptions,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        QueryDefaults {
            max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            max_days_since_sale: DEFAULT_MAX_DAYS_SINCE_SALE,
            normalize: NormalizeOptions::default(),
        }
    }
}

impl SubjectRequest {
    /// Normalize the subject and resolve defaults. A subject that cannot be
    /// normalized is the caller's fault, so it surfaces as a Configuration error.
    pub fn into_query(self, defaults: &QueryDefaults) -> Result<SubjectQuery> {
        let subject = crate::ingestion::prepare_subject(&self.subject, &defaults.normalize)
            .map_err(|e| CompError::Configuration(format!("invalid subject: {}", e)))?;

        let query = SubjectQuery {
            subject,
            max_distance_km: self.max_distance_km.unwrap_or(defaults.max_distance_km),
            max_days_since_sale: self
                .max_days_since_sale
                .unwrap_or(defaults.max_days_since_sale),
            estimated_value: self.estimated_value,
            as_of: self.as_of.unwrap_or_else(|| Utc::now().date_naive()),
        };
        query.validate()?;
        Ok(query)
    }
}

/// Which scorer produced a similarity value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerVariant {
    Learned,
    Embedding,
    Fallback,
}

impl std::fmt::Display for ScorerVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScorerVariant::Learned => write!(f, "learned"),
            ScorerVariant::Embedding => write!(f, "embedding"),
            ScorerVariant::Fallback => write!(f, "fallback"),
        }
    }
}

/// Which candidate source served the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariant {
    PrecomputedEmbeddings,
    FullScan,
}

impl std::fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineVariant::PrecomputedEmbeddings => write!(f, "precomputed_embeddings"),
            EngineVariant::FullScan => write!(f, "full_scan"),
        }
    }
}

/// Candidate that survived (or is passing through) the filter stages
#[derive(Debug, Clone, Copy)]
pub struct FilteredCandidate<'a> {
    pub sale: &'a SaleRecord,
    pub distance_km: f64,
    pub days_since_sale: i64,
    /// 100 exact, 75 compatible, 0 incompatible (removed by the compatibility filter)
    pub type_compatibility: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBand {
    pub low: f64,
    pub high: f64,
}

/// Scorer output for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub score: f64,
    pub band: Option<ConfidenceBand>,
}

/// Per-term ranking scores, each 0-100
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankTerms {
    pub similarity: f64,
    pub distance: f64,
    pub recency: f64,
    pub price: f64,
    pub completeness: f64,
}

/// Ephemeral per-request scoring state
#[derive(Debug, Clone)]
pub struct ScoredCandidate<'a> {
    pub candidate: FilteredCandidate<'a>,
    pub features: FeatureVector,
    pub similarity: Similarity,
    pub scorer: ScorerVariant,
    pub terms: RankTerms,
    pub composite: f64,
}

impl ScoredCandidate<'_> {
    pub fn id(&self) -> &str {
        self.candidate.sale.id()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorExplanation {
    pub factor: String,
    pub description: String,
    /// Relative importance, 0-1
    pub weight: f64,
    /// This factor's normalized score, 0-100
    pub contribution: f64,
}

/// One recommended comp, owned so it outlives the request's borrows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedComp {
    pub rank: usize,
    pub sale: SaleRecord,
    pub distance_km: f64,
    pub days_since_sale: i64,
    pub type_compatibility: f64,
    pub similarity_score: f64,
    pub confidence_band: Option<ConfidenceBand>,
    pub composite_score: f64,
    pub scorer: ScorerVariant,
    pub price_per_sqft: Option<f64>,
    pub adjustments: Adjustments,
    /// Sale price plus the total adjustment
    pub adjusted_price: f64,
    pub explanations: Vec<FactorExplanation>,
    pub summary: String,
}

/// Counts and timings that let callers tell "no comps" from "broken engine"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub request_id: Uuid,
    pub as_of: NaiveDate,
    pub total_candidates: usize,
    pub excluded_self: usize,
    pub after_distance: usize,
    pub after_recency: usize,
    pub after_compatibility: usize,
    pub scored: usize,
    pub returned: usize,
    /// Records dropped by the Normalizer for the pool that was searched
    pub dropped_records: usize,
    pub scorer_variant: ScorerVariant,
    /// Candidates scored by the rule-based fallback after the primary scorer failed
    pub fallback_scored: usize,
    pub engine_variant: EngineVariant,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    pub comps: Vec<RankedComp>,
    pub metadata: ResultMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(subject: serde_json::Value) -> SubjectRequest {
        SubjectRequest {
            subject: subject.as_object().cloned().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_into_query_applies_defaults() {
        let query = request(json!({ "address": "1 Main", "gla": 1500, "lat": 44.2, "lon": -76.5 }))
            .into_query(&QueryDefaults::default())
            .unwrap();
        assert_eq!(query.max_distance_km, DEFAULT_MAX_DISTANCE_KM);
        assert_eq!(query.max_days_since_sale, DEFAULT_MAX_DAYS_SINCE_SALE);
        assert_eq!(query.subject.living_area, 1500.0);
    }

    #[test]
    fn test_invalid_parameters_are_configuration_errors() {
        let subject = json!({ "gla": 1500 });

        let mut negative_radius = request(subject.clone());
        negative_radius.max_distance_km = Some(-1.0);
        let err = negative_radius.into_query(&QueryDefaults::default()).unwrap_err();
        assert!(err.is_validation());

        let mut zero_days = request(subject.clone());
        zero_days.max_days_since_sale = Some(0);
        assert!(zero_days
            .into_query(&QueryDefaults::default())
            .unwrap_err()
            .is_validation());

        let mut bad_value = request(subject);
        bad_value.estimated_value = Some(0.0);
        assert!(bad_value
            .into_query(&QueryDefaults::default())
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_subject_without_living_area_is_rejected() {
        let err = request(json!({ "address": "1 Main" }))
            .into_query(&QueryDefaults::default())
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_request_deserializes_with_missing_options() {
        let parsed: SubjectRequest =
            serde_json::from_value(json!({ "subject": { "gla": 1200 }, "as_of": "2024-06-01" }))
                .unwrap();
        assert_eq!(parsed.as_of, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert!(parsed.max_distance_km.is_none());
    }
}
