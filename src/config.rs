//! Environment-driven configuration shared by the binaries

use crate::comps::adjust::AdjustmentRates;
use crate::comps::rank::RankWeights;
use crate::comps::types::{
    QueryDefaults, DEFAULT_MAX_DAYS_SINCE_SALE, DEFAULT_MAX_DISTANCE_KM, DEFAULT_TOP_K,
};
use crate::ingestion::parse::NormalizeOptions;
use crate::ingestion::utils::DEFAULT_REGION_ANCHOR;
use crate::ingestion::GeoPoint;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Which scorer the engine should try to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScorerChoice {
    /// Embeddings if present, else the learned model, else rule-based
    Auto,
    Learned,
    Embedding,
    Rule,
}

impl FromStr for ScorerChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ScorerChoice::Auto),
            "learned" | "model" => Ok(ScorerChoice::Learned),
            "embedding" | "embeddings" => Ok(ScorerChoice::Embedding),
            "rule" | "rules" | "rule_based" | "fallback" => Ok(ScorerChoice::Rule),
            other => bail!("unknown scorer '{}'", other),
        }
    }
}

impl std::fmt::Display for ScorerChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScorerChoice::Auto => write!(f, "auto"),
            ScorerChoice::Learned => write!(f, "learned"),
            ScorerChoice::Embedding => write!(f, "embedding"),
            ScorerChoice::Rule => write!(f, "rule"),
        }
    }
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dataset_path: PathBuf,
    pub model_path: PathBuf,
    pub embeddings_path: PathBuf,
    pub scorer: ScorerChoice,
    pub top_k: usize,
    pub default_max_distance_km: f64,
    pub default_max_days: i64,
    pub request_timeout_ms: u64,
    pub bind_addr: String,
    pub region_anchor: GeoPoint,
    pub rank_weights: RankWeights,
    pub adjustment_rates: AdjustmentRates,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            dataset_path: "data/appraisals_dataset.json".into(),
            model_path: "models/similarity_model.json".into(),
            embeddings_path: "models/property_embeddings.json".into(),
            scorer: ScorerChoice::Auto,
            top_k: DEFAULT_TOP_K,
            default_max_distance_km: DEFAULT_MAX_DISTANCE_KM,
            default_max_days: DEFAULT_MAX_DAYS_SINCE_SALE,
            request_timeout_ms: 2000,
            bind_addr: "127.0.0.1:3001".to_string(),
            region_anchor: DEFAULT_REGION_ANCHOR,
            rank_weights: RankWeights::default(),
            adjustment_rates: AdjustmentRates::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take the defaults, unparseable
    /// values are errors
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = EngineConfig::default();

        let parsed = |key: &str| -> Option<String> {
            lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };

        fn number<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
        where
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            match raw {
                Some(value) => value
                    .parse()
                    .with_context(|| format!("{} must be a valid number, got '{}'", key, value)),
                None => Ok(default),
            }
        }

        let weights = RankWeights {
            similarity: number(
                "RANK_WEIGHT_SIMILARITY",
                parsed("RANK_WEIGHT_SIMILARITY"),
                defaults.rank_weights.similarity,
            )?,
            distance: number(
                "RANK_WEIGHT_DISTANCE",
                parsed("RANK_WEIGHT_DISTANCE"),
                defaults.rank_weights.distance,
            )?,
            recency: number(
                "RANK_WEIGHT_RECENCY",
                parsed("RANK_WEIGHT_RECENCY"),
                defaults.rank_weights.recency,
            )?,
            price: number(
                "RANK_WEIGHT_PRICE",
                parsed("RANK_WEIGHT_PRICE"),
                defaults.rank_weights.price,
            )?,
            completeness: number(
                "RANK_WEIGHT_COMPLETENESS",
                parsed("RANK_WEIGHT_COMPLETENESS"),
                defaults.rank_weights.completeness,
            )?,
        };
        weights.validate().context("invalid RANK_WEIGHT_* settings")?;

        let rates = defaults.adjustment_rates;
        let adjustment_rates = AdjustmentRates {
            living_area_per_sqft: number(
                "ADJUST_LIVING_AREA_PER_SQFT",
                parsed("ADJUST_LIVING_AREA_PER_SQFT"),
                rates.living_area_per_sqft,
            )?,
            lot_size_per_sqft: number(
                "ADJUST_LOT_SIZE_PER_SQFT",
                parsed("ADJUST_LOT_SIZE_PER_SQFT"),
                rates.lot_size_per_sqft,
            )?,
            condition_step: number(
                "ADJUST_CONDITION_STEP",
                parsed("ADJUST_CONDITION_STEP"),
                rates.condition_step,
            )?,
            location_per_km: number(
                "ADJUST_LOCATION_PER_KM",
                parsed("ADJUST_LOCATION_PER_KM"),
                rates.location_per_km,
            )?,
            location_free_km: number(
                "ADJUST_LOCATION_FREE_KM",
                parsed("ADJUST_LOCATION_FREE_KM"),
                rates.location_free_km,
            )?,
            time_per_30_days: number(
                "ADJUST_TIME_PER_30_DAYS",
                parsed("ADJUST_TIME_PER_30_DAYS"),
                rates.time_per_30_days,
            )?,
            time_free_days: number(
                "ADJUST_TIME_FREE_DAYS",
                parsed("ADJUST_TIME_FREE_DAYS"),
                rates.time_free_days,
            )?,
        };
        adjustment_rates
            .validate()
            .context("invalid ADJUST_* settings")?;

        let region_anchor = GeoPoint::new(
            number(
                "REGION_ANCHOR_LAT",
                parsed("REGION_ANCHOR_LAT"),
                defaults.region_anchor.latitude,
            )?,
            number(
                "REGION_ANCHOR_LON",
                parsed("REGION_ANCHOR_LON"),
                defaults.region_anchor.longitude,
            )?,
        );
        if !region_anchor.is_valid() {
            bail!("REGION_ANCHOR_LAT/LON are out of range");
        }

        let config = EngineConfig {
            dataset_path: parsed("DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_path),
            model_path: parsed("MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_path),
            embeddings_path: parsed("EMBEDDINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.embeddings_path),
            scorer: match parsed("SCORER") {
                Some(value) => value.parse().context("SCORER must be auto, learned, embedding or rule")?,
                None => defaults.scorer,
            },
            top_k: number("TOP_K", parsed("TOP_K"), defaults.top_k)?,
            default_max_distance_km: number(
                "DEFAULT_MAX_DISTANCE_KM",
                parsed("DEFAULT_MAX_DISTANCE_KM"),
                defaults.default_max_distance_km,
            )?,
            default_max_days: number(
                "DEFAULT_MAX_DAYS",
                parsed("DEFAULT_MAX_DAYS"),
                defaults.default_max_days,
            )?,
            request_timeout_ms: number(
                "REQUEST_TIMEOUT_MS",
                parsed("REQUEST_TIMEOUT_MS"),
                defaults.request_timeout_ms,
            )?,
            bind_addr: parsed("BIND_ADDR").unwrap_or(defaults.bind_addr),
            region_anchor,
            rank_weights: weights,
            adjustment_rates,
        };

        if config.top_k == 0 {
            bail!("TOP_K must be at least 1");
        }
        if !(config.default_max_distance_km.is_finite() && config.default_max_distance_km > 0.0) {
            bail!("DEFAULT_MAX_DISTANCE_KM must be positive");
        }
        if config.default_max_days <= 0 {
            bail!("DEFAULT_MAX_DAYS must be positive");
        }
        if config.request_timeout_ms == 0 {
            bail!("REQUEST_TIMEOUT_MS must be positive");
        }

        Ok(config)
    }

    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions {
            region_anchor: self.region_anchor,
        }
    }

    pub fn query_defaults(&self) -> QueryDefaults {
        QueryDefaults {
            max_distance_km: self.default_max_distance_km,
            max_days_since_sale: self.default_max_days,
            normalize: self.normalize_options(),
        }
    }
}
