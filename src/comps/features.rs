//! Feature extraction - one fixed-order vector per (subject, candidate) pair
//!
//! Every component lies in [0, 1] with 1 meaning "most similar", and each is
//! monotonic in its raw difference. Changing the order or count invalidates
//! any trained model artifact, which carries these names for checking.

use crate::comps::types::{FeatureVector, FilteredCandidate, SubjectQuery, FEATURE_COUNT};
use crate::ingestion::{Condition, Quality, StructureType};
use chrono::Datelike;

/// Guard for zero denominators
pub const EPSILON: f64 = 1e-9;

/// Age gap at which the age feature bottoms out
const MAX_AGE_GAP_YEARS: f64 = 50.0;
/// Distance at which proximity decays to 1/e
const PROXIMITY_SCALE_KM: f64 = 10.0;
/// Distance beyond which different market areas score zero
const MARKET_AREA_RADIUS_KM: f64 = 25.0;
/// Price magnitude reference when no estimated value is given
const PRICE_CEILING: f64 = 10_000_000.0;
/// Value for features known on one side only; unknown on both sides is a match
const NEUTRAL: f64 = 0.5;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "living_area_similarity",
    "lot_size_similarity",
    "bedroom_similarity",
    "bathroom_similarity",
    "age_similarity",
    "proximity",
    "neighborhood_match",
    "market_area_proximity",
    "property_type_match",
    "structure_type_match",
    "condition_similarity",
    "price_similarity",
    "recency",
    "seasonal_alignment",
    "feature_overlap",
    "quality_similarity",
    "type_compatibility",
];

pub const LIVING_AREA: usize = 0;
pub const LOT_SIZE: usize = 1;
pub const BEDROOMS: usize = 2;
pub const BATHROOMS: usize = 3;
pub const AGE: usize = 4;
pub const PROXIMITY: usize = 5;
pub const NEIGHBORHOOD: usize = 6;
pub const MARKET_AREA: usize = 7;
pub const PROPERTY_TYPE: usize = 8;
pub const STRUCTURE_TYPE: usize = 9;
pub const CONDITION: usize = 10;
pub const PRICE: usize = 11;
pub const RECENCY: usize = 12;
pub const SEASONAL: usize = 13;
pub const FEATURE_OVERLAP: usize = 14;
pub const QUALITY: usize = 15;
pub const TYPE_COMPATIBILITY: usize = 16;

/// Features describing the properties themselves rather than the sale or
/// its location; the explanation generator reports the weakest of these
pub const PROPERTY_FEATURES: [usize; 11] = [
    LIVING_AREA,
    LOT_SIZE,
    BEDROOMS,
    BATHROOMS,
    AGE,
    NEIGHBORHOOD,
    PROPERTY_TYPE,
    STRUCTURE_TYPE,
    CONDITION,
    FEATURE_OVERLAP,
    QUALITY,
];

/// Short human label for a feature index
pub fn feature_label(index: usize) -> &'static str {
    match index {
        LIVING_AREA => "living area",
        LOT_SIZE => "lot size",
        BEDROOMS => "bedroom count",
        BATHROOMS => "bathroom count",
        AGE => "age",
        PROXIMITY => "distance",
        NEIGHBORHOOD => "neighborhood",
        MARKET_AREA => "market area",
        PROPERTY_TYPE => "property type",
        STRUCTURE_TYPE => "structure type",
        CONDITION => "condition",
        PRICE => "price level",
        RECENCY => "sale recency",
        SEASONAL => "sale season",
        FEATURE_OVERLAP => "features",
        QUALITY => "quality",
        TYPE_COMPATIBILITY => "type compatibility",
        _ => "unknown",
    }
}

/// Build the feature vector for one filtered candidate
pub fn extract_features(query: &SubjectQuery, candidate: &FilteredCandidate<'_>) -> FeatureVector {
    let subject = &query.subject;
    let comp = &candidate.sale.property;
    let mut features = [0.0; FEATURE_COUNT];

    // Physical
    features[LIVING_AREA] = ratio_similarity(subject.living_area, comp.living_area);
    features[LOT_SIZE] = ratio_similarity(subject.lot_size, comp.lot_size);
    features[BEDROOMS] = count_similarity(subject.bedrooms as f64, comp.bedrooms as f64);
    features[BATHROOMS] = count_similarity(subject.bathrooms, comp.bathrooms);
    features[AGE] = match (subject.year_built, comp.year_built) {
        (Some(a), Some(b)) => 1.0 - ((a - b).abs() as f64 / MAX_AGE_GAP_YEARS).min(1.0),
        (None, None) => 1.0,
        _ => NEUTRAL,
    };

    // Geographic
    features[PROXIMITY] = (-candidate.distance_km.max(0.0) / PROXIMITY_SCALE_KM).exp();
    features[NEIGHBORHOOD] = text_match(&subject.neighborhood, &comp.neighborhood);
    features[MARKET_AREA] = if !subject.market_area.is_empty()
        && subject.market_area.eq_ignore_ascii_case(&comp.market_area)
    {
        1.0
    } else {
        1.0 - (candidate.distance_km / MARKET_AREA_RADIUS_KM).min(1.0)
    };

    // Exact-match indicators
    features[PROPERTY_TYPE] = indicator(subject.property_type == comp.property_type);
    features[STRUCTURE_TYPE] = match (subject.structure_type, comp.structure_type) {
        (StructureType::Unknown, StructureType::Unknown) => 1.0,
        (StructureType::Unknown, _) | (_, StructureType::Unknown) => NEUTRAL,
        (a, b) => indicator(a == b),
    };
    features[CONDITION] = ordinal_similarity(
        subject.condition.ordinal(),
        comp.condition.ordinal(),
        Condition::MAX_ORDINAL,
    );

    // Market dynamics
    features[PRICE] = match query.estimated_value {
        Some(estimate) => ratio_similarity(estimate, candidate.sale.sale_price),
        None => {
            ((1.0 + candidate.sale.sale_price.max(0.0)).ln() / (1.0 + PRICE_CEILING).ln()).min(1.0)
        }
    };
    features[RECENCY] = 1.0 / (1.0 + candidate.days_since_sale.max(0) as f64 / 365.0);
    features[SEASONAL] = match candidate.sale.sale_date {
        Some(date) => {
            let gap = (date.month() as i32 - query.as_of.month() as i32).abs();
            let circular = gap.min(12 - gap);
            1.0 - circular as f64 / 6.0
        }
        None => NEUTRAL,
    };

    // Advanced
    features[FEATURE_OVERLAP] = jaccard(&subject.feature_tags, &comp.feature_tags);
    features[QUALITY] = ordinal_similarity(
        subject.quality.ordinal(),
        comp.quality.ordinal(),
        Quality::MAX_ORDINAL,
    );
    features[TYPE_COMPATIBILITY] = (candidate.type_compatibility / 100.0).clamp(0.0, 1.0);

    features
}

/// 1 - |a - b| / max(a, b); two zeros are identical
fn ratio_similarity(a: f64, b: f64) -> f64 {
    let a = a.max(0.0);
    let b = b.max(0.0);
    let denom = a.max(b);
    if denom < EPSILON {
        return 1.0;
    }
    (1.0 - (a - b).abs() / denom).clamp(0.0, 1.0)
}

fn count_similarity(a: f64, b: f64) -> f64 {
    1.0 / (1.0 + (a - b).abs())
}

fn ordinal_similarity(a: u8, b: u8, max: u8) -> f64 {
    1.0 - (a as f64 - b as f64).abs() / max.max(1) as f64
}

fn indicator(matched: bool) -> f64 {
    if matched {
        1.0
    } else {
        0.0
    }
}

fn text_match(a: &str, b: &str) -> f64 {
    let (a, b) = (a.trim(), b.trim());
    if a.is_empty() && b.is_empty() {
        1.0
    } else if a.is_empty() || b.is_empty() {
        NEUTRAL
    } else {
        indicator(a.eq_ignore_ascii_case(b))
    }
}

fn jaccard(a: &std::collections::BTreeSet<String>, b: &std::collections::BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return NEUTRAL;
    }
    a.intersection(b).count() as f64 / union as f64
}
