//! Ranker - composite score, deterministic ordering and top-K selection

use crate::comps::types::{FilteredCandidate, RankTerms, ScoredCandidate, SubjectQuery};
use crate::error::{CompError, Result};
use crate::price_per_sqft;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Composite scores are compared on this grid; closer scores tie
pub const TIE_EPSILON: f64 = 1e-6;

/// Price ratio outside which a sale is implausible as a comp
const MIN_PRICE_RATIO: f64 = 0.25;
const MAX_PRICE_RATIO: f64 = 2.0;
/// Plausibility when nothing is known to compare against
const NEUTRAL_PRICE_SCORE: f64 = 50.0;

/// Relative weights of the composite terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankWeights {
    pub similarity: f64,
    pub distance: f64,
    pub recency: f64,
    pub price: f64,
    pub completeness: f64,
}

impl Default for RankWeights {
    fn default() -> Self {
        RankWeights {
            similarity: 0.60,
            distance: 0.15,
            recency: 0.15,
            price: 0.05,
            completeness: 0.05,
        }
    }
}

impl RankWeights {
    pub fn total(&self) -> f64 {
        self.similarity + self.distance + self.recency + self.price + self.completeness
    }

    pub fn validate(&self) -> Result<()> {
        let all = [
            self.similarity,
            self.distance,
            self.recency,
            self.price,
            self.completeness,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) || self.total() <= 0.0 {
            return Err(CompError::Configuration(format!(
                "rank weights must be non-negative with a positive sum: {:?}",
                self
            )));
        }
        Ok(())
    }

    /// Weights scaled to sum to one
    pub fn normalized(&self) -> RankWeights {
        let total = self.total();
        if total <= 0.0 {
            return *self;
        }
        RankWeights {
            similarity: self.similarity / total,
            distance: self.distance / total,
            recency: self.recency / total,
            price: self.price / total,
            completeness: self.completeness / total,
        }
    }

    /// Weighted mean of the terms, 0-100
    pub fn composite(&self, terms: &RankTerms) -> f64 {
        let w = self.normalized();
        w.similarity * terms.similarity
            + w.distance * terms.distance
            + w.recency * terms.recency
            + w.price * terms.price
            + w.completeness * terms.completeness
    }
}

/// Median price per square foot of the pool, the plausibility reference
/// when no estimated value is supplied
pub fn reference_price_per_sqft(candidates: &[FilteredCandidate<'_>]) -> Option<f64> {
    let mut values: Vec<f64> = candidates
        .iter()
        .filter_map(|c| price_per_sqft(c.sale.sale_price, c.sale.property.living_area))
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

/// 100 at ratio 1, falling linearly; zero outside the plausible band
fn ratio_plausibility(ratio: f64) -> f64 {
    if !ratio.is_finite() || !(MIN_PRICE_RATIO..=MAX_PRICE_RATIO).contains(&ratio) {
        return 0.0;
    }
    100.0 * (1.0 - (ratio - 1.0).abs().min(1.0))
}

/// Per-term scores for one candidate
pub fn rank_terms(
    query: &SubjectQuery,
    candidate: &FilteredCandidate<'_>,
    similarity: f64,
    reference_ppsf: Option<f64>,
) -> RankTerms {
    let distance = 100.0 * (1.0 - candidate.distance_km / query.max_distance_km);
    let recency =
        100.0 * (1.0 - candidate.days_since_sale as f64 / query.max_days_since_sale as f64);

    let price = match query.estimated_value {
        Some(estimate) => ratio_plausibility(candidate.sale.sale_price / estimate),
        None => match (
            reference_ppsf,
            price_per_sqft(candidate.sale.sale_price, candidate.sale.property.living_area),
        ) {
            (Some(reference), Some(ppsf)) => ratio_plausibility(ppsf / reference),
            _ => NEUTRAL_PRICE_SCORE,
        },
    };

    RankTerms {
        similarity,
        distance: distance.clamp(0.0, 100.0),
        recency: recency.clamp(0.0, 100.0),
        price,
        completeness: 100.0 * candidate.sale.property.completeness(),
    }
}

fn grid(score: f64) -> i64 {
    (score / TIE_EPSILON).round() as i64
}

/// Composite descending, then distance, then days since sale, then identifier
pub fn compare(a: &ScoredCandidate<'_>, b: &ScoredCandidate<'_>) -> Ordering {
    grid(b.composite)
        .cmp(&grid(a.composite))
        .then_with(|| a.candidate.distance_km.total_cmp(&b.candidate.distance_km))
        .then_with(|| a.candidate.days_since_sale.cmp(&b.candidate.days_since_sale))
        .then_with(|| a.id().cmp(b.id()))
}

/// Sort and keep at most `k`; never pads
pub fn rank<'a>(mut scored: Vec<ScoredCandidate<'a>>, k: usize) -> Vec<ScoredCandidate<'a>> {
    scored.sort_by(compare);
    scored.truncate(k);
    scored
}
