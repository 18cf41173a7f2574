//! Explanation generator - per-factor breakdown and a templated summary
//!
//! Every contribution is read straight from the numbers the ranker used.

use crate::comps::features::{feature_label, PROPERTY_FEATURES};
use crate::comps::rank::RankWeights;
use crate::comps::types::{FactorExplanation, FeatureVector, ScoredCandidate};
use crate::ingestion::UNKNOWN_SALE_AGE_DAYS;
use std::cmp::Ordering;

pub const OVERALL_SIMILARITY: &str = "Overall Similarity";
pub const GEOGRAPHIC_PROXIMITY: &str = "Geographic Proximity";
pub const SALE_RECENCY: &str = "Sale Recency";
pub const PRICE_PLAUSIBILITY: &str = "Price Plausibility";
pub const DATA_COMPLETENESS: &str = "Data Completeness";
pub const LARGEST_DIFFERENCE: &str = "Largest Difference";

/// Weakest property-level feature: (feature index, value in [0, 1])
pub fn largest_difference(features: &FeatureVector) -> (usize, f64) {
    PROPERTY_FEATURES
        .iter()
        .map(|&idx| (idx, features[idx]))
        .fold((PROPERTY_FEATURES[0], f64::INFINITY), |weakest, current| {
            if current.1 < weakest.1 {
                current
            } else {
                weakest
            }
        })
}

fn describe_recency(candidate: &ScoredCandidate<'_>) -> String {
    if candidate.candidate.sale.sale_date.is_none() {
        format!("Sale date unknown (treated as {} days old)", UNKNOWN_SALE_AGE_DAYS)
    } else {
        format!(
            "Sold {} days before the appraisal date",
            candidate.candidate.days_since_sale
        )
    }
}

/// Ordered factor list for one ranked candidate
pub fn explain(
    candidate: &ScoredCandidate<'_>,
    weights: &RankWeights,
    feature_weights: &FeatureVector,
) -> Vec<FactorExplanation> {
    let w = weights.normalized();
    let terms = &candidate.terms;
    let sale = candidate.candidate.sale;

    let similarity_description = match candidate.similarity.band {
        Some(band) => format!(
            "Similarity {:.1}/100 from the {} scorer (confidence {:.1}-{:.1})",
            terms.similarity, candidate.scorer, band.low, band.high
        ),
        // Only the calibrated learned scorer carries a band
        None => format!(
            "Similarity {:.1}/100 from the {} scorer (uncalibrated, no confidence band)",
            terms.similarity, candidate.scorer
        ),
    };

    let mut factors = vec![
        FactorExplanation {
            factor: OVERALL_SIMILARITY.to_string(),
            description: similarity_description,
            weight: w.similarity,
            contribution: terms.similarity,
        },
        FactorExplanation {
            factor: GEOGRAPHIC_PROXIMITY.to_string(),
            description: format!("{:.2} km from the subject", candidate.candidate.distance_km),
            weight: w.distance,
            contribution: terms.distance,
        },
        FactorExplanation {
            factor: SALE_RECENCY.to_string(),
            description: describe_recency(candidate),
            weight: w.recency,
            contribution: terms.recency,
        },
        FactorExplanation {
            factor: PRICE_PLAUSIBILITY.to_string(),
            description: format!("Sold for ${:.0}", sale.sale_price),
            weight: w.price,
            contribution: terms.price,
        },
        FactorExplanation {
            factor: DATA_COMPLETENESS.to_string(),
            description: format!("{:.0}% of tracked fields recorded", terms.completeness),
            weight: w.completeness,
            contribution: terms.completeness,
        },
    ];

    let (weakest, value) = largest_difference(&candidate.features);
    if value < 1.0 {
        let total: f64 = feature_weights.iter().sum();
        let weight = if total > 0.0 {
            feature_weights[weakest] / total
        } else {
            0.0
        };
        factors.push(FactorExplanation {
            factor: LARGEST_DIFFERENCE.to_string(),
            description: format!(
                "Largest difference is {} ({:.0}% similar)",
                feature_label(weakest),
                value * 100.0
            ),
            weight,
            contribution: value * 100.0,
        });
    }

    factors.sort_by(|a, b| {
        (b.weight * b.contribution)
            .partial_cmp(&(a.weight * a.contribution))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.factor.cmp(&b.factor))
    });
    factors
}

/// One-sentence summary chosen by thresholds on similarity, distance and recency
pub fn summarize(candidate: &ScoredCandidate<'_>) -> String {
    let similarity = candidate.similarity.score;
    let distance = candidate.candidate.distance_km;
    let days = candidate.candidate.days_since_sale;
    let sold = if candidate.candidate.sale.sale_date.is_none() {
        "sale date unknown".to_string()
    } else {
        format!("sold {} days ago", days)
    };
    let (weakest, _) = largest_difference(&candidate.features);
    let label = feature_label(weakest);

    if similarity >= 85.0 && distance <= 2.0 && days <= 180 {
        format!(
            "Excellent comparable: {:.0}% similar, {:.1} km away, {}.",
            similarity, distance, sold
        )
    } else if similarity >= 70.0 {
        format!(
            "Strong comparable: {:.0}% similar, {:.1} km away, {}.",
            similarity, distance, sold
        )
    } else if similarity >= 50.0 {
        format!(
            "Reasonable comparable: {:.0}% similar, {:.1} km away; differs most in {}.",
            similarity, distance, label
        )
    } else {
        format!(
            "Weak comparable: {:.0}% similar, {:.1} km away; adjust for {}.",
            similarity, distance, label
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comps::features::{BEDROOMS, LIVING_AREA};
    use crate::comps::scorer::RULE_WEIGHTS;
    use crate::comps::test_support::{filtered, sale_at, scored};
    use crate::comps::types::{ConfidenceBand, RankTerms, FEATURE_COUNT};

    fn candidate_with(sale: &crate::ingestion::SaleRecord, similarity: f64) -> ScoredCandidate<'_> {
        let mut candidate = scored(filtered(sale, 1.2, 90, 100.0), 0.0);
        candidate.similarity.score = similarity;
        candidate.terms = RankTerms {
            similarity,
            distance: 97.6,
            recency: 87.7,
            price: 100.0,
            completeness: 100.0,
        };
        candidate.composite = RankWeights::default().composite(&candidate.terms);
        candidate
    }

    #[test]
    fn test_factors_are_ordered_and_consistent() {
        let sale = sale_at("s", 44.0, -76.0, 90);
        let mut candidate = candidate_with(&sale, 91.0);
        candidate.features = [1.0; FEATURE_COUNT];
        candidate.features[BEDROOMS] = 0.5;
        candidate.similarity.band = Some(ConfidenceBand {
            low: 86.0,
            high: 96.0,
        });

        let factors = explain(&candidate, &RankWeights::default(), &RULE_WEIGHTS);
        assert_eq!(factors[0].factor, OVERALL_SIMILARITY);
        assert_eq!(factors[0].contribution, 91.0);
        assert!(factors[0].description.contains("86.0-96.0"));

        for pair in factors.windows(2) {
            assert!(pair[0].weight * pair[0].contribution >= pair[1].weight * pair[1].contribution);
        }

        let difference = factors
            .iter()
            .find(|f| f.factor == LARGEST_DIFFERENCE)
            .unwrap();
        assert_eq!(difference.contribution, 50.0);
        assert!(difference.description.contains("bedroom count"));

        let proximity = factors
            .iter()
            .find(|f| f.factor == GEOGRAPHIC_PROXIMITY)
            .unwrap();
        assert_eq!(proximity.contribution, candidate.terms.distance);
    }

    #[test]
    fn test_uncalibrated_similarity_says_no_band() {
        let sale = sale_at("s", 44.0, -76.0, 90);
        let candidate = candidate_with(&sale, 88.0);
        assert!(candidate.similarity.band.is_none());

        let factors = explain(&candidate, &RankWeights::default(), &RULE_WEIGHTS);
        let overall = factors
            .iter()
            .find(|f| f.factor == OVERALL_SIMILARITY)
            .unwrap();
        assert!(overall.description.contains("no confidence band"));
        assert!(overall.description.contains("88.0/100"));
    }

    #[test]
    fn test_no_difference_factor_for_identical_features() {
        let sale = sale_at("s", 44.0, -76.0, 90);
        let mut candidate = candidate_with(&sale, 99.0);
        candidate.features = [1.0; FEATURE_COUNT];
        let factors = explain(&candidate, &RankWeights::default(), &RULE_WEIGHTS);
        assert_eq!(factors.len(), 5);
    }

    #[test]
    fn test_summary_templates() {
        let sale = sale_at("s", 44.0, -76.0, 90);
        let mut candidate = candidate_with(&sale, 92.0);
        candidate.features = [1.0; FEATURE_COUNT];
        candidate.features[LIVING_AREA] = 0.4;

        assert!(summarize(&candidate).starts_with("Excellent comparable"));

        candidate.candidate.distance_km = 8.0;
        assert!(summarize(&candidate).starts_with("Strong comparable"));

        candidate.similarity.score = 60.0;
        let reasonable = summarize(&candidate);
        assert!(reasonable.starts_with("Reasonable comparable"));
        assert!(reasonable.contains("living area"));

        candidate.similarity.score = 20.0;
        assert!(summarize(&candidate).starts_with("Weak comparable"));
    }

    #[test]
    fn test_summary_is_deterministic() {
        let sale = sale_at("s", 44.0, -76.0, 90);
        let candidate = candidate_with(&sale, 75.0);
        assert_eq!(summarize(&candidate), summarize(&candidate));
    }
}
