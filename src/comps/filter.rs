//! Candidate filters - self-exclusion, radius, recency and type compatibility
//!
//! Each stage keeps candidates in pool order so later tie-breaks stay reproducible.

use crate::comps::types::{FilteredCandidate, SubjectQuery};
use crate::ingestion::{GeoPoint, PropertyType, SaleRecord};
use serde::Serialize;
use tracing::debug;

/// Mean Earth radius used for great-circle distance
pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const EXACT_TYPE_SCORE: f64 = 100.0;
pub const COMPATIBLE_TYPE_SCORE: f64 = 75.0;

/// Great-circle distance in km (haversine)
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    // Rounding can push h a hair past 1 for antipodal points
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Candidate types a subject of `subject` type accepts; the subject's own type first
pub fn compatible_types(subject: PropertyType) -> &'static [PropertyType] {
    use PropertyType::*;
    match subject {
        SingleFamily => &[SingleFamily, Townhouse],
        Townhouse => &[Townhouse, SingleFamily, Condo],
        Condo => &[Condo, Townhouse],
        MultiFamily => &[MultiFamily, SingleFamily],
        Other => &[Other, SingleFamily, Townhouse, Condo, MultiFamily],
    }
}

/// 100 for the same type, 75 for a compatible one, None when incompatible
pub fn compatibility_score(subject: PropertyType, candidate: PropertyType) -> Option<f64> {
    if subject == candidate {
        Some(EXACT_TYPE_SCORE)
    } else if compatible_types(subject).contains(&candidate) {
        Some(COMPATIBLE_TYPE_SCORE)
    } else {
        None
    }
}

/// Candidate counts after each filter stage
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub total_candidates: usize,
    pub excluded_self: usize,
    pub after_distance: usize,
    pub after_recency: usize,
    pub after_compatibility: usize,
}

impl std::fmt::Display for StageCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total: {}, self: {}, distance: {}, recency: {}, compatibility: {}",
            self.total_candidates,
            self.excluded_self,
            self.after_distance,
            self.after_recency,
            self.after_compatibility
        )
    }
}

/// Drop the subject's own sale (same identifier or same address)
pub fn exclude_subject<'a>(query: &SubjectQuery, pool: &'a [SaleRecord]) -> Vec<&'a SaleRecord> {
    let subject_id = query.subject.id.as_str();
    let subject_address = query.subject.address_key();

    pool.iter()
        .filter(|sale| {
            let is_self = sale.id() == subject_id
                || (!subject_address.is_empty() && sale.property.address_key() == subject_address);
            if is_self {
                debug!("Excluding {} as the subject's own sale", sale.id());
            }
            !is_self
        })
        .collect()
}

/// Keep candidates within `max_distance_km` (inclusive), annotated with distance
pub fn geospatial_filter<'a>(
    origin: GeoPoint,
    max_distance_km: f64,
    pool: Vec<&'a SaleRecord>,
) -> Vec<FilteredCandidate<'a>> {
    pool.into_iter()
        .filter_map(|sale| {
            let distance_km = haversine_km(origin, sale.property.location);
            (distance_km <= max_distance_km).then_some(FilteredCandidate {
                sale,
                distance_km,
                days_since_sale: 0,
                type_compatibility: 0.0,
            })
        })
        .collect()
}

/// Keep candidates sold within `max_days` (inclusive) of `as_of`.
/// Undated sales carry the 999-day sentinel; sales after `as_of` are rejected.
pub fn temporal_filter<'a>(
    as_of: chrono::NaiveDate,
    max_days: i64,
    pool: Vec<FilteredCandidate<'a>>,
) -> Vec<FilteredCandidate<'a>> {
    pool.into_iter()
        .filter_map(|candidate| {
            let days_since_sale = candidate.sale.days_since_sale(as_of);
            if days_since_sale < 0 {
                debug!("Rejecting {}: sold after {}", candidate.sale.id(), as_of);
                return None;
            }
            (days_since_sale <= max_days).then_some(FilteredCandidate {
                days_since_sale,
                ..candidate
            })
        })
        .collect()
}

/// Keep candidates whose type the subject accepts, annotated with the type score
pub fn compatibility_filter<'a>(
    subject_type: PropertyType,
    pool: Vec<FilteredCandidate<'a>>,
) -> Vec<FilteredCandidate<'a>> {
    pool.into_iter()
        .filter_map(|candidate| {
            compatibility_score(subject_type, candidate.sale.property.property_type).map(|score| {
                FilteredCandidate {
                    type_compatibility: score,
                    ..candidate
                }
            })
        })
        .collect()
}

/// Run every stage in order, recording the survivors of each
pub fn apply_filters<'a>(
    query: &SubjectQuery,
    pool: &'a [SaleRecord],
) -> (Vec<FilteredCandidate<'a>>, StageCounts) {
    let mut counts = StageCounts {
        total_candidates: pool.len(),
        ..Default::default()
    };

    let others = exclude_subject(query, pool);
    counts.excluded_self = pool.len() - others.len();

    let nearby = geospatial_filter(query.subject.location, query.max_distance_km, others);
    counts.after_distance = nearby.len();

    let recent = temporal_filter(query.as_of, query.max_days_since_sale, nearby);
    counts.after_recency = recent.len();

    let compatible = compatibility_filter(query.subject.property_type, recent);
    counts.after_compatibility = compatible.len();

    debug!("Filter stages: {}", counts);
    (compatible, counts)
}
