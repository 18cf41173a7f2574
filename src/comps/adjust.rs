//! Appraisal price adjustments
//!
//! Each adjustment moves a comp's sale price toward what the subject would
//! have sold for: a smaller or worse-kept comp is adjusted up, a larger or
//! better one down. Distance beyond a free radius and sale age beyond a free
//! window always count against the comp.

use crate::comps::types::FilteredCandidate;
use crate::error::{CompError, Result};
use crate::ingestion::PropertyRecord;
use serde::{Deserialize, Serialize};

/// Dollar rates used to adjust comp prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentRates {
    pub living_area_per_sqft: f64,
    pub lot_size_per_sqft: f64,
    /// Per grade on the Poor..Excellent ladder
    pub condition_step: f64,
    pub location_per_km: f64,
    /// Distance adjusted for free
    pub location_free_km: f64,
    pub time_per_30_days: f64,
    /// Sale age adjusted for free
    pub time_free_days: i64,
}

impl Default for AdjustmentRates {
    fn default() -> Self {
        AdjustmentRates {
            living_area_per_sqft: 50.0,
            lot_size_per_sqft: 5.0,
            condition_step: 5000.0,
            location_per_km: 2000.0,
            location_free_km: 1.0,
            time_per_30_days: 3000.0,
            time_free_days: 90,
        }
    }
}

impl AdjustmentRates {
    pub fn validate(&self) -> Result<()> {
        let rates = [
            self.living_area_per_sqft,
            self.lot_size_per_sqft,
            self.condition_step,
            self.location_per_km,
            self.location_free_km,
            self.time_per_30_days,
        ];
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) || self.time_free_days < 0 {
            return Err(CompError::Configuration(format!(
                "adjustment rates must be finite and non-negative: {:?}",
                self
            )));
        }
        Ok(())
    }
}

/// Per-comp price adjustments in dollars; `total` is their sum
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Adjustments {
    pub living_area: f64,
    pub lot_size: f64,
    pub condition: f64,
    pub location: f64,
    pub time: f64,
    pub total: f64,
}

/// Adjustments for one comp against the subject
pub fn adjust(
    subject: &PropertyRecord,
    candidate: &FilteredCandidate<'_>,
    rates: &AdjustmentRates,
) -> Adjustments {
    let comp = &candidate.sale.property;

    let living_area = size_adjustment(
        subject.living_area,
        comp.living_area,
        rates.living_area_per_sqft,
    );
    // A lot size of zero means it was never recorded
    let lot_size = size_adjustment(subject.lot_size, comp.lot_size, rates.lot_size_per_sqft);
    let condition = (subject.condition.ordinal() as f64 - comp.condition.ordinal() as f64)
        * rates.condition_step;

    let excess_km = (candidate.distance_km - rates.location_free_km).max(0.0);
    let location = -rates.location_per_km * excess_km;

    let time = if candidate.sale.sale_date.is_some() {
        let excess_days = (candidate.days_since_sale - rates.time_free_days).max(0);
        -rates.time_per_30_days * excess_days as f64 / 30.0
    } else {
        0.0
    };

    Adjustments {
        living_area,
        lot_size,
        condition,
        location,
        time,
        total: living_area + lot_size + condition + location + time,
    }
}

fn size_adjustment(subject: f64, comp: f64, rate: f64) -> f64 {
    if subject <= 0.0 || comp <= 0.0 {
        return 0.0;
    }
    (subject - comp) * rate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comps::test_support::{filtered, sale_at, subject_at};
    use crate::ingestion::{Condition, PropertyType};

    #[test]
    fn test_identical_nearby_recent_comp_needs_no_adjustment() {
        let subject = subject_at(44.23, -76.49, PropertyType::SingleFamily);
        let sale = sale_at("c", 44.23, -76.49, 30);
        let candidate = filtered(&sale, 0.5, 30, 100.0);
        let adjustments = adjust(&subject, &candidate, &AdjustmentRates::default());
        assert_eq!(adjustments, Adjustments::default());
    }

    #[test]
    fn test_each_adjustment() {
        let subject = subject_at(44.23, -76.49, PropertyType::SingleFamily);
        let mut sale = sale_at("c", 44.23, -76.49, 150);
        sale.property.living_area = subject.living_area - 200.0;
        sale.property.lot_size = subject.lot_size + 1000.0;
        sale.property.condition = Condition::Fair;

        let candidate = filtered(&sale, 3.5, 150, 100.0);
        let adjustments = adjust(&subject, &candidate, &AdjustmentRates::default());
        // Smaller comp is adjusted up, bigger lot down
        assert_eq!(adjustments.living_area, 10_000.0);
        assert_eq!(adjustments.lot_size, -5_000.0);
        // Good vs Fair is two grades
        assert_eq!(adjustments.condition, 10_000.0);
        assert!((adjustments.location - -5_000.0).abs() < 1e-9);
        assert!((adjustments.time - -6_000.0).abs() < 1e-9);
        assert!((adjustments.total - 4_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_lot_and_date_are_not_adjusted() {
        let subject = subject_at(44.23, -76.49, PropertyType::SingleFamily);
        let mut sale = sale_at("c", 44.23, -76.49, 400);
        sale.property.lot_size = 0.0;
        sale.sale_date = None;

        let candidate = filtered(&sale, 0.0, 999, 100.0);
        let adjustments = adjust(&subject, &candidate, &AdjustmentRates::default());
        assert_eq!(adjustments.lot_size, 0.0);
        assert_eq!(adjustments.time, 0.0);
    }

    #[test]
    fn test_rates_are_configurable() {
        let subject = subject_at(44.23, -76.49, PropertyType::SingleFamily);
        let mut sale = sale_at("c", 44.23, -76.49, 60);
        sale.property.living_area = subject.living_area + 100.0;
        let rates = AdjustmentRates {
            living_area_per_sqft: 120.0,
            time_free_days: 30,
            ..Default::default()
        };

        let adjustments = adjust(&subject, &filtered(&sale, 0.0, 60, 100.0), &rates);
        assert_eq!(adjustments.living_area, -12_000.0);
        assert!((adjustments.time - -3_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_rates_are_rejected() {
        assert!(AdjustmentRates::default().validate().is_ok());
        let rates = AdjustmentRates {
            location_per_km: -1.0,
            ..Default::default()
        };
        assert!(matches!(rates.validate(), Err(CompError::Configuration(_))));
    }
}
