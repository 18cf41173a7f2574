// Library module for testable functions

pub mod comps;
pub mod config;
pub mod error;
pub mod ingestion;

pub use error::{CompError, Result};

/// Sale price per square foot of living area
/// Formula: price / living_area
pub fn price_per_sqft(price: f64, living_area: f64) -> Option<f64> {
    if !(price.is_finite() && living_area.is_finite()) || price <= 0.0 || living_area <= 0.0 {
        return None;
    }
    Some(price / living_area)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_per_sqft_calculation() {
        // Test normal case
        let ppsf = price_per_sqft(650000.0, 2000.0);
        assert!(ppsf.is_some());
        let ppsf = ppsf.unwrap();
        assert!((ppsf - 325.0).abs() < 0.01);
    }

    #[test]
    fn test_price_per_sqft_condo() {
        // Small unit, high price per foot
        let ppsf = price_per_sqft(480000.0, 850.0).unwrap();
        assert!((ppsf - 564.71).abs() < 0.01);
    }

    #[test]
    fn test_price_per_sqft_zero_area() {
        // Test with zero living area (should return None)
        assert!(price_per_sqft(500000.0, 0.0).is_none());
    }

    #[test]
    fn test_price_per_sqft_invalid_price() {
        assert!(price_per_sqft(0.0, 1500.0).is_none());
        assert!(price_per_sqft(-100000.0, 1500.0).is_none());
        assert!(price_per_sqft(f64::NAN, 1500.0).is_none());
    }
}
