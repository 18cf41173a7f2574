//! Enrichment functions - fill derivable attributes and collapse duplicate sales

use crate::ingestion::types::{PropertyRecord, PropertyType, SaleRecord, StructureType};
use std::collections::HashMap;
use tracing::{debug, info};

/// Infer the structure from the property type when the dataset omitted it.
/// Pure function - no side effects
pub fn infer_structure_type(record: PropertyRecord) -> PropertyRecord {
    if record.structure_type != StructureType::Unknown {
        return record; // Already classified
    }

    let inferred = match record.property_type {
        PropertyType::SingleFamily => StructureType::Detached,
        PropertyType::Townhouse | PropertyType::Condo => StructureType::Attached,
        PropertyType::MultiFamily | PropertyType::Other => return record,
    };

    debug!(
        "Inferred {} structure for {} (type: {})",
        inferred, record.id, record.property_type
    );

    // Still counted as defaulted for completeness
    PropertyRecord {
        structure_type: inferred,
        ..record
    }
}

/// Fall back to the market area when no neighborhood was recorded.
/// Pure function - no side effects
pub fn derive_neighborhood(record: PropertyRecord) -> PropertyRecord {
    if !record.neighborhood.is_empty() || record.market_area.is_empty() {
        return record;
    }

    PropertyRecord {
        neighborhood: record.market_area.clone(),
        ..record
    }
}

/// Enrichment shared by subjects and candidates
pub fn enrich_property(record: PropertyRecord) -> PropertyRecord {
    derive_neighborhood(infer_structure_type(record))
}

/// Collapse sales sharing an address, keeping the better record of each pair.
///
/// Returns the surviving sales in first-seen order and the number removed.
pub fn dedupe_by_address(sales: Vec<SaleRecord>) -> (Vec<SaleRecord>, usize) {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<SaleRecord> = Vec::with_capacity(sales.len());
    let mut duplicates = 0;

    for sale in sales {
        let key = sale.property.address_key();
        if key.is_empty() {
            kept.push(sale); // Nothing to compare on
            continue;
        }

        match slots.get(&key) {
            Some(&slot) => {
                duplicates += 1;
                if should_replace(&kept[slot], &sale) {
                    debug!("Replacing duplicate sale at {} with {}", key, sale.id());
                    kept[slot] = sale;
                } else {
                    debug!("Skipped duplicate sale {} at {}", sale.id(), key);
                }
            }
            None => {
                slots.insert(key, kept.len());
                kept.push(sale);
            }
        }
    }

    (kept, duplicates)
}

/// More complete data wins; then the more recent sale
fn should_replace(existing: &SaleRecord, candidate: &SaleRecord) -> bool {
    let existing_score = existing.property.completeness();
    let candidate_score = candidate.property.completeness();

    if (candidate_score - existing_score).abs() > f64::EPSILON {
        return candidate_score > existing_score;
    }

    match (existing.sale_date, candidate.sale_date) {
        (Some(old), Some(new)) => new > old,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Full enrichment pipeline for normalized sales
pub fn enrich_all(sales: Vec<SaleRecord>) -> (Vec<SaleRecord>, usize) {
    let enriched: Vec<SaleRecord> = sales
        .into_iter()
        .map(|sale| SaleRecord {
            property: enrich_property(sale.property),
            ..sale
        })
        .collect();

    let (deduped, duplicates) = dedupe_by_address(enriched);

    info!(
        "Enriched {} sales ({} duplicate addresses collapsed)",
        deduped.len(),
        duplicates
    );

    (deduped, duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::types::{Condition, GeoPoint, LocationSource, Quality};
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn sale(id: &str, address: &str, date: Option<(i32, u32, u32)>) -> SaleRecord {
        SaleRecord {
            property: PropertyRecord {
                id: id.to_string(),
                address: address.to_string(),
                property_type: PropertyType::Townhouse,
                structure_type: StructureType::Unknown,
                living_area: 1500.0,
                lot_size: 0.0,
                bedrooms: 3,
                bathrooms: 2.0,
                year_built: Some(2001),
                condition: Condition::Average,
                quality: Quality::Average,
                location: GeoPoint::new(44.23, -76.49),
                location_source: LocationSource::Recorded,
                neighborhood: String::new(),
                market_area: "kingston".to_string(),
                feature_tags: BTreeSet::new(),
                defaulted_fields: vec!["structure_type".to_string(), "neighborhood".to_string()],
            },
            sale_price: 450_000.0,
            sale_date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
        }
    }

    #[test]
    fn test_infer_structure_type() {
        let enriched = infer_structure_type(sale("a", "1 Main St", None).property);
        assert_eq!(enriched.structure_type, StructureType::Attached);
        assert!(enriched.defaulted_fields.contains(&"structure_type".to_string()));

        let mut multi = sale("b", "2 Main St", None).property;
        multi.property_type = PropertyType::MultiFamily;
        let enriched = infer_structure_type(multi);
        assert_eq!(enriched.structure_type, StructureType::Unknown);
    }

    #[test]
    fn test_derive_neighborhood() {
        let enriched = derive_neighborhood(sale("a", "1 Main St", None).property);
        assert_eq!(enriched.neighborhood, "kingston");

        let (sales, _) = enrich_all(vec![sale("b", "2 Main St", None)]);
        assert_eq!(sales[0].property.neighborhood, "kingston");
        assert_eq!(sales[0].property.structure_type, StructureType::Attached);
    }

    #[test]
    fn test_dedupe_keeps_most_recent() {
        let sales = vec![
            sale("old", "1 Main St", Some((2023, 1, 5))),
            sale("other", "9 Elm St", Some((2023, 3, 1))),
            sale("new", "1  MAIN st", Some((2024, 2, 1))),
        ];

        let (kept, duplicates) = dedupe_by_address(sales);
        assert_eq!(duplicates, 1);
        let ids: Vec<&str> = kept.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["new", "other"]);
    }

    #[test]
    fn test_dedupe_prefers_complete_record() {
        let mut complete = sale("complete", "1 Main St", Some((2022, 1, 1)));
        complete.property.defaulted_fields.clear();
        let sparse = sale("sparse", "1 Main St", Some((2024, 1, 1)));

        let (kept, _) = dedupe_by_address(vec![complete, sparse]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id(), "complete");
    }

    #[test]
    fn test_blank_addresses_are_not_merged() {
        let (kept, duplicates) = dedupe_by_address(vec![sale("a", "", None), sale("b", " ", None)]);
        assert_eq!(kept.len(), 2);
        assert_eq!(duplicates, 0);
    }
}
