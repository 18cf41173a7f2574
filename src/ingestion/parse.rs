//! Parse functions - transform raw key-value records into canonical
//! PropertyRecord / SaleRecord structs

use crate::error::{CompError, Result};
use crate::ingestion::types::{
    Condition, GeoPoint, LocationSource, NormalizeStats, PropertyRecord, PropertyType, Quality,
    RawRecord, SaleRecord, StructureType,
};
use crate::ingestion::utils::{self, FieldIndex};
use chrono::{Datelike, Utc};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

const EARLIEST_YEAR_BUILT: i32 = 1800;
const MAX_LOGGED_ERRORS: usize = 10;

/// Options that make normalization deterministic for a deployment
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Coordinate substituted when a record's geocoding is missing or malformed
    pub region_anchor: GeoPoint,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        NormalizeOptions {
            region_anchor: utils::DEFAULT_REGION_ANCHOR,
        }
    }
}

/// Normalize one raw record into a PropertyRecord.
///
/// Missing non-critical fields get documented defaults and are listed in
/// `defaulted_fields`; a missing or non-positive living area is a DataError.
pub fn normalize_property(raw: &RawRecord, options: &NormalizeOptions) -> Result<PropertyRecord> {
    let index = FieldIndex::new(raw);
    parse_property(&index, options)
}

/// Normalize one raw record into a SaleRecord (candidate)
pub fn normalize_sale(raw: &RawRecord, options: &NormalizeOptions) -> Result<SaleRecord> {
    let index = FieldIndex::new(raw);
    let property = parse_property(&index, options)?;

    let sale_price = match index.number(utils::SALE_PRICE_KEYS) {
        Some(price) if price > 0.0 => price,
        _ => {
            return Err(CompError::data(
                &property.id,
                "missing or non-positive sale price",
            ))
        }
    };

    let sale_date = index.text(utils::SALE_DATE_KEYS).and_then(|raw_date| {
        let parsed = utils::parse_sale_date(&raw_date);
        if parsed.is_none() {
            debug!("Unparseable sale date '{}' for {}", raw_date, property.id);
        }
        parsed
    });

    Ok(SaleRecord {
        property,
        sale_price,
        sale_date,
    })
}

/// Normalize a batch of candidate records, dropping (and counting) the ones
/// that cannot become usable SaleRecords
pub fn normalize_sales(
    records: &[RawRecord],
    options: &NormalizeOptions,
) -> (Vec<SaleRecord>, NormalizeStats) {
    let mut sales = Vec::with_capacity(records.len());
    let mut stats = NormalizeStats::default();

    for (idx, raw) in records.iter().enumerate() {
        match normalize_sale(raw, options) {
            Ok(sale) => {
                if sale.property.location_source == LocationSource::RegionAnchor {
                    stats.anchored_locations += 1;
                }
                sales.push(sale);
            }
            Err(e) => {
                stats.dropped += 1;
                if stats.dropped <= MAX_LOGGED_ERRORS {
                    // Only log first 10 errors
                    warn!("Dropping record {}: {}", idx, e);
                }
            }
        }
    }
    stats.accepted = sales.len();

    info!(
        "Normalized {} sale records ({} dropped, {} anchored to region)",
        stats.accepted, stats.dropped, stats.anchored_locations
    );

    (sales, stats)
}

fn parse_property(index: &FieldIndex<'_>, options: &NormalizeOptions) -> Result<PropertyRecord> {
    let mut defaulted = Vec::new();

    let address = index.text(utils::ADDRESS_KEYS).unwrap_or_default();
    let raw_id = index.text(utils::ID_KEYS);
    let label = raw_id
        .clone()
        .or_else(|| (!address.is_empty()).then(|| address.clone()))
        .unwrap_or_else(|| "<unidentified>".to_string());

    let living_area = match index.number(utils::LIVING_AREA_KEYS) {
        Some(area) if area > 0.0 => area,
        _ => return Err(CompError::data(label, "missing or non-positive living area")),
    };

    let (location, location_source) = parse_location(index, options);
    if location_source == LocationSource::RegionAnchor {
        debug!("Anchoring {} to region coordinate", label);
        defaulted.push("location");
    }

    let id = raw_id.unwrap_or_else(|| {
        let recorded = (location_source == LocationSource::Recorded).then_some(location);
        let sale_date = index.text(utils::SALE_DATE_KEYS);
        utils::fallback_id(&address, recorded, sale_date.as_deref())
    });

    let type_text = index.text(utils::PROPERTY_TYPE_KEYS);
    let property_type = match type_text.as_deref() {
        Some(raw) => utils::parse_property_type(raw).unwrap_or_else(|| {
            debug!("Unrecognised property type '{}' for {}", raw, id);
            PropertyType::Other
        }),
        None => {
            defaulted.push("property_type");
            PropertyType::Other
        }
    };

    // Datasets often carry a single "type" column describing both
    let structure_type = match index.text(utils::STRUCTURE_TYPE_KEYS) {
        Some(raw) => utils::parse_structure_type(&raw).unwrap_or(StructureType::Unknown),
        None => match type_text.as_deref().and_then(utils::parse_structure_type) {
            Some(structure) => structure,
            None => {
                defaulted.push("structure_type");
                StructureType::Unknown
            }
        },
    };

    let lot_size = match index.number(utils::LOT_SIZE_KEYS) {
        Some(lot) if lot >= 0.0 => lot,
        _ => {
            defaulted.push("lot_size");
            0.0
        }
    };

    let bedrooms = match index.number(utils::BEDROOM_KEYS) {
        Some(beds) if beds >= 0.0 => beds.round() as u32,
        _ => {
            defaulted.push("bedrooms");
            0
        }
    };

    let bathrooms = match parse_bathrooms(index) {
        Some(baths) => baths,
        None => {
            defaulted.push("bathrooms");
            0.0
        }
    };

    let current_year = Utc::now().year();
    let year_built = index
        .number(utils::YEAR_BUILT_KEYS)
        .map(|year| year.round() as i32)
        .filter(|year| (EARLIEST_YEAR_BUILT..=current_year).contains(year));
    if year_built.is_none() {
        defaulted.push("year_built");
    }

    let condition = match index.text(utils::CONDITION_KEYS).and_then(|c| utils::parse_condition(&c)) {
        Some(condition) => condition,
        None => {
            defaulted.push("condition");
            Condition::default()
        }
    };

    let quality = match index.text(utils::QUALITY_KEYS).and_then(|q| utils::parse_quality(&q)) {
        Some(quality) => quality,
        None => {
            defaulted.push("quality");
            Quality::default()
        }
    };

    let neighborhood = index.text(utils::NEIGHBORHOOD_KEYS).unwrap_or_default();
    if neighborhood.is_empty() {
        defaulted.push("neighborhood");
    }

    let market_area = parse_market_area(index);

    let feature_tags = parse_feature_tags(index);
    if feature_tags.is_empty() && index.get(utils::FEATURE_KEYS).is_none() {
        defaulted.push("feature_tags");
    }

    Ok(PropertyRecord {
        id,
        address,
        property_type,
        structure_type,
        living_area,
        lot_size,
        bedrooms,
        bathrooms,
        year_built,
        condition,
        quality,
        location,
        location_source,
        neighborhood,
        market_area,
        feature_tags,
        defaulted_fields: defaulted.into_iter().map(String::from).collect(),
    })
}

fn parse_location(index: &FieldIndex<'_>, options: &NormalizeOptions) -> (GeoPoint, LocationSource) {
    let lat = index.number(utils::LATITUDE_KEYS);
    let lon = index.number(utils::LONGITUDE_KEYS);

    match (lat, lon) {
        // (0, 0) is a geocoder failure, not a property in the Gulf of Guinea
        (Some(lat), Some(lon)) if !(lat == 0.0 && lon == 0.0) => {
            let point = GeoPoint::new(lat, lon);
            if point.is_valid() {
                (point, LocationSource::Recorded)
            } else {
                (options.region_anchor, LocationSource::RegionAnchor)
            }
        }
        _ => (options.region_anchor, LocationSource::RegionAnchor),
    }
}

/// Bathroom count with half baths as .5, rounded to the nearest half
fn parse_bathrooms(index: &FieldIndex<'_>) -> Option<f64> {
    let total = match index.number(utils::BATHROOM_KEYS) {
        Some(baths) => baths,
        None => {
            let full = index.number(utils::FULL_BATH_KEYS);
            let half = index.number(utils::HALF_BATH_KEYS);
            if full.is_none() && half.is_none() {
                return None;
            }
            full.unwrap_or(0.0) + 0.5 * half.unwrap_or(0.0)
        }
    };

    (total >= 0.0).then(|| (total * 2.0).round() / 2.0)
}

/// City/municipality if present, otherwise the postal-code prefix
fn parse_market_area(index: &FieldIndex<'_>) -> String {
    if let Some(area) = index.text(utils::MARKET_AREA_KEYS) {
        return utils::canonical_text(&area);
    }

    index
        .text(utils::POSTAL_CODE_KEYS)
        .map(|postal| {
            postal
                .chars()
                .filter(|c| c.is_alphanumeric())
                .take(3)
                .collect::<String>()
                .to_lowercase()
        })
        .unwrap_or_default()
}

fn parse_feature_tags(index: &FieldIndex<'_>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    match index.get(utils::FEATURE_KEYS) {
        Some(Value::Array(items)) => {
            tags.extend(
                items
                    .iter()
                    .filter_map(utils::value_as_string)
                    .filter_map(|t| utils::canonical_tag(&t)),
            );
        }
        Some(Value::String(list)) => {
            tags.extend(list.split([',', ';', '|']).filter_map(utils::canonical_tag));
        }
        _ => {}
    }

    if let Some(garage) = index.get(utils::GARAGE_KEYS) {
        let has_garage = match utils::value_as_f64(garage) {
            Some(spaces) => spaces > 0.0,
            None => utils::value_as_string(garage)
                .map(|g| !matches!(utils::canonical_text(&g).as_str(), "none" | "no" | "n a"))
                .unwrap_or(false),
        };
        if has_garage {
            tags.insert("garage".to_string());
        }
    }

    if let Some(basement) = index.text(utils::BASEMENT_KEYS) {
        let basement = utils::canonical_text(&basement);
        if !matches!(basement.as_str(), "none" | "no" | "n a" | "0") {
            tags.insert("basement".to_string());
            if basement.contains("finished") && !basement.contains("unfinished") {
                tags.insert("finished_basement".to_string());
            }
        }
    }

    tags
}
