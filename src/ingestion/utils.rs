//! Utility functions for common operations: field synonyms, value cleaning,
//! free-text lookups

use crate::ingestion::types::{
    Condition, GeoPoint, PropertyType, Quality, RawRecord, StructureType,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Deterministic coordinate used when a record's geocoding is unusable
/// (Kingston, Ontario - the market the historical dataset covers)
pub const DEFAULT_REGION_ANCHOR: GeoPoint = GeoPoint {
    latitude: 44.2312,
    longitude: -76.4860,
};

pub const ID_KEYS: &[&str] = &["id", "property_id", "identifier", "uid", "mls_number"];
pub const ADDRESS_KEYS: &[&str] = &["address", "full_address", "street_address"];
pub const PROPERTY_TYPE_KEYS: &[&str] = &["property_type", "prop_type", "type", "style"];
pub const STRUCTURE_TYPE_KEYS: &[&str] =
    &["structure_type", "structure", "building_type", "attachment"];
pub const LIVING_AREA_KEYS: &[&str] = &[
    "living_area",
    "gla",
    "gla_sqft",
    "gross_living_area",
    "sq_ft",
    "sqft",
    "square_feet",
    "living_area_sqft",
];
pub const LOT_SIZE_KEYS: &[&str] = &["lot_size", "lot_size_sqft", "lot_sqft", "lot_area"];
pub const BEDROOM_KEYS: &[&str] = &["bedrooms", "bedroom_count", "beds", "num_bedrooms"];
pub const BATHROOM_KEYS: &[&str] = &["bathrooms", "bathroom_count", "baths", "num_baths"];
pub const FULL_BATH_KEYS: &[&str] = &["full_baths", "full_bathrooms"];
pub const HALF_BATH_KEYS: &[&str] = &["half_baths", "half_bathrooms"];
pub const YEAR_BUILT_KEYS: &[&str] = &["year_built", "yr_built", "built_year"];
pub const CONDITION_KEYS: &[&str] = &["condition", "overall_condition", "cond"];
pub const QUALITY_KEYS: &[&str] = &["quality", "construction_quality", "qual"];
pub const LATITUDE_KEYS: &[&str] = &["latitude", "lat"];
pub const LONGITUDE_KEYS: &[&str] = &["longitude", "lng", "lon", "long"];
pub const NEIGHBORHOOD_KEYS: &[&str] = &["neighborhood", "neighbourhood", "subdivision", "community"];
pub const MARKET_AREA_KEYS: &[&str] = &["city", "municipality", "market_area", "district"];
pub const POSTAL_CODE_KEYS: &[&str] = &["postal_code", "postcode", "zip", "zip_code"];
pub const FEATURE_KEYS: &[&str] = &["features", "feature_tags", "amenities"];
pub const GARAGE_KEYS: &[&str] = &["garage_spaces", "garage", "parking_spaces"];
pub const BASEMENT_KEYS: &[&str] = &["basement", "basement_type"];
pub const SALE_PRICE_KEYS: &[&str] = &["sale_price", "close_price", "sold_price", "price"];
pub const SALE_DATE_KEYS: &[&str] = &["sale_date", "close_date", "sold_date", "settlement_date"];

const PROPERTY_TYPE_SYNONYMS: &[(&str, PropertyType)] = &[
    ("single family", PropertyType::SingleFamily),
    ("single family residence", PropertyType::SingleFamily),
    ("single family residential", PropertyType::SingleFamily),
    ("singlefamily", PropertyType::SingleFamily),
    ("sfr", PropertyType::SingleFamily),
    ("sfh", PropertyType::SingleFamily),
    ("house", PropertyType::SingleFamily),
    ("detached", PropertyType::SingleFamily),
    ("semi detached", PropertyType::SingleFamily),
    ("bungalow", PropertyType::SingleFamily),
    ("1 storey", PropertyType::SingleFamily),
    ("1 5 storey", PropertyType::SingleFamily),
    ("2 storey", PropertyType::SingleFamily),
    ("sidesplit", PropertyType::SingleFamily),
    ("backsplit", PropertyType::SingleFamily),
    ("townhouse", PropertyType::Townhouse),
    ("town house", PropertyType::Townhouse),
    ("townhome", PropertyType::Townhouse),
    ("row house", PropertyType::Townhouse),
    ("rowhouse", PropertyType::Townhouse),
    ("freehold townhouse", PropertyType::Townhouse),
    ("att row twnhouse", PropertyType::Townhouse),
    ("terrace", PropertyType::Townhouse),
    ("condo", PropertyType::Condo),
    ("condominium", PropertyType::Condo),
    ("condo apartment", PropertyType::Condo),
    ("condo apt", PropertyType::Condo),
    ("condo townhouse", PropertyType::Condo),
    ("apartment", PropertyType::Condo),
    ("unit", PropertyType::Condo),
    ("multi family", PropertyType::MultiFamily),
    ("multifamily", PropertyType::MultiFamily),
    ("multiplex", PropertyType::MultiFamily),
    ("duplex", PropertyType::MultiFamily),
    ("triplex", PropertyType::MultiFamily),
    ("fourplex", PropertyType::MultiFamily),
    ("other", PropertyType::Other),
];

const STRUCTURE_TYPE_SYNONYMS: &[(&str, StructureType)] = &[
    ("detached", StructureType::Detached),
    ("single family", StructureType::Detached),
    ("house", StructureType::Detached),
    ("bungalow", StructureType::Detached),
    ("attached", StructureType::Attached),
    ("townhouse", StructureType::Attached),
    ("row house", StructureType::Attached),
    ("rowhouse", StructureType::Attached),
    ("att row twnhouse", StructureType::Attached),
    ("condo", StructureType::Attached),
    ("condo apartment", StructureType::Attached),
    ("apartment", StructureType::Attached),
    ("link", StructureType::Attached),
    ("semi detached", StructureType::SemiDetached),
    ("semidetached", StructureType::SemiDetached),
    ("semi", StructureType::SemiDetached),
    ("duplex", StructureType::SemiDetached),
];

const CONDITION_SYNONYMS: &[(&str, Condition)] = &[
    ("poor", Condition::Poor),
    ("c6", Condition::Poor),
    ("fair", Condition::Fair),
    ("c5", Condition::Fair),
    ("average", Condition::Average),
    ("avg", Condition::Average),
    ("c4", Condition::Average),
    ("good", Condition::Good),
    ("c3", Condition::Good),
    ("excellent", Condition::Excellent),
    ("c2", Condition::Excellent),
    ("c1", Condition::Excellent),
];

const QUALITY_SYNONYMS: &[(&str, Quality)] = &[
    ("below average", Quality::BelowAverage),
    ("economy", Quality::BelowAverage),
    ("low", Quality::BelowAverage),
    ("q6", Quality::BelowAverage),
    ("q5", Quality::BelowAverage),
    ("average", Quality::Average),
    ("avg", Quality::Average),
    ("standard", Quality::Average),
    ("q4", Quality::Average),
    ("good", Quality::Good),
    ("above average", Quality::Good),
    ("q3", Quality::Good),
    ("superior", Quality::Superior),
    ("excellent", Quality::Superior),
    ("luxury", Quality::Superior),
    ("custom", Quality::Superior),
    ("q2", Quality::Superior),
    ("q1", Quality::Superior),
];

/// Canonical form of a field name: "GLA (sq ft)" -> "gla_sq_ft"
pub fn canonical_key(key: &str) -> String {
    canonical_text(key).replace(' ', "_")
}

/// Canonical form of free text: lowercase, punctuation to spaces, collapsed
pub fn canonical_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case- and punctuation-insensitive view over a raw record's fields
pub struct FieldIndex<'a> {
    fields: HashMap<String, &'a Value>,
}

impl<'a> FieldIndex<'a> {
    pub fn new(record: &'a RawRecord) -> Self {
        let fields = record
            .iter()
            .filter(|(_, value)| !is_blank(value))
            .map(|(key, value)| (canonical_key(key), value))
            .collect();
        FieldIndex { fields }
    }

    /// First non-blank value among the synonym keys, in synonym order
    pub fn get(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|key| self.fields.get(*key).copied())
    }

    pub fn number(&self, keys: &[&str]) -> Option<f64> {
        self.get(keys).and_then(value_as_f64)
    }

    pub fn text(&self, keys: &[&str]) -> Option<String> {
        self.get(keys).and_then(value_as_string)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Numeric value of a JSON number or a numeric-looking string
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => clean_numeric(s),
        _ => None,
    }
}

pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse "$1,250,000" or "1,850 sqft" style strings (remove $ and commas,
/// keep the leading numeric run)
pub fn clean_numeric(raw: &str) -> Option<f64> {
    let cleaned = raw.replace(['$', ','], "");
    let numeric: String = cleaned
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    numeric.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse sale dates in the formats seen across dataset exports
pub fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.date());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }

    const FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%b %d, %Y", "%B %d, %Y"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

fn lookup<T: Copy>(table: &[(&str, T)], raw: &str) -> Option<T> {
    let key = canonical_text(raw);
    table
        .iter()
        .find(|(synonym, _)| *synonym == key)
        .map(|(_, value)| *value)
}

/// Exact synonym lookup; `None` means the caller should use the fallback bucket
pub fn parse_property_type(raw: &str) -> Option<PropertyType> {
    lookup(PROPERTY_TYPE_SYNONYMS, raw)
}

pub fn parse_structure_type(raw: &str) -> Option<StructureType> {
    lookup(STRUCTURE_TYPE_SYNONYMS, raw)
}

/// Condition from a label, a UAD code (C1-C6) or a 1-5 score
pub fn parse_condition(raw: &str) -> Option<Condition> {
    if let Some(condition) = lookup(CONDITION_SYNONYMS, raw) {
        return Some(condition);
    }
    match raw.trim().parse::<u8>().ok()? {
        1 => Some(Condition::Poor),
        2 => Some(Condition::Fair),
        3 => Some(Condition::Average),
        4 => Some(Condition::Good),
        5 => Some(Condition::Excellent),
        _ => None,
    }
}

pub fn parse_quality(raw: &str) -> Option<Quality> {
    lookup(QUALITY_SYNONYMS, raw)
}

/// Feature tag in canonical form: "Finished Basement" -> "finished_basement"
pub fn canonical_tag(raw: &str) -> Option<String> {
    let tag = canonical_key(raw);
    (!tag.is_empty()).then_some(tag)
}

/// Stable identifier for records that arrive without one
pub fn fallback_id(address: &str, location: Option<GeoPoint>, sale_date: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_text(address).as_bytes());
    if let Some(point) = location {
        hasher.update(format!("|{:.6}|{:.6}", point.latitude, point.longitude).as_bytes());
    }
    if let Some(date) = sale_date {
        hasher.update(format!("|{}", date.trim()).as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("prop_{}", &digest[..16])
}
