//! Core data types for the ingestion pipeline
//! Pure data structures, with only small derived accessors

use crate::error::{CompError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Days-since-sale value for a sale with no usable date
pub const UNKNOWN_SALE_AGE_DAYS: i64 = 999;

/// Fields counted when computing data completeness
pub const TRACKED_FIELDS: [&str; 11] = [
    "property_type",
    "structure_type",
    "lot_size",
    "bedrooms",
    "bathrooms",
    "year_built",
    "condition",
    "quality",
    "location",
    "neighborhood",
    "feature_tags",
];

/// One loosely-schemaed record as it appears in a dataset file
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Raw dataset contents at each stage of loading - tagged unions
#[derive(Debug)]
pub enum RawData {
    File(PathBuf),
    Json(serde_json::Value),
    Csv(String),
}

impl RawData {
    pub fn as_file_path(&self) -> Result<&PathBuf> {
        match self {
            RawData::File(path) => Ok(path),
            _ => Err(CompError::DatasetUnavailable(format!(
                "expected a file reference, got {}",
                self.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RawData::File(_) => "file",
            RawData::Json(_) => "json",
            RawData::Csv(_) => "csv",
        }
    }
}

/// Property types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyType {
    SingleFamily,
    Townhouse,
    Condo,
    MultiFamily,
    Other,
}

impl std::fmt::Display for PropertyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyType::SingleFamily => write!(f, "single_family"),
            PropertyType::Townhouse => write!(f, "townhouse"),
            PropertyType::Condo => write!(f, "condo"),
            PropertyType::MultiFamily => write!(f, "multi_family"),
            PropertyType::Other => write!(f, "other"),
        }
    }
}

/// Structure types, with a bucket for unrecognised values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureType {
    Detached,
    Attached,
    SemiDetached,
    Unknown,
}

impl std::fmt::Display for StructureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructureType::Detached => write!(f, "detached"),
            StructureType::Attached => write!(f, "attached"),
            StructureType::SemiDetached => write!(f, "semi_detached"),
            StructureType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Physical condition, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Poor,
    Fair,
    Average,
    Good,
    Excellent,
}

impl Condition {
    pub const MAX_ORDINAL: u8 = 4;

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl Default for Condition {
    fn default() -> Self {
        Condition::Average
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Condition::Poor => write!(f, "poor"),
            Condition::Fair => write!(f, "fair"),
            Condition::Average => write!(f, "average"),
            Condition::Good => write!(f, "good"),
            Condition::Excellent => write!(f, "excellent"),
        }
    }
}

/// Construction quality, ordered lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    BelowAverage,
    Average,
    Good,
    Superior,
}

impl Quality {
    pub const MAX_ORDINAL: u8 = 3;

    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Average
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quality::BelowAverage => write!(f, "below_average"),
            Quality::Average => write!(f, "average"),
            Quality::Good => write!(f, "good"),
            Quality::Superior => write!(f, "superior"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        GeoPoint {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Where a record's coordinates came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    Recorded,
    RegionAnchor,
}

/// Canonical property record - subject or candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    // Core identification
    pub id: String,
    pub address: String,

    // Classification
    pub property_type: PropertyType,
    pub structure_type: StructureType,

    // Physical attributes
    pub living_area: f64,
    pub lot_size: f64,
    pub bedrooms: u32,
    pub bathrooms: f64,
    pub year_built: Option<i32>,
    pub condition: Condition,
    pub quality: Quality,

    // Geolocation
    pub location: GeoPoint,
    pub location_source: LocationSource,
    pub neighborhood: String,
    pub market_area: String,

    pub feature_tags: BTreeSet<String>,

    /// Tracked fields that were absent and filled with a default
    pub defaulted_fields: Vec<String>,
}

impl PropertyRecord {
    /// Fraction of tracked fields that carried real data (0.0-1.0)
    pub fn completeness(&self) -> f64 {
        let defaulted = self
            .defaulted_fields
            .iter()
            .filter(|f| TRACKED_FIELDS.contains(&f.as_str()))
            .count();
        1.0 - defaulted as f64 / TRACKED_FIELDS.len() as f64
    }

    /// Lowercased, whitespace-collapsed address used for identity checks
    pub fn address_key(&self) -> String {
        self.address
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

/// A sold property - candidate only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    #[serde(flatten)]
    pub property: PropertyRecord,
    pub sale_price: f64,
    pub sale_date: Option<NaiveDate>,
}

impl SaleRecord {
    pub fn id(&self) -> &str {
        &self.property.id
    }

    /// Whole days between the sale and `as_of`.
    ///
    /// Unknown dates report [`UNKNOWN_SALE_AGE_DAYS`]; a sale after `as_of`
    /// reports a negative value, which the temporal filter rejects.
    pub fn days_since_sale(&self, as_of: NaiveDate) -> i64 {
        match self.sale_date {
            Some(date) => (as_of - date).num_days(),
            None => UNKNOWN_SALE_AGE_DAYS,
        }
    }
}

/// Normalization statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct NormalizeStats {
    pub accepted: usize,
    pub dropped: usize,
    pub duplicates: usize,
    pub anchored_locations: usize,
}

impl std::fmt::Display for NormalizeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accepted: {}, dropped: {}, duplicates: {}, anchored locations: {}",
            self.accepted, self.dropped, self.duplicates, self.anchored_locations
        )
    }
}

/// Artifact write statistics
#[derive(Debug, Default, Clone)]
pub struct WriteStats {
    pub records: usize,
    pub bytes: u64,
}

impl std::fmt::Display for WriteStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "records: {}, bytes: {}", self.records, self.bytes)
    }
}
