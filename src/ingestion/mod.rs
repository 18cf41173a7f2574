//! Data ingestion module - functional pipeline from dataset file to canonical sales

pub mod enrich;
pub mod fetch;
pub mod parse;
pub mod types;
pub mod utils;
pub mod write;

pub use types::*;

use crate::error::Result;
use parse::NormalizeOptions;
use std::path::Path;
use tracing::info;

/// Normalized contents of one dataset file
#[derive(Debug)]
pub struct LoadedDataset {
    pub sales: Vec<SaleRecord>,
    /// Raw subjects from appraisal-shaped files, for offline evaluation
    pub subjects: Vec<RawRecord>,
    pub stats: NormalizeStats,
}

/// Fetch, parse and enrich a dataset file
pub fn load_dataset(path: &Path, options: &NormalizeOptions) -> Result<LoadedDataset> {
    let raw = fetch::fetch_dataset(path)?;
    let contents = fetch::read_dataset(&raw)?;
    let records = fetch::extract_records(&contents)?;

    let (sales, mut stats) = parse::normalize_sales(&records.candidates, options);
    let (sales, duplicates) = enrich::enrich_all(sales);
    stats.duplicates = duplicates;
    stats.accepted = sales.len();

    info!("✓ Loaded dataset {:?} ({})", path, stats);

    Ok(LoadedDataset {
        sales,
        subjects: records.subjects,
        stats,
    })
}

/// Normalize and enrich a subject the same way candidates are
pub fn prepare_subject(raw: &RawRecord, options: &NormalizeOptions) -> Result<PropertyRecord> {
    parse::normalize_property(raw, options).map(enrich::enrich_property)
}
