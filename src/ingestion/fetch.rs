//! Fetch functions - read dataset files and split them into raw records

use crate::error::{CompError, Result};
use crate::ingestion::types::{RawData, RawRecord};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Top-level keys that hold a flat list of sold properties
const CANDIDATE_LIST_KEYS: [&str; 4] = ["properties", "candidates", "sales", "candidate_properties"];

/// Per-appraisal keys that hold sold properties
const APPRAISAL_CANDIDATE_KEYS: [&str; 5] = [
    "properties",
    "candidate_properties",
    "candidates",
    "comps",
    "selected_comps",
];

const APPRAISAL_SUBJECT_KEYS: [&str; 2] = ["subject", "subject_property"];

/// Raw records split out of a dataset file
#[derive(Debug, Default)]
pub struct DatasetRecords {
    pub candidates: Vec<RawRecord>,
    /// Subjects carried by appraisal-shaped datasets, in file order
    pub subjects: Vec<RawRecord>,
}

/// Reference a dataset file on disk
pub fn fetch_dataset(path: &Path) -> Result<RawData> {
    if !path.is_file() {
        return Err(CompError::DatasetUnavailable(format!(
            "{} does not exist or is not a file",
            path.display()
        )));
    }
    info!("Fetching dataset from {:?}", path);
    Ok(RawData::File(path.to_path_buf()))
}

/// Read a referenced file into JSON or CSV text, by extension
pub fn read_dataset(raw: &RawData) -> Result<RawData> {
    let path = raw.as_file_path()?;
    let text = fs::read_to_string(path)?;

    let is_csv = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);

    if is_csv {
        Ok(RawData::Csv(text))
    } else {
        Ok(RawData::Json(serde_json::from_str(&text)?))
    }
}

/// Split loaded contents into candidate (and subject) records
pub fn extract_records(raw: &RawData) -> Result<DatasetRecords> {
    let records = match raw {
        RawData::Json(json) => extract_json(json)?,
        RawData::Csv(text) => DatasetRecords {
            candidates: extract_csv(text)?,
            subjects: Vec::new(),
        },
        RawData::File(path) => {
            return Err(CompError::DatasetUnavailable(format!(
                "{} has not been read yet",
                path.display()
            )))
        }
    };

    info!(
        "✓ Extracted {} candidate records and {} subjects",
        records.candidates.len(),
        records.subjects.len()
    );
    Ok(records)
}

fn extract_json(json: &Value) -> Result<DatasetRecords> {
    match json {
        Value::Array(items) => Ok(DatasetRecords {
            candidates: objects(items),
            subjects: Vec::new(),
        }),
        Value::Object(map) => {
            if let Some(Value::Array(appraisals)) = map.get("appraisals") {
                return Ok(extract_appraisals(appraisals));
            }

            CANDIDATE_LIST_KEYS
                .iter()
                .find_map(|key| match map.get(*key) {
                    Some(Value::Array(items)) => Some(DatasetRecords {
                        candidates: objects(items),
                        subjects: Vec::new(),
                    }),
                    _ => None,
                })
                .ok_or_else(|| {
                    CompError::DatasetUnavailable(
                        "JSON object has no appraisals or property list".to_string(),
                    )
                })
        }
        _ => Err(CompError::DatasetUnavailable(
            "dataset must be a JSON array or object".to_string(),
        )),
    }
}

fn extract_appraisals(appraisals: &[Value]) -> DatasetRecords {
    let mut records = DatasetRecords::default();

    for (idx, appraisal) in appraisals.iter().enumerate() {
        let Some(appraisal) = appraisal.as_object() else {
            warn!("Skipping appraisal {}: not an object", idx);
            continue;
        };

        if let Some(subject) = APPRAISAL_SUBJECT_KEYS
            .iter()
            .find_map(|key| appraisal.get(*key).and_then(Value::as_object))
        {
            records.subjects.push(subject.clone());
        }

        for key in APPRAISAL_CANDIDATE_KEYS {
            if let Some(Value::Array(items)) = appraisal.get(key) {
                records.candidates.extend(objects(items));
            }
        }
    }

    debug!("Read {} appraisals", appraisals.len());
    records
}

fn objects(items: &[Value]) -> Vec<RawRecord> {
    let records: Vec<RawRecord> = items.iter().filter_map(|v| v.as_object().cloned()).collect();
    if records.len() < items.len() {
        warn!("Skipped {} non-object entries", items.len() - records.len());
    }
    records
}

/// Parse CSV text with a header row; every cell becomes a string value
fn extract_csv(text: &str) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();
        records.push(record);
    }

    Ok(records)
}
