//! Write functions - persist JSON artifacts so readers never see a partial file

use crate::error::{CompError, Result};
use crate::ingestion::types::WriteStats;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Serialize `value` to `path` via a sibling temp file and a rename
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T, records: usize) -> Result<WriteStats> {
    info!("Writing {} records to {:?}", records, path);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec(value)?;
    let temp_path = temp_path_for(path)?;

    let written = (|| -> Result<()> {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    if let Err(e) = written {
        // Leave the previous artifact untouched
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    let stats = WriteStats {
        records,
        bytes: bytes.len() as u64,
    };
    info!("Write complete: {}", stats);
    Ok(stats)
}

/// Read a JSON artifact written by [`write_json_atomic`]
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!("Reading artifact {:?}", path);
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CompError::Configuration(format!("invalid artifact path {:?}", path)))?;
    Ok(path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("artifact.json");

        let mut value = BTreeMap::new();
        value.insert("alpha".to_string(), 1.5);
        value.insert("beta".to_string(), -2.0);

        let stats = write_json_atomic(&path, &value, 2).unwrap();
        assert_eq!(stats.records, 2);
        assert!(stats.bytes > 0);

        let loaded: BTreeMap<String, f64> = read_json(&path).unwrap();
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("artifact.json");
        write_json_atomic(&path, &vec![1, 2, 3], 3).unwrap();

        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("artifact.json");
        write_json_atomic(&path, &vec![1], 1).unwrap();
        write_json_atomic(&path, &vec![4, 5], 2).unwrap();

        let loaded: Vec<i32> = read_json(&path).unwrap();
        assert_eq!(loaded, vec![4, 5]);
    }
}
