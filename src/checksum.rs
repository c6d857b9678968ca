//! Content hashes over stored series, for run-to-run reproducibility checks.
//!
//! The hash covers the decoded array (shape, then little-endian `f32`
//! values in C order), so it is independent of the compressor used.

use crate::store::{StoreError, StudyContainer};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// One row of a checksum CSV
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesChecksum {
    /// Container path relative to the output directory, `/`-separated
    pub container: String,
    pub series: String,
    pub checksum: String,
}

/// A series whose checksum differs from the reference, or that only one
/// side has
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub container: String,
    pub series: String,
    pub expected: Option<String>,
    pub found: Option<String>,
}

fn relative_key(output_dir: &Path, container: &Path) -> String {
    let relative = container.strip_prefix(output_dir).unwrap_or(container);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Hash one series array
pub fn series_checksum(container: &StudyContainer, series: &str) -> Result<String, StoreError> {
    let data = container.read_series(series)?;
    let mut hasher = blake3::Hasher::new();
    for dim in data.shape() {
        hasher.update(&(*dim as u64).to_le_bytes());
    }
    for value in data.iter() {
        hasher.update(&value.to_le_bytes());
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Checksums for every series of every container below `output_dir`,
/// sorted by container then series name
pub fn generate_checksums(output_dir: &Path) -> Result<Vec<SeriesChecksum>, ChecksumError> {
    let mut rows = Vec::new();
    for container in StudyContainer::find_all(output_dir)? {
        let key = relative_key(output_dir, container.path());
        for series in container.list_entries()? {
            let checksum = series_checksum(&container, &series)?;
            debug!(container = %key, series = %series, checksum = %checksum, "hashed series");
            rows.push(SeriesChecksum {
                container: key.clone(),
                series,
                checksum,
            });
        }
    }
    rows.sort();
    info!(series = rows.len(), "generated checksums");
    Ok(rows)
}

pub fn write_checksums(path: &Path, rows: &[SeriesChecksum]) -> Result<(), ChecksumError> {
    let csv_error = |source| ChecksumError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
    for row in rows {
        writer.serialize(row).map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_checksums(path: &Path) -> Result<Vec<SeriesChecksum>, ChecksumError> {
    let csv_error = |source| ChecksumError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    reader
        .deserialize()
        .collect::<Result<Vec<SeriesChecksum>, _>>()
        .map_err(csv_error)
}

/// Differences between a fresh checksum set and a reference set
pub fn compare_checksums(
    found: &[SeriesChecksum],
    reference: &[SeriesChecksum],
) -> Vec<ChecksumMismatch> {
    let index = |rows: &[SeriesChecksum]| -> BTreeMap<(String, String), String> {
        rows.iter()
            .map(|row| {
                (
                    (row.container.clone(), row.series.clone()),
                    row.checksum.clone(),
                )
            })
            .collect()
    };
    let found = index(found);
    let expected = index(reference);

    let mut keys: Vec<_> = found.keys().chain(expected.keys()).cloned().collect();
    keys.sort();
    keys.dedup();

    let mismatches: Vec<_> = keys
        .into_iter()
        .filter_map(|key| {
            let (a, b) = (expected.get(&key), found.get(&key));
            (a != b).then(|| ChecksumMismatch {
                container: key.0,
                series: key.1,
                expected: a.cloned(),
                found: b.cloned(),
            })
        })
        .collect();

    for mismatch in &mismatches {
        warn!(
            container = %mismatch.container,
            series = %mismatch.series,
            expected = ?mismatch.expected,
            found = ?mismatch.found,
            "checksum mismatch"
        );
    }
    mismatches
}
