//! Per-study outcomes and the failed-studies audit report.

use crate::enums::PipelineStage;
use crate::store::{StoreError, StudyContainer};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// File written into the output directory after every run
pub const FAILED_STUDIES_FILE: &str = "failed_to_process.csv";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A series group that produced no entry, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSeries {
    pub series: String,
    pub reason: String,
}

/// Outcome of one study run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyReport {
    pub archive: String,
    pub stage: PipelineStage,
    pub written: Vec<String>,
    pub duplicates: Vec<String>,
    pub skipped: Vec<SkippedSeries>,
    pub error: Option<String>,
}

impl StudyReport {
    pub fn new(archive: impl Into<String>) -> Self {
        Self {
            archive: archive.into(),
            stage: PipelineStage::Pending,
            written: Vec::new(),
            duplicates: Vec::new(),
            skipped: Vec::new(),
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl ToString) {
        self.stage = PipelineStage::Failed;
        self.error = Some(error.to_string());
    }

    /// At least one series of this study is present in its container
    pub fn produced_output(&self) -> bool {
        !self.written.is_empty() || !self.duplicates.is_empty()
    }
}

/// Collected outcomes of a run, in dispatch order
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<StudyReport>,
}

impl RunSummary {
    /// Archives that produced no output, sorted
    pub fn failed_studies(&self) -> Vec<String> {
        let failed: BTreeSet<_> = self
            .reports
            .iter()
            .filter(|report| !report.produced_output())
            .map(|report| report.archive.clone())
            .collect();
        failed.into_iter().collect()
    }

    pub fn series_written(&self) -> usize {
        self.reports.iter().map(|r| r.written.len()).sum()
    }

    pub fn series_skipped(&self) -> usize {
        self.reports.iter().map(|r| r.skipped.len()).sum()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FilenameRow {
    filenames: String,
}

/// Write a one-column (`filenames`) CSV
pub fn write_filename_list(path: &Path, filenames: &[String]) -> Result<(), ReportError> {
    let csv_error = |source| ReportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    // Header written by hand so an empty list still has its column.
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_error)?;
    writer.write_record(["filenames"]).map_err(csv_error)?;
    for filename in filenames {
        writer
            .serialize(FilenameRow {
                filenames: filename.clone(),
            })
            .map_err(csv_error)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read the `filenames` column of a CSV (safelists and failure reports)
pub fn read_filename_list(path: &Path) -> Result<Vec<String>, ReportError> {
    let csv_error = |source| ReportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error)?;
    let mut filenames = Vec::new();
    for row in reader.deserialize::<FilenameRow>() {
        let row = row.map_err(csv_error)?;
        let name = row.filenames.trim();
        if !name.is_empty() {
            filenames.push(name.to_string());
        }
    }
    Ok(filenames)
}

/// Archives from `inputs` that no container in `output_dir` lists as a
/// source, sorted
pub fn audit_output(inputs: &[String], output_dir: &Path) -> Result<Vec<String>, ReportError> {
    let mut processed = BTreeSet::new();
    if output_dir.is_dir() {
        for container in StudyContainer::find_all(output_dir)? {
            if container.list_entries()?.is_empty() {
                continue;
            }
            processed.extend(container.attributes()?.source_archives);
        }
    }
    let missing: BTreeSet<_> = inputs
        .iter()
        .filter(|input| !processed.contains(*input))
        .cloned()
        .collect();
    Ok(missing.into_iter().collect())
}
