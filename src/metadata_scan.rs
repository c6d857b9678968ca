//! Header survey across study archives: one row per series folder, plus an
//! optional series-description frequency table.

use crate::archive::{ArchiveError, archive_stem, extract_archive};
use crate::config::Config;
use crate::grouper::{SeriesGrouper, candidate_folders};
use crate::institution::InstitutionProfile;

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// One sampled series folder
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataRow {
    pub series_description: String,
    pub frame_loc: Option<f64>,
    pub scanner: Option<String>,
    pub field_strength: Option<f64>,
    pub subject: Option<String>,
    pub study: Option<String>,
    pub archive: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesFrequency {
    pub series_description: String,
    pub frequency: usize,
}

/// Sample every series folder of one extracted study
pub fn scan_directory(
    study_root: &Path,
    archive: &str,
    profile: &InstitutionProfile,
    min_frames_per_folder: usize,
) -> Vec<MetadataRow> {
    let folders = match candidate_folders(study_root) {
        Ok(folders) => folders,
        Err(err) => {
            warn!(root = %study_root.display(), error = %err, "cannot list extracted study");
            return Vec::new();
        }
    };
    let grouper = SeriesGrouper::new(profile);
    let stem = archive_stem(archive);

    folders
        .iter()
        .filter_map(|folder| grouper.sample_folder(folder))
        .filter(|sample| {
            let keep = sample.frame_count >= min_frames_per_folder;
            if !keep {
                info!(folder = %sample.folder.display(), "skipped single image series");
            }
            keep
        })
        .map(|sample| {
            let identity = profile
                .resolve_identity(&sample.meta.identity, Some(stem), &sample.folder)
                .map_err(|err| warn!(folder = %sample.folder.display(), error = %err, "no identity"))
                .ok();
            MetadataRow {
                series_description: sample.meta.series_description,
                frame_loc: sample.meta.spatial_key,
                scanner: sample.meta.manufacturer,
                field_strength: sample.meta.field_strength,
                subject: identity.as_ref().map(|i| i.subject_id.clone()),
                study: identity.map(|i| i.study_id),
                archive: archive.to_string(),
            }
        })
        .collect()
}

/// Extract one archive and sample its series folders
pub fn scan_archive(
    root_dir: &Path,
    archive: &str,
    scratch_root: &Path,
    profile: &InstitutionProfile,
    min_frames_per_folder: usize,
) -> Result<Vec<MetadataRow>, ArchiveError> {
    let scratch = extract_archive(root_dir.join(archive), scratch_root)?;
    let rows = scan_directory(scratch.path(), archive, profile, min_frames_per_folder);
    if let Err(err) = scratch.cleanup() {
        warn!(archive = %archive, error = %err, "failed to purge scratch directory");
    }
    info!(archive = %archive, series = rows.len(), "scanned archive");
    Ok(rows)
}

/// Scan every archive on a pool of `processing.workers` threads.
///
/// Archives that cannot be extracted are logged and contribute no rows.
pub fn scan_studies(config: &Config, archives: &[String]) -> Result<Vec<MetadataRow>> {
    let profile = config.profile();
    let processing = &config.processing;
    std::fs::create_dir_all(&processing.scratch_dir)?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(processing.workers)
        .thread_name(|index| format!("scan-worker-{index}"))
        .build()?;

    let per_archive: Vec<Vec<MetadataRow>> = pool.install(|| {
        archives
            .par_iter()
            .map(|archive| {
                scan_archive(
                    &config.input.root_dir,
                    archive,
                    &processing.scratch_dir,
                    &profile,
                    processing.min_frames_per_folder,
                )
                .unwrap_or_else(|err| {
                    warn!(archive = %archive, error = %err, "skipping archive");
                    Vec::new()
                })
            })
            .collect()
    });
    Ok(per_archive.into_iter().flatten().collect())
}

/// Series descriptions by how often they occur, most frequent first
pub fn frequency_table(rows: &[MetadataRow]) -> Vec<SeriesFrequency> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for row in rows {
        *counts.entry(row.series_description.as_str()).or_default() += 1;
    }
    let mut table: Vec<_> = counts
        .into_iter()
        .map(|(series_description, frequency)| SeriesFrequency {
            series_description: series_description.to_string(),
            frequency,
        })
        .collect();
    table.sort_by(|a, b| b.frequency.cmp(&a.frequency));
    table
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("cannot create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write `<institution>_metadata.csv` (and with `summarize`,
/// `<institution>_metadata_freq.csv`) into `output_dir`. Returns the paths
/// written.
pub fn write_scan_outputs(
    output_dir: &Path,
    institution: &str,
    rows: &[MetadataRow],
    summarize: bool,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)?;
    let metadata_path = output_dir.join(format!("{institution}_metadata.csv"));
    write_csv(&metadata_path, rows)?;
    let mut written = vec![metadata_path];

    if summarize {
        let freq_path = output_dir.join(format!("{institution}_metadata_freq.csv"));
        write_csv(&freq_path, &frequency_table(rows))?;
        written.push(freq_path);
    }
    Ok(written)
}
