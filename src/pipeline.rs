//! Drives one study from archive to study container.
//!
//! `Pending -> Extracted -> Grouped -> Collating* -> CleanedUp -> Done`, or
//! `Failed` when the archive cannot be extracted. Series-level failures are
//! recorded on the report and never abort the study.

use crate::archive::{archive_stem, extract_archive};
use crate::config::Config;
use crate::enums::PipelineStage;
use crate::frame::FrameReader;
use crate::grouper::{SeriesGroup, SeriesGrouper, candidate_folders};
use crate::institution::InstitutionProfile;
use crate::normalizer::{NormalizeError, SpatialNormalizer};
use crate::report::{SkippedSeries, StudyReport};
use crate::series::sanitize_series_name;
use crate::series_collator::{CollateError, SeriesCollator};
use crate::store::{SeriesStoreWriter, StoreError, WriteOutcome};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, info_span, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid normalizer settings: {0}")]
    Normalizer(#[from] NormalizeError),

    #[error("invalid store settings: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
enum SeriesError {
    #[error(transparent)]
    Collate(#[from] CollateError),

    #[error("normalization failed: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("write failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct StudyPipeline {
    root_dir: PathBuf,
    scratch_dir: PathBuf,
    profile: InstitutionProfile,
    reader: FrameReader,
    normalizer: SpatialNormalizer,
    writer: SeriesStoreWriter,
    max_stack_slices: usize,
    min_frames_per_folder: usize,
}

impl StudyPipeline {
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let processing = &config.processing;
        Ok(Self {
            root_dir: config.input.root_dir.clone(),
            scratch_dir: processing.scratch_dir.clone(),
            profile: config.profile(),
            reader: FrameReader::new(processing.channels),
            normalizer: SpatialNormalizer::new(processing.frame_size, processing.crop_fraction)?,
            writer: SeriesStoreWriter::new(
                &config.output.output_dir,
                &config.institution,
                config.output.compression,
                config.output.compression_level,
            )?,
            max_stack_slices: processing.max_stack_slices,
            min_frames_per_folder: processing.min_frames_per_folder,
        })
    }

    fn transition(report: &mut StudyReport, stage: PipelineStage) {
        info!(archive = %report.archive, from = %report.stage, to = %stage, "study stage");
        report.stage = stage;
    }

    /// Process one archive (a file name below the input root) end to end
    pub fn process(&self, archive: &str) -> StudyReport {
        let _span = info_span!("study", archive = %archive).entered();
        let mut report = StudyReport::new(archive);

        let scratch = match extract_archive(self.root_dir.join(archive), &self.scratch_dir) {
            Ok(scratch) => scratch,
            Err(err) => {
                error!(archive = %archive, error = %err, "study failed");
                report.fail(err);
                return report;
            }
        };
        Self::transition(&mut report, PipelineStage::Extracted);

        self.process_extracted(scratch.path(), &mut report);

        match scratch.cleanup() {
            Ok(()) => {}
            Err(err) => warn!(archive = %archive, error = %err, "failed to purge scratch directory"),
        }
        Self::transition(&mut report, PipelineStage::CleanedUp);

        if report.produced_output() {
            info!(archive = %archive, written = report.written.len(), skipped = report.skipped.len(), "completed study");
        } else {
            warn!(archive = %archive, skipped = report.skipped.len(), "study produced no output");
        }
        Self::transition(&mut report, PipelineStage::Done);
        report
    }

    /// Group, collate, normalize and write every series below an extracted
    /// study directory
    pub fn process_extracted(&self, study_root: &Path, report: &mut StudyReport) {
        let folders = match candidate_folders(study_root) {
            Ok(folders) => folders,
            Err(err) => {
                error!(root = %study_root.display(), error = %err, "cannot list extracted study");
                report.error = Some(err.to_string());
                return;
            }
        };

        let grouper = SeriesGrouper::new(&self.profile)
            .with_max_stack_slices(self.max_stack_slices)
            .with_min_frames_per_folder(self.min_frames_per_folder);
        let groups = grouper.group(&folders);
        Self::transition(report, PipelineStage::Grouped);
        info!(folders = folders.len(), groups = groups.len(), "grouped series folders");

        let stem = archive_stem(&report.archive).to_string();
        let collator = SeriesCollator::new(self.reader.clone(), &self.profile).with_archive_stem(&stem);

        for group in &groups {
            Self::transition(report, PipelineStage::Collating);
            let name = sanitize_series_name(&group.series_description);
            match self.process_group(&collator, group, &report.archive) {
                Ok(WriteOutcome::Written) => report.written.push(name),
                Ok(WriteOutcome::DuplicateSeries) => report.duplicates.push(name),
                Err(err) => {
                    warn!(series = %group.series_description, error = %err, "skipping series");
                    report.skipped.push(SkippedSeries {
                        series: name,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn process_group(
        &self,
        collator: &SeriesCollator<'_>,
        group: &SeriesGroup,
        archive: &str,
    ) -> Result<WriteOutcome, SeriesError> {
        let identity = collator.resolve_identity(group)?;
        let name = sanitize_series_name(&group.series_description);
        if self.writer.has_series(&identity, &name) {
            info!(series = %name, "series already exists, skipping collation");
            return Ok(WriteOutcome::DuplicateSeries);
        }

        let series = collator.collate(group)?;
        let series = self.normalizer.normalize(series)?;
        info!(
            series = %series.series_name,
            frames = series.total_frame_count(),
            slices = series.slice_boundaries.len() + 1,
            "exporting series"
        );
        Ok(self.writer.write(&series, archive)?)
    }
}
