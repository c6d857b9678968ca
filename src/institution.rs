//! Per-institution strategies for resolving identifiers, grouping series and
//! excluding derived series.
//!
//! Profiles are plain configuration values: a [`InstitutionProfile`] is looked
//! up once per run and handed to the grouper and collator, which never branch
//! on institution names themselves.

use crate::enums::IdentityMatch;
use crate::series::sanitize_key;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("could not resolve subject/study identifiers for {context}")]
    IdentityResolutionFailure { context: String },
}

/// Where the subject and study identifiers of a study come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityRule {
    /// PatientID and AccessionNumber from the DICOM header, falling back to
    /// the archive file name when those are blank.
    #[default]
    Embedded,
    /// `<subject><sep><study>.tgz`, for sources that blank the header fields
    ArchiveFilename,
    /// The header PatientID (spaces removed) is the study identifier and the
    /// folder enclosing the series folder is the subject.
    PatientAsStudy,
}

/// Identifiers as found in a frame header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmbeddedIdentity {
    pub patient_id: Option<String>,
    pub accession_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StudyIdentity {
    pub subject_id: String,
    pub study_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstitutionProfile {
    #[serde(default)]
    pub identity: IdentityRule,

    /// Separator between subject and study in archive file names
    #[serde(default = "default_filename_separator")]
    pub filename_separator: String,

    #[serde(default)]
    pub grouping: IdentityMatch,

    /// Series descriptions containing any of these are never collated
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Header identifiers treated as blank (compared case-insensitively)
    #[serde(default = "default_placeholder_ids")]
    pub placeholder_ids: Vec<String>,
}

fn default_filename_separator() -> String {
    "-".to_string()
}

fn default_placeholder_ids() -> Vec<String> {
    ["ANONYMOUS", "ANON", "UNKNOWN", "NONE", "NULL"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for InstitutionProfile {
    fn default() -> Self {
        Self {
            identity: IdentityRule::default(),
            filename_separator: default_filename_separator(),
            grouping: IdentityMatch::default(),
            exclude: Vec::new(),
            placeholder_ids: default_placeholder_ids(),
        }
    }
}

impl InstitutionProfile {
    pub fn is_excluded(&self, series_description: &str) -> bool {
        self.exclude
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .any(|pattern| series_description.contains(pattern.as_str()))
    }

    pub fn same_series(&self, a: &str, b: &str) -> bool {
        self.grouping.matches(a, b)
    }

    fn usable(&self, value: Option<&str>) -> Option<String> {
        let value = value?.trim();
        if value.is_empty()
            || self
                .placeholder_ids
                .iter()
                .any(|placeholder| placeholder.eq_ignore_ascii_case(value))
        {
            return None;
        }
        Some(value.to_string())
    }

    fn from_archive_name(&self, archive_stem: Option<&str>) -> Option<StudyIdentity> {
        let stem = archive_stem?;
        let (subject, study) = stem.split_once(self.filename_separator.as_str())?;
        // Only the first component after the subject names the study.
        let study = study
            .split(self.filename_separator.as_str())
            .next()
            .unwrap_or(study);
        Some(StudyIdentity {
            subject_id: self.usable(Some(subject))?,
            study_id: self.usable(Some(study))?,
        })
    }

    fn from_header(&self, embedded: &EmbeddedIdentity) -> Option<StudyIdentity> {
        Some(StudyIdentity {
            subject_id: self.usable(embedded.patient_id.as_deref())?,
            study_id: self.usable(embedded.accession_number.as_deref())?,
        })
    }

    fn from_patient_and_folder(
        &self,
        embedded: &EmbeddedIdentity,
        series_folder: &Path,
    ) -> Option<StudyIdentity> {
        let study = self.usable(embedded.patient_id.as_deref())?.replace(' ', "");
        let subject = series_folder
            .parent()
            .and_then(|parent| parent.file_name())
            .and_then(|name| name.to_str());
        Some(StudyIdentity {
            subject_id: self.usable(subject)?,
            study_id: study,
        })
    }

    /// Resolve the owning subject and study for a series.
    ///
    /// Returned identifiers are already safe to use as path components.
    pub fn resolve_identity(
        &self,
        embedded: &EmbeddedIdentity,
        archive_stem: Option<&str>,
        series_folder: &Path,
    ) -> Result<StudyIdentity, IdentityError> {
        let resolved = match self.identity {
            IdentityRule::Embedded => self
                .from_header(embedded)
                .or_else(|| self.from_archive_name(archive_stem)),
            IdentityRule::ArchiveFilename => self
                .from_archive_name(archive_stem)
                .or_else(|| self.from_header(embedded)),
            IdentityRule::PatientAsStudy => self.from_patient_and_folder(embedded, series_folder),
        };

        resolved
            .map(|identity| StudyIdentity {
                subject_id: sanitize_key(&identity.subject_id, "unknown_subject"),
                study_id: sanitize_key(&identity.study_id, "unknown_study"),
            })
            .ok_or_else(|| IdentityError::IdentityResolutionFailure {
                context: format!(
                    "{} (archive {})",
                    series_folder.display(),
                    archive_stem.unwrap_or("<none>")
                ),
            })
    }
}
