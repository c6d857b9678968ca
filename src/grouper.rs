//! Partition the series folders of one extracted study into series groups.

use crate::frame::{FrameMetadata, FrameReader, list_frame_files};
use crate::institution::InstitutionProfile;

use std::{
    cmp::Ordering,
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_MAX_STACK_SLICES: usize = 10;
pub const DEFAULT_MIN_FRAMES_PER_FOLDER: usize = 2;

/// Header of the first frame of a folder, standing in for the whole folder
#[derive(Debug, Clone)]
pub struct FolderSample {
    pub folder: PathBuf,
    pub representative: PathBuf,
    pub frame_count: usize,
    pub meta: FrameMetadata,
}

/// Folders believed to hold one logical series
#[derive(Debug, Clone)]
pub struct SeriesGroup {
    pub series_description: String,
    pub folders: Vec<FolderSample>,
}

impl SeriesGroup {
    /// Multi-folder groups are collated as a multi-slice stack
    pub fn is_stacked(&self) -> bool {
        self.folders.len() > 1
    }

    pub fn folder_paths(&self) -> impl Iterator<Item = &Path> {
        self.folders.iter().map(|sample| sample.folder.as_path())
    }
}

#[derive(Debug, Clone)]
pub struct SeriesGrouper<'a> {
    profile: &'a InstitutionProfile,
    reader: FrameReader,
    max_stack_slices: usize,
    min_frames_per_folder: usize,
}

/// Every directory below `root` that directly contains at least one file,
/// in path order.
pub fn candidate_folders(root: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let mut folders = Vec::new();
    for entry in WalkDir::new(root.as_ref()).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        if !list_frame_files(entry.path())?.is_empty() {
            folders.push(entry.into_path());
        }
    }
    folders.sort();
    Ok(folders)
}

impl<'a> SeriesGrouper<'a> {
    pub fn new(profile: &'a InstitutionProfile) -> Self {
        Self {
            profile,
            reader: FrameReader::default(),
            max_stack_slices: DEFAULT_MAX_STACK_SLICES,
            min_frames_per_folder: DEFAULT_MIN_FRAMES_PER_FOLDER,
        }
    }

    pub fn with_max_stack_slices(mut self, max_stack_slices: usize) -> Self {
        self.max_stack_slices = max_stack_slices.max(1);
        self
    }

    pub fn with_min_frames_per_folder(mut self, min_frames_per_folder: usize) -> Self {
        self.min_frames_per_folder = min_frames_per_folder;
        self
    }

    /// Read the header of the first frame of a folder.
    ///
    /// Returns `None` (after logging) for empty folders and folders whose
    /// representative frame cannot be read.
    pub fn sample_folder(&self, folder: &Path) -> Option<FolderSample> {
        let files = match list_frame_files(folder) {
            Ok(files) => files,
            Err(err) => {
                warn!(folder = %folder.display(), error = %err, "cannot list series folder");
                return None;
            }
        };
        let representative = files.first()?.clone();
        match self.reader.read_metadata(&representative) {
            Ok(meta) => Some(FolderSample {
                folder: folder.to_path_buf(),
                representative,
                frame_count: files.len(),
                meta,
            }),
            Err(err) => {
                warn!(folder = %folder.display(), error = %err, "dropping folder with unreadable representative frame");
                None
            }
        }
    }

    /// Partition folders into series groups.
    ///
    /// The result depends only on the set of folders, not on their order.
    pub fn group(&self, folders: &[PathBuf]) -> Vec<SeriesGroup> {
        let mut folders = folders.to_vec();
        folders.sort();
        folders.dedup();

        let mut groups: Vec<SeriesGroup> = Vec::new();
        for folder in &folders {
            let Some(sample) = self.sample_folder(folder) else {
                continue;
            };
            if sample.frame_count < self.min_frames_per_folder {
                info!(folder = %folder.display(), frames = sample.frame_count, "skipped single image series");
                continue;
            }
            let description = sample.meta.series_description.clone();
            if self.profile.is_excluded(&description) {
                info!(folder = %folder.display(), series = %description, "skipping excluded series");
                continue;
            }

            match groups
                .iter_mut()
                .find(|group| self.profile.same_series(&group.series_description, &description))
            {
                Some(group) => {
                    debug!(folder = %folder.display(), series = %group.series_description, "stacking folder");
                    group.folders.push(sample);
                }
                None => groups.push(SeriesGroup {
                    series_description: description,
                    folders: vec![sample],
                }),
            }
        }

        for group in groups.iter_mut().filter(|group| group.is_stacked()) {
            self.order_and_cap(group);
        }
        groups
    }

    fn order_and_cap(&self, group: &mut SeriesGroup) {
        // Stable: equal slice locations keep path order.
        group
            .folders
            .sort_by(|a, b| descending_location(a.meta.spatial_key, b.meta.spatial_key));

        if group.folders.len() > self.max_stack_slices {
            for dropped in &group.folders[self.max_stack_slices..] {
                warn!(
                    series = %group.series_description,
                    folder = %dropped.folder.display(),
                    max_slices = self.max_stack_slices,
                    "dropping slice folder beyond stack limit"
                );
            }
            group.folders.truncate(self.max_stack_slices);
        }
        info!(
            series = %group.series_description,
            slices = group.folders.len(),
            "stacking multi-slice series"
        );
    }
}

fn descending_location(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.total_cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn locations_sort_descending_with_unknown_last() {
        let mut keys = vec![Some(1.0), None, Some(5.0), Some(3.0)];
        keys.sort_by(|a, b| descending_location(*a, *b));
        assert_eq!(keys, vec![Some(5.0), Some(3.0), Some(1.0), None]);
    }

    #[test]
    fn candidate_folders_are_leaf_folders_with_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("mrn/acc/series_b")).unwrap();
        fs::create_dir_all(root.join("mrn/acc/series_a")).unwrap();
        fs::create_dir_all(root.join("mrn/acc/empty")).unwrap();
        fs::write(root.join("mrn/acc/series_a/1.dcm"), b"x").unwrap();
        fs::write(root.join("mrn/acc/series_b/1.dcm"), b"x").unwrap();

        let folders = candidate_folders(root).unwrap();
        assert_eq!(
            folders,
            vec![root.join("mrn/acc/series_a"), root.join("mrn/acc/series_b")]
        );
    }

    #[test]
    fn unreadable_folders_contribute_no_group() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("broken");
        fs::create_dir(&folder).unwrap();
        fs::write(folder.join("1.dcm"), b"garbage").unwrap();
        fs::write(folder.join("2.dcm"), b"garbage").unwrap();

        let profile = InstitutionProfile::default();
        let grouper = SeriesGrouper::new(&profile);
        assert!(grouper.sample_folder(&folder).is_none());
        assert!(grouper.group(&[folder]).is_empty());
    }
}
