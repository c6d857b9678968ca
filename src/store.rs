//! Per-study containers stored as Zarr v3 groups through `zarrs`.
//!
//! ```text
//! <output>/<institution>_<subject>/<study>.zarr/
//!     zarr.json               group; institution, subject, study, source archives
//!     <series>/zarr.json      float32 array, one chunk; slice_frames, total_images
//!     <series>/c/0/0/0/0
//! ```
//!
//! Series entries are assembled in a uniquely named hidden staging directory
//! and renamed into place, so an interrupted write never leaves a visible
//! partial entry. Writers sharing a [`SeriesStoreWriter`] serialize on the
//! container path.

use crate::enums::Compression;
use crate::institution::StudyIdentity;
use crate::series::CollatedSeries;

use dashmap::DashMap;
use ndarray::{Array4, Ix4};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use thiserror::Error;
use tracing::{debug, info};
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::codec::bytes_to_bytes::{gzip::GzipCodec, zstd::ZstdCodec};
use zarrs::array::{Array, ArrayBuilder, ArrayCreateError, ArrayError};
use zarrs::filesystem::{FilesystemStore, FilesystemStoreCreateError};
use zarrs::group::{Group, GroupBuilder, GroupCreateError};
use zarrs::storage::StorageError;

pub const CONTAINER_EXTENSION: &str = "zarr";
const NODE_METADATA: &str = "zarr.json";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("attribute error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to open store: {0}")]
    StoreCreate(#[from] FilesystemStoreCreateError),

    #[error("group error: {0}")]
    Group(#[from] GroupCreateError),

    #[error("array metadata error: {0}")]
    ArrayCreate(#[from] ArrayCreateError),

    #[error("array error: {0}")]
    Array(#[from] ArrayError),

    #[error("{0} is not a study container")]
    NotAContainer(PathBuf),

    #[error("series {0} not found")]
    MissingSeries(String),

    #[error("unsupported array layout in {path}: {reason}")]
    UnsupportedLayout { path: PathBuf, reason: String },

    #[error("invalid compression level {level} for {compression}")]
    InvalidLevel { compression: Compression, level: i32 },
}

/// Result of writing a series into a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// An entry with the same name exists and was left untouched
    DuplicateSeries,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesAttributes {
    pub slice_frames: Vec<usize>,
    pub total_images: usize,
    #[serde(default)]
    pub series_description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerAttributes {
    pub institution: String,
    pub subject_id: String,
    pub study_id: String,
    #[serde(default)]
    pub source_archives: Vec<String>,
}

fn to_attributes<T: Serialize>(value: &T) -> Result<Map<String, Value>, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn from_attributes<T: DeserializeOwned>(map: &Map<String, Value>) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(map.clone()))?)
}

fn codecs(
    compression: Compression,
    level: i32,
) -> Result<Vec<Arc<dyn BytesToBytesCodecTraits>>, StoreError> {
    let invalid = || StoreError::InvalidLevel { compression, level };
    Ok(match compression {
        Compression::None => Vec::new(),
        Compression::Gzip => {
            let level = u32::try_from(level).map_err(|_| invalid())?;
            vec![Arc::new(GzipCodec::new(level).map_err(|_| invalid())?)]
        }
        Compression::Zstd => vec![Arc::new(ZstdCodec::new(level, false))],
    })
}

fn is_node(path: &Path) -> bool {
    path.join(NODE_METADATA).is_file()
}

/// One study's container
#[derive(Debug, Clone)]
pub struct StudyContainer {
    root: PathBuf,
}

impl StudyContainer {
    /// Location of the container for a subject/study below `output_dir`
    pub fn path_for(output_dir: &Path, institution: &str, identity: &StudyIdentity) -> PathBuf {
        output_dir
            .join(format!("{institution}_{}", identity.subject_id))
            .join(format!("{}.{CONTAINER_EXTENSION}", identity.study_id))
    }

    /// Open an existing container
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        if !is_node(&root) {
            return Err(StoreError::NotAContainer(root));
        }
        Ok(Self { root })
    }

    /// Open the container for a study, creating it on first use.
    ///
    /// Not synchronized; [`SeriesStoreWriter`] holds the container lock
    /// around this call.
    pub fn open_or_create(
        output_dir: &Path,
        institution: &str,
        identity: &StudyIdentity,
    ) -> Result<Self, StoreError> {
        let root = Self::path_for(output_dir, institution, identity);
        if is_node(&root) {
            return Ok(Self { root });
        }

        fs::create_dir_all(&root)?;
        let attributes = to_attributes(&ContainerAttributes {
            institution: institution.to_string(),
            subject_id: identity.subject_id.clone(),
            study_id: identity.study_id.clone(),
            source_archives: Vec::new(),
        })?;
        let store = Arc::new(FilesystemStore::new(&root)?);
        let group = GroupBuilder::new().attributes(attributes).build(store, "/")?;
        group.store_metadata()?;
        info!(container = %root.display(), "created study container");
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn store(&self) -> Result<Arc<FilesystemStore>, StoreError> {
        Ok(Arc::new(FilesystemStore::new(&self.root)?))
    }

    fn open_array(&self, series_name: &str) -> Result<Array<FilesystemStore>, StoreError> {
        if !self.contains(series_name) {
            return Err(StoreError::MissingSeries(series_name.to_string()));
        }
        Ok(Array::open(self.store()?, &format!("/{series_name}"))?)
    }

    pub fn contains(&self, series_name: &str) -> bool {
        !series_name.starts_with('.') && is_node(&self.root.join(series_name))
    }

    /// Names of all series entries, sorted
    pub fn list_entries(&self) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter(|entry| is_node(&entry.path()))
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Append a series entry; existing entries are never overwritten
    pub fn write_series(
        &self,
        series: &CollatedSeries,
        compression: Compression,
        level: i32,
    ) -> Result<WriteOutcome, StoreError> {
        let name = &series.series_name;
        let target = self.root.join(name);
        if target.exists() {
            info!(series = %name, container = %self.root.display(), "series already exists, skipping");
            return Ok(WriteOutcome::DuplicateSeries);
        }

        // Removed on drop unless the rename below moved it.
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&self.root)?;

        let shape: Vec<u64> = series.data.shape().iter().map(|&d| d as u64).collect();
        let chunk_grid: Vec<u64> = shape.iter().map(|&d| d.max(1)).collect();
        let attributes = to_attributes(&SeriesAttributes {
            slice_frames: series.slice_boundaries.clone(),
            total_images: series.total_frame_count(),
            series_description: series.series_description.clone(),
        })?;

        let mut builder = ArrayBuilder::new(shape.clone(), chunk_grid, "float32", 0.0f32);
        builder.dimension_names(Some(vec![
            Some("channel".to_string()),
            Some("frame".to_string()),
            Some("y".to_string()),
            Some("x".to_string()),
        ]));
        builder.bytes_to_bytes_codecs(codecs(compression, level)?);
        builder.attributes(attributes);

        {
            let store = Arc::new(FilesystemStore::new(staging.path())?);
            let array = builder.build(store, "/")?;
            array.store_metadata()?;
            array.store_array_subset_ndarray(&[0, 0, 0, 0], series.data.clone())?;
        }

        if let Err(err) = fs::rename(staging.path(), &target) {
            if target.exists() {
                return Ok(WriteOutcome::DuplicateSeries);
            }
            return Err(err.into());
        }
        debug!(series = %name, shape = ?shape, "wrote series entry");
        Ok(WriteOutcome::Written)
    }

    pub fn read_attributes(&self, series_name: &str) -> Result<SeriesAttributes, StoreError> {
        from_attributes(self.open_array(series_name)?.attributes())
    }

    pub fn read_series(&self, series_name: &str) -> Result<Array4<f32>, StoreError> {
        let array = self.open_array(series_name)?;
        let data = array.retrieve_array_subset_ndarray::<f32>(&array.subset_all())?;
        data.into_dimensionality::<Ix4>()
            .map_err(|err| StoreError::UnsupportedLayout {
                path: self.root.join(series_name),
                reason: format!("expected a 4-dimensional array: {err}"),
            })
    }

    pub fn attributes(&self) -> Result<ContainerAttributes, StoreError> {
        let group = Group::open(self.store()?, "/")?;
        from_attributes(group.attributes())
    }

    /// Remember that `archive` contributed to this container.
    ///
    /// A read-modify-write of the group metadata; callers sharing a
    /// container must serialize through [`SeriesStoreWriter`].
    pub fn record_source_archive(&self, archive: &str) -> Result<(), StoreError> {
        let mut group = Group::open(self.store()?, "/")?;
        let mut attributes: ContainerAttributes = from_attributes(group.attributes())?;
        if attributes.source_archives.iter().any(|a| a == archive) {
            return Ok(());
        }
        attributes.source_archives.push(archive.to_string());
        attributes.source_archives.sort();
        *group.attributes_mut() = to_attributes(&attributes)?;
        group.store_metadata()?;
        Ok(())
    }

    /// All containers below an output directory, sorted by path
    pub fn find_all(output_dir: impl AsRef<Path>) -> Result<Vec<StudyContainer>, StoreError> {
        let mut containers = Vec::new();
        for subject in fs::read_dir(output_dir.as_ref())?.filter_map(Result::ok) {
            if !subject.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            for study in fs::read_dir(subject.path())?.filter_map(Result::ok) {
                let path = study.path();
                let is_container = path
                    .extension()
                    .is_some_and(|ext| ext == CONTAINER_EXTENSION)
                    && is_node(&path);
                if is_container {
                    containers.push(StudyContainer { root: path });
                }
            }
        }
        containers.sort_by(|a, b| a.root.cmp(&b.root));
        Ok(containers)
    }
}

/// Writes collated series into their study containers.
///
/// Clones share one lock table, so any number of workers may write into the
/// same container through clones of one writer.
#[derive(Debug, Clone)]
pub struct SeriesStoreWriter {
    output_dir: PathBuf,
    institution: String,
    compression: Compression,
    level: i32,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SeriesStoreWriter {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        institution: impl Into<String>,
        compression: Compression,
        level: i32,
    ) -> Result<Self, StoreError> {
        let valid = match compression {
            Compression::None => true,
            Compression::Gzip => (0..=9).contains(&level),
            Compression::Zstd => (1..=22).contains(&level),
        };
        if !valid {
            return Err(StoreError::InvalidLevel { compression, level });
        }
        Ok(Self {
            output_dir: output_dir.into(),
            institution: institution.into(),
            compression,
            level,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn container_path(&self, identity: &StudyIdentity) -> PathBuf {
        StudyContainer::path_for(&self.output_dir, &self.institution, identity)
    }

    fn container_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(path.to_path_buf()).or_default())
    }

    /// True when the series already exists for this study
    pub fn has_series(&self, identity: &StudyIdentity, series_name: &str) -> bool {
        StudyContainer::open(self.container_path(identity))
            .is_ok_and(|container| container.contains(series_name))
    }

    /// Write one series, creating the study container if needed, and record
    /// the source archive on the container
    pub fn write(
        &self,
        series: &CollatedSeries,
        source_archive: &str,
    ) -> Result<WriteOutcome, StoreError> {
        let lock = self.container_lock(&self.container_path(&series.identity));
        // A panicking writer leaves no partial entry behind, so a poisoned
        // lock is still usable.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let container =
            StudyContainer::open_or_create(&self.output_dir, &self.institution, &series.identity)?;
        let outcome = container.write_series(series, self.compression, self.level)?;
        container.record_source_archive(source_archive)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn identity() -> StudyIdentity {
        StudyIdentity {
            subject_id: "MRN1".into(),
            study_id: "ACC1".into(),
        }
    }

    fn series(name: &str, fill: f32) -> CollatedSeries {
        let data = Array4::from_shape_fn((3, 4, 5, 6), |(c, f, y, x)| {
            fill + (c * 1000 + f * 100 + y * 10 + x) as f32
        });
        CollatedSeries::new(data, name, vec![1, 2], identity())
    }

    #[test]
    fn round_trips_every_compression() {
        for (compression, level) in [
            (Compression::None, 0),
            (Compression::Gzip, 4),
            (Compression::Zstd, 3),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let writer = SeriesStoreWriter::new(dir.path(), "test", compression, level).unwrap();
            let original = series("SAX FIESTA", 0.5);
            assert_eq!(
                writer.write(&original, "MRN1-ACC1.tgz").unwrap(),
                WriteOutcome::Written
            );

            let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
            assert_eq!(container.list_entries().unwrap(), vec!["SAX_FIESTA"]);
            assert_eq!(container.read_series("SAX_FIESTA").unwrap(), original.data);
            let attributes = container.read_attributes("SAX_FIESTA").unwrap();
            assert_eq!(attributes.slice_frames, vec![1, 2]);
            assert_eq!(attributes.total_images, 4);
        }
    }

    #[test]
    fn second_write_of_same_name_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SeriesStoreWriter::new(dir.path(), "test", Compression::Gzip, 4).unwrap();
        let first = series("cine", 1.0);
        let second = series("cine", 99.0);

        assert_eq!(writer.write(&first, "a.tgz").unwrap(), WriteOutcome::Written);
        assert_eq!(
            writer.write(&second, "a.tgz").unwrap(),
            WriteOutcome::DuplicateSeries
        );

        let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
        assert_eq!(container.list_entries().unwrap(), vec!["cine"]);
        assert_eq!(container.read_series("cine").unwrap(), first.data);
    }

    #[test]
    fn container_layout_is_keyed_by_subject_and_study() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SeriesStoreWriter::new(dir.path(), "stanford", Compression::None, 0).unwrap();
        writer.write(&series("cine", 0.0), "MRN1-ACC1.tgz").unwrap();

        let expected = dir.path().join("stanford_MRN1").join("ACC1.zarr");
        assert!(expected.join("zarr.json").is_file());
        assert!(expected.join("cine").join("zarr.json").is_file());
        let containers = StudyContainer::find_all(dir.path()).unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].path(), expected);

        let attributes = containers[0].attributes().unwrap();
        assert_eq!(attributes.subject_id, "MRN1");
        assert_eq!(attributes.source_archives, vec!["MRN1-ACC1.tgz"]);
    }

    #[test]
    fn source_archives_are_recorded_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SeriesStoreWriter::new(dir.path(), "test", Compression::None, 0).unwrap();
        writer.write(&series("a", 0.0), "b.tgz").unwrap();
        writer.write(&series("b", 0.0), "b.tgz").unwrap();
        writer.write(&series("c", 0.0), "a.tgz").unwrap();

        let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
        assert_eq!(
            container.attributes().unwrap().source_archives,
            vec!["a.tgz", "b.tgz"]
        );
    }

    #[test]
    fn stale_staging_directories_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SeriesStoreWriter::new(dir.path(), "test", Compression::None, 0).unwrap();
        writer.write(&series("first", 0.0), "a.tgz").unwrap();

        let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
        let stale = container.path().join(".staging-cine");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("zarr.json"), b"{").unwrap();
        assert_eq!(container.list_entries().unwrap(), vec!["first"]);
        assert!(!container.contains(".staging-cine"));

        assert_eq!(writer.write(&series("cine", 0.0), "a.tgz").unwrap(), WriteOutcome::Written);
        assert_eq!(container.list_entries().unwrap(), vec!["cine", "first"]);
        // Only the stale directory remains hidden in the container.
        let hidden = fs::read_dir(container.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .count();
        assert_eq!(hidden, 1);
    }

    #[test]
    fn concurrent_writers_share_a_new_container() {
        for round in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let writer = SeriesStoreWriter::new(dir.path(), "test", Compression::Gzip, 1).unwrap();
            let barrier = Barrier::new(2);

            let outcomes: Vec<_> = thread::scope(|scope| {
                let handles: Vec<_> = [("cine", "a.tgz"), ("sax", "b.tgz")]
                    .into_iter()
                    .map(|(name, archive)| {
                        let writer = writer.clone();
                        let barrier = &barrier;
                        scope.spawn(move || {
                            let series = series(name, round as f32);
                            barrier.wait();
                            writer.write(&series, archive)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            for outcome in outcomes {
                assert_eq!(outcome.unwrap(), WriteOutcome::Written);
            }
            let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
            assert_eq!(container.list_entries().unwrap(), vec!["cine", "sax"]);
            assert_eq!(
                container.attributes().unwrap().source_archives,
                vec!["a.tgz", "b.tgz"]
            );
        }
    }

    #[test]
    fn invalid_levels_are_rejected() {
        assert!(SeriesStoreWriter::new("/tmp", "x", Compression::Gzip, 12).is_err());
        assert!(SeriesStoreWriter::new("/tmp", "x", Compression::Zstd, 0).is_err());
        assert!(SeriesStoreWriter::new("/tmp", "x", Compression::None, 99).is_ok());
    }

    #[test]
    fn missing_series_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SeriesStoreWriter::new(dir.path(), "test", Compression::None, 0).unwrap();
        writer.write(&series("cine", 0.0), "a.tgz").unwrap();
        let container = StudyContainer::open(writer.container_path(&identity())).unwrap();
        assert!(matches!(
            container.read_series("nope"),
            Err(StoreError::MissingSeries(_))
        ));
    }
}
