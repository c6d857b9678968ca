//! Study archive extraction into per-study scratch directories.

use flate2::bufread::GzDecoder;
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    path::{Path, PathBuf},
};
use tar::Archive;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ARCHIVE_SUFFIXES: [&str; 3] = [".tar.gz", ".tgz", ".tar"];

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to extract {archive}: {source}")]
    ExtractionFailure {
        archive: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Archive file name without its archive extension
pub fn archive_stem(file_name: &str) -> &str {
    ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| {
            let split = file_name.len().checked_sub(suffix.len())?;
            let tail = file_name.get(split..)?;
            tail.eq_ignore_ascii_case(suffix)
                .then(|| &file_name[..split])
        })
        .unwrap_or(file_name)
}

/// Uniquely named scratch directory, removed when dropped
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchDir {
    /// Create a fresh directory `<root>/<key>.<random>`.
    ///
    /// Archives sharing a key (`S1-A1.tgz`, `S1-A1.tar`) get distinct
    /// directories, and nothing already under `root` is touched.
    pub fn create(root: impl AsRef<Path>, key: &str) -> io::Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("{key}."))
            .tempdir_in(root)?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now, reporting failures
    pub fn cleanup(mut self) -> io::Result<()> {
        match self.dir.take() {
            Some(dir) => dir.close(),
            None => Ok(()),
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if let Err(err) = dir.close() {
            warn!(path = %self.path.display(), error = %err, "failed to purge scratch directory");
        }
    }
}

fn unpack(archive: &Path, destination: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(archive)?);
    let is_gzip = reader.fill_buf()?.starts_with(&GZIP_MAGIC);
    let stream: Box<dyn Read> = if is_gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Archive::new(stream).unpack(destination)
}

/// Extract a (optionally gzip-compressed) tar archive into a fresh scratch
/// directory named after the archive's stem.
///
/// The scratch directory is removed again if extraction fails.
pub fn extract_archive(
    archive: impl AsRef<Path>,
    scratch_root: impl AsRef<Path>,
) -> Result<ScratchDir, ArchiveError> {
    let archive = archive.as_ref();
    let failure = |source: io::Error| ArchiveError::ExtractionFailure {
        archive: archive.to_path_buf(),
        source,
    };

    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| failure(io::Error::other("archive path has no file name")))?;
    let scratch = ScratchDir::create(scratch_root, archive_stem(file_name)).map_err(failure)?;

    unpack(archive, scratch.path()).map_err(failure)?;
    debug!(archive = %archive.display(), scratch = %scratch.path().display(), "extracted archive");
    Ok(scratch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};

    fn build_archive(path: &Path, gzip: bool) {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("mrn/acc/series")).unwrap();
        fs::write(source.path().join("mrn/acc/series/1.dcm"), b"frame").unwrap();

        let file = File::create(path).unwrap();
        if gzip {
            let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
            builder.append_dir_all(".", source.path()).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        } else {
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(".", source.path()).unwrap();
            builder.finish().unwrap();
        }
    }

    #[test]
    fn stems_strip_archive_extensions() {
        assert_eq!(archive_stem("MRN-ACC.tgz"), "MRN-ACC");
        assert_eq!(archive_stem("study.tar.gz"), "study");
        assert_eq!(archive_stem("study.TAR"), "study");
        assert_eq!(archive_stem("notes.txt"), "notes.txt");
    }

    #[test]
    fn extracts_plain_and_gzip_archives() {
        for gzip in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let archive = dir.path().join(if gzip { "s1-a1.tgz" } else { "s1-a1.tar" });
            build_archive(&archive, gzip);

            let scratch_root = dir.path().join("scratch");
            let scratch = extract_archive(&archive, &scratch_root).unwrap();
            assert_eq!(scratch.path().parent(), Some(scratch_root.as_path()));
            let name = scratch.path().file_name().unwrap().to_string_lossy();
            assert!(name.starts_with("s1-a1."));
            assert!(scratch.path().join("mrn/acc/series/1.dcm").is_file());

            let path = scratch.path().to_path_buf();
            drop(scratch);
            assert!(!path.exists());
        }
    }

    #[test]
    fn corrupt_archive_fails_and_leaves_no_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tgz");
        fs::write(&archive, vec![0xAB; 2048]).unwrap();

        let scratch_root = dir.path().join("scratch");
        let result = extract_archive(&archive, &scratch_root);
        assert!(matches!(result, Err(ArchiveError::ExtractionFailure { .. })));
        assert_eq!(fs::read_dir(&scratch_root).unwrap().count(), 0);
    }

    #[test]
    fn archives_sharing_a_stem_get_separate_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let tgz = dir.path().join("S1-A1.tgz");
        let tar = dir.path().join("S1-A1.tar");
        build_archive(&tgz, true);
        build_archive(&tar, false);

        let scratch_root = dir.path().join("scratch");
        let first = extract_archive(&tgz, &scratch_root).unwrap();
        let second = extract_archive(&tar, &scratch_root).unwrap();
        assert_ne!(first.path(), second.path());

        let frame = first.path().join("mrn/acc/series/1.dcm");
        assert!(frame.is_file());
        second.cleanup().unwrap();
        assert!(frame.is_file());
        drop(first);
        assert_eq!(fs::read_dir(&scratch_root).unwrap().count(), 0);
    }

    #[test]
    fn existing_directories_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("study");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("keep"), b"x").unwrap();

        let scratch = ScratchDir::create(dir.path(), "study").unwrap();
        assert_ne!(scratch.path(), other);
        drop(scratch);
        assert!(other.join("keep").is_file());
    }

    #[test]
    fn explicit_cleanup_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchDir::create(dir.path(), "study").unwrap();
        let path = scratch.path().to_path_buf();
        fs::write(path.join("x"), b"x").unwrap();
        scratch.cleanup().unwrap();
        assert!(!path.exists());
    }
}
