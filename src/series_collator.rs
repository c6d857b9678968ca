use crate::frame::{Frame, FrameReader, file_name_of, list_frame_files};
use crate::grouper::SeriesGroup;
use crate::institution::{IdentityError, InstitutionProfile, StudyIdentity};
use crate::natural_order::natural_cmp;
use crate::series::CollatedSeries;

use ndarray::{Array4, s};
use std::{cmp::Ordering, path::PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Slice locations closer than this belong to the same slice
pub const SPATIAL_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum CollateError {
    #[error("series group {0} has no readable frames")]
    EmptyGroup(String),

    #[error(
        "ragged series: frame {path} is {found:?} but the series is {expected:?} (height, width)"
    )]
    RaggedSeries {
        expected: (usize, usize),
        found: (usize, usize),
        path: PathBuf,
    },

    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Orders the frames of one series group and stacks them into a single array
#[derive(Debug, Clone)]
pub struct SeriesCollator<'a> {
    reader: FrameReader,
    profile: &'a InstitutionProfile,
    archive_stem: Option<&'a str>,
}

impl<'a> SeriesCollator<'a> {
    pub fn new(reader: FrameReader, profile: &'a InstitutionProfile) -> Self {
        Self {
            reader,
            profile,
            archive_stem: None,
        }
    }

    /// Archive file name (without extension) used by identity overrides
    pub fn with_archive_stem(mut self, archive_stem: &'a str) -> Self {
        self.archive_stem = Some(archive_stem);
        self
    }

    /// Collate a series group
    ///
    /// # Errors
    ///
    /// Returns error if no frame could be read, frame dimensions differ or
    /// the owning subject/study cannot be resolved
    pub fn collate(&self, group: &SeriesGroup) -> Result<CollatedSeries, CollateError> {
        let frames = self.read_frames(group);
        if frames.is_empty() {
            return Err(CollateError::EmptyGroup(group.series_description.clone()));
        }

        let (frames, slice_boundaries) = Self::order_frames(frames);
        Self::validate_dimensions(&frames)?;

        let identity = self.resolve_identity(group)?;

        let data = Self::build_series_array(&frames);
        debug!(
            series = %group.series_description,
            frames = frames.len(),
            slices = slice_boundaries.len() + 1,
            "collated series"
        );
        Ok(CollatedSeries::new(
            data,
            &group.series_description,
            slice_boundaries,
            identity,
        ))
    }

    /// Owning subject and study of a group, taken from its first folder's
    /// representative frame.
    pub fn resolve_identity(&self, group: &SeriesGroup) -> Result<StudyIdentity, CollateError> {
        let sample = group
            .folders
            .first()
            .ok_or_else(|| CollateError::EmptyGroup(group.series_description.clone()))?;
        Ok(self.profile.resolve_identity(
            &sample.meta.identity,
            self.archive_stem,
            &sample.folder,
        )?)
    }

    fn read_frames(&self, group: &SeriesGroup) -> Vec<Frame> {
        let mut frames = Vec::new();
        for folder in group.folder_paths() {
            let paths = match list_frame_files(folder) {
                Ok(paths) => paths,
                Err(err) => {
                    warn!(folder = %folder.display(), error = %err, "cannot list series folder");
                    continue;
                }
            };
            for path in paths {
                match self.reader.read_frame(&path) {
                    Ok(frame) => frames.push(frame),
                    Err(err) => warn!(error = %err, "DICOM corrupted, skipping frame"),
                }
            }
        }
        frames
    }

    /// Sort frames by slice then acquisition order and report the indices at
    /// which the slice changes.
    ///
    /// The order is total: ties on both keys fall back to the file name and
    /// finally the full path, so the result never depends on read order.
    pub fn order_frames(frames: Vec<Frame>) -> (Vec<Frame>, Vec<usize>) {
        let slices = Self::assign_slices(&frames);
        let mut keyed: Vec<(usize, Frame)> = slices.into_iter().zip(frames).collect();
        keyed.sort_by(|(slice_a, a), (slice_b, b)| {
            slice_a
                .cmp(slice_b)
                .then_with(|| compare_ordering_keys(&a.meta.ordering_key, &b.meta.ordering_key))
                .then_with(|| natural_cmp(&file_name_of(&a.path), &file_name_of(&b.path)))
                .then_with(|| a.path.cmp(&b.path))
        });

        let boundaries = keyed
            .windows(2)
            .enumerate()
            .filter(|(_, pair)| pair[0].0 != pair[1].0)
            .map(|(index, _)| index)
            .collect();
        let frames = keyed.into_iter().map(|(_, frame)| frame).collect();
        (frames, boundaries)
    }

    /// Map every frame to a slice index ordered by ascending location.
    /// Frames without a location share one slice placed first.
    fn assign_slices(frames: &[Frame]) -> Vec<usize> {
        let mut located: Vec<(usize, f64)> = frames
            .iter()
            .enumerate()
            .filter_map(|(index, frame)| frame.meta.spatial_key.map(|key| (index, key)))
            .collect();
        located.sort_by(|a, b| a.1.total_cmp(&b.1));

        let offset = usize::from(located.len() < frames.len());
        let mut slices = vec![0; frames.len()];
        let mut slice = offset;
        let mut anchor: Option<f64> = None;
        for (index, key) in located {
            match anchor {
                Some(previous) if (key - previous).abs() <= SPATIAL_TOLERANCE => {}
                Some(_) => {
                    slice += 1;
                    anchor = Some(key);
                }
                None => anchor = Some(key),
            }
            slices[index] = slice;
        }
        slices
    }

    fn validate_dimensions(frames: &[Frame]) -> Result<(), CollateError> {
        let expected = frames[0].spatial_dim();
        match frames.iter().find(|frame| frame.spatial_dim() != expected) {
            Some(frame) => Err(CollateError::RaggedSeries {
                expected,
                found: frame.spatial_dim(),
                path: frame.path.clone(),
            }),
            None => Ok(()),
        }
    }

    fn build_series_array(frames: &[Frame]) -> Array4<f32> {
        let (channels, height, width) = frames[0].pixels.dim();
        let mut series = Array4::<f32>::zeros((channels, frames.len(), height, width));

        for (i, frame) in frames.iter().enumerate() {
            series.slice_mut(s![.., i, .., ..]).assign(&frame.pixels);
        }

        series
    }
}

/// Numeric-aware comparison; frames without a key sort after keyed frames
fn compare_ordering_keys(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => natural_cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameMetadata;
    use ndarray::Array3;

    fn frame(name: &str, ordering: Option<&str>, location: Option<f64>, value: f32) -> Frame {
        Frame {
            path: PathBuf::from(format!("/study/series/{name}")),
            pixels: Array3::from_elem((3, 2, 2), value),
            meta: FrameMetadata {
                series_description: "cine".into(),
                ordering_key: ordering.map(String::from),
                spatial_key: location,
                ..Default::default()
            },
        }
    }

    fn locations(frames: &[Frame]) -> Vec<Option<f64>> {
        frames.iter().map(|f| f.meta.spatial_key).collect()
    }

    #[test]
    fn boundaries_fall_where_location_changes() {
        let keys = [5.0, 5.0, 5.0, 3.0, 3.0, 1.0, 1.0];
        let frames = keys
            .iter()
            .enumerate()
            .map(|(i, &k)| frame(&format!("{i}.dcm"), Some(i.to_string().as_str()), Some(k), 0.0))
            .collect();

        let (ordered, boundaries) = SeriesCollator::order_frames(frames);
        assert_eq!(
            locations(&ordered),
            vec![1.0, 1.0, 3.0, 3.0, 5.0, 5.0, 5.0]
                .into_iter()
                .map(Some)
                .collect::<Vec<_>>()
        );
        assert_eq!(boundaries, vec![1, 3]);
    }

    #[test]
    fn ordering_keys_sort_naturally() {
        let frames = vec![
            frame("a.dcm", Some("2"), None, 2.0),
            frame("b.dcm", Some("10"), None, 10.0),
            frame("c.dcm", Some("1"), None, 1.0),
        ];
        let (ordered, boundaries) = SeriesCollator::order_frames(frames);
        let keys: Vec<_> = ordered
            .iter()
            .map(|f| f.meta.ordering_key.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["1", "2", "10"]);
        assert!(boundaries.is_empty());
    }

    #[test]
    fn missing_ordering_keys_fall_back_to_file_names() {
        let frames = vec![
            frame("IM10.dcm", None, None, 0.0),
            frame("IM2.dcm", None, None, 0.0),
            frame("IM1.dcm", Some("7"), None, 0.0),
        ];
        let (ordered, _) = SeriesCollator::order_frames(frames);
        let names: Vec<_> = ordered.iter().map(|f| file_name_of(&f.path)).collect();
        assert_eq!(names, vec!["IM1.dcm", "IM2.dcm", "IM10.dcm"]);
    }

    #[test]
    fn locations_within_tolerance_share_a_slice() {
        let frames = vec![
            frame("1.dcm", Some("1"), Some(10.0), 0.0),
            frame("2.dcm", Some("2"), Some(10.0004), 0.0),
            frame("3.dcm", Some("3"), Some(20.0), 0.0),
        ];
        let (_, boundaries) = SeriesCollator::order_frames(frames);
        assert_eq!(boundaries, vec![1]);
    }

    #[test]
    fn unlocated_frames_form_a_leading_slice() {
        let frames = vec![
            frame("1.dcm", Some("1"), Some(4.0), 0.0),
            frame("2.dcm", Some("2"), None, 0.0),
        ];
        let (ordered, boundaries) = SeriesCollator::order_frames(frames);
        assert_eq!(locations(&ordered), vec![None, Some(4.0)]);
        assert_eq!(boundaries, vec![0]);
    }

    #[test]
    fn order_does_not_depend_on_input_order() {
        let make = || {
            vec![
                frame("3.dcm", Some("3"), Some(1.0), 3.0),
                frame("1.dcm", Some("1"), Some(2.0), 1.0),
                frame("2.dcm", Some("2"), Some(1.0), 2.0),
                frame("4.dcm", None, Some(2.0), 4.0),
            ]
        };
        let (forward, forward_boundaries) = SeriesCollator::order_frames(make());
        let mut reversed_input = make();
        reversed_input.reverse();
        let (reversed, reversed_boundaries) = SeriesCollator::order_frames(reversed_input);

        let paths = |frames: &[Frame]| frames.iter().map(|f| f.path.clone()).collect::<Vec<_>>();
        assert_eq!(paths(&forward), paths(&reversed));
        assert_eq!(forward_boundaries, reversed_boundaries);
        assert_eq!(
            SeriesCollator::build_series_array(&forward),
            SeriesCollator::build_series_array(&reversed)
        );
    }

    #[test]
    fn mismatched_dimensions_are_ragged() {
        let mut small = frame("2.dcm", Some("2"), None, 0.0);
        small.pixels = Array3::zeros((3, 1, 1));
        let frames = vec![frame("1.dcm", Some("1"), None, 0.0), small];
        assert!(matches!(
            SeriesCollator::validate_dimensions(&frames),
            Err(CollateError::RaggedSeries {
                expected: (2, 2),
                found: (1, 1),
                ..
            })
        ));
    }

    #[test]
    fn frames_are_stacked_along_the_frame_axis() {
        let frames = vec![
            frame("1.dcm", Some("1"), None, 1.0),
            frame("2.dcm", Some("2"), None, 2.0),
        ];
        let array = SeriesCollator::build_series_array(&frames);
        assert_eq!(array.dim(), (3, 2, 2, 2));
        assert!(array.slice(s![.., 1, .., ..]).iter().all(|&v| v == 2.0));
    }
}
