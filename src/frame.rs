use crate::institution::EmbeddedIdentity;
use crate::natural_order::natural_cmp;

use dicom::object::{FileDicomObject, InMemDicomObject, OpenFileOptions, file::ReadPreamble};
use dicom::pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder};
use dicom_dictionary_std::tags;
use ndarray::{Array2, Array3, Axis, Zip};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Luminance weights applied to RGB pixel data
const LUMA_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("corrupt frame {path}: {reason}")]
    CorruptFrame { path: PathBuf, reason: String },

    #[error("frame {path} has unsupported sample layout ({samples} samples per pixel)")]
    UnsupportedSamples { path: PathBuf, samples: usize },
}

impl FrameError {
    fn corrupt(path: &Path, reason: impl ToString) -> Self {
        FrameError::CorruptFrame {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// Header fields used for ordering, grouping and identity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetadata {
    pub series_description: String,
    /// InstanceNumber as written in the header
    pub ordering_key: Option<String>,
    /// SliceLocation
    pub spatial_key: Option<f64>,
    pub identity: EmbeddedIdentity,
    pub manufacturer: Option<String>,
    pub field_strength: Option<f64>,
}

/// One decoded single-frame image
#[derive(Debug, Clone)]
pub struct Frame {
    pub path: PathBuf,
    /// (channel, height, width)
    pub pixels: Array3<f32>,
    pub meta: FrameMetadata,
}

impl Frame {
    /// (height, width)
    pub fn spatial_dim(&self) -> (usize, usize) {
        let (_, height, width) = self.pixels.dim();
        (height, width)
    }
}

/// List the image files of one series folder in natural file-name order.
///
/// Hidden files are ignored.
pub fn list_frame_files(folder: impl AsRef<Path>) -> io::Result<Vec<PathBuf>> {
    let mut paths: Vec<_> = fs::read_dir(folder.as_ref())?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| !name.starts_with('.'))
        })
        .collect();
    paths.sort_by(|a, b| {
        natural_cmp(&file_name_of(a), &file_name_of(b)).then_with(|| a.cmp(b))
    });
    Ok(paths)
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct FrameReader {
    channels: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self { channels: 3 }
    }
}

impl FrameReader {
    /// Reader replicating the grayscale plane into `channels` channels
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.max(1),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn open(
        path: &Path,
        header_only: bool,
    ) -> Result<FileDicomObject<InMemDicomObject>, FrameError> {
        // Files exported without a preamble are still read.
        let options = OpenFileOptions::new().read_preamble(ReadPreamble::Auto);
        let options = if header_only {
            options.read_until(tags::PIXEL_DATA)
        } else {
            options
        };
        options
            .open_file(path)
            .map_err(|err| FrameError::corrupt(path, err))
    }

    /// Read only the header of a frame, stopping before pixel data
    pub fn read_metadata(&self, path: impl AsRef<Path>) -> Result<FrameMetadata, FrameError> {
        let path = path.as_ref();
        let dicom_object = Self::open(path, true)?;
        Ok(Self::extract_metadata(&dicom_object))
    }

    /// Decode a frame into a (channel, height, width) buffer
    pub fn read_frame(&self, path: impl AsRef<Path>) -> Result<Frame, FrameError> {
        let path = path.as_ref();
        let dicom_object = Self::open(path, false)?;
        let meta = Self::extract_metadata(&dicom_object);
        let gray = Self::decode_grayscale(&dicom_object, path)?;
        let pixels = self.replicate_channels(gray, path)?;

        Ok(Frame {
            path: path.to_path_buf(),
            pixels,
            meta,
        })
    }

    fn extract_metadata(dicom_object: &FileDicomObject<InMemDicomObject>) -> FrameMetadata {
        FrameMetadata {
            series_description: Self::string_value(dicom_object, tags::SERIES_DESCRIPTION)
                .unwrap_or_default(),
            ordering_key: Self::string_value(dicom_object, tags::INSTANCE_NUMBER),
            spatial_key: Self::float_value(dicom_object, tags::SLICE_LOCATION),
            identity: EmbeddedIdentity {
                patient_id: Self::string_value(dicom_object, tags::PATIENT_ID),
                accession_number: Self::string_value(dicom_object, tags::ACCESSION_NUMBER),
            },
            manufacturer: Self::string_value(dicom_object, tags::MANUFACTURER),
            field_strength: Self::float_value(dicom_object, tags::MAGNETIC_FIELD_STRENGTH),
        }
    }

    fn string_value(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        tag: dicom::core::Tag,
    ) -> Option<String> {
        let value = dicom_object.element(tag).ok()?.to_str().ok()?;
        let value = value.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        (!value.is_empty()).then(|| value.to_string())
    }

    fn float_value(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        tag: dicom::core::Tag,
    ) -> Option<f64> {
        dicom_object
            .element(tag)
            .ok()?
            .to_float64()
            .ok()
            .filter(|value| value.is_finite())
    }

    fn decode_grayscale(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        path: &Path,
    ) -> Result<Array2<f32>, FrameError> {
        let pixel_data = dicom_object
            .decode_pixel_data()
            .map_err(|err| FrameError::corrupt(path, err))?;
        // Raw stored values; intensity windowing is left to consumers.
        let options = ConvertOptions::new().with_modality_lut(ModalityLutOption::None);
        let array = pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .map_err(|err| FrameError::corrupt(path, err))?;

        if array.len_of(Axis(0)) == 0 {
            return Err(FrameError::corrupt(path, "pixel data holds no frames"));
        }
        // Multi-frame objects contribute their first frame only.
        Self::to_grayscale(array.index_axis_move(Axis(0), 0), path)
    }

    /// Collapse a (height, width, samples) frame to one plane
    fn to_grayscale(frame: Array3<f32>, path: &Path) -> Result<Array2<f32>, FrameError> {
        let (height, width, samples) = frame.dim();
        if height == 0 || width == 0 {
            return Err(FrameError::corrupt(
                path,
                format!("frame has no pixels ({height}x{width})"),
            ));
        }

        match samples {
            1 => Ok(frame.index_axis_move(Axis(2), 0)),
            3 => {
                let mut gray = Array2::<f32>::zeros((height, width));
                Zip::from(&mut gray)
                    .and(frame.index_axis(Axis(2), 0))
                    .and(frame.index_axis(Axis(2), 1))
                    .and(frame.index_axis(Axis(2), 2))
                    .for_each(|g, &r, &gr, &b| {
                        *g = LUMA_WEIGHTS[0] * r + LUMA_WEIGHTS[1] * gr + LUMA_WEIGHTS[2] * b;
                    });
                Ok(gray)
            }
            samples => Err(FrameError::UnsupportedSamples {
                path: path.to_path_buf(),
                samples,
            }),
        }
    }

    fn replicate_channels(&self, gray: Array2<f32>, path: &Path) -> Result<Array3<f32>, FrameError> {
        let (height, width) = gray.dim();
        gray.insert_axis(Axis(0))
            .broadcast((self.channels, height, width))
            .map(|view| view.to_owned())
            .ok_or_else(|| FrameError::corrupt(path, "cannot broadcast grayscale plane"))
    }
}
