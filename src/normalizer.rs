//! Resize every frame of a series to a canonical size and centre-crop it.

use crate::interpolator::Interpolator;
use crate::series::CollatedSeries;

use ndarray::{Array2, Array4, s};
use rayon::prelude::*;
use thiserror::Error;

pub const DEFAULT_FRAME_SIZE: usize = 480;
pub const DEFAULT_CROP_FRACTION: f64 = 0.75;

#[derive(Debug, Error, PartialEq)]
pub enum NormalizeError {
    #[error("frame size must be positive")]
    ZeroFrameSize,

    #[error("crop fraction must be in (0, 1], got {0}")]
    InvalidCropFraction(f64),

    #[error("cannot crop {crop}x{crop} out of a {height}x{width} frame")]
    CropTooLarge {
        crop: usize,
        height: usize,
        width: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialNormalizer {
    frame_size: usize,
    crop_fraction: f64,
}

impl Default for SpatialNormalizer {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            crop_fraction: DEFAULT_CROP_FRACTION,
        }
    }
}

impl SpatialNormalizer {
    pub fn new(frame_size: usize, crop_fraction: f64) -> Result<Self, NormalizeError> {
        if frame_size == 0 {
            return Err(NormalizeError::ZeroFrameSize);
        }
        if !(crop_fraction > 0.0 && crop_fraction <= 1.0) {
            return Err(NormalizeError::InvalidCropFraction(crop_fraction));
        }
        Ok(Self {
            frame_size,
            crop_fraction,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Side length of the square output frames
    pub fn crop_size(&self) -> usize {
        ((self.crop_fraction * self.frame_size as f64).round() as usize).max(1)
    }

    /// Normalize the frames of a series, keeping frame order and slice
    /// boundaries
    pub fn normalize(&self, series: CollatedSeries) -> Result<CollatedSeries, NormalizeError> {
        let data = self.normalize_array(&series.data)?;
        Ok(CollatedSeries { data, ..series })
    }

    pub fn normalize_array(&self, data: &Array4<f32>) -> Result<Array4<f32>, NormalizeError> {
        let (channels, frames, height, width) = data.dim();
        let (resized_height, resized_width) =
            Interpolator::shorter_side_dimensions((height, width), self.frame_size);
        let crop = self.crop_size();
        if crop > resized_height || crop > resized_width {
            return Err(NormalizeError::CropTooLarge {
                crop,
                height: resized_height,
                width: resized_width,
            });
        }
        let top = ((resized_height - crop) as f64 / 2.0).round() as usize;
        let left = ((resized_width - crop) as f64 / 2.0).round() as usize;

        let planes: Vec<Array2<f32>> = (0..channels * frames)
            .into_par_iter()
            .map(|index| {
                let plane = data.slice(s![index / frames, index % frames, .., ..]);
                let resized = Interpolator::resize(&plane, resized_height, resized_width);
                resized
                    .slice(s![top..top + crop, left..left + crop])
                    .to_owned()
            })
            .collect();

        let mut output = Array4::<f32>::zeros((channels, frames, crop, crop));
        for (index, plane) in planes.iter().enumerate() {
            output
                .slice_mut(s![index / frames, index % frames, .., ..])
                .assign(plane);
        }
        Ok(output)
    }
}
