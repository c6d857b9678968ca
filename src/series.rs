use crate::institution::StudyIdentity;

use ndarray::{Array4, ArrayView3, Axis};

/// Entry name used when a series carries no description
pub const UNNAMED_SERIES: &str = "unnamed_series";

/// Replace characters that are unsafe in file names or container keys with `_`
pub fn sanitize_key(raw: &str, placeholder: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('\0');
    if trimmed.is_empty() {
        return placeholder.to_string();
    }
    let mut cleaned: String = trimmed
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();
    // Leading dots would hide the entry or walk up a directory.
    if cleaned.starts_with('.') {
        cleaned.replace_range(0..1, "_");
    }
    cleaned
}

pub fn sanitize_series_name(description: &str) -> String {
    sanitize_key(description, UNNAMED_SERIES)
}

/// One series ordered and stacked into a (channel, frame, height, width) array
#[derive(Debug, Clone, PartialEq)]
pub struct CollatedSeries {
    pub data: Array4<f32>,
    pub series_name: String,
    pub series_description: String,
    pub slice_boundaries: Vec<usize>,
    pub identity: StudyIdentity,
}

impl CollatedSeries {
    pub fn new(
        data: Array4<f32>,
        series_description: &str,
        slice_boundaries: Vec<usize>,
        identity: StudyIdentity,
    ) -> Self {
        Self {
            data,
            series_name: sanitize_series_name(series_description),
            series_description: series_description.to_string(),
            slice_boundaries,
            identity,
        }
    }

    /// Get the dimensions of the series (channels, frames, height, width)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn total_frame_count(&self) -> usize {
        self.data.len_of(Axis(1))
    }

    /// True for multi-slice stacks
    pub fn is_stacked(&self) -> bool {
        !self.slice_boundaries.is_empty()
    }

    /// Get one frame across all channels
    pub fn frame(&self, index: usize) -> Option<ArrayView3<'_, f32>> {
        (index < self.total_frame_count()).then(|| self.data.index_axis(Axis(1), index))
    }

    /// Boundaries are strictly increasing and inside the frame axis
    pub fn boundaries_are_valid(&self) -> bool {
        let frames = self.total_frame_count();
        self.slice_boundaries.windows(2).all(|w| w[0] < w[1])
            && self.slice_boundaries.iter().all(|&b| b < frames)
    }
}
