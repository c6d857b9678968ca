use ndarray::{Array2, ArrayView2};

pub(crate) struct Interpolator;

impl Interpolator {
    /// Output (height, width) scaling the shorter side to `size` while keeping
    /// the aspect ratio. Images whose shorter side already equals `size` keep
    /// their dimensions.
    pub(crate) fn shorter_side_dimensions(
        original_dim: (usize, usize),
        size: usize,
    ) -> (usize, usize) {
        let (height, width) = original_dim;
        if (width <= height && width == size) || (height <= width && height == size) {
            return original_dim;
        }
        if width < height {
            let new_height = (size as f64 * height as f64 / width as f64) as usize;
            (new_height.max(1), size)
        } else {
            let new_width = (size as f64 * width as f64 / height as f64) as usize;
            (size, new_width.max(1))
        }
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]];
        let v01 = slice[[y0, x1]];
        let v10 = slice[[y1, x0]];
        let v11 = slice[[y1, x1]];

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }

    /// Resample a plane to (height, width) with half-pixel-centred bilinear
    /// sampling
    pub(crate) fn resize(slice: &ArrayView2<f32>, height: usize, width: usize) -> Array2<f32> {
        let (slice_height, slice_width) = slice.dim();
        if (slice_height, slice_width) == (height, width) {
            return slice.to_owned();
        }

        Array2::from_shape_fn((height, width), |(y, x)| {
            // Use normalized coordinates with half-pixel offset
            let norm_x = (x as f32 + 0.5) / width as f32;
            let norm_y = (y as f32 + 0.5) / height as f32;

            // Convert back to source coordinates
            let src_x = norm_x * slice_width as f32 - 0.5;
            let src_y = norm_y * slice_height as f32 - 0.5;

            // Clamp to valid range
            let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
            let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

            Self::bilinear_interpolate(slice, src_y, src_x)
        })
    }
}
