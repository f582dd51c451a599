//! Depth map normalization and grayscale rendering.

use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array2, ArrayD};

use crate::error::{Error, Result};

/// Relative depth per pixel at the model's output resolution, indexed `[y, x]`.
pub type DepthMap = Array2<f32>;

/// Guards the min-max division for flat depth maps.
pub const DEPTH_EPSILON: f32 = 1e-6;

/// Extract the single depth plane from `{H, W}`, `{1, H, W}` or `{1, 1, H, W}`.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] for any other shape or an empty plane.
pub fn depth_map(output: &ArrayD<f32>) -> Result<DepthMap> {
    let shape = output.shape();
    let mismatch = || Error::shape_mismatch("[1, height, width] depth", format!("{shape:?}"));

    if !(2..=4).contains(&shape.len()) {
        return Err(mismatch());
    }
    let (leading, spatial) = shape.split_at(shape.len() - 2);
    if leading.iter().any(|&d| d != 1) || spatial.contains(&0) {
        return Err(mismatch());
    }

    DepthMap::from_shape_vec((spatial[0], spatial[1]), output.iter().copied().collect())
        .map_err(|_| mismatch())
}

/// Min-max normalize to 8-bit gray: `round((v - min) / (max - min + eps) * 255)`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn depth_to_grayscale(depth: &DepthMap) -> RgbImage {
    let (min, max) = depth
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min + DEPTH_EPSILON;

    let (height, width) = depth.dim();
    // Safe: depth maps come from model outputs far below u32::MAX per side
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let normalized = (depth[[y as usize, x as usize]] - min) / range;
        let gray = (normalized * 255.0).round().clamp(0.0, 255.0) as u8;
        Rgb([gray, gray, gray])
    })
}

/// Full depth postprocessing: grayscale at model resolution, then upscaled to
/// `(width, height)` of the original image.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the output is not a single depth plane.
pub fn postprocess_depth(output: &ArrayD<f32>, original_dims: (u32, u32)) -> Result<RgbImage> {
    let depth = depth_map(output)?;
    tracing::debug!("Normalizing {:?} depth map", depth.dim());

    let gray = depth_to_grayscale(&depth);
    let (width, height) = original_dims;
    Ok(image::imageops::resize(&gray, width, height, FilterType::Triangle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3, Array4};

    #[test]
    fn test_extremes_map_to_black_and_white() {
        let depth = array![[0.0_f32, 1.0], [5.0, 3.0]];
        let gray = depth_to_grayscale(&depth);

        assert_eq!(*gray.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*gray.get_pixel(0, 1), Rgb([255, 255, 255]));
        assert_eq!(*gray.get_pixel(1, 0), Rgb([51, 51, 51]));
        assert_eq!(*gray.get_pixel(1, 1), Rgb([153, 153, 153]));
    }

    #[test]
    fn test_flat_depth_is_uniform_without_panicking() {
        let depth = DepthMap::from_elem((3, 4), 7.25);
        let gray = depth_to_grayscale(&depth);

        let first = *gray.get_pixel(0, 0);
        assert!(gray.pixels().all(|p| *p == first));
        assert_eq!(first, Rgb([0, 0, 0]));
    }

    #[test]
    fn test_negative_disparity_is_normalized() {
        let depth = array![[-3.0_f32, -1.0]];
        let gray = depth_to_grayscale(&depth);
        assert_eq!(gray.get_pixel(0, 0)[0], 0);
        assert_eq!(gray.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn test_accepted_output_shapes() {
        let plane = array![[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let expected = plane.clone();

        assert_eq!(depth_map(&plane.clone().into_dyn()).expect("2d"), expected);
        assert_eq!(
            depth_map(&plane.clone().insert_axis(ndarray::Axis(0)).into_dyn()).expect("3d"),
            expected
        );
        let four_d = Array4::from_shape_vec((1, 1, 2, 3), plane.iter().copied().collect())
            .expect("shape")
            .into_dyn();
        assert_eq!(depth_map(&four_d).expect("4d"), expected);
    }

    #[test]
    fn test_rejected_output_shapes() {
        let two_planes = Array3::<f32>::zeros((2, 4, 4)).into_dyn();
        assert!(matches!(
            depth_map(&two_planes),
            Err(Error::ShapeMismatch { .. })
        ));

        let vector = ndarray::Array1::<f32>::zeros(8).into_dyn();
        assert!(depth_map(&vector).is_err());

        let empty = Array3::<f32>::zeros((1, 0, 4)).into_dyn();
        assert!(depth_map(&empty).is_err());
    }

    #[test]
    fn test_postprocess_upscales_to_original() {
        let output = Array3::from_elem((1, 2, 2), 0.5_f32).into_dyn();
        let gray = postprocess_depth(&output, (9, 6)).expect("postprocess");
        assert_eq!(gray.dimensions(), (9, 6));
        assert!(gray.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
    }
}
