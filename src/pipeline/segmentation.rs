//! Segmentation decoding: argmax, colorize, and blend over the source image.

use image::{imageops::FilterType, Rgb, RgbImage};
use ndarray::{Array2, ArrayD, ArrayView3, Axis, Ix3};

use crate::error::{Error, Result};

use super::legend::{legend_for, LegendEntry};
use super::palette::Palette;

/// Per-pixel class ids at the model's output resolution, indexed `[y, x]`.
pub type ClassMap = Array2<usize>;

/// Mask weight used when compositing the segmentation over the photo.
pub const BLEND_ALPHA: f32 = 0.75;

/// Result of segmentation postprocessing.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub class_map: ClassMap,
    /// Colorized mask blended over the original, at the original resolution.
    pub overlay: RgbImage,
    pub legend: Vec<LegendEntry>,
}

/// Decode `{1, classes, H, W}` logits into a class map.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if `logits` is not a single-batch 4D
/// tensor with at least one class.
pub fn argmax_classes(logits: &ArrayD<f32>) -> Result<ClassMap> {
    let shape = logits.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] == 0 {
        return Err(Error::shape_mismatch(
            "[1, classes, height, width] logits",
            format!("{shape:?}"),
        ));
    }

    let per_class = logits
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix3>()
        .map_err(|e| Error::shape_mismatch("3D class planes", e.to_string()))?;

    Ok(decode_logits(per_class))
}

/// Argmax over the class axis of `[classes, H, W]` logits.
///
/// Only a strictly greater score replaces the current best, so ties resolve to
/// the lowest class id.
#[must_use]
pub fn decode_logits(logits: ArrayView3<'_, f32>) -> ClassMap {
    let (classes, height, width) = logits.dim();
    let mut class_map = ClassMap::zeros((height, width));

    for y in 0..height {
        for x in 0..width {
            let mut best = logits[[0, y, x]];
            let mut best_class = 0;
            for c in 1..classes {
                let score = logits[[c, y, x]];
                if score > best {
                    best = score;
                    best_class = c;
                }
            }
            class_map[[y, x]] = best_class;
        }
    }

    class_map
}

/// Paint each class id with its palette color (black when out of range).
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn colorize(class_map: &ClassMap, palette: &Palette) -> RgbImage {
    let (height, width) = class_map.dim();
    // Safe: class maps come from model outputs far below u32::MAX per side
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        palette.color(class_map[[y as usize, x as usize]])
    })
}

/// Composite `mask` over `base`: `base * (1 - alpha) + mask * alpha`,
/// truncated per channel.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the images differ in size, and
/// [`Error::InvalidParameter`] if `alpha` is outside [0, 1].
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn blend(base: &RgbImage, mask: &RgbImage, alpha: f32) -> Result<RgbImage> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(Error::InvalidParameter {
            name: "alpha".to_string(),
            reason: "must be between 0.0 and 1.0".to_string(),
        });
    }
    if base.dimensions() != mask.dimensions() {
        return Err(Error::shape_mismatch(
            format!("{:?} mask", base.dimensions()),
            format!("{:?} mask", mask.dimensions()),
        ));
    }

    let keep = 1.0 - alpha;
    Ok(RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let b = base.get_pixel(x, y);
        let m = mask.get_pixel(x, y);
        // Safe: a convex combination of two u8 values stays within [0, 255]
        Rgb(std::array::from_fn(|c| {
            f32::from(b[c]).mul_add(keep, f32::from(m[c]) * alpha) as u8
        }))
    }))
}

/// Full segmentation postprocessing for one inference result.
///
/// # Errors
///
/// Returns an error if the logits have the wrong shape or `alpha` is invalid.
pub fn postprocess_segmentation(
    logits: &ArrayD<f32>,
    original: &RgbImage,
    palette: &Palette,
    alpha: f32,
) -> Result<Segmentation> {
    let class_map = argmax_classes(logits)?;
    tracing::debug!("Decoded {:?} class map", class_map.dim());

    let mask = colorize(&class_map, palette);
    let (width, height) = original.dimensions();
    let mask = image::imageops::resize(&mask, width, height, FilterType::Triangle);

    let overlay = blend(original, &mask, alpha)?;
    let legend = legend_for(&class_map, palette);

    Ok(Segmentation {
        class_map,
        overlay,
        legend,
    })
}
