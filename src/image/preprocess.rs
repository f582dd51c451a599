//! Conversion from RGB images to model input tensors.

use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;

use super::{ImageTensor, RGB_CHANNELS};

/// Memory layout of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// NCHW: three contiguous planes, index `c*S*S + y*S + x`.
    ChannelsFirst,
    /// NHWC: interleaved RGB triples per pixel.
    ChannelsLast,
}

impl TensorLayout {
    /// Tensor shape for a square input of side `size`.
    #[must_use]
    pub const fn shape(self, size: usize) -> [usize; 4] {
        match self {
            Self::ChannelsFirst => [1, RGB_CHANNELS, size, size],
            Self::ChannelsLast => [1, size, size, RGB_CHANNELS],
        }
    }

    /// Detect the layout from a declared 4D input shape.
    ///
    /// Channel-first wins when both axes could hold the channels.
    #[must_use]
    pub fn from_input_shape(shape: &[i64]) -> Option<Self> {
        let channels = RGB_CHANNELS as i64;
        match shape {
            [_, c, _, _] if *c == channels => Some(Self::ChannelsFirst),
            [_, _, _, c] if *c == channels => Some(Self::ChannelsLast),
            _ => None,
        }
    }
}

/// Resize an image to `size`x`size` and scale each channel to [0, 1].
///
/// Uses bilinear filtering for the resize. No mean/std normalization is applied;
/// the bundled models expect plain 0-1 input.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn preprocess(image: &RgbImage, size: u32, layout: TensorLayout) -> ImageTensor {
    let resized = image::imageops::resize(image, size, size, FilterType::Triangle);
    let side = size as usize;

    let mut tensor = Array4::<f32>::zeros(layout.shape(side));

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..RGB_CHANNELS {
            let value = f32::from(pixel[c]) / 255.0;
            match layout {
                TensorLayout::ChannelsFirst => tensor[[0, c, y, x]] = value,
                TensorLayout::ChannelsLast => tensor[[0, y, x, c]] = value,
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 37 % 256) as u8, (y * 91 % 256) as u8, ((x + y) * 13 % 256) as u8])
        })
    }

    #[test]
    fn test_channels_first_shape() {
        let tensor = preprocess(&gradient(40, 30), 16, TensorLayout::ChannelsFirst);
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
    }

    #[test]
    fn test_channels_last_shape() {
        let tensor = preprocess(&gradient(40, 30), 16, TensorLayout::ChannelsLast);
        assert_eq!(tensor.shape(), &[1, 16, 16, 3]);
    }

    #[test]
    fn test_extremes_map_exactly() {
        let img = RgbImage::from_fn(2, 2, |x, _| {
            if x == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });

        let tensor = preprocess(&img, 2, TensorLayout::ChannelsFirst);
        for c in 0..3 {
            assert_eq!(tensor[[0, c, 0, 0]], 0.0);
            assert_eq!(tensor[[0, c, 0, 1]], 1.0);
        }
    }

    #[test]
    fn test_every_byte_value_in_unit_range() {
        let img = RgbImage::from_fn(16, 16, |x, y| {
            let v = (y * 16 + x) as u8;
            Rgb([v, 255 - v, v / 2])
        });
        let tensor = preprocess(&img, 16, TensorLayout::ChannelsLast);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_planar_and_interleaved_hold_same_values() {
        let img = gradient(5, 5);
        let planar = preprocess(&img, 5, TensorLayout::ChannelsFirst);
        let interleaved = preprocess(&img, 5, TensorLayout::ChannelsLast);

        for y in 0..5 {
            for x in 0..5 {
                for c in 0..3 {
                    assert_eq!(planar[[0, c, y, x]], interleaved[[0, y, x, c]]);
                }
            }
        }

        // Planar buffer follows channel*S*S + y*S + x.
        let flat = planar.as_slice().expect("standard layout");
        let expected = f32::from(img.get_pixel(3, 2)[1]) / 255.0;
        assert_eq!(flat[25 + 2 * 5 + 3], expected);
    }

    #[test]
    fn test_layout_detection() {
        assert_eq!(
            TensorLayout::from_input_shape(&[1, 3, 512, 512]),
            Some(TensorLayout::ChannelsFirst)
        );
        assert_eq!(
            TensorLayout::from_input_shape(&[1, 518, 518, 3]),
            Some(TensorLayout::ChannelsLast)
        );
        assert_eq!(
            TensorLayout::from_input_shape(&[-1, 3, -1, -1]),
            Some(TensorLayout::ChannelsFirst)
        );
        assert_eq!(TensorLayout::from_input_shape(&[1, 518, 518]), None);
    }
}
