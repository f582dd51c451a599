//! Image saving utilities.

use std::path::Path;

use image::RgbImage;

use crate::error::{Error, Result};

/// Save an RGB image, choosing the format from the file extension.
///
/// # Arguments
///
/// * `image` - Overlay or depth visualization to write
/// * `path` - Output file path
/// * `quality` - JPEG quality (1-100), ignored for other formats
///
/// # Errors
///
/// Returns an error if the image cannot be encoded or written.
pub fn save_image<P: AsRef<Path>>(image: &RgbImage, path: P, quality: u8) -> Result<()> {
    let path = path.as_ref();

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_lowercase();

    match extension.as_str() {
        "jpg" | "jpeg" => {
            let mut output = std::fs::File::create(path)?;
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, quality);
            image
                .write_with_encoder(encoder)
                .map_err(|source| Error::ImageSave {
                    path: path.to_path_buf(),
                    source,
                })?;
        }
        _ => {
            image.save(path).map_err(|source| Error::ImageSave {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    tracing::debug!("Wrote {}x{} image to {}", image.width(), image.height(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_png_round_trip_is_lossless() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("overlay.png");
        let img = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8 * 60, y as u8 * 80, 7]));

        save_image(&img, &path, 95).expect("save png");

        let reloaded = image::open(&path).expect("reopen").to_rgb8();
        assert_eq!(reloaded, img);
    }

    #[test]
    fn test_jpeg_keeps_dimensions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("depth.jpg");
        let img = RgbImage::from_pixel(10, 6, Rgb([128, 128, 128]));

        save_image(&img, &path, 80).expect("save jpeg");

        let reloaded = image::open(&path).expect("reopen");
        assert_eq!((reloaded.width(), reloaded.height()), (10, 6));
    }
}
