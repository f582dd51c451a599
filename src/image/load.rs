//! Image decoding and orientation normalization.

use std::io::Cursor;
use std::path::Path;

use image::{imageops, RgbImage};

use crate::error::{Error, Result};

/// Orientation tag attached to a photo.
///
/// Only the pure rotations are corrected. Mirrored EXIF variants and unknown
/// values are kept as [`Orientation::Unhandled`] and leave the image as decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    /// Rotate 90 degrees clockwise to display upright.
    Rotate90,
    Rotate180,
    /// Rotate 270 degrees clockwise to display upright.
    Rotate270,
    Unhandled(u32),
}

impl Orientation {
    /// Map an EXIF orientation value (tag 0x0112).
    #[must_use]
    pub const fn from_exif(tag: u32) -> Self {
        match tag {
            1 => Self::Normal,
            6 => Self::Rotate90,
            3 => Self::Rotate180,
            8 => Self::Rotate270,
            other => Self::Unhandled(other),
        }
    }

    /// Clockwise rotation applied by [`apply_orientation`].
    #[must_use]
    pub const fn degrees(self) -> u32 {
        match self {
            Self::Rotate90 => 90,
            Self::Rotate180 => 180,
            Self::Rotate270 => 270,
            Self::Normal | Self::Unhandled(_) => 0,
        }
    }
}

/// Read the EXIF orientation from raw image bytes.
///
/// Returns [`Orientation::Normal`] when the container has no EXIF block or the
/// tag is absent.
#[must_use]
pub fn read_orientation(bytes: &[u8]) -> Orientation {
    let mut cursor = Cursor::new(bytes);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut cursor) else {
        return Orientation::Normal;
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .map_or(Orientation::Normal, Orientation::from_exif)
}

/// Rotate a decoded image so it matches what a viewer expects.
#[must_use]
pub fn apply_orientation(image: RgbImage, orientation: Orientation) -> RgbImage {
    match orientation {
        Orientation::Rotate90 => imageops::rotate90(&image),
        Orientation::Rotate180 => imageops::rotate180(&image),
        Orientation::Rotate270 => imageops::rotate270(&image),
        Orientation::Normal | Orientation::Unhandled(_) => image,
    }
}

/// Decode image bytes and apply an explicitly supplied orientation.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not a decodable image.
pub fn decode_image(bytes: &[u8], orientation: Orientation) -> Result<RgbImage> {
    let decoded = image::load_from_memory(bytes).map_err(|source| Error::Decode { source })?;
    let rgb = decoded.to_rgb8();

    if orientation != Orientation::Normal {
        tracing::debug!(
            "Applying orientation {orientation:?} to {}x{} image",
            rgb.width(),
            rgb.height()
        );
    }

    Ok(apply_orientation(rgb, orientation))
}

/// Decode image bytes into an upright RGB image using the embedded EXIF tag.
///
/// # Errors
///
/// Returns [`Error::Decode`] if the bytes are not a decodable image.
pub fn load_image(bytes: &[u8]) -> Result<RgbImage> {
    decode_image(bytes, read_orientation(bytes))
}

/// Read an image file from disk and return it upright.
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn load_image_file<P: AsRef<Path>>(path: P) -> Result<RgbImage> {
    let path = path.as_ref();
    tracing::debug!("Reading image {}", path.display());
    let bytes = std::fs::read(path)?;
    load_image(&bytes)
}
