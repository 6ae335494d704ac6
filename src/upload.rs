//! Decoding of user uploads into in-memory images

use crate::config::ACCEPTED_EXTENSIONS;
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Why an upload could not be turned into an `Image`
#[derive(Debug, Error)]
pub enum ImageDecodeError {
    #[error("the uploaded file is empty")]
    Empty,

    #[error("unsupported file extension {0:?}: expected one of jpg, jpeg, png")]
    UnsupportedExtension(String),

    #[error("unsupported image format: expected JPEG or PNG")]
    UnsupportedFormat,

    #[error("could not read the image: {0}")]
    Malformed(#[from] image::ImageError),
}

/// A decoded image, the input of a model
#[derive(Debug, Clone)]
pub struct Image {
    pub format: ImageFormat,
    pub pixels: DynamicImage,
}

impl Image {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// An 8-bit RGB copy of the pixels
    pub fn to_rgb8(&self) -> RgbImage {
        self.pixels.to_rgb8()
    }
}

/// Decode raw bytes into an image. The format is taken from the content, and
/// only JPEG and PNG are accepted.
pub fn decode(raw: &[u8]) -> Result<Image, ImageDecodeError> {
    if raw.is_empty() {
        return Err(ImageDecodeError::Empty);
    }

    let format = match image::guess_format(raw) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png)) => format,
        _ => return Err(ImageDecodeError::UnsupportedFormat),
    };

    let pixels = image::load(Cursor::new(raw), format)?;
    debug!(
        "decoded {:?} upload ({}x{}, {} bytes)",
        format,
        pixels.width(),
        pixels.height(),
        raw.len()
    );

    Ok(Image { format, pixels })
}

/// Decode an upload that came with a filename, rejecting extensions the
/// uploader does not offer
pub fn decode_named(filename: Option<&str>, raw: &[u8]) -> Result<Image, ImageDecodeError> {
    if let Some(name) = filename {
        check_extension(name)?;
    }
    decode(raw)
}

fn check_extension(filename: &str) -> Result<(), ImageDecodeError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ACCEPTED_EXTENSIONS.contains(&ext.as_str()) {
        true => Ok(()),
        false => Err(ImageDecodeError::UnsupportedExtension(ext)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test::{solid_jpeg, solid_png};

    #[test]
    fn test_png_dimensions_match_header() {
        let image = decode(&solid_png(37, 21, [10, 200, 30])).unwrap();
        assert_eq!(image.format, ImageFormat::Png);
        assert_eq!((image.width(), image.height()), (37, 21));
    }

    #[test]
    fn test_jpeg_dimensions_match_header() {
        let image = decode(&solid_jpeg(64, 48, [120, 160, 40])).unwrap();
        assert_eq!(image.format, ImageFormat::Jpeg);
        assert_eq!((image.width(), image.height()), (64, 48));
    }

    #[test]
    fn test_non_image_bytes() {
        let err = decode(b"definitely not an image, just some text").unwrap_err();
        assert!(matches!(err, ImageDecodeError::UnsupportedFormat));
    }

    #[test]
    fn test_empty_upload() {
        assert!(matches!(decode(&[]), Err(ImageDecodeError::Empty)));
    }

    #[test]
    fn test_truncated_png() {
        let png = solid_png(32, 32, [0, 0, 0]);
        let err = decode_named(Some("leaf.png"), &png[..png.len() / 2]).unwrap_err();
        assert!(matches!(err, ImageDecodeError::Malformed(_)));
    }

    #[test]
    fn test_other_formats_rejected() {
        // GIF header
        let err = decode(b"GIF89a\x01\x00\x01\x00\x00\x00\x00").unwrap_err();
        assert!(matches!(err, ImageDecodeError::UnsupportedFormat));
    }

    #[test]
    fn test_extension_filter() {
        let png = solid_png(4, 4, [1, 2, 3]);
        assert!(decode_named(Some("LEAF.PNG"), &png).is_ok());
        assert!(decode_named(Some("leaf.jpeg"), &png).is_ok());
        assert!(decode_named(None, &png).is_ok());

        let err = decode_named(Some("leaf.bmp"), &png).unwrap_err();
        assert!(matches!(err, ImageDecodeError::UnsupportedExtension(ext) if ext == "bmp"));
        let err = decode_named(Some("leaf"), &png).unwrap_err();
        assert!(matches!(err, ImageDecodeError::UnsupportedExtension(_)));
    }
}
