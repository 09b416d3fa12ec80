//! Image payload codec for terrain tiles.

use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, DynamicImage, ImageEncoder};

use crate::error::{MergeError, Result};

/// Decoded tile pixels, packed RGB.
#[derive(Debug, Clone)]
pub struct RgbTile {
    pub size: usize,
    pub rgb: Vec<u8>,
}

/// Decodes a PNG/WebP payload into square RGB pixels.
///
/// RGBA payloads lose their alpha channel. Any other layout, or a non-square
/// image, is rejected.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbTile> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = (img.width(), img.height());
    if width != height {
        return Err(MergeError::UnsupportedPayload(format!(
            "tile is {}x{}, expected a square",
            width, height
        )));
    }

    let rgb = match img {
        DynamicImage::ImageRgb8(buf) => buf.into_raw(),
        DynamicImage::ImageRgba8(buf) => DynamicImage::ImageRgba8(buf).to_rgb8().into_raw(),
        other => {
            return Err(MergeError::UnsupportedPayload(format!(
                "unexpected pixel layout {:?}",
                other.color()
            )))
        }
    };

    Ok(RgbTile {
        size: width as usize,
        rgb,
    })
}

/// Encodes packed RGB pixels as a PNG. Output is deterministic for equal input.
pub fn encode_png(rgb: &[u8], size: usize) -> Result<Vec<u8>> {
    let expected = size * size * 3;
    if rgb.len() != expected {
        return Err(MergeError::ShapeMismatch {
            expected,
            actual: rgb.len(),
        });
    }

    let mut buf = Vec::new();
    let encoder =
        PngEncoder::new_with_quality(&mut buf, CompressionType::Default, FilterType::Adaptive);
    encoder.write_image(rgb, size as u32, size as u32, ColorType::Rgb8.into())?;
    Ok(buf)
}
