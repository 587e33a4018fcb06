//! Receipt image preparation.
//!
//! Receipt photos come off the portal small and noisy. Recognition quality
//! improves a lot with a Lanczos upscale to a minimum working size, and
//! the interesting fields live in predictable regions of the receipt, so
//! each field gets its own crop.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, RgbImage};

use crate::OcrError;

/// Minimum working dimensions; smaller images are upscaled preserving
/// aspect ratio.
pub const MIN_WIDTH: u32 = 800;
pub const MIN_HEIGHT: u32 = 600;

/// Decodes image bytes, normalises to RGB, and upscales below the minimum
/// working size.
///
/// # Errors
///
/// * [`OcrError::Image`] when the bytes are not a decodable image
pub fn prepare(bytes: &[u8]) -> Result<RgbImage, OcrError> {
    let decoded = image::load_from_memory(bytes)?.into_rgb8();
    let (width, height) = decoded.dimensions();
    if width >= MIN_WIDTH && height >= MIN_HEIGHT {
        return Ok(decoded);
    }

    let ratio = (f64::from(MIN_WIDTH) / f64::from(width))
        .max(f64::from(MIN_HEIGHT) / f64::from(height));
    let new_width = scale(width, ratio);
    let new_height = scale(height, ratio);
    log::debug!("upscaling receipt from {width}x{height} to {new_width}x{new_height}");

    Ok(image::imageops::resize(
        &decoded,
        new_width,
        new_height,
        FilterType::Lanczos3,
    ))
}

fn scale(dimension: u32, ratio: f64) -> u32 {
    let scaled = (f64::from(dimension) * ratio).round();
    if scaled >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        // Round-tripped through f64 and bounded above, so the cast is exact.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        {
            scaled as u32
        }
    }
}

/// Officer and beat lines print in the top portion of the receipt.
#[must_use]
pub fn officer_region(receipt: &RgbImage) -> RgbImage {
    let (width, height) = receipt.dimensions();
    image::imageops::crop_imm(receipt, 0, 0, width, height * 2 / 5).to_image()
}

/// The location line prints on the left side of the middle band.
#[must_use]
pub fn address_region(receipt: &RgbImage) -> RgbImage {
    let (width, height) = receipt.dimensions();
    image::imageops::crop_imm(receipt, 0, height * 3 / 10, width / 2, height * 2 / 5)
        .to_image()
}

/// Encodes a crop as PNG for handoff to the OCR engine.
///
/// # Errors
///
/// * [`OcrError::Image`] when encoding fails
pub fn encode_png(region: &RgbImage) -> Result<Vec<u8>, OcrError> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(region.clone()).write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}
