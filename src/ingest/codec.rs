//! JPEG frame codec.
//!
//! Turns the binary payload of a device message into an RGB pixel grid and
//! applies the fixed mounting correction of the ESP32-CAM (the sensor is
//! mounted rotated, so every frame is turned 90° counter-clockwise).
//!
//! Decode failures are returned to the caller, which drops the frame for
//! this cycle. Nothing here keeps state between frames.

use anyhow::{anyhow, Context, Result};
use image::{imageops, ImageFormat, RgbImage};

/// Upper bound for a single encoded frame. The largest supported resolution
/// (320x240) stays far below this even at maximum JPEG quality.
pub const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

/// Decode a JPEG payload and rotate it into upright orientation.
pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(anyhow!("empty frame payload"));
    }
    if bytes.len() > MAX_JPEG_BYTES {
        return Err(anyhow!(
            "frame payload of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            MAX_JPEG_BYTES
        ));
    }
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .context("decode jpeg frame")?;
    Ok(rotate_upright(&image.into_rgb8()))
}

/// Rotate 90° counter-clockwise (a 270° clockwise turn).
pub fn rotate_upright(frame: &RgbImage) -> RgbImage {
    imageops::rotate270(frame)
}

/// Encode an RGB frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    frame
        .write_to(&mut out, ImageFormat::Jpeg)
        .context("encode jpeg frame")?;
    Ok(out.into_inner())
}
