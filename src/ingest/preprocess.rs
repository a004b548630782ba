//! Frame preprocessing ahead of face detection.
//!
//! The low-light ESP32 sensor produces noisy, flat frames. Detection runs on a
//! normalized luminance image instead:
//! 1. luminance conversion (skipped for single-channel input)
//! 2. 5x5 Gaussian denoise
//! 3. histogram equalization
//! 4. gamma correction through a 256-entry lookup table
//!
//! Every step is a pure function of its input.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GrayImage, RgbImage};

/// Default gamma exponent. Values above 1 brighten shadows.
pub const DEFAULT_GAMMA: f32 = 1.5;

/// Binomial approximation of a 5-tap Gaussian; weights sum to 16.
const GAUSSIAN_TAPS: [u32; 5] = [1, 4, 6, 4, 1];

/// Precomputed gamma table.
#[derive(Clone, Debug)]
pub struct GammaTable {
    table: [u8; 256],
}

impl GammaTable {
    pub fn new(gamma: f32) -> Result<Self> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(anyhow!("gamma must be a positive number, got {}", gamma));
        }
        Ok(Self::build(gamma))
    }

    fn build(gamma: f32) -> Self {
        let inv_gamma = 1.0 / gamma as f64;
        let mut table = [0u8; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let scaled = (i as f64 / 255.0).powf(inv_gamma) * 255.0;
            *entry = scaled.clamp(0.0, 255.0) as u8;
        }
        Self { table }
    }

    pub fn apply(&self, frame: &GrayImage) -> GrayImage {
        let mut out = frame.clone();
        for p in out.iter_mut() {
            *p = self.table[*p as usize];
        }
        out
    }

    pub fn lookup(&self, value: u8) -> u8 {
        self.table[value as usize]
    }
}

/// Stateless preprocessing pipeline.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    gamma: GammaTable,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            gamma: GammaTable::build(DEFAULT_GAMMA),
        }
    }
}

impl Preprocessor {
    pub fn new(gamma: f32) -> Result<Self> {
        Ok(Self {
            gamma: GammaTable::new(gamma)?,
        })
    }

    /// Run the full chain and return a single-channel frame.
    pub fn process(&self, frame: &DynamicImage) -> GrayImage {
        let gray = to_luminance(frame);
        let denoised = gaussian_blur_5x5(&gray);
        let equalized = equalize_histogram(&denoised);
        self.gamma.apply(&equalized)
    }

    /// Run the chain and expand back to three channels for detectors that
    /// expect color input.
    pub fn process_rgb(&self, frame: &RgbImage) -> RgbImage {
        let processed = self.process(&DynamicImage::ImageRgb8(frame.clone()));
        DynamicImage::ImageLuma8(processed).to_rgb8()
    }
}

/// Luminance conversion; single-channel input is returned unchanged.
pub fn to_luminance(frame: &DynamicImage) -> GrayImage {
    match frame {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => other.to_luma8(),
    }
}

/// Separable 5x5 Gaussian blur with reflect-101 borders.
pub fn gaussian_blur_5x5(frame: &GrayImage) -> GrayImage {
    let (width, height) = frame.dimensions();
    if width == 0 || height == 0 {
        return frame.clone();
    }
    let w = width as usize;
    let h = height as usize;
    let src = frame.as_raw();

    // Horizontal pass keeps the unnormalized sums (max 255 * 16).
    let mut horizontal = vec![0u32; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0u32;
            for (k, tap) in GAUSSIAN_TAPS.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - 2, w);
                acc += tap * row[sx] as u32;
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = GrayImage::new(width, height);
    let dst: &mut [u8] = &mut out;
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, tap) in GAUSSIAN_TAPS.iter().enumerate() {
                let sy = reflect_101(y as isize + k as isize - 2, h);
                acc += tap * horizontal[sy * w + x];
            }
            dst[y * w + x] = ((acc + 128) >> 8).min(255) as u8;
        }
    }
    out
}

/// Histogram equalization: the lowest occupied level maps to 0 and the
/// cumulative distribution is stretched over the full range.
pub fn equalize_histogram(frame: &GrayImage) -> GrayImage {
    let total = frame.as_raw().len() as u64;
    if total == 0 {
        return frame.clone();
    }

    let mut histogram = [0u64; 256];
    for &p in frame.as_raw() {
        histogram[p as usize] += 1;
    }

    let first = histogram.iter().position(|&count| count > 0).unwrap_or(0);
    let mut lut = [0u8; 256];
    if histogram[first] == total {
        // Flat frame: nothing to stretch.
        lut.iter_mut().for_each(|v| *v = first as u8);
    } else {
        let scale = 255.0 / (total - histogram[first]) as f64;
        let mut cumulative = 0u64;
        for level in first + 1..256 {
            cumulative += histogram[level];
            lut[level] = (cumulative as f64 * scale).round().clamp(0.0, 255.0) as u8;
        }
    }

    let mut out = frame.clone();
    for p in out.iter_mut() {
        *p = lut[*p as usize];
    }
    out
}

fn reflect_101(index: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = index;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn gamma_table_brightens_midtones_and_keeps_endpoints() -> Result<()> {
        let table = GammaTable::new(1.5)?;
        assert_eq!(table.lookup(0), 0);
        assert_eq!(table.lookup(255), 255);
        assert!(table.lookup(64) > 64);
        Ok(())
    }

    #[test]
    fn gamma_rejects_non_positive_exponent() {
        assert!(GammaTable::new(0.0).is_err());
        assert!(GammaTable::new(-1.0).is_err());
        assert!(GammaTable::new(f32::NAN).is_err());
    }

    #[test]
    fn blur_preserves_uniform_frames() {
        let frame = GrayImage::from_pixel(7, 5, Luma([90]));
        assert_eq!(gaussian_blur_5x5(&frame), frame);
    }

    #[test]
    fn blur_spreads_a_single_spike() {
        let mut frame = GrayImage::new(5, 5);
        frame.put_pixel(2, 2, Luma([255]));
        let blurred = gaussian_blur_5x5(&frame);
        // Center weight is 6*6/256 of the spike.
        assert_eq!(blurred.get_pixel(2, 2)[0], 36);
        assert!(blurred.get_pixel(1, 2)[0] > 0);
        assert!(blurred.get_pixel(2, 2)[0] > blurred.get_pixel(0, 0)[0]);
    }

    #[test]
    fn equalization_stretches_to_full_range() {
        let mut frame = GrayImage::new(2, 2);
        frame.put_pixel(0, 0, Luma([100]));
        frame.put_pixel(1, 0, Luma([101]));
        frame.put_pixel(0, 1, Luma([102]));
        frame.put_pixel(1, 1, Luma([103]));

        let eq = equalize_histogram(&frame);
        assert_eq!(eq.get_pixel(0, 0)[0], 0);
        assert_eq!(eq.get_pixel(1, 0)[0], 85);
        assert_eq!(eq.get_pixel(0, 1)[0], 170);
        assert_eq!(eq.get_pixel(1, 1)[0], 255);
    }

    #[test]
    fn equalization_leaves_flat_frames_alone() {
        let frame = GrayImage::from_pixel(3, 3, Luma([42]));
        assert_eq!(equalize_histogram(&frame), frame);
    }

    #[test]
    fn luminance_is_a_no_op_for_gray_input() {
        let frame = GrayImage::from_pixel(2, 2, Luma([17]));
        let out = to_luminance(&DynamicImage::ImageLuma8(frame.clone()));
        assert_eq!(out, frame);
    }

    #[test]
    fn process_rgb_keeps_dimensions_and_channels_equal() {
        let frame = RgbImage::from_fn(8, 6, |x, y| Rgb([(x * 20) as u8, (y * 30) as u8, 10]));
        let out = Preprocessor::default().process_rgb(&frame);
        assert_eq!(out.dimensions(), (8, 6));
        for p in out.pixels() {
            assert_eq!(p[0], p[1]);
            assert_eq!(p[1], p[2]);
        }
    }
}
