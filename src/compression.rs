//! Byte-budgeted JPEG re-encoding.
//!
//! Quality is tracked in integer tenths (7 == 0.7) so the search steps
//! 0.3 -> 0.2 -> 0.1 exactly.

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{KIB, MAX_COMPRESSION_ATTEMPTS};

/// Lowest quality the search will step down to, in tenths.
const MIN_QUALITY_TENTHS: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionResult {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub size: usize,
    /// Quality factor of the last encode, `None` when the input was kept.
    pub quality: Option<f32>,
    pub attempts: u32,
    pub within_budget: bool,
}

impl CompressionResult {
    pub(crate) fn unchanged(bytes: Vec<u8>, max_bytes: usize) -> Self {
        let size = bytes.len();
        Self {
            bytes,
            size,
            quality: None,
            attempts: 0,
            within_budget: size <= max_bytes,
        }
    }
}

/// Starting quality (tenths) by input size tier.
pub fn initial_quality(input_len: usize) -> u8 {
    if input_len > 2000 * KIB {
        3
    } else if input_len > 1000 * KIB {
        5
    } else {
        7
    }
}

/// Outcome of the quality search before it is wrapped into a [`CompressionResult`].
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub bytes: Vec<u8>,
    pub quality_tenths: u8,
    pub attempts: u32,
}

/// Encodes at the tiered starting quality and steps down by 0.1 while the
/// output is over budget, the quality is above 0.1 and fewer than five
/// encodes have run. Returns the last encode even if it is still too large.
pub fn search_quality<F>(input_len: usize, max_bytes: usize, mut encode: F) -> Result<SearchOutcome>
where
    F: FnMut(u8) -> Result<Vec<u8>>,
{
    let mut quality = initial_quality(input_len);
    let mut bytes = encode(quality)?;
    let mut attempts = 1;

    while bytes.len() > max_bytes && quality > MIN_QUALITY_TENTHS && attempts < MAX_COMPRESSION_ATTEMPTS {
        quality -= 1;
        bytes = encode(quality)?;
        attempts += 1;
        debug!(
            "Attempt {}: quality 0.{}, size {}KB",
            attempts,
            quality,
            bytes.len() / KIB
        );
    }

    Ok(SearchOutcome {
        bytes,
        quality_tenths: quality,
        attempts,
    })
}

/// Encodes an RGB frame to JPEG at a 0-100 quality.
pub trait JpegEncoder: Send + Sync {
    fn encode(&self, image: &RgbImage, quality: u8) -> Result<Vec<u8>>;
}

/// libjpeg-turbo backed encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurboJpegEncoder;

impl JpegEncoder for TurboJpegEncoder {
    fn encode(&self, image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
        let data = turbojpeg::compress_image(image, i32::from(quality), turbojpeg::Subsamp::Sub2x2)
            .context("Failed to compress image with turbojpeg")?;
        Ok(data.to_vec())
    }
}

fn is_jpeg(data: &[u8]) -> bool {
    data.len() >= 3 && data[0] == 0xFF && data[1] == 0xD8 && data[2] == 0xFF
}

/// Decodes JPEG through turbojpeg when possible, anything else through `image`.
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    if is_jpeg(data) {
        match turbojpeg::decompress_image::<image::Rgb<u8>>(data) {
            Ok(rgb) => return Ok(DynamicImage::ImageRgb8(rgb)),
            Err(e) => debug!("turbojpeg decode failed ({}), falling back to image crate", e),
        }
    }
    image::load_from_memory(data).context("Failed to decode image")
}

pub struct ImageCompressor<E = TurboJpegEncoder> {
    encoder: E,
}

impl Default for ImageCompressor<TurboJpegEncoder> {
    fn default() -> Self {
        Self::new(TurboJpegEncoder)
    }
}

impl<E: JpegEncoder> ImageCompressor<E> {
    pub fn new(encoder: E) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Never fails: undecodable input or encoder errors hand back the
    /// original bytes.
    pub fn compress(&self, input: Vec<u8>, max_bytes: usize) -> CompressionResult {
        let original_len = input.len();
        if original_len <= max_bytes {
            debug!("Image already within size limit ({}KB)", original_len / KIB);
            return CompressionResult::unchanged(input, max_bytes);
        }

        match self.try_compress(&input, max_bytes) {
            Ok(outcome) => {
                let size = outcome.bytes.len();
                let within_budget = size <= max_bytes;
                info!(
                    "Compressed {}KB -> {}KB at quality 0.{} after {} attempts",
                    original_len / KIB,
                    size / KIB,
                    outcome.quality_tenths,
                    outcome.attempts
                );
                if !within_budget {
                    warn!(
                        "Image still large after compression: {}KB (target {}KB)",
                        size / KIB,
                        max_bytes / KIB
                    );
                }
                CompressionResult {
                    bytes: outcome.bytes,
                    size,
                    quality: Some(f32::from(outcome.quality_tenths) / 10.0),
                    attempts: outcome.attempts,
                    within_budget,
                }
            }
            Err(e) => {
                warn!("Compression failed, keeping original image: {:#}", e);
                CompressionResult::unchanged(input, max_bytes)
            }
        }
    }

    fn try_compress(&self, input: &[u8], max_bytes: usize) -> Result<SearchOutcome> {
        let rgb = decode_image(input)?.to_rgb8();
        search_quality(input.len(), max_bytes, |tenths| {
            self.encoder.encode(&rgb, tenths * 10)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records requested qualities and returns a payload of a fixed size per quality.
    pub(crate) struct SizedEncoder {
        pub sizes: fn(u8) -> usize,
        pub calls: Mutex<Vec<u8>>,
    }

    impl SizedEncoder {
        pub(crate) fn new(sizes: fn(u8) -> usize) -> Self {
            Self {
                sizes,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn qualities(&self) -> Vec<u8> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JpegEncoder for SizedEncoder {
        fn encode(&self, _image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(quality);
            Ok(vec![0u8; (self.sizes)(quality)])
        }
    }

    pub(crate) fn png_of_len(min_len: usize) -> Vec<u8> {
        // Noise does not compress, so the PNG grows with the pixel count.
        let side = ((min_len / 3) as f64).sqrt() as u32 + 8;
        let mut seed = 0x2545_F491u32;
        let img = RgbImage::from_fn(side, side, |_, _| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let b = seed.to_le_bytes();
            image::Rgb([b[0], b[1], b[2]])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn initial_quality_tiers() {
        assert_eq!(initial_quality(3000 * KIB), 3);
        assert_eq!(initial_quality(2000 * KIB + 1), 3);
        assert_eq!(initial_quality(2000 * KIB), 5);
        assert_eq!(initial_quality(1500 * KIB), 5);
        assert_eq!(initial_quality(600 * KIB), 7);
    }

    #[test]
    fn large_input_starts_at_0_3_and_stops_at_0_1() {
        let mut tried = Vec::new();
        let outcome = search_quality(3000 * KIB, 500 * KIB, |q| {
            tried.push(q);
            Ok(vec![0u8; 900 * KIB])
        })
        .unwrap();
        assert_eq!(tried, vec![3, 2, 1]);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.quality_tenths, 1);
    }

    #[test]
    fn attempts_are_capped_at_five() {
        let mut tried = Vec::new();
        let outcome = search_quality(600 * KIB, 10, |q| {
            tried.push(q);
            Ok(vec![0u8; 100])
        })
        .unwrap();
        assert_eq!(tried, vec![7, 6, 5, 4, 3]);
        assert_eq!(outcome.attempts, MAX_COMPRESSION_ATTEMPTS);
    }

    #[test]
    fn stops_as_soon_as_budget_is_met() {
        let outcome = search_quality(1500 * KIB, 500 * KIB, |q| {
            Ok(vec![0u8; if q >= 5 { 600 * KIB } else { 400 * KIB }])
        })
        .unwrap();
        assert_eq!(outcome.quality_tenths, 4);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn small_input_is_returned_unchanged() {
        let compressor = ImageCompressor::new(SizedEncoder::new(|_| 1));
        let input = vec![1u8, 2, 3];
        let result = compressor.compress(input.clone(), 500 * KIB);
        assert_eq!(result.bytes, input);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.quality, None);
        assert!(compressor.encoder().qualities().is_empty());
    }

    #[test]
    fn undecodable_input_falls_back_to_original() {
        let compressor = ImageCompressor::new(SizedEncoder::new(|_| 1));
        let garbage = vec![0x42u8; 4096];
        let result = compressor.compress(garbage.clone(), 1024);
        assert_eq!(result.bytes, garbage);
        assert_eq!(result.attempts, 0);
        assert!(!result.within_budget);
    }

    #[test]
    fn over_budget_result_is_flagged_not_rejected() {
        let compressor = ImageCompressor::new(SizedEncoder::new(|_| 2048));
        let input = png_of_len(4096);
        let result = compressor.compress(input, 1024);
        assert_eq!(compressor.encoder().qualities(), vec![70, 60, 50, 40, 30]);
        assert_eq!(result.size, 2048);
        assert!(!result.within_budget);
        assert_eq!(result.quality, Some(0.3));
    }

    #[test]
    fn turbojpeg_output_decodes() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([200, 30, 30]));
        let jpeg = TurboJpegEncoder.encode(&img, 80).unwrap();
        assert!(is_jpeg(&jpeg));
        let decoded = decode_image(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }
}
