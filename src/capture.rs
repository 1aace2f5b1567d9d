//! Photo capture flow: locate, geocode, compress, geotag.

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::compression::{decode_image, CompressionResult, ImageCompressor, JpegEncoder, TurboJpegEncoder};
use crate::constants::*;
use crate::exif_parser;
use crate::geo::PositionSample;
use crate::geocoding::{AddressRecord, ReverseGeocoder};
use crate::geotag::GeotagRenderer;
use crate::location::{LocationConfig, LocationError, LocationTracker, PositionProvider};

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub max_image_bytes: usize,
    /// Photos at or below this size skip compression.
    pub compress_threshold_bytes: usize,
    pub geotag_quality: u8,
    pub location: LocationConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            compress_threshold_bytes: DEFAULT_COMPRESS_THRESHOLD_BYTES,
            geotag_quality: GEOTAG_JPEG_QUALITY,
            location: LocationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Device,
    PhotoExif,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturedPhoto {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub location: Option<PositionSample>,
    pub position_source: Option<PositionSource>,
    pub address: Option<AddressRecord>,
    pub compression: CompressionResult,
}

impl CapturedPhoto {
    pub fn is_geotagged(&self) -> bool {
        self.location.is_some()
    }
}

pub struct CapturePipeline<P, E = TurboJpegEncoder> {
    tracker: Arc<LocationTracker<P>>,
    geocoder: Arc<ReverseGeocoder>,
    compressor: Arc<ImageCompressor<E>>,
    renderer: GeotagRenderer,
    config: CaptureConfig,
}

impl<P: PositionProvider> CapturePipeline<P, TurboJpegEncoder> {
    pub fn new(tracker: Arc<LocationTracker<P>>, geocoder: Arc<ReverseGeocoder>, config: CaptureConfig) -> Self {
        Self::with_compressor(tracker, geocoder, ImageCompressor::default(), config)
    }
}

impl<P, E> CapturePipeline<P, E>
where
    P: PositionProvider,
    E: JpegEncoder + 'static,
{
    pub fn with_compressor(
        tracker: Arc<LocationTracker<P>>,
        geocoder: Arc<ReverseGeocoder>,
        compressor: ImageCompressor<E>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            tracker,
            geocoder,
            compressor: Arc::new(compressor),
            renderer: GeotagRenderer::new(),
            config,
        }
    }

    /// Turns a raw photo into the artifact handed to submission.
    ///
    /// Fails only when location permission is denied or the bytes are not a
    /// decodable image. Without any position the photo is returned
    /// compressed but not geotagged.
    pub async fn process(&self, photo: Vec<u8>) -> Result<CapturedPhoto> {
        let captured_at = Local::now();
        let (location, position_source) = self.locate(&photo).await?;
        let orientation = exif_parser::orientation(&photo);

        let compressor = Arc::clone(&self.compressor);
        let max_bytes = self.config.max_image_bytes;
        let threshold = self.config.compress_threshold_bytes;
        let compression = tokio::task::spawn_blocking(move || {
            if photo.len() > threshold {
                compressor.compress(photo, max_bytes)
            } else {
                CompressionResult::unchanged(photo, max_bytes)
            }
        })
        .await
        .context("Compression task failed")?;

        let Some(sample) = location else {
            warn!("No position available, photo will not be geotagged");
            return Ok(CapturedPhoto {
                bytes: compression.bytes.clone(),
                location: None,
                position_source: None,
                address: None,
                compression,
            });
        };

        let address = self.geocoder.resolve_address(sample.coordinate).await;

        let compressor = Arc::clone(&self.compressor);
        let renderer = self.renderer;
        let quality = self.config.geotag_quality;
        let source = compression.bytes.clone();
        let tag_address = address.clone();
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let image = exif_parser::apply_orientation(decode_image(&source)?, orientation);
            let annotated = renderer.annotate_at(image, &sample, &tag_address, &captured_at);
            compressor.encoder().encode(&annotated.to_rgb8(), quality)
        })
        .await
        .context("Geotag task failed")??;

        info!(
            "Geotagged photo at {} ({}), {}KB",
            sample.coordinate,
            address.formatted,
            bytes.len() / KIB
        );

        Ok(CapturedPhoto {
            bytes,
            location: Some(sample),
            position_source,
            address: Some(address),
            compression,
        })
    }

    async fn locate(&self, photo: &[u8]) -> Result<(Option<PositionSample>, Option<PositionSource>)> {
        match self.tracker.get_current_position(&self.config.location).await {
            Ok(sample) => Ok((Some(sample), Some(PositionSource::Device))),
            Err(LocationError::PermissionDenied) => Err(LocationError::PermissionDenied.into()),
            Err(e) => {
                warn!("Could not get current position for capture: {}", e);
                match exif_parser::gps_coordinate(photo) {
                    Some(coordinate) => {
                        info!("Using GPS position embedded in photo: {}", coordinate);
                        Ok((
                            Some(PositionSample::new(coordinate, None)),
                            Some(PositionSource::PhotoExif),
                        ))
                    }
                    None => Ok((None, None)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::tests::{png_of_len, SizedEncoder};
    use crate::geo::Coordinate;
    use crate::geocoding::NominatimProvider;
    use crate::location::tests::ScriptedProvider;
    use std::time::Duration;

    fn offline_geocoder() -> Arc<ReverseGeocoder> {
        Arc::new(
            ReverseGeocoder::new(
                vec![Box::new(NominatimProvider::new("http://127.0.0.1:9/reverse"))],
                Duration::from_secs(1),
            )
            .unwrap(),
        )
    }

    fn pipeline(
        script: Vec<std::result::Result<Coordinate, LocationError>>,
        config: CaptureConfig,
    ) -> CapturePipeline<ScriptedProvider> {
        let tracker = Arc::new(LocationTracker::new(ScriptedProvider::new(script)));
        CapturePipeline::new(tracker, offline_geocoder(), config)
    }

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            location: LocationConfig {
                max_age_ms: 0,
                ..LocationConfig::default()
            },
            ..CaptureConfig::default()
        }
    }

    fn photo() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(400, 300, image::Rgb([90, 140, 200]));
        TurboJpegEncoder.encode(&img, 90).unwrap()
    }

    #[tokio::test]
    async fn geotags_with_synthetic_address_when_offline() {
        let pipeline = pipeline(vec![Ok(Coordinate::new(12.9716, 77.5946))], small_config());
        let captured = pipeline.process(photo()).await.unwrap();

        assert!(captured.is_geotagged());
        assert_eq!(captured.position_source, Some(PositionSource::Device));
        assert_eq!(captured.address.as_ref().unwrap().formatted, "12.9716, 77.5946");
        assert_eq!(captured.compression.attempts, 0);

        let decoded = decode_image(&captured.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (400, 300));
    }

    #[tokio::test]
    async fn permission_denied_is_reported() {
        let pipeline = pipeline(vec![Err(LocationError::PermissionDenied)], small_config());
        let err = pipeline.process(photo()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LocationError>(),
            Some(&LocationError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn unavailable_position_returns_untagged_photo() {
        let pipeline = pipeline(vec![Err(LocationError::PositionUnavailable)], small_config());
        let input = photo();
        let captured = pipeline.process(input.clone()).await.unwrap();
        assert!(!captured.is_geotagged());
        assert!(captured.address.is_none());
        assert_eq!(captured.bytes, input);
    }

    #[tokio::test]
    async fn large_photo_goes_through_compression() {
        let tracker = Arc::new(LocationTracker::new(ScriptedProvider::new(vec![Err(
            LocationError::Timeout,
        )])));
        let config = CaptureConfig {
            max_image_bytes: 2 * KIB,
            compress_threshold_bytes: KIB,
            ..small_config()
        };
        let pipeline = CapturePipeline::with_compressor(
            tracker,
            offline_geocoder(),
            ImageCompressor::new(SizedEncoder::new(|q| usize::from(q) * 40)),
            config,
        );

        // 0.7 -> 2800 bytes, 0.6 -> 2400, 0.5 -> 2000 fits the 2 KiB budget
        let captured = pipeline.process(png_of_len(8 * KIB)).await.unwrap();
        assert_eq!(captured.compression.attempts, 3);
        assert_eq!(captured.compression.quality, Some(0.5));
        assert!(captured.compression.within_budget);
        assert!(!captured.is_geotagged());
        assert_eq!(captured.bytes.len(), 2000);
    }
}
