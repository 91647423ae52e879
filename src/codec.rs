//! Frame encode/decode.
//!
//! The codec is stateless and safely reusable across frames within a
//! session. Decode enforces the configured payload ceiling before touching
//! the bytes, so a malicious or buggy client cannot amplify memory use.
//! Encode honors the active [`QualityProfile`]: resolution is capped to the
//! tier's longest edge (aspect preserved) and JPEG quality follows the
//! tier, keeping output size characteristics stable per tier.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use tracing::trace;

use crate::error::{RelayError, Result};
use crate::quality::QualityProfile;

/// Stateless image codec with a decode-side byte limit.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Decode a compressed frame payload into a raw image.
    ///
    /// Rejects empty and oversized payloads up front; truncated or garbage
    /// payloads surface as a decode error from the underlying format
    /// parser. All failures are recoverable per-frame errors.
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(RelayError::decode("empty frame payload"));
        }
        if bytes.len() > self.max_frame_bytes {
            return Err(RelayError::OversizedFrame {
                actual: bytes.len(),
                limit: self.max_frame_bytes,
            });
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| RelayError::decode(format!("unreadable frame: {e}")))?;
        trace!(width = image.width(), height = image.height(), "decoded frame");
        Ok(image)
    }

    /// Encode a raw image at the given quality tier.
    pub fn encode(&self, image: &DynamicImage, profile: QualityProfile) -> Result<Vec<u8>> {
        let ceiling = profile.max_dimension();
        let scaled;
        let image = if image.width().max(image.height()) > ceiling {
            scaled = image.resize(ceiling, ceiling, FilterType::Triangle);
            &scaled
        } else {
            image
        };

        // JPEG has no alpha channel; normalize to RGB before encoding.
        let rgb = image.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, profile.jpeg_quality())
            .encode_image(&rgb)
            .map_err(|e| RelayError::Encode {
                reason: "jpeg encode failed".into(),
                source: Some(Box::new(e)),
            })?;
        trace!(bytes = out.len(), ?profile, "encoded frame");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, ensure};
    use image::{Rgb, RgbImage};

    /// Deterministic test pattern with enough detail that JPEG quality
    /// visibly changes output size.
    fn test_image(width: u32, height: u32) -> DynamicImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            let checker = if (x / 8 + y / 8) % 2 == 0 { 200 } else { 40 };
            Rgb([checker, (x % 256) as u8, (y % 256) as u8])
        });
        DynamicImage::ImageRgb8(img)
    }

    fn codec() -> FrameCodec {
        FrameCodec::new(4 * 1024 * 1024)
    }

    #[test]
    fn roundtrip_respects_profile_resolution_ceiling() -> anyhow::Result<()> {
        let codec = codec();
        let source = test_image(800, 600);

        for profile in [
            QualityProfile::UltraPerformance,
            QualityProfile::HighPerformance,
            QualityProfile::Balanced,
            QualityProfile::HighQuality,
        ] {
            let bytes = codec
                .encode(&source, profile)
                .with_context(|| format!("encoding at {profile:?}"))?;
            let decoded = codec.decode(&bytes).context("decoding own output")?;
            ensure!(
                decoded.width().max(decoded.height()) <= profile.max_dimension(),
                "{profile:?} exceeded its resolution ceiling: {}x{}",
                decoded.width(),
                decoded.height()
            );
        }
        Ok(())
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let codec = codec();
        let source = test_image(160, 120);
        let bytes = codec.encode(&source, QualityProfile::HighQuality).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn empty_payload_is_rejected() {
        let err = codec().decode(&[]).unwrap_err();
        assert!(matches!(err, RelayError::Decode { .. }));
        assert_eq!(err.code(), "decode_error");
    }

    #[test]
    fn oversized_payload_is_rejected_before_parsing() {
        let codec = FrameCodec::new(16);
        let err = codec.decode(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, RelayError::OversizedFrame { actual: 17, limit: 16 }));
    }

    #[test]
    fn truncated_payload_is_a_decode_error() {
        let codec = codec();
        let full = codec.encode(&test_image(64, 64), QualityProfile::Balanced).unwrap();
        let err = codec.decode(&full[..full.len() / 2]).unwrap_err();
        assert!(matches!(err, RelayError::Decode { .. }));
    }

    #[test]
    fn encode_is_deterministic_per_tier() {
        let codec = codec();
        let source = test_image(320, 240);
        let a = codec.encode(&source, QualityProfile::Balanced).unwrap();
        let b = codec.encode(&source, QualityProfile::Balanced).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cheaper_tiers_produce_smaller_output() {
        let codec = codec();
        let source = test_image(960, 720);
        let ultra = codec.encode(&source, QualityProfile::UltraPerformance).unwrap();
        let high = codec.encode(&source, QualityProfile::HighQuality).unwrap();
        assert!(
            ultra.len() < high.len(),
            "ultra-performance ({}) should be smaller than high-quality ({})",
            ultra.len(),
            high.len()
        );
    }
}
