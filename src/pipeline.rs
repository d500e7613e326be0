use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::types::ActionKind;

/// Screenshot cost reduction: downscale, optional desaturation, re-encode.
/// A pure bytes-to-bytes transform with no knowledge of safety or planning.
/// The output is guaranteed to never exceed the input size.
#[derive(Debug, Clone)]
pub struct ImagePipeline {
    scale: f32,
    quality: u8,
    grayscale: bool,
}

/// Basic properties of an encoded image, for before/after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
}

impl ImagePipeline {
    pub fn new(scale: f32, quality: u8, grayscale: bool) -> Self {
        Self {
            scale: scale.clamp(f32::MIN_POSITIVE, 1.0),
            quality: quality.clamp(1, 100),
            grayscale,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.screenshot_scale,
            config.screenshot_quality,
            config.grayscale,
        )
    }

    /// Whether capture can be skipped entirely for this action: minor
    /// actions (hover, wait) after an already-successful validation leave
    /// no pending UI change worth re-checking.
    pub fn should_skip(&self, action: &ActionKind, previous_validation_ok: bool) -> bool {
        previous_validation_ok
            && matches!(action, ActionKind::Hover { .. } | ActionKind::Wait { .. })
    }

    /// Re-encode a raw capture with the configured scale/quality/grayscale
    /// settings. Falls back to the input bytes whenever processing would
    /// grow the payload, so the result is monotonically non-increasing.
    pub fn process(&self, raw: &[u8]) -> Result<Vec<u8>, AgentError> {
        let img = image::load_from_memory(raw)?;

        let img = if self.scale < 1.0 {
            let width = ((img.width() as f32 * self.scale) as u32).max(1);
            let height = ((img.height() as f32 * self.scale) as u32).max(1);
            img.resize_exact(width, height, FilterType::Lanczos3)
        } else {
            img
        };

        let img = if self.grayscale {
            DynamicImage::ImageLuma8(img.to_luma8())
        } else {
            img
        };

        let mut out = Vec::new();
        if self.grayscale {
            // JPEG for grayscale, where the quality knob actually pays off.
            let mut encoder = JpegEncoder::new_with_quality(&mut out, self.quality);
            encoder
                .encode_image(&img)
                .map_err(AgentError::from)?;
        } else {
            img.write_to(&mut Cursor::new(&mut out), ImageOutputFormat::Png)?;
        }

        if out.len() >= raw.len() {
            debug!(
                raw = raw.len(),
                processed = out.len(),
                "re-encode did not shrink; keeping original bytes"
            );
            return Ok(raw.to_vec());
        }
        Ok(out)
    }

    pub fn info(bytes: &[u8]) -> Result<ImageInfo, AgentError> {
        let img = image::load_from_memory(bytes)?;
        Ok(ImageInfo {
            width: img.width(),
            height: img.height(),
            bytes: bytes.len(),
        })
    }
}
