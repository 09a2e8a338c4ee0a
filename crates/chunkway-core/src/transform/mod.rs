//! Pre-transfer transforms.
//!
//! A [`BeforeUpload`] hook runs once per entry, after the uploader starts
//! and before its channel is joined. It may replace the entry's backing
//! file; the reference token stays the same.
//!
//! [`ImageResize`] is the bundled hook: it scales images to fit a bounding
//! box and re-encodes them as raw RGB.
//!
//! ## Raw RGB Layout
//!
//! | Offset | Size | Content |
//! |--------|------|---------|
//! | 0 | 4 | Height (u32, big-endian) |
//! | 4 | 4 | Width (u32, big-endian) |
//! | 8 | 3 x width x height | RGB pixels, row-major |

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::file::{UploadFile, DEFAULT_MIME_TYPE};

/// Hook run on an entry's file before its channel is joined.
#[async_trait]
pub trait BeforeUpload: Send + Sync {
    /// Return a replacement file, or `None` to upload `file` unchanged.
    async fn before_upload(&self, file: &UploadFile) -> Result<Option<UploadFile>>;
}

/// Scales images to fit within a bounding box, keeping the aspect ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageResize {
    bound_width: u32,
    bound_height: u32,
}

impl ImageResize {
    /// Fit images within `bound_width` x `bound_height`.
    #[must_use]
    pub const fn new(bound_width: u32, bound_height: u32) -> Self {
        Self {
            bound_width,
            bound_height,
        }
    }

    /// Target dimensions for an image of `width` x `height`.
    ///
    /// The image is scaled (up or down) by the smaller of the two axis
    /// ratios, so it touches the box on at least one side.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn fit(&self, width: u32, height: u32) -> (u32, u32) {
        if width == 0 || height == 0 {
            return (0, 0);
        }
        let scale = (f64::from(self.bound_width) / f64::from(width))
            .min(f64::from(self.bound_height) / f64::from(height));

        let w = (f64::from(width) * scale).round().max(1.0) as u32;
        let h = (f64::from(height) * scale).round().max(1.0) as u32;
        (w, h)
    }

    /// Decode, resize and re-encode an image as raw RGB.
    pub fn encode(&self, name: &str, bytes: &[u8]) -> Result<Vec<u8>> {
        let img = image::load_from_memory(bytes).map_err(|e| Error::TransformFailed {
            file: name.to_string(),
            reason: e.to_string(),
        })?;

        let (w, h) = self.fit(img.width(), img.height());
        let rgb = img
            .resize_exact(w, h, image::imageops::FilterType::Triangle)
            .to_rgb8();

        let mut out = Vec::with_capacity(8 + rgb.as_raw().len());
        out.extend_from_slice(&rgb.height().to_be_bytes());
        out.extend_from_slice(&rgb.width().to_be_bytes());
        out.extend_from_slice(rgb.as_raw());
        Ok(out)
    }
}

#[async_trait]
impl BeforeUpload for ImageResize {
    async fn before_upload(&self, file: &UploadFile) -> Result<Option<UploadFile>> {
        if !file.mime_type().starts_with("image/") {
            return Ok(None);
        }

        let bytes = file.read_all().await?;
        let original_len = bytes.len();

        let resize = *self;
        let name = file.name().to_string();
        let encoded = tokio::task::spawn_blocking(move || resize.encode(&name, &bytes))
            .await
            .map_err(|e| Error::TransformFailed {
                file: file.name().to_string(),
                reason: e.to_string(),
            })??;
        tracing::debug!(
            "Resized {} from {original_len} to {} bytes",
            file.name(),
            encoded.len()
        );

        let mut resized =
            UploadFile::from_bytes(file.name(), DEFAULT_MIME_TYPE, file.last_modified(), encoded);
        if let Some(relative) = file.relative_path() {
            resized = resized.with_relative_path(relative);
        }
        Ok(Some(resized))
    }
}
