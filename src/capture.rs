//! Capture-and-persist pipeline run by workers for every job.

use crate::metadata::{Metadata, MetadataStore};
use crate::metrics;
use crate::{BlobStore, CaptureError, ImageFormat, Renderer};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Renders a URL, stores the bytes and records a new metadata version.
#[derive(Clone)]
pub struct CaptureService {
    renderer: Arc<dyn Renderer>,
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    format: ImageFormat,
    quality: u8,
}

impl CaptureService {
    pub fn new(
        renderer: Arc<dyn Renderer>,
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        format: ImageFormat,
        quality: u8,
    ) -> Self {
        Self {
            renderer,
            blobs,
            metadata,
            format,
            quality,
        }
    }

    pub async fn capture_and_save(&self, url: &str) -> Result<Metadata, CaptureError> {
        let start = Instant::now();

        let bytes = self.renderer.render(url, self.format, self.quality).await?;
        verify_image(&bytes, self.format)?;
        let size = bytes.len();

        let blob_id = uuid::Uuid::new_v4().to_string();
        self.blobs
            .put(bytes, &blob_id, url)
            .await
            .map_err(|source| CaptureError::Blob {
                blob_id: blob_id.clone(),
                source,
            })?;
        debug!(url, blob_id = %blob_id, size, "Stored screenshot bytes");

        let mut record = Metadata::new(url, self.format, self.quality, blob_id);
        self.metadata
            .save(&mut record)
            .await
            .map_err(|source| CaptureError::Metadata {
                url: url.to_string(),
                source,
            })?;

        metrics::record_version_saved(start.elapsed());
        info!(url, version = record.version, "Captured screenshot in {:?}", start.elapsed());
        Ok(record)
    }
}

impl std::fmt::Debug for CaptureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureService")
            .field("format", &self.format)
            .field("quality", &self.quality)
            .finish()
    }
}

fn verify_image(bytes: &[u8], expected: ImageFormat) -> Result<(), CaptureError> {
    let invalid = |reason: String| CaptureError::InvalidImage {
        expected: expected.to_string(),
        reason,
    };

    let detected = image::guess_format(bytes).map_err(|e| invalid(e.to_string()))?;
    let wanted = match expected {
        ImageFormat::Png => image::ImageFormat::Png,
        ImageFormat::Jpeg => image::ImageFormat::Jpeg,
        ImageFormat::Webp => image::ImageFormat::WebP,
    };

    if detected == wanted {
        Ok(())
    } else {
        Err(invalid(format!("detected {detected:?}")))
    }
}
