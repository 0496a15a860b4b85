//! Read side: stored screenshots and their version history.

use crate::metadata::{Metadata, MetadataStore, VersionRequest};
use crate::{BlobReader, BlobStore, StoreError};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ScreenshotQuery {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl ScreenshotQuery {
    pub fn new(metadata: Arc<dyn MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { metadata, blobs }
    }

    /// Resolve `version` for `url` and open the stored bytes.
    pub async fn get_screenshot(
        &self,
        url: &str,
        version: VersionRequest,
    ) -> Result<(Metadata, BlobReader), StoreError> {
        let record = match version {
            VersionRequest::Specific(v) => self.metadata.get(url, v).await?,
            VersionRequest::Latest => self
                .metadata
                .get_all_versions(url)
                .await?
                .into_iter()
                .max_by_key(|m| m.version)
                .ok_or(StoreError::NotFound)?,
        };

        debug!(url, version = record.version, blob_id = %record.blob_id, "Opening screenshot");
        let reader = self.blobs.get(&record.blob_id).await?;
        Ok((record, reader))
    }

    /// All versions of `url`, newest first.
    pub async fn get_versions(&self, url: &str) -> Result<Vec<Metadata>, StoreError> {
        let mut versions = self.metadata.get_all_versions(url).await?;
        versions.sort_unstable_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }
}
