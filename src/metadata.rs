//! Versioned screenshot metadata
//!
//! Every capture of a URL becomes a new immutable [`Metadata`] record whose
//! version is taken from a per-URL counter. The counter is only ever advanced
//! through the backend's atomic increment-and-fetch, so concurrent saves for
//! the same URL always receive distinct, consecutive versions.

use crate::{ImageFormat, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

/// A single stored screenshot version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub url: String,
    pub format: ImageFormat,
    pub quality: u8,
    /// Assigned by [`MetadataStore::save`], starting at 1.
    pub version: u32,
    pub blob_id: String,
    pub created_at: DateTime<Utc>,
}

impl Metadata {
    /// New unsaved record, version 0 until stored.
    pub fn new(
        url: impl Into<String>,
        format: ImageFormat,
        quality: u8,
        blob_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            format,
            quality,
            version: 0,
            blob_id: blob_id.into(),
            created_at: Utc::now(),
        }
    }

    /// MIME type of the stored bytes, e.g. `image/png`.
    pub fn content_type(&self) -> String {
        format!("image/{}", self.format)
    }
}

/// Which version of a URL to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionRequest {
    #[default]
    Latest,
    Specific(u32),
}

impl std::fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionRequest::Latest => f.write_str("latest"),
            VersionRequest::Specific(v) => write!(f, "{v}"),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Assign the next version of `metadata.url` and insert the record.
    ///
    /// Fills `version` (and `id` when empty) in place. Never overwrites an
    /// existing record.
    async fn save(&self, metadata: &mut Metadata) -> Result<(), StoreError>;

    /// Fetch one version, [`StoreError::NotFound`] when absent.
    async fn get(&self, url: &str, version: u32) -> Result<Metadata, StoreError>;

    /// Every stored version of `url`, in no particular order.
    async fn get_all_versions(&self, url: &str) -> Result<Vec<Metadata>, StoreError>;
}

/// In-process metadata store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    counters: DashMap<String, u32>,
    records: DashMap<String, HashMap<u32, Metadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic increment-and-fetch of the per-URL counter.
    fn next_version(&self, url: &str) -> u32 {
        let mut counter = self.counters.entry(url.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn save(&self, metadata: &mut Metadata) -> Result<(), StoreError> {
        let version = self.next_version(&metadata.url);
        metadata.version = version;
        if metadata.id.is_empty() {
            metadata.id = uuid::Uuid::new_v4().to_string();
        }

        let mut versions = self.records.entry(metadata.url.clone()).or_default();
        match versions.entry(version) {
            Entry::Vacant(slot) => {
                slot.insert(metadata.clone());
            }
            Entry::Occupied(_) => {
                return Err(StoreError::Backend(format!(
                    "version {version} of {} already exists",
                    metadata.url
                )));
            }
        }

        debug!(url = %metadata.url, version, "Saved screenshot metadata");
        Ok(())
    }

    async fn get(&self, url: &str, version: u32) -> Result<Metadata, StoreError> {
        self.records
            .get(url)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or(StoreError::NotFound)
    }

    async fn get_all_versions(&self, url: &str) -> Result<Vec<Metadata>, StoreError> {
        Ok(self
            .records
            .get(url)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }
}
