//! Redis-backed metadata store
//!
//! Keys (with the configured prefix):
//!
//! - `<prefix>:counter:<url>` holds the current version, advanced with `INCR`
//! - `<prefix>:versions:<url>` is a hash of version -> JSON record, written
//!   with `HSETNX` so existing versions are never overwritten

use crate::metadata::{Metadata, MetadataStore};
use crate::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct RedisMetadataStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl std::fmt::Debug for RedisMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMetadataStore")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisMetadataStore {
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        connect_timeout: Duration,
    ) -> Result<Self, StoreError> {
        info!("Connecting to Redis metadata store at {}", url);

        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                StoreError::Backend(format!("timed out after {connect_timeout:?} connecting to {url}"))
            })??;

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn counter_key(&self, url: &str) -> String {
        format!("{}:counter:{}", self.key_prefix, url)
    }

    fn versions_key(&self, url: &str) -> String {
        format!("{}:versions:{}", self.key_prefix, url)
    }
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn save(&self, metadata: &mut Metadata) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();

        let version: u32 = conn.incr(self.counter_key(&metadata.url), 1).await?;
        metadata.version = version;
        if metadata.id.is_empty() {
            metadata.id = uuid::Uuid::new_v4().to_string();
        }

        let record = serde_json::to_string(metadata)?;
        let inserted: bool = conn
            .hset_nx(self.versions_key(&metadata.url), version, record)
            .await?;
        if !inserted {
            return Err(StoreError::Backend(format!(
                "version {version} of {} already exists",
                metadata.url
            )));
        }

        debug!(url = %metadata.url, version, "Saved screenshot metadata");
        Ok(())
    }

    async fn get(&self, url: &str, version: u32) -> Result<Metadata, StoreError> {
        let mut conn = self.conn.clone();
        let record: Option<String> = conn.hget(self.versions_key(url), version).await?;
        match record {
            Some(record) => Ok(serde_json::from_str(&record)?),
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_all_versions(&self, url: &str) -> Result<Vec<Metadata>, StoreError> {
        let mut conn = self.conn.clone();
        let records: HashMap<u32, String> = conn.hgetall(self.versions_key(url)).await?;
        records
            .values()
            .map(|record| serde_json::from_str(record).map_err(StoreError::from))
            .collect()
    }
}
