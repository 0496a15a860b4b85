//! Storage for screenshot bytes.

use crate::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::AsyncRead;
use tracing::debug;

/// Streaming reader over stored bytes.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `id`. `name` is kept alongside for operators.
    async fn put(&self, bytes: Vec<u8>, id: &str, name: &str) -> Result<(), StoreError>;

    /// Open the bytes stored under `id`, [`StoreError::NotFound`] when absent.
    async fn get(&self, id: &str) -> Result<BlobReader, StoreError>;
}

/// Blob store writing one file per blob under a directory.
///
/// Layout: `<dir>/<id>` holds the bytes, `<dir>/<id>.name` the source name.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    /// Create the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(StoreError::Backend(format!("invalid blob id: {id:?}")));
        }
        Ok(self.dir.join(id))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>, id: &str, name: &str) -> Result<(), StoreError> {
        let path = self.blob_path(id)?;
        let size = bytes.len();
        tokio::fs::write(&path, bytes).await?;
        tokio::fs::write(self.dir.join(format!("{id}.name")), name).await?;
        debug!(blob_id = id, size, "Stored blob at {}", path.display());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<BlobReader, StoreError> {
        let file = tokio::fs::File::open(self.blob_path(id)?).await?;
        Ok(Box::pin(file))
    }
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (String, Vec<u8>)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn name(&self, id: &str) -> Option<String> {
        self.blobs.get(id).map(|entry| entry.0.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>, id: &str, name: &str) -> Result<(), StoreError> {
        self.blobs.insert(id.to_string(), (name.to_string(), bytes));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<BlobReader, StoreError> {
        let bytes = self
            .blobs
            .get(id)
            .map(|entry| entry.1.clone())
            .ok_or(StoreError::NotFound)?;
        Ok(Box::pin(Cursor::new(bytes)))
    }
}
