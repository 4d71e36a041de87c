use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{revision_dir, revision_path, BlobStore, BlobStoreError};

/// Local filesystem blob store rooted at a storage directory.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, file_name: &str, revision: u32) -> PathBuf {
        revision_path(&self.base_path, file_name, revision)
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn exists(&self, file_name: &str, revision: u32) -> Result<bool, BlobStoreError> {
        Ok(self.blob_path(file_name, revision).exists())
    }

    async fn write(
        &self,
        file_name: &str,
        revision: u32,
        data: Bytes,
    ) -> Result<(), BlobStoreError> {
        let dir = revision_dir(&self.base_path, file_name, revision);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.blob_path(file_name, revision);
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }

    async fn read(&self, file_name: &str, revision: u32) -> Result<Option<Bytes>, BlobStoreError> {
        let path = self.blob_path(file_name, revision);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        Ok(Some(Bytes::from(data)))
    }

    async fn delete(&self, file_name: &str, revision: u32) -> Result<bool, BlobStoreError> {
        let path = self.blob_path(file_name, revision);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(true)
    }

    async fn remove_empty_dir(
        &self,
        file_name: &str,
        revision: u32,
    ) -> Result<bool, BlobStoreError> {
        let dir = revision_dir(&self.base_path, file_name, revision);
        if !dir.is_dir() {
            return Ok(false);
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        if entries.next_entry().await?.is_some() {
            return Ok(false);
        }

        tokio::fs::remove_dir(&dir).await?;
        Ok(true)
    }
}
