//! Blob storage for raw documents and OCR text.
//!
//! Keys are opaque strings; the pipeline uses `raw/<correlation_id>` for
//! ingested documents and `ocr/<correlation_id>.txt` for extracted text.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::ObjectStoreConfig;

/// Key for the raw OCR text of an invoice.
pub fn raw_ocr_key(correlation_id: uuid::Uuid) -> String {
    format!("ocr/{}.txt", correlation_id)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Filesystem-backed object store rooted at a directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &ObjectStoreConfig) -> Self {
        Self::new(&config.root)
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        // Keys are forward-slash paths relative to the root; anything that
        // escapes the root is rejected.
        let relative = Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("invalid object key: {}", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }
}
