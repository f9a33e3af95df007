//! Local filesystem storage

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{DurableStore, StoreFile};
use crate::error::Result;

/// Files under a local directory; `location` is the directory
#[derive(Debug, Clone, Default)]
pub struct LocalStore;

impl LocalStore {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DurableStore for LocalStore {
    /// Opens read-write, creating the file if missing
    async fn open(&self, location: &str, name: &str) -> Result<Box<dyn StoreFile>> {
        let path = PathBuf::from(location).join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        debug!("Opened {}", path.display());
        Ok(Box::new(LocalFile { file, path }))
    }
}

pub struct LocalFile {
    file: File,
    path: PathBuf,
}

#[async_trait]
impl StoreFile for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf).await?)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn sync(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        debug!("Synced {}", self.path.display());
        Ok(())
    }
}
