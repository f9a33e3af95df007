//! Durable storage for task checkpoints
//!
//! `open(location, name)` yields a file handle supporting read, write and
//! an explicit durability flush. Tasks use it for their own checkpoints;
//! the coordination core never touches it.

pub mod local;
pub mod s3;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::Result;

pub use local::{LocalFile, LocalStore};
pub use s3::{S3Client, S3Config, S3File, S3Store};

/// Size of each read when draining a file
const READ_CHUNK: usize = 64 * 1024;

/// An open durable file
#[async_trait]
pub trait StoreFile: Send {
    /// Read into `buf`; returns 0 at end of file
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Append `data`
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Make everything written so far durable
    async fn sync(&mut self) -> Result<()>;

    /// Read everything left
    async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out.freeze())
    }
}

/// A place to open durable files
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn open(&self, location: &str, name: &str) -> Result<Box<dyn StoreFile>>;
}
