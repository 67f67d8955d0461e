use std::fmt;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::Storage;
use crate::error::{Result, StorageError};
use crate::key::ContentKey;
use crate::manifest::ChunkInfo;

/// Counted handle on a stored file. Dropping it releases the reference.
pub struct File {
    storage: Storage,
    key: ContentKey,
    chunks: Arc<[ChunkInfo]>,
    size: u64,
}

impl File {
    pub(super) fn new(storage: Storage, key: ContentKey, chunks: Arc<[ChunkInfo]>, size: u64) -> Self {
        Self {
            storage,
            key,
            chunks,
            size,
        }
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn chunks(&self) -> &Arc<[ChunkInfo]> {
        &self.chunks
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// A second handle on the same file, counted separately.
    pub fn duplicate(&self) -> File {
        self.storage.retain_file(&self.key);
        File::new(
            self.storage.clone(),
            self.key,
            self.chunks.clone(),
            self.size,
        )
    }

    /// Stream the file contents into `writer`, returning the bytes written.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        for chunk in self.chunks.iter() {
            let data = self
                .storage
                .chunk(&chunk.hash)
                .ok_or_else(|| StorageError::NotFound(chunk.hash.to_hex()))?;
            writer.write_all(&data).await?;
            written += data.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.storage.release_file(&self.key);
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// Counted reference on a stored chunk.
pub struct ChunkLease {
    storage: Storage,
    key: ContentKey,
    size: u64,
}

impl ChunkLease {
    pub(super) fn new(storage: Storage, key: ContentKey, size: u64) -> Self {
        Self { storage, key, size }
    }

    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        self.storage.release_chunk(&self.key);
    }
}

impl fmt::Debug for ChunkLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkLease")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish()
    }
}
