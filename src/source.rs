//! Where a served file's chunk bytes come from.
//!
//! A [`ChunkSource`] is either backed by a complete local [`File`] or by a
//! manifest whose chunks are still arriving in [`Storage`]. Both hand out a
//! [`Chunks`] collection; reading from the progressive variant waits until
//! the chunk has been stored or the source is disposed.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result, StorageError};
use crate::manifest::ChunkInfo;
use crate::storage::{File, Storage};

pub enum ChunkSource {
    Complete(File),
    Progressive {
        storage: Storage,
        chunks: Arc<[ChunkInfo]>,
        disposed: CancellationToken,
    },
}

impl ChunkSource {
    /// Serve a finished file. Takes its own reference on the file.
    pub fn complete(file: &File) -> Self {
        ChunkSource::Complete(file.duplicate())
    }

    /// Serve chunks as they show up in `storage`.
    pub fn progressive(storage: Storage, chunks: impl Into<Arc<[ChunkInfo]>>) -> Self {
        ChunkSource::Progressive {
            storage,
            chunks: chunks.into(),
            disposed: CancellationToken::new(),
        }
    }

    pub fn is_progressive(&self) -> bool {
        matches!(self, ChunkSource::Progressive { .. })
    }

    pub fn chunks(&self) -> Result<Chunks> {
        match self {
            ChunkSource::Complete(file) => {
                if !file.storage().contains(file.key()) {
                    return Err(StorageError::NotFound(file.key().to_hex()).into());
                }
                Ok(Chunks {
                    infos: file.chunks().clone(),
                    reader: ChunkReader::Complete(file.duplicate()),
                })
            }
            ChunkSource::Progressive {
                storage,
                chunks,
                disposed,
            } => {
                if disposed.is_cancelled() {
                    return Err(Error::Disposed);
                }
                Ok(Chunks {
                    infos: chunks.clone(),
                    reader: ChunkReader::Progressive {
                        storage: storage.clone(),
                        disposed: disposed.clone(),
                    },
                })
            }
        }
    }

    /// Release the source. Readers blocked on a progressive source fail with
    /// [`Error::Disposed`].
    pub fn dispose(self) {
        match self {
            ChunkSource::Complete(file) => {
                debug!(file = ?file.key(), "disposing complete chunk source");
                drop(file);
            }
            ChunkSource::Progressive { disposed, .. } => {
                debug!("disposing progressive chunk source");
                disposed.cancel();
            }
        }
    }
}

/// Ordered chunk readers handed to one transfer.
pub struct Chunks {
    infos: Arc<[ChunkInfo]>,
    reader: ChunkReader,
}

enum ChunkReader {
    Complete(File),
    Progressive {
        storage: Storage,
        disposed: CancellationToken,
    },
}

impl Chunks {
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn info(&self, index: usize) -> Option<&ChunkInfo> {
        self.infos.get(index)
    }

    /// Bytes of chunk `index`. May wait on a progressive source.
    pub async fn read(&self, index: usize) -> Result<Bytes> {
        let info = self.infos.get(index).ok_or_else(|| {
            Error::protocol(format!("chunk index {index} out of range 0..{}", self.len()))
        })?;
        match &self.reader {
            ChunkReader::Complete(file) => file
                .storage()
                .chunk(&info.hash)
                .ok_or_else(|| StorageError::NotFound(info.hash.to_hex()).into()),
            ChunkReader::Progressive { storage, disposed } => {
                storage.wait_chunk(&info.hash, disposed).await
            }
        }
    }
}
