use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::wishlist::WishList;
use crate::error::{Error, Result, StorageError};
use crate::key::ContentKey;
use crate::manifest::{Manifest, MAX_WIRE_CHUNK_SIZE};
use crate::pipe::FlushWriter;
use crate::storage::{ChunkLease, File, Storage};

/// Receiving side of a delta transfer.
///
/// On creation the builder pins every manifest chunk that storage already
/// holds; everything else goes on the wish list. [`Builder::reconstruct`]
/// then consumes the chunk stream, stores each arriving chunk right away (so
/// the partial file can be relayed) and registers the finished file.
pub struct Builder {
    storage: Storage,
    manifest: Manifest,
    owned: Vec<Option<ChunkLease>>,
    wishes: WishList,
    info: String,
}

impl Builder {
    pub fn new(storage: Storage, manifest: Manifest, info: impl Into<String>) -> Self {
        let owned: Vec<_> = manifest
            .chunks()
            .iter()
            .map(|c| storage.lease_chunk(&c.hash))
            .collect();
        let wishes = WishList::from_wanted(
            manifest
                .permutation()
                .iter()
                .map(|index| owned.get(index).is_none_or(|o| o.is_none())),
        );
        let info = info.into();
        debug!(
            chunks = manifest.chunks().len(),
            owned = owned.iter().filter(|o| o.is_some()).count(),
            info = %info,
            "builder created"
        );
        Self {
            storage,
            manifest,
            owned,
            wishes,
            info,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn wish_list(&self) -> &WishList {
        &self.wishes
    }

    /// Bytes the remote will have to send.
    pub fn bytes_wanted(&self) -> u64 {
        self.manifest
            .permutation()
            .iter()
            .enumerate()
            .filter(|(position, _)| self.wishes.is_wanted(*position))
            .filter_map(|(_, index)| self.manifest.chunks().get(index))
            .fold(0u64, |total, c| total.saturating_add(c.size))
    }

    pub async fn write_wish_list<W>(&self, out: &mut W) -> Result<()>
    where
        W: FlushWriter + ?Sized,
    {
        self.wishes.write_to(out).await
    }

    /// Read the requested chunks from `stream` and assemble the file.
    ///
    /// Nothing is registered under a file key unless every chunk arrived and
    /// matched its hash.
    pub async fn reconstruct<R>(self, mut stream: R) -> Result<File>
    where
        R: AsyncRead + Unpin,
    {
        let Builder {
            storage,
            manifest,
            owned,
            wishes,
            info,
        } = self;

        let mut received: Vec<Option<ChunkLease>> = owned.iter().map(|_| None).collect();
        for (position, index) in manifest.permutation().iter().enumerate() {
            if !wishes.is_wanted(position) {
                continue;
            }
            let chunk = manifest
                .chunks()
                .get(index)
                .ok_or_else(|| Error::protocol(format!("no chunk at index {index}")))?;
            if chunk.size > MAX_WIRE_CHUNK_SIZE {
                return Err(Error::protocol(format!(
                    "chunk {index} too large: {} bytes",
                    chunk.size
                )));
            }

            let mut buf = BytesMut::zeroed(chunk.size as usize);
            stream.read_exact(&mut buf).await?;
            let data = buf.freeze();

            let actual = ContentKey::digest(&data);
            if actual != chunk.hash {
                return Err(StorageError::HashMismatch {
                    expected: chunk.hash,
                    actual,
                }
                .into());
            }
            trace!(position, index, size = chunk.size, "received chunk");
            if let Some(slot) = received.get_mut(index) {
                *slot = Some(storage.put_chunk(data));
            }
        }

        let mut probe = [0u8; 1];
        if stream.read(&mut probe).await? != 0 {
            return Err(Error::protocol("unexpected data after the last requested chunk"));
        }

        let leases = owned
            .into_iter()
            .zip(received)
            .enumerate()
            .map(|(index, (owned, received))| {
                owned
                    .or(received)
                    .ok_or_else(|| Error::protocol(format!("chunk {index} never arrived")))
            })
            .collect::<Result<Vec<_>>>()?;

        storage.commit(&leases, &info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::manifest::{ChunkInfo, Permutation};

    fn parts() -> Vec<Bytes> {
        vec![
            Bytes::from(vec![1u8; 10]),
            Bytes::from(vec![2u8; 20]),
            Bytes::from(vec![3u8; 30]),
        ]
    }

    fn manifest_for(parts: &[Bytes], perm: Vec<u32>) -> Manifest {
        let chunks = parts
            .iter()
            .map(|p| ChunkInfo {
                hash: ContentKey::digest(p),
                size: p.len() as u64,
            })
            .collect();
        Manifest::new(chunks, Permutation::new(perm).unwrap()).unwrap()
    }

    #[test]
    fn test_wish_list_excludes_owned_chunks() {
        let parts = parts();
        let storage = Storage::default();
        let _owned = storage.put_chunk(parts[1].clone());

        let builder = Builder::new(storage, manifest_for(&parts, vec![2, 0, 1]), "t");
        // Chunk 1 sits at transfer position 2.
        assert_eq!(builder.wish_list(), &WishList::from_wanted([true, true, false]));
        assert_eq!(builder.bytes_wanted(), 40);
    }

    #[tokio::test]
    async fn test_reconstruct_from_permuted_stream() {
        let parts = parts();
        let storage = Storage::default();
        let builder = Builder::new(storage.clone(), manifest_for(&parts, vec![2, 0, 1]), "t");

        let mut wish_bytes = Vec::<u8>::new();
        builder.write_wish_list(&mut wish_bytes).await.unwrap();
        assert_eq!(wish_bytes, vec![0b1110_0000]);

        let stream = [parts[2].clone(), parts[0].clone(), parts[1].clone()].concat();
        let file = builder.reconstruct(&stream[..]).await.unwrap();

        let original = parts.concat();
        assert_eq!(file.key(), &ContentKey::digest(&original));
        assert_eq!(file.size(), 60);
        let mut out = Vec::new();
        file.write_to(&mut out).await.unwrap();
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_is_rejected() {
        let parts = parts();
        let storage = Storage::default();
        let builder = Builder::new(storage.clone(), manifest_for(&parts, vec![0, 1, 2]), "t");

        let mut stream = parts.concat();
        stream[15] ^= 0xFF;
        let result = builder.reconstruct(&stream[..]).await;
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::HashMismatch { .. }))
        ));
        assert_eq!(storage.stats().files, 0);
    }

    #[tokio::test]
    async fn test_short_stream_registers_nothing() {
        let parts = parts();
        let storage = Storage::default();
        let builder = Builder::new(storage.clone(), manifest_for(&parts, vec![0, 1, 2]), "t");

        let stream = parts.concat();
        let result = builder.reconstruct(&stream[..50]).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(storage.stats().files, 0);
    }

    #[tokio::test]
    async fn test_trailing_bytes_are_rejected() {
        let parts = parts();
        let storage = Storage::default();
        let builder = Builder::new(storage.clone(), manifest_for(&parts, vec![0, 1, 2]), "t");

        let mut stream = parts.concat();
        stream.push(0);
        let result = builder.reconstruct(&stream[..]).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
