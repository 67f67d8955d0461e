//! Chunk manifest served on `GET /file/<prefix>`.
//!
//! Wire format (JSON):
//!
//! ```text
//! {"chunks":[{"hash":"<64 hex>","size":10},...],"permutation":[2,0,1]}
//! ```
//!
//! `permutation[position]` is the index of the chunk sent at transfer
//! position `position`. Both peers must use the same permutation: it is the
//! only way to map a byte offset of the chunk stream back to a chunk, and the
//! wish list is indexed by transfer position too.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::ContentKey;
use crate::storage::File;

/// Upper bound on a single chunk accepted from the wire.
pub const MAX_WIRE_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Hash and length of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub hash: ContentKey,
    pub size: u64,
}

/// Bijection from transfer position to chunk index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct Permutation(Vec<u32>);

impl Permutation {
    pub fn new(order: Vec<u32>) -> Result<Self> {
        let mut seen = vec![false; order.len()];
        for &index in &order {
            match seen.get_mut(index as usize) {
                Some(slot) if !*slot => *slot = true,
                Some(_) => {
                    return Err(Error::protocol(format!(
                        "permutation repeats index {index}"
                    )))
                }
                None => {
                    return Err(Error::protocol(format!(
                        "permutation index {index} out of range 0..{}",
                        order.len()
                    )))
                }
            }
        }
        Ok(Self(order))
    }

    pub fn identity(len: usize) -> Self {
        Self((0..len as u32).collect())
    }

    /// Fresh random transfer order.
    pub fn random(len: usize) -> Self {
        let mut order: Vec<u32> = (0..len as u32).collect();
        order.shuffle(&mut rand::rng());
        Self(order)
    }

    /// Reproducible shuffle.
    pub fn seeded(len: usize, seed: u64) -> Self {
        let mut order: Vec<u32> = (0..len as u32).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        Self(order)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Chunk indices in transfer order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().map(|&i| i as usize)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }
}

impl TryFrom<Vec<u32>> for Permutation {
    type Error = Error;

    fn try_from(order: Vec<u32>) -> Result<Self> {
        Self::new(order)
    }
}

impl From<Permutation> for Vec<u32> {
    fn from(perm: Permutation) -> Self {
        perm.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawManifest")]
pub struct Manifest {
    chunks: Vec<ChunkInfo>,
    permutation: Permutation,
}

#[derive(Deserialize)]
struct RawManifest {
    chunks: Vec<ChunkInfo>,
    permutation: Permutation,
}

impl TryFrom<RawManifest> for Manifest {
    type Error = Error;

    fn try_from(raw: RawManifest) -> Result<Self> {
        Self::new(raw.chunks, raw.permutation)
    }
}

impl Manifest {
    pub fn new(chunks: Vec<ChunkInfo>, permutation: Permutation) -> Result<Self> {
        if chunks.len() != permutation.len() {
            return Err(Error::protocol(format!(
                "permutation covers {} positions but manifest has {} chunks",
                permutation.len(),
                chunks.len()
            )));
        }
        if let Some((index, chunk)) = chunks
            .iter()
            .enumerate()
            .find(|(_, c)| c.size > MAX_WIRE_CHUNK_SIZE)
        {
            return Err(Error::protocol(format!(
                "chunk {index} too large: {} bytes",
                chunk.size
            )));
        }
        Ok(Self {
            chunks,
            permutation,
        })
    }

    pub fn from_file(file: &File, permutation: Permutation) -> Result<Self> {
        Self::new(file.chunks().to_vec(), permutation)
    }

    pub fn chunks(&self) -> &[ChunkInfo] {
        &self.chunks
    }

    pub fn permutation(&self) -> &Permutation {
        &self.permutation
    }

    pub fn size(&self) -> u64 {
        self.chunks
            .iter()
            .fold(0u64, |total, c| total.saturating_add(c.size))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::protocol(format!("encoding manifest: {e}")))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::protocol(format!("decoding manifest: {e}")))
    }
}
