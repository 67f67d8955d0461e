//! Content-defined delta file sync over HTTP.
//!
//! Nodes keep files in a content-addressed chunk store and serve each file
//! at `/file/<key prefix>`. A node pulling a file fetches the manifest, then
//! runs one duplex POST: it streams a bitmap of the chunks it lacks while the
//! server streams those chunks back in a randomized order. A node that is
//! still pulling a file relays the chunks it already has to others.

pub mod config;
pub mod delta;
pub mod error;
pub mod key;
pub mod manifest;
pub mod pipe;
pub mod server;
pub mod source;
pub mod storage;
pub mod sync;

pub use error::{Error, Result, StorageError};
pub use key::ContentKey;
pub use manifest::{ChunkInfo, Manifest, Permutation};
pub use server::{FileHandler, Service};
pub use source::ChunkSource;
pub use storage::{File, Storage};
pub use sync::{fetch_manifest, sync_from, sync_with_manifest};
