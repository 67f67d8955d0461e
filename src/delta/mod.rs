//! Chunk-level delta transfer.
//!
//! ```text
//!  requester                                  server
//!  +---------+   wish list (1 bit/position)   +-------------------+
//!  | Builder | -----------------------------> | write_chunk_data  |
//!  |         | <----------------------------- |  (ChunkSource)    |
//!  +---------+   wished chunks, perm order    +-------------------+
//! ```
//!
//! Positions are transfer positions: position `p` carries chunk
//! `permutation[p]`. Chunks are concatenated without framing; their lengths
//! come from the manifest both sides share.

mod builder;
mod transfer;
mod wishlist;

pub use builder::Builder;
pub use crate::manifest::MAX_WIRE_CHUNK_SIZE;
pub use transfer::write_chunk_data;
pub use wishlist::{WishList, WishListReader};
