//! Pulling files from a remote file handler.

mod pull;

pub use pull::{fetch_manifest, sync_from, sync_with_manifest};
