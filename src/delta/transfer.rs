use tokio::io::AsyncRead;
use tracing::trace;

use super::wishlist::WishListReader;
use crate::error::{Error, Result};
use crate::manifest::Permutation;
use crate::pipe::FlushWriter;
use crate::source::Chunks;

/// Send the wished chunks in transfer order.
///
/// Wish bits are read from `wishes` one transfer position at a time, so the
/// requester may still be writing its wish list while chunks flow back. Each
/// wished chunk is written and flushed as one unit; chunks that are not wished
/// are never read from storage.
///
/// `progress` is called after every position with `(to_transfer,
/// transferred)`: `to_transfer` goes down by the size of every skipped chunk
/// (so it ends at minus the bytes saved), `transferred` counts the bytes sent
/// on top of `start_offset`.
pub async fn write_chunk_data<R, W, F>(
    chunks: &Chunks,
    start_offset: u64,
    wishes: R,
    perm: &Permutation,
    out: &mut W,
    mut progress: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: FlushWriter,
    F: FnMut(i64, u64),
{
    if perm.len() != chunks.len() {
        return Err(Error::protocol(format!(
            "permutation covers {} positions but source has {} chunks",
            perm.len(),
            chunks.len()
        )));
    }

    let mut wishes = WishListReader::new(wishes);
    let mut to_transfer = 0i64;
    let mut transferred = start_offset;

    for (position, index) in perm.iter().enumerate() {
        let size = chunks
            .info(index)
            .map(|info| info.size)
            .ok_or_else(|| Error::protocol(format!("no chunk at index {index}")))?;

        if !wishes.next_wanted().await? {
            trace!(position, index, size, "skipping chunk");
            to_transfer = to_transfer.saturating_sub(i64::try_from(size).unwrap_or(i64::MAX));
            progress(to_transfer, transferred);
            continue;
        }

        let data = chunks.read(index).await?;
        trace!(position, index, size, "sending chunk");
        out.write_flush(data).await?;
        transferred = transferred.saturating_add(size);
        progress(to_transfer, transferred);
    }

    Ok(())
}
