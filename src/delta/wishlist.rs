use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::pipe::FlushWriter;

/// Wish-list bytes per sink write.
const WISH_LIST_FRAME: usize = 4096;

/// One bit per transfer position, most significant bit first; set bits are
/// chunks the requester still needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WishList {
    bits: Vec<u8>,
    len: usize,
}

impl WishList {
    pub fn from_wanted<I>(wanted: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        let mut bits = Vec::new();
        let mut len = 0;
        for want in wanted {
            if len % 8 == 0 {
                bits.push(0);
            }
            if want {
                if let Some(byte) = bits.last_mut() {
                    *byte |= 0x80 >> (len % 8);
                }
            }
            len += 1;
        }
        Self { bits, len }
    }

    pub fn all(len: usize) -> Self {
        Self::from_wanted(std::iter::repeat_n(true, len))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_wanted(&self, position: usize) -> bool {
        position < self.len
            && self
                .bits
                .get(position / 8)
                .is_some_and(|b| b & (0x80 >> (position % 8)) != 0)
    }

    pub fn count_wanted(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub async fn write_to<W>(&self, out: &mut W) -> Result<()>
    where
        W: FlushWriter + ?Sized,
    {
        for frame in self.bits.chunks(WISH_LIST_FRAME) {
            out.write_flush(Bytes::copy_from_slice(frame)).await?;
        }
        Ok(())
    }
}

/// Reads wish bits off a stream as the requester produces them.
pub struct WishListReader<R> {
    reader: R,
    current: u8,
    remaining: u8,
}

impl<R> WishListReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            current: 0,
            remaining: 0,
        }
    }

    /// Wish bit of the next transfer position. Waits for the next byte when
    /// the current one is used up.
    pub async fn next_wanted(&mut self) -> Result<bool> {
        if self.remaining == 0 {
            self.current = self.reader.read_u8().await?;
            self.remaining = 8;
        }
        self.remaining -= 1;
        Ok((self.current >> self.remaining) & 1 == 1)
    }
}
