//! Content-defined chunking.
//!
//! Boundaries come from a gear rolling hash so that an insertion near the
//! start of a file only disturbs the chunks around it. Identical input always
//! produces identical boundaries.

/// Smallest chunk emitted, except for the tail of a stream.
pub const MIN_CHUNK_SIZE: usize = 8 * 1024;

/// Hard upper bound on a chunk.
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

// 16 bits taken from the top of the hash: ~64 KiB past the minimum on average.
const BOUNDARY_MASK: u64 = 0xFFFF << 48;

static GEAR: [u64; 256] = gear_table();

const fn gear_table() -> [u64; 256] {
    // splitmix64
    let mut table = [0u64; 256];
    let mut state: u64 = 0x5EED_C0FF_EE15_600D;
    let mut i = 0;
    while i < 256 {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        table[i] = z ^ (z >> 31);
        i += 1;
    }
    table
}

/// Length of the first chunk at the start of `data`.
///
/// Returns `None` when no boundary was found and `data` is shorter than
/// [`MAX_CHUNK_SIZE`]; the caller should then supply more data, or treat the
/// whole buffer as the final chunk at end of stream.
pub fn find_boundary(data: &[u8]) -> Option<usize> {
    let end = data.len().min(MAX_CHUNK_SIZE);
    let mut hash = 0u64;
    for (i, &b) in data.iter().enumerate().take(end).skip(MIN_CHUNK_SIZE) {
        hash = (hash << 1).wrapping_add(GEAR[b as usize]);
        if hash & BOUNDARY_MASK == 0 {
            return Some(i + 1);
        }
    }
    if data.len() >= MAX_CHUNK_SIZE {
        Some(MAX_CHUNK_SIZE)
    } else {
        None
    }
}

/// Split a complete buffer into chunk lengths.
pub fn split(data: &[u8]) -> Vec<usize> {
    let mut lengths = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let len = find_boundary(rest).unwrap_or(rest.len());
        lengths.push(len);
        rest = &rest[len..];
    }
    lengths
}
