//! In-memory content-addressable storage.
//!
//! Chunks are stored under their BLAKE3 key; files are ordered lists of chunk
//! keys under the key of their full content. Both are reference counted:
//! [`File`] handles and [`ChunkLease`]s keep entries alive. Unreferenced
//! entries stay cached until the store grows past its capacity, at which point
//! the least recently used ones are evicted.
//!
//! Readers of a progressive source can wait for a chunk that has not arrived
//! yet with [`Storage::wait_chunk`]; every [`Storage::put_chunk`] wakes the
//! waiters registered for that key.

pub mod chunker;
mod file;

pub use file::{ChunkLease, File};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result, StorageError};
use crate::key::ContentKey;
use crate::manifest::ChunkInfo;

/// Default capacity, 1 GiB.
pub const DEFAULT_CAPACITY: u64 = 1 << 30;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

struct Inner {
    capacity: u64,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    chunks: HashMap<ContentKey, ChunkEntry>,
    files: HashMap<ContentKey, FileEntry>,
    waiters: HashMap<ContentKey, Waiters>,
    used: u64,
    tick: u64,
}

struct ChunkEntry {
    data: Bytes,
    refs: usize,
    last_used: u64,
}

/// Tasks blocked in [`Storage::wait_chunk`] on one key.
struct Waiters {
    notify: Arc<Notify>,
    count: usize,
}

struct FileEntry {
    chunks: Arc<[ChunkInfo]>,
    size: u64,
    refs: usize,
    last_used: u64,
    info: String,
}

/// Snapshot of storage occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub files: usize,
    pub chunks: usize,
    pub bytes: u64,
    pub capacity: u64,
    pub referenced_files: usize,
    pub referenced_chunks: usize,
    /// Keys with at least one waiting reader.
    pub waiting: usize,
}

impl Storage {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Store a chunk and take a reference on it.
    pub fn put_chunk(&self, data: Bytes) -> ChunkLease {
        let key = ContentKey::digest(&data);
        let size = data.len() as u64;
        let waiter = {
            let mut state = self.inner.state.lock();
            let tick = state.next_tick();
            let inserted = match state.chunks.entry(key) {
                Entry::Occupied(mut e) => {
                    let entry = e.get_mut();
                    entry.refs += 1;
                    entry.last_used = tick;
                    false
                }
                Entry::Vacant(e) => {
                    e.insert(ChunkEntry {
                        data,
                        refs: 1,
                        last_used: tick,
                    });
                    true
                }
            };
            if inserted {
                state.used += size;
            }
            state.evict(self.inner.capacity);
            state.waiters.remove(&key)
        };
        if let Some(waiters) = waiter {
            trace!(chunk = ?key, count = waiters.count, "waking chunk waiters");
            waiters.notify.notify_waiters();
        }
        ChunkLease::new(self.clone(), key, size)
    }

    /// Take a reference on a chunk that is already stored.
    pub fn lease_chunk(&self, key: &ContentKey) -> Option<ChunkLease> {
        let mut state = self.inner.state.lock();
        let tick = state.next_tick();
        let entry = state.chunks.get_mut(key)?;
        entry.refs += 1;
        entry.last_used = tick;
        let size = entry.data.len() as u64;
        drop(state);
        Some(ChunkLease::new(self.clone(), *key, size))
    }

    pub fn has_chunk(&self, key: &ContentKey) -> bool {
        self.inner.state.lock().chunks.contains_key(key)
    }

    pub fn chunk(&self, key: &ContentKey) -> Option<Bytes> {
        let mut state = self.inner.state.lock();
        let tick = state.next_tick();
        let entry = state.chunks.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.data.clone())
    }

    /// Read a chunk, waiting for it to be stored if it is not present yet.
    ///
    /// Fails with [`Error::Disposed`] once `cancel` fires.
    pub async fn wait_chunk(&self, key: &ContentKey, cancel: &CancellationToken) -> Result<Bytes> {
        loop {
            let waiter = {
                let mut state = self.inner.state.lock();
                let tick = state.next_tick();
                if let Some(entry) = state.chunks.get_mut(key) {
                    entry.last_used = tick;
                    return Ok(entry.data.clone());
                }
                let waiters = state.waiters.entry(*key).or_insert_with(|| Waiters {
                    notify: Arc::new(Notify::new()),
                    count: 0,
                });
                waiters.count += 1;
                ChunkWaiter {
                    storage: self,
                    key: *key,
                    notify: waiters.notify.clone(),
                }
            };

            let notified = waiter.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A put may have landed between releasing the lock and enabling.
            if let Some(data) = self.chunk(key) {
                return Ok(data);
            }

            trace!(chunk = ?key, "waiting for chunk");
            // A chunk stored just before the cancel is still handed out.
            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(Error::Disposed),
            }
        }
    }

    /// Register a file made of the leased chunks, in order.
    ///
    /// The file key is the digest of the concatenated chunk contents. If the
    /// file is already known its reference count is increased instead.
    pub fn commit(&self, chunks: &[ChunkLease], info: &str) -> Result<File> {
        let mut state = self.inner.state.lock();
        let mut hasher = blake3::Hasher::new();
        let mut infos = Vec::with_capacity(chunks.len());
        for lease in chunks {
            let entry = state
                .chunks
                .get(lease.key())
                .ok_or_else(|| StorageError::NotFound(lease.key().to_hex()))?;
            hasher.update(&entry.data);
            infos.push(ChunkInfo {
                hash: *lease.key(),
                size: entry.data.len() as u64,
            });
        }
        let key = ContentKey::from(hasher.finalize());
        let tick = state.next_tick();

        if let Some(file) = state.files.get_mut(&key) {
            file.refs += 1;
            file.last_used = tick;
            let (chunks, size) = (file.chunks.clone(), file.size);
            drop(state);
            return Ok(File::new(self.clone(), key, chunks, size));
        }

        for info in &infos {
            if let Some(chunk) = state.chunks.get_mut(&info.hash) {
                chunk.refs += 1;
            }
        }
        let size = infos.iter().map(|c| c.size).sum();
        let chunks: Arc<[ChunkInfo]> = infos.into();
        state.files.insert(
            key,
            FileEntry {
                chunks: chunks.clone(),
                size,
                refs: 1,
                last_used: tick,
                info: info.to_string(),
            },
        );
        drop(state);
        debug!(file = ?key, size, chunks = chunks.len(), info, "file committed");
        Ok(File::new(self.clone(), key, chunks, size))
    }

    /// Store explicit chunks as one file.
    pub fn create_from_chunks<I>(&self, chunks: I, info: &str) -> Result<File>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let leases: Vec<_> = chunks.into_iter().map(|c| self.put_chunk(c)).collect();
        self.commit(&leases, info)
    }

    /// Read a stream to its end, chunk it and store it as one file.
    pub async fn ingest<R>(&self, mut reader: R, info: &str) -> Result<File>
    where
        R: AsyncRead + Unpin,
    {
        let mut leases = Vec::new();
        let mut buf = BytesMut::with_capacity(chunker::MAX_CHUNK_SIZE + READ_BUFFER_SIZE);
        loop {
            let n = reader.read_buf(&mut buf).await?;
            let eof = n == 0;
            if eof || buf.len() >= chunker::MAX_CHUNK_SIZE {
                while let Some(len) = chunker::find_boundary(&buf) {
                    leases.push(self.put_chunk(buf.split_to(len).freeze()));
                }
            }
            if eof {
                break;
            }
            buf.reserve(READ_BUFFER_SIZE);
        }
        if !buf.is_empty() {
            leases.push(self.put_chunk(buf.freeze()));
        }
        self.commit(&leases, info)
    }

    /// Open a stored file.
    pub fn get(&self, key: &ContentKey) -> std::result::Result<File, StorageError> {
        let mut state = self.inner.state.lock();
        let tick = state.next_tick();
        let entry = state
            .files
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_hex()))?;
        entry.refs += 1;
        entry.last_used = tick;
        let (chunks, size) = (entry.chunks.clone(), entry.size);
        drop(state);
        Ok(File::new(self.clone(), *key, chunks, size))
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.inner.state.lock().files.contains_key(key)
    }

    /// Look up a file by the start of its hex key.
    pub fn find(&self, prefix: &str) -> Option<ContentKey> {
        let state = self.inner.state.lock();
        state
            .files
            .keys()
            .find(|k| k.to_hex().starts_with(prefix))
            .copied()
    }

    pub fn stats(&self) -> StorageStats {
        let state = self.inner.state.lock();
        StorageStats {
            files: state.files.len(),
            chunks: state.chunks.len(),
            bytes: state.used,
            capacity: self.inner.capacity,
            referenced_files: state.files.values().filter(|f| f.refs > 0).count(),
            referenced_chunks: state.chunks.values().filter(|c| c.refs > 0).count(),
            waiting: state.waiters.len(),
        }
    }

    /// Reference count of a file, if stored.
    pub fn file_refs(&self, key: &ContentKey) -> Option<usize> {
        self.inner.state.lock().files.get(key).map(|f| f.refs)
    }

    /// Human-readable listing of the store.
    pub fn dump_statistics(&self) -> String {
        let stats = self.stats();
        let state = self.inner.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "storage: {} files, {} chunks, {} of {} bytes used",
            stats.files, stats.chunks, stats.bytes, stats.capacity
        );
        let mut files: Vec<_> = state.files.iter().collect();
        files.sort_by_key(|(_, f)| std::cmp::Reverse(f.last_used));
        for (key, file) in files {
            let _ = writeln!(
                out,
                "  {} size={} chunks={} refs={} info={:?}",
                key,
                file.size,
                file.chunks.len(),
                file.refs,
                file.info
            );
        }
        out
    }

    fn retain_file(&self, key: &ContentKey) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.files.get_mut(key) {
            entry.refs += 1;
        }
    }

    fn release_file(&self, key: &ContentKey) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.files.get_mut(key) {
            debug_assert!(entry.refs > 0, "file released more often than retained");
            entry.refs = entry.refs.saturating_sub(1);
        }
        state.evict(self.inner.capacity);
    }

    fn release_chunk(&self, key: &ContentKey) {
        let mut state = self.inner.state.lock();
        state.release_chunk_ref(key);
        state.evict(self.inner.capacity);
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl State {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn release_chunk_ref(&mut self, key: &ContentKey) {
        if let Some(entry) = self.chunks.get_mut(key) {
            debug_assert!(entry.refs > 0, "chunk released more often than leased");
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Drop unreferenced entries, oldest first, until under capacity.
    fn evict(&mut self, capacity: u64) {
        while self.used > capacity {
            let file = self
                .files
                .iter()
                .filter(|(_, f)| f.refs == 0)
                .min_by_key(|(_, f)| f.last_used)
                .map(|(k, _)| *k);
            if let Some(key) = file {
                if let Some(entry) = self.files.remove(&key) {
                    trace!(file = ?key, "evicting file");
                    for chunk in entry.chunks.iter() {
                        self.release_chunk_ref(&chunk.hash);
                    }
                }
                continue;
            }

            let chunk = self
                .chunks
                .iter()
                .filter(|(_, c)| c.refs == 0)
                .min_by_key(|(_, c)| c.last_used)
                .map(|(k, _)| *k);
            match chunk.and_then(|key| self.chunks.remove(&key)) {
                Some(entry) => self.used -= entry.data.len() as u64,
                None => break,
            }
        }
    }
}

/// One registration in [`State::waiters`], withdrawn on drop.
struct ChunkWaiter<'a> {
    storage: &'a Storage,
    key: ContentKey,
    notify: Arc<Notify>,
}

impl Drop for ChunkWaiter<'_> {
    fn drop(&mut self) {
        let mut state = self.storage.inner.state.lock();
        // A put takes the whole entry; a later entry for the key is not ours.
        let Some(waiters) = state
            .waiters
            .get_mut(&self.key)
            .filter(|w| Arc::ptr_eq(&w.notify, &self.notify))
        else {
            return;
        };
        waiters.count -= 1;
        if waiters.count == 0 {
            state.waiters.remove(&self.key);
        }
    }
}
