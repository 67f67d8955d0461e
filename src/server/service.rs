//! Orchestration: which files are served, and moving files in and out of
//! storage.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Client, Url};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use super::handler::FileHandler;
use super::{expand_tilde, file_route};
use crate::error::{Error, Result, StorageError};
use crate::key::{ContentKey, KEY_PREFIX_LEN};
use crate::manifest::Permutation;
use crate::storage::{File, Storage};
use crate::sync::{fetch_manifest, sync_with_manifest};

/// Handlers by key prefix, and the storage they serve from.
struct State {
    storage: Storage,
    handlers: HashMap<String, Arc<FileHandler>>,
}

impl State {
    fn new(capacity: u64) -> Self {
        Self {
            storage: Storage::new(capacity),
            handlers: HashMap::new(),
        }
    }
}

pub struct Service {
    state: RwLock<State>,
    client: Client,
    capacity: u64,
    data_dir: PathBuf,
}

impl Service {
    /// `data_dir` resolves the relative paths given to load and save.
    pub fn new(capacity: u64, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            state: RwLock::new(State::new(capacity)),
            client,
            capacity,
            data_dir: data_dir.into(),
        })
    }

    pub fn storage(&self) -> Storage {
        self.state.read().storage.clone()
    }

    pub fn handler(&self, prefix: &str) -> Option<Arc<FileHandler>> {
        self.state.read().handlers.get(prefix).cloned()
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let path = expand_tilde(path);
        if path.is_absolute() {
            path
        } else {
            self.data_dir.join(path)
        }
    }

    /// Serve `file` under its key prefix and return the route.
    ///
    /// A complete handler already serving the key is kept; a relay handler
    /// is replaced and disposed.
    pub fn serve_file(&self, file: &File) -> Result<String> {
        let prefix = file.key().prefix();
        let route = file_route(&prefix);

        let replaced = {
            let mut state = self.state.write();
            if let Some(existing) = state.handlers.get(&prefix) {
                if !existing.is_progressive() && !existing.is_disposed() {
                    debug!(%route, "file already served");
                    return Ok(route);
                }
            }
            let handler = FileHandler::from_file(file, Permutation::random(file.num_chunks()))?;
            state.handlers.insert(prefix, Arc::new(handler))
        };
        if let Some(old) = replaced {
            old.dispose();
        }

        info!(%route, key = %file.key(), size = file.size(), "serving file");
        Ok(route)
    }

    /// Read a local file into storage and serve it.
    pub async fn load_file(&self, path: &Path) -> Result<ContentKey> {
        let path = self.resolve(path);
        let reader = BufReader::new(tokio::fs::File::open(&path).await?);
        let file = self
            .storage()
            .ingest(reader, &path.display().to_string())
            .await?;
        info!(path = %path.display(), key = %file.key(), chunks = file.num_chunks(), "loaded file");
        self.serve_file(&file)?;
        Ok(*file.key())
    }

    /// Write a stored file to `path`, which must not exist yet.
    pub async fn save_file(&self, hash: &str, path: &Path) -> Result<u64> {
        let storage = self.storage();
        let key = resolve_key(&storage, hash)?;
        let file = storage.get(&key)?;
        let path = self.resolve(path);

        let out = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(out) => out,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyExists(path));
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = BufWriter::new(out);
        let written = file.write_to(&mut out).await?;
        out.flush().await?;

        info!(path = %path.display(), key = %key.prefix(), bytes = written, "saved file");
        Ok(written)
    }

    /// Pull the file served at `source` into storage and serve it.
    ///
    /// While the transfer runs, the partial file is relayed under the
    /// source's prefix so other nodes can pull from this one. The relay is
    /// withdrawn and disposed however the sync ends, including when this
    /// future is dropped.
    pub async fn sync_file(&self, source: &str, cancel: &CancellationToken) -> Result<ContentKey> {
        let prefix = source_prefix(source)?;
        let storage = self.storage();
        let manifest = fetch_manifest(&self.client, source, cancel).await?;

        let _relay = Relay::register(
            self,
            prefix.clone(),
            FileHandler::progressive(manifest.clone(), storage.clone())
                .with_span(info_span!("relay", file = %prefix)),
        );

        let file = sync_with_manifest(
            &storage,
            &self.client,
            source,
            manifest,
            cancel,
            &format!("synced from {source}"),
        )
        .await?;
        self.serve_file(&file)?;
        Ok(*file.key())
    }

    fn unregister(&self, prefix: &str, handler: &Arc<FileHandler>) {
        let mut state = self.state.write();
        if state
            .handlers
            .get(prefix)
            .is_some_and(|h| Arc::ptr_eq(h, handler))
        {
            state.handlers.remove(prefix);
            debug!(route = %file_route(prefix), "relay withdrawn");
        }
    }

    /// Storage statistics followed by the served routes.
    pub fn list(&self) -> String {
        let state = self.state.read();
        let mut out = state.storage.dump_statistics();
        let mut prefixes: Vec<_> = state.handlers.iter().collect();
        prefixes.sort_by(|a, b| a.0.cmp(b.0));
        let _ = writeln!(out, "serving {} files:", prefixes.len());
        for (prefix, handler) in prefixes {
            let kind = if handler.is_progressive() { "relay" } else { "complete" };
            let _ = writeln!(
                out,
                "  {} {} bytes ({kind})",
                file_route(prefix),
                handler.manifest().size()
            );
        }
        out
    }

    /// Start over with empty storage. Every handler is disposed.
    pub fn reset(&self) {
        let old = std::mem::replace(&mut *self.state.write(), State::new(self.capacity));
        let count = old.handlers.len();
        for handler in old.handlers.into_values() {
            handler.dispose();
        }
        info!(handlers = count, "reset storage");
    }
}

/// Progressive handler serving a file while it is being synced.
///
/// Registered only if nothing is served under the prefix yet. Dropping it
/// removes the handler unless something else has replaced it, then disposes
/// it, which fails any transfer still waiting on missing chunks.
struct Relay<'a> {
    service: &'a Service,
    prefix: String,
    handler: Arc<FileHandler>,
    registered: bool,
}

impl<'a> Relay<'a> {
    fn register(service: &'a Service, prefix: String, handler: FileHandler) -> Self {
        let handler = Arc::new(handler);
        let registered = {
            let mut state = service.state.write();
            match state.handlers.entry(prefix.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(e) => {
                    e.insert(handler.clone());
                    true
                }
            }
        };
        if registered {
            debug!(route = %file_route(&prefix), "relaying partial file");
        }
        Self {
            service,
            prefix,
            handler,
            registered,
        }
    }
}

impl Drop for Relay<'_> {
    fn drop(&mut self) {
        if self.registered {
            self.service.unregister(&self.prefix, &self.handler);
        }
        self.handler.dispose();
    }
}

/// Full key for `hash`, which may also be a hex prefix of at
/// least [`KEY_PREFIX_LEN`] characters.
fn resolve_key(storage: &Storage, hash: &str) -> Result<ContentKey> {
    let hash = hash.trim();
    let is_prefix = hash.len() >= KEY_PREFIX_LEN
        && hash.len() < 64
        && hash.bytes().all(|b| b.is_ascii_hexdigit());
    if is_prefix {
        return storage
            .find(&hash.to_ascii_lowercase())
            .ok_or_else(|| StorageError::NotFound(hash.to_string()).into());
    }
    Ok(ContentKey::parse(hash)?)
}

/// Key prefix a source URL serves, taken from its last non-empty path
/// segment.
pub fn source_prefix(source: &str) -> Result<String> {
    let url = Url::parse(source).map_err(|e| Error::protocol(format!("invalid source '{source}': {e}")))?;
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(str::to_owned)
        .ok_or_else(|| {
            warn!(%source, "source URL has no file segment");
            Error::protocol(format!("source '{source}' names no file"))
        })
}
