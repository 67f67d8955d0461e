//! HTTP handler serving one file's manifest and chunks.
//!
//! `GET` returns the manifest. `POST` is the delta transfer: the request body
//! carries the requester's wish list, the response body the wished chunks.
//! Both flow at the same time over the one exchange. The requester must send
//! `Connection: close`: the exchange owns the connection for its whole
//! lifetime, and the directive is what marks a request as a duplex transfer.

use std::io;
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use parking_lot::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::delta::write_chunk_data;
use crate::error::{Error, Result};
use crate::manifest::{Manifest, Permutation};
use crate::pipe::{pipe, PIPE_CAPACITY};
use crate::source::{ChunkSource, Chunks};
use crate::storage::{File, Storage};

/// Serves one file. Create one per distinct content key and call
/// [`FileHandler::dispose`] when it is no longer routed to.
pub struct FileHandler {
    source: Mutex<Option<ChunkSource>>,
    manifest: Manifest,
    span: Span,
}

impl FileHandler {
    /// Serve a complete file. The handler holds its own reference on it.
    pub fn from_file(file: &File, perm: Permutation) -> Result<Self> {
        let manifest = Manifest::from_file(file, perm)?;
        Ok(Self {
            source: Mutex::new(Some(ChunkSource::complete(file))),
            manifest,
            span: info_span!("serve", file = %file.key().prefix()),
        })
    }

    /// Serve a file that is still arriving in `storage`. Chunk reads wait
    /// until the chunk has been stored.
    pub fn progressive(manifest: Manifest, storage: Storage) -> Self {
        let chunks = manifest.chunks().to_vec();
        Self {
            source: Mutex::new(Some(ChunkSource::progressive(storage, chunks))),
            manifest,
            span: info_span!("relay"),
        }
    }

    /// Replace the span the handler logs under.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn is_disposed(&self) -> bool {
        self.source.lock().is_none()
    }

    pub fn is_progressive(&self) -> bool {
        self.source
            .lock()
            .as_ref()
            .is_some_and(ChunkSource::is_progressive)
    }

    /// Release the chunk source. Safe to call more than once and from several
    /// threads; only the first call has an effect.
    pub fn dispose(&self) {
        let source = self.source.lock().take();
        if let Some(source) = source {
            let _enter = self.span.enter();
            debug!("disposing file handler");
            source.dispose();
        }
    }

    fn chunks(&self) -> Result<Chunks> {
        match self.source.lock().as_ref() {
            Some(source) => source.chunks(),
            None => Err(Error::Disposed),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request.method() {
            &Method::GET => self.serve_manifest(),
            &Method::POST => self.transfer(request).instrument(self.span.clone()).await,
            _ => Error::MethodNotAllowed.into_response(),
        }
    }

    fn serve_manifest(&self) -> Response {
        match self.manifest.to_json() {
            Ok(body) => ([(CONTENT_TYPE, "application/json")], body).into_response(),
            Err(e) => {
                warn!(parent: &self.span, error = %e, "serving manifest failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }

    async fn transfer(&self, request: Request) -> Response {
        if !requests_close(request.headers()) {
            warn!("rejecting transfer without Connection: close");
            return StatusCode::BAD_REQUEST.into_response();
        }

        let chunks = match self.chunks() {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "acquiring chunks failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        let perm = self.manifest.permutation().clone();
        let wishes = StreamReader::new(request.into_body().into_data_stream().map_err(io::Error::other));
        let (mut out, body) = pipe(PIPE_CAPACITY);

        tokio::spawn(
            async move {
                let start = Instant::now();
                let (mut skipped, mut transferred) = (0u64, 0u64);
                debug!(chunks = chunks.len(), "starting chunk transfer");
                let result = write_chunk_data(&chunks, 0, wishes, &perm, &mut out, |to_transfer, sent| {
                    skipped = to_transfer.unsigned_abs();
                    transferred = sent;
                })
                .await;

                let elapsed = start.elapsed();
                let kib_per_sec = transferred as f64 / elapsed.as_secs_f64().max(1e-9) / 1024.0;
                info!(
                    ?elapsed,
                    kib_transferred = transferred >> 10,
                    kib_per_sec = format_args!("{kib_per_sec:.2}"),
                    kib_skipped = skipped >> 10,
                    "chunk transfer finished"
                );

                match result {
                    Ok(()) => out.close(),
                    Err(e) => {
                        warn!(error = %e, "chunk transfer failed");
                        out.close_with_error(io::Error::other(e.to_string())).await;
                    }
                }
            }
            .in_current_span(),
        );

        (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(body),
        )
            .into_response()
    }
}

impl Drop for FileHandler {
    fn drop(&mut self) {
        if let Some(source) = self.source.get_mut().take() {
            source.dispose();
        }
    }
}

/// Whether the `Connection` header carries the `close` token.
pub fn requests_close(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
