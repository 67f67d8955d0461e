//! HTTP surface: per-file handlers plus the orchestration endpoints.
//!
//! | route            | method | effect                                   |
//! |------------------|--------|------------------------------------------|
//! | `/file/{prefix}` | any    | [`FileHandler`] for the file             |
//! | `/load`          | POST   | `path=`: ingest a local file and serve it |
//! | `/save`          | POST   | `hash=&path=`: export a stored file      |
//! | `/sync`          | POST   | `source=`: pull a file from another node |
//! | `/list`          | GET    | storage and handler listing              |
//! | `/reset`         | POST   | drop everything                          |

mod handler;
mod service;

pub use handler::{requests_close, FileHandler};
pub use service::{source_prefix, Service};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as RoutePath, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Form, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Route a file with the given key prefix is served under.
pub fn file_route(prefix: &str) -> String {
    format!("/file/{prefix}")
}

/// Expand tilde (~) in paths to the user's home directory.
pub(crate) fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/file/{prefix}", any(serve_file))
        .route("/load", post(load))
        .route("/save", post(save))
        .route("/sync", post(sync))
        .route("/list", get(list))
        .route("/reset", post(reset))
        .with_state(service)
}

/// Serve `service` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, service: Arc<Service>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = ?listener.local_addr().ok(), "listening");
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn serve_file(
    State(service): State<Arc<Service>>,
    RoutePath(prefix): RoutePath<String>,
    request: Request,
) -> Response {
    match service.handler(&prefix) {
        Some(handler) => handler.handle(request).await,
        None => (StatusCode::NOT_FOUND, format!("no file served under {prefix}")).into_response(),
    }
}

#[derive(Deserialize)]
struct LoadForm {
    path: PathBuf,
}

async fn load(State(service): State<Arc<Service>>, Form(form): Form<LoadForm>) -> Result<String> {
    let key = service.load_file(&form.path).await?;
    Ok(key.to_hex())
}

#[derive(Deserialize)]
struct SaveForm {
    hash: String,
    path: PathBuf,
}

async fn save(State(service): State<Arc<Service>>, Form(form): Form<SaveForm>) -> Result<String> {
    let written = service.save_file(&form.hash, &form.path).await?;
    Ok(format!("saved {written} bytes to {}", form.path.display()))
}

#[derive(Deserialize)]
struct SyncForm {
    source: String,
}

async fn sync(State(service): State<Arc<Service>>, Form(form): Form<SyncForm>) -> Result<String> {
    // The sync is dropped with the request. The token's guard stops the wish
    // list writer and the relay is withdrawn when `sync_file` is dropped.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let key = service.sync_file(&form.source, &cancel).await?;
    Ok(key.to_hex())
}

async fn list(State(service): State<Arc<Service>>) -> String {
    service.list()
}

async fn reset(State(service): State<Arc<Service>>) -> &'static str {
    service.reset();
    "reset done"
}
