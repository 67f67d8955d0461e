//! Client side of a delta transfer.

use std::io;
use std::time::Instant;

use futures::TryStreamExt;
use reqwest::header::{CONNECTION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::delta::Builder;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::pipe::{pipe, PIPE_CAPACITY};
use crate::storage::{File, Storage};

/// Fetch the manifest a file handler publishes at `url`.
pub async fn fetch_manifest(client: &Client, url: &str, cancel: &CancellationToken) -> Result<Manifest> {
    let fetch = async {
        let response = client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::protocol(format!(
                "manifest request to {url} returned {}",
                response.status()
            )));
        }
        let body = response.bytes().await?;
        Manifest::from_json(&body)
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fetch => result,
    }
}

/// Pull the chunks of `manifest` that `storage` lacks from `url` and
/// register the rebuilt file.
///
/// The wish list is written by a separate task while this one reads chunks
/// off the response, so the remote can start sending before the whole wish
/// list is out. Cancelling `cancel` stops both; a failed or cancelled sync
/// registers nothing, though chunks that already arrived stay in storage.
pub async fn sync_with_manifest(
    storage: &Storage,
    client: &Client,
    url: &str,
    manifest: Manifest,
    cancel: &CancellationToken,
    info: &str,
) -> Result<File> {
    let start = Instant::now();
    let builder = Builder::new(storage.clone(), manifest, info);
    debug!(
        wanted = builder.wish_list().count_wanted(),
        bytes_wanted = builder.bytes_wanted(),
        "requesting chunks"
    );

    let (mut wish_out, wish_body) = pipe(PIPE_CAPACITY);
    let writer_cancel = cancel.child_token();
    // Dropping this future, or returning early, stops the writer.
    let _writer_guard = writer_cancel.clone().drop_guard();
    let wishes = builder.wish_list().clone();
    tokio::spawn(
        async move {
            let result = tokio::select! {
                biased;
                _ = writer_cancel.cancelled() => Err(Error::Cancelled),
                result = wishes.write_to(&mut wish_out) => result,
            };
            match result {
                Ok(()) => wish_out.close(),
                Err(e) => {
                    debug!(error = %e, "wish list writer stopped");
                    wish_out
                        .close_with_error(io::Error::other(format!("writing wish list: {e}")))
                        .await;
                }
            }
        }
        .in_current_span(),
    );

    let exchange = async {
        let response = client
            .post(url)
            .header(CONNECTION, "close")
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(wish_body))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(Error::protocol(format!(
                "chunk request to {url} returned {}",
                response.status()
            )));
        }
        let chunks = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));
        builder.reconstruct(chunks).await
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = exchange => result,
    };

    match &result {
        Ok(file) => info!(
            key = %file.key().prefix(),
            size = file.size(),
            elapsed = ?start.elapsed(),
            "sync complete"
        ),
        Err(e) => warn!(error = %e, "sync from {url} failed"),
    }
    result
}

/// [`fetch_manifest`] followed by [`sync_with_manifest`].
pub async fn sync_from(
    storage: &Storage,
    client: &Client,
    url: &str,
    cancel: &CancellationToken,
    info: &str,
) -> Result<File> {
    let manifest = fetch_manifest(client, url, cancel).await?;
    sync_with_manifest(storage, client, url, manifest, cancel, info).await
}
