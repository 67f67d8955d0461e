#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Context;
    use axum::extract::Request;
    use axum::routing::any;
    use axum::Router;
    use bytes::Bytes;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use relaysync::server::{self, file_route, Service};
    use relaysync::storage::ChunkLease;
    use relaysync::{ContentKey, FileHandler, Manifest, Permutation, Storage};
    use reqwest::{Client, StatusCode};
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn random_content(seed: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    struct Node {
        addr: String,
        service: Arc<Service>,
        dir: TempDir,
    }

    async fn start_node() -> anyhow::Result<Node> {
        let dir = TempDir::new()?;
        let service = Arc::new(Service::new(1 << 28, dir.path())?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        tokio::spawn(server::serve(listener, service.clone(), std::future::pending()));
        Ok(Node { addr, service, dir })
    }

    async fn post(node: &Node, endpoint: &str, form: &[(&str, &str)]) -> anyhow::Result<(StatusCode, String)> {
        let response = Client::new()
            .post(format!("http://{}{endpoint}", node.addr))
            .form(form)
            .send()
            .await?;
        Ok((response.status(), response.text().await?))
    }

    /// A file served from a progressive source that holds only its first
    /// chunks until [`GatedSource::open`] stores the rest.
    struct GatedSource {
        url: String,
        key: ContentKey,
        storage: Storage,
        handler: Arc<FileHandler>,
        held: Vec<ChunkLease>,
        pending: Vec<Bytes>,
    }

    impl GatedSource {
        fn open(&mut self) {
            for data in self.pending.drain(..) {
                self.held.push(self.storage.put_chunk(data));
            }
        }
    }

    async fn gated_source(content: &[u8], available: usize) -> anyhow::Result<GatedSource> {
        let full = Storage::default();
        let file = full.ingest(content, "source").await?;
        assert!(file.num_chunks() > available, "content too small to gate");
        let manifest = Manifest::from_file(&file, Permutation::identity(file.num_chunks()))?;

        let storage = Storage::default();
        let mut held = Vec::new();
        let mut pending = Vec::new();
        for (index, info) in file.chunks().iter().enumerate() {
            let data = full.chunk(&info.hash).context("chunk missing from source")?;
            if index < available {
                held.push(storage.put_chunk(data));
            } else {
                pending.push(data);
            }
        }

        let handler = Arc::new(FileHandler::progressive(manifest, storage.clone()));
        let route = file_route(&file.key().prefix());
        let serving = handler.clone();
        let router = Router::new().route(
            &route,
            any(move |request: Request| {
                let handler = serving.clone();
                async move { handler.handle(request).await }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(GatedSource {
            url: format!("http://{addr}{route}"),
            key: *file.key(),
            storage,
            handler,
            held,
            pending,
        })
    }

    async fn wait_for_handler(node: &Node, prefix: &str) -> anyhow::Result<Arc<FileHandler>> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(handler) = node.service.handler(prefix) {
                    return handler;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .context("no handler registered")
    }

    #[tokio::test]
    async fn test_sync_between_nodes() -> anyhow::Result<()> {
        let content = random_content(1, 1 << 20);
        let a = start_node().await?;
        let b = start_node().await?;
        fs::write(a.dir.path().join("data.bin"), &content)?;

        let (status, hash) = post(&a, "/load", &[("path", "data.bin")]).await?;
        assert_eq!(status, StatusCode::OK);
        let key = ContentKey::parse(&hash)?;
        assert_eq!(key, ContentKey::digest(&content));

        let source = format!("http://{}{}", a.addr, file_route(&key.prefix()));
        let (status, synced) = post(&b, "/sync", &[("source", source.as_str())]).await?;
        assert_eq!(status, StatusCode::OK, "{synced}");
        assert_eq!(synced, hash);

        let (status, _) = post(&b, "/save", &[("hash", hash.as_str()), ("path", "copy.bin")]).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fs::read(b.dir.path().join("copy.bin"))?, content);

        let (status, _) = post(&b, "/save", &[("hash", hash.as_str()), ("path", "copy.bin")]).await?;
        assert_eq!(status, StatusCode::CONFLICT);

        let handler = b.service.handler(&key.prefix()).expect("b serves the synced file");
        assert!(!handler.is_progressive());
        Ok(())
    }

    #[tokio::test]
    async fn test_sync_reuses_local_chunks() -> anyhow::Result<()> {
        let original = random_content(2, 1 << 20);
        let mut edited = original.clone();
        edited.splice(500_000..500_000, b"an edit in the middle".iter().copied());

        let a = start_node().await?;
        let b = start_node().await?;
        fs::write(a.dir.path().join("edited.bin"), &edited)?;
        fs::write(b.dir.path().join("original.bin"), &original)?;

        let edited_key = a.service.load_file("edited.bin".as_ref()).await?;
        b.service.load_file("original.bin".as_ref()).await?;
        let chunks_before = b.service.storage().stats().chunks;

        let source = format!("http://{}{}", a.addr, file_route(&edited_key.prefix()));
        let (status, body) = post(&b, "/sync", &[("source", source.as_str())]).await?;
        assert_eq!(status, StatusCode::OK, "{body}");

        let stats = b.service.storage().stats();
        assert_eq!(stats.files, 2);
        // Only the chunks around the edit are new.
        assert!(stats.chunks - chunks_before <= 4, "{} new chunks", stats.chunks - chunks_before);

        let file = b.service.storage().get(&edited_key)?;
        let mut out = Vec::new();
        file.write_to(&mut out).await?;
        assert_eq!(out, edited);
        Ok(())
    }

    #[tokio::test]
    async fn test_relay_chain() -> anyhow::Result<()> {
        let content = random_content(3, 300_000);
        let a = start_node().await?;
        let b = start_node().await?;
        let c = start_node().await?;
        fs::write(a.dir.path().join("f"), &content)?;
        let key = a.service.load_file("f".as_ref()).await?;
        let route = file_route(&key.prefix());

        let (status, _) = post(&b, "/sync", &[("source", format!("http://{}{route}", a.addr).as_str())]).await?;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(&c, "/sync", &[("source", format!("http://{}{route}", b.addr).as_str())]).await?;
        assert_eq!(status, StatusCode::OK);

        let file = c.service.storage().get(&key)?;
        let mut out = Vec::new();
        file.write_to(&mut out).await?;
        assert_eq!(out, content);
        Ok(())
    }

    #[tokio::test]
    async fn test_third_node_pulls_from_relay_mid_sync() -> anyhow::Result<()> {
        let content = random_content(4, 600_000);
        let mut a = gated_source(&content, 2).await?;
        let b = start_node().await?;
        let c = start_node().await?;
        let prefix = a.key.prefix();

        let b_sync = {
            let service = b.service.clone();
            let url = a.url.clone();
            tokio::spawn(async move { service.sync_file(&url, &CancellationToken::new()).await })
        };
        let relay = wait_for_handler(&b, &prefix).await?;
        assert!(relay.is_progressive());

        let relayed = format!("http://{}{}", b.addr, file_route(&prefix));
        let c_sync = {
            let service = c.service.clone();
            tokio::spawn(async move { service.sync_file(&relayed, &CancellationToken::new()).await })
        };
        // C has fetched the relay's manifest and registered its own relay.
        assert!(wait_for_handler(&c, &prefix).await?.is_progressive());
        // B cannot finish while A holds back chunks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!b_sync.is_finished());
        assert!(!c_sync.is_finished());

        a.open();
        let b_key = tokio::time::timeout(Duration::from_secs(10), b_sync).await???;
        let c_key = tokio::time::timeout(Duration::from_secs(10), c_sync).await???;
        assert_eq!(b_key, a.key);
        assert_eq!(c_key, a.key);

        let file = c.service.storage().get(&a.key)?;
        let mut out = Vec::new();
        file.write_to(&mut out).await?;
        assert_eq!(out, content);

        assert!(relay.is_disposed());
        let served = b.service.handler(&prefix).context("b serves the file")?;
        assert!(!served.is_progressive());
        a.handler.dispose();
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_sync_withdraws_relay() -> anyhow::Result<()> {
        let content = random_content(5, 400_000);
        let a = gated_source(&content, 1).await?;
        let b = start_node().await?;
        let prefix = a.key.prefix();

        let cancel = CancellationToken::new();
        let (sync, relay) = tokio::join!(
            tokio::time::timeout(Duration::from_millis(300), b.service.sync_file(&a.url, &cancel)),
            wait_for_handler(&b, &prefix),
        );
        assert!(sync.is_err(), "sync finished without the held back chunks");
        let relay = relay?;
        assert!(relay.is_progressive());
        assert!(relay.is_disposed());
        assert!(b.service.handler(&prefix).is_none());

        let response = Client::new()
            .get(format!("http://{}{}", b.addr, file_route(&prefix)))
            .send()
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        a.handler.dispose();
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_sync_removes_relay() -> anyhow::Result<()> {
        let b = start_node().await?;
        let unused = TcpListener::bind("127.0.0.1:0").await?;
        let dead = unused.local_addr()?;
        drop(unused);

        let source = format!("http://{dead}/file/0123456789abcdef");
        let (status, _) = post(&b, "/sync", &[("source", source.as_str())]).await?;
        assert!(!status.is_success());
        assert!(b.service.handler("0123456789abcdef").is_none());
        assert_eq!(b.service.storage().stats().files, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_orchestration_endpoints() -> anyhow::Result<()> {
        let node = start_node().await?;
        fs::write(node.dir.path().join("f"), b"hello relay")?;
        let http = Client::new();

        let response = http.get(format!("http://{}/load", node.addr)).send().await?;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let (status, hash) = post(&node, "/load", &[("path", "f")]).await?;
        assert_eq!(status, StatusCode::OK);
        let key = ContentKey::parse(&hash)?;

        let listing = http
            .get(format!("http://{}/list", node.addr))
            .send()
            .await?
            .text()
            .await?;
        assert!(listing.starts_with("storage: 1 files"), "{listing}");
        assert!(listing.contains(&file_route(&key.prefix())));

        let manifest = http
            .get(format!("http://{}{}", node.addr, file_route(&key.prefix())))
            .send()
            .await?;
        assert_eq!(manifest.status(), StatusCode::OK);

        let missing = http
            .get(format!("http://{}/file/ffffffffffffffff", node.addr))
            .send()
            .await?;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let (status, body) = post(&node, "/reset", &[]).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "reset done");
        assert!(node.service.handler(&key.prefix()).is_none());
        assert_eq!(node.service.storage().stats().files, 0);
        Ok(())
    }
}
