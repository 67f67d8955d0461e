use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relaysync::config::{ServiceConfig, DEFAULT_LISTEN};
use relaysync::key::KEY_PREFIX_LEN;
use relaysync::server::{self, file_route, Service};

#[derive(Parser, Debug)]
#[command(name = "relaysync", version, about = "Delta file sync between HTTP nodes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node
    Serve(ServeArgs),
    /// Ask a node to load and serve a file from its filesystem
    Load {
        #[arg(long, env = "RELAYSYNC_NODE", default_value = DEFAULT_LISTEN)]
        node: String,
        path: PathBuf,
    },
    /// Have a node pull a file from another node, optionally saving it
    Fetch {
        #[arg(long, env = "RELAYSYNC_NODE", default_value = DEFAULT_LISTEN)]
        node: String,
        /// Node currently serving the file (host:port)
        #[arg(long)]
        source: String,
        /// Full hex key of the file
        hash: String,
        /// Where the node should save the file once it has it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long, env = "RELAYSYNC_CONFIG")]
    config: Option<PathBuf>,
    #[arg(short, long, env = "RELAYSYNC_LISTEN")]
    listen: Option<SocketAddr>,
    /// Base directory for relative load and save paths
    #[arg(long, env = "RELAYSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Chunk store size in bytes
    #[arg(long, env = "RELAYSYNC_STORAGE_CAPACITY")]
    storage_capacity: Option<u64>,
    /// Files to load and serve at startup
    preload: Vec<PathBuf>,
}

impl ServeArgs {
    fn into_config(self) -> Result<ServiceConfig> {
        let mut config = ServiceConfig::load_or_default(self.config.as_deref())
            .context("failed to load configuration")?;
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(capacity) = self.storage_capacity {
            config.storage_capacity = capacity;
        }
        config.preload.extend(self.preload);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args.into_config()?).await,
        Command::Load { node, path } => {
            let key = post_form(&node, "/load", &[("path", path.display().to_string())]).await?;
            println!("{}", key.trim());
            Ok(())
        }
        Command::Fetch {
            node,
            source,
            hash,
            output,
        } => fetch(&node, &source, &hash, output.as_deref()).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    let service = Arc::new(Service::new(config.storage_capacity, &config.data_dir)?);
    for path in &config.preload {
        let key = service
            .load_file(path)
            .await
            .with_context(|| format!("failed to preload {}", path.display()))?;
        info!(path = %path.display(), route = %file_route(&key.prefix()), "preloaded");
    }

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    server::serve(listener, service, shutdown_signal()).await?;
    info!("server stopped");
    Ok(())
}

async fn fetch(node: &str, source: &str, hash: &str, output: Option<&Path>) -> Result<()> {
    let Some(prefix) = hash.get(..KEY_PREFIX_LEN) else {
        bail!("hash '{hash}' is too short");
    };
    if node != source {
        let url = format!("http://{source}{}", file_route(prefix));
        post_form(node, "/sync", &[("source", url)]).await?;
        println!("synced {hash} from {source}");
    }
    if let Some(output) = output {
        let reply = post_form(
            node,
            "/save",
            &[("hash", hash.to_string()), ("path", output.display().to_string())],
        )
        .await?;
        println!("{}", reply.trim());
    }
    Ok(())
}

async fn post_form(node: &str, endpoint: &str, form: &[(&str, String)]) -> Result<String> {
    let url = format!("http://{node}{endpoint}");
    let response = reqwest::Client::new()
        .post(&url)
        .form(form)
        .send()
        .await
        .with_context(|| format!("request to {url} failed"))?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        bail!("{url} returned {status}: {}", body.trim());
    }
    Ok(body)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
