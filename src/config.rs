//! Node configuration file.
//!
//! ```toml
//! listen = "127.0.0.1:8080"
//! data_dir = "~/relaysync"
//! storage_capacity = 1073741824
//! preload = ["big.iso"]
//! ```
//!
//! Every key is optional. Command-line flags override the file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::server::expand_tilde;
use crate::storage::DEFAULT_CAPACITY;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Address the HTTP server binds.
    pub listen: SocketAddr,
    /// Base for relative load and save paths.
    pub data_dir: PathBuf,
    /// Files loaded and served at startup.
    pub preload: Vec<PathBuf>,
    /// Bytes of chunk data kept before unreferenced entries are evicted.
    pub storage_capacity: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: PathBuf::from("."),
            preload: Vec::new(),
            storage_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ServiceConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.data_dir = expand_tilde(&config.data_dir);
        if config.storage_capacity == 0 {
            return Err(Error::Config("storage_capacity must be positive".into()));
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(expand_tilde(path))
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// The file at `path` if given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }
}
