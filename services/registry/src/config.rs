//! Server configuration
//!
//! ```toml
//! listen = "0.0.0.0:3000"
//! bucket = "images"
//! max-upload-size = 524288000
//!
//! [storage.local]
//! path = "/var/lib/image-registry"
//! ```

use std::io;
use std::net::SocketAddr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use storage::StorageConfig;

use crate::api::{DEFAULT_BUCKET, DEFAULT_MAX_UPLOAD_SIZE, RegistryBuilder};

/// Storage directory used when none is configured.
pub const DEFAULT_STORAGE_PATH: &str = "./jmaker-images";

/// Errors loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("reading config file {path}")]
    Read {
        /// Config file path
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The file is not valid configuration
    #[error("parsing config: {0}")]
    Parse(#[from] toml_edit::de::Error),

    /// The configured storage could not be opened
    #[error("opening storage: {0}")]
    Storage(#[from] storage::StorageError),
}

/// Registry server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Address to listen on
    pub listen: SocketAddr,

    /// Storage backend for metadata and blobs
    pub storage: StorageConfig,

    /// Bucket holding metadata and blobs
    pub bucket: String,

    /// Directory for per-request scratch space, the system temp dir if unset
    pub scratch: Option<Utf8PathBuf>,

    /// Largest accepted request body, in bytes
    pub max_upload_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            storage: StorageConfig::Local {
                path: DEFAULT_STORAGE_PATH.into(),
            },
            bucket: DEFAULT_BUCKET.to_string(),
            scratch: None,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml_edit::de::from_str(text)?)
    }

    /// Read configuration from a TOML file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Open the configured storage and prepare a registry over it.
    pub async fn registry(&self) -> Result<RegistryBuilder, ConfigError> {
        let storage = self.storage.clone().build().await?;
        let builder = RegistryBuilder::new(storage)
            .bucket(self.bucket.clone())
            .max_upload_size(self.max_upload_size);
        Ok(match &self.scratch {
            Some(scratch) => builder.scratch_dir(scratch.clone()),
            None => builder,
        })
    }
}
