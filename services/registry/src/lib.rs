//! # Image Registry
//!
//! A small registry for named build images. Each image has a metadata record,
//! an optional parent forming a lineage, and optionally an attached data blob
//! (usually an xz-compressed tarball).
//!
//! ## Features
//!
//! - Metadata registration, listing, lookup and deletion
//! - Whole-image import from an archive carrying a `.manifest` entry
//! - Attaching and replacing image data, with SHA-256 digests
//! - Ancestry resolution along `parent` references
//! - Pluggable storage backend via the `storage` crate
//!
//! ## Example
//!
//! ```no_run
//! use image_registry::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["images"]);
//! let registry = RegistryBuilder::new(storage).bucket("images").build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```

mod api;
pub mod archive;
pub mod blob;
#[cfg(feature = "cli")]
pub mod config;
pub mod digest;
mod error;
mod ingest;
pub mod lineage;
pub mod manifest;
pub mod record;
mod routes;
mod service;
pub mod store;

pub use api::{API_PREFIX, DEFAULT_BUCKET, DEFAULT_MAX_UPLOAD_SIZE, RegistryBuilder};
pub use error::{RegistryError, RegistryResult};
pub use service::{ImageService, Scratch};
