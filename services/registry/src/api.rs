//! API server builder and router

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use camino::Utf8PathBuf;
use serde_json::json;
use storage::Storage;

use crate::service::ImageService;

/// Path prefix the API is also served under.
pub const API_PREFIX: &str = "/api/v1";

/// Bucket used when none is configured.
pub const DEFAULT_BUCKET: &str = "images";

/// Largest accepted request body, 500 MiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: usize = 500 * 1024 * 1024;

/// Registry builder for configuring and creating the image registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: Storage,
    bucket: Option<String>,
    scratch: Option<Utf8PathBuf>,
    max_upload_size: usize,
}

impl RegistryBuilder {
    /// Create a new registry builder over a storage backend
    pub fn new(storage: impl Into<Storage>) -> Self {
        Self {
            storage: storage.into(),
            bucket: None,
            scratch: None,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the directory scratch space for uploads is created in
    pub fn scratch_dir(mut self, scratch: impl Into<Utf8PathBuf>) -> Self {
        self.scratch = Some(scratch.into());
        self
    }

    /// Set the largest accepted request body, in bytes
    pub fn max_upload_size(mut self, limit: usize) -> Self {
        self.max_upload_size = limit;
        self
    }

    /// Build the image service without HTTP routing
    pub fn service(&self) -> ImageService {
        let bucket = self.bucket.as_deref().unwrap_or(DEFAULT_BUCKET);
        let service = ImageService::new(self.storage.bucket(bucket));
        match &self.scratch {
            Some(scratch) => service.with_scratch_dir(scratch.clone()),
            None => service,
        }
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server.
    /// Every route is available both at the root and under [`API_PREFIX`].
    pub fn build(self) -> Router {
        let images = crate::routes::router().with_state(self.service());

        Router::new()
            .route(API_PREFIX, get(api_version_check))
            .route(&format!("{API_PREFIX}/"), get(api_version_check))
            .nest(API_PREFIX, images.clone())
            .merge(images)
            .layer(DefaultBodyLimit::max(self.max_upload_size))
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}
