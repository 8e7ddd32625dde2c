//! Blob placement and retrieval

use std::{fmt, io};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use storage::StorageBucket;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio_util::io::ReaderStream;
use tracing::Instrument;

use crate::error::{RegistryError, RegistryResult};

const BLOB_PREFIX: &str = "blobs";
const MAX_EXTENSION_LEN: usize = 16;
const STREAM_BUFFER: usize = 64 * 1024;

/// Contents of a blob, as produced by [`BlobStore::stream`].
pub type BlobStream = ReaderStream<BufReader<DuplexStream>>;

/// Reference to a stored blob: its file name inside the blob area.
///
/// Generated names are a random UUID plus an optional extension, so they never
/// collide and are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef(String);

impl BlobRef {
    /// Wrap an existing blob file name.
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 128
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(name))
        } else {
            Err(RegistryError::InvalidRequest(format!(
                "invalid blob name: {name:?}"
            )))
        }
    }

    /// A fresh, unique blob name with an optional extension.
    pub fn generate(extension: Option<&str>) -> Self {
        let id = uuid::Uuid::new_v4().simple();
        match extension.and_then(sanitize_extension) {
            Some(ext) => Self(format!("{id}.{ext}")),
            None => Self(id.to_string()),
        }
    }

    /// A fresh blob name keeping the extension of a client supplied file name.
    pub fn for_file_name(declared: &str) -> Self {
        Self::generate(Utf8Path::new(declared).extension())
    }

    /// A fresh blob name with the extension implied by a media type.
    pub fn for_media_type(media_type: &str) -> Self {
        Self::generate(extension_for_media_type(media_type))
    }

    /// The blob file name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The media type to serve this blob with, from its extension.
    pub fn media_type(&self) -> &'static str {
        match Utf8Path::new(&self.0).extension() {
            Some("xz") => "application/x-xz",
            Some("gz") => "application/gzip",
            Some("tar") => "application/x-tar",
            Some("zst") => "application/zstd",
            _ => "application/octet-stream",
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobRef {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlobRef> for String {
    fn from(value: BlobRef) -> Self {
        value.0
    }
}

fn sanitize_extension(ext: &str) -> Option<&str> {
    let ok = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then_some(ext)
}

/// File extension implied by a declared media type, if any.
pub fn extension_for_media_type(media_type: &str) -> Option<&'static str> {
    let mime: mime::Mime = media_type.parse().ok()?;
    match mime.essence_str() {
        "application/x-xz" | "application/xz" => Some("xz"),
        "application/gzip" | "application/x-gzip" => Some("gz"),
        "application/x-tar" => Some("tar"),
        "application/zstd" => Some("zst"),
        _ => None,
    }
}

/// The blob storage area.
#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket: StorageBucket,
}

impl BlobStore {
    /// Blobs are kept under the `blobs/` prefix of `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self { bucket }
    }

    fn path(&self, blob: &BlobRef) -> Utf8PathBuf {
        Utf8PathBuf::from(BLOB_PREFIX).join(blob.as_str())
    }

    /// Place a local file into the blob area under `blob`.
    #[tracing::instrument(level = "debug", skip(self), fields(bucket = %self.bucket.bucket))]
    pub async fn put_file(&self, blob: &BlobRef, local: &Utf8Path) -> RegistryResult<()> {
        self.bucket.upload_file(&self.path(blob), local).await?;
        Ok(())
    }

    /// Delete a blob.
    #[tracing::instrument(level = "debug", skip(self), fields(bucket = %self.bucket.bucket))]
    pub async fn delete(&self, blob: &BlobRef) -> RegistryResult<()> {
        self.bucket.delete(&self.path(blob)).await?;
        Ok(())
    }

    /// Delete a blob, logging instead of failing.
    ///
    /// Returns whether the blob was removed.
    pub async fn discard(&self, blob: &BlobRef) -> bool {
        match self.delete(blob).await {
            Ok(()) => true,
            Err(RegistryError::Storage(error)) if error.is_not_found() => {
                tracing::warn!(%blob, "blob already missing from storage");
                false
            }
            Err(error) => {
                tracing::warn!(%blob, %error, "failed to delete blob");
                false
            }
        }
    }

    /// Whether a blob is present.
    pub async fn exists(&self, blob: &BlobRef) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&self.path(blob)).await?)
    }

    /// Names of every stored blob.
    pub async fn list(&self) -> RegistryResult<Vec<BlobRef>> {
        let prefix = Utf8PathBuf::from(BLOB_PREFIX);
        let names = self.bucket.list(Some(&prefix)).await?;
        names
            .iter()
            .filter_map(|name| Utf8Path::new(name).file_name())
            .map(BlobRef::new)
            .collect()
    }

    /// Stream a blob's contents.
    ///
    /// Returns once the first bytes arrive or the download ends, so a blob
    /// that is missing (or vanishes before it is opened) is an error here.
    /// Failures after that truncate the stream and are logged.
    pub async fn stream(&self, blob: &BlobRef) -> RegistryResult<BlobStream> {
        let path = self.path(blob);
        let (mut writer, reader) = tokio::io::duplex(STREAM_BUFFER);
        let bucket = self.bucket.clone();
        let name = blob.clone();
        let mut download = tokio::spawn(
            async move {
                let result = bucket.download(&path, &mut writer).await;
                if let Err(error) = &result {
                    tracing::warn!(blob = %name, %error, "blob download interrupted");
                }
                result
            }
            .in_current_span(),
        );

        let mut reader = BufReader::new(reader);
        tokio::select! {
            finished = &mut download => {
                finished.map_err(io::Error::other)??;
            }
            filled = reader.fill_buf() => {
                if filled?.is_empty() {
                    download.await.map_err(io::Error::other)??;
                }
            }
        }

        Ok(ReaderStream::new(reader))
    }
}
