use std::collections::HashMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

const ENGINE: &str = "memory";

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Bytes,
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data: data.into(),
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that stores objects in memory.
///
/// Buckets are created on first upload. Uploads are buffered completely before
/// they are inserted, so readers never observe partial objects.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }
}

fn get_bucket<'b>(
    buckets: &'b HashMap<String, Bucket>,
    bucket: &str,
) -> Result<&'b Bucket, StorageError> {
    buckets
        .get(bucket)
        .ok_or_else(|| StorageError::not_found(ENGINE, bucket, None))
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = get_bucket(&buckets, bucket)?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, Some(remote.as_str())))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, None))?;
        bucket_map
            .remove(remote)
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, Some(remote.as_str())))?;

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).with_context("buffer upload"))?;

        buf.shutdown()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Writers may be slow; copy from a handle taken outside the lock.
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = get_bucket(&buckets, bucket)?;
            bucket_map
                .get(remote)
                .ok_or_else(|| StorageError::not_found(ENGINE, bucket, Some(remote.as_str())))?
                .data
                .clone()
        };

        tokio::io::copy(&mut &data[..], local)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).with_context("copy to writer"))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = get_bucket(&buckets, bucket)?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }
}
