//! The registry operations, independent of HTTP

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use tempfile::TempDir;

use crate::blob::{BlobRef, BlobStore, BlobStream};
use crate::digest::ContentDigest;
use crate::error::{RegistryError, RegistryResult};
use crate::lineage;
use crate::record::{ImageRecord, NewImage, validate_name};
use crate::store::ImageStore;

/// Private scratch space for one request, removed on drop.
#[derive(Debug)]
pub struct Scratch {
    #[allow(unused)]
    dir: TempDir,
    path: Utf8PathBuf,
}

impl Scratch {
    /// The scratch directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// A path for `name` inside the scratch directory.
    pub fn join(&self, name: &str) -> Utf8PathBuf {
        self.path.join(name)
    }
}

/// Image metadata, blobs and lineage behind one handle.
#[derive(Debug, Clone)]
pub struct ImageService {
    pub(crate) store: ImageStore,
    pub(crate) blobs: BlobStore,
    scratch_root: Option<Utf8PathBuf>,
}

impl ImageService {
    /// Keep metadata and blobs in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self {
            store: ImageStore::new(bucket.clone()),
            blobs: BlobStore::new(bucket),
            scratch_root: None,
        }
    }

    /// Create per-request scratch directories under `root` instead of the
    /// system temporary directory.
    pub fn with_scratch_dir(mut self, root: impl Into<Utf8PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    /// The metadata store.
    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// The blob area.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// A fresh private scratch directory.
    pub async fn scratch(&self) -> RegistryResult<Scratch> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("image-registry-");
        let dir = match &self.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("scratch directory is not utf-8: {}", path.display()),
            )
        })?;
        Ok(Scratch { dir, path })
    }

    /// Register an image without data.
    #[tracing::instrument(skip_all, fields(image = %input.name))]
    pub async fn register(&self, input: NewImage) -> RegistryResult<ImageRecord> {
        let record = input.into_record()?;
        self.store.create(record.clone()).await?;
        tracing::info!("registered image");
        Ok(record)
    }

    /// Fetch an image record.
    pub async fn get(&self, name: &str) -> RegistryResult<ImageRecord> {
        validate_name(name)?;
        self.store.get(name).await
    }

    /// A page of image records in registration order.
    pub async fn list(
        &self,
        offset: usize,
        limit: Option<usize>,
    ) -> RegistryResult<Vec<ImageRecord>> {
        self.store.list(offset, limit).await
    }

    /// The ancestors of an image, root first.
    pub async fn ancestry(&self, name: &str) -> RegistryResult<Vec<ImageRecord>> {
        validate_name(name)?;
        let snapshot = self.store.snapshot().await?;
        lineage::ancestry(&snapshot, name)
    }

    /// Remove an image and its blob.
    ///
    /// The blob is deleted after the record; a blob that is already gone is
    /// only logged.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> RegistryResult<ImageRecord> {
        validate_name(name)?;
        let record = self.store.remove(name).await?;
        if let Some(blob) = &record.file_name {
            self.blobs.discard(blob).await;
        }
        tracing::info!("deleted image");
        Ok(record)
    }

    /// Attach `local` as the data of an existing image, replacing any
    /// previous data.
    ///
    /// Only the extension of `declared_name` is kept.
    #[tracing::instrument(skip(self, local))]
    pub async fn attach_data(
        &self,
        name: &str,
        local: &Utf8Path,
        declared_name: Option<&str>,
    ) -> RegistryResult<ImageRecord> {
        // Fail before touching the blob area.
        self.get(name).await?;

        let blob = match declared_name {
            Some(declared) => BlobRef::for_file_name(declared),
            None => BlobRef::generate(None),
        };
        let digest = ContentDigest::of_file(local).await?;
        self.blobs.put_file(&blob, local).await?;

        let (record, previous) = match self
            .store
            .replace_blob(name, blob.clone(), digest)
            .await
        {
            Ok(swapped) => swapped,
            Err(error) => {
                self.blobs.discard(&blob).await;
                return Err(error);
            }
        };

        if let Some(previous) = previous.filter(|previous| *previous != blob) {
            self.blobs.discard(&previous).await;
        }

        tracing::info!(%blob, "attached image data");
        Ok(record)
    }

    /// Open the data of an image for streaming.
    pub async fn open_data(
        &self,
        name: &str,
    ) -> RegistryResult<(BlobRef, BlobStream)> {
        let record = self.get(name).await?;
        let blob = record
            .file_name
            .ok_or_else(|| RegistryError::NoData(name.to_string()))?;

        match self.blobs.stream(&blob).await {
            Ok(stream) => Ok((blob, stream)),
            Err(RegistryError::Storage(error)) if error.is_not_found() => {
                tracing::warn!(image = %name, %blob, "record references a missing blob");
                Err(RegistryError::NoData(name.to_string()))
            }
            Err(error) => Err(error),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::LocalService;
    use super::*;
    use futures::TryStreamExt;

    async fn read_stream(stream: BlobStream) -> Vec<u8> {
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    async fn write_local(service: &ImageService, data: &[u8]) -> (Scratch, Utf8PathBuf) {
        let scratch = service.scratch().await.unwrap();
        let path = scratch.join("upload");
        tokio::fs::write(&path, data).await.unwrap();
        (scratch, path)
    }

    #[tokio::test]
    async fn register_and_get() {
        let local = LocalService::new();
        let service = &local.service;
        let record = service
            .register(NewImage::named("base"))
            .await
            .unwrap();
        assert_eq!(service.get("base").await.unwrap(), record);
        assert!(matches!(
            service.register(NewImage::named("base")).await,
            Err(RegistryError::AlreadyExists(_))
        ));
        assert!(matches!(
            service.register(NewImage::named("../etc")).await,
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            service.get("..").await,
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn attach_replaces_previous_blob() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("base")).await.unwrap();

        let (_first_scratch, first) = write_local(service, b"first").await;
        let record = service
            .attach_data("base", &first, Some("rootfs.tar.xz"))
            .await
            .unwrap();
        let first_blob = record.file_name.clone().unwrap();
        assert!(first_blob.as_str().ends_with(".xz"));
        assert_eq!(local.blob_files(), vec![first_blob.to_string()]);

        let (_second_scratch, second) = write_local(service, b"second").await;
        let record = service.attach_data("base", &second, None).await.unwrap();
        let second_blob = record.file_name.clone().unwrap();
        assert_ne!(first_blob, second_blob);
        assert_eq!(record.digest, Some(ContentDigest::of_bytes(b"second")));
        assert_eq!(local.blob_files(), vec![second_blob.to_string()]);

        let (blob, stream) = service.open_data("base").await.unwrap();
        assert_eq!(blob, second_blob);
        assert_eq!(read_stream(stream).await, b"second");
    }

    #[tokio::test]
    async fn attach_to_unknown_image() {
        let local = LocalService::new();
        let service = &local.service;
        let (_scratch, path) = write_local(service, b"data").await;
        assert!(matches!(
            service.attach_data("ghost", &path, None).await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(local.blob_files().is_empty());
    }

    #[tokio::test]
    async fn open_data_without_blob() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("bare")).await.unwrap();
        assert!(matches!(
            service.open_data("bare").await,
            Err(RegistryError::NoData(_))
        ));
        assert!(matches!(
            service.open_data("ghost").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_record_and_blob() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("base")).await.unwrap();
        let (_scratch, path) = write_local(service, b"data").await;
        service.attach_data("base", &path, None).await.unwrap();

        service.delete("base").await.unwrap();
        assert!(local.blob_files().is_empty());
        assert!(matches!(
            service.get("base").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            service.delete("base").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_with_missing_blob_succeeds() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("base")).await.unwrap();
        let (_scratch, path) = write_local(service, b"data").await;
        let record = service.attach_data("base", &path, None).await.unwrap();

        service
            .blobs()
            .delete(record.file_name.as_ref().unwrap())
            .await
            .unwrap();
        assert!(matches!(
            service.open_data("base").await,
            Err(RegistryError::NoData(_))
        ));
        service.delete("base").await.unwrap();
    }

    #[tokio::test]
    async fn ancestry_through_service() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("a")).await.unwrap();
        service
            .register(NewImage::named("b").parent("a"))
            .await
            .unwrap();
        service
            .register(NewImage::named("c").parent("b"))
            .await
            .unwrap();

        let names: Vec<_> = service
            .ancestry("c")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, ["a", "b"]);

        service.delete("a").await.unwrap();
        assert!(matches!(
            service.ancestry("c").await,
            Err(RegistryError::ParentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn scratch_is_removed_on_drop() {
        let local = LocalService::new();
        let (scratch, _path) = write_local(&local.service, b"data").await;
        assert_eq!(local.scratch_files(), vec!["upload".to_string()]);
        drop(scratch);
        assert!(local.scratch_files().is_empty());
    }

    #[tokio::test]
    async fn failed_swap_keeps_previous_blob() {
        let local = LocalService::new();
        let service = &local.service;
        service.register(NewImage::named("base")).await.unwrap();
        let (_first_scratch, first) = write_local(service, b"first").await;
        service.attach_data("base", &first, None).await.unwrap();
        let before = local.blob_files();

        local.refuse_saves(true);
        let (_second_scratch, second) = write_local(service, b"second").await;
        assert!(matches!(
            service.attach_data("base", &second, None).await,
            Err(RegistryError::Storage(_))
        ));
        assert_eq!(local.blob_files(), before);

        local.refuse_saves(false);
        let (_, stream) = service.open_data("base").await.unwrap();
        assert_eq!(read_stream(stream).await, b"first");
    }

    #[tokio::test]
    async fn unread_download_does_not_stall_writes() {
        let storage = storage::Storage::new(storage::MemoryStorage::with_buckets(&["images"]));
        let service = ImageService::new(storage.bucket("images"));
        service.register(NewImage::named("big")).await.unwrap();
        let (_scratch, path) = write_local(&service, &vec![0u8; 1024 * 1024]).await;
        service.attach_data("big", &path, None).await.unwrap();

        let (_blob, _stream) = service.open_data("big").await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            service.register(NewImage::named("other")),
        )
        .await
        .expect("register stalled behind an unread download")
        .unwrap();
    }
}
