//! Importing a complete image from an uploaded archive
//!
//! The archive is placed in the blob area first, then inspected for its
//! manifest and registered. Every failure after placement deletes the blob
//! again, so a rejected upload never leaves data behind.

use camino::Utf8Path;

use crate::archive;
use crate::blob::BlobRef;
use crate::digest::ContentDigest;
use crate::error::RegistryResult;
use crate::manifest::{MANIFEST_ENTRY, Manifest};
use crate::record::ImageRecord;
use crate::service::{ImageService, Scratch};

const UPLOAD_FILE: &str = "upload";

impl ImageService {
    /// Register an image from raw archive bytes.
    ///
    /// `media_type` only decides the extension of the stored blob; the
    /// container format is detected from the content.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn ingest(&self, data: &[u8], media_type: Option<&str>) -> RegistryResult<ImageRecord> {
        let scratch = self.scratch().await?;
        let upload = scratch.join(UPLOAD_FILE);
        tokio::fs::write(&upload, data).await?;

        let blob = BlobRef::for_media_type(media_type.unwrap_or_default());
        self.blobs.put_file(&blob, &upload).await?;

        match self.register_upload(&scratch, &upload, &blob).await {
            Ok(record) => {
                tracing::info!(image = %record.name, %blob, "imported image");
                Ok(record)
            }
            Err(error) => {
                tracing::debug!(%blob, %error, "import failed, removing blob");
                self.blobs.discard(&blob).await;
                Err(error)
            }
        }
    }

    async fn register_upload(
        &self,
        scratch: &Scratch,
        upload: &Utf8Path,
        blob: &BlobRef,
    ) -> RegistryResult<ImageRecord> {
        // The staged upload is byte-for-byte the placed blob.
        let manifest = archive::extract_entry_blocking(upload, MANIFEST_ENTRY, scratch.path()).await?;
        let manifest = Manifest::parse(&tokio::fs::read(&manifest).await?)?;

        let digest = ContentDigest::of_file(upload).await?;
        let record = manifest.into_record().with_blob(blob.clone(), digest);
        self.store.create(record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::{tar, tar_gz, tar_xz};
    use crate::error::RegistryError;
    use crate::record::NewImage;
    use crate::service::testing::LocalService;
    use futures::TryStreamExt;

    const XZ: Option<&str> = Some("application/x-xz");

    fn image(manifest: &str) -> Vec<u8> {
        tar_xz(&[
            ("rootfs/etc/os-release", b"ID=test"),
            (".manifest", manifest.as_bytes()),
        ])
    }

    #[tokio::test]
    async fn round_trip() {
        let local = LocalService::new();
        let service = &local.service;
        let data = image(r#"{"name": "x", "from": "base", "version": "1"}"#);

        let record = service.ingest(&data, XZ).await.unwrap();
        assert_eq!(record.name, "x");
        assert_eq!(record.parent.as_deref(), Some("base"));
        assert_eq!(record.version, "1");
        let blob = record.file_name.clone().unwrap();
        assert!(blob.as_str().ends_with(".xz"));
        assert_eq!(service.get("x").await.unwrap(), record);

        let (_, stream) = service.open_data("x").await.unwrap();
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.unwrap();
        let downloaded = chunks.concat();
        assert_eq!(downloaded, data);
        assert_eq!(record.digest, Some(ContentDigest::of_bytes(&downloaded)));

        assert_eq!(local.blob_files(), vec![blob.to_string()]);
        assert!(local.scratch_files().is_empty());
    }

    #[tokio::test]
    async fn other_containers() {
        let local = LocalService::new();
        let service = &local.service;

        let record = service
            .ingest(&tar_gz(&[(".manifest", br#"{"name": "gz"}"#)]), None)
            .await
            .unwrap();
        assert_eq!(record.file_name.unwrap().media_type(), "application/octet-stream");

        let record = service
            .ingest(
                &tar(&[("./.manifest", br#"{"name": "plain"}"#)]),
                Some("application/x-tar"),
            )
            .await
            .unwrap();
        assert_eq!(record.file_name.unwrap().media_type(), "application/x-tar");
    }

    async fn assert_rejected(local: &LocalService, data: &[u8]) -> RegistryError {
        let before = local.blob_files();
        let error = local.service.ingest(data, XZ).await.unwrap_err();
        assert_eq!(local.blob_files(), before, "orphaned blob after {error}");
        assert!(local.scratch_files().is_empty());
        error
    }

    #[tokio::test]
    async fn malformed_uploads_leave_nothing() {
        let local = LocalService::new();

        for data in [
            b"not an archive at all".to_vec(),
            Vec::new(),
            tar_xz(&[("rootfs/bin/sh", b"elf")]),
            image("not json"),
            image(r#"{"from": "base"}"#),
            image(r#"{"name": "x", "layers": []}"#),
            image(r#"{"name": "../../x"}"#),
            image(r#"{"name": "x", "from": "x"}"#),
        ] {
            let error = assert_rejected(&local, &data).await;
            assert!(
                matches!(error, RegistryError::Malformed(_)),
                "expected malformed, got {error:?}"
            );
        }

        assert!(local.service.list(0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflict_leaves_existing_image_alone() {
        let local = LocalService::new();
        let service = &local.service;
        let original = service.ingest(&image(r#"{"name": "x"}"#), XZ).await.unwrap();

        let error = assert_rejected(&local, &image(r#"{"name": "x", "version": "2"}"#)).await;
        assert!(matches!(error, RegistryError::AlreadyExists(name) if name == "x"));
        assert_eq!(service.get("x").await.unwrap(), original);

        service.register(NewImage::named("bare")).await.unwrap();
        let error = assert_rejected(&local, &image(r#"{"name": "bare"}"#)).await;
        assert_eq!(error.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn imported_lineage_resolves() {
        let local = LocalService::new();
        let service = &local.service;
        service.ingest(&image(r#"{"name": "a"}"#), XZ).await.unwrap();
        service
            .ingest(&image(r#"{"name": "b", "from": "a"}"#), XZ)
            .await
            .unwrap();
        service
            .ingest(&image(r#"{"name": "c", "parent": "b"}"#), XZ)
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
        assert_eq!(local.blob_files().len(), 3);
    }

    #[tokio::test]
    async fn failed_save_leaves_no_blob() {
        let local = LocalService::new();
        let service = &local.service;
        service.ingest(&image(r#"{"name": "a"}"#), XZ).await.unwrap();
        let before = local.blob_files();

        local.refuse_saves(true);
        assert!(matches!(
            service.ingest(&image(r#"{"name": "b"}"#), XZ).await,
            Err(RegistryError::Storage(_))
        ));
        assert_eq!(local.blob_files(), before);
        assert!(local.scratch_files().is_empty());

        local.refuse_saves(false);
        assert!(matches!(
            service.get("b").await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
