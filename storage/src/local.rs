use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "local";
const PARTIAL_SUFFIX: &str = ".partial";

/// Storage driver backed by a directory tree.
///
/// Objects live at `<root>/<bucket>/b/<remote>`. Uploads are written to a hidden
/// `.partial` sibling and renamed into place once complete.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The root directory of this driver.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        let mut path = self.root.join(bucket);
        path.push("b");
        path
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let relative = remote
            .components()
            .all(|c| matches!(c, Utf8Component::Normal(_)));
        if !relative || remote.as_str().is_empty() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("remote path must be relative and normalized: {remote:?}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        Ok(self.bucket_root(bucket).join(remote))
    }
}

fn is_partial(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

fn partial_path(target: &Utf8Path) -> Utf8PathBuf {
    let name = target.file_name().unwrap_or("object");
    target.with_file_name(format!(
        ".{name}.{}{PARTIAL_SUFFIX}",
        uuid::Uuid::new_v4().simple()
    ))
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
            StorageError::io(ENGINE, err)
                .with_bucket(bucket)
                .with_path(remote.as_str())
        })?;

        // Not every filesystem records birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| StorageError::io(ENGINE, err).with_context("file timestamps"))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        tokio::fs::remove_file(&path).await.map_err(|err| {
            StorageError::io(ENGINE, err)
                .with_bucket(bucket)
                .with_path(remote.as_str())
                .with_context("remove_file")
        })?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        let partial = partial_path(&path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(ENGINE, err).with_context("create_dir_all"))?;
        }

        let written = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&partial).await?);
            tokio::io::copy(local, &mut writer).await?;
            writer.shutdown().await?;
            writer.into_inner().sync_all().await?;
            tokio::fs::rename(&partial, &path).await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                tracing::debug!(%partial, "partial upload not removed: {cleanup}");
            }
            return Err(StorageError::io(ENGINE, err)
                .with_bucket(bucket)
                .with_path(remote.as_str())
                .with_context("write object"));
        }

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader =
            tokio::io::BufReader::new(tokio::fs::File::open(&path).await.map_err(|err| {
                StorageError::io(ENGINE, err)
                    .with_bucket(bucket)
                    .with_path(remote.as_str())
                    .with_context("open object")
            })?);

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).with_context("copy"))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err).with_context("flush writer"))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.bucket_root(bucket);

        let mut items = tokio::task::spawn_blocking(move || collect_list(&base))
            .in_current_span()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(ENGINE, err).with_bucket(bucket))?;

        if let Some(prefix) = prefix {
            items.retain(|item| item.starts_with(prefix));
        }
        items.sort();

        tracing::debug!("Found {} entries", items.len());
        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

#[tracing::instrument]
fn collect_list(base: &Utf8Path) -> std::io::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if base.is_dir() {
        visit(base, &mut files)?;
    }

    Ok(files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> std::io::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else if !is_partial(entry.file_name()) {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
