//! The image metadata store
//!
//! All metadata lives in a single JSON document in the storage bucket:
//!
//! ```json
//! { "data": { "<name>": { ...record... } }, "index": ["<name>", ...] }
//! ```
//!
//! `index` keeps insertion order for listing. Every mutation reads the whole
//! document, changes it and writes it back while holding the store lock, so
//! concurrent requests in one process never lose updates.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use storage::StorageBucket;
use tokio::sync::Mutex;

use crate::blob::BlobRef;
use crate::digest::ContentDigest;
use crate::error::{RegistryError, RegistryResult};
use crate::record::ImageRecord;

/// Object holding the metadata document.
pub const SNAPSHOT_OBJECT: &str = "images-meta.json";

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Largest page a listing returns.
pub const MAX_PAGE_SIZE: usize = 1000;

/// One consistent view of every image record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    data: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    index: Vec<String>,
}

impl Snapshot {
    /// Look up a record.
    pub fn get(&self, name: &str) -> Option<&ImageRecord> {
        self.data.get(name)
    }

    /// Whether a record exists.
    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the snapshot has no records.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Records in insertion order.
    pub fn records(&self) -> impl Iterator<Item = &ImageRecord> {
        self.index.iter().filter_map(|name| self.data.get(name))
    }

    /// Add a new record. Never overwrites.
    pub fn insert(&mut self, record: ImageRecord) -> RegistryResult<()> {
        if self.data.contains_key(&record.name) {
            return Err(RegistryError::AlreadyExists(record.name));
        }
        self.index.push(record.name.clone());
        self.data.insert(record.name.clone(), record);
        Ok(())
    }

    /// Replace an existing record.
    pub fn replace(&mut self, record: ImageRecord) -> RegistryResult<ImageRecord> {
        match self.data.get_mut(&record.name) {
            Some(slot) => Ok(std::mem::replace(slot, record)),
            None => Err(RegistryError::NotFound(record.name)),
        }
    }

    /// Remove a record.
    pub fn remove(&mut self, name: &str) -> RegistryResult<ImageRecord> {
        let record = self
            .data
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.index.retain(|entry| entry != name);
        Ok(record)
    }

    /// Bring the index back in line with the records.
    ///
    /// Returns whether anything had to change.
    fn repair(&mut self) -> bool {
        let mut changed = false;

        // Map keys are authoritative for names.
        for (key, record) in self.data.iter_mut() {
            if record.name != *key {
                tracing::warn!(%key, name = %record.name, "record name disagrees with its key");
                record.name = key.clone();
                changed = true;
            }
        }

        let mut seen = HashSet::with_capacity(self.index.len());
        let before = self.index.len();
        self.index
            .retain(|name| self.data.contains_key(name) && seen.insert(name.clone()));
        changed |= self.index.len() != before;

        for name in self.data.keys() {
            if !seen.contains(name) {
                self.index.push(name.clone());
                changed = true;
            }
        }

        changed
    }
}

/// Durable store of image records.
#[derive(Debug, Clone)]
pub struct ImageStore {
    bucket: StorageBucket,
    lock: Arc<Mutex<()>>,
}

impl ImageStore {
    /// A store keeping its document in `bucket`.
    pub fn new(bucket: StorageBucket) -> Self {
        Self {
            bucket,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Read the current document.
    ///
    /// A missing or unreadable document is an empty store.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn snapshot(&self) -> RegistryResult<Snapshot> {
        let path = Utf8Path::new(SNAPSHOT_OBJECT);
        let mut data = Vec::new();
        match self.bucket.download(path, &mut data).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {
                tracing::debug!("no metadata document yet, starting empty");
                return Ok(Snapshot::default());
            }
            Err(error) => return Err(error.into()),
        }

        let mut snapshot: Snapshot = match serde_json::from_slice(&data) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%error, "metadata document is corrupt, treating as empty");
                return Ok(Snapshot::default());
            }
        };

        if snapshot.repair() {
            tracing::warn!("metadata index was inconsistent and has been repaired");
        }
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &Snapshot) -> RegistryResult<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        self.bucket
            .upload(Utf8Path::new(SNAPSHOT_OBJECT), &mut data.as_slice())
            .await?;
        Ok(())
    }

    /// Run `mutate` against the document under the store lock, writing the
    /// result back only when it succeeds.
    async fn transact<T, F>(&self, mutate: F) -> RegistryResult<T>
    where
        F: FnOnce(&mut Snapshot) -> RegistryResult<T>,
    {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.snapshot().await?;
        let output = mutate(&mut snapshot)?;
        self.save(&snapshot).await?;
        Ok(output)
    }

    /// Fetch one record.
    pub async fn get(&self, name: &str) -> RegistryResult<ImageRecord> {
        self.snapshot()
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Whether a record exists.
    pub async fn exists(&self, name: &str) -> RegistryResult<bool> {
        Ok(self.snapshot().await?.contains(name))
    }

    /// A page of records in insertion order.
    pub async fn list(&self, offset: usize, limit: Option<usize>) -> RegistryResult<Vec<ImageRecord>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let snapshot = self.snapshot().await?;
        Ok(snapshot.records().skip(offset).take(limit).cloned().collect())
    }

    /// Register a new record.
    #[tracing::instrument(level = "debug", skip_all, fields(image = %record.name))]
    pub async fn create(&self, record: ImageRecord) -> RegistryResult<()> {
        self.transact(|snapshot| snapshot.insert(record)).await
    }

    /// Replace an existing record in full.
    #[tracing::instrument(level = "debug", skip_all, fields(image = %record.name))]
    pub async fn update(&self, record: ImageRecord) -> RegistryResult<()> {
        self.transact(|snapshot| snapshot.replace(record).map(|_| ()))
            .await
    }

    /// Delete a record.
    pub async fn delete(&self, name: &str) -> RegistryResult<()> {
        self.remove(name).await.map(|_| ())
    }

    /// Delete a record, returning what was removed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, name: &str) -> RegistryResult<ImageRecord> {
        self.transact(|snapshot| snapshot.remove(name)).await
    }

    /// Point a record at a new blob.
    ///
    /// Returns the updated record and the blob it referenced before.
    #[tracing::instrument(level = "debug", skip(self, digest))]
    pub async fn replace_blob(
        &self,
        name: &str,
        blob: BlobRef,
        digest: ContentDigest,
    ) -> RegistryResult<(ImageRecord, Option<BlobRef>)> {
        self.transact(|snapshot| {
            let record = snapshot
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            let updated = record.with_blob(blob, digest);
            let previous = snapshot.replace(updated.clone())?;
            Ok((updated, previous.file_name))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewImage;
    use storage::{MemoryStorage, Storage};

    fn bucket() -> StorageBucket {
        Storage::new(MemoryStorage::with_buckets(&["images"])).bucket("images")
    }

    fn record(name: &str) -> ImageRecord {
        NewImage::named(name).into_record().unwrap()
    }

    async fn raw_document(bucket: &StorageBucket) -> serde_json::Value {
        let mut data = Vec::new();
        bucket
            .download(Utf8Path::new(SNAPSHOT_OBJECT), &mut data)
            .await
            .unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    fn assert_consistent(snapshot: &Snapshot) {
        let indexed: HashSet<_> = snapshot.index.iter().collect();
        assert_eq!(indexed.len(), snapshot.index.len(), "duplicate index entries");
        let keys: HashSet<_> = snapshot.data.keys().collect();
        assert_eq!(indexed, keys);
    }

    #[tokio::test]
    async fn empty_store() {
        let store = ImageStore::new(bucket());
        assert!(store.list(0, None).await.unwrap().is_empty());
        assert!(!store.exists("base").await.unwrap());
        assert!(matches!(
            store.get("base").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let store = ImageStore::new(bucket());
        store.create(record("base")).await.unwrap();
        assert!(store.exists("base").await.unwrap());

        let mut updated = store.get("base").await.unwrap();
        updated.version = "2".into();
        store.update(updated.clone()).await.unwrap();
        assert_eq!(store.get("base").await.unwrap(), updated);

        store.delete("base").await.unwrap();
        assert!(!store.exists("base").await.unwrap());
        assert!(matches!(
            store.delete("base").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            store.update(updated).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_create_does_not_mutate() {
        let store = ImageStore::new(bucket());
        let mut first = record("base");
        first.version = "1".into();
        store.create(first.clone()).await.unwrap();

        let mut second = record("base");
        second.version = "2".into();
        assert!(matches!(
            store.create(second).await,
            Err(RegistryError::AlreadyExists(name)) if name == "base"
        ));
        assert_eq!(store.get("base").await.unwrap(), first);
        assert_eq!(store.list(0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_pages_in_insertion_order() {
        let store = ImageStore::new(bucket());
        for name in ["zeta", "alpha", "mid"] {
            store.create(record(name)).await.unwrap();
        }

        let names = |records: Vec<ImageRecord>| -> Vec<String> {
            records.into_iter().map(|r| r.name).collect()
        };
        assert_eq!(
            names(store.list(0, None).await.unwrap()),
            ["zeta", "alpha", "mid"]
        );
        assert_eq!(names(store.list(1, Some(1)).await.unwrap()), ["alpha"]);
        assert_eq!(names(store.list(2, Some(10)).await.unwrap()), ["mid"]);
        assert!(store.list(5, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn document_layout() {
        let bucket = bucket();
        let store = ImageStore::new(bucket.clone());
        store.create(record("base")).await.unwrap();

        let document = raw_document(&bucket).await;
        assert_eq!(document["index"], serde_json::json!(["base"]));
        assert_eq!(document["data"]["base"]["name"], "base");
    }

    #[tokio::test]
    async fn corrupt_document_is_empty() {
        let bucket = bucket();
        bucket
            .upload(Utf8Path::new(SNAPSHOT_OBJECT), &mut &b"{ not json"[..])
            .await
            .unwrap();

        let store = ImageStore::new(bucket);
        assert!(store.list(0, None).await.unwrap().is_empty());
        store.create(record("base")).await.unwrap();
        assert_eq!(store.list(0, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn inconsistent_index_is_repaired() {
        let bucket = bucket();
        let document = serde_json::json!({
            "data": {
                "a": {"name": "a"},
                "b": {"name": "b"},
                "c": {"name": "wrong"},
            },
            "index": ["b", "ghost", "b", "a"],
        });
        let data = serde_json::to_vec(&document).unwrap();
        bucket
            .upload(Utf8Path::new(SNAPSHOT_OBJECT), &mut data.as_slice())
            .await
            .unwrap();

        let store = ImageStore::new(bucket);
        let snapshot = store.snapshot().await.unwrap();
        assert_consistent(&snapshot);
        assert_eq!(snapshot.index, ["b", "a", "c"]);
        assert_eq!(snapshot.get("c").unwrap().name, "c");
    }

    #[tokio::test]
    async fn replace_blob_returns_previous() {
        let store = ImageStore::new(bucket());
        store.create(record("base")).await.unwrap();

        let first = BlobRef::generate(Some("xz"));
        let (updated, previous) = store
            .replace_blob("base", first.clone(), ContentDigest::of_bytes(b"one"))
            .await
            .unwrap();
        assert_eq!(previous, None);
        assert_eq!(updated.file_name.as_ref(), Some(&first));

        let second = BlobRef::generate(Some("xz"));
        let (updated, previous) = store
            .replace_blob("base", second.clone(), ContentDigest::of_bytes(b"two"))
            .await
            .unwrap();
        assert_eq!(previous, Some(first));
        assert_eq!(updated.digest, Some(ContentDigest::of_bytes(b"two")));
        assert_eq!(store.get("base").await.unwrap(), updated);

        assert!(matches!(
            store
                .replace_blob("nope", second, ContentDigest::of_bytes(b"x"))
                .await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_are_not_lost() {
        let store = ImageStore::new(bucket());
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.create(record(&format!("image-{i}"))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 32);
        assert_consistent(&snapshot);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicates_have_one_winner() {
        let store = ImageStore::new(bucket());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create(record("base")).await })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => created += 1,
                Err(RegistryError::AlreadyExists(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.snapshot().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interleaved_mutations_stay_consistent() {
        let store = ImageStore::new(bucket());
        for name in ["a", "b", "c", "d"] {
            store.create(record(name)).await.unwrap();
        }
        store.delete("b").await.unwrap();
        store.create(record("b")).await.unwrap();
        store.delete("a").await.unwrap();
        let mut d = record("d");
        d.description = "changed".into();
        store.update(d).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert_consistent(&snapshot);
        assert_eq!(snapshot.index, ["c", "d", "b"]);
    }
}
