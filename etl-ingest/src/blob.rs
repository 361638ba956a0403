//! Object storage used for key configuration, schema snapshots and reprocess listings.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// Minimal object store interface.
pub trait BlobStore {
    /// Returns the object body, or [`None`] when the object does not exist.
    fn get(&self, bucket: &str, key: &str)
    -> impl Future<Output = EtlResult<Option<Bytes>>> + Send;

    fn put(&self, bucket: &str, key: &str, body: Bytes)
    -> impl Future<Output = EtlResult<()>> + Send;

    /// Lists the keys starting with `prefix`, sorted.
    fn list(&self, bucket: &str, prefix: &str)
    -> impl Future<Output = EtlResult<Vec<String>>> + Send;
}

/// [`BlobStore`] mapping `bucket/key` onto files below a root directory.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, key: &str) -> EtlResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative.components().any(|component| {
            !matches!(component, std::path::Component::Normal(_))
        });

        if escapes || bucket.contains(['/', '\\']) || bucket == ".." {
            return Err(etl_error!(
                ErrorKind::BlobStoreError,
                "Object key escapes the blob store root",
                detail = format!("{bucket}/{key}")
            ));
        }

        Ok(self.root.join(bucket).join(relative))
    }
}

impl BlobStore for FileBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> EtlResult<Option<Bytes>> {
        let path = self.path(bucket, key)?;

        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> EtlResult<()> {
        let path = self.path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &body).await?;

        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> EtlResult<Vec<String>> {
        let bucket_root = self.root.join(bucket);
        let mut pending = vec![bucket_root.clone()];
        let mut keys = Vec::new();

        while let Some(directory) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&directory).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&bucket_root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();

        Ok(keys)
    }
}

/// In-memory [`BlobStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    objects: Arc<Mutex<BTreeMap<(String, String), Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn object_count(&self) -> usize {
        self.objects.lock().await.len()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> EtlResult<Option<Bytes>> {
        let objects = self.objects.lock().await;

        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> EtlResult<()> {
        let mut objects = self.objects.lock().await;
        objects.insert((bucket.to_string(), key.to_string()), body);

        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> EtlResult<Vec<String>> {
        let objects = self.objects.lock().await;

        Ok(objects
            .keys()
            .filter(|(object_bucket, key)| object_bucket == bucket && key.starts_with(prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }
}

#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

#[cfg(feature = "s3")]
mod s3 {
    use aws_sdk_s3::Client;
    use aws_sdk_s3::error::DisplayErrorContext;
    use aws_sdk_s3::primitives::ByteStream;
    use bytes::Bytes;

    use super::BlobStore;
    use crate::error::{ErrorKind, EtlError, EtlResult};
    use crate::etl_error;

    fn s3_error<E>(description: &'static str, err: E) -> EtlError
    where
        E: std::error::Error,
    {
        etl_error!(
            ErrorKind::BlobStoreError,
            description,
            detail = DisplayErrorContext(&err).to_string()
        )
    }

    /// [`BlobStore`] backed by Amazon S3.
    #[derive(Debug, Clone)]
    pub struct S3BlobStore {
        client: Client,
    }

    impl S3BlobStore {
        /// Creates a store using the credentials and region of the environment.
        pub async fn from_env() -> Self {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

            Self {
                client: Client::new(&config),
            }
        }
    }

    impl BlobStore for S3BlobStore {
        async fn get(&self, bucket: &str, key: &str) -> EtlResult<Option<Bytes>> {
            let output = match self.client.get_object().bucket(bucket).key(key).send().await {
                Ok(output) => output,
                Err(err)
                    if err
                        .as_service_error()
                        .is_some_and(|service_err| service_err.is_no_such_key()) =>
                {
                    return Ok(None);
                }
                Err(err) => return Err(s3_error("S3 get object failed", err)),
            };

            let body = output
                .body
                .collect()
                .await
                .map_err(|err| s3_error("S3 object body could not be read", err))?;

            Ok(Some(body.into_bytes()))
        }

        async fn put(&self, bucket: &str, key: &str, body: Bytes) -> EtlResult<()> {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|err| s3_error("S3 put object failed", err))?;

            Ok(())
        }

        async fn list(&self, bucket: &str, prefix: &str) -> EtlResult<Vec<String>> {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .into_paginator()
                .send();
            let mut keys = Vec::new();

            while let Some(page) = pages.next().await {
                let page = page.map_err(|err| s3_error("S3 list objects failed", err))?;
                keys.extend(
                    page.contents()
                        .iter()
                        .filter_map(|object| object.key().map(str::to_string)),
                );
            }

            keys.sort();

            Ok(keys)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        store
            .put("landing", "fair/orders/2024/01/02/b.parquet", Bytes::from_static(b"b"))
            .await
            .unwrap();
        store
            .put("landing", "fair/orders/2024/01/02/a.parquet", Bytes::from_static(b"a"))
            .await
            .unwrap();
        store
            .put("landing", "fair/users/2024/01/02/c.parquet", Bytes::from_static(b"c"))
            .await
            .unwrap();

        let body = store
            .get("landing", "fair/orders/2024/01/02/a.parquet")
            .await
            .unwrap();
        assert_eq!(body, Some(Bytes::from_static(b"a")));
        assert_eq!(store.get("landing", "missing").await.unwrap(), None);

        let keys = store.list("landing", "fair/orders/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "fair/orders/2024/01/02/a.parquet".to_string(),
                "fair/orders/2024/01/02/b.parquet".to_string(),
            ]
        );
        assert!(store.list("other", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        let err = store.get("landing", "../secret").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BlobStoreError);
    }

    #[tokio::test]
    async fn memory_store_lists_by_bucket_and_prefix() {
        let store = MemoryBlobStore::new();
        store.put("a", "x/1", Bytes::new()).await.unwrap();
        store.put("a", "y/1", Bytes::new()).await.unwrap();
        store.put("b", "x/2", Bytes::new()).await.unwrap();

        assert_eq!(store.list("a", "x/").await.unwrap(), vec!["x/1".to_string()]);
    }
}
