//! Write-once object storage for batch artifacts.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

pub type ObjectMetadata = BTreeMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `key` and return its etag. Never overwrites an
    /// existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &ObjectMetadata) -> Result<String>;

    /// `Ok(None)` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// `{prefix}/{module|all}/{YYYY}/{MM}/{DD}/{YYYYMMDDTHHMMSS.ffffffZ}-{batch_id}.ndjson`
pub fn batch_object_key(
    prefix: &str,
    module: Option<&str>,
    created_at: &DateTime<Utc>,
    batch_id: Uuid,
) -> String {
    let prefix = prefix.trim_matches('/');
    let scope = module.unwrap_or("all");
    let key = format!(
        "{}/{}/{}-{}.ndjson",
        scope,
        created_at.format("%Y/%m/%d"),
        created_at.format("%Y%m%dT%H%M%S%.6fZ"),
        batch_id
    );
    if prefix.is_empty() {
        key
    } else {
        format!("{}/{}", prefix, key)
    }
}

pub fn content_etag(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn already_exists(key: &str) -> LedgerError {
    LedgerError::ObjectAlreadyExists(key.to_string())
}

/// Objects as files under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(LedgerError::ObjectStoreError(format!(
                "Invalid object key: {}",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &ObjectMetadata) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write to a staging file, then hard-link into place so a partial
        // write is never visible under the final key.
        let staging = path.with_extension(format!("staging-{}", Uuid::new_v4()));
        let linked = match tokio::fs::write(&staging, &bytes).await {
            Ok(()) => tokio::fs::hard_link(&staging, &path).await,
            Err(e) => Err(e),
        };
        // The staging file goes whether the write or the link failed.
        let _ = tokio::fs::remove_file(&staging).await;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(already_exists(key))
            }
            Err(e) => return Err(e.into()),
        }

        if !metadata.is_empty() {
            let meta_path = path.with_extension("meta.json");
            tokio::fs::write(&meta_path, serde_json::to_vec_pretty(metadata)?).await?;
        }

        let etag = content_etag(&bytes);
        debug!("Stored object {} ({} bytes, etag {})", key, bytes.len(), etag);
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// S3-style HTTP object storage: `PUT`/`GET {base_url}/{key}`.
///
/// Writes send `If-None-Match: *` so the server refuses to replace an
/// existing object; metadata travels as `x-amz-meta-*` headers.
pub struct HttpObjectStore {
    base_url: String,
    http_client: Client,
}

impl HttpObjectStore {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}

fn classify_status(status: StatusCode, key: &str) -> LedgerError {
    if status == StatusCode::PRECONDITION_FAILED || status == StatusCode::CONFLICT {
        return already_exists(key);
    }
    let message = format!("object store returned {} for {}", status, key);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        LedgerError::ObjectStoreUnavailable(message)
    } else {
        LedgerError::ObjectStoreError(message)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &ObjectMetadata) -> Result<String> {
        let url = self.url(key);
        let fallback_etag = content_etag(&bytes);

        let mut request = self
            .http_client
            .put(&url)
            .header("If-None-Match", "*")
            .header("Content-Type", "application/x-ndjson");
        for (name, value) in metadata {
            request = request.header(format!("x-amz-meta-{}", name), value);
        }

        let response = request
            .body(bytes)
            .send()
            .await
            .map_err(|e| LedgerError::ObjectStoreUnavailable(format!("{} unreachable: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, key));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or(fallback_etag);
        info!("Uploaded object {} (etag {})", key, etag);
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(key);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::ObjectStoreUnavailable(format!("{} unreachable: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, key));
        }

        let bytes = response.bytes().await.map_err(|e| {
            LedgerError::ObjectStoreUnavailable(format!("Failed to read {}: {}", url, e))
        })?;
        Ok(Some(bytes.to_vec()))
    }
}

/// In-process object store for tests and `memory` deployments.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, (Vec<u8>, ObjectMetadata)>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(poisoned)?;
        let mut keys: Vec<String> = objects.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(key).map(|(_, meta)| meta.clone()))
    }

    /// Replace an object in place, bypassing write-once (tamper drills).
    pub fn overwrite_unchecked(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        let meta = objects.remove(key).map(|(_, m)| m).unwrap_or_default();
        objects.insert(key.to_string(), (bytes, meta));
        Ok(())
    }
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::ObjectStoreError("Object store lock poisoned".to_string())
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, metadata: &ObjectMetadata) -> Result<String> {
        let mut objects = self.objects.write().map_err(poisoned)?;
        if objects.contains_key(key) {
            return Err(already_exists(key));
        }
        let etag = content_etag(&bytes);
        objects.insert(key.to_string(), (bytes, metadata.clone()));
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.get(key).map(|(bytes, _)| bytes.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_batch_object_key_layout() {
        let created = Utc.with_ymd_and_hms(2025, 3, 7, 14, 5, 9).unwrap()
            + chrono::Duration::microseconds(42);
        let id = Uuid::nil();
        assert_eq!(
            batch_object_key("audit/", Some("auth"), &created, id),
            format!("audit/auth/2025/03/07/20250307T140509.000042Z-{}.ndjson", id)
        );
        assert!(batch_object_key("", None, &created, id).starts_with("all/2025/03/07/"));
    }

    #[tokio::test]
    async fn test_fs_store_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let mut meta = ObjectMetadata::new();
        meta.insert("batch-id".to_string(), "b1".to_string());

        let etag = store.put("a/b/obj.ndjson", b"one".to_vec(), &meta).await.unwrap();
        assert_eq!(etag, content_etag(b"one"));

        let err = store.put("a/b/obj.ndjson", b"two".to_vec(), &meta).await.unwrap_err();
        assert!(matches!(err, LedgerError::ObjectAlreadyExists(_)));
        assert_eq!(store.get("a/b/obj.ndjson").await.unwrap().unwrap(), b"one");
        assert!(store.get("a/b/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_store_failed_put_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let meta = ObjectMetadata::new();

        store.put("batch.ndjson", b"one".to_vec(), &meta).await.unwrap();
        assert!(store.put("batch.ndjson", b"two".to_vec(), &meta).await.is_err());

        // A directory squatting on the key makes the link fail as well.
        std::fs::create_dir(dir.path().join("taken.ndjson")).unwrap();
        assert!(store.put("taken.ndjson", b"x".to_vec(), &meta).await.is_err());

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["batch.ndjson", "taken.ndjson"]);
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let meta = ObjectMetadata::new();
        assert!(store.put("../escape", b"x".to_vec(), &meta).await.is_err());
        assert!(store.put("/abs", b"x".to_vec(), &meta).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_is_write_once() {
        let store = MemoryObjectStore::new();
        let meta = ObjectMetadata::new();
        store.put("k", b"v".to_vec(), &meta).await.unwrap();
        assert!(matches!(
            store.put("k", b"w".to_vec(), &meta).await,
            Err(LedgerError::ObjectAlreadyExists(_))
        ));
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_http_status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "k").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::PRECONDITION_FAILED, "k"),
            LedgerError::ObjectAlreadyExists(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "k"),
            LedgerError::ObjectAlreadyExists(_)
        ));
        assert!(!classify_status(StatusCode::FORBIDDEN, "k").is_retryable());
    }
}
