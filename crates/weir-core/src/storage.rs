//! Storage backend abstraction for the aggregation state store.
//!
//! This module defines the conditional-write contract the reducer is built
//! on. The only synchronization primitive in the whole system is the
//! precondition on [`StorageBackend::put`]: every read-then-write of
//! aggregation state goes through it, and concurrent-closure races are
//! resolved by whichever caller's precondition holds.
//!
//! ## Multi-Cloud Compatibility
//!
//! The version token is an opaque `String` so different backends can supply
//! their native notion of object version:
//! - GCS: numeric generation (stored as string)
//! - S3: `ETag` or version id
//! - Azure: `ETag`
//!
//! Nothing above this layer may parse or compare version tokens beyond
//! equality.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum WritePrecondition {
    /// Write only if the object does not exist.
    DoesNotExist,
    /// Write only if the object's version matches the given token.
    MatchesVersion(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional write.
///
/// A failed precondition is a *result*, never an error: losing a CAS race is
/// expected control flow for the reducer.
#[derive(Debug, Clone)]
pub enum WriteResult {
    /// Write succeeded, returns the new version token.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current version token.
    PreconditionFailed {
        /// The version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object path (key).
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object version token for CAS operations.
    pub version: String,
    /// Last modification timestamp.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Storage backend trait for the aggregation state store.
///
/// All backends (cloud object stores, in-memory for tests) implement this
/// trait. The contract is designed for object-storage semantics: point
/// lookups, prefix listing, and conditional writes.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Writes with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition does not
    /// hold. Never returns an error for a precondition failure — that is a
    /// normal result.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object.
    ///
    /// Succeeds even if the object doesn't exist (idempotent).
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// Returns an empty vec if no objects match.
    ///
    /// **Ordering**: results are returned in arbitrary order. Callers needing
    /// deterministic order must sort (e.g. by `path`).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production. Uses numeric
/// versions internally (stored as strings) to simulate GCS-like generations.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
    last_modified: DateTime<Utc>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {path}")))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.version.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.version != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.version.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let new_version = current.map_or(1, |o| o.version + 1);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                version: new_version,
                last_modified: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: new_version.to_string(),
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(path, obj)| ObjectMeta {
                path: path.clone(),
                size: obj.data.len() as u64,
                version: obj.version.to_string(),
                last_modified: Some(obj.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(path).map(|obj| ObjectMeta {
            path: path.to_string(),
            size: obj.data.len() as u64,
            version: obj.version.to_string(),
            last_modified: Some(obj.last_modified),
        }))
    }
}

/// Production backend over any [`object_store`] implementation.
///
/// Maps the conditional-write contract onto `object_store`'s put modes:
/// `DoesNotExist` becomes [`PutMode::Create`] and `MatchesVersion` becomes
/// [`PutMode::Update`]. The version token is the backend's etag when present,
/// falling back to its native version string.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    base: StorePath,
}

impl ObjectStoreBackend {
    /// Creates a backend over an existing object store, rooted at `base`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, base: StorePath) -> Self {
        Self { store, base }
    }

    /// Creates a backend from a storage URL such as `s3://bucket/prefix`,
    /// `gs://bucket`, `file:///var/weir` or `memory:///`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed or names an unsupported
    /// scheme.
    pub fn from_url(url: &str) -> Result<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("invalid storage url '{url}': {e}")))?;
        let (store, base) = object_store::parse_url(&parsed)
            .map_err(|e| Error::storage_with_source(format!("unsupported storage url '{url}'"), e))?;
        Ok(Self {
            store: Arc::from(store),
            base,
        })
    }

    fn full_path(&self, path: &str) -> StorePath {
        if self.base.as_ref().is_empty() {
            StorePath::from(path)
        } else {
            StorePath::from(format!("{}/{path}", self.base))
        }
    }

    fn relative_path(&self, location: &StorePath) -> String {
        let full = location.as_ref();
        let base = self.base.as_ref();
        if base.is_empty() {
            full.to_string()
        } else {
            full.strip_prefix(base)
                .map_or_else(|| full.to_string(), |s| s.trim_start_matches('/').to_string())
        }
    }

    fn version_token(e_tag: Option<&str>, version: Option<&str>) -> String {
        e_tag
            .or(version)
            .unwrap_or_default()
            .to_string()
    }

    async fn current_version(&self, location: &StorePath) -> String {
        match self.store.head(location).await {
            Ok(meta) => Self::version_token(meta.e_tag.as_deref(), meta.version.as_deref()),
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn get(&self, path: &str) -> Result<Bytes> {
        let location = self.full_path(path);
        let result = self.store.get(&location).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => {
                Error::NotFound(format!("object not found: {path}"))
            }
            other => Error::storage_with_source(format!("get failed: {path}"), other),
        })?;

        result
            .bytes()
            .await
            .map_err(|e| Error::storage_with_source(format!("read failed: {path}"), e))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let location = self.full_path(path);
        let mode = match &precondition {
            WritePrecondition::DoesNotExist => PutMode::Create,
            WritePrecondition::MatchesVersion(token) => PutMode::Update(UpdateVersion {
                e_tag: Some(token.clone()),
                version: None,
            }),
            WritePrecondition::None => PutMode::Overwrite,
        };

        let options = PutOptions {
            mode,
            ..PutOptions::default()
        };

        match self
            .store
            .put_opts(&location, PutPayload::from(data), options)
            .await
        {
            Ok(result) => Ok(WriteResult::Success {
                version: Self::version_token(result.e_tag.as_deref(), result.version.as_deref()),
            }),
            Err(object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. }) => {
                Ok(WriteResult::PreconditionFailed {
                    current_version: self.current_version(&location).await,
                })
            }
            Err(other) => Err(Error::storage_with_source(format!("put failed: {path}"), other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let location = self.full_path(path);
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(other) => Err(Error::storage_with_source(
                format!("delete failed: {path}"),
                other,
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let location = self.full_path(prefix);
        let entries: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&location))
            .try_collect()
            .await
            .map_err(|e| Error::storage_with_source(format!("list failed: {prefix}"), e))?;

        Ok(entries
            .into_iter()
            .map(|meta| ObjectMeta {
                path: self.relative_path(&meta.location),
                size: meta.size as u64,
                version: Self::version_token(meta.e_tag.as_deref(), meta.version.as_deref()),
                last_modified: Some(meta.last_modified),
            })
            .collect())
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let location = self.full_path(path);
        match self.store.head(&location).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                path: path.to_string(),
                size: meta.size as u64,
                version: Self::version_token(meta.e_tag.as_deref(), meta.version.as_deref()),
                last_modified: Some(meta.last_modified),
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(other) => Err(Error::storage_with_source(
                format!("head failed: {path}"),
                other,
            )),
        }
    }
}
