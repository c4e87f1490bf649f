//! Pipeline-scoped storage with a fixed path layout.
//!
//! Aggregation state for different pipelines must never collide: every
//! reducer deployment serves exactly one pipeline, and all of its state lives
//! under `pipeline={pipeline_id}/`. The key=value path format is
//! grep-friendly and self-documenting, and makes the owning pipeline
//! extractable from any storage path.
//!
//! # Isolation
//!
//! This module enforces strict path isolation:
//! - All paths are prefixed with the pipeline scope
//! - Path traversal attempts (`..`, absolute paths) are rejected
//! - Pipeline ids are validated at construction

use bytes::Bytes;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

/// Pipeline-scoped storage wrapper.
///
/// Prefixes all paths with `pipeline={pipeline_id}/` before delegating to the
/// underlying [`StorageBackend`].
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    pipeline_id: String,
}

impl ScopedStorage {
    /// Creates a new scoped storage wrapper.
    ///
    /// # Errors
    ///
    /// Returns an error if `pipeline_id` is invalid. Ids must be non-empty,
    /// ASCII lowercase alphanumeric (plus `-` and `_`), and must not contain
    /// path separators or control characters.
    pub fn new(backend: Arc<dyn StorageBackend>, pipeline_id: impl Into<String>) -> Result<Self> {
        let pipeline_id = pipeline_id.into();
        Self::validate_id(&pipeline_id)?;
        Ok(Self {
            backend,
            pipeline_id,
        })
    }

    /// Returns the pipeline id this storage is scoped to.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Returns the scope prefix, `pipeline={pipeline_id}/`.
    #[must_use]
    pub fn prefix(&self) -> String {
        format!("pipeline={}/", self.pipeline_id)
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: "pipeline_id cannot be empty".into(),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::InvalidId {
                message: "pipeline_id contains invalid characters (allowed: a-z, 0-9, '-', '_')"
                    .into(),
            });
        }

        Ok(())
    }

    /// Validates a relative path against traversal attacks.
    fn validate_path(path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(Error::InvalidInput("empty path not allowed".into()));
        }

        if path.starts_with('/') || path.contains('\\') {
            return Err(Error::InvalidInput(format!(
                "absolute paths and backslashes not allowed: {path}"
            )));
        }

        if path.split('/').any(|segment| segment == "..") {
            return Err(Error::InvalidInput(format!(
                "path traversal not allowed: {path}"
            )));
        }

        if path.contains('\n') || path.contains('\r') || path.contains('\0') {
            return Err(Error::InvalidInput(format!(
                "control characters not allowed in paths: {path}"
            )));
        }

        Ok(())
    }

    fn scoped(&self, path: &str) -> Result<String> {
        Self::validate_path(path)?;
        Ok(format!("{}{path}", self.prefix()))
    }

    /// Reads an object at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist, or an error for
    /// invalid paths and backend failures.
    pub async fn get_raw(&self, path: &str) -> Result<Bytes> {
        self.backend.get(&self.scoped(path)?).await
    }

    /// Writes an object at a scope-relative path with a precondition.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid paths and backend failures. A failed
    /// precondition is a normal [`WriteResult`], not an error.
    pub async fn put_raw(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.backend.put(&self.scoped(path)?, data, precondition).await
    }

    /// Deletes an object at a scope-relative path (idempotent).
    ///
    /// # Errors
    ///
    /// Returns an error for invalid paths and backend failures.
    pub async fn delete_raw(&self, path: &str) -> Result<()> {
        self.backend.delete(&self.scoped(path)?).await
    }

    /// Lists objects under a scope-relative prefix.
    ///
    /// Returned paths are scope-relative (the pipeline prefix is stripped).
    ///
    /// # Errors
    ///
    /// Returns an error for invalid prefixes and backend failures.
    pub async fn list_raw(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Self::validate_path(prefix)?;
        let scope = self.prefix();
        let entries = self.backend.list(&format!("{scope}{prefix}")).await?;
        Ok(entries
            .into_iter()
            .map(|mut meta| {
                if let Some(stripped) = meta.path.strip_prefix(&scope) {
                    meta.path = stripped.to_string();
                }
                meta
            })
            .collect())
    }

    /// Gets object metadata at a scope-relative path.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid paths and backend failures.
    pub async fn head_raw(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.backend.head(&self.scoped(path)?).await
    }
}

impl std::fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("pipeline_id", &self.pipeline_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn scoped() -> ScopedStorage {
        ScopedStorage::new(Arc::new(MemoryBackend::new()), "ingest").expect("valid id")
    }

    #[tokio::test]
    async fn paths_are_prefixed_with_pipeline_scope() {
        let backend = Arc::new(MemoryBackend::new());
        let storage = ScopedStorage::new(backend.clone(), "ingest").unwrap();

        storage
            .put_raw("aggregations/a.json", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();

        let raw = backend.get("pipeline=ingest/aggregations/a.json").await;
        assert!(raw.is_ok());
    }

    #[tokio::test]
    async fn list_strips_scope_prefix() {
        let storage = scoped();
        storage
            .put_raw("aggregations/a.json", Bytes::from("x"), WritePrecondition::None)
            .await
            .unwrap();

        let entries = storage.list_raw("aggregations/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "aggregations/a.json");
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let storage = scoped();
        assert!(storage.get_raw("../other/secret.json").await.is_err());
        assert!(storage.get_raw("a/../../b.json").await.is_err());
        assert!(storage.get_raw("/absolute.json").await.is_err());
    }

    #[test]
    fn rejects_invalid_pipeline_ids() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        assert!(ScopedStorage::new(backend.clone(), "").is_err());
        assert!(ScopedStorage::new(backend.clone(), "Ingest").is_err());
        assert!(ScopedStorage::new(backend.clone(), "a/b").is_err());
        assert!(ScopedStorage::new(backend, "ok-pipeline_1").is_ok());
    }

    #[tokio::test]
    async fn pipelines_are_isolated() {
        let backend = Arc::new(MemoryBackend::new());
        let a = ScopedStorage::new(backend.clone(), "pipeline-a").unwrap();
        let b = ScopedStorage::new(backend, "pipeline-b").unwrap();

        a.put_raw("state.json", Bytes::from("a"), WritePrecondition::None)
            .await
            .unwrap();

        assert!(b.get_raw("state.json").await.is_err());
        assert!(b.list_raw("state.json").await.unwrap().is_empty());
    }
}
