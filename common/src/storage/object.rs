use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, Attribute, Attributes, ObjectStore, PutOptions};
use thiserror::Error;

use crate::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;

/// Object-store failures, collapsed to the three kinds callers can act on.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("object store authentication failed: {message}")]
    Auth { message: String },
    #[error("object store unavailable: {message}")]
    Network { message: String },
}

impl StorageError {
    fn from_object_store(key: &str, err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::NotFound {
                key: key.to_string(),
            },
            object_store::Error::Unauthenticated { .. }
            | object_store::Error::PermissionDenied { .. } => Self::Auth {
                message: err.to_string(),
            },
            other => Self::Network {
                message: other.to_string(),
            },
        }
    }
}

/// Thin adapter over `object_store` with the key layout the service uses.
/// All operations are idempotent on keys.
#[derive(Clone)]
pub struct ObjectStorage {
    store: DynStore,
    backend_kind: StorageKind,
}

pub fn document_key(memory_id: &str, document_id: &str) -> String {
    format!("memories/{memory_id}/documents/{document_id}")
}

pub fn memory_prefix(memory_id: &str) -> String {
    format!("memories/{memory_id}/")
}

pub fn backup_prefix(memory_id: &str) -> String {
    format!("_backups/{memory_id}/")
}

impl ObjectStorage {
    pub async fn new(cfg: &AppConfig) -> Result<Self, StorageError> {
        let store: DynStore = match cfg.storage {
            StorageKind::Local => {
                let base = resolve_base_dir(cfg);
                if !base.exists() {
                    tokio::fs::create_dir_all(&base)
                        .await
                        .map_err(|e| StorageError::Network {
                            message: format!("creating {}: {e}", base.display()),
                        })?;
                }
                Arc::new(LocalFileSystem::new_with_prefix(base).map_err(|e| {
                    StorageError::Network {
                        message: e.to_string(),
                    }
                })?)
            }
            StorageKind::Memory => Arc::new(InMemory::new()),
            StorageKind::S3 => {
                let bucket = cfg.s3_bucket.as_deref().ok_or_else(|| StorageError::Auth {
                    message: "s3 storage selected but s3_bucket is not configured".to_string(),
                })?;
                Arc::new(
                    AmazonS3Builder::from_env()
                        .with_bucket_name(bucket)
                        .build()
                        .map_err(|e| StorageError::Auth {
                            message: e.to_string(),
                        })?,
                )
            }
        };

        Ok(Self {
            store,
            backend_kind: cfg.storage.clone(),
        })
    }

    /// Inject a specific backend, for tests.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let path = ObjPath::from(key);
        let payload = object_store::PutPayload::from_bytes(data);
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.store
            .put_opts(&path, payload, opts)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_object_store(key, e))
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = ObjPath::from(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| StorageError::from_object_store(key, e))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageError::from_object_store(key, e))
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = ObjPath::from(key);
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            // Deleting an absent key is a no-op for idempotency.
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::from_object_store(key, e)),
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        let deleted = self
            .store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| StorageError::from_object_store(prefix, e))?;
        Ok(deleted.len())
    }

    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix_path = ObjPath::from(prefix);
        let metas: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| StorageError::from_object_store(prefix, e))?;
        Ok(metas
            .into_iter()
            .map(|m| m.location.as_ref().to_string())
            .collect())
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = ObjPath::from(key);
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StorageError::from_object_store(key, e)),
        }
    }

    pub async fn head(&self, key: &str) -> Result<u64, StorageError> {
        let path = ObjPath::from(key);
        let meta = self
            .store
            .head(&path)
            .await
            .map_err(|e| StorageError::from_object_store(key, e))?;
        Ok(meta.size as u64)
    }
}

/// Resolve the absolute base directory used for local storage from config.
fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}
