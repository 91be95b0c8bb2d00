//! Object storage.
//!
//! Sources and overlays are fetched by `(bucket, key)`. [`FsObjectStore`]
//! maps buckets to directories under a root; [`MemoryObjectStore`] keeps
//! everything in a map.

use crate::error::HandlerError;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Content type object stores report when they know nothing better.
pub const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("The specified key does not exist.")]
    NotFound,
    #[error("{code}: {message}")]
    Other { code: String, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Translate into the caller-facing error for `key`.
    pub fn into_handler_error(self, key: &str) -> HandlerError {
        match self {
            StoreError::NotFound => HandlerError::NoSuchKey {
                key: key.to_string(),
            },
            StoreError::Other { code, message } => HandlerError::Storage { code, message },
            StoreError::Io(e) => HandlerError::Internal(e.to_string()),
        }
    }
}

/// An object body plus the metadata the response echoes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub expires: Option<String>,
    pub last_modified: Option<String>,
}

impl StoredObject {
    pub fn new(body: Vec<u8>, content_type: &str) -> Self {
        Self {
            body,
            content_type: Some(content_type.to_string()),
            ..Self::default()
        }
    }
}

pub trait ObjectStore: Sync {
    fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;
}

/// Buckets are directories directly under `root`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Option<PathBuf> {
        let plain = |p: &Path| p.components().all(|c| matches!(c, Component::Normal(_)));
        let (bucket_path, key_path) = (Path::new(bucket), Path::new(key));
        (plain(bucket_path) && plain(key_path) && !bucket.is_empty() && !key.is_empty())
            .then(|| self.root.join(bucket_path).join(key_path))
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let path = self.object_path(bucket, key).ok_or(StoreError::NotFound)?;
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(e) => return Err(StoreError::Io(e)),
        };
        let content_type = mime_guess::from_path(&path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| OCTET_STREAM.to_string());
        Ok(StoredObject {
            body,
            content_type: Some(content_type),
            ..StoredObject::default()
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, object: StoredObject) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert((bucket.to_string(), key.to_string()), object);
        }
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        let objects = self.objects.read().map_err(|_| StoreError::Other {
            code: "StoreUnavailable".to_string(),
            message: "object map lock poisoned".to_string(),
        })?;
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}
