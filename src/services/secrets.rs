//! Secret lookup with a one-entry cache.
//!
//! A secret is a JSON object string (`{"signing-key": "..."}`) stored under an
//! id. [`SecretProvider`] remembers the last `(id, secret)` pair so repeated
//! requests do not hit the store.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("secret {0} not found")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait SecretStore: Sync {
    fn secret_string(&self, id: &str) -> Result<String, SecretError>;
}

/// Caches the most recently fetched secret.
pub struct SecretProvider<S> {
    store: S,
    cached: Mutex<Option<(String, String)>>,
}

impl<S: SecretStore> SecretProvider<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cached: Mutex::new(None),
        }
    }

    /// The secret for `id`, from cache when the id matches the last lookup.
    pub fn get_secret(&self, id: &str) -> Result<String, SecretError> {
        if let Ok(cached) = self.cached.lock()
            && let Some((cached_id, secret)) = cached.as_ref()
            && cached_id == id
        {
            return Ok(secret.clone());
        }

        debug!(secret_id = id, "fetching secret");
        let secret = self.store.secret_string(id)?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some((id.to_string(), secret.clone()));
        }
        Ok(secret)
    }

    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }
}

impl<S: SecretStore> SecretStore for SecretProvider<S> {
    fn secret_string(&self, id: &str) -> Result<String, SecretError> {
        self.get_secret(id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapSecretStore {
    secrets: HashMap<String, String>,
}

impl MapSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, id: &str, secret: &str) -> Self {
        self.secrets.insert(id.to_string(), secret.to_string());
        self
    }
}

impl SecretStore for MapSecretStore {
    fn secret_string(&self, id: &str) -> Result<String, SecretError> {
        self.secrets
            .get(id)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(id.to_string()))
    }
}

/// One file per secret id inside a directory.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SecretStore for FileSecretStore {
    fn secret_string(&self, id: &str) -> Result<String, SecretError> {
        let mut components = Path::new(id).components();
        let single_name = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single_name {
            return Err(SecretError::NotFound(id.to_string()));
        }
        match std::fs::read_to_string(self.dir.join(id)) {
            Ok(text) => Ok(text.trim_end().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecretError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
