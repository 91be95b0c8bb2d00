//! Collaborators the handler talks to: object storage, image recognition and
//! the secret store. Each is a small trait so deployments and tests can plug
//! in their own implementation.

pub mod recognition;
pub mod secrets;
pub mod storage;

pub use recognition::{FaceDetail, ImageRecognition, ModerationLabel, NullRecognition, RecognitionError};
pub use secrets::{FileSecretStore, MapSecretStore, SecretError, SecretProvider, SecretStore};
pub use storage::{FsObjectStore, MemoryObjectStore, ObjectStore, StoreError, StoredObject};
