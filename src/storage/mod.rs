//! Persistent state.
//!
//! - `raw_files`: atomic whole-file writes.
//! - `vault_store`: a small key-value map encrypted at rest with
//!   ChaCha20-Poly1305 under the `Storage` purpose key.
//!
//! Keys are namespaced strings: `cache/<key>`, `lkg/<key>`, `prefs/<name>`.

pub mod raw_files;
pub mod vault_store;

pub use vault_store::EncryptedStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found")]
    NotFound,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("I/O error: {0}")]
    Io(std::io::Error),
    /// Unknown format or truncated file.
    #[error("Store is corrupted")]
    Corruption,
    /// Authentication failed, usually a different device key.
    #[error("Store could not be decrypted")]
    Crypto,
    #[error("Invalid store key length {0}")]
    InvalidKey(usize),
    #[error("Invalid path")]
    InvalidPath,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageError::PermissionDenied,
            _ => StorageError::Io(err),
        }
    }
}
