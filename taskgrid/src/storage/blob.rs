//! The backend-agnostic blob contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::StorageError;

/// A readable byte stream handed out by a backend.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Logical area of the store. Each area has its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobArea {
    /// Task inputs and outputs.
    Variables,
    /// Run-level globals.
    GlobalVariables,
    /// Function binaries.
    Functions,
    /// Result cache payloads.
    CacheVariables,
}

impl BlobArea {
    /// Every area, in a fixed order.
    pub const ALL: [Self; 4] = [
        Self::Variables,
        Self::GlobalVariables,
        Self::Functions,
        Self::CacheVariables,
    ];

    /// Table name in the database backend.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Variables => "variable_blob",
            Self::GlobalVariables => "global_variable_blob",
            Self::Functions => "function_blob",
            Self::CacheVariables => "cache_variable_blob",
        }
    }

    /// Directory name in the filesystem backend.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Variables => "variable",
            Self::GlobalVariables => "global-variable",
            Self::Functions => "function",
            Self::CacheVariables => "cache-variable",
        }
    }
}

/// Address of one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    /// Area.
    pub area: BlobArea,
    /// Id within the area.
    pub id: u64,
}

impl BlobKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(area: BlobArea, id: u64) -> Self {
        Self { area, id }
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.area.dir_name(), self.id)
    }
}

/// Uniform store/fetch/copy contract over a storage backend.
///
/// `fetch` of a key that was never stored, or only has a placeholder,
/// fails with [`StorageError::DataNotFound`]. Backend outages surface as
/// [`StorageError::Unavailable`].
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Reserves `key` without data, to be filled by `store` later.
    async fn create_placeholder(&self, key: &BlobKey) -> Result<(), StorageError>;

    /// Stores `size` bytes read from `data` under `key`, replacing any placeholder.
    async fn store(&self, key: &BlobKey, data: BlobReader, size: u64) -> Result<(), StorageError>;

    /// Opens the bytes stored under `key`.
    async fn fetch(&self, key: &BlobKey) -> Result<BlobReader, StorageError>;

    /// Copies the bytes of `source` to `target`.
    async fn copy(&self, source: &BlobKey, target: &BlobKey) -> Result<(), StorageError>;

    /// Removes `key` and its data. Missing keys are ignored.
    async fn delete(&self, key: &BlobKey) -> Result<(), StorageError>;

    /// Returns true if `key` holds data.
    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError>;
}

/// Runs `consumer` with the stream of `key`.
///
/// The stream is owned by the consumer future and dropped, and therefore
/// closed, whether the consumer returns `Ok`, `Err` or is cancelled.
pub async fn with_data<T, F, Fut>(storage: &dyn BlobStorage, key: &BlobKey, consumer: F) -> Result<T, StorageError>
where
    F: FnOnce(BlobReader) -> Fut + Send,
    Fut: Future<Output = Result<T, StorageError>> + Send,
{
    let reader = storage.fetch(key).await?;
    consumer(reader).await
}

/// Reads the whole blob into memory.
pub async fn read_all(storage: &dyn BlobStorage, key: &BlobKey) -> Result<Vec<u8>, StorageError> {
    with_data(storage, key, |mut reader| async move {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok::<_, StorageError>(buf)
    })
    .await
}

/// Stores an in-memory buffer.
pub async fn store_bytes(storage: &dyn BlobStorage, key: &BlobKey, bytes: Vec<u8>) -> Result<(), StorageError> {
    let size = bytes.len() as u64;
    storage.store(key, Box::new(std::io::Cursor::new(bytes)), size).await
}

/// Bytes read from a [`BlobReader`] per backend write.
pub(crate) const STORE_CHUNK: usize = 64 * 1024;

/// The error for a reader that did not yield the announced size.
pub(crate) fn size_mismatch(key: &BlobKey, expected: u64, actual: u64) -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("{key}: expected {expected} bytes, got {actual}"),
    ))
}
