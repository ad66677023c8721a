//! Variable and blob storage.
//!
//! Two interchangeable [`BlobStorage`] backends ([`DatabaseBlobStorage`],
//! [`FilesystemBlobStorage`]) sit under the [`VariableService`], which owns
//! variable records and their `inited`/`nullified` lifecycle. The backend is
//! chosen once per process from [`StorageConfig`].

mod blob;
mod database;
mod filesystem;
mod variable;

use std::sync::Arc;

pub use blob::{read_all, store_bytes, with_data, BlobArea, BlobKey, BlobReader, BlobStorage};
pub use database::DatabaseBlobStorage;
pub use filesystem::{shard_dirs, FilesystemBlobStorage};
pub use variable::{ContentIdentity, Variable, VariableService};

use crate::config::StorageConfig;
use crate::errors::StorageError;

/// Opens the backend selected by configuration.
pub fn open_storage(config: &StorageConfig) -> Result<Arc<dyn BlobStorage>, StorageError> {
    let storage: Arc<dyn BlobStorage> = match config {
        StorageConfig::Database { path } => Arc::new(DatabaseBlobStorage::open(path)?),
        StorageConfig::InMemoryDatabase => Arc::new(DatabaseBlobStorage::in_memory()?),
        StorageConfig::Filesystem { root } => Arc::new(FilesystemBlobStorage::new(root.clone())),
    };
    tracing::info!(backend = storage.backend(), "storage backend selected");
    Ok(storage)
}
