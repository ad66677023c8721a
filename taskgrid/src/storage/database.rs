//! SQLite blob backend.
//!
//! One table per [`BlobArea`]. A placeholder is a row with `NULL` data.
//! Every call runs on the blocking pool behind a single connection mutex.
//!
//! Stores are streamed: the payload is written chunk by chunk into a
//! preallocated row of `blob_upload` through incremental blob I/O, then
//! moved into its area table in one transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::blob::{size_mismatch, BlobArea, BlobKey, BlobReader, BlobStorage, STORE_CHUNK};
use crate::errors::StorageError;
use crate::utils::iso_timestamp;

/// Blob storage in a relational database.
#[derive(Clone)]
pub struct DatabaseBlobStorage {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DatabaseBlobStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseBlobStorage").finish_non_exhaustive()
    }
}

impl DatabaseBlobStorage {
    /// Opens or creates a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let mut schema = String::from(
            "CREATE TABLE IF NOT EXISTS blob_upload (
                upload_id INTEGER PRIMARY KEY AUTOINCREMENT,
                data BLOB NOT NULL
            );
            DELETE FROM blob_upload;\n",
        );
        for area in BlobArea::ALL {
            schema.push_str(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY,
                    data BLOB,
                    size INTEGER NOT NULL DEFAULT 0,
                    uploaded_on TEXT
                );\n",
                area.table_name()
            ));
        }
        conn.execute_batch(&schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("blocking task failed: {e}")))?
    }

    /// Copies `data` into the preallocated upload row, one chunk per
    /// blocking call. Fails unless exactly `size` bytes arrive.
    async fn upload_chunks(
        &self,
        upload_id: i64,
        data: &mut BlobReader,
        key: &BlobKey,
        size: u64,
    ) -> Result<(), StorageError> {
        let mut offset: u64 = 0;
        loop {
            let mut chunk = Vec::with_capacity(STORE_CHUNK);
            (&mut *data).take(STORE_CHUNK as u64).read_to_end(&mut chunk).await?;
            if chunk.is_empty() {
                break;
            }
            let end = offset + chunk.len() as u64;
            if end > size {
                return Err(size_mismatch(key, size, end));
            }
            let start = usize::try_from(offset).map_err(|_| size_mismatch(key, size, offset))?;
            self.blocking(move |conn| {
                let mut blob = conn.blob_open(DatabaseName::Main, "blob_upload", "data", upload_id, false)?;
                blob.write_at(&chunk, start)?;
                Ok(())
            })
            .await?;
            offset = end;
        }
        if offset == size {
            Ok(())
        } else {
            Err(size_mismatch(key, size, offset))
        }
    }

    async fn discard_upload(&self, upload_id: i64) {
        let outcome = self
            .blocking(move |conn| {
                conn.execute("DELETE FROM blob_upload WHERE upload_id = ?1", params![upload_id])?;
                Ok(())
            })
            .await;
        if let Err(e) = outcome {
            warn!(upload_id, error = %e, "abandoned upload not removed");
        }
    }
}

fn row_id(key: &BlobKey) -> Result<i64, StorageError> {
    i64::try_from(key.id).map_err(|_| StorageError::DataNotFound(format!("{key}: id out of range")))
}

#[async_trait]
impl BlobStorage for DatabaseBlobStorage {
    fn backend(&self) -> &'static str {
        "database"
    }

    async fn create_placeholder(&self, key: &BlobKey) -> Result<(), StorageError> {
        let key = *key;
        let id = row_id(&key)?;
        self.blocking(move |conn| {
            conn.execute(
                &format!("INSERT OR IGNORE INTO {} (id, data, size) VALUES (?1, NULL, 0)", key.area.table_name()),
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn store(&self, key: &BlobKey, mut data: BlobReader, size: u64) -> Result<(), StorageError> {
        let key = *key;
        let id = row_id(&key)?;
        let length = i64::try_from(size).map_err(|_| size_mismatch(&key, size, u64::MAX))?;
        let upload_id = self
            .blocking(move |conn| {
                conn.execute("INSERT INTO blob_upload (data) VALUES (zeroblob(?1))", params![length])?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        if let Err(e) = self.upload_chunks(upload_id, &mut data, &key, size).await {
            self.discard_upload(upload_id).await;
            return Err(e);
        }

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, data, size, uploaded_on)
                     SELECT ?1, data, ?2, ?3 FROM blob_upload WHERE upload_id = ?4",
                    key.area.table_name()
                ),
                params![id, length, iso_timestamp(), upload_id],
            )?;
            tx.execute("DELETE FROM blob_upload WHERE upload_id = ?1", params![upload_id])?;
            tx.commit()?;
            debug!(blob = %key, size = length, "stored blob");
            Ok(())
        })
        .await
    }

    async fn fetch(&self, key: &BlobKey) -> Result<BlobReader, StorageError> {
        let key = *key;
        let id = row_id(&key)?;
        let bytes = self
            .blocking(move |conn| {
                let data: Option<Option<Vec<u8>>> = conn
                    .query_row(
                        &format!("SELECT data FROM {} WHERE id = ?1", key.area.table_name()),
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                data.flatten().ok_or_else(|| StorageError::DataNotFound(key.to_string()))
            })
            .await?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn copy(&self, source: &BlobKey, target: &BlobKey) -> Result<(), StorageError> {
        let (source, target) = (*source, *target);
        let (source_id, target_id) = (row_id(&source)?, row_id(&target)?);
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let row: Option<(Option<Vec<u8>>, i64)> = tx
                .query_row(
                    &format!("SELECT data, size FROM {} WHERE id = ?1", source.area.table_name()),
                    params![source_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let (data, size) = match row {
                Some((Some(data), size)) => (data, size),
                _ => return Err(StorageError::DataNotFound(source.to_string())),
            };
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (id, data, size, uploaded_on) VALUES (?1, ?2, ?3, ?4)",
                    target.area.table_name()
                ),
                params![target_id, data, size, iso_timestamp()],
            )?;
            tx.commit()?;
            debug!(from = %source, to = %target, "copied blob");
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), StorageError> {
        let key = *key;
        let id = row_id(&key)?;
        self.blocking(move |conn| {
            conn.execute(&format!("DELETE FROM {} WHERE id = ?1", key.area.table_name()), params![id])?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError> {
        let key = *key;
        let id = row_id(&key)?;
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    &format!("SELECT 1 FROM {} WHERE id = ?1 AND data IS NOT NULL", key.area.table_name()),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }
}
