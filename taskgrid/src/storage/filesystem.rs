//! Filesystem blob backend.
//!
//! Ids map to sharded paths so no directory holds more than a thousand
//! entries: id `1234` in the variable area lives at
//! `<root>/variable/000/000/001/1234.bin`.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::blob::{size_mismatch, BlobKey, BlobReader, BlobStorage};
use crate::errors::StorageError;

/// Blob storage under a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemBlobStorage {
    root: PathBuf,
}

/// Returns the shard directory components of an id.
///
/// The id is zero-padded to 12 digits, split into groups of three, and the
/// last group is dropped.
#[must_use]
pub fn shard_dirs(id: u64) -> Vec<String> {
    let padded = format!("{id:012}");
    let groups: Vec<String> = padded
        .as_bytes()
        .chunks(3)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    groups[..groups.len().saturating_sub(1)].to_vec()
}

impl FilesystemBlobStorage {
    /// Uses `root` as the storage directory. It is created on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the data file for `key`.
    #[must_use]
    pub fn path_for(&self, key: &BlobKey) -> PathBuf {
        let mut path = self.root.join(key.area.dir_name());
        for dir in shard_dirs(key.id) {
            path.push(dir);
        }
        path.push(format!("{}.bin", key.id));
        path
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(unavailable)?;
        }
        Ok(())
    }

    /// Streams `data` into a fresh file at `path`. Returns the byte count.
    async fn stream_to(path: &Path, mut data: BlobReader) -> Result<u64, StorageError> {
        let mut file = fs::File::create(path).await.map_err(unavailable)?;
        let written = tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await.map_err(unavailable)?;
        file.sync_all().await.map_err(unavailable)?;
        Ok(written)
    }
}

fn unavailable(err: std::io::Error) -> StorageError {
    StorageError::Unavailable(err.to_string())
}

fn not_found_or_unavailable(err: std::io::Error, key: &BlobKey) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::DataNotFound(key.to_string())
    } else {
        unavailable(err)
    }
}

#[async_trait]
impl BlobStorage for FilesystemBlobStorage {
    fn backend(&self) -> &'static str {
        "filesystem"
    }

    async fn create_placeholder(&self, key: &BlobKey) -> Result<(), StorageError> {
        Self::ensure_parent(&self.path_for(key)).await
    }

    async fn store(&self, key: &BlobKey, data: BlobReader, size: u64) -> Result<(), StorageError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path).await?;
        let tmp = path.with_extension("bin.tmp");
        let written = match Self::stream_to(&tmp, data).await {
            Ok(written) if written == size => written,
            outcome => {
                let _ = fs::remove_file(&tmp).await;
                return Err(match outcome {
                    Ok(written) => size_mismatch(key, size, written),
                    Err(e) => e,
                });
            }
        };
        fs::rename(&tmp, &path).await.map_err(unavailable)?;
        debug!(blob = %key, path = %path.display(), size = written, "stored blob");
        Ok(())
    }

    async fn fetch(&self, key: &BlobKey) -> Result<BlobReader, StorageError> {
        let file = fs::File::open(self.path_for(key))
            .await
            .map_err(|e| not_found_or_unavailable(e, key))?;
        Ok(Box::new(file))
    }

    async fn copy(&self, source: &BlobKey, target: &BlobKey) -> Result<(), StorageError> {
        let from = self.path_for(source);
        let to = self.path_for(target);
        Self::ensure_parent(&to).await?;
        let tmp = to.with_extension("bin.tmp");
        fs::copy(&from, &tmp)
            .await
            .map_err(|e| not_found_or_unavailable(e, source))?;
        fs::rename(&tmp, &to).await.map_err(unavailable)?;
        debug!(from = %source, to = %target, "copied blob");
        Ok(())
    }

    async fn delete(&self, key: &BlobKey) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError> {
        fs::try_exists(self.path_for(key)).await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_all, store_bytes, BlobArea};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_shard_dirs() {
        assert_eq!(shard_dirs(1234), vec!["000", "000", "001"]);
        assert_eq!(shard_dirs(987_654_321_012), vec!["987", "654", "321"]);
        assert_eq!(shard_dirs(0), vec!["000", "000", "000"]);
    }

    #[test]
    fn test_path_layout() {
        let fs = FilesystemBlobStorage::new("/data");
        let path = fs.path_for(&BlobKey::new(BlobArea::Variables, 1234));
        assert_eq!(path, PathBuf::from("/data/variable/000/000/001/1234.bin"));
    }

    #[tokio::test]
    async fn test_store_fetch_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBlobStorage::new(dir.path());
        let a = BlobKey::new(BlobArea::Variables, 10);
        let b = BlobKey::new(BlobArea::CacheVariables, 11);

        store_bytes(&storage, &a, b"filesystem bytes".to_vec()).await.unwrap();
        assert_eq!(read_all(&storage, &a).await.unwrap(), b"filesystem bytes");

        storage.copy(&a, &b).await.unwrap();
        assert_eq!(read_all(&storage, &b).await.unwrap(), b"filesystem bytes");
    }

    #[tokio::test]
    async fn test_placeholder_then_fill() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBlobStorage::new(dir.path());
        let key = BlobKey::new(BlobArea::Functions, 3);

        storage.create_placeholder(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
        assert!(read_all(&storage, &key).await.unwrap_err().is_not_found());

        store_bytes(&storage, &key, vec![9; 64]).await.unwrap();
        assert!(storage.exists(&key).await.unwrap());

        storage.delete(&key).await.unwrap();
        storage.delete(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_streams_large_payload_and_rejects_short_reader() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBlobStorage::new(dir.path());
        let key = BlobKey::new(BlobArea::Variables, 12);
        let payload: Vec<u8> = (0..300_000_u32).map(|i| (i % 251) as u8).collect();

        store_bytes(&storage, &key, payload.clone()).await.unwrap();
        assert_eq!(read_all(&storage, &key).await.unwrap(), payload);

        let short = Box::new(std::io::Cursor::new(vec![1_u8; 10]));
        let err = storage.store(&key, short, 20).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(read_all(&storage, &key).await.unwrap(), payload);
        assert!(!fs::try_exists(storage.path_for(&key).with_extension("bin.tmp")).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_of_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FilesystemBlobStorage::new(dir.path());
        let err = storage
            .copy(&BlobKey::new(BlobArea::Variables, 1), &BlobKey::new(BlobArea::Variables, 2))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
