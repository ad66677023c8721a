//! Variable records on top of blob storage.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::blob::{read_all, store_bytes, BlobArea, BlobKey, BlobStorage};
use crate::core::{IdSequence, RunId, VariableId};
use crate::errors::StorageError;
use crate::graph::VariableContext;
use crate::utils::{now_utc, Timestamp};

/// Content identity of an initialized variable: SHA-256 plus length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentIdentity {
    /// Hex SHA-256 of the bytes.
    pub sha256: String,
    /// Byte length.
    pub size: u64,
}

impl ContentIdentity {
    /// Computes the identity of a buffer.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            sha256: hex::encode(hasher.finalize()),
            size: bytes.len() as u64,
        }
    }
}

impl fmt::Display for ContentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}:{}", self.sha256, self.size)
    }
}

/// A named byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable id, also the blob id.
    pub id: VariableId,
    /// Owning run; `None` for cache payloads and functions.
    pub run_id: Option<RunId>,
    /// Declared name.
    pub name: String,
    /// Scope.
    pub context: VariableContext,
    /// Storage area.
    pub area: BlobArea,
    /// True once data (or a null marker) was written.
    pub inited: bool,
    /// True if the producer reported no value.
    pub nullified: bool,
    /// Identity of the stored bytes.
    pub identity: Option<ContentIdentity>,
    /// When the data arrived.
    pub uploaded_on: Option<Timestamp>,
}

impl Variable {
    /// Storage address.
    #[must_use]
    pub fn key(&self) -> BlobKey {
        BlobKey::new(self.area, self.id.get())
    }
}

/// Owns variable records and serializes writers per variable.
pub struct VariableService {
    storage: Arc<dyn BlobStorage>,
    records: DashMap<VariableId, Variable>,
    write_locks: DashMap<VariableId, Arc<Mutex<()>>>,
    ids: IdSequence,
    timeout: Option<Duration>,
}

impl fmt::Debug for VariableService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableService")
            .field("backend", &self.storage.backend())
            .field("records", &self.records.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl VariableService {
    /// Creates a service over a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self {
            storage,
            records: DashMap::new(),
            write_locks: DashMap::new(),
            ids: IdSequence::default(),
            timeout: None,
        }
    }

    /// Bounds every backend call. A call that overruns fails with
    /// [`StorageError::Unavailable`] and may be retried.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let Some(limit) = self.timeout else {
            return call.await;
        };
        tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            warn!(backend = self.storage.backend(), operation, timeout = ?limit, "storage call timed out");
            Err(StorageError::Unavailable(format!(
                "{operation} timed out after {} ms",
                limit.as_millis()
            )))
        })
    }

    /// Stores raw bytes under `key`, outside any variable record.
    pub async fn store_blob(&self, key: &BlobKey, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.bounded("store", store_bytes(self.storage.as_ref(), key, bytes)).await
    }

    /// Reads raw bytes stored under `key`.
    pub async fn read_blob(&self, key: &BlobKey) -> Result<Vec<u8>, StorageError> {
        self.bounded("read", read_all(self.storage.as_ref(), key)).await
    }

    /// The underlying backend.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn BlobStorage> {
        &self.storage
    }

    /// Returns a snapshot of a record.
    #[must_use]
    pub fn get(&self, id: VariableId) -> Option<Variable> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    /// Creates an empty record and reserves its blob.
    pub async fn create_placeholder(
        &self,
        run_id: Option<RunId>,
        name: &str,
        context: VariableContext,
        area: BlobArea,
    ) -> Result<Variable, StorageError> {
        let variable = Variable {
            id: VariableId::new(self.ids.next_id()),
            run_id,
            name: name.to_string(),
            context,
            area,
            inited: false,
            nullified: false,
            identity: None,
            uploaded_on: None,
        };
        self.bounded("create_placeholder", self.storage.create_placeholder(&variable.key()))
            .await?;
        self.records.insert(variable.id, variable.clone());
        Ok(variable)
    }

    /// Creates a record and fills it in one step.
    pub async fn create_with_data(
        &self,
        run_id: Option<RunId>,
        name: &str,
        context: VariableContext,
        area: BlobArea,
        bytes: Vec<u8>,
    ) -> Result<Variable, StorageError> {
        let placeholder = self.create_placeholder(run_id, name, context, area).await?;
        self.fill(placeholder.id, bytes).await
    }

    fn try_lock(&self, id: VariableId) -> Result<OwnedMutexGuard<()>, StorageError> {
        let lock = Arc::clone(self.write_locks.entry(id).or_default().value());
        lock.try_lock_owned().map_err(|_| StorageError::VariableBusy(id))
    }

    /// Takes the write lock of a variable that still awaits its value.
    fn begin_write(&self, id: VariableId) -> Result<(OwnedMutexGuard<()>, Variable), StorageError> {
        self.uninited_record(id)?;
        let guard = self.try_lock(id)?;
        match self.uninited_record(id) {
            Ok(record) => Ok((guard, record)),
            Err(e) => {
                self.write_locks.remove(&id);
                Err(e)
            }
        }
    }

    fn uninited_record(&self, id: VariableId) -> Result<Variable, StorageError> {
        let record = self
            .get(id)
            .ok_or_else(|| StorageError::DataNotFound(format!("variable {id}")))?;
        if record.inited {
            return Err(StorageError::AlreadyInited(id));
        }
        Ok(record)
    }

    /// Records the written value and retires the variable's write lock.
    ///
    /// Must run while the caller still holds the lock. An inited variable
    /// never takes another writer, so later callers that create a fresh
    /// lock only get [`StorageError::AlreadyInited`].
    fn mark_inited(&self, id: VariableId, identity: Option<ContentIdentity>) -> Result<Variable, StorageError> {
        let variable = {
            let mut entry = self
                .records
                .get_mut(&id)
                .ok_or_else(|| StorageError::DataNotFound(format!("variable {id}")))?;
            entry.inited = true;
            entry.nullified = identity.is_none();
            entry.identity = identity;
            entry.uploaded_on = Some(now_utc());
            entry.value().clone()
        };
        self.write_locks.remove(&id);
        Ok(variable)
    }

    /// Writes the bytes of a placeholder.
    ///
    /// A concurrent writer of the same variable gets
    /// [`StorageError::VariableBusy`]; a filled variable rejects with
    /// [`StorageError::AlreadyInited`].
    pub async fn fill(&self, id: VariableId, bytes: Vec<u8>) -> Result<Variable, StorageError> {
        let (_guard, record) = self.begin_write(id)?;
        let identity = ContentIdentity::of(&bytes);
        self.store_blob(&record.key(), bytes).await?;
        debug!(variable_id = %id, size = identity.size, "variable filled");
        self.mark_inited(id, Some(identity))
    }

    /// Fills a placeholder by copying another blob whose identity is known.
    pub async fn fill_by_copy(
        &self,
        id: VariableId,
        source: &BlobKey,
        identity: ContentIdentity,
    ) -> Result<Variable, StorageError> {
        let (_guard, record) = self.begin_write(id)?;
        self.bounded("copy", self.storage.copy(source, &record.key())).await?;
        debug!(variable_id = %id, from = %source, "variable filled by copy");
        self.mark_inited(id, Some(identity))
    }

    /// Marks a placeholder as holding no value.
    pub async fn nullify(&self, id: VariableId) -> Result<Variable, StorageError> {
        let _write = self.begin_write(id)?;
        self.mark_inited(id, None)
    }

    /// Reads the bytes of an initialized, non-null variable.
    pub async fn read(&self, id: VariableId) -> Result<Vec<u8>, StorageError> {
        let record = self
            .get(id)
            .ok_or_else(|| StorageError::DataNotFound(format!("variable {id}")))?;
        if !record.inited {
            return Err(StorageError::DataNotFound(format!("variable {id} is not initialized")));
        }
        if record.nullified {
            return Err(StorageError::DataNotFound(format!("variable {id} is nullified")));
        }
        self.read_blob(&record.key()).await
    }

    /// Identity of an initialized variable; `None` if it is nullified.
    pub fn content_identity(&self, id: VariableId) -> Result<Option<ContentIdentity>, StorageError> {
        let record = self
            .get(id)
            .ok_or_else(|| StorageError::DataNotFound(format!("variable {id}")))?;
        if !record.inited {
            return Err(StorageError::DataNotFound(format!("variable {id} is not initialized")));
        }
        Ok(record.identity)
    }

    /// Deletes every variable of a run. Returns the number removed.
    pub async fn delete_run(&self, run_id: RunId) -> usize {
        let doomed: Vec<Variable> = self
            .records
            .iter()
            .filter(|r| r.run_id == Some(run_id))
            .map(|r| r.value().clone())
            .collect();
        for variable in &doomed {
            if let Err(e) = self.bounded("delete", self.storage.delete(&variable.key())).await {
                warn!(variable_id = %variable.id, error = %e, "failed to delete variable data");
            }
            self.records.remove(&variable.id);
            self.write_locks.remove(&variable.id);
        }
        doomed.len()
    }
}
