//! Result cache.
//!
//! Entries are keyed by (process identity, fingerprint) and point at
//! payloads in the cache-variable storage area. A hit is materialized by
//! copying each payload into the consuming task's own output variables, so
//! no two tasks ever share output storage.

mod fingerprint;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub use fingerprint::{compute_fingerprint, process_identity, InputFingerprint};

use crate::core::TaskOutput;
use crate::errors::StorageError;
use crate::graph::VariableContext;
use crate::storage::{BlobArea, BlobKey, ContentIdentity, VariableService};
use crate::utils::{now_utc, Timestamp};

/// Key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Function code and params.
    pub process: String,
    /// Input fingerprint.
    pub fingerprint: String,
}

impl CacheKey {
    /// Creates a key.
    #[must_use]
    pub fn new(process: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            fingerprint: fingerprint.into(),
        }
    }
}

/// One named output of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    /// Output name.
    pub name: String,
    /// Payload location; `None` if the output was nullified.
    pub blob: Option<BlobKey>,
    /// Identity of the payload.
    pub identity: Option<ContentIdentity>,
}

/// A stored computation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key.
    pub key: CacheKey,
    /// Outputs by name.
    pub outputs: Vec<CachedOutput>,
    /// A nullified entry is treated as absent.
    pub nullified: bool,
    /// Creation time.
    pub created_on: Timestamp,
}

/// The result cache.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    variables: Arc<VariableService>,
}

impl ResultCache {
    /// Creates an empty cache storing payloads through `variables`.
    #[must_use]
    pub fn new(variables: Arc<VariableService>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            variables,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values().filter(|e| !e.nullified).count()
    }

    /// Returns true if no live entry exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a live entry. Nullified entries are misses.
    #[must_use]
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().get(key).filter(|e| !e.nullified).cloned()
    }

    /// Stores the outputs of a finished task.
    ///
    /// Output bytes are copied into the cache area. An existing live entry
    /// for the key is kept and returned unchanged.
    pub async fn store(&self, key: CacheKey, outputs: &[TaskOutput]) -> Result<CacheEntry, StorageError> {
        if let Some(existing) = self.lookup(&key) {
            return Ok(existing);
        }

        let mut cached = Vec::with_capacity(outputs.len());
        for output in outputs {
            let record = self
                .variables
                .get(output.variable_id)
                .ok_or_else(|| StorageError::DataNotFound(format!("variable {}", output.variable_id)))?;
            let entry = match record.identity.clone() {
                Some(identity) if record.inited && !record.nullified => {
                    let payload = self
                        .variables
                        .create_placeholder(None, &output.name, VariableContext::Local, BlobArea::CacheVariables)
                        .await?;
                    let payload = self
                        .variables
                        .fill_by_copy(payload.id, &record.key(), identity.clone())
                        .await?;
                    CachedOutput {
                        name: output.name.clone(),
                        blob: Some(payload.key()),
                        identity: Some(identity),
                    }
                }
                _ if record.inited => CachedOutput {
                    name: output.name.clone(),
                    blob: None,
                    identity: None,
                },
                _ => return Err(StorageError::DataNotFound(format!("variable {} is not initialized", record.id))),
            };
            cached.push(entry);
        }

        let entry = CacheEntry {
            key: key.clone(),
            outputs: cached,
            nullified: false,
            created_on: now_utc(),
        };
        info!(process = %key.process, fingerprint = %key.fingerprint, "cache entry stored");
        self.entries.write().insert(key, entry.clone());
        Ok(entry)
    }

    /// Copies a hit into a task's output placeholders.
    ///
    /// Fails with [`StorageError::DataNotFound`] if the entry lacks one of
    /// the task's outputs.
    pub async fn materialize(&self, entry: &CacheEntry, outputs: &[TaskOutput]) -> Result<(), StorageError> {
        for output in outputs {
            let cached = entry
                .outputs
                .iter()
                .find(|c| c.name == output.name)
                .ok_or_else(|| StorageError::DataNotFound(format!("cache entry has no output '{}'", output.name)))?;
            match (&cached.blob, &cached.identity) {
                (Some(blob), Some(identity)) => {
                    self.variables
                        .fill_by_copy(output.variable_id, blob, identity.clone())
                        .await?;
                }
                _ => {
                    self.variables.nullify(output.variable_id).await?;
                }
            }
        }
        debug!(fingerprint = %entry.key.fingerprint, outputs = outputs.len(), "cache hit materialized");
        Ok(())
    }

    /// Marks an entry nullified. Returns true if a live entry was found.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.entries.write().get_mut(key) {
            Some(entry) if !entry.nullified => {
                entry.nullified = true;
                true
            }
            _ => false,
        }
    }
}
