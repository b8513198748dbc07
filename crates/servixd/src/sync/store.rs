//! Record storage behind the reconciliation engine.
//!
//! [`SyncStore`] is the seam: the engine only needs a scoped read, a lookup
//! by uid and an all-or-nothing batch write. [`MemoryStore`] is the in-process
//! implementation used by the daemon and the tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use servix_core::{SyncMetadata, SyncRecord, SyncScope};
use servix_protocol::SyncEntry;

/// Storage failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{model} record not found: {uid}")]
    NotFound { model: String, uid: String },

    #[error("{model} record already exists: {uid}")]
    AlreadyExists { model: String, uid: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// One paired data + metadata mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOp {
    Create {
        record: SyncRecord,
        metadata: SyncMetadata,
    },
    Update {
        record: SyncRecord,
        metadata: SyncMetadata,
    },
    /// Tombstone: the payload is kept for scope matching, the metadata
    /// gains `deleted_at`.
    Delete {
        uid: String,
        deleted_at: DateTime<Utc>,
    },
}

/// Mutations committed together, for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    pub model: String,
    pub ops: Vec<SyncOp>,
}

/// Scoped reads and atomic batch writes.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Every row in scope, tombstones included.
    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<SyncEntry>, StoreError>;

    /// Rows of `model` with one of `uids`, whatever their payload.
    /// Tombstones included; unknown uids are skipped.
    async fn fetch_uids(&self, model: &str, uids: &[String]) -> Result<Vec<SyncEntry>, StoreError>;

    /// Applies every op or none of them.
    async fn commit(&self, batch: SyncBatch) -> Result<(), StoreError>;
}

type Rows = BTreeMap<String, SyncEntry>;

/// In-memory store: `model → uid → entry`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    models: RwLock<HashMap<String, Rows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new live record. A string `uid` field in the payload is
    /// used as the record id; otherwise one is generated and written back.
    pub async fn insert(&self, model: &str, mut payload: Value) -> Result<SyncEntry, StoreError> {
        let Value::Object(fields) = &mut payload else {
            return Err(StoreError::InvalidPayload(format!(
                "{model} records must be JSON objects"
            )));
        };
        let uid = match fields.get("uid").and_then(Value::as_str) {
            Some(uid) => uid.to_string(),
            None => {
                let uid = uuid::Uuid::new_v4().to_string();
                fields.insert("uid".to_string(), Value::String(uid.clone()));
                uid
            }
        };

        let entry = SyncEntry {
            record: SyncRecord::new(uid.clone(), payload),
            metadata: SyncMetadata::created(uid.clone(), Utc::now()),
        };

        let mut models = self.models.write().await;
        let rows = models.entry(model.to_string()).or_default();
        if rows.contains_key(&uid) {
            return Err(StoreError::AlreadyExists {
                model: model.to_string(),
                uid,
            });
        }
        rows.insert(uid, entry.clone());
        Ok(entry)
    }

    /// Live records whose payload matches every `filter` field.
    pub async fn find(&self, model: &str, filter: &Map<String, Value>) -> Vec<SyncEntry> {
        let scope = SyncScope {
            model: model.to_string(),
            filter: filter.clone(),
        };
        let models = self.models.read().await;
        models
            .get(model)
            .map(|rows| {
                rows.values()
                    .filter(|e| !e.metadata.is_deleted() && scope.matches(&e.record.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A live record by uid.
    pub async fn get(&self, model: &str, uid: &str) -> Option<SyncEntry> {
        let models = self.models.read().await;
        models
            .get(model)
            .and_then(|rows| rows.get(uid))
            .filter(|e| !e.metadata.is_deleted())
            .cloned()
    }

    /// Shallow-merges `patch` into a live record and stamps `updated_at`.
    pub async fn update(&self, model: &str, uid: &str, patch: Value) -> Result<SyncEntry, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidPayload("patch must be a JSON object".into()));
        };
        let mut models = self.models.write().await;
        let entry = live_row(&mut models, model, uid)?;
        if let Value::Object(fields) = &mut entry.record.payload {
            for (key, value) in patch {
                if key != "uid" {
                    fields.insert(key, value);
                }
            }
        }
        entry.metadata.updated_at = Some(Utc::now());
        Ok(entry.clone())
    }

    /// Tombstones a live record and returns it as it was.
    pub async fn delete(&self, model: &str, uid: &str) -> Result<SyncEntry, StoreError> {
        let mut models = self.models.write().await;
        let entry = live_row(&mut models, model, uid)?;
        let before = entry.clone();
        entry.metadata.deleted_at = Some(Utc::now());
        Ok(before)
    }

    /// Raw row access, tombstones included.
    pub async fn row(&self, model: &str, uid: &str) -> Option<SyncEntry> {
        let models = self.models.read().await;
        models.get(model).and_then(|rows| rows.get(uid)).cloned()
    }
}

fn live_row<'a>(
    models: &'a mut HashMap<String, Rows>,
    model: &str,
    uid: &str,
) -> Result<&'a mut SyncEntry, StoreError> {
    models
        .get_mut(model)
        .and_then(|rows| rows.get_mut(uid))
        .filter(|e| !e.metadata.is_deleted())
        .ok_or_else(|| StoreError::NotFound {
            model: model.to_string(),
            uid: uid.to_string(),
        })
}

fn apply(rows: &mut Rows, model: &str, op: SyncOp) -> Result<(), StoreError> {
    match op {
        SyncOp::Create { record, metadata } => {
            if rows.contains_key(&record.uid) {
                return Err(StoreError::AlreadyExists {
                    model: model.to_string(),
                    uid: record.uid,
                });
            }
            rows.insert(record.uid.clone(), SyncEntry { record, metadata });
        }
        SyncOp::Update { record, metadata } => {
            let entry = rows.get_mut(&record.uid).ok_or_else(|| StoreError::NotFound {
                model: model.to_string(),
                uid: record.uid.clone(),
            })?;
            entry.record = record;
            entry.metadata = metadata;
        }
        SyncOp::Delete { uid, deleted_at } => {
            let entry = rows.get_mut(&uid).ok_or_else(|| StoreError::NotFound {
                model: model.to_string(),
                uid: uid.clone(),
            })?;
            entry.metadata.deleted_at = Some(deleted_at);
        }
    }
    Ok(())
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn fetch(&self, scope: &SyncScope) -> Result<Vec<SyncEntry>, StoreError> {
        let models = self.models.read().await;
        Ok(models
            .get(&scope.model)
            .map(|rows| {
                rows.values()
                    .filter(|e| scope.matches(&e.record.payload))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_uids(&self, model: &str, uids: &[String]) -> Result<Vec<SyncEntry>, StoreError> {
        let models = self.models.read().await;
        let Some(rows) = models.get(model) else {
            return Ok(Vec::new());
        };
        Ok(uids.iter().filter_map(|uid| rows.get(uid)).cloned().collect())
    }

    async fn commit(&self, batch: SyncBatch) -> Result<(), StoreError> {
        let mut models = self.models.write().await;
        let mut staged = models.get(&batch.model).cloned().unwrap_or_default();
        let count = batch.ops.len();
        for op in batch.ops {
            apply(&mut staged, &batch.model, op)?;
        }
        models.insert(batch.model.clone(), staged);
        debug!(model = %batch.model, ops = count, "Sync batch committed");
        Ok(())
    }
}
