//! Payloads of the `sync_request` / `sync_response` exchange.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use servix_core::{ServiceError, SyncMetadata, SyncRecord, SyncScope};
use std::collections::BTreeMap;

/// Client state offered for reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Correlation id echoed in the response
    pub uid: String,
    pub scope: SyncScope,
    /// Client records created at or before this instant are stale if the
    /// server does not know them
    pub cutoff: DateTime<Utc>,
    /// Client metadata keyed by record uid
    #[serde(default)]
    pub metadata: BTreeMap<String, SyncMetadata>,
    /// Client payloads for records the server may need to adopt
    #[serde(default)]
    pub records: BTreeMap<String, Value>,
}

impl SyncRequest {
    pub fn new(uid: impl Into<String>, scope: SyncScope, cutoff: DateTime<Utc>) -> Self {
        Self {
            uid: uid.into(),
            scope,
            cutoff,
            metadata: BTreeMap::new(),
            records: BTreeMap::new(),
        }
    }

    /// Adds a live client record together with its metadata.
    #[must_use]
    pub fn with_record(mut self, metadata: SyncMetadata, payload: Value) -> Self {
        self.records.insert(metadata.uid.clone(), payload);
        self.metadata.insert(metadata.uid.clone(), metadata);
        self
    }

    /// Adds metadata only (a tombstone, or a record the server should
    /// never need to adopt).
    #[must_use]
    pub fn with_metadata(mut self, metadata: SyncMetadata) -> Self {
        self.metadata.insert(metadata.uid.clone(), metadata);
        self
    }
}

/// A record the client must store, paired with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub record: SyncRecord,
    pub metadata: SyncMetadata,
}

/// Result of one reconciliation cycle.
///
/// `to_*` fields are instructions for the client; `created`, `updated` and
/// `deleted` list what the server changed on its side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    #[serde(default)]
    pub to_add: Vec<SyncEntry>,
    #[serde(default)]
    pub to_update: Vec<SyncEntry>,
    #[serde(default)]
    pub to_delete: Vec<String>,
    /// Client-only records created before the cutoff
    #[serde(default)]
    pub stale: Vec<String>,
    #[serde(default)]
    pub created: Vec<String>,
    #[serde(default)]
    pub updated: Vec<String>,
    #[serde(default)]
    pub deleted: Vec<String>,
}

impl SyncOutcome {
    /// True when neither side has anything left to do.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_update.is_empty()
            && self.to_delete.is_empty()
            && self.created.is_empty()
            && self.updated.is_empty()
            && self.deleted.is_empty()
    }
}

/// Reply to a `sync_request`: exactly one of `outcome` / `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl SyncResponse {
    pub fn from_result(uid: impl Into<String>, result: Result<SyncOutcome, ServiceError>) -> Self {
        let uid = uid.into();
        match result {
            Ok(outcome) => Self {
                uid,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => Self {
                uid,
                outcome: None,
                error: Some(err),
            },
        }
    }

    pub fn into_result(self) -> Result<SyncOutcome, ServiceError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.outcome.unwrap_or_default()),
        }
    }
}
