//! Pure classification step of reconciliation.
//!
//! Given the server rows in scope (plus any row outside it that the client
//! still holds) and the client's request, decide what each side must do.
//! No I/O happens here.
//!
//! ```text
//!              ┌──────────────┬───────────────────────────────────────┐
//!              │ server only  │ client adopts (tombstones skipped)    │
//!              ├──────────────┼───────────────────────────────────────┤
//!              │ client only  │ deleted     → client forgets          │
//!              │              │ > cutoff    → server creates          │
//!              │              │ ≤ cutoff    → stale (StalePolicy)     │
//!              ├──────────────┼───────────────────────────────────────┤
//!              │ both         │ client deleted → server tombstones,   │
//!              │              │                  client forgets       │
//!              │              │ server deleted → client forgets       │
//!              │              │ else newest wins, tie is a no-op      │
//!              ├──────────────┼───────────────────────────────────────┤
//!              │ out of scope │ client forgets                        │
//!              └──────────────┴───────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use servix_core::{SyncMetadata, SyncRecord};
use servix_protocol::{SyncEntry, SyncOutcome, SyncRequest};

use super::store::SyncOp;
use super::SyncError;

/// What to do with client-only records created at or before the cutoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Re-create them on the server so no data is lost.
    #[default]
    Recreate,

    /// Tell the client to forget them.
    Discard,
}

/// Result of classification: the client-facing outcome plus the server
/// mutations to commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPlan {
    pub outcome: SyncOutcome,
    pub ops: Vec<SyncOp>,
}

impl SyncPlan {
    fn server_create(&mut self, uid: &str, metadata: &SyncMetadata, request: &SyncRequest) -> Result<(), SyncError> {
        let mut record = client_record(uid, request)?;
        if let Value::Object(fields) = &mut record.payload {
            for (field, value) in &request.scope.filter {
                fields.insert(field.clone(), value.clone());
            }
        }
        self.ops.push(SyncOp::Create {
            record,
            metadata: metadata.clone(),
        });
        self.outcome.created.push(uid.to_string());
        Ok(())
    }
}

/// The client's payload for `uid`, with the `uid` field written in.
fn client_record(uid: &str, request: &SyncRequest) -> Result<SyncRecord, SyncError> {
    let mut payload = request
        .records
        .get(uid)
        .cloned()
        .ok_or_else(|| SyncError::MissingPayload(uid.to_string()))?;
    let Value::Object(fields) = &mut payload else {
        return Err(SyncError::InvalidPayload(uid.to_string()));
    };
    fields.insert("uid".to_string(), Value::String(uid.to_string()));
    Ok(SyncRecord::new(uid, payload))
}

/// Classifies every uid of `server` and `request.metadata`.
///
/// `server` rows that do not match `request.scope` are taken to be rows the
/// client holds but that have left its scope.
///
/// # Errors
///
/// `SyncError::MissingPayload` if the server must adopt a client record
/// whose payload was not sent, `SyncError::InvalidPayload` if that payload
/// is not a JSON object.
pub fn classify(
    server: Vec<SyncEntry>,
    request: &SyncRequest,
    policy: StalePolicy,
) -> Result<SyncPlan, SyncError> {
    let (server, outside): (BTreeMap<String, SyncEntry>, BTreeMap<String, SyncEntry>) = server
        .into_iter()
        .map(|entry| (entry.record.uid.clone(), entry))
        .partition(|(_, entry)| request.scope.matches(&entry.record.payload));
    let mut plan = SyncPlan::default();

    // server only
    for (uid, entry) in &server {
        if !request.metadata.contains_key(uid) && !entry.metadata.is_deleted() {
            plan.outcome.to_add.push(entry.clone());
        }
    }

    for (uid, client) in &request.metadata {
        match server.get(uid) {
            Some(entry) => classify_both(&mut plan, uid, client, entry, request)?,
            None if outside.contains_key(uid) => plan.outcome.to_delete.push(uid.clone()),
            None => classify_client_only(&mut plan, uid, client, request, policy)?,
        }
    }

    Ok(plan)
}

fn classify_client_only(
    plan: &mut SyncPlan,
    uid: &str,
    client: &SyncMetadata,
    request: &SyncRequest,
    policy: StalePolicy,
) -> Result<(), SyncError> {
    if client.is_deleted() {
        plan.outcome.to_delete.push(uid.to_string());
        return Ok(());
    }
    if client.created_at > request.cutoff {
        return plan.server_create(uid, client, request);
    }

    warn!(
        uid,
        model = %request.scope.model,
        created_at = %client.created_at,
        cutoff = %request.cutoff,
        policy = ?policy,
        "Stale client-only record"
    );
    plan.outcome.stale.push(uid.to_string());
    match policy {
        StalePolicy::Recreate => plan.server_create(uid, client, request),
        StalePolicy::Discard => {
            plan.outcome.to_delete.push(uid.to_string());
            Ok(())
        }
    }
}

fn classify_both(
    plan: &mut SyncPlan,
    uid: &str,
    client: &SyncMetadata,
    server: &SyncEntry,
    request: &SyncRequest,
) -> Result<(), SyncError> {
    if let Some(deleted_at) = client.deleted_at {
        if !server.metadata.is_deleted() {
            plan.ops.push(SyncOp::Delete {
                uid: uid.to_string(),
                deleted_at,
            });
            plan.outcome.deleted.push(uid.to_string());
        }
        plan.outcome.to_delete.push(uid.to_string());
        return Ok(());
    }
    if server.metadata.is_deleted() {
        plan.outcome.to_delete.push(uid.to_string());
        return Ok(());
    }

    let client_at = client.last_modified();
    let server_at = server.metadata.last_modified();
    if client_at > server_at {
        let record = client_record(uid, request)?;
        plan.ops.push(SyncOp::Update {
            record,
            metadata: client.clone(),
        });
        plan.outcome.updated.push(uid.to_string());
    } else if server_at > client_at {
        plan.outcome.to_update.push(server.clone());
    }
    Ok(())
}
