//! Offline reconciliation engine.
//!
//! One cycle: fetch the server rows in scope plus any other row the client
//! names, classify them against the
//! client's metadata ([`plan::classify`]), commit the server-side mutations
//! as one batch, and return the client's instructions. Cycles are
//! serialized by a single mutex; a failure anywhere leaves the store as it
//! was.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use servix_core::ServiceError;
use servix_protocol::{SyncOutcome, SyncRequest};

pub mod plan;
pub mod store;

pub use plan::{classify, StalePolicy, SyncPlan};
pub use store::{MemoryStore, StoreError, SyncBatch, SyncOp, SyncStore};

/// Reconciliation failures. Any of them aborts the whole cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("sync scope must name a model")]
    EmptyModel,

    /// The server must adopt a record the client sent no payload for.
    #[error("client payload missing for record {0}")]
    MissingPayload(String),

    #[error("client payload for record {0} is not a JSON object")]
    InvalidPayload(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<SyncError> for ServiceError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::EmptyModel | SyncError::MissingPayload(_) | SyncError::InvalidPayload(_) => {
                ServiceError::bad_request(err.to_string())
            }
            SyncError::Store(store) => ServiceError::unknown(store),
        }
    }
}

/// Runs reconciliation cycles against a [`SyncStore`].
pub struct Reconciler {
    store: Arc<dyn SyncStore>,
    policy: StalePolicy,
    cycle: Mutex<()>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn SyncStore>, policy: StalePolicy) -> Self {
        Self {
            store,
            policy,
            cycle: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> StalePolicy {
        self.policy
    }

    /// Runs one read-classify-write cycle.
    ///
    /// # Errors
    ///
    /// See [`SyncError`]. On error nothing was written.
    pub async fn reconcile(&self, request: &SyncRequest) -> Result<SyncOutcome, SyncError> {
        if request.scope.model.is_empty() {
            return Err(SyncError::EmptyModel);
        }

        let _cycle = self.cycle.lock().await;

        let mut rows = self.store.fetch(&request.scope).await?;
        let in_scope: HashSet<&str> = rows.iter().map(|e| e.record.uid.as_str()).collect();
        let unseen: Vec<String> = request
            .metadata
            .keys()
            .filter(|uid| !in_scope.contains(uid.as_str()))
            .cloned()
            .collect();
        if !unseen.is_empty() {
            let outside = self.store.fetch_uids(&request.scope.model, &unseen).await?;
            rows.extend(outside);
        }
        let fetched = rows.len();
        let SyncPlan { outcome, ops } = plan::classify(rows, request, self.policy)?;

        if !ops.is_empty() {
            self.store
                .commit(SyncBatch {
                    model: request.scope.model.clone(),
                    ops,
                })
                .await?;
        }

        if outcome.is_empty() {
            debug!(model = %request.scope.model, fetched, "Sync cycle: already converged");
        } else {
            info!(
                model = %request.scope.model,
                fetched,
                to_add = outcome.to_add.len(),
                to_update = outcome.to_update.len(),
                to_delete = outcome.to_delete.len(),
                stale = outcome.stale.len(),
                created = outcome.created.len(),
                updated = outcome.updated.len(),
                deleted = outcome.deleted.len(),
                "Sync cycle committed"
            );
        }
        Ok(outcome)
    }
}
