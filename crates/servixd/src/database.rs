//! CRUD services over the in-memory store.
//!
//! Records written here carry sync metadata, so the reconciliation engine
//! sees exactly what the services mutate.

use std::sync::Arc;

use serde_json::{Map, Value};

use servix_core::{ServiceError, ServiceResult};
use servix_protocol::SyncEntry;

use crate::service::ServiceBuilder;
use crate::sync::{MemoryStore, StoreError};

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ServiceError::custom("not-found", err.to_string()),
            StoreError::AlreadyExists { .. } => ServiceError::custom("conflict", err.to_string()),
            StoreError::InvalidPayload(_) => ServiceError::bad_request(err.to_string()),
        }
    }
}

/// One model of a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    store: Arc<MemoryStore>,
    model: String,
}

impl MemoryCollection {
    pub fn new(store: Arc<MemoryStore>, model: impl Into<String>) -> Self {
        Self {
            store,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn create(&self, data: Value) -> ServiceResult<Value> {
        Ok(payload(self.store.insert(&self.model, data).await?))
    }

    /// Live records matching every field of `query` (an object; `null`
    /// matches everything).
    pub async fn find(&self, query: Option<Value>) -> ServiceResult<Value> {
        let filter = match query {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(ServiceError::bad_request("query must be an object")),
        };
        let rows = self.store.find(&self.model, &filter).await;
        Ok(Value::Array(rows.into_iter().map(payload).collect()))
    }

    pub async fn get(&self, uid: &str) -> ServiceResult<Value> {
        self.store
            .get(&self.model, uid)
            .await
            .map(payload)
            .ok_or_else(|| {
                StoreError::NotFound {
                    model: self.model.clone(),
                    uid: uid.to_string(),
                }
                .into()
            })
    }

    pub async fn update(&self, uid: &str, patch: Value) -> ServiceResult<Value> {
        Ok(payload(self.store.update(&self.model, uid, patch).await?))
    }

    pub async fn remove(&self, uid: &str) -> ServiceResult<Value> {
        Ok(payload(self.store.delete(&self.model, uid).await?))
    }
}

fn payload(entry: SyncEntry) -> Value {
    entry.record.payload
}

/// A service named after the collection's model exposing
/// `create(data)`, `find(query?)`, `get(uid)`, `update(uid, patch)` and
/// `remove(uid)`. Add hooks and a publish strategy on the returned builder.
pub fn database_service(collection: MemoryCollection) -> ServiceBuilder {
    let create = collection.clone();
    let find = collection.clone();
    let get = collection.clone();
    let update = collection.clone();
    let remove = collection.clone();

    ServiceBuilder::new(collection.model())
        .typed_method("create", move |(data,): (Value,)| {
            let c = create.clone();
            async move { c.create(data).await }
        })
        .typed_method("find", move |query: Option<(Value,)>| {
            let c = find.clone();
            async move { c.find(query.map(|(q,)| q)).await }
        })
        .typed_method("get", move |(uid,): (String,)| {
            let c = get.clone();
            async move { c.get(&uid).await }
        })
        .typed_method("update", move |(uid, patch): (String, Value)| {
            let c = update.clone();
            async move { c.update(&uid, patch).await }
        })
        .typed_method("remove", move |(uid,): (String,)| {
            let c = remove.clone();
            async move { c.remove(&uid).await }
        })
}
