//! Demo application served by `servixd start`: `User` and `Post` CRUD
//! services over one [`MemoryStore`], plus an `authenticate` service.
//!
//! Every result is published to `everyone`. Passwords never leave the
//! server, and creating a `Post` requires a logged-in connection.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::info;

use servix_core::{ServiceError, ServiceResult};

use crate::database::{database_service, MemoryCollection};
use crate::rest::{FieldType, RestAdapter, RestRoute};
use crate::service::{
    authenticated, protect, Caller, RegistryError, ServiceBuilder, ServiceRegistry, StaticChannels,
};
use crate::sync::MemoryStore;

/// Channel every demo result is published to
pub const EVERYONE: &str = "everyone";

/// Session key holding the logged-in user
pub const USER_KEY: &str = "user";

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// `authenticate.create({username, password})` logs the connection in;
/// `authenticate.remove()` logs it out.
pub fn authenticate_service(users: MemoryCollection) -> ServiceBuilder {
    ServiceBuilder::new("authenticate")
        .caller_method("create", move |caller: Caller, (credentials,): (Credentials,)| {
            let users = users.clone();
            async move { login(&users, &caller, credentials).await }
        })
        .caller_method("remove", |caller: Caller, _: Option<()>| async move {
            let previous = caller.remove_data(USER_KEY).await?;
            Ok(json!({ "logged_out": previous.is_some() }))
        })
        .silent("create")
        .silent("remove")
}

async fn login(users: &MemoryCollection, caller: &Caller, credentials: Credentials) -> ServiceResult<Value> {
    let mut query = Map::new();
    query.insert("username".into(), Value::String(credentials.username.clone()));
    let found = users.find(Some(Value::Object(query))).await?;

    let user = found
        .as_array()
        .and_then(|rows| rows.first())
        .filter(|user| user.get("password").and_then(Value::as_str) == Some(credentials.password.as_str()))
        .cloned()
        .ok_or_else(|| ServiceError::not_authenticated("Incorrect credentials"))?;

    let mut public = user;
    if let Value::Object(fields) = &mut public {
        fields.remove("password");
    }
    caller.set_data(USER_KEY, public.clone()).await?;
    info!(username = %credentials.username, connection_id = ?caller.connection_id(), "User logged in");
    Ok(json!({ "user": public }))
}

/// The demo services, not yet frozen.
pub fn services(store: Arc<MemoryStore>) -> Vec<ServiceBuilder> {
    let users = MemoryCollection::new(store.clone(), "User");
    let posts = MemoryCollection::new(store, "Post");

    vec![
        database_service(users.clone())
            .after_all(protect("password"))
            .publish(StaticChannels::new([EVERYONE])),
        database_service(posts)
            .before("create", authenticated(USER_KEY))
            .publish(StaticChannels::new([EVERYONE])),
        authenticate_service(users),
    ]
}

/// Builds the demo registry over `store`.
pub fn registry(store: Arc<MemoryStore>) -> Result<Arc<ServiceRegistry>, RegistryError> {
    services(store)
        .into_iter()
        .fold(ServiceRegistry::builder(), |builder, service| builder.service(service))
        .build()
}

/// REST routes for the demo services.
pub fn rest_routes(adapter: RestAdapter) -> RestAdapter {
    adapter
        .route(RestRoute::new(
            "/api/users",
            "User",
            [("username", FieldType::String), ("age", FieldType::Int), ("admin", FieldType::Bool)],
        ))
        .route(RestRoute::new(
            "/api/posts",
            "Post",
            [("title", FieldType::String), ("score", FieldType::Float)],
        ))
}
