//! Reusable hooks.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use servix_core::{CallerKind, ServiceError, ServiceResult};

use super::context::CallContext;
use super::hook::Hook;

/// Strips `field` from the result (an object, or every object of an array).
///
/// Use as an after hook, e.g. to keep password hashes off the wire.
#[derive(Debug, Clone)]
pub struct Protect {
    field: String,
}

pub fn protect(field: impl Into<String>) -> Protect {
    Protect {
        field: field.into(),
    }
}

#[async_trait]
impl Hook for Protect {
    async fn call(&self, mut ctx: CallContext) -> ServiceResult<CallContext> {
        match ctx.result.as_mut() {
            Some(Value::Object(map)) => {
                map.remove(&self.field);
            }
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Value::Object(map) = item {
                        map.remove(&self.field);
                    }
                }
            }
            _ => {}
        }
        Ok(ctx)
    }
}

/// Service name and action of the push sent when a session is dropped.
pub const RESET_EVENT_NAME: &str = "connection";
pub const RESET_EVENT_ACTION: &str = "reset";

/// Requires the session key `key` to be set on the caller's connection.
///
/// Server-side callers always pass. On failure the connection is reset
/// (session data and channel memberships cleared) and a
/// `service_event { name: "connection", action: "reset" }` is pushed before
/// the call fails with `not-authenticated`.
#[derive(Debug, Clone)]
pub struct Authenticated {
    key: String,
}

pub fn authenticated(key: impl Into<String>) -> Authenticated {
    Authenticated { key: key.into() }
}

#[async_trait]
impl Hook for Authenticated {
    async fn call(&self, ctx: CallContext) -> ServiceResult<CallContext> {
        if ctx.caller_kind() == CallerKind::Server {
            return Ok(ctx);
        }

        let session = ctx.get_data(&self.key).await;
        match session {
            Ok(Some(value)) if !value.is_null() => return Ok(ctx),
            Ok(_) => {}
            Err(err) => debug!(error = %err, "Session lookup failed during authentication"),
        }

        warn!(
            connection_id = ?ctx.connection_id(),
            service = %ctx.service,
            method = %ctx.method,
            "Unauthenticated call rejected"
        );
        if let Err(err) = ctx.reset_connection().await {
            debug!(error = %err, "Connection reset failed");
        }
        if let Err(err) = ctx
            .notify(RESET_EVENT_NAME, RESET_EVENT_ACTION, Value::Null)
            .await
        {
            debug!(error = %err, "Reset notification not delivered");
        }
        Err(ServiceError::not_authenticated(format!(
            "{}.{} requires an authenticated session",
            ctx.service, ctx.method
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::spawn_connections;
    use crate::service::context::{Caller, ConnectionRef};
    use serde_json::json;
    use servix_core::ErrorCode;
    use servix_protocol::ServerMessage;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_protect_object_and_array() {
        let hook = protect("password");

        let mut ctx = CallContext::new(Caller::internal(), "User", "get", vec![]);
        ctx.result = Some(json!({"id": 1, "password": "x"}));
        let ctx = hook.call(ctx).await.unwrap();
        assert_eq!(ctx.result, Some(json!({"id": 1})));

        let mut ctx = CallContext::new(Caller::internal(), "User", "find", vec![]);
        ctx.result = Some(json!([{"id": 1, "password": "x"}, {"id": 2}]));
        let ctx = hook.call(ctx).await.unwrap();
        assert_eq!(ctx.result, Some(json!([{"id": 1}, {"id": 2}])));
    }

    #[tokio::test]
    async fn test_authenticated_passes_with_session_key() {
        let connections = spawn_connections(Duration::from_secs(60));
        let id = connections.create("a", None).await.unwrap();
        connections.set_data(&id, "user", json!({"id": 1})).await.unwrap();

        let caller = Caller::socket(ConnectionRef::new(id, connections));
        let ctx = CallContext::new(caller, "Post", "create", vec![]);
        assert!(authenticated("user").call(ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_authenticated_failure_resets_and_notifies() {
        let connections = spawn_connections(Duration::from_secs(60));
        let (outbox, mut inbox) = mpsc::channel(4);
        let id = connections.create("a", Some(outbox)).await.unwrap();
        connections.join("everyone", &id).await.unwrap();
        connections.set_data(&id, "theme", json!("dark")).await.unwrap();

        let caller = Caller::socket(ConnectionRef::new(id.clone(), connections.clone()));
        let ctx = CallContext::new(caller, "Post", "create", vec![]);
        let err = authenticated("user").call(ctx).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::NotAuthenticated);
        let snapshot = connections.get(&id).await.unwrap();
        assert!(snapshot.data.is_empty());
        assert!(snapshot.channels.is_empty());
        match inbox.try_recv() {
            Ok(ServerMessage::ServiceEvent { name, action, .. }) => {
                assert_eq!(name, "connection");
                assert_eq!(action, "reset");
            }
            other => panic!("Expected reset event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_authenticated_server_caller_passes() {
        let ctx = CallContext::new(Caller::internal(), "Post", "create", vec![]);
        assert!(authenticated("user").call(ctx).await.is_ok());
    }
}
