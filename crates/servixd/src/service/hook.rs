//! Hook, method and publish-strategy traits plus closure adapters.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use servix_core::{ServiceError, ServiceResult};

use super::context::{CallContext, Caller};

/// Frozen, ordered list of hooks.
pub type HookChain = Arc<[Arc<dyn Hook>]>;

// ============================================================================
// Hooks
// ============================================================================

/// A step run before or after a method body.
///
/// Receives the context by value and hands it back, possibly modified.
/// Returning an error stops the pipeline.
#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: CallContext) -> ServiceResult<CallContext>;
}

/// Adapter turning an async closure into a [`Hook`].
pub struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> Hook for FnHook<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = ServiceResult<CallContext>> + Send,
{
    async fn call(&self, ctx: CallContext) -> ServiceResult<CallContext> {
        (self.0)(ctx).await
    }
}

/// Wraps `f` as a hook.
///
/// ```ignore
/// let stamp = hook_fn(|mut ctx| async move {
///     ctx.params.insert("seen".into(), true.into());
///     Ok(ctx)
/// });
/// ```
pub fn hook_fn<F, Fut>(f: F) -> FnHook<F>
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = ServiceResult<CallContext>> + Send,
{
    FnHook(f)
}

/// Runs `chain` in order, stopping at the first error.
pub async fn run_chain(chain: &[Arc<dyn Hook>], mut ctx: CallContext) -> ServiceResult<CallContext> {
    for hook in chain {
        ctx = hook.call(ctx).await?;
    }
    Ok(ctx)
}

// ============================================================================
// Methods
// ============================================================================

/// A service method body.
#[async_trait]
pub trait Method: Send + Sync {
    async fn call(&self, caller: Caller, args: Vec<Value>) -> ServiceResult<Value>;
}

/// Decodes a positional argument array into `A`.
///
/// Tuples decode element-wise (`(String, u32)` from `["a", 1]`); an empty
/// array also decodes as `null`, so `()` and `Option<T>` accept no args.
pub fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> ServiceResult<A> {
    let was_empty = args.is_empty();
    match serde_json::from_value(Value::Array(args)) {
        Ok(decoded) => Ok(decoded),
        Err(err) if was_empty => serde_json::from_value(Value::Null)
            .map_err(|_| ServiceError::bad_request(format!("invalid arguments: {err}"))),
        Err(err) => Err(ServiceError::bad_request(format!("invalid arguments: {err}"))),
    }
}

/// Adapter for `Fn(Caller, A) -> Future<Output = ServiceResult<R>>`.
pub struct TypedMethod<F, A, R> {
    f: F,
    _marker: PhantomData<fn(A) -> R>,
}

impl<F, A, R> TypedMethod<F, A, R> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A, R> Method for TypedMethod<F, A, R>
where
    F: Fn(Caller, A) -> Fut + Send + Sync,
    Fut: Future<Output = ServiceResult<R>> + Send,
    A: DeserializeOwned + Send,
    R: Serialize + Send,
{
    async fn call(&self, caller: Caller, args: Vec<Value>) -> ServiceResult<Value> {
        let decoded: A = decode_args(args)?;
        let output = (self.f)(caller, decoded).await?;
        serde_json::to_value(output).map_err(ServiceError::unknown)
    }
}

// ============================================================================
// Publish strategies
// ============================================================================

/// Chooses the channels a successful call's result is broadcast to.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn channels(&self, result: &Value, ctx: &CallContext) -> Vec<String>;
}

/// Always publishes to the same channels.
#[derive(Debug, Clone)]
pub struct StaticChannels(Vec<String>);

impl StaticChannels {
    pub fn new<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(channels.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl Publisher for StaticChannels {
    async fn channels(&self, _result: &Value, _ctx: &CallContext) -> Vec<String> {
        self.0.clone()
    }
}

/// Adapter for synchronous channel selectors.
pub struct FnPublisher<F>(F);

#[async_trait]
impl<F> Publisher for FnPublisher<F>
where
    F: Fn(&Value, &CallContext) -> Vec<String> + Send + Sync,
{
    async fn channels(&self, result: &Value, ctx: &CallContext) -> Vec<String> {
        (self.0)(result, ctx)
    }
}

pub fn publish_fn<F>(f: F) -> FnPublisher<F>
where
    F: Fn(&Value, &CallContext) -> Vec<String> + Send + Sync,
{
    FnPublisher(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> CallContext {
        CallContext::new(Caller::internal(), "User", "create", vec![])
    }

    #[test]
    fn test_decode_args_tuple() {
        let (name, age): (String, u32) = decode_args(vec![json!("ada"), json!(36)]).unwrap();
        assert_eq!(name, "ada");
        assert_eq!(age, 36);
    }

    #[test]
    fn test_decode_args_empty() {
        let () = decode_args(vec![]).unwrap();
        let none: Option<u32> = decode_args(vec![]).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_decode_args_mismatch_is_bad_request() {
        let err = decode_args::<(u32,)>(vec![json!("not a number")]).unwrap_err();
        assert_eq!(err.code, servix_core::ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let push = |tag: &'static str| {
            hook_fn(move |mut ctx: CallContext| async move {
                let mut order = ctx.params.remove("order").unwrap_or_else(|| json!([]));
                if let Some(list) = order.as_array_mut() {
                    list.push(json!(tag));
                }
                ctx.params.insert("order".into(), order);
                Ok(ctx)
            })
        };
        let chain: Vec<Arc<dyn Hook>> = vec![Arc::new(push("a")), Arc::new(push("b"))];

        let out = run_chain(&chain, ctx()).await.unwrap();
        assert_eq!(out.params["order"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_chain_stops_at_error() {
        let fail = hook_fn(|_ctx: CallContext| async { Err(ServiceError::custom("denied", "no")) });
        let mark = hook_fn(|mut ctx: CallContext| async move {
            ctx.params.insert("ran".into(), json!(true));
            Ok(ctx)
        });
        let chain: Vec<Arc<dyn Hook>> = vec![Arc::new(fail), Arc::new(mark)];

        let err = run_chain(&chain, ctx()).await.unwrap_err();
        assert_eq!(err.code.as_str(), "denied");
    }

    #[tokio::test]
    async fn test_typed_method_encodes_result() {
        let method = TypedMethod::new(|_caller: Caller, (a, b): (i64, i64)| async move {
            Ok::<_, ServiceError>(a + b)
        });
        let out = method.call(Caller::internal(), vec![json!(2), json!(3)]).await.unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_static_channels() {
        let publisher = StaticChannels::new(["everyone"]);
        assert_eq!(publisher.channels(&json!({}), &ctx()).await, vec!["everyone".to_string()]);
    }
}
