//! The single entry point every transport calls.
//!
//! # Panic-Free Guarantees
//!
//! A method body that panics is isolated on its own task and reported as
//! `unknown-error`; the dispatcher and the caller's transport carry on.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use servix_core::{ServiceError, ServiceResult};

use crate::channels::ChannelHub;
use crate::service::{run_chain, CallContext, Caller, Method, ServiceRegistry};

/// Longest logged rendering of a result.
const LOG_RESULT_MAX: usize = 300;

/// Renders `value` for logs, cut to [`LOG_RESULT_MAX`] characters.
pub fn truncate_for_log(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() <= LOG_RESULT_MAX {
        rendered
    } else {
        let mut cut: String = rendered.chars().take(LOG_RESULT_MAX).collect();
        cut.push('…');
        cut
    }
}

/// Runs calls through the hook pipeline and publishes their results.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    channels: ChannelHub,
}

impl Dispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, channels: ChannelHub) -> Self {
        Self { registry, channels }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelHub {
        &self.channels
    }

    /// Invokes `service.method` for `caller`.
    ///
    /// 1. before hooks: app, method-specific, service-wide
    /// 2. the method, with the hook-adjusted arguments
    /// 3. after hooks: method-specific, service-wide, app
    /// 4. publish the result to the channels the publish strategy picks
    ///
    /// Any failure stops the pipeline; nothing is published.
    ///
    /// # Errors
    ///
    /// - `missing-service` / `missing-method` before any hook runs
    /// - whatever a hook or the method returns
    /// - `unknown-error` if the method panics
    pub async fn invoke(
        &self,
        caller: Caller,
        service_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> ServiceResult<Value> {
        let service = self
            .registry
            .get(service_name)
            .ok_or_else(|| ServiceError::missing_service(service_name))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| ServiceError::missing_method(service_name, method_name))?
            .clone();

        let ctx = CallContext::new(caller, service_name, method_name, args);

        let ctx = run_chain(self.registry.before_all(), ctx).await?;
        let ctx = run_chain(service.before(method_name), ctx).await?;
        let mut ctx = run_chain(service.before_all(), ctx).await?;

        let value = call_isolated(method, ctx.caller.clone(), ctx.args.clone()).await?;
        ctx.result = Some(value);

        let ctx = run_chain(service.after(method_name), ctx).await?;
        let ctx = run_chain(service.after_all(), ctx).await?;
        let ctx = run_chain(self.registry.after_all(), ctx).await?;

        let result = ctx.result.clone().unwrap_or(Value::Null);

        if let Some(publisher) = service.publisher_for(method_name) {
            let channels = publisher.channels(&result, &ctx).await;
            if !channels.is_empty() {
                self.channels
                    .publish(channels, service_name, method_name, result.clone())
                    .await;
            }
        }

        debug!(
            service = service_name,
            method = method_name,
            result = %truncate_for_log(&result),
            "Call completed"
        );
        Ok(result)
    }

    /// Calls a method directly: no hooks, no publishing.
    ///
    /// For trusted server-side code only.
    pub async fn invoke_raw(
        &self,
        service_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> ServiceResult<Value> {
        let method = self
            .registry
            .get(service_name)
            .ok_or_else(|| ServiceError::missing_service(service_name))?
            .method(method_name)
            .ok_or_else(|| ServiceError::missing_method(service_name, method_name))?
            .clone();
        call_isolated(method, Caller::internal(), args).await
    }
}

/// Runs the method on its own task so a panic becomes an error value.
async fn call_isolated(
    method: Arc<dyn Method>,
    caller: Caller,
    args: Vec<Value>,
) -> ServiceResult<Value> {
    let task = tokio::spawn(async move { method.call(caller, args).await });
    match task.await {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            error!("Method panicked");
            Err(ServiceError::unknown("internal error while executing method"))
        }
        Err(join_err) => {
            warn!(error = %join_err, "Method task cancelled");
            Err(ServiceError::unknown(join_err))
        }
    }
}
