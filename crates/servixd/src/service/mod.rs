//! Services, hooks and the registry that holds them.
//!
//! A call runs through this pipeline (see [`crate::dispatch`]):
//!
//! ```text
//! before:  app ─▶ method-specific ─▶ service-wide
//!                       │
//!                    method
//!                       │
//! after:   method-specific ─▶ service-wide ─▶ app
//!                       │
//!                   publish
//! ```
//!
//! Hook order is fixed when the registry is built.

mod builder;
mod context;
mod hook;
pub mod hooks;
mod registry;

pub use builder::{Service, ServiceBuilder};
pub use context::{CallContext, Caller, ConnectionRef};
pub use hook::{
    decode_args, hook_fn, publish_fn, run_chain, FnHook, FnPublisher, Hook, HookChain, Method,
    Publisher, StaticChannels, TypedMethod,
};
pub use hooks::{authenticated, protect};
pub use registry::{RegistryBuilder, RegistryError, ServiceRegistry};
