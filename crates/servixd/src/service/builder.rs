//! Service definitions: methods, hooks and publish strategy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use servix_core::ServiceResult;

use super::context::Caller;
use super::hook::{Hook, HookChain, Method, Publisher, TypedMethod};

/// A frozen service. Built by [`ServiceBuilder`], never mutated afterwards.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<dyn Method>>,
    before_all: HookChain,
    after_all: HookChain,
    before: HashMap<String, HookChain>,
    after: HashMap<String, HookChain>,
    publisher: Option<Arc<dyn Publisher>>,
    /// `Some(None)` silences a method the service-wide publisher would cover.
    method_publishers: HashMap<String, Option<Arc<dyn Publisher>>>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<dyn Method>> {
        self.methods.get(name)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn before_all(&self) -> &[Arc<dyn Hook>] {
        &self.before_all
    }

    pub fn after_all(&self) -> &[Arc<dyn Hook>] {
        &self.after_all
    }

    pub fn before(&self, method: &str) -> &[Arc<dyn Hook>] {
        self.before.get(method).map(|c| &c[..]).unwrap_or(&[])
    }

    pub fn after(&self, method: &str) -> &[Arc<dyn Hook>] {
        self.after.get(method).map(|c| &c[..]).unwrap_or(&[])
    }

    /// Publish strategy for `method`: its override if any, else the
    /// service-wide one.
    pub fn publisher_for(&self, method: &str) -> Option<&Arc<dyn Publisher>> {
        match self.method_publishers.get(method) {
            Some(specific) => specific.as_ref(),
            None => self.publisher.as_ref(),
        }
    }

    /// Method names referenced by hooks or publish overrides.
    pub(crate) fn referenced_methods(&self) -> impl Iterator<Item = &str> {
        self.before
            .keys()
            .chain(self.after.keys())
            .chain(self.method_publishers.keys())
            .map(String::as_str)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Service`].
///
/// ```ignore
/// let users = ServiceBuilder::new("User")
///     .typed_method("create", |data: (Value,)| async move { Ok(data.0) })
///     .after("create", protect("password"))
///     .publish(StaticChannels::new(["everyone"]));
/// ```
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<dyn Method>>,
    before_all: Vec<Arc<dyn Hook>>,
    after_all: Vec<Arc<dyn Hook>>,
    before: HashMap<String, Vec<Arc<dyn Hook>>>,
    after: HashMap<String, Vec<Arc<dyn Hook>>>,
    publisher: Option<Arc<dyn Publisher>>,
    method_publishers: HashMap<String, Option<Arc<dyn Publisher>>>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
            before_all: Vec::new(),
            after_all: Vec::new(),
            before: HashMap::new(),
            after: HashMap::new(),
            publisher: None,
            method_publishers: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a method implementation. A later registration under the
    /// same name replaces the earlier one.
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, method: impl Method + 'static) -> Self {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Registers `f`, decoding the JSON argument array into `A`.
    #[must_use]
    pub fn typed_method<F, Fut, A, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult<R>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.method(
            name,
            TypedMethod::<_, A, R>::new(move |_caller: Caller, args: A| f(args)),
        )
    }

    /// Like [`typed_method`](Self::typed_method), but `f` also receives
    /// the [`Caller`] for session access.
    #[must_use]
    pub fn caller_method<F, Fut, A, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Caller, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult<R>> + Send + 'static,
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.method(name, TypedMethod::<_, A, R>::new(f))
    }

    /// Hook run before every method of this service.
    #[must_use]
    pub fn before_all(mut self, hook: impl Hook + 'static) -> Self {
        self.before_all.push(Arc::new(hook));
        self
    }

    /// Hook run after every method of this service.
    #[must_use]
    pub fn after_all(mut self, hook: impl Hook + 'static) -> Self {
        self.after_all.push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn before(mut self, method: impl Into<String>, hook: impl Hook + 'static) -> Self {
        self.before.entry(method.into()).or_default().push(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn after(mut self, method: impl Into<String>, hook: impl Hook + 'static) -> Self {
        self.after.entry(method.into()).or_default().push(Arc::new(hook));
        self
    }

    /// Service-wide publish strategy.
    #[must_use]
    pub fn publish(mut self, publisher: impl Publisher + 'static) -> Self {
        self.publisher = Some(Arc::new(publisher));
        self
    }

    /// Publish strategy for one method, overriding the service-wide one.
    #[must_use]
    pub fn publish_method(
        mut self,
        method: impl Into<String>,
        publisher: impl Publisher + 'static,
    ) -> Self {
        self.method_publishers
            .insert(method.into(), Some(Arc::new(publisher)));
        self
    }

    /// Never publish results of `method`.
    #[must_use]
    pub fn silent(mut self, method: impl Into<String>) -> Self {
        self.method_publishers.insert(method.into(), None);
        self
    }

    /// Freezes the definition.
    pub fn build(self) -> Service {
        fn freeze(hooks: Vec<Arc<dyn Hook>>) -> HookChain {
            hooks.into()
        }

        Service {
            name: self.name,
            methods: self.methods,
            before_all: freeze(self.before_all),
            after_all: freeze(self.after_all),
            before: self.before.into_iter().map(|(k, v)| (k, freeze(v))).collect(),
            after: self.after.into_iter().map(|(k, v)| (k, freeze(v))).collect(),
            publisher: self.publisher,
            method_publishers: self.method_publishers,
        }
    }
}
