//! The set of registered services plus registry-wide ("app") hooks.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::builder::{Service, ServiceBuilder};
use super::hook::{Hook, HookChain};

/// Errors raised while assembling the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("service already registered: {0}")]
    DuplicateService(String),

    /// A hook or publish override names a method the service lacks.
    #[error("service '{service}' has no method '{method}' to attach to")]
    UnknownMethod { service: String, method: String },
}

/// Immutable service registry shared by every transport.
pub struct ServiceRegistry {
    services: HashMap<String, Arc<Service>>,
    before_all: HookChain,
    after_all: HookChain,
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Service>> {
        self.services.get(name)
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn before_all(&self) -> &[Arc<dyn Hook>] {
        &self.before_all
    }

    pub fn after_all(&self) -> &[Arc<dyn Hook>] {
        &self.after_all
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.service_names())
            .finish_non_exhaustive()
    }
}

/// Collects services and app hooks; [`RegistryBuilder::build`] validates
/// and freezes them.
#[derive(Default)]
pub struct RegistryBuilder {
    services: Vec<ServiceBuilder>,
    before_all: Vec<Arc<dyn Hook>>,
    after_all: Vec<Arc<dyn Hook>>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn service(mut self, service: ServiceBuilder) -> Self {
        self.services.push(service);
        self
    }

    /// Hook run before every method of every service.
    #[must_use]
    pub fn before_all(mut self, hook: impl Hook + 'static) -> Self {
        self.before_all.push(Arc::new(hook));
        self
    }

    /// Hook run after every method of every service.
    #[must_use]
    pub fn after_all(mut self, hook: impl Hook + 'static) -> Self {
        self.after_all.push(Arc::new(hook));
        self
    }

    /// # Errors
    ///
    /// - `RegistryError::DuplicateService` if two services share a name
    /// - `RegistryError::UnknownMethod` if a hook targets a missing method
    pub fn build(self) -> Result<Arc<ServiceRegistry>, RegistryError> {
        let mut services = HashMap::with_capacity(self.services.len());

        for builder in self.services {
            let service = builder.build();
            if let Some(method) = service
                .referenced_methods()
                .find(|m| service.method(m).is_none())
            {
                return Err(RegistryError::UnknownMethod {
                    service: service.name().to_string(),
                    method: method.to_string(),
                });
            }
            let name = service.name().to_string();
            if services.contains_key(&name) {
                return Err(RegistryError::DuplicateService(name));
            }
            info!(service = %name, methods = ?service.method_names(), "Service registered");
            services.insert(name, Arc::new(service));
        }

        Ok(Arc::new(ServiceRegistry {
            services,
            before_all: self.before_all.into(),
            after_all: self.after_all.into(),
        }))
    }
}
