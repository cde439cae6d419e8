//! Service registry with async handlers
//!
//! Services are the command surface of the host: `scene.turn_on` activates a
//! scene, `homeassistant.turn_off` switches entities off. Every call is
//! announced on the event bus as a `call_service` event before its handler
//! runs, which is how observers detect activations they did not issue.

use dashmap::DashMap;
use scene_core::events::CallServiceData;
use scene_core::ServiceCall;
use scene_event_bus::EventBus;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Result type for service calls
pub type ServiceResult = Result<(), ServiceError>;

/// Future type for async service handlers
pub type ServiceFuture = Pin<Box<dyn Future<Output = ServiceResult> + Send>>;

/// Service handler function type
pub type ServiceHandler = Arc<dyn Fn(ServiceCall) -> ServiceFuture + Send + Sync>;

/// Errors that can occur when working with services
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service not found: {domain}.{service}")]
    NotFound { domain: String, service: String },

    #[error("service call failed: {0}")]
    CallFailed(String),

    #[error("invalid service data: {0}")]
    InvalidData(String),
}

/// Registered services keyed by `domain.service`
pub struct ServiceRegistry {
    services: DashMap<String, ServiceHandler>,
    event_bus: Arc<EventBus>,
}

impl ServiceRegistry {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            services: DashMap::new(),
            event_bus,
        }
    }

    /// Register (or replace) a service handler
    #[instrument(skip(self, domain, service, handler))]
    pub fn register<F, Fut>(&self, domain: impl Into<String>, service: impl Into<String>, handler: F)
    where
        F: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ServiceResult> + Send + 'static,
    {
        let domain = domain.into();
        let service = service.into();

        debug!(domain = %domain, service = %service, "Registering service");

        let handler: ServiceHandler =
            Arc::new(move |call| Box::pin(handler(call)) as ServiceFuture);
        self.services.insert(format!("{}.{}", domain, service), handler);
    }

    /// Call a service and wait for its handler to finish
    ///
    /// The `call_service` event is fired before the handler runs, and only
    /// for services that exist.
    #[instrument(skip(self, service_data, target))]
    pub async fn call(
        &self,
        domain: &str,
        service: &str,
        service_data: serde_json::Value,
        target: serde_json::Value,
    ) -> ServiceResult {
        let handler = self
            .services
            .get(&format!("{}.{}", domain, service))
            .map(|h| h.clone())
            .ok_or_else(|| {
                warn!(domain = %domain, service = %service, "Service not found");
                ServiceError::NotFound {
                    domain: domain.to_string(),
                    service: service.to_string(),
                }
            })?;

        self.event_bus.fire_typed(CallServiceData {
            domain: domain.to_string(),
            service: service.to_string(),
            service_data: service_data.clone(),
            target: target.clone(),
        });

        debug!(domain = %domain, service = %service, "Calling service");
        handler(ServiceCall::new(domain, service, service_data, target)).await
    }

    pub fn has_service(&self, domain: &str, service: &str) -> bool {
        self.services.contains_key(&format!("{}.{}", domain, service))
    }

    /// Unregister a service, returning whether it existed
    #[instrument(skip(self))]
    pub fn unregister(&self, domain: &str, service: &str) -> bool {
        let removed = self
            .services
            .remove(&format!("{}.{}", domain, service))
            .is_some();

        if removed {
            debug!(domain = %domain, service = %service, "Unregistered service");
        }

        removed
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

/// Thread-safe wrapper for ServiceRegistry
pub type SharedServiceRegistry = Arc<ServiceRegistry>;
