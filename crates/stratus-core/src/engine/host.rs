//! ServiceHost: wiring for stores, adapters, services and subscriptions.
//!
//! One host owns the routing table from factory paths to task services.
//! Everything a workflow needs at runtime arrives through the host, which
//! keeps step handlers free of global state and lets tests assemble a
//! host per case.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::counter::CounterSubTaskService;
use crate::domain::{DocumentLink, TaskStatus};
use crate::engine::service::{DynTaskService, TaskService};
use crate::engine::workflow::TaskWorkflow;
use crate::error::EngineError;
use crate::ports::{Clock, DocumentStore, ResourceAdapter, SystemClock};
use crate::subscription::{SubscriptionHook, SubscriptionRegistry};

pub struct ServiceHost {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    adapter: Option<Arc<dyn ResourceAdapter>>,
    services: HashMap<&'static str, Arc<dyn DynTaskService>>,
    subscriptions: SubscriptionRegistry,
}

impl ServiceHost {
    pub fn builder(store: Arc<dyn DocumentStore>) -> ServiceHostBuilder {
        ServiceHostBuilder {
            store,
            clock: Arc::new(SystemClock),
            adapter: None,
            services: HashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn adapter(&self) -> Result<&Arc<dyn ResourceAdapter>, EngineError> {
        self.adapter.as_ref().ok_or(EngineError::NoAdapter)
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    fn service_for(&self, factory: &str) -> Result<&Arc<dyn DynTaskService>, EngineError> {
        self.services
            .get(factory)
            .ok_or_else(|| EngineError::NoService(factory.to_string()))
    }

    /// Create a task under `factory` from a request body. Returns once the
    /// document is persisted; the first step runs asynchronously.
    pub async fn start_task(
        self: &Arc<Self>,
        factory: &str,
        body: Value,
    ) -> Result<DocumentLink, EngineError> {
        self.service_for(factory)?.handle_create(self, body).await
    }

    /// Route a patch to the owning service by the link's factory prefix.
    /// Benign errors (the document is gone, the task moved on) resolve to
    /// `Ok`: late delivery is the normal case, not a fault.
    pub async fn patch(
        self: &Arc<Self>,
        link: &DocumentLink,
        body: Value,
    ) -> Result<(), EngineError> {
        let service = self.service_for(link.factory())?;
        match service.handle_patch(self, link, body).await {
            Err(e) if e.is_benign() => {
                tracing::debug!(link = %link, error = %e, "patch target gone, dropping");
                Ok(())
            }
            other => other,
        }
    }

    /// Fire-and-forget patch, for callbacks and self-patches. Delivery
    /// failures are logged, never propagated.
    pub fn spawn_patch(self: &Arc<Self>, link: DocumentLink, body: Value) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = host.patch(&link, body).await {
                warn!(link = %link, error = %e, "async patch failed");
            }
        });
    }

    pub async fn status(self: &Arc<Self>, link: &DocumentLink) -> Result<TaskStatus, EngineError> {
        self.service_for(link.factory())?.status(self, link).await
    }
}

pub struct ServiceHostBuilder {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    adapter: Option<Arc<dyn ResourceAdapter>>,
    services: HashMap<&'static str, Arc<dyn DynTaskService>>,
    subscriptions: SubscriptionRegistry,
}

impl ServiceHostBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ResourceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn register<W: TaskWorkflow>(mut self, workflow: W) -> Self {
        self.services
            .insert(W::FACTORY, Arc::new(TaskService::new(workflow)));
        self
    }

    /// Register an already-erased service, for infrastructure services
    /// and test doubles that are not `TaskWorkflow`s.
    pub fn register_dyn(mut self, service: Arc<dyn DynTaskService>) -> Self {
        self.services.insert(service.factory(), service);
        self
    }

    pub fn subscribe(
        mut self,
        factory: impl Into<String>,
        sub_stage: impl Into<String>,
        hook: SubscriptionHook,
    ) -> Self {
        self.subscriptions.subscribe(factory, sub_stage, hook);
        self
    }

    pub fn build(mut self) -> Arc<ServiceHost> {
        // The counter is engine infrastructure; every host carries it.
        let counter: Arc<dyn DynTaskService> = Arc::new(CounterSubTaskService);
        self.services.insert(crate::counter::FACTORY, counter);
        Arc::new(ServiceHost {
            store: self.store,
            clock: self.clock,
            adapter: self.adapter,
            services: self.services,
            subscriptions: self.subscriptions,
        })
    }
}
