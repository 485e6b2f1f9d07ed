//! Resource domain
//!
//! A domain is one address space's view of the resource manager: its
//! endpoint, configuration, transport and the table of registered
//! resource types. Requests arriving from other domains enter through
//! [`ResourceDomain::handle`] and are routed by resource type id.

use crate::resource::{ResourceTypeHandle, TypeInner};
use async_trait::async_trait;
use parking_lot::RwLock;
use rm_core::{
    Endpoint, ResourceType, ResourceTypeId, RmConfig, RmError, RmReply, RmRequest, RmResult,
    RmTransport,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Server side of one registered resource type
#[async_trait]
pub(crate) trait TypeService: Send + Sync {
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn name(&self) -> &str;

    fn is_idle(&self) -> bool;

    async fn serve(self: Arc<Self>, request: RmRequest) -> RmResult<RmReply>;
}

struct DomainInner {
    endpoint: Endpoint,
    config: RmConfig,
    transport: Arc<dyn RmTransport>,
    runtime: Handle,
    types: RwLock<HashMap<ResourceTypeId, Arc<dyn TypeService>>>,
}

/// Registry of resource types served at one endpoint
#[derive(Clone)]
pub struct ResourceDomain {
    inner: Arc<DomainInner>,
}

impl ResourceDomain {
    /// Create a domain on the current tokio runtime
    pub fn new(
        endpoint: impl Into<Endpoint>,
        config: RmConfig,
        transport: Arc<dyn RmTransport>,
    ) -> RmResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|err| RmError::invalid(format!("no tokio runtime: {err}")))?;
        let endpoint = endpoint.into();
        info!(%endpoint, "resource domain created");
        Ok(Self {
            inner: Arc::new(DomainInner {
                endpoint,
                config,
                transport,
                runtime,
                types: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Endpoint other domains reach this one at
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Configuration shared by every resource type
    pub fn config(&self) -> &RmConfig {
        &self.inner.config
    }

    /// Register a resource type; its id must be unused in this domain
    pub fn register_type<T: ResourceType>(&self, rtype: T) -> RmResult<ResourceTypeHandle<T>> {
        let id = rtype.type_id();
        let mut types = self.inner.types.write();
        if let Some(existing) = types.get(&id) {
            return Err(RmError::invalid(format!(
                "{id} already registered as {}",
                existing.name()
            )));
        }
        let inner = Arc::new(TypeInner::new(
            rtype,
            self.inner.config.clone(),
            self.inner.endpoint.clone(),
            Arc::clone(&self.inner.transport),
            self.inner.runtime.clone(),
        ));
        debug!(
            endpoint = %self.inner.endpoint,
            rtype = inner.rtype.name(),
            %id,
            "resource type registered"
        );
        types.insert(id, inner.clone() as Arc<dyn TypeService>);
        Ok(ResourceTypeHandle { inner })
    }

    /// Remove a resource type that no longer has owners
    pub fn deregister_type(&self, id: ResourceTypeId) -> RmResult<()> {
        let mut types = self.inner.types.write();
        let idle = types
            .get(&id)
            .map(|service| service.is_idle())
            .ok_or_else(|| RmError::invalid(format!("{id} is not registered")))?;
        if !idle {
            return Err(RmError::invalid(format!("{id} still has owners")));
        }
        types.remove(&id);
        debug!(endpoint = %self.inner.endpoint, %id, "resource type deregistered");
        Ok(())
    }

    /// Typed handle of a registered resource type
    pub fn resource_type<T: ResourceType>(
        &self,
        id: ResourceTypeId,
    ) -> RmResult<ResourceTypeHandle<T>> {
        let service = self
            .inner
            .types
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RmError::invalid(format!("{id} is not registered")))?;
        let inner = service
            .as_any()
            .downcast::<TypeInner<T>>()
            .map_err(|_| RmError::invalid(format!("{id} is registered with another type")))?;
        Ok(ResourceTypeHandle { inner })
    }

    /// Serve a request from another domain
    pub async fn handle(&self, request: RmRequest) -> RmResult<RmReply> {
        let id = request.resource_type();
        let service = self
            .inner
            .types
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| RmError::protocol(format!("{id} is not served here")))?;
        debug!(
            endpoint = %self.inner.endpoint,
            kind = request.kind(),
            rtype = service.name(),
            "request received"
        );
        service.serve(request).await
    }
}
