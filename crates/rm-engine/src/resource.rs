//! Resource types and resources
//!
//! A registered resource type owns its serialization group and a registry
//! of live resources. Resources are handed out as reference-counted
//! handles; the registry keeps only weak references, so a resource leaves
//! it when the last owner or caller lets go.

use crate::dispatch;
use crate::group::{Ctx, Effect, Effects, GroupState};
use crate::handle::OwnerHandle;
use crate::remote::Remote;
use parking_lot::{Mutex, RwLock};
use rm_core::{
    Endpoint, OwnerCookie, ResourceType, ResourceTypeId, RmConfig, RmError, RmResult, RmTransport,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::debug;

pub(crate) struct TypeInner<T: ResourceType> {
    pub(crate) rtype: T,
    pub(crate) config: RmConfig,
    pub(crate) endpoint: Endpoint,
    pub(crate) transport: Arc<dyn RmTransport>,
    runtime: Handle,
    resources: RwLock<HashMap<T::Id, Weak<ResourceInner<T>>>>,
    group: Mutex<GroupState<T>>,
}

impl<T: ResourceType> TypeInner<T> {
    pub(crate) fn new(
        rtype: T,
        config: RmConfig,
        endpoint: Endpoint,
        transport: Arc<dyn RmTransport>,
        runtime: Handle,
    ) -> Self {
        Self {
            rtype,
            config,
            endpoint,
            transport,
            runtime,
            resources: RwLock::new(HashMap::new()),
            group: Mutex::new(GroupState::default()),
        }
    }

    /// Run `f` under the group lock, then apply the effects it collected
    pub(crate) fn run<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&Ctx<'_, T>, &mut GroupState<T>, &mut Effects) -> R,
    ) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut group = self.group.lock();
            let ctx = Ctx {
                rtype: &self.rtype,
                config: &self.config,
                endpoint: &self.endpoint,
            };
            f(&ctx, &mut group, &mut fx)
        };
        self.apply(fx);
        result
    }

    fn apply(self: &Arc<Self>, fx: Effects) {
        for effect in fx.into_inner() {
            match effect {
                Effect::Complete { ops, id, result } => ops.on_complete(id, &result),
                Effect::Conflict { ops, id } => ops.on_conflict(id),
                Effect::Dispatch { owner, outgoing } => {
                    self.runtime
                        .spawn(dispatch::run(Arc::clone(self), owner, outgoing));
                }
                Effect::Drop(value) => drop(value),
            }
        }
    }

    /// True when no owner of this type is left
    pub(crate) fn is_unowned(&self) -> bool {
        self.group.lock().is_empty()
    }
}

/// Handle to a registered resource type
pub struct ResourceTypeHandle<T: ResourceType> {
    pub(crate) inner: Arc<TypeInner<T>>,
}

impl<T: ResourceType> Clone for ResourceTypeHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ResourceType> fmt::Debug for ResourceTypeHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTypeHandle").field("type_id", &self.type_id()).finish()
    }
}

impl<T: ResourceType> ResourceTypeHandle<T> {
    /// Registered type tag
    pub fn type_id(&self) -> ResourceTypeId {
        self.inner.rtype.type_id()
    }

    /// The resource-type plug-in
    pub fn rtype(&self) -> &T {
        &self.inner.rtype
    }

    /// Look up or create the resource named `id`
    pub fn resource(&self, id: T::Id) -> RmResult<Resource<T>> {
        if let Some(inner) = self.inner.resources.read().get(&id).and_then(Weak::upgrade) {
            return Ok(Resource { inner });
        }
        let encoded = self.inner.rtype.encode_id(&id)?;
        let mut resources = self.inner.resources.write();
        if let Some(inner) = resources.get(&id).and_then(Weak::upgrade) {
            return Ok(Resource { inner });
        }
        let inner = Arc::new(ResourceInner {
            id: id.clone(),
            encoded,
            rtype: Arc::downgrade(&self.inner),
            creditors: Mutex::new(Vec::new()),
            debtors: Mutex::new(Vec::new()),
        });
        resources.insert(id, Arc::downgrade(&inner));
        debug!(rtype = self.inner.rtype.name(), resource = ?inner.id, "resource created");
        Ok(Resource { inner })
    }

    /// Number of live resources of this type
    pub fn resource_count(&self) -> usize {
        self.inner
            .resources
            .read()
            .values()
            .filter(|resource| resource.strong_count() > 0)
            .count()
    }

    /// Create an owner of `resource`, borrowing from `creditor` when set
    pub fn owner(
        &self,
        resource: &Resource<T>,
        creditor: Option<Arc<Remote>>,
    ) -> RmResult<OwnerHandle<T>> {
        if !Weak::ptr_eq(&resource.inner.rtype, &Arc::downgrade(&self.inner)) {
            return Err(RmError::invalid(format!(
                "{:?} belongs to another resource type",
                resource.id()
            )));
        }
        let resource = resource.clone();
        let (id, cookie, state) = self
            .inner
            .run(|ctx, group, _| group.create_owner(ctx, resource, creditor));
        Ok(OwnerHandle::new(Arc::clone(&self.inner), id, cookie, state))
    }
}

pub(crate) struct ResourceInner<T: ResourceType> {
    id: T::Id,
    encoded: Vec<u8>,
    rtype: Weak<TypeInner<T>>,
    creditors: Mutex<Vec<Arc<Remote>>>,
    debtors: Mutex<Vec<Arc<Remote>>>,
}

impl<T: ResourceType> Drop for ResourceInner<T> {
    fn drop(&mut self) {
        let Some(rtype) = self.rtype.upgrade() else {
            return;
        };
        let mut resources = rtype.resources.write();
        if resources
            .get(&self.id)
            .is_some_and(|entry| entry.strong_count() == 0)
        {
            resources.remove(&self.id);
        }
    }
}

/// One resource of a registered type
pub struct Resource<T: ResourceType> {
    inner: Arc<ResourceInner<T>>,
}

impl<T: ResourceType> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ResourceType> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource").field("id", &self.inner.id).finish()
    }
}

impl<T: ResourceType> Resource<T> {
    /// Identity of the resource
    pub fn id(&self) -> &T::Id {
        &self.inner.id
    }

    fn type_id(&self) -> RmResult<ResourceTypeId> {
        self.inner
            .rtype
            .upgrade()
            .map(|rtype| rtype.rtype.type_id())
            .ok_or_else(|| RmError::shutdown("resource type deregistered"))
    }

    /// Remote owner of this resource at `endpoint`, located on first use.
    ///
    /// One creditor remote exists per endpoint; owners sharing it share its
    /// session.
    pub fn remote(&self, endpoint: impl Into<Endpoint>) -> RmResult<Arc<Remote>> {
        let endpoint = endpoint.into();
        let mut creditors = self.inner.creditors.lock();
        if let Some(remote) = creditors.iter().find(|remote| *remote.endpoint() == endpoint) {
            return Ok(Arc::clone(remote));
        }
        let remote = Arc::new(Remote::new(
            endpoint,
            self.type_id()?,
            self.inner.encoded.clone(),
            None,
        ));
        creditors.push(Arc::clone(&remote));
        Ok(remote)
    }

    /// Remote for a debtor that introduced itself with its cookie
    pub(crate) fn debtor_remote(
        &self,
        resource_type: ResourceTypeId,
        endpoint: Endpoint,
        cookie: OwnerCookie,
    ) -> Arc<Remote> {
        let mut debtors = self.inner.debtors.lock();
        if let Some(remote) = debtors
            .iter()
            .find(|remote| remote.cookie() == Some(cookie) && *remote.endpoint() == endpoint)
        {
            return Arc::clone(remote);
        }
        let remote = Arc::new(Remote::new(
            endpoint,
            resource_type,
            self.inner.encoded.clone(),
            Some(cookie),
        ));
        debtors.push(Arc::clone(&remote));
        remote
    }
}
