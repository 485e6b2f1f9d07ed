//! Caller-facing owner and request handles

use crate::incoming::{IncomingKind, IncomingOps, IncomingState, IncomingStatus, NewIncoming};
use crate::owner::{OwnerSnapshot, OwnerState};
use crate::resource::TypeInner;
use rm_core::{
    GroupId, IncomingFlags, IncomingId, OwnerCookie, OwnerId, Policy, Priority, ResourceType,
    RmError, RmResult,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Flags, policy, priority and credit group of a local request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// How the request may be satisfied
    pub flags: IncomingFlags,
    /// Which right is granted once satisfiable
    pub policy: Policy,
    /// Queue the request waits in, higher first
    pub priority: Priority,
    /// Credit group borrows are made under
    pub group: GroupId,
}

impl RequestOptions {
    /// Default policy and priority with `flags`
    pub fn new(flags: IncomingFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Grant according to `policy`
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Queue ahead of lower priorities while waiting
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Borrow under a credit group shared with other debtors
    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = group;
        self
    }
}

/// An owner of one resource in this domain
pub struct OwnerHandle<T: ResourceType> {
    inner: Arc<TypeInner<T>>,
    id: OwnerId,
    cookie: OwnerCookie,
    state: watch::Receiver<OwnerState>,
}

impl<T: ResourceType> fmt::Debug for OwnerHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerHandle")
            .field("id", &self.id)
            .field("cookie", &self.cookie)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<T: ResourceType> OwnerHandle<T> {
    pub(crate) fn new(
        inner: Arc<TypeInner<T>>,
        id: OwnerId,
        cookie: OwnerCookie,
        state: watch::Receiver<OwnerState>,
    ) -> Self {
        Self {
            inner,
            id,
            cookie,
            state,
        }
    }

    /// Cookie other domains use to address this owner
    pub fn cookie(&self) -> OwnerCookie {
        self.cookie
    }

    /// Last published owner state
    pub fn state(&self) -> OwnerState {
        *self.state.borrow()
    }

    /// Seed capital that is owed to no creditor
    pub fn self_add(&self, right: T::Right) -> RmResult<()> {
        self.inner
            .run(|ctx, group, fx| group.owner_mut(self.id)?.self_add(ctx, right, fx))
    }

    /// Submit a local request for `want`.
    ///
    /// The returned handle observes the request; `ops` is told about
    /// completion and about conflicts with requests waiting on what it
    /// holds.
    pub fn request(
        &self,
        want: T::Right,
        options: RequestOptions,
        ops: Option<Arc<dyn IncomingOps>>,
    ) -> RmResult<IncomingHandle<T>> {
        let (id, status) = self.inner.run(|ctx, group, fx| {
            group.owner_mut(self.id)?.accept(
                ctx,
                NewIncoming {
                    kind: IncomingKind::Local,
                    want,
                    flags: options.flags,
                    policy: options.policy,
                    priority: options.priority,
                    group: options.group,
                    ops,
                    reply: None,
                },
                fx,
            )
        })?;
        Ok(IncomingHandle {
            inner: Arc::clone(&self.inner),
            owner: self.id,
            id,
            status,
        })
    }

    /// Start returning everything this owner borrowed
    pub fn windup(&self) -> RmResult<()> {
        self.inner
            .run(|ctx, group, fx| group.owner_mut(self.id)?.windup(ctx, fx))
    }

    /// Wait until the owner state satisfies `pred`
    pub async fn wait_state(
        &self,
        mut pred: impl FnMut(OwnerState) -> bool,
    ) -> RmResult<OwnerState> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|state| pred(*state))
            .await
            .map(|state| *state);
        reached.map_err(|_| RmError::shutdown(format!("{} was finalised", self.cookie)))
    }

    /// Wait for FINAL or DEFUNCT, bounded by the windup timeout
    pub async fn wait_terminal(&self) -> RmResult<OwnerState> {
        let deadline = self.inner.config.windup_timeout();
        tokio::time::timeout(deadline, self.wait_state(OwnerState::is_terminal))
            .await
            .map_err(|_| {
                RmError::timeout(format!(
                    "{} still in {:?} after {}ms",
                    self.cookie,
                    self.state(),
                    deadline.as_millis()
                ))
            })?
    }

    /// Detach the owner from its group
    pub fn fini(self) -> RmResult<()> {
        self.inner.run(|_, group, fx| {
            let owner = group.remove_owner(self.id)?;
            fx.drop_later(Box::new(owner));
            Ok(())
        })
    }

    /// Copy of the owner's books
    pub fn snapshot(&self) -> RmResult<OwnerSnapshot<T::Right>> {
        self.inner
            .run(|_, group, _| group.owner(self.id).map(|owner| owner.snapshot()))
    }

    #[cfg(test)]
    pub(crate) fn with_owner<R>(&self, f: impl FnOnce(&mut crate::owner::Owner<T>) -> R) -> R {
        self.inner.run(|_, group, _| {
            let owner = group.owner_mut(self.id).expect("owner is registered");
            f(owner)
        })
    }

    /// Check the books balance
    pub fn is_balanced(&self) -> RmResult<bool> {
        self.inner
            .run(|_, group, _| group.owner(self.id).map(|owner| owner.is_balanced()))
    }
}

/// A local request submitted through [`OwnerHandle::request`]
pub struct IncomingHandle<T: ResourceType> {
    inner: Arc<TypeInner<T>>,
    owner: OwnerId,
    id: IncomingId,
    status: watch::Receiver<IncomingStatus>,
}

impl<T: ResourceType> fmt::Debug for IncomingHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingHandle")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<T: ResourceType> IncomingHandle<T> {
    /// Local id of the request
    pub fn id(&self) -> IncomingId {
        self.id
    }

    /// Latest status
    pub fn status(&self) -> IncomingStatus {
        self.status.borrow().clone()
    }

    /// State of the latest status
    pub fn state(&self) -> IncomingState {
        self.status.borrow().state
    }

    /// Wait until the request is granted, failed or released
    pub async fn wait(&self) -> IncomingStatus {
        let mut status = self.status.clone();
        let settled = status
            .wait_for(IncomingStatus::is_settled)
            .await
            .map(|status| status.clone());
        match settled {
            Ok(settled) => settled,
            Err(_) => self.status(),
        }
    }

    /// Give a granted right back; a second release is rejected
    pub fn release(&self) -> RmResult<()> {
        self.inner
            .run(|ctx, group, fx| group.owner_mut(self.owner)?.release(ctx, self.id, fx))
    }

    /// Finish a failed or released request
    pub fn fini(self) -> RmResult<IncomingState> {
        match self.state() {
            IncomingState::Failure | IncomingState::Released => Ok(IncomingState::Final),
            state => Err(RmError::invalid(format!(
                "{} cannot be finished in {state:?}",
                self.id
            ))),
        }
    }
}
