//! Per-type serialization group
//!
//! Every owner of one resource type lives in the same `GroupState`, guarded
//! by one mutex. All book keeping happens inside that lock; anything that
//! must not run under it (caller callbacks, spawning dispatch tasks,
//! dropping owners and with them resource references) is collected as an
//! `Effect` and performed after the lock is released.

use crate::incoming::{IncomingKind, IncomingOps, NewIncoming};
use crate::owner::{Owner, OwnerState};
use crate::remote::Remote;
use crate::resource::Resource;
use rm_core::{
    Endpoint, GroupId, IncomingFlags, IncomingId, LoanCookie, OutgoingId, OwnerCookie, OwnerId,
    Policy, ResourceType, Right, RmConfig, RmError, RmReply, RmResult,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Read-only context handed to every step under the group lock
pub(crate) struct Ctx<'a, T: ResourceType> {
    pub(crate) rtype: &'a T,
    pub(crate) config: &'a RmConfig,
    pub(crate) endpoint: &'a Endpoint,
}

pub(crate) enum Effect {
    Complete {
        ops: Arc<dyn IncomingOps>,
        id: IncomingId,
        result: RmResult<()>,
    },
    Conflict {
        ops: Arc<dyn IncomingOps>,
        id: IncomingId,
    },
    Dispatch {
        owner: OwnerId,
        outgoing: OutgoingId,
    },
    Drop(Box<dyn Any + Send>),
}

/// Work deferred until the group lock is released
#[derive(Default)]
pub(crate) struct Effects(Vec<Effect>);

impl Effects {
    pub(crate) fn complete(
        &mut self,
        ops: Arc<dyn IncomingOps>,
        id: IncomingId,
        result: RmResult<()>,
    ) {
        self.0.push(Effect::Complete { ops, id, result });
    }

    pub(crate) fn conflict(&mut self, ops: Arc<dyn IncomingOps>, id: IncomingId) {
        self.0.push(Effect::Conflict { ops, id });
    }

    pub(crate) fn dispatch(&mut self, owner: OwnerId, outgoing: OutgoingId) {
        self.0.push(Effect::Dispatch { owner, outgoing });
    }

    pub(crate) fn drop_later(&mut self, value: Box<dyn Any + Send>) {
        self.0.push(Effect::Drop(value));
    }

    pub(crate) fn into_inner(self) -> Vec<Effect> {
        self.0
    }
}

pub(crate) struct GroupState<T: ResourceType> {
    owners: HashMap<OwnerId, Owner<T>>,
    cookies: HashMap<OwnerCookie, OwnerId>,
    next_owner: u64,
}

impl<T: ResourceType> Default for GroupState<T> {
    fn default() -> Self {
        Self {
            owners: HashMap::new(),
            cookies: HashMap::new(),
            next_owner: 0,
        }
    }
}

impl<T: ResourceType> GroupState<T> {
    pub(crate) fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub(crate) fn owner(&self, id: OwnerId) -> RmResult<&Owner<T>> {
        self.owners
            .get(&id)
            .ok_or_else(|| RmError::invalid(format!("{id} is finalised")))
    }

    pub(crate) fn owner_mut(&mut self, id: OwnerId) -> RmResult<&mut Owner<T>> {
        self.owners
            .get_mut(&id)
            .ok_or_else(|| RmError::invalid(format!("{id} is finalised")))
    }

    fn by_cookie(&mut self, cookie: OwnerCookie) -> RmResult<&mut Owner<T>> {
        let id = self
            .cookies
            .get(&cookie)
            .copied()
            .ok_or_else(|| RmError::protocol(format!("unknown {cookie}")))?;
        self.owner_mut(id)
    }

    /// Create an owner and walk it to ACTIVE
    pub(crate) fn create_owner(
        &mut self,
        ctx: &Ctx<'_, T>,
        resource: Resource<T>,
        creditor: Option<Arc<Remote>>,
    ) -> (OwnerId, OwnerCookie, watch::Receiver<OwnerState>) {
        self.next_owner += 1;
        let id = OwnerId(self.next_owner);
        let mut owner = Owner::new(id, resource, creditor, ctx.config.max_priority);
        let state = owner.subscribe();
        owner.activate();
        let cookie = owner.cookie;
        self.cookies.insert(cookie, id);
        self.owners.insert(id, owner);
        (id, cookie, state)
    }

    /// Detach an owner; the caller drops it once the lock is released
    pub(crate) fn remove_owner(&mut self, id: OwnerId) -> RmResult<Owner<T>> {
        let owner = self.owner(id)?;
        if !owner.can_fini() {
            return Err(RmError::invalid(format!(
                "{} cannot be finalised in {:?} with books open",
                owner.cookie,
                owner.state()
            )));
        }
        let cookie = owner.cookie;
        self.cookies.remove(&cookie);
        self.owners
            .remove(&id)
            .ok_or_else(|| RmError::invalid(format!("{id} is finalised")))
    }

    pub(crate) fn deliver(
        &mut self,
        ctx: &Ctx<'_, T>,
        owner: OwnerId,
        outgoing: OutgoingId,
        result: RmResult<RmReply>,
        fx: &mut Effects,
    ) {
        match self.owners.get_mut(&owner) {
            Some(owner) => owner.deliver(ctx, outgoing, result, fx),
            None => debug!(%owner, %outgoing, "reply for a finalised owner dropped"),
        }
    }

    /// Admit a BORROW from a debtor
    pub(crate) fn accept_borrow(
        &mut self,
        ctx: &Ctx<'_, T>,
        creditor: OwnerCookie,
        debtor: OwnerCookie,
        debtor_endpoint: Endpoint,
        want: T::Right,
        flags: IncomingFlags,
        policy: Policy,
        group: GroupId,
        fx: &mut Effects,
    ) -> RmResult<oneshot::Receiver<RmResult<RmReply>>> {
        let owner = self.by_cookie(creditor)?;
        let debtor = owner
            .resource
            .debtor_remote(ctx.rtype.type_id(), debtor_endpoint, debtor);
        let (reply, receiver) = oneshot::channel();
        owner.accept(
            ctx,
            NewIncoming {
                kind: IncomingKind::Borrow { debtor },
                want,
                flags,
                policy,
                priority: 0,
                group,
                ops: None,
                reply: Some(reply),
            },
            fx,
        )?;
        Ok(receiver)
    }

    /// Admit a REVOKE from our creditor
    pub(crate) fn accept_revoke(
        &mut self,
        ctx: &Ctx<'_, T>,
        debtor: OwnerCookie,
        loan: LoanCookie,
        want: T::Right,
        flags: IncomingFlags,
        fx: &mut Effects,
    ) -> RmResult<oneshot::Receiver<RmResult<RmReply>>> {
        let owner = self.by_cookie(debtor)?;
        let loan = owner
            .find_loan(loan, true)
            .ok_or_else(|| RmError::protocol(format!("unknown borrowed {loan}")))?;
        let lent = owner.loans.get(&loan).map(|entry| &entry.right);
        if !lent.is_some_and(|lent| want.is_subset(lent)) {
            return Err(RmError::protocol(format!("revoke exceeds {loan}")));
        }
        let (reply, receiver) = oneshot::channel();
        owner.accept(
            ctx,
            NewIncoming {
                kind: IncomingKind::Revoke { loan },
                want,
                flags,
                policy: Policy::Strict,
                priority: 0,
                group: GroupId::NONE,
                ops: None,
                reply: Some(reply),
            },
            fx,
        )?;
        Ok(receiver)
    }

    /// Take a sublet loan back at the debtor's initiative
    pub(crate) fn accept_cancel(
        &mut self,
        ctx: &Ctx<'_, T>,
        creditor: OwnerCookie,
        loan: LoanCookie,
        fx: &mut Effects,
    ) -> RmResult<RmReply> {
        let owner = self.by_cookie(creditor)?;
        let id = owner
            .find_loan(loan, false)
            .ok_or_else(|| RmError::protocol(format!("unknown sublet {loan}")))?;
        if let Some(entry) = owner.remove_loan(id) {
            owner.reclaim(&entry.right);
        }
        debug!(owner = %owner.cookie, %loan, "sublet loan cancelled by debtor");
        // Requests waiting on a revoke of this loan find the right cached now.
        owner.excite_waiting();
        owner.balance(ctx, fx);
        Ok(RmReply::Cancelled)
    }

    /// Cookie of the active owner serving `resource`
    pub(crate) fn locate(&self, resource: &T::Id) -> RmResult<OwnerCookie> {
        self.owners
            .values()
            .filter(|owner| owner.state() == OwnerState::Active)
            .find(|owner| owner.resource.id() == resource)
            .map(|owner| owner.cookie)
            .ok_or_else(|| RmError::protocol(format!("no active owner for {resource:?}")))
    }
}
