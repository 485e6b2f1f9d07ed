//! Incoming requests
//!
//! An incoming request is one party's wish for a right: a local caller, a
//! debtor borrowing from us, or our creditor revoking part of a loan. Each
//! check either grants the request, parks it behind pins (held rights being
//! released, outgoing requests being answered), or fails it. Every pin
//! removal puts the request back in the excited queue, and the next check
//! starts from scratch after dropping the pins of the previous one.

use crate::group::{Ctx, Effects};
use crate::loan::Loan;
use crate::outgoing::OutgoingKind;
use crate::owner::{Owner, OwnerState};
use crate::pin::PinTarget;
use crate::remote::Remote;
use indexmap::IndexSet;
use rm_core::{
    join_all, GroupId, IncomingFlags, IncomingId, LoanCookie, LoanId, PinFlag, PinId, Policy,
    Priority, ResourceType, Right, RightId, RmError, RmReply, RmResult,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// Incoming request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncomingState {
    /// Created, not yet checked
    Initialised,
    /// Being checked
    Check,
    /// Parked behind pins
    Wait,
    /// Granted; the caller must release it
    Success,
    /// Terminally failed
    Failure,
    /// Granted and released
    Released,
    /// Finished by the caller
    Final,
}

/// Observable status of an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingStatus {
    /// Current state
    pub state: IncomingState,
    /// Failure cause once the request failed
    pub error: Option<RmError>,
}

impl IncomingStatus {
    fn new(state: IncomingState) -> Self {
        Self { state, error: None }
    }

    /// Zero for success, negative errno once failed
    pub fn errno(&self) -> i32 {
        self.error.as_ref().map_or(0, RmError::errno)
    }

    /// True once the request stopped moving on its own
    pub fn is_settled(&self) -> bool {
        !matches!(
            self.state,
            IncomingState::Initialised | IncomingState::Check | IncomingState::Wait
        )
    }
}

/// Caller callbacks of a local request.
///
/// Callbacks run after the group lock is released, so they may call back
/// into the engine, releasing a right from `on_conflict` for instance.
pub trait IncomingOps: Send + Sync {
    /// The request reached SUCCESS or FAILURE
    fn on_complete(&self, id: IncomingId, result: &RmResult<()>);

    /// Another request is waiting for a right this request holds
    fn on_conflict(&self, _id: IncomingId) {}
}

#[derive(Clone)]
pub(crate) enum IncomingKind {
    Local,
    Borrow { debtor: Arc<Remote> },
    Revoke { loan: LoanId },
}

impl IncomingKind {
    fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Borrow { .. } => "borrow",
            Self::Revoke { .. } => "revoke",
        }
    }
}

/// Everything needed to admit a request
pub(crate) struct NewIncoming<R> {
    pub(crate) kind: IncomingKind,
    pub(crate) want: R,
    pub(crate) flags: IncomingFlags,
    pub(crate) policy: Policy,
    pub(crate) priority: Priority,
    pub(crate) group: GroupId,
    pub(crate) ops: Option<Arc<dyn IncomingOps>>,
    pub(crate) reply: Option<oneshot::Sender<RmResult<RmReply>>>,
}

pub(crate) struct Incoming<T: ResourceType> {
    kind: IncomingKind,
    want: T::Right,
    flags: IncomingFlags,
    policy: Policy,
    pub(crate) priority: Priority,
    group: GroupId,
    state: IncomingState,
    pub(crate) pins: IndexSet<PinId>,
    rechecks: u32,
    pub(crate) failure: Option<RmError>,
    notified: HashSet<IncomingId>,
    ops: Option<Arc<dyn IncomingOps>>,
    status: watch::Sender<IncomingStatus>,
    reply: Option<oneshot::Sender<RmResult<RmReply>>>,
}

impl<T: ResourceType> Incoming<T> {
    fn set_state(&mut self, state: IncomingState) {
        self.state = state;
        self.status.send_replace(IncomingStatus::new(state));
    }

    fn set_failed(&mut self, err: RmError) {
        self.state = IncomingState::Failure;
        self.status.send_replace(IncomingStatus {
            state: IncomingState::Failure,
            error: Some(err),
        });
    }

    /// A remote request whose requester stopped waiting for the reply
    fn is_abandoned(&self) -> bool {
        self.reply.as_ref().is_some_and(|reply| reply.is_closed())
    }
}

/// Book changes behind the reply to a remote request, undone when the
/// requester is gone and the reply cannot be delivered
pub(crate) enum Undo<R> {
    /// A sublet loan was created
    Lent(LoanId),
    /// `right` left the books and the borrowed `loan`
    Returned {
        loan: LoanId,
        right: R,
        settled: Option<Loan<R>>,
    },
}

/// Rights found to satisfy a request
#[derive(Debug, Default)]
pub(crate) struct Cover {
    shared: Vec<RightId>,
    cached: Vec<RightId>,
}

impl<T: ResourceType> Owner<T> {
    /// Admit a new request and run it as far as it goes
    pub(crate) fn accept(
        &mut self,
        ctx: &Ctx<'_, T>,
        new: NewIncoming<T::Right>,
        fx: &mut Effects,
    ) -> RmResult<(IncomingId, watch::Receiver<IncomingStatus>)> {
        let admitted = match new.kind {
            IncomingKind::Local | IncomingKind::Borrow { .. } => self.state() == OwnerState::Active,
            IncomingKind::Revoke { .. } => matches!(
                self.state(),
                OwnerState::Active | OwnerState::Quiesce | OwnerState::Finalising
            ),
        };
        if !admitted {
            return Err(RmError::shutdown(format!(
                "{} refuses {} requests in {:?}",
                self.cookie,
                new.kind.name(),
                self.state()
            )));
        }
        let priority = usize::from(new.priority);
        if priority >= self.incoming_excited.len() {
            return Err(RmError::invalid(format!(
                "priority {} above {}",
                new.priority,
                self.incoming_excited.len() - 1
            )));
        }
        if self.incoming.len() >= ctx.config.max_incoming_per_owner {
            return Err(RmError::exhausted(format!(
                "{} already tracks {} requests",
                self.cookie,
                self.incoming.len()
            )));
        }

        let id = IncomingId(self.alloc_id());
        let (status, receiver) = watch::channel(IncomingStatus::new(IncomingState::Initialised));
        debug!(
            owner = %self.cookie,
            incoming = %id,
            kind = new.kind.name(),
            flags = %new.flags,
            "incoming request admitted"
        );
        self.incoming.insert(
            id,
            Incoming {
                kind: new.kind,
                want: new.want,
                flags: new.flags,
                policy: new.policy,
                priority: new.priority,
                group: new.group,
                state: IncomingState::Initialised,
                pins: IndexSet::new(),
                rechecks: 0,
                failure: None,
                notified: HashSet::new(),
                ops: new.ops,
                status,
                reply: new.reply,
            },
        );
        self.incoming_excited[priority].insert(id);
        self.balance(ctx, fx);
        Ok((id, receiver))
    }

    pub(crate) fn check(&mut self, ctx: &Ctx<'_, T>, id: IncomingId, fx: &mut Effects) {
        if !self.incoming.contains_key(&id) {
            return;
        }
        self.unpin_all(id);
        match self.evaluate(ctx, id, fx) {
            Ok(Some(cover)) => self.succeed(ctx, id, cover, fx),
            Ok(None) => self.park(id),
            Err(err) => self.fail(id, err, fx),
        }
    }

    /// One CHECK pass: `Some` when the request can be granted now, `None`
    /// when it has to wait for pins.
    fn evaluate(
        &mut self,
        ctx: &Ctx<'_, T>,
        id: IncomingId,
        fx: &mut Effects,
    ) -> RmResult<Option<Cover>> {
        let (want, flags, policy, kind, group) = {
            let request = self
                .incoming
                .get_mut(&id)
                .ok_or_else(|| RmError::invalid(format!("{id} vanished")))?;
            if request.is_abandoned() {
                return Err(RmError::timeout(format!("requester of {id} stopped waiting")));
            }
            request.set_state(IncomingState::Check);
            request.rechecks += 1;
            if let Some(err) = request.failure.take() {
                return Err(err);
            }
            if request.rechecks > ctx.config.max_rechecks {
                return Err(RmError::live_lock(format!(
                    "{id} checked {} times",
                    request.rechecks - 1
                )));
            }
            (
                request.want.clone(),
                request.flags,
                request.policy,
                request.kind.clone(),
                request.group,
            )
        };
        if want.is_empty() {
            return Ok(Some(Cover::default()));
        }
        ctx.rtype.validate(&want)?;

        let local = kind.is_local();
        let mut rest = want.clone();
        let mut cover = Cover::default();
        let mut tracked = Vec::new();
        for &right in &self.held {
            let Some(value) = self.right_value(right) else {
                continue;
            };
            if !value.intersects(&rest) {
                continue;
            }
            // Nothing in use may leave the owner, shared or not.
            let conflict = !local || value.conflicts(&want);
            if conflict && flags.contains(IncomingFlags::LOCAL_TRY) {
                return Err(RmError::busy(format!("{right} is held")));
            }
            if conflict && (!local || flags.contains(IncomingFlags::LOCAL_WAIT)) {
                tracked.push(right);
            } else {
                cover.shared.push(right);
            }
            rest = rest.diff(value);
        }
        for &right in &tracked {
            self.add_pin(id, PinTarget::Right(right), PinFlag::Track)?;
            self.notify_holders(id, right, fx);
        }

        for &right in &self.cached {
            let Some(value) = self.right_value(right) else {
                continue;
            };
            if value.intersects(&rest) {
                cover.cached.push(right);
                rest = rest.diff(value);
            }
        }

        let mut wait = !tracked.is_empty();
        if !rest.is_empty() {
            wait |= self.fetch(id, rest, &kind, flags, policy, group, fx)?;
        }
        Ok(if wait { None } else { Some(cover) })
    }

    /// Ask other owners for the part of a request not found locally.
    ///
    /// Returns true when at least one outgoing request now pins the
    /// incoming one.
    fn fetch(
        &mut self,
        id: IncomingId,
        mut rest: T::Right,
        kind: &IncomingKind,
        flags: IncomingFlags,
        policy: Policy,
        group: GroupId,
        fx: &mut Effects,
    ) -> RmResult<bool> {
        let may_borrow = flags.contains(IncomingFlags::MAY_BORROW)
            && !matches!(kind, IncomingKind::Revoke { .. });
        if matches!(kind, IncomingKind::Borrow { .. }) && !group.is_none() {
            // Lent to the borrower's group already: lend it again.
            rest = rest.diff(&self.lent_join(Some(group)));
            if rest.is_empty() {
                return Ok(false);
            }
        }

        // Group loans lend the same right more than once; revoke every copy.
        let wanted = rest.clone();
        let mut issued = false;
        let sublet: Vec<(LoanId, T::Right, Option<Arc<Remote>>)> = self
            .sublet
            .iter()
            .filter_map(|loan| {
                self.loans
                    .get(loan)
                    .map(|entry| (*loan, entry.right.clone(), entry.remote.clone()))
            })
            .collect();
        for (loan, lent, remote) in sublet {
            if !lent.intersects(&wanted) {
                continue;
            }
            if !flags.contains(IncomingFlags::MAY_REVOKE) {
                return Err(RmError::remote(format!(
                    "{id} wants a right sublet under {loan}"
                )));
            }
            let Some(remote) = remote else {
                continue;
            };
            let part = wanted.meet(&lent);
            self.go_out(
                id,
                OutgoingKind::Revoke { loan },
                remote,
                part,
                flags.without(IncomingFlags::MAY_BORROW),
                policy,
                GroupId::NONE,
                fx,
            )?;
            rest = rest.diff(&lent);
            issued = true;
        }

        if !rest.is_empty() && may_borrow {
            if let Some(creditor) = self.creditor.clone() {
                self.go_out(id, OutgoingKind::Borrow, creditor, rest, flags, policy, group, fx)?;
                return Ok(true);
            }
        }
        if !rest.is_empty() {
            return Err(RmError::remote(format!(
                "{id} wants rights {} does not possess",
                self.cookie
            )));
        }
        Ok(issued)
    }

    fn notify_holders(&mut self, id: IncomingId, right: RightId, fx: &mut Effects) {
        for holder in self.holders(right) {
            let first = self
                .incoming
                .get_mut(&id)
                .is_some_and(|request| request.notified.insert(holder));
            if !first {
                continue;
            }
            if let Some(ops) = self.incoming.get(&holder).and_then(|h| h.ops.clone()) {
                debug!(owner = %self.cookie, incoming = %id, %holder, "conflict with holder");
                fx.conflict(ops, holder);
            }
        }
    }

    fn park(&mut self, id: IncomingId) {
        if let Some(request) = self.incoming.get_mut(&id) {
            request.set_state(IncomingState::Wait);
            let priority = usize::from(request.priority);
            self.incoming_ground[priority].insert(id);
        }
    }

    fn succeed(&mut self, ctx: &Ctx<'_, T>, id: IncomingId, cover: Cover, fx: &mut Effects) {
        let Some((kind, want, policy, group)) = self.incoming.get(&id).map(|request| {
            (
                request.kind.clone(),
                request.want.clone(),
                request.policy,
                request.group,
            )
        }) else {
            return;
        };
        let granted = match kind {
            IncomingKind::Local => self.grant_local(ctx, id, &want, policy, &cover).map(|()| None),
            IncomingKind::Borrow { debtor } => self
                .grant_loan(ctx, &want, policy, group, &cover, debtor)
                .map(|(reply, loan)| Some((reply, Undo::Lent(loan)))),
            IncomingKind::Revoke { loan } => self.return_revoked(&want, loan).map(|settled| {
                let undo = Undo::Returned {
                    loan,
                    right: want.clone(),
                    settled,
                };
                Some((RmReply::Revoked, undo))
            }),
        };
        let reply = match granted {
            Ok(reply) => reply,
            Err(err) => return self.fail(id, err, fx),
        };

        match reply {
            None => {
                if let Some(request) = self.incoming.get_mut(&id) {
                    request.set_state(IncomingState::Success);
                    debug!(owner = %self.cookie, incoming = %id, "incoming granted");
                    if let Some(ops) = request.ops.clone() {
                        fx.complete(ops, id, Ok(()));
                    }
                }
            }
            Some((reply, undo)) => {
                // Remote requests finish as soon as the reply is out.
                let Some(mut request) = self.incoming.remove(&id) else {
                    return;
                };
                let delivered = match request.reply.take() {
                    Some(sender) => sender.send(Ok(reply)).is_ok(),
                    None => true,
                };
                if delivered {
                    request.set_state(IncomingState::Success);
                    debug!(
                        owner = %self.cookie,
                        incoming = %id,
                        kind = request.kind.name(),
                        "remote request served"
                    );
                } else {
                    warn!(
                        owner = %self.cookie,
                        incoming = %id,
                        kind = request.kind.name(),
                        "requester gone before the reply, grant undone"
                    );
                    self.undo_grant(undo);
                    request.set_failed(RmError::timeout(format!(
                        "requester of {id} stopped waiting"
                    )));
                }
            }
        }
    }

    /// Put the books back as they were before a remote grant
    pub(crate) fn undo_grant(&mut self, undo: Undo<T::Right>) {
        match undo {
            Undo::Lent(loan) => {
                if let Some(entry) = self.remove_loan(loan) {
                    self.reclaim(&entry.right);
                }
            }
            Undo::Returned {
                loan,
                right,
                settled,
            } => {
                if let Some(entry) = settled {
                    self.loans.insert(loan, entry);
                    self.borrowed.insert(loan);
                }
                if let Some(entry) = self.loans.get_mut(&loan) {
                    entry.right = entry.right.join(&right);
                }
                self.insert_right(right, false);
            }
        }
        self.excite_waiting();
    }

    /// Right picked by the request's policy, `None` to pin the cover in place
    fn policy_grant(
        &self,
        ctx: &Ctx<'_, T>,
        want: &T::Right,
        policy: Policy,
        cover: &Cover,
    ) -> RmResult<Option<T::Right>> {
        let values = |ids: &[RightId]| join_all(ids.iter().filter_map(|id| self.right_value(*id)));
        let need = want.diff(&values(&cover.shared));
        let covering = values(&cover.cached);
        let grant = match policy {
            Policy::Inplace => return Ok(None),
            Policy::Strict => need,
            Policy::Join => covering,
            Policy::Max => self.available().join(&covering),
            Policy::Custom(code) => {
                let available = self.available();
                let grant = ctx.rtype.apply_policy(code, &need, &available)?;
                if !need.is_subset(&grant) || !grant.is_subset(&available) {
                    return Err(RmError::invalid(format!(
                        "custom policy {code} granted outside the cached rights"
                    )));
                }
                grant
            }
        };
        Ok(Some(grant))
    }

    /// Join of the cached rights not conflicting with any held one
    fn available(&self) -> T::Right {
        let held: Vec<&T::Right> = self
            .held
            .iter()
            .filter_map(|id| self.right_value(*id))
            .collect();
        join_all(
            self.cached
                .iter()
                .filter_map(|id| self.right_value(*id))
                .filter(|value| !held.iter().any(|h| h.conflicts(value))),
        )
    }

    fn grant_local(
        &mut self,
        ctx: &Ctx<'_, T>,
        id: IncomingId,
        want: &T::Right,
        policy: Policy,
        cover: &Cover,
    ) -> RmResult<()> {
        let granted: Vec<RightId> = match self.policy_grant(ctx, want, policy, cover)? {
            None => cover.shared.iter().chain(&cover.cached).copied().collect(),
            Some(grant) if grant.is_empty() => cover.shared.clone(),
            Some(grant) => {
                let mut granted = cover.shared.clone();
                granted.push(self.carve(&grant));
                granted
            }
        };
        for right in granted {
            self.add_pin(id, PinTarget::Right(right), PinFlag::Protect)?;
            if self.cached.shift_remove(&right) {
                self.held.insert(right);
            }
        }
        Ok(())
    }

    fn grant_loan(
        &mut self,
        ctx: &Ctx<'_, T>,
        want: &T::Right,
        policy: Policy,
        group: GroupId,
        cover: &Cover,
        debtor: Arc<Remote>,
    ) -> RmResult<(RmReply, LoanId)> {
        // Lending always moves a right out; there is nothing to pin in place.
        let policy = match policy {
            Policy::Inplace => Policy::Strict,
            other => other,
        };
        let shared = if group.is_none() {
            T::Right::empty()
        } else {
            want.meet(&self.lent_join(Some(group)))
        };
        let own = want.diff(&shared);
        let grant = self
            .policy_grant(ctx, &own, policy, cover)?
            .unwrap_or_else(|| own.clone())
            .join(&shared);
        let encoded = ctx.rtype.encode_right(&grant)?;
        self.carve_out(&grant);
        let loan = Loan::new(LoanCookie::new(), grant, Some(debtor), group);
        let cookie = loan.cookie;
        let id = self.insert_loan(loan, false);
        debug!(owner = %self.cookie, loan = %cookie, %group, "right sublet");
        let reply = RmReply::Borrowed {
            loan: cookie,
            right: encoded,
        };
        Ok((reply, id))
    }

    /// Take `want` off the books and out of `loan`; the loan comes back
    /// when this settled it
    pub(crate) fn return_revoked(
        &mut self,
        want: &T::Right,
        loan: LoanId,
    ) -> RmResult<Option<Loan<T::Right>>> {
        if !self.borrowed.contains(&loan) {
            return Err(RmError::protocol(format!("{loan} is no longer borrowed")));
        }
        self.carve_out(want);
        let settled = self
            .loans
            .get_mut(&loan)
            .is_some_and(|entry| entry.settle(want));
        debug!(owner = %self.cookie, %loan, "right returned to creditor");
        Ok(if settled { self.remove_loan(loan) } else { None })
    }

    pub(crate) fn fail(&mut self, id: IncomingId, err: RmError, fx: &mut Effects) {
        self.unpin_all(id);
        let Some(mut request) = self.incoming.remove(&id) else {
            return;
        };
        let priority = usize::from(request.priority);
        self.incoming_ground[priority].shift_remove(&id);
        self.incoming_excited[priority].shift_remove(&id);
        debug!(
            owner = %self.cookie,
            incoming = %id,
            kind = request.kind.name(),
            error = %err,
            "incoming failed"
        );
        request.set_failed(err.clone());
        if let Some(sender) = request.reply.take() {
            let _ = sender.send(Err(err.clone()));
        }
        if let Some(ops) = request.ops.clone() {
            fx.complete(ops, id, Err(err));
        }
    }

    /// Release a granted local request
    pub(crate) fn release(
        &mut self,
        ctx: &Ctx<'_, T>,
        id: IncomingId,
        fx: &mut Effects,
    ) -> RmResult<()> {
        let granted = self.incoming.get(&id).is_some_and(|request| {
            request.kind.is_local() && request.state == IncomingState::Success
        });
        if !granted {
            return Err(RmError::invalid(format!("{id} is not a granted request")));
        }
        let pins: Vec<PinId> = self
            .incoming
            .get(&id)
            .map(|request| request.pins.iter().copied().collect())
            .unwrap_or_default();
        for pin in pins {
            self.del_pin(pin, true);
        }
        if let Some(mut request) = self.incoming.remove(&id) {
            request.set_state(IncomingState::Released);
        }
        debug!(owner = %self.cookie, incoming = %id, "incoming released");
        self.balance(ctx, fx);
        Ok(())
    }
}
