//! Outgoing requests
//!
//! An outgoing request is one BORROW, REVOKE or CANCEL exchange with a
//! remote owner. It waits on `outgoing_ground` while a dispatch task talks
//! to the remote, moves to `outgoing_excited` once the reply (or timeout)
//! is in, and is then folded into the books by the owner balance. Nothing
//! here retries: a failure is handed to the pinned incoming requests.

use crate::group::{Ctx, Effects};
use crate::loan::Loan;
use crate::owner::Owner;
use crate::pin::PinTarget;
use crate::remote::Remote;
use indexmap::IndexSet;
use rm_core::{
    GroupId, IncomingFlags, IncomingId, LoanId, OutgoingId, OwnerCookie, PinFlag, PinId, Policy,
    ResourceType, Right, RmError, RmReply, RmRequest, RmResult,
};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutgoingKind {
    Borrow,
    Revoke { loan: LoanId },
    Cancel,
}

impl OutgoingKind {
    fn name(self) -> &'static str {
        match self {
            Self::Borrow => "borrow",
            Self::Revoke { .. } => "revoke",
            Self::Cancel => "cancel",
        }
    }
}

pub(crate) struct Outgoing<R> {
    pub(crate) kind: OutgoingKind,
    pub(crate) remote: Arc<Remote>,
    pub(crate) right: R,
    flags: IncomingFlags,
    policy: Policy,
    group: GroupId,
    sent: bool,
    windup: bool,
    /// Loan taken off the books by a CANCEL, restored if it fails
    pub(crate) returned: Option<Loan<R>>,
    pub(crate) pins: IndexSet<PinId>,
    result: Option<RmResult<RmReply>>,
}

impl<R> Outgoing<R> {
    pub(crate) fn mark_windup(&mut self) {
        self.windup = true;
    }
}

impl<T: ResourceType> Owner<T> {
    pub(crate) fn new_outgoing(
        &mut self,
        kind: OutgoingKind,
        remote: Arc<Remote>,
        right: T::Right,
        flags: IncomingFlags,
        policy: Policy,
        group: GroupId,
    ) -> OutgoingId {
        let id = OutgoingId(self.alloc_id());
        self.outgoing.insert(
            id,
            Outgoing {
                kind,
                remote,
                right,
                flags,
                policy,
                group,
                sent: false,
                windup: false,
                returned: None,
                pins: IndexSet::new(),
                result: None,
            },
        );
        self.outgoing_ground.insert(id);
        id
    }

    /// Track `part` through outgoing requests of `kind` to `remote`.
    ///
    /// Requests already in flight that intersect `part` are reused when they
    /// borrow for the same group; a new request covers whatever they leave.
    pub(crate) fn go_out(
        &mut self,
        incoming: IncomingId,
        kind: OutgoingKind,
        remote: Arc<Remote>,
        mut part: T::Right,
        flags: IncomingFlags,
        policy: Policy,
        group: GroupId,
        fx: &mut Effects,
    ) -> RmResult<()> {
        let reusable: Vec<(OutgoingId, T::Right)> = self
            .outgoing_ground
            .iter()
            .filter_map(|id| self.outgoing.get(id).map(|out| (*id, out)))
            .filter(|(_, out)| out.kind == kind && out.group == group)
            .filter(|(_, out)| Arc::ptr_eq(&out.remote, &remote))
            .filter(|(_, out)| out.right.intersects(&part))
            .map(|(id, out)| (id, out.right.clone()))
            .collect();
        for (id, right) in reusable {
            if part.is_empty() {
                break;
            }
            self.add_pin(incoming, PinTarget::Outgoing(id), PinFlag::Track)?;
            part = part.diff(&right);
        }
        if part.is_empty() {
            return Ok(());
        }

        let id = self.new_outgoing(kind, remote, part, flags, policy, group);
        self.add_pin(incoming, PinTarget::Outgoing(id), PinFlag::Track)?;
        debug!(
            owner = %self.cookie,
            %incoming,
            outgoing = %id,
            kind = kind.name(),
            "outgoing issued"
        );
        fx.dispatch(self.id, id);
        Ok(())
    }

    /// Remote of an outgoing request that still has to be sent
    pub(crate) fn outgoing_remote(&self, id: OutgoingId) -> Option<Arc<Remote>> {
        self.outgoing
            .get(&id)
            .filter(|out| !out.sent && self.outgoing_ground.contains(&id))
            .map(|out| out.remote.clone())
    }

    /// Build the message for an outgoing request and mark it sent.
    ///
    /// Called once the remote session is up; a request is never built twice.
    pub(crate) fn prepare_send(
        &mut self,
        ctx: &Ctx<'_, T>,
        id: OutgoingId,
        target: OwnerCookie,
    ) -> RmResult<RmRequest> {
        let out = self
            .outgoing
            .get(&id)
            .ok_or_else(|| RmError::invalid(format!("{id} vanished before dispatch")))?;
        if out.sent {
            return Err(RmError::invalid(format!("{id} was already sent")));
        }
        let resource_type = ctx.rtype.type_id();
        let request = match out.kind {
            OutgoingKind::Borrow => RmRequest::Borrow {
                resource_type,
                creditor: target,
                debtor: self.cookie,
                debtor_endpoint: ctx.endpoint.clone(),
                flags: out.flags,
                policy: out.policy,
                group: out.group,
                right: ctx.rtype.encode_right(&out.right)?,
            },
            OutgoingKind::Revoke { loan } => {
                let cookie = self
                    .loans
                    .get(&loan)
                    .map(|entry| entry.cookie)
                    .ok_or_else(|| RmError::protocol(format!("{loan} settled before revoke")))?;
                RmRequest::Revoke {
                    resource_type,
                    debtor: target,
                    loan: cookie,
                    flags: out.flags,
                    right: ctx.rtype.encode_right(&out.right)?,
                }
            }
            OutgoingKind::Cancel => {
                let cookie = out
                    .returned
                    .as_ref()
                    .map(|loan| loan.cookie)
                    .ok_or_else(|| RmError::invalid(format!("{id} cancels nothing")))?;
                RmRequest::Cancel {
                    resource_type,
                    creditor: target,
                    loan: cookie,
                }
            }
        };
        if let Some(out) = self.outgoing.get_mut(&id) {
            out.sent = true;
        }
        Ok(request)
    }

    /// Record the completion of an outgoing request and process it
    pub(crate) fn deliver(
        &mut self,
        ctx: &Ctx<'_, T>,
        id: OutgoingId,
        result: RmResult<RmReply>,
        fx: &mut Effects,
    ) {
        let Some(out) = self.outgoing.get_mut(&id) else {
            return;
        };
        if out.result.is_some() {
            return;
        }
        out.result = Some(result);
        if self.outgoing_ground.shift_remove(&id) {
            self.outgoing_excited.insert(id);
        }
        self.balance(ctx, fx);
    }

    /// Fold a completed outgoing request into the books
    pub(crate) fn outgoing_complete(&mut self, ctx: &Ctx<'_, T>, id: OutgoingId) {
        let Some(mut out) = self.outgoing.remove(&id) else {
            return;
        };
        let result = out
            .result
            .take()
            .unwrap_or_else(|| Err(RmError::protocol(format!("{id} completed without status"))));

        let failure = match (out.kind, result) {
            (OutgoingKind::Borrow, Ok(RmReply::Borrowed { loan, right })) => {
                match ctx.rtype.decode_right(&right) {
                    Ok(value) => {
                        let remote = Some(out.remote.clone());
                        self.insert_loan(Loan::new(loan, value.clone(), remote, out.group), true);
                        self.insert_right(value, false);
                        debug!(owner = %self.cookie, %loan, "right borrowed");
                        None
                    }
                    Err(err) => Some(err),
                }
            }
            (OutgoingKind::Revoke { loan }, Ok(RmReply::Revoked)) => {
                if let Some(entry) = self.loans.get_mut(&loan) {
                    let returned = out.right.meet(&entry.right);
                    if entry.settle(&returned) {
                        self.remove_loan(loan);
                    }
                    self.reclaim(&returned);
                    debug!(owner = %self.cookie, %loan, "sublet right revoked");
                }
                None
            }
            (OutgoingKind::Cancel, Ok(RmReply::Cancelled)) => {
                debug!(owner = %self.cookie, outgoing = %id, "loan cancelled");
                None
            }
            (kind, Ok(reply)) => Some(RmError::protocol(format!(
                "{} answered with {reply:?}",
                kind.name()
            ))),
            (_, Err(err)) => Some(err),
        };

        if let Some(err) = failure {
            warn!(
                owner = %self.cookie,
                outgoing = %id,
                kind = out.kind.name(),
                remote = %out.remote.endpoint(),
                error = %err,
                "outgoing request failed"
            );
            if let Some(loan) = out.returned.take() {
                self.insert_right(loan.right.clone(), false);
                self.insert_loan(loan, true);
            }
            if out.windup {
                self.mark_windup_failed();
            }
            for pin in &out.pins {
                if let Some(incoming) = self.pins.get(pin).map(|pin| pin.incoming) {
                    if let Some(request) = self.incoming.get_mut(&incoming) {
                        request.failure.get_or_insert_with(|| err.clone());
                    }
                }
            }
        }

        for pin_id in out.pins {
            if let Some(pin) = self.pins.remove(&pin_id) {
                if let Some(request) = self.incoming.get_mut(&pin.incoming) {
                    request.pins.shift_remove(&pin_id);
                }
                self.excite(pin.incoming);
            }
        }
    }
}
