//! Owners and their books
//!
//! An owner possesses rights on one resource. Its books are kept in arenas
//! keyed by local ids, with ordered index sets for the lists:
//!
//! - `held` and `cached`: rights in use and rights idle,
//! - `borrowed` and `sublet`: loans owed upward and lent downward,
//! - `incoming_ground` and `incoming_excited`: waiting and runnable
//!   requests, one queue per priority,
//! - `outgoing_ground` and `outgoing_excited`: requests in flight and
//!   requests with a reply to process.
//!
//! The books balance after every step under the group lock:
//! `join(owned ∪ sublet) == join(borrowed)` and owned rights never meet
//! sublet ones.

use crate::group::{Ctx, Effects};
use crate::incoming::Incoming;
use crate::loan::Loan;
use crate::outgoing::{Outgoing, OutgoingKind};
use crate::pin::Pin;
use crate::remote::Remote;
use crate::resource::Resource;
use indexmap::IndexSet;
use rm_core::{
    join_all, GroupId, IncomingFlags, IncomingId, LoanCookie, LoanId, OutgoingId, OwnerCookie,
    OwnerId, PinId, Policy, ResourceType, Right, RightId, RmError, RmResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Owner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerState {
    /// Created, not yet serving
    Initial,
    /// Being attached to its resource
    Initialising,
    /// Serving local and remote requests
    Active,
    /// Windup started, draining granted and pending requests
    Quiesce,
    /// Returning loans
    Finalising,
    /// Every loan settled
    Final,
    /// Windup could not settle every loan
    Defunct,
}

impl OwnerState {
    /// True for the two windup outcomes
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Defunct)
    }
}

/// A right on one of the owned lists with the pins pointing at it
#[derive(Debug)]
pub(crate) struct OwnedRight<R> {
    pub(crate) value: R,
    pub(crate) pins: IndexSet<PinId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindupPhase {
    Revoke,
    Cancel,
    Settle,
}

#[derive(Debug)]
struct Windup {
    phase: WindupPhase,
    failed: bool,
}

/// Copy of an owner's books
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSnapshot<R> {
    /// Owner state at the time of the snapshot
    pub state: OwnerState,
    /// Rights pinned by granted requests
    pub held: Vec<R>,
    /// Idle rights
    pub cached: Vec<R>,
    /// Loans owed to creditors
    pub borrowed: Vec<(LoanCookie, R)>,
    /// Loans extended to debtors
    pub sublet: Vec<(LoanCookie, R)>,
    /// Incoming requests in the owner's tables
    pub incoming: usize,
    /// Outgoing requests in flight or awaiting processing
    pub outgoing: usize,
}

impl<R: Right> OwnerSnapshot<R> {
    /// Join of the held rights
    pub fn held_join(&self) -> R {
        join_all(self.held.iter())
    }

    /// Join of the cached rights
    pub fn cached_join(&self) -> R {
        join_all(self.cached.iter())
    }

    /// Join of the borrowed loans
    pub fn borrowed_join(&self) -> R {
        join_all(self.borrowed.iter().map(|(_, right)| right))
    }

    /// Join of the sublet loans
    pub fn sublet_join(&self) -> R {
        join_all(self.sublet.iter().map(|(_, right)| right))
    }
}

pub(crate) struct Owner<T: ResourceType> {
    pub(crate) id: OwnerId,
    pub(crate) cookie: OwnerCookie,
    pub(crate) resource: Resource<T>,
    pub(crate) creditor: Option<Arc<Remote>>,
    state: OwnerState,
    state_tx: watch::Sender<OwnerState>,
    next_id: u64,
    windup: Windup,

    pub(crate) rights: HashMap<RightId, OwnedRight<T::Right>>,
    pub(crate) held: IndexSet<RightId>,
    pub(crate) cached: IndexSet<RightId>,

    pub(crate) loans: HashMap<LoanId, Loan<T::Right>>,
    pub(crate) borrowed: IndexSet<LoanId>,
    pub(crate) sublet: IndexSet<LoanId>,

    pub(crate) incoming: HashMap<IncomingId, Incoming<T>>,
    pub(crate) incoming_ground: Vec<IndexSet<IncomingId>>,
    pub(crate) incoming_excited: Vec<IndexSet<IncomingId>>,

    pub(crate) outgoing: HashMap<OutgoingId, Outgoing<T::Right>>,
    pub(crate) outgoing_ground: IndexSet<OutgoingId>,
    pub(crate) outgoing_excited: IndexSet<OutgoingId>,

    pub(crate) pins: HashMap<PinId, Pin>,
}

impl<T: ResourceType> Owner<T> {
    pub(crate) fn new(
        id: OwnerId,
        resource: Resource<T>,
        creditor: Option<Arc<Remote>>,
        max_priority: u8,
    ) -> Self {
        let (state_tx, _) = watch::channel(OwnerState::Initial);
        let queues = usize::from(max_priority) + 1;
        Self {
            id,
            cookie: OwnerCookie::new(),
            resource,
            creditor,
            state: OwnerState::Initial,
            state_tx,
            next_id: 0,
            windup: Windup {
                phase: WindupPhase::Revoke,
                failed: false,
            },
            rights: HashMap::new(),
            held: IndexSet::new(),
            cached: IndexSet::new(),
            loans: HashMap::new(),
            borrowed: IndexSet::new(),
            sublet: IndexSet::new(),
            incoming: HashMap::new(),
            incoming_ground: vec![IndexSet::new(); queues],
            incoming_excited: vec![IndexSet::new(); queues],
            outgoing: HashMap::new(),
            outgoing_ground: IndexSet::new(),
            outgoing_excited: IndexSet::new(),
            pins: HashMap::new(),
        }
    }

    pub(crate) fn state(&self) -> OwnerState {
        self.state
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<OwnerState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn set_state(&mut self, state: OwnerState) {
        debug!(owner = %self.cookie, from = ?self.state, to = ?state, "owner state");
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Walk INITIAL -> INITIALISING -> ACTIVE
    pub(crate) fn activate(&mut self) {
        self.set_state(OwnerState::Initialising);
        self.set_state(OwnerState::Active);
    }

    pub(crate) fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn right_value(&self, id: RightId) -> Option<&T::Right> {
        self.rights.get(&id).map(|entry| &entry.value)
    }

    pub(crate) fn insert_right(&mut self, value: T::Right, held: bool) -> RightId {
        let id = RightId(self.alloc_id());
        self.rights.insert(
            id,
            OwnedRight {
                value,
                pins: IndexSet::new(),
            },
        );
        if held {
            self.held.insert(id);
        } else {
            self.cached.insert(id);
        }
        id
    }

    /// Drop a right from the books, waking whoever pinned it
    pub(crate) fn remove_right(&mut self, id: RightId) -> Option<T::Right> {
        let pins: Vec<PinId> = self.rights.get(&id)?.pins.iter().copied().collect();
        for pin in pins {
            self.del_pin(pin, true);
        }
        self.held.shift_remove(&id);
        self.cached.shift_remove(&id);
        self.rights.remove(&id).map(|entry| entry.value)
    }

    /// Cut `amount` out of the cached rights
    pub(crate) fn carve_out(&mut self, amount: &T::Right) {
        let cached: Vec<RightId> = self.cached.iter().copied().collect();
        for id in cached {
            let Some(value) = self.right_value(id) else {
                continue;
            };
            if !value.intersects(amount) {
                continue;
            }
            let left = value.diff(amount);
            if left.is_empty() {
                self.remove_right(id);
            } else if let Some(entry) = self.rights.get_mut(&id) {
                entry.value = left;
            }
        }
    }

    /// Cut `amount` out of the cached rights and re-insert it as one right
    pub(crate) fn carve(&mut self, amount: &T::Right) -> RightId {
        self.carve_out(amount);
        self.insert_right(amount.clone(), false)
    }

    pub(crate) fn insert_loan(&mut self, loan: Loan<T::Right>, borrowed: bool) -> LoanId {
        let id = LoanId(self.alloc_id());
        self.loans.insert(id, loan);
        if borrowed {
            self.borrowed.insert(id);
        } else {
            self.sublet.insert(id);
        }
        id
    }

    pub(crate) fn remove_loan(&mut self, id: LoanId) -> Option<Loan<T::Right>> {
        self.borrowed.shift_remove(&id);
        self.sublet.shift_remove(&id);
        self.loans.remove(&id)
    }

    pub(crate) fn find_loan(&self, cookie: LoanCookie, borrowed: bool) -> Option<LoanId> {
        let list = if borrowed { &self.borrowed } else { &self.sublet };
        list.iter()
            .copied()
            .find(|id| self.loans.get(id).is_some_and(|loan| loan.cookie == cookie))
    }

    pub(crate) fn owned_join(&self) -> T::Right {
        join_all(self.rights.values().map(|entry| &entry.value))
    }

    /// Join of the sublet loans, or of those lent to one credit group
    pub(crate) fn lent_join(&self, group: Option<GroupId>) -> T::Right {
        join_all(
            self.sublet
                .iter()
                .filter_map(|id| self.loans.get(id))
                .filter(|loan| group.map_or(true, |group| loan.group == group))
                .map(|loan| &loan.right),
        )
    }

    /// Cache a right that came back from a debtor.
    ///
    /// Whatever another group member still borrows stays lent, and nothing
    /// already owned is counted twice.
    pub(crate) fn reclaim(&mut self, right: &T::Right) {
        let fresh = right.diff(&self.owned_join()).diff(&self.lent_join(None));
        if !fresh.is_empty() {
            self.insert_right(fresh, false);
        }
    }

    /// Seed capital that is owed to nobody
    pub(crate) fn self_add(
        &mut self,
        ctx: &Ctx<'_, T>,
        right: T::Right,
        fx: &mut Effects,
    ) -> RmResult<()> {
        if self.state != OwnerState::Active {
            return Err(RmError::shutdown(format!(
                "{} cannot take capital in {:?}",
                self.cookie, self.state
            )));
        }
        ctx.rtype.validate(&right)?;
        if right.intersects(&self.owned_join()) || right.intersects(&self.lent_join(None)) {
            return Err(RmError::invalid("capital overlaps rights already on the books"));
        }
        if right.is_empty() {
            return Ok(());
        }
        let capital = Loan::new(LoanCookie::new(), right.clone(), None, GroupId::NONE);
        self.insert_loan(capital, true);
        self.insert_right(right, false);
        debug!(owner = %self.cookie, "capital added");
        self.excite_waiting();
        self.balance(ctx, fx);
        Ok(())
    }

    /// Queue a waiting request for another check
    pub(crate) fn excite(&mut self, id: IncomingId) {
        let Some(request) = self.incoming.get(&id) else {
            return;
        };
        let priority = usize::from(request.priority);
        if self.incoming_ground[priority].shift_remove(&id) {
            self.incoming_excited[priority].insert(id);
        }
    }

    pub(crate) fn excite_waiting(&mut self) {
        for priority in 0..self.incoming_ground.len() {
            let waiting = std::mem::take(&mut self.incoming_ground[priority]);
            self.incoming_excited[priority].extend(waiting);
        }
    }

    fn next_excited(&mut self) -> Option<IncomingId> {
        self.incoming_excited
            .iter_mut()
            .rev()
            .find_map(|queue| queue.shift_remove_index(0))
    }

    /// Drive the owner until nothing moves.
    ///
    /// Replies are processed first, then runnable requests from the highest
    /// priority down, restarting after each one so a request woken at a
    /// higher priority overtakes the rest. Windup advances when both queues
    /// are quiet.
    pub(crate) fn balance(&mut self, ctx: &Ctx<'_, T>, fx: &mut Effects) {
        loop {
            if let Some(out) = self.outgoing_excited.shift_remove_index(0) {
                self.outgoing_complete(ctx, out);
                continue;
            }
            if let Some(incoming) = self.next_excited() {
                self.check(ctx, incoming, fx);
                continue;
            }
            if self.windup_step(fx) {
                continue;
            }
            break;
        }
        debug_assert!(self.is_balanced(), "{} books out of balance", self.cookie);
    }

    pub(crate) fn is_balanced(&self) -> bool {
        let owned = self.owned_join();
        let loans = |list: &IndexSet<LoanId>| {
            join_all(list.iter().filter_map(|id| self.loans.get(id)).map(|loan| &loan.right))
        };
        let sublet = loans(&self.sublet);
        let borrowed = loans(&self.borrowed);
        owned.join(&sublet) == borrowed && owned.meet(&sublet).is_empty()
    }

    pub(crate) fn books_empty(&self) -> bool {
        self.rights.is_empty() && self.loans.is_empty()
    }

    /// True when the owner may be detached from its group
    pub(crate) fn can_fini(&self) -> bool {
        match self.state {
            OwnerState::Initial | OwnerState::Final | OwnerState::Defunct => true,
            OwnerState::Active => {
                self.books_empty() && self.incoming.is_empty() && self.outgoing.is_empty()
            }
            _ => false,
        }
    }

    pub(crate) fn windup(&mut self, ctx: &Ctx<'_, T>, fx: &mut Effects) -> RmResult<()> {
        match self.state {
            OwnerState::Active => {
                self.set_state(OwnerState::Quiesce);
                self.balance(ctx, fx);
                Ok(())
            }
            OwnerState::Quiesce
            | OwnerState::Finalising
            | OwnerState::Final
            | OwnerState::Defunct => Ok(()),
            OwnerState::Initial | OwnerState::Initialising => Err(RmError::invalid(format!(
                "{} is not active",
                self.cookie
            ))),
        }
    }

    pub(crate) fn mark_windup_failed(&mut self) {
        self.windup.failed = true;
    }

    fn windup_step(&mut self, fx: &mut Effects) -> bool {
        match self.state {
            OwnerState::Quiesce if self.incoming.is_empty() && self.held.is_empty() => {
                self.set_state(OwnerState::Finalising);
                true
            }
            OwnerState::Finalising => self.finalise(fx),
            _ => false,
        }
    }

    fn finalise(&mut self, fx: &mut Effects) -> bool {
        if !self.outgoing.is_empty() || !self.incoming.is_empty() {
            return false;
        }
        match self.windup.phase {
            WindupPhase::Revoke => {
                self.windup.phase = WindupPhase::Cancel;
                let sublet: Vec<LoanId> = self.sublet.iter().copied().collect();
                for loan in sublet {
                    self.issue_windup_revoke(loan, fx);
                }
            }
            WindupPhase::Cancel => {
                self.windup.phase = WindupPhase::Settle;
                if !self.sublet.is_empty() {
                    self.windup.failed = true;
                }
                if !self.windup.failed {
                    let borrowed: Vec<LoanId> = self.borrowed.iter().copied().collect();
                    for loan in borrowed {
                        self.return_loan(loan, fx);
                    }
                }
            }
            WindupPhase::Settle => {
                let outcome = if self.windup.failed || !self.books_empty() {
                    warn!(owner = %self.cookie, "windup left debts unsettled");
                    OwnerState::Defunct
                } else {
                    info!(owner = %self.cookie, "windup settled every loan");
                    OwnerState::Final
                };
                self.set_state(outcome);
                return false;
            }
        }
        true
    }

    fn issue_windup_revoke(&mut self, loan: LoanId, fx: &mut Effects) {
        let Some((right, remote)) = self
            .loans
            .get(&loan)
            .map(|entry| (entry.right.clone(), entry.remote.clone()))
        else {
            return;
        };
        let Some(remote) = remote else {
            return;
        };
        let out = self.new_outgoing(
            OutgoingKind::Revoke { loan },
            remote,
            right,
            IncomingFlags::MAY_REVOKE,
            Policy::default(),
            GroupId::NONE,
        );
        if let Some(request) = self.outgoing.get_mut(&out) {
            request.mark_windup();
        }
        debug!(owner = %self.cookie, %out, "windup revoke issued");
        fx.dispatch(self.id, out);
    }

    /// Give a borrowed loan back: self-loans vanish, others are cancelled
    fn return_loan(&mut self, loan: LoanId, fx: &mut Effects) {
        let Some(entry) = self.remove_loan(loan) else {
            return;
        };
        self.carve_out(&entry.right);
        match entry.remote.clone() {
            None => debug!(owner = %self.cookie, loan = %entry.cookie, "self-loan dropped"),
            Some(remote) => {
                let right = entry.right.clone();
                let out = self.new_outgoing(
                    OutgoingKind::Cancel,
                    remote,
                    right,
                    IncomingFlags::NONE,
                    Policy::default(),
                    entry.group,
                );
                if let Some(request) = self.outgoing.get_mut(&out) {
                    request.mark_windup();
                    request.returned = Some(entry);
                }
                debug!(owner = %self.cookie, %out, "windup cancel issued");
                fx.dispatch(self.id, out);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> OwnerSnapshot<T::Right> {
        let rights = |list: &IndexSet<RightId>| {
            list.iter()
                .filter_map(|id| self.right_value(*id).cloned())
                .collect()
        };
        let loans = |list: &IndexSet<LoanId>| {
            list.iter()
                .filter_map(|id| self.loans.get(id))
                .map(|loan| (loan.cookie, loan.right.clone()))
                .collect()
        };
        OwnerSnapshot {
            state: self.state,
            held: rights(&self.held),
            cached: rights(&self.cached),
            borrowed: loans(&self.borrowed),
            sublet: loans(&self.sublet),
            incoming: self.incoming.len(),
            outgoing: self.outgoing.len(),
        }
    }
}
