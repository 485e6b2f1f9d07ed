//! Pin graph
//!
//! Pins link an incoming request to the owned rights and outgoing requests
//! it depends on. Every edge is recorded three times: in the owner's pin
//! table, on the target and on the incoming request, and all three are
//! updated together under the group lock.

use crate::owner::Owner;
use rm_core::{IncomingId, OutgoingId, PinFlag, PinId, ResourceType, RightId, RmError, RmResult};
use tracing::trace;

/// What a pin points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PinTarget {
    Right(RightId),
    Outgoing(OutgoingId),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Pin {
    pub(crate) incoming: IncomingId,
    pub(crate) target: PinTarget,
    pub(crate) flag: PinFlag,
}

impl<T: ResourceType> Owner<T> {
    pub(crate) fn add_pin(
        &mut self,
        incoming: IncomingId,
        target: PinTarget,
        flag: PinFlag,
    ) -> RmResult<PinId> {
        match target {
            PinTarget::Right(right) => {
                let entry = self
                    .rights
                    .get(&right)
                    .ok_or_else(|| RmError::invalid(format!("pin to missing {right}")))?;
                if flag == PinFlag::Protect && self.has_pin_flag(&entry.pins, PinFlag::Barrier) {
                    return Err(RmError::busy(format!("{right} carries a barrier")));
                }
            }
            PinTarget::Outgoing(out) => {
                if !self.outgoing.contains_key(&out) {
                    return Err(RmError::invalid(format!("pin to missing {out}")));
                }
            }
        }
        if !self.incoming.contains_key(&incoming) {
            return Err(RmError::invalid(format!("pin from missing {incoming}")));
        }

        let id = PinId(self.alloc_id());
        self.pins.insert(
            id,
            Pin {
                incoming,
                target,
                flag,
            },
        );
        match target {
            PinTarget::Right(right) => {
                if let Some(entry) = self.rights.get_mut(&right) {
                    entry.pins.insert(id);
                }
            }
            PinTarget::Outgoing(out) => {
                if let Some(request) = self.outgoing.get_mut(&out) {
                    request.pins.insert(id);
                }
            }
        }
        if let Some(request) = self.incoming.get_mut(&incoming) {
            request.pins.insert(id);
        }
        Ok(id)
    }

    /// Remove a pin.
    ///
    /// With `excite` set the pinning request is woken if it is waiting. The
    /// last protecting pin leaving a held right demotes it to cached, which
    /// in turn drops and wakes every request tracking it.
    pub(crate) fn del_pin(&mut self, id: PinId, excite: bool) {
        let Some(pin) = self.pins.remove(&id) else {
            return;
        };
        if let Some(request) = self.incoming.get_mut(&pin.incoming) {
            request.pins.shift_remove(&id);
        }
        match pin.target {
            PinTarget::Outgoing(out) => {
                if let Some(request) = self.outgoing.get_mut(&out) {
                    request.pins.shift_remove(&id);
                }
            }
            PinTarget::Right(right) => {
                let demote = match self.rights.get_mut(&right) {
                    Some(entry) => {
                        entry.pins.shift_remove(&id);
                        pin.flag == PinFlag::Protect
                            && !self.has_pin_flag(&self.rights[&right].pins, PinFlag::Protect)
                    }
                    None => false,
                };
                if demote {
                    self.demote(right);
                }
            }
        }
        if excite {
            self.excite(pin.incoming);
        }
    }

    /// Move a right that lost its last user back to the cache
    fn demote(&mut self, right: RightId) {
        if self.held.shift_remove(&right) {
            self.cached.insert(right);
            trace!(owner = %self.cookie, %right, "right demoted to cached");
        }
        let trackers: Vec<PinId> = self.rights[&right]
            .pins
            .iter()
            .copied()
            .filter(|pin| self.pins[pin].flag == PinFlag::Track)
            .collect();
        for pin in trackers {
            self.del_pin(pin, true);
        }
    }

    fn has_pin_flag<'a>(&self, pins: impl IntoIterator<Item = &'a PinId>, flag: PinFlag) -> bool {
        pins.into_iter()
            .any(|pin| self.pins.get(pin).is_some_and(|pin| pin.flag == flag))
    }

    /// Drop every pin of a request without waking it
    pub(crate) fn unpin_all(&mut self, incoming: IncomingId) {
        let pins: Vec<PinId> = match self.incoming.get(&incoming) {
            Some(request) => request.pins.iter().copied().collect(),
            None => return,
        };
        for pin in pins {
            self.del_pin(pin, false);
        }
    }

    /// Protecting requests of a right
    pub(crate) fn holders(&self, right: RightId) -> Vec<IncomingId> {
        self.rights
            .get(&right)
            .map(|entry| {
                entry
                    .pins
                    .iter()
                    .filter_map(|pin| self.pins.get(pin))
                    .filter(|pin| pin.flag == PinFlag::Protect)
                    .map(|pin| pin.incoming)
                    .collect()
            })
            .unwrap_or_default()
    }
}
