// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Transaction labels and the operations bound to them.
//!
//! A request carries a 6-bit label, and the response echoes it back. At most one operation is
//! bound to a label at any time. Labels are handed out round-robin starting after the last one
//! allocated, so that a label that has just been freed isn't immediately reused while a late
//! response might still be on its way.

use crate::node_id::{Generation, NodeId};
use crate::packet::{Label, Rcode};
use crate::LinkError;

use alloc::vec::Vec;
use core::{convert::TryFrom, fmt};

/// Error of an asynchronous transaction.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum TransactionError {
    /// The transaction was issued for a generation that isn't the current one, or the bus was
    /// reset while it was in flight.
    #[display(fmt = "bus reset occurred")]
    BusReset,
    /// All the transaction labels are in use.
    #[display(fmt = "no transaction label available")]
    LabelsExhausted,
    #[display(fmt = "transaction timed out")]
    Timeout,
    /// The responder answered with an error code.
    #[display(fmt = "response error: {}", _0)]
    Response(Rcode),
    #[display(fmt = "{}", _0)]
    Link(LinkError),
    /// The request doesn't make sense, for example a payload larger than the path allows.
    #[display(fmt = "invalid request")]
    InvalidRequest,
}

/// Successful outcome of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Data read, or old value of a lock. Empty for writes.
    pub data: Vec<u8>,
}

impl Response {
    /// Interprets the data as a single big-endian quadlet.
    pub fn quadlet(&self) -> Option<u32> {
        <[u8; 4]>::try_from(&self.data[..]).ok().map(u32::from_be_bytes)
    }
}

/// Way a transaction ended without a response, as reported by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// No response arrived in time. `ack_pending` is true if the responder acknowledged the
    /// request with "pending" before going silent.
    Timeout { ack_pending: bool },
    /// The link dropped the request because the bus reset.
    BusReset,
    /// The request was refused at the acknowledgement level (busy, data error, ...).
    AckError,
    Link(LinkError),
}

impl From<CompletionStatus> for TransactionError {
    fn from(status: CompletionStatus) -> TransactionError {
        match status {
            CompletionStatus::Timeout { .. } | CompletionStatus::AckError => TransactionError::Timeout,
            CompletionStatus::BusReset => TransactionError::BusReset,
            CompletionStatus::Link(err) => TransactionError::Link(err),
        }
    }
}

/// Identifies a transaction in flight, for the link to report its completion. A handle whose
/// generation is stale designates nothing.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    pub label: Label,
    pub generation: Generation,
}

/// Operation bound to a label.
pub struct Slot<H> {
    /// Node the request was sent to. Responses from other nodes are ignored.
    pub destination: NodeId,
    pub generation: Generation,
    pub handler: H,
    /// Second handler, notified in addition to the main one.
    pub alternate: Option<H>,
}

impl<H> fmt::Debug for Slot<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Slot")
            .field("destination", &self.destination)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Fixed pool of transaction labels.
pub struct LabelPool<H> {
    slots: Vec<Option<Slot<H>>>,
    /// Index of the label allocated last.
    last: usize,
    /// Number of consecutive allocation failures, saturating.
    exhaustion: u8,
    /// Highest value `exhaustion` has reached. Failures are only logged when it grows.
    exhaustion_high_water: u8,
}

impl<H> LabelPool<H> {
    pub fn new() -> LabelPool<H> {
        LabelPool {
            slots: (0..Label::COUNT).map(|_| None).collect(),
            last: Label::COUNT - 1,
            exhaustion: 0,
            exhaustion_high_water: 0,
        }
    }

    /// Binds an operation to the first free label after the last one allocated.
    ///
    /// If every label is in use, the handler is given back.
    pub fn allocate(
        &mut self,
        destination: NodeId,
        generation: Generation,
        handler: H,
        alternate: Option<H>,
    ) -> Result<Label, H> {
        let free = (1..=Label::COUNT)
            .map(|n| (self.last + n) % Label::COUNT)
            .find(|idx| self.slots[*idx].is_none());

        let idx = match free {
            Some(idx) => idx,
            None => {
                self.exhaustion = self.exhaustion.saturating_add(1);
                if self.exhaustion > self.exhaustion_high_water {
                    self.exhaustion_high_water = self.exhaustion;
                    log::warn!(
                        "Transaction labels exhausted ({} consecutive failures)",
                        self.exhaustion
                    );
                }
                return Err(handler);
            }
        };

        self.exhaustion = 0;
        self.last = idx;
        self.slots[idx] = Some(Slot {
            destination,
            generation,
            handler,
            alternate,
        });
        Ok(Label::from_index(idx))
    }

    /// Unbinds a label, returning what was bound to it.
    pub fn free(&mut self, label: Label) -> Option<Slot<H>> {
        self.slots[label.index()].take()
    }

    pub fn get(&self, label: Label) -> Option<&Slot<H>> {
        self.slots[label.index()].as_ref()
    }

    /// Returns the slot bound to `label` if the request was sent to `source`.
    pub fn lookup(&self, label: Label, source: NodeId) -> Option<&Slot<H>> {
        self.get(label).filter(|slot| slot.destination == source)
    }

    /// True if `label` is bound to an operation of the given generation.
    pub fn is_current(&self, handle: CommandHandle) -> bool {
        self.get(handle.label)
            .map_or(false, |slot| slot.generation == handle.generation)
    }

    /// Unbinds every operation that doesn't belong to `generation`.
    pub fn drain_stale(&mut self, generation: Generation) -> Vec<(Label, Slot<H>)> {
        self.drain_where(|s| s.generation != generation)
    }

    /// Unbinds every operation.
    pub fn drain_all(&mut self) -> Vec<(Label, Slot<H>)> {
        self.drain_where(|_| true)
    }

    fn drain_where(&mut self, mut filter: impl FnMut(&Slot<H>) -> bool) -> Vec<(Label, Slot<H>)> {
        let mut out = Vec::new();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().map_or(false, |s| filter(s)) {
                if let Some(slot) = slot.take() {
                    out.push((Label::from_index(idx), slot));
                }
            }
        }
        out
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Highest number of consecutive allocation failures seen so far.
    pub fn exhaustion_high_water(&self) -> u8 {
        self.exhaustion_high_water
    }
}

impl<H> Default for LabelPool<H> {
    fn default() -> Self {
        LabelPool::new()
    }
}

impl<H> fmt::Debug for LabelPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LabelPool")
            .field("in_flight", &self.in_flight())
            .field("last", &self.last)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(phy: u16) -> NodeId {
        NodeId::from_raw(0xffc0 | phy)
    }

    #[test]
    fn round_robin() {
        let mut pool = LabelPool::<u32>::new();
        let a = pool.allocate(node(1), Generation(1), 0, None).unwrap();
        let b = pool.allocate(node(1), Generation(1), 1, None).unwrap();
        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 1);
        pool.free(a);
        // The freed label isn't reused before the others.
        let c = pool.allocate(node(1), Generation(1), 2, None).unwrap();
        assert_eq!(c.get(), 2);
    }

    #[test]
    fn labels_are_unique() {
        let mut pool = LabelPool::<usize>::new();
        let mut seen = hashbrown::HashSet::<u8, fnv::FnvBuildHasher>::default();
        for n in 0..Label::COUNT {
            let label = pool.allocate(node(2), Generation(1), n, None).unwrap();
            assert!(seen.insert(label.get()));
        }
        assert_eq!(pool.in_flight(), Label::COUNT);
    }

    #[test]
    fn exhaustion_returns_handler() {
        let mut pool = LabelPool::<usize>::new();
        for n in 0..Label::COUNT {
            pool.allocate(node(2), Generation(1), n, None).unwrap();
        }
        assert_eq!(pool.allocate(node(2), Generation(1), 99, None), Err(99));
        assert_eq!(pool.allocate(node(2), Generation(1), 98, None), Err(98));
        assert_eq!(pool.exhaustion_high_water(), 2);

        let label = Label::new(17).unwrap();
        assert_eq!(pool.free(label).map(|s| s.handler), Some(17));
        assert_eq!(pool.allocate(node(2), Generation(1), 5, None), Ok(label));
    }

    #[test]
    fn lookup_checks_source() {
        let mut pool = LabelPool::<()>::new();
        let label = pool.allocate(node(3), Generation(4), (), None).unwrap();
        assert!(pool.lookup(label, node(3)).is_some());
        assert!(pool.lookup(label, node(4)).is_none());
        assert!(pool.is_current(CommandHandle {
            label,
            generation: Generation(4)
        }));
        assert!(!pool.is_current(CommandHandle {
            label,
            generation: Generation(3)
        }));
    }

    #[test]
    fn drain_stale_generation() {
        let mut pool = LabelPool::<u8>::new();
        pool.allocate(node(1), Generation(1), 1, None).unwrap();
        let current = pool.allocate(node(1), Generation(2), 2, None).unwrap();
        let drained = pool.drain_stale(Generation(2));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].1.handler, 1);
        assert!(pool.get(current).is_some());
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn drain_all_keeps_alternates() {
        let mut pool = LabelPool::<u8>::new();
        pool.allocate(node(1), Generation(2), 1, Some(10)).unwrap();
        pool.allocate(node(2), Generation(2), 2, None).unwrap();
        let drained = pool.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].1.alternate, Some(10));
        assert_eq!(pool.in_flight(), 0);
    }
}
