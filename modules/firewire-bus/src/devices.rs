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

//! Manages the state of the collection of devices seen on the bus.
//!
//! # Overview
//!
//! Every node of the bus has a physical ID, which is only valid for the duration of a
//! generation. After each bus reset, nodes can get a different physical ID, appear, or vanish.
//! What identifies a device across resets is its GUID, found in its bus-info block.
//!
//! Once the bus has been scanned, each node whose GUID could be read is reconciled with the
//! known devices: an existing device with the same GUID is updated in place, otherwise a new
//! device is created. New devices stay *busy* until the registry has finished reading their
//! Configuration ROM directory.
//!
//! Devices that weren't found during a scan are *suspended*. They are terminated when the bus
//! settles (the prune phase), unless they are still busy, and in any case once they have been
//! missing for longer than a fixed ceiling.
//!
//! The records own nothing but bookkeeping. The device objects themselves belong to the
//! [`DeviceRegistry`](crate::DeviceRegistry). The per-node table only holds non-owning
//! references that are cleared whenever the corresponding record goes away.

use crate::csr::BusInfoBlock;
use crate::node_id::{Generation, Guid, NodeId, PhyId};
use crate::registry::DeviceId;
use crate::self_id::NODE_SLOTS;

use alloc::vec::Vec;
use core::time::Duration;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use slab::Slab;

/// Manages the state of the collection of devices seen on the bus.
#[derive(Debug)]
pub struct Devices {
    /// List of devices. Indices are the [`DeviceId`]s.
    records: Slab<DeviceRecord>,
    /// Index of `records` by GUID.
    by_guid: HashMap<Guid, DeviceId, FnvBuildHasher>,
    /// Device found at each physical ID during the current generation.
    nodes: Vec<Option<DeviceId>>,
}

/// Bookkeeping about a single device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub guid: Guid,
    /// Node ID the device was last seen at. `None` while suspended.
    pub node_id: Option<NodeId>,
    /// Last generation in which the device was found by a scan.
    pub generation: Generation,
    pub bus_info: BusInfoBlock,
    /// The registry is still reading the device's ROM directory.
    pub busy: bool,
    /// Time at which the device was found missing. `None` if present.
    pub missing_since: Option<Duration>,
}

impl DeviceRecord {
    pub fn is_suspended(&self) -> bool {
        self.missing_since.is_some()
    }
}

/// Outcome of [`Devices::reconcile`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A device with this GUID already existed and now points to the new node.
    Updated(DeviceId),
    /// A new device has been created.
    Created(DeviceId),
}

impl Devices {
    pub fn new() -> Self {
        Devices {
            records: Slab::with_capacity(16),
            by_guid: HashMap::with_capacity_and_hasher(16, Default::default()),
            nodes: (0..NODE_SLOTS).map(|_| None).collect(),
        }
    }

    /// Forgets which device sits at which physical ID. Must be called on every bus reset.
    pub fn begin_generation(&mut self) {
        for entry in &mut self.nodes {
            *entry = None;
        }
    }

    /// Binds a scanned node to its device, creating the device if needed.
    pub fn reconcile(
        &mut self,
        guid: Guid,
        node_id: NodeId,
        generation: Generation,
        bus_info: &BusInfoBlock,
    ) -> Reconciled {
        let outcome = if let Some(id) = self.by_guid.get(&guid).copied() {
            let record = &mut self.records[id.0];
            record.node_id = Some(node_id);
            record.generation = generation;
            record.bus_info = bus_info.clone();
            record.missing_since = None;
            Reconciled::Updated(id)
        } else {
            let id = DeviceId(self.records.insert(DeviceRecord {
                guid,
                node_id: Some(node_id),
                generation,
                bus_info: bus_info.clone(),
                busy: true,
                missing_since: None,
            }));
            self.by_guid.insert(guid, id);
            Reconciled::Created(id)
        };

        let id = match outcome {
            Reconciled::Updated(id) | Reconciled::Created(id) => id,
        };
        if let Some(entry) = self.nodes.get_mut(node_id.phy_id().index()) {
            *entry = Some(id);
        }
        outcome
    }

    /// Suspends every present device that wasn't found during `generation`. Returns the devices
    /// that got suspended.
    pub fn suspend_missing(&mut self, generation: Generation, now: Duration) -> Vec<DeviceId> {
        let mut out = Vec::new();
        for (idx, record) in self.records.iter_mut() {
            if record.generation != generation && record.missing_since.is_none() {
                record.missing_since = Some(now);
                record.node_id = None;
                out.push(DeviceId(idx));
            }
        }
        out
    }

    /// Removes the suspended devices, except the busy ones that haven't reached the missing
    /// ceiling yet. Returns the removed devices.
    pub fn prune(&mut self, now: Duration, ceiling: Duration) -> Vec<DeviceId> {
        self.remove_where(|record| match record.missing_since {
            Some(since) => !record.busy || now.saturating_sub(since) >= ceiling,
            None => false,
        })
    }

    /// Removes the devices that have been missing for at least `ceiling`.
    pub fn expire(&mut self, now: Duration, ceiling: Duration) -> Vec<DeviceId> {
        self.remove_where(|record| {
            record
                .missing_since
                .map_or(false, |since| now.saturating_sub(since) >= ceiling)
        })
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&DeviceRecord) -> bool) -> Vec<DeviceId> {
        let removed: Vec<DeviceId> = self
            .records
            .iter()
            .filter(|(_, r)| pred(r))
            .map(|(idx, _)| DeviceId(idx))
            .collect();

        for id in &removed {
            let record = self.records.remove(id.0);
            self.by_guid.remove(&record.guid);
            for entry in &mut self.nodes {
                if *entry == Some(*id) {
                    *entry = None;
                }
            }
        }
        removed
    }

    /// Earliest instant at which a suspended device reaches the missing ceiling.
    pub fn next_expiry(&self, ceiling: Duration) -> Option<Duration> {
        self.records
            .iter()
            .filter_map(|(_, r)| r.missing_since)
            .min()
            .map(|since| since + ceiling)
    }

    /// The registry has finished reading the ROM directory of a device.
    pub fn rom_read_complete(&mut self, id: DeviceId) -> bool {
        match self.records.get_mut(id.0) {
            Some(record) => {
                record.busy = false;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceRecord> {
        self.records.get(id.0)
    }

    pub fn find_by_guid(&self, guid: Guid) -> Option<DeviceId> {
        self.by_guid.get(&guid).copied()
    }

    /// True if a device that isn't suspended has this GUID.
    pub fn is_present(&self, guid: Guid) -> bool {
        self.find_by_guid(guid)
            .and_then(|id| self.get(id))
            .map_or(false, |r| !r.is_suspended())
    }

    /// Device bound to a physical ID during the current generation.
    pub fn device_at(&self, phy: PhyId) -> Option<DeviceId> {
        self.nodes.get(phy.index()).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &DeviceRecord)> {
        self.records.iter().map(|(idx, r)| (DeviceId(idx), r))
    }
}

impl Default for Devices {
    fn default() -> Self {
        Devices::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(guid: u64) -> BusInfoBlock {
        BusInfoBlock {
            header: 0x0404_0000,
            quadlets: [0x3133_3934, 0, (guid >> 32) as u32, guid as u32],
            general: true,
        }
    }

    fn node(phy: u8) -> NodeId {
        NodeId::from_phy(PhyId::new(phy).unwrap())
    }

    #[test]
    fn reconcile_by_guid() {
        let mut devices = Devices::new();
        let first = devices.reconcile(Guid(5), node(0), Generation(1), &info(5));
        let id = match first {
            Reconciled::Created(id) => id,
            other => panic!("{:?}", other),
        };
        assert!(devices.get(id).unwrap().busy);

        devices.begin_generation();
        assert_eq!(devices.device_at(PhyId::new(0).unwrap()), None);
        assert_eq!(
            devices.reconcile(Guid(5), node(3), Generation(2), &info(5)),
            Reconciled::Updated(id)
        );
        assert_eq!(devices.device_at(PhyId::new(3).unwrap()), Some(id));
        assert_eq!(devices.get(id).unwrap().node_id, Some(node(3)));
    }

    #[test]
    fn missing_devices_pruned_unless_busy() {
        let mut devices = Devices::new();
        let a = match devices.reconcile(Guid(1), node(0), Generation(1), &info(1)) {
            Reconciled::Created(id) => id,
            other => panic!("{:?}", other),
        };
        let b = match devices.reconcile(Guid(2), node(1), Generation(1), &info(2)) {
            Reconciled::Created(id) => id,
            other => panic!("{:?}", other),
        };
        devices.rom_read_complete(a);

        let now = Duration::from_secs(10);
        let suspended = devices.suspend_missing(Generation(2), now);
        assert_eq!(suspended, [a, b]);
        assert!(!devices.is_present(Guid(1)));

        let ceiling = Duration::from_secs(45);
        assert_eq!(devices.prune(now + Duration::from_secs(1), ceiling), [a]);
        assert_eq!(devices.next_expiry(ceiling), Some(now + ceiling));
        assert!(devices.expire(now + Duration::from_secs(44), ceiling).is_empty());
        assert_eq!(devices.expire(now + ceiling, ceiling), [b]);
        assert!(devices.is_empty());
        assert_eq!(devices.device_at(PhyId::new(1).unwrap()), None);
    }

    #[test]
    fn found_again_before_prune() {
        let mut devices = Devices::new();
        devices.reconcile(Guid(9), node(0), Generation(1), &info(9));
        devices.suspend_missing(Generation(2), Duration::from_secs(1));
        devices.reconcile(Guid(9), node(1), Generation(3), &info(9));
        assert!(devices.prune(Duration::from_secs(2), Duration::from_secs(45)).is_empty());
        assert!(devices.is_present(Guid(9)));
    }
}
