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

//! Reconstruction of the bus tree and of the speed between every pair of nodes.
//!
//! Self-ID packets are emitted in a post-order traversal of the bus tree: the children of a
//! node always have lower physical IDs than the node itself, and the root has the highest ID.
//! Walking the table from the root down to node 0 therefore yields a pre-order traversal, in
//! which every node is visited after its parent. The walk keeps an explicit stack containing,
//! for each level, the number of children that remain to be visited. The depth of that stack is
//! bounded by the number of nodes.
//!
//! The speed between two nodes is the minimum of the speeds of all the PHYs on the path between
//! them. When a node is visited, every node visited before it is either an ancestor or in a
//! sibling subtree, and in both cases the path goes through the parent. The speed to each of
//! these nodes is thus the minimum of the node's own speed and of the parent's speed to them.

use crate::node_id::{Generation, PhyId, Speed, MAX_NODES};
use crate::registry::DeviceRegistry;
use crate::self_id::{PortStatus, SelfIdTable};

use alloc::vec::Vec;
use core::convert::TryFrom;
use smallvec::SmallVec;

/// Bit OR'ed in a speed entry when the speed hasn't been verified yet.
pub const SPEED_UNKNOWN: u8 = 0x80;

/// Speed between two nodes, possibly marked as unverified.
///
/// An unverified speed is an upper bound that must be checked before being relied on; until
/// then users should treat it as S100.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpeedEntry(u8);

impl SpeedEntry {
    pub fn new(speed: Speed, verified: bool) -> SpeedEntry {
        SpeedEntry(speed.code() | if verified { 0 } else { SPEED_UNKNOWN })
    }

    /// Speed recorded in the entry, ignoring the verification status.
    pub fn speed(self) -> Speed {
        Speed::from_code(self.0 & !SPEED_UNKNOWN)
    }

    /// Speed that can safely be used right now.
    pub fn usable_speed(self) -> Speed {
        if self.is_verified() {
            self.speed()
        } else {
            Speed::LOWEST
        }
    }

    pub fn is_verified(self) -> bool {
        self.0 & SPEED_UNKNOWN == 0
    }

    /// Combines two entries of a path. The result is unverified if either side is.
    pub fn min(self, other: SpeedEntry) -> SpeedEntry {
        let speed = core::cmp::min(self.speed(), other.speed());
        SpeedEntry::new(speed, self.is_verified() && other.is_verified())
    }

    /// Raw value, with [`SPEED_UNKNOWN`] possibly set.
    pub fn raw(self) -> u8 {
        self.0
    }
}

/// Symmetric node-pair to speed map, stored as a lower-triangular matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedMatrix {
    entries: Vec<SpeedEntry>,
    node_count: usize,
}

impl SpeedMatrix {
    /// Builds a matrix where every entry is an unverified S100.
    pub fn new(node_count: usize) -> SpeedMatrix {
        SpeedMatrix {
            entries: alloc::vec![
                SpeedEntry::new(Speed::S100, false);
                node_count * (node_count + 1) / 2
            ],
            node_count,
        }
    }

    fn index(&self, a: PhyId, b: PhyId) -> Option<usize> {
        let (min, max) = if a <= b { (a.index(), b.index()) } else { (b.index(), a.index()) };
        if max >= self.node_count {
            return None;
        }
        Some(max * (max + 1) / 2 + min)
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Returns the entry for a pair of nodes. Out-of-range nodes are reported as unverified S100.
    pub fn get(&self, a: PhyId, b: PhyId) -> SpeedEntry {
        self.index(a, b)
            .map(|i| self.entries[i])
            .unwrap_or(SpeedEntry::new(Speed::S100, false))
    }

    /// Overwrites the entry for a pair of nodes. Ignored if out of range.
    pub fn set(&mut self, a: PhyId, b: PhyId, entry: SpeedEntry) {
        if let Some(i) = self.index(a, b) {
            self.entries[i] = entry;
        }
    }

    /// Records that transfers between `a` and `b` are known to work at `speed`.
    ///
    /// Entries never increase: the recorded speed becomes the minimum of the previous one and
    /// `speed`, and the entry is marked as verified.
    pub fn refine(&mut self, a: PhyId, b: PhyId, speed: Speed) {
        let current = self.get(a, b);
        let speed = core::cmp::min(current.speed(), speed);
        self.set(a, b, SpeedEntry::new(speed, true));
    }
}

/// Error while walking the bus tree.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum TopologyError {
    /// The table doesn't contain any node.
    #[display(fmt = "empty self-ID table")]
    EmptyTable,
    /// This node has no parent left to attach to.
    #[display(fmt = "node {} has no parent port to attach to", node)]
    ChildUnderflow { node: u8 },
    /// Some nodes announced more children than there are nodes.
    #[display(fmt = "some child ports are not accounted for")]
    UnaccountedChildren,
}

/// Position of a node in the bus tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyNode {
    /// Parent of the node, or `None` for the root.
    pub parent: Option<PhyId>,
    /// Port of the parent to which this node is connected.
    pub parent_port: Option<u8>,
    /// Children of the node, in the order they were visited.
    pub children: SmallVec<[PhyId; 4]>,
    /// Number of hops between the root and this node.
    pub depth: u8,
    /// True if the node is a hub built into the local machine, or the parent of the local node
    /// through the hub port.
    pub hub_builtin: bool,
}

/// Bus tree and speed map of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nodes: Vec<TopologyNode>,
    speeds: SpeedMatrix,
    root: PhyId,
    local: PhyId,
    max_hops: u8,
}

impl Topology {
    /// Walks the self-ID table and builds the tree and speed map.
    ///
    /// `hub_port` is the port of the local PHY that leads to a built-in hub, if any.
    pub fn build(
        table: &SelfIdTable,
        local: PhyId,
        hub_port: Option<u8>,
    ) -> Result<Topology, TopologyError> {
        let root = table.root().ok_or(TopologyError::EmptyTable)?;
        let node_count = table.node_count();
        debug_assert!(node_count <= MAX_NODES);

        let mut nodes: Vec<TopologyNode> = (0..node_count)
            .map(|_| TopologyNode {
                parent: None,
                parent_port: None,
                children: SmallVec::new(),
                depth: 0,
                hub_builtin: false,
            })
            .collect();
        let mut speeds = SpeedMatrix::new(node_count);

        // For each level, the node and the port numbers of its children that remain to be
        // visited. Children are visited in decreasing port order.
        let mut levels: SmallVec<[(PhyId, SmallVec<[u8; 4]>); 16]> = SmallVec::new();

        for phy in table.phy_ids().rev() {
            while levels.last().map_or(false, |(_, ports)| ports.is_empty()) {
                levels.pop();
            }

            let parent = if phy == root {
                None
            } else {
                let (parent, ports) = levels
                    .last_mut()
                    .ok_or(TopologyError::ChildUnderflow { node: phy.get() })?;
                let port = ports.pop().ok_or(TopologyError::ChildUnderflow { node: phy.get() })?;
                Some((*parent, port))
            };

            let own_speed = match table.packet0(phy) {
                // Code 3 covers every speed above S400. Assume S800 until verified.
                Some(p) if p.speed_code() == 3 => SpeedEntry::new(Speed::S800, false),
                Some(p) => SpeedEntry::new(p.speed(), true),
                None => SpeedEntry::new(Speed::S100, false),
            };
            speeds.set(phy, phy, own_speed);

            if let Some((parent, port)) = parent {
                for other in (phy.index() + 1)..node_count {
                    if let Some(other) = PhyId::new(other as u8) {
                        let through_parent = speeds.get(parent, other);
                        speeds.set(phy, other, own_speed.min(through_parent));
                    }
                }

                nodes[phy.index()].parent = Some(parent);
                nodes[phy.index()].parent_port = Some(port);
                nodes[phy.index()].depth = nodes[parent.index()].depth.saturating_add(1);
                nodes[parent.index()].children.push(phy);

                if parent == local && hub_port == Some(port) {
                    nodes[phy.index()].hub_builtin = true;
                }
            }

            let child_ports: SmallVec<[u8; 4]> = table
                .ports(phy)
                .iter()
                .enumerate()
                .filter(|(_, status)| **status == PortStatus::Child)
                .filter_map(|(n, _)| u8::try_from(n).ok())
                .collect();
            if !child_ports.is_empty() {
                levels.push((phy, child_ports));
            }
        }

        while levels.last().map_or(false, |(_, ports)| ports.is_empty()) {
            levels.pop();
        }
        if !levels.is_empty() {
            return Err(TopologyError::UnaccountedChildren);
        }

        // The parent of the local node through the hub port is the built-in hub.
        if let Some(hub_port) = hub_port {
            let local_parent_port = table
                .ports(local)
                .iter()
                .position(|p| *p == PortStatus::Parent);
            if local_parent_port == Some(usize::from(hub_port)) {
                if let Some(parent) = nodes.get(local.index()).and_then(|n| n.parent) {
                    nodes[parent.index()].hub_builtin = true;
                }
            }
        }

        let max_hops = diameter(&nodes);

        Ok(Topology {
            nodes,
            speeds,
            root,
            local,
            max_hops,
        })
    }

    pub fn root(&self) -> PhyId {
        self.root
    }

    pub fn local(&self) -> PhyId {
        self.local
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, phy: PhyId) -> Option<&TopologyNode> {
        self.nodes.get(phy.index())
    }

    pub fn parent(&self, phy: PhyId) -> Option<PhyId> {
        self.node(phy).and_then(|n| n.parent)
    }

    /// Largest number of hops between two nodes of the bus.
    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    pub fn speeds(&self) -> &SpeedMatrix {
        &self.speeds
    }

    pub fn speeds_mut(&mut self) -> &mut SpeedMatrix {
        &mut self.speeds
    }

    /// Reports the parent/child relationships of every node to the registry.
    pub fn attach<R: DeviceRegistry + ?Sized>(&self, registry: &mut R, generation: Generation) {
        for (index, node) in self.nodes.iter().enumerate() {
            let child = match PhyId::new(index as u8) {
                Some(c) => c,
                None => continue,
            };
            if let Some(parent) = node.parent {
                registry.attach(child.node_id(), parent.node_id(), generation, node.hub_builtin);
            }
        }
    }
}

/// Computes the largest number of hops between two nodes.
///
/// Nodes are visited in increasing physical ID order, which guarantees that children are
/// visited before their parent.
fn diameter(nodes: &[TopologyNode]) -> u8 {
    // For each node, the two largest heights of its child subtrees, plus one.
    let mut best: Vec<(u8, u8)> = alloc::vec![(0, 0); nodes.len()];
    let mut diameter = 0;
    for (index, node) in nodes.iter().enumerate() {
        let (first, second) = best[index];
        diameter = core::cmp::max(diameter, first.saturating_add(second));
        if let Some(parent) = node.parent {
            let height = first.saturating_add(1);
            let entry = &mut best[parent.index()];
            if height > entry.0 {
                *entry = (height, entry.0);
            } else if height > entry.1 {
                entry.1 = height;
            }
        }
    }
    diameter
}

#[cfg(test)]
mod tests {
    use super::{SpeedEntry, SpeedMatrix, Topology, TopologyError};
    use crate::node_id::{PhyId, Speed};
    use crate::self_id::{ingest, packet0, with_inverse, PortStatus::*};

    fn phy(n: u8) -> PhyId {
        PhyId::new(n).unwrap()
    }

    #[test]
    fn two_nodes_attach() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 2, true, [Child, NotConnected, NotPresent]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        let topology = Topology::build(&ingested.table, ingested.local, None).unwrap();
        assert_eq!(topology.parent(phy(0)), Some(phy(1)));
        assert_eq!(topology.parent(phy(1)), None);
        assert_eq!(topology.max_hops(), 1);
        assert_eq!(topology.speeds().get(phy(0), phy(1)).speed(), Speed::S400);
    }

    #[test]
    fn speeds_take_path_minimum() {
        // Chain: 0 (S400) - 1 (S100) - 2 (S400, root), plus 3 (S400) as a leaf of the root.
        //
        //        3
        //        |
        //   2 ---+
        //   |
        //   1
        //   |
        //   0
        //
        // Physical IDs follow the post-order: 0, 1, 2 would be wrong for a second child, so
        // the root is node 3 with children 2 (leaf) and 1, and 1 has child 0.
        let node0 = packet0(0, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 0, false, [Child, Parent, NotPresent]);
        let node2 = packet0(2, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node3 = packet0(3, true, 63, 2, true, [Child, Child, NotPresent]);
        let ingested = ingest(&with_inverse(&[node0, node1, node2]), &[node3]).unwrap();
        let topology = Topology::build(&ingested.table, ingested.local, None).unwrap();

        assert_eq!(topology.parent(phy(0)), Some(phy(1)));
        assert_eq!(topology.parent(phy(1)), Some(phy(3)));
        assert_eq!(topology.parent(phy(2)), Some(phy(3)));
        assert_eq!(topology.node(phy(1)).unwrap().parent_port, Some(0));
        assert_eq!(topology.node(phy(2)).unwrap().parent_port, Some(1));
        assert_eq!(topology.max_hops(), 3);

        let speeds = topology.speeds();
        assert_eq!(speeds.get(phy(0), phy(2)).speed(), Speed::S100);
        assert_eq!(speeds.get(phy(2), phy(3)).speed(), Speed::S400);
        assert_eq!(speeds.get(phy(0), phy(0)).speed(), Speed::S400);
        for a in 0..4 {
            for b in 0..4 {
                assert_eq!(speeds.get(phy(a), phy(b)), speeds.get(phy(b), phy(a)));
            }
        }
    }

    #[test]
    fn unknown_speed_propagates() {
        let node0 = packet0(0, true, 63, 3, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 2, true, [Child, NotConnected, NotPresent]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        let mut topology = Topology::build(&ingested.table, ingested.local, None).unwrap();
        assert!(!topology.speeds().get(phy(0), phy(0)).is_verified());
        assert!(!topology.speeds().get(phy(0), phy(1)).is_verified());
        assert_eq!(topology.speeds().get(phy(0), phy(1)).usable_speed(), Speed::S100);

        topology.speeds_mut().refine(phy(0), phy(0), Speed::S800);
        assert!(topology.speeds().get(phy(0), phy(0)).is_verified());
        assert_eq!(topology.speeds().get(phy(0), phy(0)).speed(), Speed::S800);
    }

    #[test]
    fn child_underflow() {
        // The root claims no child, but there are two nodes.
        let node0 = packet0(0, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 2, true, [NotConnected, NotConnected, NotPresent]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        assert_eq!(
            Topology::build(&ingested.table, ingested.local, None),
            Err(TopologyError::ChildUnderflow { node: 0 })
        );
    }

    #[test]
    fn unaccounted_children() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 2, true, [Child, Child, NotPresent]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        assert_eq!(
            Topology::build(&ingested.table, ingested.local, None),
            Err(TopologyError::UnaccountedChildren)
        );
    }

    #[test]
    fn hub_port_tags_neighbour() {
        // Local node 1 is root; node 0 hangs off its port 2, which is the hub port.
        let node0 = packet0(0, true, 63, 2, false, [Parent, NotConnected, NotPresent]);
        let node1 = packet0(1, true, 63, 2, true, [NotConnected, NotConnected, Child]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        let topology = Topology::build(&ingested.table, ingested.local, Some(2)).unwrap();
        assert!(topology.node(phy(0)).unwrap().hub_builtin);
        assert!(!topology.node(phy(1)).unwrap().hub_builtin);
    }

    #[test]
    fn matrix_refine_never_increases() {
        let mut matrix = SpeedMatrix::new(3);
        matrix.set(phy(0), phy(2), SpeedEntry::new(Speed::S200, false));
        matrix.refine(phy(2), phy(0), Speed::S400);
        assert_eq!(matrix.get(phy(0), phy(2)), SpeedEntry::new(Speed::S200, true));
        assert_eq!(matrix.get(phy(0), phy(5)), SpeedEntry::new(Speed::S100, false));
    }
}
