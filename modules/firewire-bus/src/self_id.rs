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

//! Validation and organization of the self-ID packets received after a bus reset.
//!
//! After a bus reset, every node broadcasts between one and four *self-ID packets* describing
//! itself. The link delivers them to us as pairs of quadlets, the second quadlet of each pair
//! being the bitwise inverse of the first. The local node's own packets are not part of that
//! stream and are reported separately.
//!
//! # Packet format
//!
//! ```notrust
//! packet #0:   10 phy_ID(6) 0 L gap_cnt(6) sp(2) del(2) c pwr(3) p0(2) p1(2) p2(2) i m
//! extended:    10 phy_ID(6) 1 n(3) rsv(2) pa pb pc pd pe pf pg ph (2 bits each) r m
//! ```
//!
//! Nodes send their packets in increasing order of physical ID, and the node with the highest
//! physical ID is the root. A valid stream covers every physical ID from 0 to the root with no
//! gap. Anything else means that the transmission was corrupted, and the only sensible reaction
//! is to reset the bus again.

use crate::node_id::{PhyId, Speed, MAX_NODES};

/// Capacity of the per-node arrays. One more than the number of nodes a bus can hold.
pub(crate) const NODE_SLOTS: usize = 64;

use alloc::vec::Vec;
use arrayvec::ArrayVec;
use core::{convert::TryFrom, ops::Range};

/// Error while ingesting self-IDs. Never surfaced to the users of the crate; any of these
/// results in a new bus reset.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum SelfIdError {
    /// No self-ID at all for the local node.
    #[display(fmt = "no self-ID for the local node")]
    Empty,
    /// The quadlet at the given pair index doesn't match its inverse.
    #[display(fmt = "self-ID #{} doesn't match its inverse", index)]
    BadInverse { index: usize },
    /// The quadlet at the given pair index isn't a self-ID packet.
    #[display(fmt = "quadlet #{} isn't a self-ID packet", index)]
    NotSelfId { index: usize },
    /// An extended packet appears without its preceding packet #0, or out of sequence.
    #[display(fmt = "unexpected extended self-ID #{}", index)]
    UnexpectedExtended { index: usize },
    /// No self-ID for this physical ID even though higher IDs are present.
    #[display(fmt = "missing self-ID for node {}", phy_id)]
    MissingNode { phy_id: u8 },
    /// Physical IDs are not increasing.
    #[display(fmt = "self-ID for node {} is out of order", phy_id)]
    OutOfOrder { phy_id: u8 },
    /// More nodes than a bus can hold.
    #[display(fmt = "too many nodes")]
    TooManyNodes,
}

/// Connection status of a PHY port, as reported in self-ID packets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortStatus {
    /// Port isn't implemented by the PHY.
    NotPresent,
    /// Port is implemented but nothing is connected.
    NotConnected,
    /// Port is connected to the parent of the node.
    Parent,
    /// Port is connected to a child of the node.
    Child,
}

impl PortStatus {
    fn from_bits(bits: u32) -> PortStatus {
        match bits & 0b11 {
            0b11 => PortStatus::Child,
            0b10 => PortStatus::Parent,
            0b01 => PortStatus::NotConnected,
            _ => PortStatus::NotPresent,
        }
    }
}

/// Single self-ID quadlet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SelfIdPacket(pub u32);

impl SelfIdPacket {
    /// True if the two top bits identify a self-ID packet.
    pub fn is_self_id(self) -> bool {
        self.0 >> 30 == 0b10
    }

    pub fn phy_id(self) -> u8 {
        ((self.0 >> 24) & 0x3f) as u8
    }

    /// True for extended packets (#1, #2, #3).
    pub fn is_extended(self) -> bool {
        self.0 & (1 << 23) != 0
    }

    /// Sequence number of an extended packet.
    pub fn sequence(self) -> u8 {
        ((self.0 >> 20) & 0x7) as u8
    }

    /// True if another packet of the same node follows.
    pub fn more_packets(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn link_active(self) -> bool {
        self.0 & (1 << 22) != 0
    }

    pub fn gap_count(self) -> u8 {
        ((self.0 >> 16) & 0x3f) as u8
    }

    /// Raw 2-bit speed code. Code 3 is reported by PHYs faster than S400, whose actual speed
    /// must be verified.
    pub fn speed_code(self) -> u8 {
        ((self.0 >> 14) & 0x3) as u8
    }

    pub fn speed(self) -> Speed {
        Speed::from_code(self.speed_code())
    }

    pub fn contender(self) -> bool {
        self.0 & (1 << 11) != 0
    }

    pub fn power_class(self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    pub fn initiated_reset(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    fn push_ports(self, out: &mut ArrayVec<[PortStatus; MAX_PORTS]>) {
        let (count, first_shift) = if self.is_extended() { (8, 16) } else { (3, 6) };
        for n in 0..count {
            let status = PortStatus::from_bits(self.0 >> (first_shift - 2 * n));
            if out.try_push(status).is_err() {
                break;
            }
        }
    }
}

/// Maximum number of ports of a PHY that self-ID packets can describe.
pub const MAX_PORTS: usize = 27;

/// Self-ID packets of all the nodes on the bus, indexed by physical ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdTable {
    /// All the quadlets, in order of physical ID.
    quadlets: Vec<u32>,
    /// For each physical ID, range within `quadlets`.
    nodes: ArrayVec<[Range<usize>; NODE_SLOTS]>,
}

impl SelfIdTable {
    /// Number of nodes on the bus.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Physical ID of the root, which is the highest one.
    pub fn root(&self) -> Option<PhyId> {
        let last = self.nodes.len().checked_sub(1)?;
        PhyId::new(u8::try_from(last).ok()?)
    }

    /// Returns the quadlets of a node, or an empty slice if out of range.
    pub fn packets(&self, phy: PhyId) -> &[u32] {
        match self.nodes.get(phy.index()) {
            Some(range) => &self.quadlets[range.clone()],
            None => &[],
        }
    }

    /// Returns packet #0 of a node.
    pub fn packet0(&self, phy: PhyId) -> Option<SelfIdPacket> {
        self.packets(phy).first().map(|q| SelfIdPacket(*q))
    }

    /// Returns the status of every port of a node, in port order.
    pub fn ports(&self, phy: PhyId) -> ArrayVec<[PortStatus; MAX_PORTS]> {
        let mut out = ArrayVec::new();
        for q in self.packets(phy) {
            SelfIdPacket(*q).push_ports(&mut out);
        }
        out
    }

    /// Number of ports of a node that are connected to children.
    pub fn child_count(&self, phy: PhyId) -> usize {
        self.ports(phy)
            .iter()
            .filter(|p| **p == PortStatus::Child)
            .count()
    }

    /// Iterates over the physical IDs of the table.
    pub fn phy_ids(&self) -> impl DoubleEndedIterator<Item = PhyId> + '_ {
        (0..self.nodes.len()).filter_map(|n| PhyId::new(n as u8))
    }

    /// Raw quadlets of all the nodes, serialized as big-endian bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.quadlets.iter().flat_map(|q| q.to_be_bytes()).collect()
    }

    /// Raw bytes of a single node, serialized as big-endian bytes.
    pub fn node_bytes(&self, phy: PhyId) -> Vec<u8> {
        self.packets(phy).iter().flat_map(|q| q.to_be_bytes()).collect()
    }
}

/// Outcome of a successful [`ingest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingested {
    pub table: SelfIdTable,
    pub root: PhyId,
    pub local: PhyId,
    /// Gap count reported by packet #0 of the root.
    pub gap_count: u8,
    /// True if nodes don't all report the same gap count.
    pub gap_count_mismatch: bool,
}

/// Validates the self-IDs delivered by the link and organizes them by physical ID.
///
/// `pairs` contains the received stream as `(value, !value)` pairs. `own` contains the self-ID
/// packets of the local node, which aren't part of the stream.
pub fn ingest(pairs: &[u32], own: &[u32]) -> Result<Ingested, SelfIdError> {
    let own_phy = match own.first() {
        Some(q) if SelfIdPacket(*q).is_self_id() && !SelfIdPacket(*q).is_extended() => {
            SelfIdPacket(*q).phy_id()
        }
        _ => return Err(SelfIdError::Empty),
    };
    if own
        .iter()
        .any(|q| !SelfIdPacket(*q).is_self_id() || SelfIdPacket(*q).phy_id() != own_phy)
    {
        return Err(SelfIdError::Empty);
    }

    // Group the received stream by physical ID, checking the inverse of each quadlet.
    let mut groups: Vec<(u8, Vec<u32>)> = Vec::new();
    for (index, pair) in pairs.chunks(2).enumerate() {
        let (value, inverse) = match pair {
            [value, inverse] => (*value, *inverse),
            _ => return Err(SelfIdError::BadInverse { index }),
        };
        if value != !inverse {
            return Err(SelfIdError::BadInverse { index });
        }

        let packet = SelfIdPacket(value);
        if !packet.is_self_id() {
            return Err(SelfIdError::NotSelfId { index });
        }

        // Some links echo the local packets in the stream. They are replaced with `own` below.
        if packet.phy_id() == own_phy {
            continue;
        }

        match groups.last_mut() {
            Some((phy, quadlets)) if *phy == packet.phy_id() => {
                let expected_sequence = quadlets.len() - 1;
                if !packet.is_extended() || usize::from(packet.sequence()) != expected_sequence {
                    return Err(SelfIdError::UnexpectedExtended { index });
                }
                quadlets.push(value);
            }
            _ => {
                if packet.is_extended() {
                    return Err(SelfIdError::UnexpectedExtended { index });
                }
                groups.push((packet.phy_id(), alloc::vec![value]));
            }
        }
    }

    // Splice the local packets at the position implied by the local physical ID, and check that
    // IDs go from 0 to the root without any gap.
    let mut quadlets = Vec::with_capacity(pairs.len() / 2 + own.len());
    let mut nodes = ArrayVec::<[Range<usize>; NODE_SLOTS]>::new();
    let mut own_inserted = false;
    let mut next_expected: u8 = 0;

    for (phy, packets) in &groups {
        if !own_inserted && next_expected == own_phy {
            push_node(&mut quadlets, &mut nodes, own)?;
            own_inserted = true;
            next_expected += 1;
        }
        if *phy < next_expected {
            return Err(SelfIdError::OutOfOrder { phy_id: *phy });
        }
        if *phy > next_expected {
            return Err(SelfIdError::MissingNode {
                phy_id: next_expected,
            });
        }
        push_node(&mut quadlets, &mut nodes, packets)?;
        next_expected += 1;
    }

    // The local node has the highest physical ID, or is alone on the bus.
    if !own_inserted {
        if own_phy != next_expected {
            return Err(SelfIdError::MissingNode {
                phy_id: next_expected.min(own_phy),
            });
        }
        push_node(&mut quadlets, &mut nodes, own)?;
    }

    let table = SelfIdTable { quadlets, nodes };
    let root = table.root().ok_or(SelfIdError::Empty)?;
    let local = PhyId::new(own_phy).ok_or(SelfIdError::Empty)?;

    let (gap_count, gap_count_mismatch) = {
        let mut gap_counts = table
            .phy_ids()
            .filter_map(|phy| table.packet0(phy))
            .map(|p| p.gap_count());
        let first_gap = gap_counts.next().unwrap_or(0);
        let mismatch = gap_counts.any(|g| g != first_gap);
        let root_gap = table.packet0(root).map(|p| p.gap_count()).unwrap_or(first_gap);
        (root_gap, mismatch)
    };

    Ok(Ingested {
        table,
        root,
        local,
        gap_count,
        gap_count_mismatch,
    })
}

fn push_node(
    quadlets: &mut Vec<u32>,
    nodes: &mut ArrayVec<[Range<usize>; NODE_SLOTS]>,
    packets: &[u32],
) -> Result<(), SelfIdError> {
    if nodes.len() >= MAX_NODES {
        return Err(SelfIdError::TooManyNodes);
    }
    let start = quadlets.len();
    quadlets.extend_from_slice(packets);
    nodes
        .try_push(start..quadlets.len())
        .map_err(|_| SelfIdError::TooManyNodes)
}

/// Builds packet #0 of a node. Used to generate self-ID streams in tests.
#[cfg(test)]
pub(crate) fn packet0(
    phy: u8,
    link_active: bool,
    gap_count: u8,
    speed: u8,
    contender: bool,
    ports: [PortStatus; 3],
) -> u32 {
    fn port_bits(p: PortStatus) -> u32 {
        match p {
            PortStatus::NotPresent => 0b00,
            PortStatus::NotConnected => 0b01,
            PortStatus::Parent => 0b10,
            PortStatus::Child => 0b11,
        }
    }

    (0b10 << 30)
        | (u32::from(phy) << 24)
        | (if link_active { 1 << 22 } else { 0 })
        | (u32::from(gap_count & 0x3f) << 16)
        | (u32::from(speed & 0x3) << 14)
        | (if contender { 1 << 11 } else { 0 })
        | (port_bits(ports[0]) << 6)
        | (port_bits(ports[1]) << 4)
        | (port_bits(ports[2]) << 2)
}

/// Turns a list of quadlets into the `(value, !value)` stream delivered by links.
#[cfg(test)]
pub(crate) fn with_inverse(quadlets: &[u32]) -> Vec<u32> {
    quadlets.iter().flat_map(|q| [*q, !*q].to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::{ingest, packet0, with_inverse, PortStatus, SelfIdError, SelfIdPacket};
    use PortStatus::{Child, NotConnected as Nc, NotPresent as Np, Parent};

    #[test]
    fn two_nodes() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, true, [Child, Nc, Np]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        assert_eq!(ingested.table.node_count(), 2);
        assert_eq!(ingested.root.get(), 1);
        assert_eq!(ingested.local.get(), 1);
        assert!(!ingested.gap_count_mismatch);
        assert_eq!(ingested.gap_count, 63);
        assert_eq!(ingested.table.child_count(ingested.root), 1);
        assert!(ingested.table.packet0(ingested.root).unwrap().contender());
    }

    #[test]
    fn local_spliced_in_the_middle() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, false, [Parent, Child, Np]);
        let node2 = packet0(2, true, 63, 2, true, [Child, Nc, Np]);
        let ingested = ingest(&with_inverse(&[node0, node2]), &[node1]).unwrap();
        assert_eq!(ingested.table.node_count(), 3);
        assert_eq!(ingested.local.get(), 1);
        assert_eq!(ingested.root.get(), 2);
        assert_eq!(
            ingested.table.packets(ingested.local),
            &[node1][..]
        );
    }

    #[test]
    fn local_alone() {
        let own = packet0(0, true, 63, 2, true, [Nc, Nc, Np]);
        let ingested = ingest(&[], &[own]).unwrap();
        assert_eq!(ingested.table.node_count(), 1);
        assert_eq!(ingested.root, ingested.local);
    }

    #[test]
    fn echoed_local_packets_are_ignored() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, true, [Child, Nc, Np]);
        let ingested = ingest(&with_inverse(&[node0, node1]), &[node1]).unwrap();
        assert_eq!(ingested.table.node_count(), 2);
    }

    #[test]
    fn bad_inverse() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, false, [Parent, Child, Np]);
        let node2 = packet0(2, true, 63, 2, true, [Child, Nc, Np]);
        let mut stream = with_inverse(&[node0, node1]);
        stream[3] ^= 0x100;
        assert_eq!(
            ingest(&stream, &[node2]),
            Err(SelfIdError::BadInverse { index: 1 })
        );
    }

    #[test]
    fn gap_in_ids() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node2 = packet0(2, true, 63, 2, false, [Parent, Child, Np]);
        let node3 = packet0(3, true, 63, 2, true, [Child, Nc, Np]);
        assert_eq!(
            ingest(&with_inverse(&[node0, node2]), &[node3]),
            Err(SelfIdError::MissingNode { phy_id: 1 })
        );
    }

    #[test]
    fn out_of_order() {
        let node0 = packet0(0, true, 63, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, false, [Parent, Child, Np]);
        let node3 = packet0(3, true, 63, 2, true, [Child, Nc, Np]);
        assert_eq!(
            ingest(&with_inverse(&[node0, node1, node0]), &[node3]),
            Err(SelfIdError::OutOfOrder { phy_id: 0 })
        );
    }

    #[test]
    fn extended_packets_concatenated() {
        // Node 0 has a fourth port, connected to its parent, described by an extended packet.
        let node0 = packet0(0, true, 63, 2, false, [Nc, Nc, Nc]) | 1;
        let node0_ext = (0b10 << 30) | (1 << 23) | (0b10 << 16);
        let node1 = packet0(1, true, 63, 2, true, [Child, Nc, Np]);
        let ingested = ingest(&with_inverse(&[node0, node0_ext]), &[node1]).unwrap();
        let ports = ingested.table.ports(super::PhyId::new(0).unwrap());
        assert_eq!(ports[3], Parent);
        assert!(SelfIdPacket(node0).more_packets());

        // An extended packet without its packet #0 is corrupt.
        assert!(matches!(
            ingest(&with_inverse(&[node0_ext]), &[node1]),
            Err(SelfIdError::UnexpectedExtended { .. })
        ));
    }

    #[test]
    fn gap_count_mismatch() {
        let node0 = packet0(0, true, 10, 2, false, [Parent, Nc, Np]);
        let node1 = packet0(1, true, 63, 2, true, [Child, Nc, Np]);
        let ingested = ingest(&with_inverse(&[node0]), &[node1]).unwrap();
        assert!(ingested.gap_count_mismatch);
    }
}
