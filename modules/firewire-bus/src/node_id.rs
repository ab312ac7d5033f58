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

//! Identifiers shared by the whole bus-management core.
//!
//! A node on the bus is identified by a 16-bit *node ID*: the upper 10 bits are the bus number
//! (always the local bus, `0x3ff`, in this implementation) and the lower 6 bits are the
//! *physical ID* assigned during the self-identification phase that follows every bus reset.
//! Physical IDs are only meaningful within a single [`Generation`].

use core::fmt;

/// Number of the local bus, as found in the upper 10 bits of every node ID.
pub const LOCAL_BUS: u16 = 0x3ff;

/// Maximum number of nodes on a bus. Physical ID 63 is reserved for broadcast.
pub const MAX_NODES: usize = 63;

/// Physical ID used to address all the nodes at once.
pub const BROADCAST_PHY_ID: u8 = 63;

/// Identifier of the current topology epoch.
///
/// Incremented exactly once per processed bus reset. All the operations that target a remote
/// node carry the generation they were built for and fail if the bus has reset since.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u32);

impl Generation {
    /// Returns the generation that follows this one.
    pub fn next(self) -> Generation {
        Generation(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// 6-bit physical ID of a node, between 0 and 62 included for actual nodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhyId(u8);

impl PhyId {
    /// Builds a [`PhyId`]. Returns `None` if the value doesn't fit in 6 bits.
    pub fn new(id: u8) -> Option<PhyId> {
        if id <= BROADCAST_PHY_ID {
            Some(PhyId(id))
        } else {
            None
        }
    }

    /// Returns the raw value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Returns the value as an index in per-node arrays.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// True if this is the broadcast physical ID.
    pub fn is_broadcast(self) -> bool {
        self.0 == BROADCAST_PHY_ID
    }

    /// Returns the full node ID of this physical ID on the local bus.
    pub fn node_id(self) -> NodeId {
        NodeId::from_phy(self)
    }
}

impl fmt::Display for PhyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// 16-bit node address, as found in the source and destination fields of asynchronous packets.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(u16);

impl NodeId {
    /// Sentinel meaning "unknown or offline". Corresponds to the broadcast address of the local
    /// bus, which can never be the ID of an actual node.
    pub const BAD: NodeId = NodeId((LOCAL_BUS << 6) | BROADCAST_PHY_ID as u16);

    /// Builds a [`NodeId`] from its raw 16-bit representation.
    pub const fn from_raw(raw: u16) -> NodeId {
        NodeId(raw)
    }

    /// Builds the ID of the node with the given physical ID on the local bus.
    pub fn from_phy(phy: PhyId) -> NodeId {
        NodeId((LOCAL_BUS << 6) | u16::from(phy.get()))
    }

    /// Returns the raw 16-bit representation.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Returns the physical ID part of this node ID.
    pub fn phy_id(self) -> PhyId {
        PhyId((self.0 & 0x3f) as u8)
    }

    /// Returns the bus number part of this node ID.
    pub fn bus(self) -> u16 {
        self.0 >> 6
    }

    /// True if the node ID is a broadcast address, in which case no response must ever be sent.
    pub fn is_broadcast(self) -> bool {
        self.phy_id().is_broadcast()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "NodeId(0x{:04x})", self.0)
    }
}

/// 64-bit globally unique identifier of a node, read from its bus-info block.
///
/// The value 0 is never a valid GUID.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(pub u64);

impl Guid {
    /// Builds a GUID from the two bus-info-block quadlets that contain it.
    pub fn from_quadlets(hi: u32, lo: u32) -> Guid {
        Guid((u64::from(hi) << 32) | u64::from(lo))
    }

    /// True if the GUID can identify a device. Zero is reserved.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns the 24-bit vendor identifier (company ID) embedded in the GUID.
    pub fn vendor_id(self) -> u32 {
        (self.0 >> 40) as u32
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Guid(0x{:016x})", self.0)
    }
}

/// Speed of a link or of a transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Speed {
    S100 = 0,
    S200 = 1,
    S400 = 2,
    S800 = 3,
    S1600 = 4,
    S3200 = 5,
}

impl Speed {
    /// Slowest speed that every node supports.
    pub const LOWEST: Speed = Speed::S100;

    /// Decodes a speed code. Values beyond S3200 are clamped.
    pub fn from_code(code: u8) -> Speed {
        match code {
            0 => Speed::S100,
            1 => Speed::S200,
            2 => Speed::S400,
            3 => Speed::S800,
            4 => Speed::S1600,
            _ => Speed::S3200,
        }
    }

    /// Returns the speed code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Returns the speed one grade below, or `None` for [`Speed::S100`].
    pub fn step_down(self) -> Option<Speed> {
        match self {
            Speed::S100 => None,
            s => Some(Speed::from_code(s.code() - 1)),
        }
    }

    /// Maximum payload, in bytes, of an asynchronous block packet at this speed.
    pub fn max_async_payload(self) -> usize {
        512 << self.code()
    }

    /// Speed in megabits per second, as published in the registry.
    pub fn mbits(self) -> u32 {
        100 << self.code()
    }
}
