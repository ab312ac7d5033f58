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

//! PHY packets and gap count optimization.
//!
//! The *gap count* controls how long a PHY waits on an idle bus before starting arbitration.
//! All the nodes must use the same value, and the optimal value depends on the diameter of the
//! bus: a bus with few hops can use a smaller gap and thus waste less time. The gap count is
//! changed by broadcasting a PHY configuration packet, which takes effect at the next reset.

use crate::node_id::PhyId;

use core::cmp;

/// Maximum gap count, used on buses whose topology isn't known yet.
pub const MAX_GAP_COUNT: u8 = 63;

/// Optimal gap count for a given number of hops between the two most distant nodes, as
/// recommended by IEEE 1394a.
const HOP_GAP_COUNTS: [u8; 25] = [
    63, 5, 7, 8, 10, 13, 16, 18, 21, 24, 26, 29, 32, 35, 37, 40, 43, 46, 48, 51, 54, 57, 59, 62,
    63,
];

/// Round-trip delay, in nanoseconds, of the local PHY alone.
const PING_BASE_NS: u32 = 288;
/// Additional round-trip delay, in nanoseconds, introduced by each hop (repeater delay plus
/// 4.5 meters of cable, both ways).
const PING_PER_HOP_NS: u32 = 334;

/// PHY configuration packet.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PhyConfig {
    /// Node that must become root after the next reset.
    pub force_root: Option<PhyId>,
    /// Gap count that all the nodes must use after the next reset.
    pub gap_count: Option<u8>,
}

impl PhyConfig {
    /// Encodes the first quadlet of the packet. The link sends the inverse quadlet itself.
    pub fn encode(&self) -> u32 {
        let mut quadlet = 0;
        if let Some(root) = self.force_root {
            quadlet |= u32::from(root.get()) << 24;
            quadlet |= 1 << 23;
        }
        if let Some(gap_count) = self.gap_count {
            quadlet |= 1 << 22;
            quadlet |= u32::from(gap_count & 0x3f) << 16;
        }
        quadlet
    }

    /// Decodes a PHY configuration quadlet. Returns `None` for other kinds of PHY packets.
    pub fn decode(quadlet: u32) -> Option<PhyConfig> {
        if quadlet >> 30 != 0 {
            return None;
        }
        let force_root = if quadlet & (1 << 23) != 0 {
            PhyId::new(((quadlet >> 24) & 0x3f) as u8)
        } else {
            None
        };
        let gap_count = if quadlet & (1 << 22) != 0 {
            Some(((quadlet >> 16) & 0x3f) as u8)
        } else {
            None
        };
        Some(PhyConfig {
            force_root,
            gap_count,
        })
    }

    /// Combines two packets into one. Fields of `other` take precedence.
    pub fn merge(self, other: PhyConfig) -> PhyConfig {
        PhyConfig {
            force_root: other.force_root.or(self.force_root),
            gap_count: other.gap_count.or(self.gap_count),
        }
    }
}

/// Gap count recommended for the given bus diameter.
pub fn gap_count_for_hops(hops: u8) -> u8 {
    HOP_GAP_COUNTS
        .get(usize::from(hops))
        .copied()
        .unwrap_or(MAX_GAP_COUNT)
}

/// Gap count recommended for the given worst round-trip delay to a node, in nanoseconds.
pub fn gap_count_for_ping_time(ping_ns: u32) -> u8 {
    if ping_ns == 0 {
        return gap_count_for_hops(0);
    }
    let hops = (ping_ns.saturating_sub(PING_BASE_NS) + PING_PER_HOP_NS - 1) / PING_PER_HOP_NS;
    let hops = cmp::max(hops, 1);
    gap_count_for_hops(cmp::min(hops, u32::from(u8::max_value())) as u8)
}

/// Computes the gap count to use, given the diameter of the bus and the round-trip delays to
/// the nodes. The most conservative of the two estimates wins.
pub fn optimal_gap_count(max_hops: u8, ping_times_ns: &[u32]) -> u8 {
    let from_hops = gap_count_for_hops(max_hops);
    let from_ping = ping_times_ns
        .iter()
        .max()
        .map(|ping| gap_count_for_ping_time(*ping))
        .unwrap_or(0);
    if max_hops == 0 {
        return from_hops;
    }
    cmp::max(from_hops, from_ping)
}
