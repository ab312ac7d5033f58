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

//! Well-known addresses of the CSR architecture, as translated from IEEE 1212 and IEEE 1394.

use crate::node_id::Guid;

/// Upper 16 bits of the initial register space.
pub const CSR_REGISTER_SPACE_HI: u16 = 0xffff;
/// Lower 32 bits of the start of the initial register space.
pub const CSR_REGISTER_SPACE_LO: u32 = 0xf000_0000;

/// 48-bit base address of the initial register space.
pub const CSR_BASE: u64 = 0xffff_f000_0000;

pub const BUS_MANAGER_ID_OFFSET: u64 = 0x21c;
pub const BANDWIDTH_AVAILABLE_OFFSET: u64 = 0x220;
pub const CHANNELS_AVAILABLE_HI_OFFSET: u64 = 0x224;
pub const CHANNELS_AVAILABLE_LO_OFFSET: u64 = 0x228;

/// Offset of the Configuration ROM. The first quadlet is the bus-info-block header.
pub const CONFIG_ROM_OFFSET: u64 = 0x400;
/// Size of the Configuration ROM region, in bytes.
pub const CONFIG_ROM_LEN: u64 = 0x400;

pub const BUS_MANAGER_ID: u64 = CSR_BASE + BUS_MANAGER_ID_OFFSET;
pub const BANDWIDTH_AVAILABLE: u64 = CSR_BASE + BANDWIDTH_AVAILABLE_OFFSET;
pub const CHANNELS_AVAILABLE_HI: u64 = CSR_BASE + CHANNELS_AVAILABLE_HI_OFFSET;
pub const CHANNELS_AVAILABLE_LO: u64 = CSR_BASE + CHANNELS_AVAILABLE_LO_OFFSET;
pub const CONFIG_ROM_BASE: u64 = CSR_BASE + CONFIG_ROM_OFFSET;

/// Address of the bus-info-block header quadlet.
pub const BUS_INFO_BLOCK_HEADER: u64 = CONFIG_ROM_BASE;

/// Number of quadlets of the bus-info block that follow the header and that the scanner reads.
pub const BUS_INFO_BLOCK_QUADLETS: usize = 4;

/// Value of BANDWIDTH_AVAILABLE after a bus reset, in allocation units.
pub const BANDWIDTH_AVAILABLE_INITIAL: u32 = 4915;
/// Value of both CHANNELS_AVAILABLE registers after a bus reset.
pub const CHANNELS_AVAILABLE_INITIAL: u32 = 0xffff_ffff;
/// Value of BUS_MANAGER_ID after a bus reset. No bus manager.
pub const BUS_MANAGER_ID_INITIAL: u32 = 0x3f;

/// Value of the second bus-info-block quadlet: ASCII `"1394"`.
pub const BUS_NAME_1394: u32 = 0x3133_3934;

/// True if the address is one of the isochronous resource manager registers.
///
/// Requests to these registers are always sent at the lowest speed.
pub fn is_irm_register(address: u64) -> bool {
    matches!(
        address,
        BUS_MANAGER_ID | BANDWIDTH_AVAILABLE | CHANNELS_AVAILABLE_HI | CHANNELS_AVAILABLE_LO
    )
}

/// Decoded bus-info block of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusInfoBlock {
    /// Raw header quadlet.
    pub header: u32,
    /// Raw quadlets following the header. Empty for a minimal ROM.
    pub quadlets: [u32; BUS_INFO_BLOCK_QUADLETS],
    /// False if the ROM only consists of the header and a vendor ID.
    pub general: bool,
}

impl BusInfoBlock {
    /// Length, in quadlets, of the bus-info block as declared by the header.
    pub fn header_info_length(header: u32) -> u8 {
        (header >> 24) as u8
    }

    /// Builds a [`BusInfoBlock`] for a minimal ROM.
    pub fn minimal(header: u32) -> Self {
        BusInfoBlock {
            header,
            quadlets: [0; BUS_INFO_BLOCK_QUADLETS],
            general: false,
        }
    }

    /// Returns the GUID of the node, or `None` for a minimal ROM.
    pub fn guid(&self) -> Option<Guid> {
        if self.general {
            Some(Guid::from_quadlets(self.quadlets[2], self.quadlets[3]))
        } else {
            None
        }
    }

    /// True if the node claims to be capable of being isochronous resource manager.
    pub fn irm_capable(&self) -> bool {
        self.general && self.quadlets[1] & (1 << 31) != 0
    }

    /// True if the node claims to be capable of being cycle master.
    pub fn cycle_master_capable(&self) -> bool {
        self.general && self.quadlets[1] & (1 << 30) != 0
    }

    /// True if the node claims to be capable of being bus manager.
    pub fn bus_manager_capable(&self) -> bool {
        self.general && self.quadlets[1] & (1 << 28) != 0
    }

    /// Maximum payload the node accepts for asynchronous block writes, in bytes.
    pub fn max_rec(&self) -> Option<usize> {
        if !self.general {
            return None;
        }
        let max_rec = (self.quadlets[1] >> 12) & 0xf;
        if max_rec == 0 || max_rec == 0xf {
            None
        } else {
            Some(2 << max_rec)
        }
    }

    /// Serializes the block as big-endian bytes, the way it is published in the registry.
    pub fn to_bytes(&self) -> alloc::vec::Vec<u8> {
        let mut out = alloc::vec::Vec::with_capacity(4 * (1 + BUS_INFO_BLOCK_QUADLETS));
        out.extend_from_slice(&self.header.to_be_bytes());
        if self.general {
            for q in &self.quadlets {
                out.extend_from_slice(&q.to_be_bytes());
            }
        }
        out
    }
}
