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

//! Local address spaces that remote nodes can read, write and lock.
//!
//! The set of kinds is closed: host memory windows, pseudo spaces at a caller-chosen address,
//! pseudo spaces at an address picked by us, and the Configuration ROM. Spaces live in a
//! [`Slab`] and are addressed by [`SpaceId`].
//!
//! Inbound requests walk the spaces in order. A space that doesn't cover the whole requested
//! range answers "not in range" and the next one is tried; the first other answer wins. If no
//! space claims the request, it fails with an address error.

use crate::csr;
use crate::node_id::{Generation, NodeId};
use crate::packet::{ExtendedTcode, Rcode};

use alloc::vec::Vec;
use core::convert::TryFrom;
use slab::Slab;

/// First address handed out by [`AddressSpaces::allocate_pseudo`].
pub const PSEUDO_SPACE_START: u64 = 0xffff_0000_0000;
/// End (exclusive) of the region used by [`AddressSpaces::allocate_pseudo`].
pub const PSEUDO_SPACE_END: u64 = csr::CSR_BASE;
/// End (exclusive) of the address space of a node. Offsets are 48 bits.
pub const ADDRESS_SPACE_END: u64 = 1 << 48;

/// Handle to an address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub usize);

/// Error while managing the address spaces.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AddressSpaceError {
    /// The range overlaps with an exclusive space, or is exclusive and overlaps another space.
    #[display(fmt = "address range overlaps an existing space")]
    Overlap,
    /// No room left in the pseudo address region.
    #[display(fmt = "no address space available")]
    NoAddressSpaceAvailable,
    #[display(fmt = "unknown address space")]
    UnknownSpace,
    /// The range doesn't fit in the 48-bit address space of a node.
    #[display(fmt = "address range out of bounds")]
    OutOfRange,
}

/// Kind of an address space.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpaceKind {
    Physical,
    PseudoFixed,
    PseudoDynamic,
    ConfigRom,
}

/// One local address space.
#[derive(Debug, Clone)]
pub enum AddressSpace {
    /// Window onto host memory. Readable and writable, no lock transactions.
    Physical { base: u64, memory: Vec<u8> },
    /// Backing store at an address chosen by the caller.
    PseudoFixed {
        base: u64,
        data: Vec<u8>,
        exclusive: bool,
    },
    /// Backing store at an address chosen by [`AddressSpaces::allocate_pseudo`].
    PseudoDynamic { base: u64, data: Vec<u8> },
    /// Local Configuration ROM. Read-only.
    ConfigRom { rom: Vec<u8> },
}

/// Outcome of an operation on a single space. `None` means the request isn't in range.
type Answer<T> = Option<Result<T, Rcode>>;

impl AddressSpace {
    pub fn kind(&self) -> SpaceKind {
        match self {
            AddressSpace::Physical { .. } => SpaceKind::Physical,
            AddressSpace::PseudoFixed { .. } => SpaceKind::PseudoFixed,
            AddressSpace::PseudoDynamic { .. } => SpaceKind::PseudoDynamic,
            AddressSpace::ConfigRom { .. } => SpaceKind::ConfigRom,
        }
    }

    pub fn base(&self) -> u64 {
        match self {
            AddressSpace::Physical { base, .. }
            | AddressSpace::PseudoFixed { base, .. }
            | AddressSpace::PseudoDynamic { base, .. } => *base,
            AddressSpace::ConfigRom { .. } => csr::CONFIG_ROM_BASE,
        }
    }

    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            AddressSpace::Physical { memory: data, .. }
            | AddressSpace::PseudoFixed { data, .. }
            | AddressSpace::PseudoDynamic { data, .. }
            | AddressSpace::ConfigRom { rom: data } => data,
        }
    }

    /// True if no other space may overlap this one.
    pub fn is_exclusive(&self) -> bool {
        match self {
            AddressSpace::PseudoFixed { exclusive, .. } => *exclusive,
            AddressSpace::Physical { .. } => false,
            AddressSpace::PseudoDynamic { .. } | AddressSpace::ConfigRom { .. } => true,
        }
    }

    /// First address past the end of the space.
    pub fn end(&self) -> u64 {
        self.base().saturating_add(self.len())
    }

    /// True if `[address, address + len)` lies entirely within the space.
    pub fn contains(&self, address: u64, len: usize) -> bool {
        match address.checked_add(len as u64) {
            Some(req_end) => address >= self.base() && req_end <= self.end(),
            None => false,
        }
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        start < self.end() && self.base() < start.saturating_add(len)
    }

    fn range(&self, address: u64, len: usize) -> Option<core::ops::Range<usize>> {
        if !self.contains(address, len) {
            return None;
        }
        let start = usize::try_from(address - self.base()).ok()?;
        Some(start..start + len)
    }

    pub fn do_read(&self, address: u64, len: usize) -> Answer<Vec<u8>> {
        let range = self.range(address, len)?;
        Some(Ok(self.bytes()[range].to_vec()))
    }

    pub fn do_write(&mut self, address: u64, payload: &[u8]) -> Answer<()> {
        let range = self.range(address, payload.len())?;
        match self {
            AddressSpace::ConfigRom { .. } => Some(Err(Rcode::TypeError)),
            AddressSpace::Physical { memory: data, .. }
            | AddressSpace::PseudoFixed { data, .. }
            | AddressSpace::PseudoDynamic { data, .. } => {
                data[range].copy_from_slice(payload);
                Some(Ok(()))
            }
        }
    }

    /// Performs a lock operation. Returns the old value.
    pub fn do_lock(
        &mut self,
        address: u64,
        extended_tcode: ExtendedTcode,
        payload: &[u8],
    ) -> Answer<Vec<u8>> {
        let width = if extended_tcode.has_argument() {
            payload.len() / 2
        } else {
            payload.len()
        };
        let range = self.range(address, width)?;
        let data = match self {
            AddressSpace::ConfigRom { .. } | AddressSpace::Physical { .. } => {
                return Some(Err(Rcode::TypeError))
            }
            AddressSpace::PseudoFixed { data, .. } | AddressSpace::PseudoDynamic { data, .. } => {
                data
            }
        };

        let old = data[range.clone()].to_vec();
        Some(apply_lock(extended_tcode, &old, payload).map(|new| {
            data[range].copy_from_slice(&new);
            old
        }))
    }
}

/// Computes the new value of a lock operation from the old value and the request payload.
///
/// `payload` is `arg_value || data_value` for operations with an argument, and `data_value`
/// otherwise. Quadlet and octlet operands are supported.
pub fn apply_lock(extended_tcode: ExtendedTcode, old: &[u8], payload: &[u8]) -> Result<Vec<u8>, Rcode> {
    let width = old.len();
    let expected = if extended_tcode.has_argument() {
        2 * width
    } else {
        width
    };
    if (width != 4 && width != 8) || payload.len() != expected {
        return Err(Rcode::TypeError);
    }

    let (arg, data) = if extended_tcode.has_argument() {
        payload.split_at(width)
    } else {
        (&[][..], payload)
    };

    if extended_tcode == ExtendedTcode::LittleAdd {
        let sum = from_le(old).wrapping_add(from_le(data));
        return Ok(to_le(sum, width));
    }

    let old_value = from_be(old);
    let data_value = from_be(data);
    let new_value = match extended_tcode {
        ExtendedTcode::MaskSwap => {
            let mask = from_be(arg);
            (data_value & mask) | (old_value & !mask)
        }
        ExtendedTcode::CompareSwap => {
            if old_value == from_be(arg) {
                data_value
            } else {
                old_value
            }
        }
        ExtendedTcode::FetchAdd => old_value.wrapping_add(data_value),
        ExtendedTcode::BoundedAdd => {
            if old_value != from_be(arg) {
                old_value.wrapping_add(data_value)
            } else {
                old_value
            }
        }
        ExtendedTcode::WrapAdd => {
            if old_value != from_be(arg) {
                old_value.wrapping_add(data_value)
            } else {
                data_value
            }
        }
        ExtendedTcode::LittleAdd => unreachable!(),
    };
    Ok(to_be(new_value, width))
}

fn from_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

fn from_le(bytes: &[u8]) -> u64 {
    bytes.iter().rev().fold(0, |acc, b| (acc << 8) | u64::from(*b))
}

fn to_be(value: u64, width: usize) -> Vec<u8> {
    value.to_be_bytes()[8 - width..].to_vec()
}

fn to_le(value: u64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width].to_vec()
}

/// Write performed by a remote node (or by loopback) into one of the local spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceWrite {
    pub space: SpaceId,
    pub source: NodeId,
    pub generation: Generation,
    pub address: u64,
    pub data: Vec<u8>,
}

/// Collection of all the local address spaces.
#[derive(Debug)]
pub struct AddressSpaces {
    spaces: Slab<AddressSpace>,
    /// Space holding the isochronous resource manager registers.
    irm_registers: SpaceId,
    /// Writes not yet collected by [`AddressSpaces::take_writes`].
    writes: Vec<SpaceWrite>,
}

impl AddressSpaces {
    /// Builds the initial set of spaces: the Configuration ROM and the IRM registers.
    pub fn new(config_rom: &[u32]) -> AddressSpaces {
        let mut spaces = Slab::with_capacity(8);

        let rom = config_rom.iter().flat_map(|q| q.to_be_bytes().to_vec()).collect();
        spaces.insert(AddressSpace::ConfigRom { rom });

        let irm_registers = SpaceId(spaces.insert(AddressSpace::PseudoFixed {
            base: csr::BUS_MANAGER_ID,
            data: Self::initial_irm_registers(),
            exclusive: true,
        }));

        AddressSpaces {
            spaces,
            irm_registers,
            writes: Vec::new(),
        }
    }

    fn initial_irm_registers() -> Vec<u8> {
        let mut data = Vec::with_capacity(16);
        data.extend_from_slice(&csr::BUS_MANAGER_ID_INITIAL.to_be_bytes());
        data.extend_from_slice(&csr::BANDWIDTH_AVAILABLE_INITIAL.to_be_bytes());
        data.extend_from_slice(&csr::CHANNELS_AVAILABLE_INITIAL.to_be_bytes());
        data.extend_from_slice(&csr::CHANNELS_AVAILABLE_INITIAL.to_be_bytes());
        data
    }

    /// Restores the IRM registers to their power-up values. Must be called on every bus reset.
    pub fn reset_irm_registers(&mut self) {
        if let Some(AddressSpace::PseudoFixed { data, .. }) = self.spaces.get_mut(self.irm_registers.0)
        {
            *data = Self::initial_irm_registers();
        }
    }

    /// Adds a window onto host memory starting at `base`.
    pub fn add_physical(&mut self, base: u64, len: usize) -> Result<SpaceId, AddressSpaceError> {
        self.insert(AddressSpace::Physical {
            base,
            memory: alloc::vec![0; len],
        })
    }

    /// Adds a pseudo space at a fixed address.
    pub fn add_fixed(
        &mut self,
        base: u64,
        len: usize,
        exclusive: bool,
    ) -> Result<SpaceId, AddressSpaceError> {
        self.insert(AddressSpace::PseudoFixed {
            base,
            data: alloc::vec![0; len],
            exclusive,
        })
    }

    /// Adds a pseudo space at the lowest free quadlet-aligned address of the pseudo region.
    pub fn allocate_pseudo(&mut self, len: usize) -> Result<SpaceId, AddressSpaceError> {
        let len_aligned = (len as u64)
            .checked_add(3)
            .ok_or(AddressSpaceError::NoAddressSpaceAvailable)?
            & !3;
        let mut candidate = PSEUDO_SPACE_START;
        loop {
            match candidate.checked_add(len_aligned) {
                Some(end) if end <= PSEUDO_SPACE_END => {}
                _ => return Err(AddressSpaceError::NoAddressSpaceAvailable),
            }
            let blocker = self
                .spaces
                .iter()
                .filter(|(_, s)| s.overlaps(candidate, len_aligned.max(1)))
                .map(|(_, s)| s.end())
                .max();
            match blocker {
                Some(end) => candidate = (end + 3) & !3,
                None => break,
            }
        }

        self.insert(AddressSpace::PseudoDynamic {
            base: candidate,
            data: alloc::vec![0; len],
        })
    }

    fn insert(&mut self, space: AddressSpace) -> Result<SpaceId, AddressSpaceError> {
        let start = space.base();
        let len = space.len().max(1);
        match start.checked_add(len) {
            Some(end) if end <= ADDRESS_SPACE_END => {}
            _ => return Err(AddressSpaceError::OutOfRange),
        }
        let conflict = self.spaces.iter().any(|(_, other)| {
            other.overlaps(start, len) && (other.is_exclusive() || space.is_exclusive())
        });
        if conflict {
            return Err(AddressSpaceError::Overlap);
        }
        Ok(SpaceId(self.spaces.insert(space)))
    }

    /// Removes a space previously added. The ROM and IRM registers can't be removed.
    pub fn remove(&mut self, id: SpaceId) -> Result<(), AddressSpaceError> {
        match self.spaces.get(id.0) {
            Some(AddressSpace::ConfigRom { .. }) | None => Err(AddressSpaceError::UnknownSpace),
            Some(_) if id == self.irm_registers => Err(AddressSpaceError::UnknownSpace),
            Some(_) => {
                self.spaces.remove(id.0);
                self.writes.retain(|w| w.space != id);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(id.0)
    }

    /// Returns the current content of a space.
    pub fn data(&self, id: SpaceId) -> Option<&[u8]> {
        self.spaces.get(id.0).map(|s| s.bytes())
    }

    /// Returns the writes performed since the last call.
    pub fn take_writes(&mut self) -> Vec<SpaceWrite> {
        core::mem::replace(&mut self.writes, Vec::new())
    }

    /// Reads a local IRM register. Used when the local node is the resource manager.
    pub fn irm_register(&self, address: u64) -> Option<u32> {
        let bytes = self.spaces.get(self.irm_registers.0)?.do_read(address, 4)?.ok()?;
        let mut quadlet = [0; 4];
        quadlet.copy_from_slice(&bytes);
        Some(u32::from_be_bytes(quadlet))
    }

    pub fn read(&self, address: u64, len: usize) -> Result<Vec<u8>, Rcode> {
        self.spaces
            .iter()
            .find_map(|(_, space)| space.do_read(address, len))
            .unwrap_or(Err(Rcode::AddressError))
    }

    pub fn write(
        &mut self,
        source: NodeId,
        generation: Generation,
        address: u64,
        payload: &[u8],
    ) -> Result<(), Rcode> {
        for (id, space) in self.spaces.iter_mut() {
            if let Some(result) = space.do_write(address, payload) {
                if result.is_ok() {
                    self.writes.push(SpaceWrite {
                        space: SpaceId(id),
                        source,
                        generation,
                        address,
                        data: payload.to_vec(),
                    });
                }
                return result;
            }
        }
        Err(Rcode::AddressError)
    }

    pub fn lock(
        &mut self,
        address: u64,
        extended_tcode: ExtendedTcode,
        payload: &[u8],
    ) -> Result<Vec<u8>, Rcode> {
        self.spaces
            .iter_mut()
            .find_map(|(_, space)| space.do_lock(address, extended_tcode, payload))
            .unwrap_or(Err(Rcode::AddressError))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn be(quadlets: &[u32]) -> Vec<u8> {
        quadlets.iter().flat_map(|q| q.to_be_bytes().to_vec()).collect()
    }

    #[test]
    fn config_rom_is_read_only() {
        let mut spaces = AddressSpaces::new(&[0x0404_0000, csr::BUS_NAME_1394]);
        assert_eq!(
            spaces.read(csr::CONFIG_ROM_BASE + 4, 4),
            Ok(be(&[csr::BUS_NAME_1394]))
        );
        assert_eq!(
            spaces.write(NodeId::from_raw(0xffc1), Generation(1), csr::CONFIG_ROM_BASE, &[0; 4]),
            Err(Rcode::TypeError)
        );
        assert_eq!(spaces.read(csr::CONFIG_ROM_BASE + 8, 4), Err(Rcode::AddressError));
    }

    #[test]
    fn ranges_past_the_address_space_are_refused() {
        let mut spaces = AddressSpaces::new(&[]);
        assert_eq!(
            spaces.add_fixed(u64::max_value() - 2, 8, false),
            Err(AddressSpaceError::OutOfRange)
        );
        assert_eq!(
            spaces.add_physical(ADDRESS_SPACE_END - 4, 8),
            Err(AddressSpaceError::OutOfRange)
        );
        assert!(spaces.add_physical(ADDRESS_SPACE_END - 8, 8).is_ok());
        assert_eq!(spaces.read(u64::max_value() - 1, 4), Err(Rcode::AddressError));
    }

    #[test]
    fn irm_registers_reset() {
        let mut spaces = AddressSpaces::new(&[]);
        assert_eq!(spaces.irm_register(csr::BANDWIDTH_AVAILABLE), Some(4915));
        let payload = be(&[4915, 4815]);
        let old = spaces
            .lock(csr::BANDWIDTH_AVAILABLE, ExtendedTcode::CompareSwap, &payload)
            .unwrap();
        assert_eq!(old, be(&[4915]));
        assert_eq!(spaces.irm_register(csr::BANDWIDTH_AVAILABLE), Some(4815));
        spaces.reset_irm_registers();
        assert_eq!(spaces.irm_register(csr::BANDWIDTH_AVAILABLE), Some(4915));
        assert_eq!(spaces.irm_register(csr::CHANNELS_AVAILABLE_LO), Some(0xffff_ffff));
    }

    #[test]
    fn lock_operations() {
        let old = be(&[10]);
        let lock = |op, payload: &[u32]| apply_lock(op, &old, &be(payload)).unwrap();
        assert_eq!(lock(ExtendedTcode::MaskSwap, &[0xf0, 0xff]), be(&[0xfa]));
        assert_eq!(lock(ExtendedTcode::CompareSwap, &[10, 3]), be(&[3]));
        assert_eq!(lock(ExtendedTcode::CompareSwap, &[11, 3]), be(&[10]));
        assert_eq!(lock(ExtendedTcode::FetchAdd, &[5]), be(&[15]));
        assert_eq!(lock(ExtendedTcode::BoundedAdd, &[10, 5]), be(&[10]));
        assert_eq!(lock(ExtendedTcode::BoundedAdd, &[20, 5]), be(&[15]));
        assert_eq!(lock(ExtendedTcode::WrapAdd, &[10, 1]), be(&[1]));
        assert_eq!(lock(ExtendedTcode::WrapAdd, &[20, 1]), be(&[11]));

        // Little-endian add: 10 big-endian is 0x0a000000 little-endian.
        let little = apply_lock(ExtendedTcode::LittleAdd, &old, &[1, 0, 0, 0]).unwrap();
        assert_eq!(little, [1, 0, 0, 10]);
    }

    #[test]
    fn octlet_lock() {
        let old = 0x1_0000_0000u64.to_be_bytes();
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1_0000_0000u64.to_be_bytes());
        payload.extend_from_slice(&7u64.to_be_bytes());
        let new = apply_lock(ExtendedTcode::CompareSwap, &old, &payload).unwrap();
        assert_eq!(new, 7u64.to_be_bytes());
        assert_eq!(
            apply_lock(ExtendedTcode::CompareSwap, &old, &payload[..12]),
            Err(Rcode::TypeError)
        );
    }

    #[test]
    fn first_space_in_range_wins() {
        let mut spaces = AddressSpaces::new(&[]);
        let a = spaces.add_fixed(0x1000, 8, false).unwrap();
        let b = spaces.add_fixed(0x1000, 16, false).unwrap();
        let source = NodeId::from_raw(0xffc2);

        // Only the second one covers the end of the range.
        spaces.write(source, Generation(3), 0x100c, &[1, 2, 3, 4]).unwrap();
        let writes = spaces.take_writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].space, b);
        assert_eq!(spaces.data(a), Some(&[0u8; 8][..]));
        assert!(spaces.take_writes().is_empty());
    }

    #[test]
    fn exclusive_overlap_rejected() {
        let mut spaces = AddressSpaces::new(&[]);
        spaces.add_fixed(0x2000, 8, true).unwrap();
        assert_eq!(spaces.add_fixed(0x2004, 8, false), Err(AddressSpaceError::Overlap));
        assert_eq!(
            spaces.add_fixed(csr::BANDWIDTH_AVAILABLE, 4, false),
            Err(AddressSpaceError::Overlap)
        );
    }

    #[test]
    fn pseudo_allocation_packs_spaces() {
        let mut spaces = AddressSpaces::new(&[]);
        let a = spaces.allocate_pseudo(6).unwrap();
        let b = spaces.allocate_pseudo(4).unwrap();
        assert_eq!(spaces.get(a).unwrap().base(), PSEUDO_SPACE_START);
        assert_eq!(spaces.get(b).unwrap().base(), PSEUDO_SPACE_START + 8);
        spaces.remove(a).unwrap();
        assert_eq!(spaces.remove(a), Err(AddressSpaceError::UnknownSpace));
        let c = spaces.allocate_pseudo(8).unwrap();
        assert_eq!(spaces.get(c).unwrap().base(), PSEUDO_SPACE_START);
    }

    #[test]
    fn physical_spaces_refuse_locks() {
        let mut spaces = AddressSpaces::new(&[]);
        spaces.add_physical(0, 64).unwrap();
        assert_eq!(
            spaces.lock(0, ExtendedTcode::FetchAdd, &[0, 0, 0, 1]),
            Err(Rcode::TypeError)
        );
    }
}
