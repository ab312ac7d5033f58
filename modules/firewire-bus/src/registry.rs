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

//! Interface towards the device registry that owns the per-node device objects.
//!
//! The bus manager never owns device objects. It tells the registry which devices to create,
//! refresh, suspend or terminate, and publishes a few key/value properties that other
//! components depend on. The string identity of the keys is part of that contract.

use crate::csr::BusInfoBlock;
use crate::node_id::{Generation, Guid, NodeId, Speed};

use alloc::{string::String, vec::Vec};

/// Generation of the bus, as a hexadecimal string, or [`SCAN_IN_PROGRESS`].
pub const PROPERTY_GENERATION: &str = "FireWire Generation ID";
/// Raw self-ID packets of a node (or of the whole bus), as big-endian bytes.
pub const PROPERTY_SELF_IDS: &str = "FireWire Self IDs";
pub const PROPERTY_NODE_ID: &str = "FireWire Node ID";
pub const PROPERTY_SPEED: &str = "FireWire Speed";
pub const PROPERTY_GUID: &str = "GUID";
pub const PROPERTY_VENDOR_ID: &str = "Vendor_ID";
/// Bus-info block of a node, as big-endian bytes.
pub const PROPERTY_DEVICE_ROM: &str = "FireWire Device ROM";

/// Value of [`PROPERTY_GENERATION`] while a scan is running.
pub const SCAN_IN_PROGRESS: &str = "Bus Scan In Progress";

/// Identifier of a device record. Assigned by the bus manager and stable for the whole lifetime
/// of the device, across bus resets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

/// Value of a published property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    String(String),
    Number(u64),
    Bytes(Vec<u8>),
}

/// What the bus manager learned about a node during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub generation: Generation,
    /// Speed of the path between the local node and this node.
    pub speed: Speed,
    /// Self-ID packets of the node, as big-endian bytes.
    pub self_ids: Vec<u8>,
    /// `None` for dummy entries whose ROM couldn't be read.
    pub bus_info: Option<BusInfoBlock>,
}

impl NodeInfo {
    pub fn guid(&self) -> Option<Guid> {
        self.bus_info.as_ref().and_then(|b| b.guid())
    }
}

/// Device registry, as seen from the bus manager.
///
/// All the methods are called from within the serialization domain of the bus, and must not
/// call back into the bus manager.
pub trait DeviceRegistry {
    /// Creates a live device object for a node and starts reading its Configuration ROM
    /// directory. The registry must call [`BusController::device_rom_read_complete`] once
    /// that read is finished.
    ///
    /// [`BusController::device_rom_read_complete`]: crate::BusController::device_rom_read_complete
    fn create_device(&mut self, id: DeviceId, info: &NodeInfo);

    /// An existing device has been found again, possibly at a different node ID.
    fn update_device(&mut self, id: DeviceId, node_id: NodeId, generation: Generation);

    /// Creates a placeholder entry for a node that doesn't get a live device object.
    fn create_dummy(&mut self, info: &NodeInfo);

    /// Records that `child` is connected to a port of `parent` during `generation`.
    fn attach(&mut self, child: NodeId, parent: NodeId, generation: Generation, hub_builtin: bool);

    /// The device has vanished from the bus. It might come back before it is terminated.
    fn suspend_device(&mut self, id: DeviceId);

    /// The device is gone for good. Its identifier won't be used anymore.
    fn terminate_device(&mut self, id: DeviceId);

    /// Publishes a property of the bus itself.
    fn set_property(&mut self, key: &'static str, value: PropertyValue);

    /// Publishes a property of the node entry with the given node ID.
    fn set_node_property(&mut self, node_id: NodeId, key: &'static str, value: PropertyValue);
}
