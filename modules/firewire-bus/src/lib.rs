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

//! Bus-management core of an IEEE 1394 (FireWire) host controller.
//!
//! This crate reacts to bus resets, rebuilds the topology of the bus from the self-ID packets,
//! scans the nodes that appeared, negotiates who is root and cycle master, and dispatches
//! asynchronous transactions. It doesn't touch the hardware: everything that the link layer
//! does is requested through the [`Link`] trait, and device objects live in a
//! [`DeviceRegistry`].
//!
//! # Usage
//!
//! Build a [`BusController`] and feed it the events of the link: bus resets, self-IDs, received
//! packets, transaction completions and timers. All the events and calls must be serialized;
//! [`SharedBus`] does that with an asynchronous mutex and exposes the isochronous resource
//! allocation on top of it.

extern crate alloc;

use core::time::Duration;
use smallvec::SmallVec;

pub mod address_space;
pub mod config;
pub mod csr;
pub mod devices;
pub mod dispatch;
pub mod duplicates;
pub mod gate;
pub mod irm;
pub mod node_id;
pub mod packet;
pub mod phy;
pub mod registry;
pub mod reset;
pub mod roles;
pub mod scanner;
pub mod self_id;
pub mod topology;
pub mod transactions;

mod controller;

pub use address_space::{AddressSpaceError, SpaceId, SpaceWrite};
pub use config::Config;
pub use controller::{BusController, PendingTransaction, Submitted, TransactionObserver};
pub use gate::SharedBus;
pub use irm::IrmError;
pub use node_id::{Generation, Guid, NodeId, PhyId, Speed};
pub use packet::{OutboundRequest, OutboundResponse};
pub use registry::{DeviceId, DeviceRegistry, NodeInfo, PropertyValue};
pub use reset::{BusResetState, ResetError, ResetForm, RunState, TimerKind, TimerToken};
pub use transactions::{CommandHandle, CompletionStatus, Response, TransactionError};

/// Error reported by the link layer.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum LinkError {
    /// The link isn't enabled, for example because the controller is powered down.
    #[display(fmt = "link is not active")]
    NotActive,
    /// The link has no room left for the request.
    #[display(fmt = "link is busy")]
    Busy,
    #[display(fmt = "link hardware error 0x{:x}", _0)]
    Hardware(u32),
}

/// Capabilities of the local node, in the format of the third quadlet of a bus-info block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusCharacteristics(pub u32);

impl BusCharacteristics {
    /// Largest block write payload the local node accepts, in bytes.
    pub fn max_rec(self) -> usize {
        match (self.0 >> 12) & 0xf {
            0 => 512,
            n => 2 << n,
        }
    }
}

/// Abstraction over the link layer.
///
/// The code of this library never waits on the hardware. Requests are handed to the link and
/// their outcome is reported later through [`BusController::process_rcv_packet`] or
/// [`BusController::handle_async_completion`]. Likewise, timers are started through this
/// trait and reported through [`BusController::on_timer`].
pub trait Link {
    /// Initiates a bus reset of the given form.
    fn reset_bus(&mut self, form: ResetForm) -> Result<(), LinkError>;
    /// Sends a PHY packet. The link appends the inverse quadlet.
    fn send_phy_packet(&mut self, quadlet: u32) -> Result<(), LinkError>;
    fn set_contender(&mut self, contender: bool);
    fn set_root_hold_off(&mut self, hold_off: bool);
    fn set_cycle_master(&mut self, cycle_master: bool);

    /// Round-trip delays, in nanoseconds, between the local node and each other node.
    fn ping_times(&self) -> SmallVec<[u32; 16]>;
    /// Fastest speed of the local PHY.
    fn phy_speed(&self) -> Speed;
    /// Base-2 logarithm of the largest asynchronous payload the link can send, in bytes.
    fn max_send_log(&self) -> u8;
    fn bus_characteristics(&self) -> BusCharacteristics;
    fn guid(&self) -> Guid;

    fn async_read(&mut self, request: &OutboundRequest) -> Result<(), LinkError>;
    fn async_write(&mut self, request: &OutboundRequest) -> Result<(), LinkError>;
    fn async_lock(&mut self, request: &OutboundRequest) -> Result<(), LinkError>;

    fn async_read_quad_response(&mut self, response: &OutboundResponse) -> Result<(), LinkError>;
    fn async_read_response(&mut self, response: &OutboundResponse) -> Result<(), LinkError>;
    fn async_write_response(&mut self, response: &OutboundResponse) -> Result<(), LinkError>;
    fn async_lock_response(&mut self, response: &OutboundResponse) -> Result<(), LinkError>;

    /// Starts a timer. [`BusController::on_timer`] must be called with `token` once `after`
    /// has elapsed, unless the timer is cancelled first.
    fn start_timer(&mut self, token: TimerToken, after: Duration);
    fn cancel_timer(&mut self, token: TimerToken);
    /// Monotonic clock.
    fn now(&self) -> Duration;

    /// Self-IDs have been invalid too many times in a row. Called once, so that the link can
    /// run its own diagnostics.
    fn notify_self_ids_invalid(&mut self);
}
