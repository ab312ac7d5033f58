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

//! Serialized access to a [`BusController`] from asynchronous code.
//!
//! The controller itself is driven by link events and never waits. Operations that span
//! multiple transactions, such as isochronous resource allocation, need to wait for responses
//! without holding the controller for the whole duration. [`SharedBus`] puts the controller
//! behind an asynchronous mutex, which is only held while the controller is being touched.

use crate::controller::{BusController, Submitted};
use crate::irm::{self, IrmAccessRef, IrmError};
use crate::node_id::{Generation, NodeId};
use crate::packet::ExtendedTcode;
use crate::registry::DeviceRegistry;
use crate::transactions::TransactionError;
use crate::Link;

use alloc::{boxed::Box, vec::Vec};
use futures::{
    future::BoxFuture,
    lock::{Mutex, MutexGuard, MutexLockFuture},
};

/// Bus controller shared between the link event handlers and asynchronous users.
pub struct SharedBus<L, R> {
    inner: Mutex<BusController<L, R>>,
}

impl<L, R> SharedBus<L, R> {
    pub fn new(controller: BusController<L, R>) -> Self {
        SharedBus {
            inner: Mutex::new(controller),
        }
    }

    /// Locks the controller. Link events must be delivered through the returned guard.
    pub fn lock(&self) -> MutexLockFuture<BusController<L, R>> {
        self.inner.lock()
    }

    /// Tries to lock the controller without waiting.
    pub fn try_lock(&self) -> Option<MutexGuard<BusController<L, R>>> {
        self.inner.try_lock()
    }

    pub fn into_inner(self) -> BusController<L, R> {
        self.inner.into_inner()
    }
}

impl<L, R> SharedBus<L, R>
where
    L: Link + Send,
    R: DeviceRegistry + Send,
{
    /// Allocates `units` of isochronous bandwidth from the resource manager of `generation`.
    pub async fn allocate_bandwidth(&self, generation: Generation, units: u32) -> Result<(), IrmError> {
        let attempts = self.attempts().await;
        irm::allocate_bandwidth(self, generation, units, attempts).await
    }

    pub async fn release_bandwidth(&self, generation: Generation, units: u32) -> Result<(), IrmError> {
        let attempts = self.attempts().await;
        irm::release_bandwidth(self, generation, units, attempts).await
    }

    /// Allocates isochronous channel `channel` (0 to 63).
    pub async fn allocate_channel(&self, generation: Generation, channel: u8) -> Result<(), IrmError> {
        let attempts = self.attempts().await;
        irm::allocate_channel(self, generation, channel, attempts).await
    }

    pub async fn release_channel(&self, generation: Generation, channel: u8) -> Result<(), IrmError> {
        let attempts = self.attempts().await;
        irm::release_channel(self, generation, channel, attempts).await
    }

    async fn attempts(&self) -> u8 {
        self.inner.lock().await.config().irm_allocation_attempts
    }

    async fn compare_swap_quadlet(
        &self,
        generation: Generation,
        node: NodeId,
        address: u64,
        expected: u32,
        new: u32,
    ) -> Result<u32, TransactionError> {
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&expected.to_be_bytes());
        data.extend_from_slice(&new.to_be_bytes());

        // The guard must be released before waiting for the response.
        let submitted = {
            let mut bus = self.inner.lock().await;
            bus.async_lock(generation, node, address, ExtendedTcode::CompareSwap, data, None)?
        };

        let response = match submitted {
            Submitted::Completed(response) => response,
            Submitted::Pending(pending) => pending.await?,
        };
        response.quadlet().ok_or(TransactionError::InvalidRequest)
    }
}

impl<'a, L, R> IrmAccessRef<'a> for &'a SharedBus<L, R>
where
    L: Link + Send + 'a,
    R: DeviceRegistry + Send + 'a,
{
    type State = BoxFuture<'a, (Generation, Option<NodeId>)>;
    type CompareSwap = BoxFuture<'a, Result<u32, TransactionError>>;

    fn irm_state(self) -> Self::State {
        Box::pin(async move {
            let bus = self.inner.lock().await;
            let irm = bus.irm_node_id();
            let irm = if irm == NodeId::BAD { None } else { Some(irm) };
            (bus.generation(), irm)
        })
    }

    fn compare_swap(
        self,
        generation: Generation,
        irm: NodeId,
        address: u64,
        expected: u32,
        new: u32,
    ) -> Self::CompareSwap {
        Box::pin(self.compare_swap_quadlet(generation, irm, address, expected, new))
    }
}
