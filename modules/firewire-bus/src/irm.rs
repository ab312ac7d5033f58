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

//! Allocation of isochronous bandwidth and channels.
//!
//! The isochronous resource manager exposes `BANDWIDTH_AVAILABLE` and `CHANNELS_AVAILABLE_HI/LO`
//! registers. Allocating or releasing a resource consists in a compare-swap against the
//! relevant register. Since nothing prevents other nodes from modifying the registers
//! concurrently, the compare-swap can fail, in which case we learn the actual value of the
//! register and try again, up to a small number of attempts.
//!
//! Every operation is tied to a generation. The identity of the resource manager can change
//! after a bus reset, so an operation for a stale generation fails without touching the bus.

use crate::csr;
use crate::node_id::{Generation, NodeId};
use crate::transactions::TransactionError;

use core::future::Future;

/// Error while allocating or releasing an isochronous resource.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum IrmError {
    /// The generation isn't the current one, or the bus reset during the operation.
    #[display(fmt = "bus reset occurred")]
    BusReset,
    /// The resource isn't available, or there is no resource manager on the bus.
    #[display(fmt = "resource not available")]
    NoResources,
    #[display(fmt = "{}", _0)]
    Transaction(TransactionError),
}

/// Access to the registers of the resource manager.
///
/// Implemented on references to the shared bus, and on simulated registers in tests.
pub trait IrmAccessRef<'a>: Copy {
    type State: Future<Output = (Generation, Option<NodeId>)> + 'a;
    type CompareSwap: Future<Output = Result<u32, TransactionError>> + 'a;

    /// Returns the current generation and the node ID of the resource manager.
    fn irm_state(self) -> Self::State;

    /// Performs a quadlet compare-swap and returns the old value of the register.
    fn compare_swap(
        self,
        generation: Generation,
        irm: NodeId,
        address: u64,
        expected: u32,
        new: u32,
    ) -> Self::CompareSwap;
}

/// Allocates `units` of isochronous bandwidth.
pub async fn allocate_bandwidth<'a, A: IrmAccessRef<'a>>(
    access: A,
    generation: Generation,
    units: u32,
    attempts: u8,
) -> Result<(), IrmError> {
    compare_swap_loop(
        access,
        generation,
        csr::BANDWIDTH_AVAILABLE,
        csr::BANDWIDTH_AVAILABLE_INITIAL,
        attempts,
        |available| available.checked_sub(units),
    )
    .await
}

/// Gives back `units` of isochronous bandwidth.
///
/// The first guess of the register value is that our allocation is the only one.
pub async fn release_bandwidth<'a, A: IrmAccessRef<'a>>(
    access: A,
    generation: Generation,
    units: u32,
    attempts: u8,
) -> Result<(), IrmError> {
    compare_swap_loop(
        access,
        generation,
        csr::BANDWIDTH_AVAILABLE,
        csr::BANDWIDTH_AVAILABLE_INITIAL.saturating_sub(units),
        attempts,
        |available| {
            available
                .checked_add(units)
                .filter(|v| *v <= csr::BANDWIDTH_AVAILABLE_INITIAL)
        },
    )
    .await
}

/// Allocates an isochronous channel (0 to 63).
pub async fn allocate_channel<'a, A: IrmAccessRef<'a>>(
    access: A,
    generation: Generation,
    channel: u8,
    attempts: u8,
) -> Result<(), IrmError> {
    let (address, bit) = channel_bit(channel)?;
    compare_swap_loop(
        access,
        generation,
        address,
        csr::CHANNELS_AVAILABLE_INITIAL,
        attempts,
        |available| {
            if available & bit != 0 {
                Some(available & !bit)
            } else {
                None
            }
        },
    )
    .await
}

/// Gives back an isochronous channel.
pub async fn release_channel<'a, A: IrmAccessRef<'a>>(
    access: A,
    generation: Generation,
    channel: u8,
    attempts: u8,
) -> Result<(), IrmError> {
    let (address, bit) = channel_bit(channel)?;
    compare_swap_loop(
        access,
        generation,
        address,
        csr::CHANNELS_AVAILABLE_INITIAL & !bit,
        attempts,
        |available| {
            if available & bit == 0 {
                Some(available | bit)
            } else {
                None
            }
        },
    )
    .await
}

/// Returns the register and the bit corresponding to a channel.
fn channel_bit(channel: u8) -> Result<(u64, u32), IrmError> {
    match channel {
        0..=31 => Ok((csr::CHANNELS_AVAILABLE_HI, 1 << (31 - channel))),
        32..=63 => Ok((csr::CHANNELS_AVAILABLE_LO, 1 << (63 - channel))),
        _ => Err(IrmError::Transaction(TransactionError::InvalidRequest)),
    }
}

async fn compare_swap_loop<'a, A: IrmAccessRef<'a>>(
    access: A,
    generation: Generation,
    address: u64,
    seed: u32,
    attempts: u8,
    update: impl Fn(u32) -> Option<u32>,
) -> Result<(), IrmError> {
    let (current, irm) = access.irm_state().await;
    if current != generation {
        return Err(IrmError::BusReset);
    }
    let irm = irm.ok_or(IrmError::NoResources)?;

    let mut expected = seed;
    for _ in 0..attempts {
        let new = match update(expected) {
            Some(v) => v,
            None => return Err(IrmError::NoResources),
        };

        match access
            .compare_swap(generation, irm, address, expected, new)
            .await
        {
            Ok(old) if old == expected => return Ok(()),
            Ok(old) => {
                log::debug!(
                    "Compare-swap at 0x{:x} expected 0x{:x}, found 0x{:x}",
                    address,
                    expected,
                    old
                );
                expected = old;
            }
            Err(TransactionError::BusReset) => return Err(IrmError::BusReset),
            Err(err) => return Err(IrmError::Transaction(err)),
        }
    }

    Err(IrmError::NoResources)
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::cell::{Cell, RefCell};
    use futures::{executor::block_on, future};

    /// Resource manager registers that reply with their true value.
    struct SimulatedIrm {
        generation: Generation,
        registers: RefCell<hashbrown::HashMap<u64, u32, fnv::FnvBuildHasher>>,
        writes: Cell<u32>,
    }

    impl SimulatedIrm {
        fn new(bandwidth: u32, channels_hi: u32) -> Self {
            let mut registers = hashbrown::HashMap::default();
            registers.insert(csr::BANDWIDTH_AVAILABLE, bandwidth);
            registers.insert(csr::CHANNELS_AVAILABLE_HI, channels_hi);
            registers.insert(csr::CHANNELS_AVAILABLE_LO, 0xffff_ffff);
            SimulatedIrm {
                generation: Generation(3),
                registers: RefCell::new(registers),
                writes: Cell::new(0),
            }
        }

        fn get(&self, address: u64) -> u32 {
            self.registers.borrow()[&address]
        }
    }

    impl<'a> IrmAccessRef<'a> for &'a SimulatedIrm {
        type State = future::Ready<(Generation, Option<NodeId>)>;
        type CompareSwap = future::Ready<Result<u32, TransactionError>>;

        fn irm_state(self) -> Self::State {
            future::ready((self.generation, Some(NodeId::from_raw(0xffc2))))
        }

        fn compare_swap(
            self,
            generation: Generation,
            _: NodeId,
            address: u64,
            expected: u32,
            new: u32,
        ) -> Self::CompareSwap {
            if generation != self.generation {
                return future::ready(Err(TransactionError::BusReset));
            }
            self.writes.set(self.writes.get() + 1);
            let mut registers = self.registers.borrow_mut();
            let register = registers.get_mut(&address).unwrap();
            let old = *register;
            if old == expected {
                *register = new;
            }
            future::ready(Ok(old))
        }
    }

    #[test]
    fn allocate_from_fresh_register() {
        let irm = SimulatedIrm::new(4915, 0xffff_ffff);
        block_on(allocate_bandwidth(&irm, Generation(3), 100, 2)).unwrap();
        assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 4815);
        assert_eq!(irm.writes.get(), 1);
    }

    #[test]
    fn adopts_actual_value_on_mismatch() {
        let irm = SimulatedIrm::new(1000, 0xffff_ffff);
        block_on(allocate_bandwidth(&irm, Generation(3), 100, 2)).unwrap();
        assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 900);
        assert_eq!(irm.writes.get(), 2);
    }

    #[test]
    fn not_enough_bandwidth() {
        let irm = SimulatedIrm::new(50, 0xffff_ffff);
        assert_eq!(
            block_on(allocate_bandwidth(&irm, Generation(3), 100, 2)),
            Err(IrmError::NoResources)
        );
        assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 50);
        // The first attempt uses the seed, the second is skipped as it can't succeed.
        assert_eq!(irm.writes.get(), 1);
    }

    #[test]
    fn stale_generation_writes_nothing() {
        let irm = SimulatedIrm::new(4000, 0xffff_ffff);
        assert_eq!(
            block_on(release_bandwidth(&irm, Generation(2), 100, 2)),
            Err(IrmError::BusReset)
        );
        assert_eq!(irm.writes.get(), 0);
        assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 4000);
    }

    #[test]
    fn release_above_maximum_fails() {
        let irm = SimulatedIrm::new(4915, 0xffff_ffff);
        assert_eq!(
            block_on(release_bandwidth(&irm, Generation(3), 1, 2)),
            Err(IrmError::NoResources)
        );
        // The seed guess is wrong, and the actual value can't grow any further.
        assert_eq!(irm.writes.get(), 1);
        assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 4915);
    }

    #[test]
    fn channels() {
        let irm = SimulatedIrm::new(4915, 0x7fff_ffff);
        // Channel 0 is already taken.
        assert_eq!(
            block_on(allocate_channel(&irm, Generation(3), 0, 2)),
            Err(IrmError::NoResources)
        );
        block_on(allocate_channel(&irm, Generation(3), 1, 2)).unwrap();
        assert_eq!(irm.get(csr::CHANNELS_AVAILABLE_HI), 0x3fff_ffff);
        block_on(allocate_channel(&irm, Generation(3), 63, 2)).unwrap();
        assert_eq!(irm.get(csr::CHANNELS_AVAILABLE_LO), 0xffff_fffe);
        block_on(release_channel(&irm, Generation(3), 0, 2)).unwrap();
        assert_eq!(irm.get(csr::CHANNELS_AVAILABLE_HI), 0xbfff_ffff);
        assert!(block_on(allocate_channel(&irm, Generation(3), 64, 2)).is_err());
    }

    #[test]
    fn converges_from_any_reachable_state() {
        // Every state reachable by allocating in steps of 100 units.
        for used in (0..=49).map(|n| n * 100) {
            let irm = SimulatedIrm::new(4915 - used, 0xffff_ffff);
            let result = block_on(allocate_bandwidth(&irm, Generation(3), 100, 2));
            if 4915 - used >= 100 {
                assert_eq!(result, Ok(()));
                assert_eq!(irm.get(csr::BANDWIDTH_AVAILABLE), 4915 - used - 100);
            } else {
                assert_eq!(result, Err(IrmError::NoResources));
            }
            assert!(irm.writes.get() <= 2);

            let irm = SimulatedIrm::new(4915 - used, 0xffff_ffff);
            let result = block_on(release_bandwidth(&irm, Generation(3), 100, 2));
            if used >= 100 {
                assert_eq!(result, Ok(()));
            } else {
                assert_eq!(result, Err(IrmError::NoResources));
            }
        }
    }
}
