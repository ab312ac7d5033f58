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

//! The bus controller: bus-reset state machine and everything it coordinates.
//!
//! # Phases
//!
//! ```notrust
//! Running ──bus reset──▶ WaitingSelfIds ──self-IDs──▶ WaitingScan ──settle──▶ Scanning
//!    ▲                        │ timeout/corrupt                                  │
//!    │                        ▼                                                  ▼
//!    │                  (reset again)  ◀──────── arbitration wants a reset ── arbitration
//!    │                                                                           │
//!    └──────────────── prune timer ◀──────────────── WaitingPrune ◀──────────────┘
//! ```
//!
//! A bus reset reported by the hardware always wins over whatever is in progress. Everything
//! that belongs to the previous generation (scans, transactions) is drained.
//!
//! Resets requested by software through [`BusController::reset_bus`] are throttled, while the
//! resets that the protocol itself needs go through immediately.

use crate::address_space::{AddressSpaceError, AddressSpaces, SpaceId, SpaceWrite};
use crate::config::Config;
use crate::csr::BusInfoBlock;
use crate::devices::{Devices, Reconciled};
use crate::dispatch::{self, Inbound};
use crate::duplicates::{self, DuplicateGuids};
use crate::node_id::{Generation, Guid, NodeId, PhyId, Speed};
use crate::packet::{ExtendedTcode, Label, OutboundRequest, PacketBody, RequestKind};
use crate::phy::{PhyConfig, MAX_GAP_COUNT};
use crate::registry::{self, DeviceId, DeviceRegistry, NodeInfo, PropertyValue};
use crate::reset::{
    BusResetState, ResetError, ResetFormContext, ResetThrottle, RunState, TimerKind, TimerToken,
    Timers,
};
use crate::roles::{self, Arbitration, GapState, NodeRole};
use crate::scanner::{IrmProbe, NodeScan, ScanFailure, ScanOutcome, ScanProgress};
use crate::self_id::{self, Ingested};
use crate::topology::{SpeedEntry, Topology};
use crate::transactions::{
    CommandHandle, CompletionStatus, LabelPool, Response, Slot, TransactionError,
};
use crate::Link;

use alloc::{format, string::String, vec::Vec};
use core::{
    cmp,
    future::Future,
    iter,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use futures::channel::oneshot;
use smallvec::SmallVec;


/// What is bound to a transaction label.
enum Handler {
    /// Read issued by the scanner for the node with this physical ID.
    Scan { phy: PhyId },
    /// Transaction submitted through the public API.
    External(oneshot::Sender<Result<Response, TransactionError>>),
}

/// State of a physical ID during the current generation.
#[derive(Debug)]
enum NodeState {
    Absent,
    Local,
    Scanning(NodeScan),
    Complete {
        bus_info: BusInfoBlock,
        irm: IrmProbe,
    },
    /// The node couldn't be read, or its link is off.
    Dummy,
    /// A read failed because of a bus reset. The generation is about to be superseded.
    Abandoned,
}

/// Node designated by a caller, across resets. Physical IDs are reassigned at every reset,
/// so the pin follows the GUID when the node has been scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NodePin {
    phy: PhyId,
    guid: Option<Guid>,
}

/// Outcome of submitting a transaction.
#[derive(Debug)]
pub enum Submitted {
    /// The transaction targeted the local node and has already been served.
    Completed(Response),
    /// The request has been handed to the link.
    Pending(PendingTransaction),
}

/// Transaction in flight. Resolves when the response arrives or the transaction fails.
#[must_use]
#[derive(Debug)]
pub struct PendingTransaction {
    handle: CommandHandle,
    receiver: oneshot::Receiver<Result<Response, TransactionError>>,
}

impl PendingTransaction {
    /// Handle that the link uses to report the completion of the transaction.
    pub fn handle(&self) -> CommandHandle {
        self.handle
    }
}

impl Future for PendingTransaction {
    type Output = Result<Response, TransactionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        // The sender is only dropped without a value when its generation is drained.
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransactionError::BusReset)))
    }
}

/// Second receiver of the outcome of a transaction, returned by
/// [`BusController::submit_observed`].
#[must_use]
#[derive(Debug)]
pub struct TransactionObserver {
    receiver: oneshot::Receiver<Result<Response, TransactionError>>,
}

impl Future for TransactionObserver {
    type Output = Result<Response, TransactionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(TransactionError::BusReset)))
    }
}

/// Manages the bus on behalf of the local node.
pub struct BusController<L, R> {
    link: L,
    registry: R,
    config: Config,

    generation: Generation,
    run_state: RunState,
    throttle: ResetThrottle,
    timers: Timers,

    /// Self-IDs of the current generation, once valid.
    self_ids: Option<Ingested>,
    /// `None` if the self-IDs couldn't be turned into a tree.
    topology: Option<Topology>,
    /// Isochronous resource manager: contender with the highest physical ID.
    irm: Option<PhyId>,
    /// Indexed by physical ID.
    nodes: Vec<NodeState>,

    labels: LabelPool<Handler>,
    spaces: AddressSpaces,
    devices: Devices,
    duplicates: DuplicateGuids,

    /// Consecutive self-ID failures.
    invalid_self_ids: u32,
    /// The link has been told about persistent self-ID failures.
    self_ids_escalated: bool,
    /// PHY configuration packet to send right before the next reset.
    pending_phy_packet: Option<PhyConfig>,
    /// The next reset recovers from a gap-count mismatch.
    gap_recovery: bool,
    last_gap_set: Option<u8>,
    forced_gap: Option<u8>,
    pinned_root: Option<NodePin>,
    must_not_be_root: SmallVec<[NodePin; 4]>,
    local_must_not_be_root: bool,
    bad_irm_known: bool,
    /// The next prune follows a wake-up.
    woke_up: bool,
}

impl<L: Link, R: DeviceRegistry> BusController<L, R> {
    /// Initializes the controller. The link is assumed to have just come out of a bus reset.
    pub fn new(link: L, registry: R, config: Config) -> Self {
        let spaces = AddressSpaces::new(&config.config_rom);
        let mut controller = BusController {
            link,
            registry,
            config,
            generation: Generation::default(),
            run_state: RunState::Running,
            throttle: ResetThrottle::new(),
            timers: Timers::new(),
            self_ids: None,
            topology: None,
            irm: None,
            nodes: Vec::new(),
            labels: LabelPool::new(),
            spaces,
            devices: Devices::new(),
            duplicates: DuplicateGuids::new(),
            invalid_self_ids: 0,
            self_ids_escalated: false,
            pending_phy_packet: None,
            gap_recovery: false,
            last_gap_set: None,
            forced_gap: None,
            pinned_root: None,
            must_not_be_root: SmallVec::new(),
            local_must_not_be_root: false,
            bad_irm_known: false,
            woke_up: false,
        };

        let contender = controller.config.contender;
        controller.link.set_contender(contender);
        let cooldown = controller.config.reset_cooldown;
        controller.arm(TimerKind::ResetCooldown, cooldown);
        controller
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn bus_reset_state(&self) -> BusResetState {
        self.throttle.state()
    }

    /// Node ID of the local node, or [`NodeId::BAD`] while unknown.
    pub fn local_node_id(&self) -> NodeId {
        self.self_ids
            .as_ref()
            .map_or(NodeId::BAD, |s| s.local.node_id())
    }

    /// Node ID of the root, or [`NodeId::BAD`] while unknown.
    pub fn root_node_id(&self) -> NodeId {
        self.self_ids
            .as_ref()
            .map_or(NodeId::BAD, |s| s.root.node_id())
    }

    /// Node ID of the isochronous resource manager, or [`NodeId::BAD`] if there is none.
    pub fn irm_node_id(&self) -> NodeId {
        self.irm.map_or(NodeId::BAD, |p| p.node_id())
    }

    /// Speed of the path between two nodes of the current generation.
    pub fn speed_between(&self, a: NodeId, b: NodeId) -> Speed {
        self.speed_entry(a.phy_id(), b.phy_id()).usable_speed()
    }

    fn speed_entry(&self, a: PhyId, b: PhyId) -> SpeedEntry {
        self.topology
            .as_ref()
            .map_or(SpeedEntry::new(Speed::LOWEST, false), |t| t.speeds().get(a, b))
    }

    /// Largest payload of a block transaction towards `node`.
    pub fn max_payload(&self, generation: Generation, node: NodeId) -> Result<usize, TransactionError> {
        self.check_generation(generation)?;
        let local = self.local_node_id();
        let by_speed = self.speed_between(local, node).max_async_payload();
        let by_link = 1usize << cmp::min(self.link.max_send_log(), 16);
        let by_node = if node == local {
            Some(self.link.bus_characteristics().max_rec())
        } else {
            self.devices
                .device_at(node.phy_id())
                .and_then(|id| self.devices.get(id))
                .and_then(|record| record.bus_info.max_rec())
        };
        Ok(cmp::min(
            cmp::min(by_speed, by_link),
            by_node.unwrap_or(usize::max_value()),
        ))
    }

    /// While asleep, every generation is stale. The counter itself only moves on bus resets.
    fn check_generation(&self, generation: Generation) -> Result<(), TransactionError> {
        if generation == self.generation && self.run_state != RunState::Asleep {
            Ok(())
        } else {
            Err(TransactionError::BusReset)
        }
    }

    /// Requests a bus reset. Fires immediately unless resets are held back, in which case it
    /// fires as soon as they are allowed again.
    pub fn reset_bus(&mut self) {
        if self.throttle.request() {
            self.do_bus_reset(true);
        } else {
            log::debug!(
                "Software bus reset deferred ({:?}, {} holders)",
                self.throttle.state(),
                self.throttle.disable_count()
            );
        }
    }

    /// Holds software bus resets back until [`BusController::enable_soft_resets`] is called.
    pub fn disable_soft_resets(&mut self) -> Result<(), ResetError> {
        self.throttle.disable()
    }

    pub fn enable_soft_resets(&mut self) {
        if self.throttle.enable() {
            self.do_bus_reset(true);
        }
    }

    /// Makes `node` the root after the next reset, and requests that reset.
    pub fn make_root(&mut self, generation: Generation, node: NodeId) -> Result<(), TransactionError> {
        self.check_generation(generation)?;
        let phy = node.phy_id();
        self.pinned_root = Some(self.pin(phy));
        self.merge_phy_packet(PhyConfig {
            force_root: Some(phy),
            gap_count: None,
        });
        self.reset_bus();
        Ok(())
    }

    /// Prevents `node` from being chosen as root by arbitration, and requests a reset.
    pub fn node_must_not_be_root(
        &mut self,
        generation: Generation,
        node: NodeId,
    ) -> Result<(), TransactionError> {
        self.check_generation(generation)?;
        let phy = node.phy_id();
        if node == self.local_node_id() {
            self.local_must_not_be_root = true;
        } else if !self.must_not_be_root.iter().any(|p| p.phy == phy) {
            let pin = self.pin(phy);
            self.must_not_be_root.push(pin);
        }
        if self.pinned_root.map(|p| p.phy) == Some(phy) {
            self.pinned_root = None;
        }
        self.reset_bus();
        Ok(())
    }

    fn pin(&self, phy: PhyId) -> NodePin {
        let guid = match self.nodes.get(phy.index()) {
            Some(NodeState::Complete { bus_info, .. }) => bus_info.guid(),
            _ => None,
        };
        NodePin { phy, guid }
    }

    /// Physical ID of a pinned node in the current generation, or `None` if it left the bus.
    fn locate(&self, pin: NodePin, node_count: usize) -> Option<PhyId> {
        match pin.guid {
            Some(guid) => self
                .nodes
                .iter()
                .enumerate()
                .find_map(|(index, state)| match state {
                    NodeState::Complete { bus_info, .. } if bus_info.guid() == Some(guid) => {
                        PhyId::new(index as u8)
                    }
                    _ => None,
                }),
            None => Some(pin.phy).filter(|phy| phy.index() < node_count),
        }
    }

    /// Moves the pins to the physical IDs of the current generation, and forgets the ones whose
    /// node is gone.
    fn refresh_pins(&mut self, node_count: usize) {
        if let Some(pin) = self.pinned_root {
            self.pinned_root = match self.locate(pin, node_count) {
                Some(phy) => Some(NodePin { phy, ..pin }),
                None => {
                    log::info!("Pinned root {} left the bus", pin.phy);
                    None
                }
            };
        }

        let pins = core::mem::take(&mut self.must_not_be_root);
        let kept: SmallVec<[NodePin; 4]> = pins
            .into_iter()
            .filter_map(|pin| self.locate(pin, node_count).map(|phy| NodePin { phy, ..pin }))
            .collect();
        self.must_not_be_root = kept;
    }

    /// Forces the gap count used by arbitration. `None` goes back to the computed value.
    pub fn set_gap_count(&mut self, gap_count: Option<u8>) {
        self.forced_gap = gap_count.map(|g| cmp::min(g, MAX_GAP_COUNT));
    }

    pub fn duplicate_guids(&self) -> Vec<(Guid, Generation)> {
        self.duplicates.to_vec()
    }

    pub fn remove_duplicate_guid(&mut self, guid: Guid) -> bool {
        self.duplicates.remove(guid)
    }

    pub fn allocate_pseudo_space(&mut self, len: usize) -> Result<SpaceId, AddressSpaceError> {
        self.spaces.allocate_pseudo(len)
    }

    pub fn add_fixed_space(
        &mut self,
        base: u64,
        len: usize,
        exclusive: bool,
    ) -> Result<SpaceId, AddressSpaceError> {
        self.spaces.add_fixed(base, len, exclusive)
    }

    pub fn add_physical_space(&mut self, base: u64, len: usize) -> Result<SpaceId, AddressSpaceError> {
        self.spaces.add_physical(base, len)
    }

    pub fn remove_space(&mut self, id: SpaceId) -> Result<(), AddressSpaceError> {
        self.spaces.remove(id)
    }

    /// Base address of a space.
    pub fn space_address(&self, id: SpaceId) -> Option<u64> {
        self.spaces.get(id).map(|s| s.base())
    }

    pub fn space_data(&self, id: SpaceId) -> Option<&[u8]> {
        self.spaces.data(id)
    }

    /// Returns the writes performed into the local spaces since the last call.
    pub fn take_space_writes(&mut self) -> Vec<SpaceWrite> {
        self.spaces.take_writes()
    }

    pub fn async_read(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        length: u16,
        speed: Option<Speed>,
    ) -> Result<Submitted, TransactionError> {
        let kind = if length == 4 {
            RequestKind::ReadQuadlet
        } else {
            RequestKind::ReadBlock { length }
        };
        self.submit(generation, node, address, kind, speed)
    }

    pub fn async_write(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        data: Vec<u8>,
        speed: Option<Speed>,
    ) -> Result<Submitted, TransactionError> {
        let kind = if data.len() == 4 {
            let mut quadlet = [0; 4];
            quadlet.copy_from_slice(&data);
            RequestKind::WriteQuadlet {
                data: u32::from_be_bytes(quadlet),
            }
        } else {
            RequestKind::WriteBlock { data }
        };
        self.submit(generation, node, address, kind, speed)
    }

    pub fn async_lock(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        extended_tcode: ExtendedTcode,
        data: Vec<u8>,
        speed: Option<Speed>,
    ) -> Result<Submitted, TransactionError> {
        let kind = RequestKind::Lock {
            extended_tcode,
            data,
        };
        self.submit(generation, node, address, kind, speed)
    }

    /// Submits a transaction. Requests to the local node are served immediately.
    ///
    /// `speed` is capped by the speed of the path to the node.
    pub fn submit(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        kind: RequestKind,
        speed: Option<Speed>,
    ) -> Result<Submitted, TransactionError> {
        self.submit_inner(generation, node, address, kind, speed, None)
    }

    /// Same as [`BusController::submit`], but the outcome is also delivered to the returned
    /// observer, whichever way the transaction ends.
    pub fn submit_observed(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        kind: RequestKind,
        speed: Option<Speed>,
    ) -> Result<(Submitted, TransactionObserver), TransactionError> {
        let (sender, receiver) = oneshot::channel();
        let submitted = self.submit_inner(generation, node, address, kind, speed, Some(sender))?;
        Ok((submitted, TransactionObserver { receiver }))
    }

    fn submit_inner(
        &mut self,
        generation: Generation,
        node: NodeId,
        address: u64,
        kind: RequestKind,
        speed: Option<Speed>,
        observer: Option<oneshot::Sender<Result<Response, TransactionError>>>,
    ) -> Result<Submitted, TransactionError> {
        self.check_generation(generation)?;
        let local = self.local_node_id();
        if local == NodeId::BAD {
            return Err(TransactionError::BusReset);
        }

        if node == local {
            let response = dispatch::loopback(&mut self.spaces, generation, local, address, &kind)?;
            if let Some(observer) = observer {
                let _ = observer.send(Ok(response.clone()));
            }
            return Ok(Submitted::Completed(response));
        }

        let payload = match &kind {
            RequestKind::ReadBlock { length } => usize::from(*length),
            RequestKind::WriteBlock { data } => data.len(),
            _ => 0,
        };
        if payload > self.max_payload(generation, node)? {
            return Err(TransactionError::InvalidRequest);
        }

        let path = self.speed_between(local, node);
        let speed = speed.map_or(path, |s| cmp::min(s, path));
        let (sender, receiver) = oneshot::channel();
        let label = self.send_request(
            node,
            address,
            speed,
            kind,
            Handler::External(sender),
            observer.map(Handler::External),
        )?;
        Ok(Submitted::Pending(PendingTransaction {
            handle: CommandHandle { label, generation },
            receiver,
        }))
    }

    /// Gives up on an in-flight transaction. Its label becomes available again.
    pub fn release_label(&mut self, label: Label) {
        if let Some(slot) = self.labels.free(label) {
            fail_handlers(slot, TransactionError::Timeout);
        }
    }

    fn send_request(
        &mut self,
        destination: NodeId,
        address: u64,
        speed: Speed,
        kind: RequestKind,
        handler: Handler,
        alternate: Option<Handler>,
    ) -> Result<Label, TransactionError> {
        let label = self
            .labels
            .allocate(destination, self.generation, handler, alternate)
            .map_err(|_| TransactionError::LabelsExhausted)?;

        let request = OutboundRequest {
            destination,
            offset: address,
            speed: dispatch::request_speed(address, speed),
            label,
            generation: self.generation,
            kind,
        };
        let result = match request.kind {
            RequestKind::ReadQuadlet | RequestKind::ReadBlock { .. } => self.link.async_read(&request),
            RequestKind::WriteQuadlet { .. } | RequestKind::WriteBlock { .. } => {
                self.link.async_write(&request)
            }
            RequestKind::Lock { .. } => self.link.async_lock(&request),
        };

        if let Err(err) = result {
            log::debug!("Link refused request to {:?}: {}", destination, err);
            self.labels.free(label);
            return Err(TransactionError::Link(err));
        }
        Ok(label)
    }

    /// The hardware reports a bus reset.
    pub fn process_bus_reset(&mut self) {
        if self.run_state == RunState::Asleep {
            log::debug!("Ignoring bus reset while asleep");
            return;
        }

        self.generation = self.generation.next();
        log::info!("Bus reset, generation {}", self.generation);

        self.throttle.on_bus_reset();
        self.disarm(TimerKind::ResetStart);
        self.disarm(TimerKind::ScanSettle);
        self.disarm(TimerKind::Prune);
        let cooldown = self.config.reset_cooldown;
        self.arm(TimerKind::ResetCooldown, cooldown);

        self.drain_transactions();
        self.nodes.clear();
        self.self_ids = None;
        self.topology = None;
        self.irm = None;
        self.spaces.reset_irm_registers();
        self.devices.begin_generation();
        self.expire_devices();

        self.registry.set_property(
            registry::PROPERTY_GENERATION,
            PropertyValue::String(String::from(registry::SCAN_IN_PROGRESS)),
        );

        self.run_state = RunState::WaitingSelfIds;
        let timeout = self.config.self_id_timeout;
        self.arm(TimerKind::SelfIdTimeout, timeout);
    }

    /// Fails every transaction that doesn't belong to the current generation.
    fn drain_transactions(&mut self) {
        for (_, slot) in self.labels.drain_stale(self.generation) {
            fail_handlers(slot, TransactionError::BusReset);
        }
    }

    /// The link delivers the self-IDs of the current generation.
    ///
    /// `pairs` contains the received `(quadlet, !quadlet)` pairs, and `own` the self-ID packets
    /// of the local node.
    pub fn process_self_ids(&mut self, pairs: &[u32], own: &[u32]) {
        if self.run_state == RunState::Asleep {
            return;
        }
        if self.run_state != RunState::WaitingSelfIds {
            log::debug!("Self-IDs without bus reset in state {:?}", self.run_state);
            self.process_bus_reset();
        }
        self.disarm(TimerKind::SelfIdTimeout);

        let ingested = match self_id::ingest(pairs, own) {
            Ok(ingested) => ingested,
            Err(err) => {
                log::warn!("Corrupt self-IDs in generation {}: {}", self.generation, err);
                self.self_id_failure();
                return;
            }
        };
        self.invalid_self_ids = 0;

        if ingested.gap_count_mismatch {
            log::warn!("Inconsistent gap counts in generation {}", self.generation);
            self.merge_phy_packet(PhyConfig {
                force_root: None,
                gap_count: Some(MAX_GAP_COUNT),
            });
            self.gap_recovery = true;
        }

        self.topology = match Topology::build(&ingested.table, ingested.local, self.config.hub_port) {
            Ok(topology) => Some(topology),
            Err(err) => {
                log::warn!("Can't build topology of generation {}: {}", self.generation, err);
                None
            }
        };

        self.irm = ingested
            .table
            .phy_ids()
            .rev()
            .find(|phy| {
                ingested
                    .table
                    .packet0(*phy)
                    .map_or(false, |p| p.contender() && p.link_active())
            });

        self.registry.set_property(
            registry::PROPERTY_SELF_IDS,
            PropertyValue::Bytes(ingested.table.to_bytes()),
        );
        self.registry.set_property(
            registry::PROPERTY_NODE_ID,
            PropertyValue::Number(u64::from(ingested.local.node_id().raw())),
        );
        self.registry.set_property(
            registry::PROPERTY_SPEED,
            PropertyValue::Number(u64::from(self.link.phy_speed().mbits())),
        );

        self.nodes = (0..ingested.table.node_count())
            .map(|i| {
                if i == ingested.local.index() {
                    NodeState::Local
                } else {
                    NodeState::Absent
                }
            })
            .collect();
        self.self_ids = Some(ingested);

        self.run_state = RunState::WaitingScan;
        let settle = self.config.scan_settle_delay;
        self.arm(TimerKind::ScanSettle, settle);
    }

    /// The self-IDs of this generation are unusable.
    fn self_id_failure(&mut self) {
        self.invalid_self_ids = self.invalid_self_ids.saturating_add(1);
        if self.invalid_self_ids > self.config.invalid_self_id_threshold && !self.self_ids_escalated {
            log::error!(
                "Self-IDs invalid {} times in a row, notifying the link",
                self.invalid_self_ids
            );
            self.self_ids_escalated = true;
            self.link.notify_self_ids_invalid();
        }
        self.do_bus_reset(false);
    }

    /// A timer started through [`Link::start_timer`] has fired.
    pub fn on_timer(&mut self, token: TimerToken) {
        if !self.timers.fire(token) {
            log::debug!("Ignoring stale timer {:?}", token);
            return;
        }

        match token.kind {
            TimerKind::SelfIdTimeout => {
                log::warn!("No self-IDs received in generation {}", self.generation);
                self.self_id_failure();
            }
            TimerKind::ResetStart => {
                log::warn!("Requested bus reset never happened, issuing it again");
                self.do_bus_reset(false);
            }
            TimerKind::ResetCooldown => {
                if self.throttle.cooldown_elapsed() {
                    self.do_bus_reset(true);
                }
            }
            TimerKind::ScanSettle => {
                if self.run_state == RunState::WaitingScan {
                    self.start_scan();
                }
            }
            TimerKind::Prune => {
                if self.run_state == RunState::WaitingPrune {
                    self.prune();
                }
            }
            TimerKind::MissingCeiling => self.expire_devices(),
        }
    }

    /// Issues a reset right away, bypassing the throttle.
    fn do_bus_reset(&mut self, software_requested: bool) {
        if self.run_state == RunState::Asleep {
            return;
        }

        let phy_config_sent = match self.pending_phy_packet.take() {
            Some(packet) => {
                log::debug!("Sending PHY configuration {:?}", packet);
                match self.link.send_phy_packet(packet.encode()) {
                    Ok(()) => true,
                    Err(err) => {
                        log::error!("Can't send PHY configuration packet: {}", err);
                        false
                    }
                }
            }
            None => false,
        };

        let context = ResetFormContext {
            gap_count_recovery: self.gap_recovery,
            phy_config_sent,
            software_requested,
        };
        let form = self.config.reset_form_policy.choose(&context);
        self.gap_recovery = false;

        if let Err(err) = self.link.reset_bus(form) {
            log::error!("Link refused bus reset: {}", err);
        }
        self.throttle.on_reset_issued();

        if self.run_state != RunState::WaitingBusReset {
            self.run_state = RunState::WaitingBusResetStart;
        }
        let timeout = self.config.reset_start_timeout;
        self.arm(TimerKind::ResetStart, timeout);
    }

    fn merge_phy_packet(&mut self, packet: PhyConfig) {
        self.pending_phy_packet = Some(self.pending_phy_packet.unwrap_or_default().merge(packet));
    }

    fn start_scan(&mut self) {
        let ingested = match &self.self_ids {
            Some(i) => i,
            None => return,
        };
        self.run_state = RunState::Scanning;
        log::debug!("Scanning {} nodes", ingested.table.node_count());

        let local = ingested.local;
        let link_speed = self.link.phy_speed();
        let mut to_scan = Vec::new();
        for phy in ingested.table.phy_ids().filter(|p| *p != local) {
            let packet = match ingested.table.packet0(phy) {
                Some(p) => p,
                None => continue,
            };
            if !packet.link_active() {
                self.nodes[phy.index()] = NodeState::Dummy;
                continue;
            }

            let entry = self.speed_entry(local, phy);
            let probe_irm =
                packet.contender() && (self.irm == Some(phy) || self.config.cycle_master_capable);
            let scan = NodeScan::new(
                phy,
                self.generation,
                cmp::min(entry.speed(), link_speed),
                entry.is_verified(),
                probe_irm,
                self.must_not_be_root.iter().any(|p| p.phy == phy),
                &self.config,
            );
            self.nodes[phy.index()] = NodeState::Scanning(scan);
            to_scan.push(phy);
        }

        for phy in to_scan {
            self.issue_scan_read(phy);
        }
        self.maybe_finish_scan();
    }

    fn issue_scan_read(&mut self, phy: PhyId) {
        let read = match self.nodes.get_mut(phy.index()) {
            Some(NodeState::Scanning(scan)) => scan.current_read(),
            _ => return,
        };
        if let Err(err) = self.send_request(
            phy.node_id(),
            read.address,
            read.speed,
            read.kind,
            Handler::Scan { phy },
            None,
        ) {
            log::debug!("Node {}: can't issue scan read: {}", phy, err);
            let failure = match err {
                TransactionError::BusReset => ScanFailure::BusReset,
                _ => ScanFailure::Other,
            };
            self.drive_scan(phy, Err(failure));
        }
    }

    fn drive_scan(&mut self, phy: PhyId, event: Result<Response, ScanFailure>) {
        let progress = match self.nodes.get_mut(phy.index()) {
            Some(NodeState::Scanning(scan)) => match &event {
                Ok(response) => scan.on_response(response),
                Err(failure) => scan.on_failure(*failure),
            },
            _ => return,
        };

        match progress {
            ScanProgress::Continue => self.issue_scan_read(phy),
            ScanProgress::Done(outcome) => {
                let state = match outcome {
                    ScanOutcome::Complete {
                        bus_info,
                        irm,
                        speed,
                        speed_checked,
                    } => {
                        if speed_checked {
                            let local = self.self_ids.as_ref().map(|s| s.local);
                            if let (Some(topology), Some(local)) = (&mut self.topology, local) {
                                topology.speeds_mut().refine(local, phy, speed);
                            }
                        }
                        NodeState::Complete { bus_info, irm }
                    }
                    ScanOutcome::Dummy => NodeState::Dummy,
                    ScanOutcome::Abandoned => NodeState::Abandoned,
                };
                self.nodes[phy.index()] = state;
                self.maybe_finish_scan();
            }
        }
    }

    fn maybe_finish_scan(&mut self) {
        if self.run_state != RunState::Scanning {
            return;
        }
        if self
            .nodes
            .iter()
            .any(|n| matches!(n, NodeState::Scanning(_) | NodeState::Abandoned))
        {
            return;
        }
        self.finish_scan();
    }

    fn node_info(&self, phy: PhyId, bus_info: Option<BusInfoBlock>) -> NodeInfo {
        let local = self.self_ids.as_ref().map_or(phy, |s| s.local);
        NodeInfo {
            node_id: phy.node_id(),
            generation: self.generation,
            speed: self.speed_entry(local, phy).usable_speed(),
            self_ids: self
                .self_ids
                .as_ref()
                .map_or(Vec::new(), |s| s.table.node_bytes(phy)),
            bus_info,
        }
    }

    fn finish_scan(&mut self) {
        // Duplicate GUIDs, before any device is created.
        let guids: Vec<Guid> = self
            .nodes
            .iter()
            .filter_map(|n| match n {
                NodeState::Complete { bus_info, .. } => bus_info.guid(),
                _ => None,
            })
            .collect();
        let mut new_duplicate = false;
        for guid in duplicates::find_collisions(guids.into_iter(), self.link.guid()) {
            if self.duplicates.record(guid, self.generation) {
                log::warn!("Duplicate GUID {:?} on the bus", guid);
                new_duplicate = true;
            }
        }
        if new_duplicate {
            self.do_bus_reset(false);
            return;
        }

        for index in 0..self.nodes.len() {
            let phy = match PhyId::new(index as u8) {
                Some(p) => p,
                None => continue,
            };
            let bus_info = match &self.nodes[index] {
                NodeState::Complete { bus_info, .. } => Some(bus_info.clone()),
                NodeState::Dummy => None,
                _ => continue,
            };
            self.publish_node(phy, bus_info);
        }

        let now = self.link.now();
        for id in self.devices.suspend_missing(self.generation, now) {
            log::debug!("Device {:?} is missing", id);
            self.registry.suspend_device(id);
        }
        self.arm_missing_ceiling();

        log::info!(
            "Scan of generation {} complete: {} nodes, local {:?}, root {:?}",
            self.generation,
            self.nodes.len(),
            self.local_node_id(),
            self.root_node_id()
        );

        self.arbitrate();
    }

    /// Reports a scanned node to the registry.
    fn publish_node(&mut self, phy: PhyId, bus_info: Option<BusInfoBlock>) {
        let info = self.node_info(phy, bus_info);
        let node_id = info.node_id;
        self.registry.set_node_property(
            node_id,
            registry::PROPERTY_NODE_ID,
            PropertyValue::Number(u64::from(node_id.raw())),
        );
        self.registry.set_node_property(
            node_id,
            registry::PROPERTY_SPEED,
            PropertyValue::Number(u64::from(info.speed.mbits())),
        );
        self.registry.set_node_property(
            node_id,
            registry::PROPERTY_SELF_IDS,
            PropertyValue::Bytes(info.self_ids.clone()),
        );

        let guid = match info.guid() {
            Some(guid) if guid.is_valid() && !self.duplicates.contains(guid) => guid,
            _ => {
                self.registry.create_dummy(&info);
                return;
            }
        };

        self.registry
            .set_node_property(node_id, registry::PROPERTY_GUID, PropertyValue::Number(guid.0));
        self.registry.set_node_property(
            node_id,
            registry::PROPERTY_VENDOR_ID,
            PropertyValue::Number(u64::from(guid.vendor_id())),
        );
        if let Some(bus_info) = &info.bus_info {
            self.registry.set_node_property(
                node_id,
                registry::PROPERTY_DEVICE_ROM,
                PropertyValue::Bytes(bus_info.to_bytes()),
            );
        }

        let bus_info = match &info.bus_info {
            Some(b) => b,
            None => return,
        };
        match self.devices.reconcile(guid, node_id, self.generation, bus_info) {
            Reconciled::Created(id) => {
                log::debug!("New device {:?} with GUID {:?}", id, guid);
                self.registry.create_device(id, &info);
            }
            Reconciled::Updated(id) => self.registry.update_device(id, node_id, self.generation),
        }
    }

    fn arbitrate(&mut self) {
        if let Some(ingested) = &self.self_ids {
            let node_count = ingested.table.node_count();
            self.refresh_pins(node_count);
        }

        let ingested = match &self.self_ids {
            Some(i) => i,
            None => return,
        };
        let local = ingested.local;

        let nodes: Vec<NodeRole> = ingested
            .table
            .phy_ids()
            .filter(|p| *p != local)
            .filter_map(|phy| {
                let packet = ingested.table.packet0(phy)?;
                let (scanned, irm_probe, bus_manager_capable) = match &self.nodes[phy.index()] {
                    NodeState::Complete { bus_info, irm } => {
                        (true, *irm, bus_info.bus_manager_capable())
                    }
                    _ => (false, IrmProbe::NotProbed, false),
                };
                Some(NodeRole {
                    phy,
                    contender: packet.contender(),
                    link_active: packet.link_active(),
                    scanned,
                    irm_probe,
                    bus_manager_capable,
                    must_not_be_root: self.must_not_be_root.iter().any(|p| p.phy == phy),
                })
            })
            .collect();

        let input = Arbitration {
            nodes: &nodes,
            local,
            root: ingested.root,
            irm: self.irm,
            local_contender: self.config.contender,
            cycle_master_capable: self.config.cycle_master_capable,
            delegate_cycle_master: self.config.delegate_cycle_master,
            pinned_root: self.pinned_root.map(|p| p.phy),
            bad_irm_known: self.bad_irm_known,
            local_must_not_be_root: self.local_must_not_be_root,
            gap: GapState {
                observed: ingested.gap_count,
                consistent: !ingested.gap_count_mismatch,
                last_set: self.last_gap_set,
                forced: self.forced_gap,
                max_hops: self.topology.as_ref().map_or(0, |t| t.max_hops()),
                ping_times: self.link.ping_times(),
            },
        };
        let decision = roles::arbitrate(&input);
        let node_count = ingested.table.node_count();

        if decision.bad_irm.is_some() {
            self.bad_irm_known = true;
        }
        if let Some(contender) = decision.set_contender {
            self.link.set_contender(contender);
        }
        if decision.root_hold_off {
            self.link.set_root_hold_off(true);
        }
        if let Some(gap) = decision.gap_count_set {
            self.last_gap_set = Some(gap);
        }
        if let Some(packet) = decision.phy_config {
            self.merge_phy_packet(packet);
        }

        if decision.reset {
            log::info!("Arbitration of generation {} requires another reset", self.generation);
            self.run_state = RunState::WaitingBusReset;
            self.do_bus_reset(false);
            return;
        }

        self.link.set_cycle_master(decision.cycle_master);

        let delay = if self.woke_up {
            self.config.wake_prune_delay
        } else if node_count == 1 {
            self.config.only_node_prune_delay
        } else {
            self.config.prune_delay
        };
        self.run_state = RunState::WaitingPrune;
        self.arm(TimerKind::Prune, delay);
    }

    fn prune(&mut self) {
        let now = self.link.now();
        for id in self.devices.prune(now, self.config.device_missing_ceiling) {
            log::info!("Device {:?} removed", id);
            self.registry.terminate_device(id);
        }
        self.arm_missing_ceiling();

        if let Some(topology) = &self.topology {
            topology.attach(&mut self.registry, self.generation);
        }

        self.woke_up = false;
        self.run_state = RunState::Running;
        self.registry.set_property(
            registry::PROPERTY_GENERATION,
            PropertyValue::String(format!("{}", self.generation)),
        );
    }

    /// Terminates the devices missing for longer than the ceiling.
    fn expire_devices(&mut self) {
        let now = self.link.now();
        for id in self.devices.expire(now, self.config.device_missing_ceiling) {
            log::info!("Device {:?} missing for too long, removed", id);
            self.registry.terminate_device(id);
        }
        self.arm_missing_ceiling();
    }

    fn arm_missing_ceiling(&mut self) {
        match self.devices.next_expiry(self.config.device_missing_ceiling) {
            Some(deadline) => {
                let after = deadline
                    .checked_sub(self.link.now())
                    .unwrap_or(Duration::from_secs(0));
                self.arm(TimerKind::MissingCeiling, after);
            }
            None => self.disarm(TimerKind::MissingCeiling),
        }
    }

    /// The link delivers a packet received from the bus.
    ///
    /// A response is matched against the label of its request and the node the request was sent
    /// to. The controller owns every in-flight command, so the label is freed here before the
    /// outcome is delivered, instead of waiting for the command to release it.
    pub fn process_rcv_packet(&mut self, words: &[u32], speed: Speed) {
        let inbound = match dispatch::dispatch_inbound(words, speed, &mut self.spaces, self.generation) {
            Ok(inbound) => inbound,
            Err(err) => {
                log::debug!("Dropping undecodable packet: {}", err);
                return;
            }
        };

        match inbound {
            Inbound::Request {
                response: Some(response),
                ..
            } => {
                let result = match response.body {
                    PacketBody::ReadQuadletResponse { .. } => {
                        self.link.async_read_quad_response(&response)
                    }
                    PacketBody::ReadBlockResponse { .. } => self.link.async_read_response(&response),
                    PacketBody::LockResponse { .. } => self.link.async_lock_response(&response),
                    _ => self.link.async_write_response(&response),
                };
                if let Err(err) = result {
                    log::debug!("Can't send response to {:?}: {}", response.destination, err);
                }
            }
            Inbound::Request { response: None, .. } => {}
            Inbound::Response {
                label,
                source,
                result,
            } => {
                match self.labels.lookup(label, source) {
                    Some(slot) if slot.generation == self.generation => {}
                    _ => {
                        log::debug!(
                            "Dropping unexpected response from {:?}, label {}",
                            source,
                            label.get()
                        );
                        return;
                    }
                }
                if let Some(slot) = self.labels.free(label) {
                    self.deliver(slot.handler, result.clone());
                    if let Some(alternate) = slot.alternate {
                        self.deliver(alternate, result);
                    }
                }
            }
        }
    }

    /// The link reports that a transaction ended without a response.
    pub fn handle_async_completion(&mut self, handle: CommandHandle, status: CompletionStatus) {
        if !self.labels.is_current(handle) || handle.generation != self.generation {
            log::debug!("Ignoring completion of stale transaction {:?}", handle);
            return;
        }
        let slot = match self.labels.free(handle.label) {
            Some(slot) => slot,
            None => return,
        };

        if let Some(Handler::External(sender)) = slot.alternate {
            let _ = sender.send(Err(TransactionError::from(status.clone())));
        }
        match slot.handler {
            Handler::Scan { phy } => {
                let failure = match status {
                    CompletionStatus::Timeout { ack_pending } => ScanFailure::Timeout { ack_pending },
                    CompletionStatus::AckError => ScanFailure::Timeout { ack_pending: false },
                    CompletionStatus::BusReset => ScanFailure::BusReset,
                    CompletionStatus::Link(_) => ScanFailure::Other,
                };
                self.drive_scan(phy, Err(failure));
            }
            Handler::External(sender) => {
                let _ = sender.send(Err(TransactionError::from(status)));
            }
        }
    }

    fn deliver(&mut self, handler: Handler, result: Result<Response, TransactionError>) {
        match handler {
            Handler::Scan { phy } => {
                let event = result.map_err(|err| match err {
                    TransactionError::BusReset => ScanFailure::BusReset,
                    _ => ScanFailure::Other,
                });
                self.drive_scan(phy, event);
            }
            Handler::External(sender) => {
                let _ = sender.send(result);
            }
        }
    }

    /// The system is going to sleep. Every timer is cancelled and pending transactions fail.
    pub fn sleep(&mut self) {
        log::debug!("Going to sleep in state {:?}", self.run_state);
        for token in self.timers.disarm_all() {
            self.link.cancel_timer(token);
        }
        self.run_state = RunState::Asleep;
        for (_, slot) in self.labels.drain_all() {
            fail_handlers(slot, TransactionError::BusReset);
        }
        self.nodes.clear();
    }

    /// The system woke up and the link is ready again. Restarts with a bus reset.
    pub fn wake(&mut self) {
        if self.run_state != RunState::Asleep {
            return;
        }
        log::debug!("Waking up");
        self.run_state = RunState::Running;
        self.woke_up = true;
        self.do_bus_reset(false);
    }

    /// The registry has finished reading the ROM directory of a device.
    pub fn device_rom_read_complete(&mut self, id: DeviceId) {
        if !self.devices.rom_read_complete(id) {
            log::debug!("ROM read completion for unknown device {:?}", id);
        }
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        let (token, previous) = self.timers.arm(kind);
        if let Some(previous) = previous {
            self.link.cancel_timer(previous);
        }
        self.link.start_timer(token, after);
    }

    fn disarm(&mut self, kind: TimerKind) {
        if let Some(token) = self.timers.disarm(kind) {
            self.link.cancel_timer(token);
        }
    }
}

/// Fails the handlers of a transaction that won't get a response. Scan reads are left alone,
/// their scan is dropped with the generation.
fn fail_handlers(slot: Slot<Handler>, error: TransactionError) {
    for handler in iter::once(slot.handler).chain(slot.alternate) {
        if let Handler::External(sender) = handler {
            let _ = sender.send(Err(error.clone()));
        }
    }
}
