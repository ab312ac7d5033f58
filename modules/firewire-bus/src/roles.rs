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

//! Deciding which node must be root, and whether the gap count needs fixing.
//!
//! Runs once per generation after every node has been scanned. The outcome is either a
//! steady state, or a set of PHY-level actions followed by another bus reset, in which case
//! the whole negotiation starts again in the next generation.

use crate::node_id::PhyId;
use crate::phy::{self, PhyConfig};
use crate::scanner::IrmProbe;

use smallvec::SmallVec;

/// What arbitration knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRole {
    pub phy: PhyId,
    /// Contender bit of the self-ID packet.
    pub contender: bool,
    pub link_active: bool,
    /// The bus-info block of the node was read during this generation.
    pub scanned: bool,
    pub irm_probe: IrmProbe,
    pub bus_manager_capable: bool,
    /// A caller asked for this node never to be root.
    pub must_not_be_root: bool,
}

impl NodeRole {
    /// True if the node can reasonably be made root in place of another one.
    fn qualifies(&self) -> bool {
        self.contender
            && self.link_active
            && self.scanned
            && self.irm_probe != IrmProbe::Bad
            && !self.must_not_be_root
    }
}

/// Gap-count information of the generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapState {
    /// Gap count found in the self-IDs of the root.
    pub observed: u8,
    /// All the nodes reported the same gap count.
    pub consistent: bool,
    /// Gap count we last broadcast in a PHY configuration packet.
    pub last_set: Option<u8>,
    /// Gap count forced by a caller.
    pub forced: Option<u8>,
    pub max_hops: u8,
    pub ping_times: SmallVec<[u32; 16]>,
}

/// Everything arbitration looks at.
#[derive(Debug, Clone)]
pub struct Arbitration<'a> {
    /// Remote nodes. The local node isn't part of it.
    pub nodes: &'a [NodeRole],
    pub local: PhyId,
    pub root: PhyId,
    /// Current isochronous resource manager, if any.
    pub irm: Option<PhyId>,
    /// The local node advertises itself as contender.
    pub local_contender: bool,
    pub cycle_master_capable: bool,
    pub delegate_cycle_master: bool,
    /// Node a caller wants as root.
    pub pinned_root: Option<PhyId>,
    /// A bad resource manager was detected during a previous generation.
    pub bad_irm_known: bool,
    /// A caller asked for the local node never to be root.
    pub local_must_not_be_root: bool,
    pub gap: GapState,
}

/// Outcome of [`arbitrate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// A reset must be issued, and the generation doesn't reach steady state.
    pub reset: bool,
    /// PHY configuration packet to send before resetting.
    pub phy_config: Option<PhyConfig>,
    /// New value of the local contender bit.
    pub set_contender: Option<bool>,
    pub root_hold_off: bool,
    /// Gap count being broadcast, to remember as the last set one.
    pub gap_count_set: Option<u8>,
    /// Resource manager found unresponsive during this generation.
    pub bad_irm: Option<PhyId>,
    /// In steady state, whether the local node must act as cycle master.
    pub cycle_master: bool,
}

impl Decision {
    fn force_root(&mut self, phy: PhyId) {
        let packet = PhyConfig {
            force_root: Some(phy),
            gap_count: None,
        };
        self.phy_config = Some(self.phy_config.unwrap_or_default().merge(packet));
        self.reset = true;
    }
}

impl<'a> Arbitration<'a> {
    fn node(&self, phy: PhyId) -> Option<&NodeRole> {
        self.nodes.iter().find(|n| n.phy == phy)
    }

    /// Highest qualifying remote contender, other than `exclude`.
    fn other_contender(&self, exclude: Option<PhyId>) -> Option<PhyId> {
        self.nodes
            .iter()
            .filter(|n| n.phy != self.local && Some(n.phy) != exclude && n.qualifies())
            .map(|n| n.phy)
            .max()
    }

    /// True if another node can take over bus management duties.
    fn other_bus_manager(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.phy != self.local && n.contender && n.link_active && n.bus_manager_capable)
    }

    fn irm_is_bad(&self) -> Option<PhyId> {
        let irm = self.irm?;
        if irm == self.local {
            return None;
        }
        match self.node(irm) {
            Some(node) if node.scanned && node.irm_probe != IrmProbe::Bad => None,
            _ => Some(irm),
        }
    }
}

/// Decides what to do once all the nodes have been scanned.
pub fn arbitrate(input: &Arbitration) -> Decision {
    let mut decision = Decision::default();
    let local_is_root = input.local == input.root;

    // A caller pinned another node as root.
    if let Some(pinned) = input.pinned_root.filter(|p| *p != input.local) {
        if local_is_root {
            log::info!("Forcing pinned node {} to be root", pinned);
            decision.set_contender = Some(false);
            decision.force_root(pinned);
        }
    }

    if !decision.reset
        && (input.delegate_cycle_master || input.bad_irm_known || input.local_must_not_be_root)
    {
        let wants_to_delegate = input.delegate_cycle_master || input.local_must_not_be_root;
        match input.other_contender(None) {
            Some(other) if local_is_root && wants_to_delegate => {
                log::info!("Handing root over to contender {}", other);
                decision.set_contender = Some(false);
                decision.force_root(other);
            }
            None if input.local_contender && !local_is_root && !wants_to_delegate => {
                log::info!("No other contender, taking root");
                decision.set_contender = Some(true);
                decision.force_root(input.local);
            }
            _ => {}
        }
    }

    if !decision.reset {
        if let Some(bad) = input.irm_is_bad() {
            log::warn!("Resource manager {} is unresponsive", bad);
            decision.bad_irm = Some(bad);
            match input.other_contender(Some(bad)) {
                Some(other) => decision.force_root(other),
                None => {
                    decision.set_contender = Some(true);
                    decision.force_root(input.local);
                }
            }
        }
    }

    if decision.reset {
        return decision;
    }

    if input.irm == Some(input.local) && !input.other_bus_manager() {
        let gap = &input.gap;
        let desired = match gap.forced {
            Some(forced) => forced,
            None => phy::optimal_gap_count(gap.max_hops, &gap.ping_times),
        };
        let mismatch = !gap.consistent
            || (Some(gap.observed) != gap.last_set && gap.observed != desired);
        if mismatch {
            log::info!(
                "Gap count {} needs to become {} (consistent: {})",
                gap.observed,
                desired,
                gap.consistent
            );
            let packet = PhyConfig {
                force_root: None,
                gap_count: Some(desired),
            };
            decision.phy_config = Some(decision.phy_config.unwrap_or_default().merge(packet));
            decision.gap_count_set = Some(desired);
            decision.reset = true;
        }

        if !local_is_root && input.cycle_master_capable && !input.delegate_cycle_master {
            log::info!("Claiming root to act as cycle master");
            decision.root_hold_off = true;
            decision.force_root(input.local);
        }

        if decision.reset {
            return decision;
        }
    }

    decision.cycle_master = local_is_root && !input.delegate_cycle_master;
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phy(id: u8) -> PhyId {
        PhyId::new(id).unwrap()
    }

    fn role(id: u8, contender: bool) -> NodeRole {
        NodeRole {
            phy: phy(id),
            contender,
            link_active: true,
            scanned: true,
            irm_probe: if contender {
                IrmProbe::Capable
            } else {
                IrmProbe::NotProbed
            },
            bus_manager_capable: false,
            must_not_be_root: false,
        }
    }

    fn gap(observed: u8) -> GapState {
        GapState {
            observed,
            consistent: true,
            last_set: None,
            forced: None,
            max_hops: 1,
            ping_times: SmallVec::new(),
        }
    }

    fn base<'a>(nodes: &'a [NodeRole], local: u8, root: u8, irm: u8) -> Arbitration<'a> {
        Arbitration {
            nodes,
            local: phy(local),
            root: phy(root),
            irm: Some(phy(irm)),
            local_contender: true,
            cycle_master_capable: true,
            delegate_cycle_master: false,
            pinned_root: None,
            bad_irm_known: false,
            local_must_not_be_root: false,
            gap: gap(5),
        }
    }

    #[test]
    fn steady_state_when_root_and_gap_good() {
        let nodes = [role(0, false)];
        let input = base(&nodes, 1, 1, 1);
        let decision = arbitrate(&input);
        assert!(!decision.reset);
        assert!(decision.cycle_master);
    }

    #[test]
    fn must_not_be_root_hands_over() {
        let nodes = [role(0, true), role(1, false)];
        let mut input = base(&nodes, 2, 2, 2);
        input.local_must_not_be_root = true;
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert_eq!(decision.set_contender, Some(false));
        assert_eq!(decision.phy_config.unwrap().force_root, Some(phy(0)));
    }

    #[test]
    fn pinned_root() {
        let nodes = [role(0, false), role(1, false)];
        let mut input = base(&nodes, 2, 2, 2);
        input.pinned_root = Some(phy(1));
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert_eq!(decision.set_contender, Some(false));
        assert_eq!(decision.phy_config.unwrap().encode(), (1 << 24) | (1 << 23));
    }

    #[test]
    fn bad_irm_forces_local_root() {
        let mut irm = role(1, true);
        irm.irm_probe = IrmProbe::Bad;
        let nodes = [role(0, false), irm];
        let input = base(&nodes, 0, 1, 1);
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert_eq!(decision.bad_irm, Some(phy(1)));
        assert_eq!(decision.set_contender, Some(true));
        assert_eq!(decision.phy_config.unwrap().force_root, Some(phy(0)));
    }

    #[test]
    fn unscanned_irm_is_bad_and_other_contender_wins() {
        let mut irm = role(2, true);
        irm.scanned = false;
        let nodes = [role(1, true), irm];
        let input = base(&nodes, 0, 2, 2);
        let decision = arbitrate(&input);
        assert_eq!(decision.bad_irm, Some(phy(2)));
        assert_eq!(decision.phy_config.unwrap().force_root, Some(phy(1)));
        assert_eq!(decision.set_contender, None);
    }

    #[test]
    fn become_root_when_alone_contender() {
        let nodes = [role(1, false)];
        let mut input = base(&nodes, 0, 1, 0);
        input.bad_irm_known = true;
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert_eq!(decision.set_contender, Some(true));
        assert_eq!(decision.phy_config.unwrap().force_root, Some(phy(0)));
    }

    #[test]
    fn inconsistent_gap_count() {
        let nodes = [role(0, false)];
        let mut input = base(&nodes, 1, 1, 1);
        input.gap.consistent = false;
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert_eq!(decision.gap_count_set, Some(5));
        assert_eq!(decision.phy_config.unwrap().gap_count, Some(5));
    }

    #[test]
    fn gap_count_left_alone_when_last_set() {
        let nodes = [role(0, false)];
        let mut input = base(&nodes, 1, 1, 1);
        input.gap.observed = 9;
        input.gap.last_set = Some(9);
        assert!(!arbitrate(&input).reset);

        input.gap.last_set = None;
        let decision = arbitrate(&input);
        assert_eq!(decision.gap_count_set, Some(5));
    }

    #[test]
    fn forced_gap_count() {
        let nodes = [role(0, false)];
        let mut input = base(&nodes, 1, 1, 1);
        input.gap.forced = Some(20);
        assert_eq!(arbitrate(&input).gap_count_set, Some(20));

        input.gap.last_set = Some(20);
        input.gap.observed = 20;
        assert!(!arbitrate(&input).reset);
    }

    #[test]
    fn other_bus_manager_disables_gap_optimisation() {
        let mut other = role(0, true);
        other.bus_manager_capable = true;
        let nodes = [other];
        let mut input = base(&nodes, 1, 1, 1);
        input.gap.consistent = false;
        assert!(!arbitrate(&input).reset);
    }

    #[test]
    fn irm_claims_root() {
        let nodes = [role(1, false)];
        let input = base(&nodes, 0, 1, 0);
        let decision = arbitrate(&input);
        assert!(decision.reset);
        assert!(decision.root_hold_off);
        assert_eq!(decision.phy_config.unwrap().force_root, Some(phy(0)));
    }
}
