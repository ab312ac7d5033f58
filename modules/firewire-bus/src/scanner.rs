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

//! Reading the bus-info block of a remote node.
//!
//! A [`NodeScan`] exists for every remote node while the bus is being scanned. It doesn't
//! perform any I/O by itself: [`NodeScan::current_read`] describes the read to issue, and the
//! outcome of that read is fed back through [`NodeScan::on_response`] or
//! [`NodeScan::on_failure`], which say whether to issue the next read or whether the scan of
//! this node is over.
//!
//! The progression is: ROM header, then the four remaining quadlets of the bus-info block
//! (skipped for a minimal ROM), then optionally a probe of the node's isochronous resource
//! manager registers (a read of `CHANNELS_AVAILABLE_HI` followed by a compare-swap that
//! writes back the same value).

use crate::config::Config;
use crate::csr::{self, BusInfoBlock, BUS_INFO_BLOCK_QUADLETS};
use crate::node_id::{Generation, PhyId, Speed};
use crate::packet::{ExtendedTcode, RequestKind};
use crate::transactions::Response;

use alloc::vec::Vec;

/// Read that a [`NodeScan`] wants to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRead {
    pub phy: PhyId,
    pub generation: Generation,
    pub address: u64,
    pub speed: Speed,
    pub kind: RequestKind,
}

/// Way a scan read failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanFailure {
    /// No response. `ack_pending` is true if the node acknowledged the request as pending.
    Timeout { ack_pending: bool },
    /// The bus reset. The whole scan is being superseded.
    BusReset,
    /// Any other error, such as an error response code.
    Other,
}

/// Result of probing a node's resource manager registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IrmProbe {
    NotProbed,
    /// The registers answered a read and a lock.
    Capable,
    Bad,
}

/// How the scan of a node ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The bus-info block was read.
    Complete {
        bus_info: BusInfoBlock,
        irm: IrmProbe,
        /// Speed at which the reads succeeded.
        speed: Speed,
        /// True if the speed was being checked, in which case it should now be trusted.
        speed_checked: bool,
    },
    /// The node didn't answer properly and must be represented by a dummy entry.
    Dummy,
    /// The bus reset. Nothing must be reported about this node.
    Abandoned,
}

/// What to do after feeding an event to a [`NodeScan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanProgress {
    /// Issue [`NodeScan::current_read`].
    Continue,
    Done(ScanOutcome),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Step {
    Header,
    /// Reading quadlet `index` of the bus-info block after the header.
    BusInfo { index: usize },
    IrmRead,
    IrmLock { channels: u32 },
}

/// Scan of a single remote node.
#[derive(Debug)]
pub struct NodeScan {
    phy: PhyId,
    generation: Generation,
    step: Step,
    speed: Speed,
    /// The speed comes from self-IDs that couldn't be trusted, and is being tried out.
    speed_checking: bool,
    /// Whether to probe the IRM registers once the bus-info block is read.
    probe_irm: bool,
    /// The node was pinned as "must not be root" by a caller.
    must_not_be_root: bool,
    /// Retries left at the lowest speed.
    retries_left: u8,
    /// Retries left at the current speed granted by the slow-camera workaround.
    camera_retries_left: u8,
    camera_bumped: bool,
    /// Number of reads issued so far.
    attempts: u32,
    header: u32,
    quadlets: [u32; BUS_INFO_BLOCK_QUADLETS],

    scan_retries: u8,
    camera_scan_retries: u8,
    speed_limited: bool,
}

impl NodeScan {
    /// Starts scanning a node.
    ///
    /// `speed` is the speed of the path to the node and `verified` whether it can be trusted.
    pub fn new(
        phy: PhyId,
        generation: Generation,
        speed: Speed,
        verified: bool,
        probe_irm: bool,
        must_not_be_root: bool,
        config: &Config,
    ) -> NodeScan {
        NodeScan {
            phy,
            generation,
            step: Step::Header,
            speed,
            speed_checking: !verified,
            probe_irm,
            must_not_be_root,
            retries_left: config.scan_retries,
            camera_retries_left: 0,
            camera_bumped: false,
            attempts: 0,
            header: 0,
            quadlets: [0; BUS_INFO_BLOCK_QUADLETS],
            scan_retries: config.scan_retries,
            camera_scan_retries: config.camera_scan_retries,
            speed_limited: config.speed_limited,
        }
    }

    pub fn phy(&self) -> PhyId {
        self.phy
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub fn must_not_be_root(&self) -> bool {
        self.must_not_be_root
    }

    /// True if the slow-camera workaround kicked in.
    pub fn camera_bumped(&self) -> bool {
        self.camera_bumped
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Read to issue now. Must be called exactly once per issued read.
    pub fn current_read(&mut self) -> ScanRead {
        self.attempts += 1;
        let (address, kind) = match self.step {
            Step::Header => (csr::BUS_INFO_BLOCK_HEADER, RequestKind::ReadQuadlet),
            Step::BusInfo { index } => (
                csr::BUS_INFO_BLOCK_HEADER + 4 * (index as u64 + 1),
                RequestKind::ReadQuadlet,
            ),
            Step::IrmRead => (csr::CHANNELS_AVAILABLE_HI, RequestKind::ReadQuadlet),
            Step::IrmLock { channels } => {
                let mut data = Vec::with_capacity(8);
                data.extend_from_slice(&channels.to_be_bytes());
                data.extend_from_slice(&channels.to_be_bytes());
                (
                    csr::CHANNELS_AVAILABLE_HI,
                    RequestKind::Lock {
                        extended_tcode: ExtendedTcode::CompareSwap,
                        data,
                    },
                )
            }
        };

        ScanRead {
            phy: self.phy,
            generation: self.generation,
            address,
            speed: self.speed,
            kind,
        }
    }

    /// Feeds the response to the last read.
    pub fn on_response(&mut self, response: &Response) -> ScanProgress {
        match self.step {
            Step::Header => {
                let header = match response.quadlet() {
                    Some(q) => q,
                    None => return self.on_failure(ScanFailure::Other),
                };
                // A zero-length bus-info block means the ROM isn't ready yet.
                if BusInfoBlock::header_info_length(header) == 0 {
                    log::debug!("Node {}: ROM not ready", self.phy);
                    return self.on_failure(ScanFailure::Timeout { ack_pending: false });
                }
                self.header = header;
                self.camera_retries_left = 0;
                if BusInfoBlock::header_info_length(header) == 1 {
                    self.rom_done()
                } else {
                    self.step = Step::BusInfo { index: 0 };
                    ScanProgress::Continue
                }
            }
            Step::BusInfo { index } => {
                let quadlet = match response.quadlet() {
                    Some(q) => q,
                    None => return self.on_failure(ScanFailure::Other),
                };
                self.quadlets[index] = quadlet;
                if index + 1 < BUS_INFO_BLOCK_QUADLETS {
                    self.step = Step::BusInfo { index: index + 1 };
                    ScanProgress::Continue
                } else {
                    self.rom_done()
                }
            }
            Step::IrmRead => match response.quadlet() {
                Some(channels) => {
                    self.step = Step::IrmLock { channels };
                    ScanProgress::Continue
                }
                None => self.finish(IrmProbe::Bad),
            },
            Step::IrmLock { .. } => {
                let probe = if response.quadlet().is_some() {
                    IrmProbe::Capable
                } else {
                    IrmProbe::Bad
                };
                self.finish(probe)
            }
        }
    }

    /// Feeds the failure of the last read.
    pub fn on_failure(&mut self, failure: ScanFailure) -> ScanProgress {
        let first_attempt = self.attempts <= 1;

        match (self.step, failure) {
            (_, ScanFailure::BusReset) => {
                log::debug!("Node {}: scan abandoned after bus reset", self.phy);
                ScanProgress::Done(ScanOutcome::Abandoned)
            }
            (Step::IrmRead, _) | (Step::IrmLock { .. }, _) => {
                log::debug!("Node {}: resource manager probe failed", self.phy);
                self.finish(IrmProbe::Bad)
            }
            (_, ScanFailure::Other) => ScanProgress::Done(ScanOutcome::Dummy),
            (step, ScanFailure::Timeout { ack_pending }) => {
                if step == Step::Header && first_attempt && ack_pending && !self.camera_bumped {
                    // Some cameras acknowledge the very first read as pending and need a long
                    // time before answering.
                    self.camera_bumped = true;
                    self.camera_retries_left = self.camera_scan_retries;
                    log::debug!(
                        "Node {}: slow first answer, allowing {} retries",
                        self.phy,
                        self.camera_retries_left
                    );
                }

                if self.camera_retries_left > 0 {
                    self.camera_retries_left -= 1;
                    return ScanProgress::Continue;
                }

                if let Some(lower) = self.speed.step_down() {
                    self.speed = if self.speed_limited {
                        Speed::LOWEST
                    } else {
                        lower
                    };
                    self.retries_left = self.scan_retries;
                    log::debug!("Node {}: timeout, retrying at {:?}", self.phy, self.speed);
                    return ScanProgress::Continue;
                }

                if self.retries_left > 0 {
                    self.retries_left -= 1;
                    log::debug!(
                        "Node {}: timeout, {} retries left",
                        self.phy,
                        self.retries_left
                    );
                    return ScanProgress::Continue;
                }

                ScanProgress::Done(ScanOutcome::Dummy)
            }
        }
    }

    fn rom_done(&mut self) -> ScanProgress {
        if self.probe_irm {
            self.step = Step::IrmRead;
            ScanProgress::Continue
        } else {
            self.finish(IrmProbe::NotProbed)
        }
    }

    fn finish(&mut self, irm: IrmProbe) -> ScanProgress {
        let bus_info = if BusInfoBlock::header_info_length(self.header) == 1 {
            BusInfoBlock::minimal(self.header)
        } else {
            BusInfoBlock {
                header: self.header,
                quadlets: self.quadlets,
                general: true,
            }
        };

        ScanProgress::Done(ScanOutcome::Complete {
            bus_info,
            irm,
            speed: self.speed,
            speed_checked: self.speed_checking,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadlet(q: u32) -> Response {
        Response {
            data: q.to_be_bytes().to_vec(),
        }
    }

    fn scan(speed: Speed, probe_irm: bool, config: &Config) -> NodeScan {
        NodeScan::new(
            PhyId::new(2).unwrap(),
            Generation(7),
            speed,
            true,
            probe_irm,
            false,
            config,
        )
    }

    const TIMEOUT: ScanFailure = ScanFailure::Timeout { ack_pending: false };
    const PENDING: ScanFailure = ScanFailure::Timeout { ack_pending: true };

    #[test]
    fn full_bus_info_block() {
        let config = Config::default();
        let mut scan = scan(Speed::S400, false, &config);
        let rom = [0x0404_0000, csr::BUS_NAME_1394, 0xe000_8000, 0x0001_f200, 0x1234_5678];

        for (n, q) in rom.iter().enumerate() {
            let read = scan.current_read();
            assert_eq!(read.address, csr::BUS_INFO_BLOCK_HEADER + 4 * n as u64);
            assert_eq!(read.kind, RequestKind::ReadQuadlet);
            let progress = scan.on_response(&quadlet(*q));
            if n + 1 < rom.len() {
                assert_eq!(progress, ScanProgress::Continue);
            } else {
                match progress {
                    ScanProgress::Done(ScanOutcome::Complete {
                        bus_info, speed, ..
                    }) => {
                        assert_eq!(bus_info.guid().map(|g| g.0), Some(0x0001_f200_1234_5678));
                        assert_eq!(speed, Speed::S400);
                    }
                    other => panic!("{:?}", other),
                }
            }
        }
    }

    #[test]
    fn minimal_rom() {
        let config = Config::default();
        let mut scan = scan(Speed::S200, false, &config);
        scan.current_read();
        match scan.on_response(&quadlet(0x0100_a02d)) {
            ScanProgress::Done(ScanOutcome::Complete { bus_info, .. }) => {
                assert!(!bus_info.general);
                assert_eq!(bus_info.guid(), None);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn slow_camera_bumps_retries_once() {
        let config = Config::default();
        let mut scan = scan(Speed::S400, false, &config);

        for _ in 0..3 {
            let read = scan.current_read();
            assert_eq!(read.address, csr::BUS_INFO_BLOCK_HEADER);
            assert_eq!(read.speed, Speed::S400);
            assert_eq!(scan.on_failure(PENDING), ScanProgress::Continue);
        }
        assert!(scan.camera_bumped());

        // The camera eventually answers, at the original speed.
        let read = scan.current_read();
        assert_eq!(read.speed, Speed::S400);
        assert_eq!(scan.on_response(&quadlet(0x0404_0000)), ScanProgress::Continue);
    }

    #[test]
    fn camera_budget_then_step_down_then_dummy() {
        let config = Config::default();
        let mut scan = scan(Speed::S400, false, &config);

        let mut speeds = Vec::new();
        loop {
            let read = scan.current_read();
            speeds.push(read.speed);
            match scan.on_failure(PENDING) {
                ScanProgress::Continue => {}
                ScanProgress::Done(outcome) => {
                    assert_eq!(outcome, ScanOutcome::Dummy);
                    break;
                }
            }
        }

        // First try, six camera retries, then S200, then S100 with two retries.
        let expected_len = 1 + config.camera_scan_retries as usize + 1 + 1 + config.scan_retries as usize;
        assert_eq!(speeds.len(), expected_len);
        assert!(speeds[..7].iter().all(|s| *s == Speed::S400));
        assert_eq!(speeds[7], Speed::S200);
        assert!(speeds[8..].iter().all(|s| *s == Speed::S100));
    }

    #[test]
    fn no_camera_workaround_without_ack_pending() {
        let config = Config::default();
        let mut scan = scan(Speed::S200, false, &config);
        scan.current_read();
        assert_eq!(scan.on_failure(TIMEOUT), ScanProgress::Continue);
        assert!(!scan.camera_bumped());
        assert_eq!(scan.current_read().speed, Speed::S100);
    }

    #[test]
    fn speed_limited_jumps_to_lowest() {
        let config = Config::default().with_speed_limited(true);
        let mut scan = scan(Speed::S400, false, &config);
        scan.current_read();
        assert_eq!(scan.on_failure(TIMEOUT), ScanProgress::Continue);
        assert_eq!(scan.current_read().speed, Speed::S100);
    }

    #[test]
    fn bus_reset_abandons() {
        let config = Config::default();
        let mut scan = scan(Speed::S100, false, &config);
        scan.current_read();
        assert_eq!(
            scan.on_failure(ScanFailure::BusReset),
            ScanProgress::Done(ScanOutcome::Abandoned)
        );
    }

    #[test]
    fn error_response_yields_dummy() {
        let config = Config::default();
        let mut scan = scan(Speed::S100, false, &config);
        scan.current_read();
        assert_eq!(
            scan.on_failure(ScanFailure::Other),
            ScanProgress::Done(ScanOutcome::Dummy)
        );
    }

    #[test]
    fn irm_probe() {
        let config = Config::default();
        let mut scan = scan(Speed::S100, true, &config);
        scan.current_read();
        assert_eq!(scan.on_response(&quadlet(0x0100_0000)), ScanProgress::Continue);

        let read = scan.current_read();
        assert_eq!(read.address, csr::CHANNELS_AVAILABLE_HI);
        assert_eq!(scan.on_response(&quadlet(0xffff_fffe)), ScanProgress::Continue);

        let read = scan.current_read();
        match read.kind {
            RequestKind::Lock {
                extended_tcode: ExtendedTcode::CompareSwap,
                data,
            } => assert_eq!(data, [0xff, 0xff, 0xff, 0xfe, 0xff, 0xff, 0xff, 0xfe]),
            other => panic!("{:?}", other),
        }
        match scan.on_response(&quadlet(0xffff_fffe)) {
            ScanProgress::Done(ScanOutcome::Complete { irm, .. }) => {
                assert_eq!(irm, IrmProbe::Capable)
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn unresponsive_irm_is_bad() {
        let config = Config::default();
        let mut scan = scan(Speed::S100, true, &config);
        scan.current_read();
        scan.on_response(&quadlet(0x0100_0000));
        scan.current_read();
        match scan.on_failure(TIMEOUT) {
            ScanProgress::Done(ScanOutcome::Complete { irm, .. }) => assert_eq!(irm, IrmProbe::Bad),
            other => panic!("{:?}", other),
        }
    }
}
