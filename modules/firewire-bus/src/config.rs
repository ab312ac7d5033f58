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

//! Configuration of a [`BusController`](crate::BusController).

use crate::reset::{DefaultResetFormPolicy, ResetFormPolicy};

use alloc::{boxed::Box, vec::Vec};
use core::time::Duration;

/// Configuration passed to [`BusController::new`](crate::BusController::new).
///
/// The timing values only need to respect the relationships documented on each field. The
/// defaults match the values recommended by IEEE 1394a.
#[derive(Debug)]
pub struct Config {
    /// How long to wait for self-IDs after a bus reset before issuing another reset.
    pub self_id_timeout: Duration,

    /// Minimum delay between a bus reset and the next software-requested bus reset.
    /// IEEE 1394a recommends no more than one reset every two seconds.
    pub reset_cooldown: Duration,

    /// How long to wait for the hardware to report a bus reset that we have requested.
    pub reset_start_timeout: Duration,

    /// Delay between the reception of the self-IDs and the start of the bus scan. Some
    /// first-generation devices don't answer during the first ~100ms following a reset.
    pub scan_settle_delay: Duration,

    /// Delay between the end of a scan and the pruning of the devices that have disappeared.
    pub prune_delay: Duration,

    /// Same as [`Config::prune_delay`], after waking up from sleep. Must exceed the time that
    /// slow devices need to boot.
    pub wake_prune_delay: Duration,

    /// Same as [`Config::prune_delay`], when the local node is alone on the bus. No gap count
    /// reset will naturally extend the window in that situation.
    pub only_node_prune_delay: Duration,

    /// Devices that have been missing for longer than this are terminated regardless of any
    /// other timer.
    pub device_missing_ceiling: Duration,

    /// Number of consecutive self-ID failures after which the link is told that the self-IDs
    /// are persistently invalid.
    pub invalid_self_id_threshold: u32,

    /// Number of additional attempts, at the same speed, of a bus-info-block read that timed out.
    pub scan_retries: u8,

    /// Retry budget granted once to a node whose very first header read failed with an
    /// ack-pending timeout. Some cameras are that slow to answer.
    pub camera_scan_retries: u8,

    /// Number of compare-and-swap attempts of the isochronous resource allocator.
    pub irm_allocation_attempts: u8,

    /// Whether the local node advertises itself as contender.
    pub contender: bool,

    /// Whether the local node is able to act as cycle master.
    pub cycle_master_capable: bool,

    /// Whether the local node prefers another contender to be root and cycle master.
    pub delegate_cycle_master: bool,

    /// If true, speed step-downs during the scan jump directly to S100.
    pub speed_limited: bool,

    /// Port number of the local PHY that is wired to a built-in hub, if any.
    pub hub_port: Option<u8>,

    /// Quadlets of the local Configuration ROM, starting with the bus-info-block header.
    pub config_rom: Vec<u32>,

    /// Chooses between a long and a short bus reset.
    pub reset_form_policy: Box<dyn ResetFormPolicy + Send>,
}

impl Config {
    /// Sets [`Config::contender`].
    pub fn with_contender(mut self, contender: bool) -> Self {
        self.contender = contender;
        self
    }

    /// Sets [`Config::delegate_cycle_master`].
    pub fn with_delegate_cycle_master(mut self, delegate: bool) -> Self {
        self.delegate_cycle_master = delegate;
        self
    }

    /// Sets [`Config::cycle_master_capable`].
    pub fn with_cycle_master_capable(mut self, capable: bool) -> Self {
        self.cycle_master_capable = capable;
        self
    }

    /// Sets [`Config::speed_limited`].
    pub fn with_speed_limited(mut self, limited: bool) -> Self {
        self.speed_limited = limited;
        self
    }

    /// Sets [`Config::hub_port`].
    pub fn with_hub_port(mut self, port: Option<u8>) -> Self {
        self.hub_port = port;
        self
    }

    /// Sets [`Config::config_rom`].
    pub fn with_config_rom(mut self, rom: Vec<u32>) -> Self {
        self.config_rom = rom;
        self
    }

    /// Sets [`Config::reset_form_policy`].
    pub fn with_reset_form_policy(mut self, policy: impl ResetFormPolicy + Send + 'static) -> Self {
        self.reset_form_policy = Box::new(policy);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            self_id_timeout: Duration::from_secs(1),
            reset_cooldown: Duration::from_secs(2),
            reset_start_timeout: Duration::from_secs(1),
            scan_settle_delay: Duration::from_millis(100),
            prune_delay: Duration::from_secs(1),
            wake_prune_delay: Duration::from_secs(15),
            only_node_prune_delay: Duration::from_secs(3),
            device_missing_ceiling: Duration::from_secs(45),
            invalid_self_id_threshold: 5,
            scan_retries: 2,
            camera_scan_retries: 6,
            irm_allocation_attempts: 2,
            contender: true,
            cycle_master_capable: true,
            delegate_cycle_master: false,
            speed_limited: false,
            hub_port: None,
            config_rom: Vec::new(),
            reset_form_policy: Box::new(DefaultResetFormPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::reset::AlwaysLongResetPolicy;

    #[test]
    fn debug_lists_every_setting() {
        let config = Config::default()
            .with_hub_port(Some(2))
            .with_reset_form_policy(AlwaysLongResetPolicy);
        let printed = format!("{:?}", config);
        for field in &[
            "reset_start_timeout",
            "wake_prune_delay",
            "device_missing_ceiling",
            "camera_scan_retries",
            "hub_port: Some(2)",
            "config_rom",
            "reset_form_policy: AlwaysLongResetPolicy",
        ] {
            assert!(printed.contains(field), "{} missing from {}", field, printed);
        }
    }
}
