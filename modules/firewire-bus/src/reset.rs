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

//! Building blocks of the bus-reset state machine.
//!
//! The state machine itself lives in the controller. This module contains the phases it goes
//! through, the throttle that limits how often software is allowed to reset the bus, the
//! delayed-command bookkeeping, and the choice between the long and short reset forms.

use core::fmt;

/// Form of bus reset to ask the link for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetForm {
    /// Long bus reset (IBR), always supported.
    Long,
    /// Arbitrated short bus reset (ISBR).
    Short,
}

/// Situation in which the core is about to reset the bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ResetFormContext {
    /// The previous generation had nodes with inconsistent gap counts, and a PHY configuration
    /// packet resetting them has just been sent.
    pub gap_count_recovery: bool,
    /// A PHY configuration packet was sent right before this reset.
    pub phy_config_sent: bool,
    /// The reset was requested by software rather than by the protocol itself.
    pub software_requested: bool,
}

/// Chooses the form of each bus reset.
///
/// Some legacy devices mishandle a short reset following a long one while their gap count is
/// inconsistent, which is why this choice can be replaced.
pub trait ResetFormPolicy: fmt::Debug {
    fn choose(&mut self, context: &ResetFormContext) -> ResetForm;
}

/// Uses a long reset to recover from a gap-count mismatch, and short resets otherwise.
#[derive(Debug, Default, Copy, Clone)]
pub struct DefaultResetFormPolicy;

impl ResetFormPolicy for DefaultResetFormPolicy {
    fn choose(&mut self, context: &ResetFormContext) -> ResetForm {
        if context.gap_count_recovery {
            ResetForm::Long
        } else {
            ResetForm::Short
        }
    }
}

/// Always uses long resets.
#[derive(Debug, Default, Copy, Clone)]
pub struct AlwaysLongResetPolicy;

impl ResetFormPolicy for AlwaysLongResetPolicy {
    fn choose(&mut self, _: &ResetFormContext) -> ResetForm {
        ResetForm::Long
    }
}

/// Dominant phase of the bus manager.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    /// Steady state. Topology is known and devices are published.
    Running,
    /// A reset was issued and the hardware hasn't reported it yet.
    WaitingBusResetStart,
    /// A reset was issued after a failed arbitration, and the hardware hasn't reported it yet.
    WaitingBusReset,
    WaitingSelfIds,
    /// Self-IDs are valid. Waiting for slow devices to become responsive before scanning.
    WaitingScan,
    Scanning,
    /// Scan and arbitration are over. Waiting before terminating devices that are gone.
    WaitingPrune,
    Asleep,
}

/// Whether software-requested resets may currently fire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BusResetState {
    /// A reset happened recently. Software resets are deferred until the cooldown ends.
    Disabled,
    /// Software resets fire immediately.
    Arbitrated,
    /// A reset has been issued and not yet reported by the hardware.
    Resetting,
}

/// Error returned when disabling soft resets.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum ResetError {
    /// A reset has already been issued and can't be held back anymore.
    #[display(fmt = "bus reset is unavoidable")]
    ResetUnavoidable,
}

/// Throttles software-requested resets.
///
/// Resets triggered by the protocol itself (corrupt self-IDs, timeouts, arbitration) don't go
/// through the throttle. They only inform it through [`ResetThrottle::on_reset_issued`].
#[derive(Debug)]
pub struct ResetThrottle {
    state: BusResetState,
    /// Number of critical sections currently holding soft resets back.
    disable_count: u32,
    /// A software reset was requested and couldn't fire yet.
    pending: bool,
}

impl ResetThrottle {
    /// A fresh throttle starts as if a reset just happened.
    pub fn new() -> ResetThrottle {
        ResetThrottle {
            state: BusResetState::Disabled,
            disable_count: 0,
            pending: false,
        }
    }

    pub fn state(&self) -> BusResetState {
        self.state
    }

    pub fn disable_count(&self) -> u32 {
        self.disable_count
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Software asks for a reset. Returns `true` if it must be issued now.
    pub fn request(&mut self) -> bool {
        if self.may_fire() {
            true
        } else {
            self.pending = true;
            false
        }
    }

    /// Enters a critical section during which soft resets are held back.
    pub fn disable(&mut self) -> Result<(), ResetError> {
        if self.state == BusResetState::Resetting {
            return Err(ResetError::ResetUnavoidable);
        }
        self.disable_count += 1;
        Ok(())
    }

    /// Leaves a critical section. Returns `true` if a pending reset must be issued now.
    pub fn enable(&mut self) -> bool {
        self.disable_count = self.disable_count.saturating_sub(1);
        self.pending && self.may_fire()
    }

    /// The cooldown following a reset has elapsed. Returns `true` if a pending reset must be
    /// issued now.
    pub fn cooldown_elapsed(&mut self) -> bool {
        if self.state == BusResetState::Disabled {
            self.state = BusResetState::Arbitrated;
        }
        self.pending && self.may_fire()
    }

    /// A reset has been handed to the link.
    pub fn on_reset_issued(&mut self) {
        self.state = BusResetState::Resetting;
        self.pending = false;
    }

    /// The hardware reported a reset. Any pending request is satisfied by it.
    pub fn on_bus_reset(&mut self) {
        self.state = BusResetState::Disabled;
        self.pending = false;
    }

    fn may_fire(&self) -> bool {
        self.state == BusResetState::Arbitrated && self.disable_count == 0
    }
}

impl Default for ResetThrottle {
    fn default() -> Self {
        ResetThrottle::new()
    }
}

/// Kind of delayed command.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    SelfIdTimeout,
    ResetStart,
    ResetCooldown,
    ScanSettle,
    Prune,
    MissingCeiling,
}

impl TimerKind {
    const ALL: [TimerKind; 6] = [
        TimerKind::SelfIdTimeout,
        TimerKind::ResetStart,
        TimerKind::ResetCooldown,
        TimerKind::ScanSettle,
        TimerKind::Prune,
        TimerKind::MissingCeiling,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::SelfIdTimeout => 0,
            TimerKind::ResetStart => 1,
            TimerKind::ResetCooldown => 2,
            TimerKind::ScanSettle => 3,
            TimerKind::Prune => 4,
            TimerKind::MissingCeiling => 5,
        }
    }
}

/// Identifies one arming of a delayed command. Passed to the link when starting the timer, and
/// passed back when it fires.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub serial: u64,
}

impl fmt::Debug for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.serial)
    }
}

/// Keeps track of which delayed commands are armed.
#[derive(Debug, Default)]
pub struct Timers {
    next_serial: u64,
    armed: [Option<u64>; 6],
}

impl Timers {
    pub fn new() -> Timers {
        Timers::default()
    }

    /// Arms a timer of the given kind. Any previous token of that kind becomes stale.
    ///
    /// Returns the new token, plus the token that was replaced, if any.
    pub fn arm(&mut self, kind: TimerKind) -> (TimerToken, Option<TimerToken>) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let previous = self.armed[kind.index()].replace(serial);
        (
            TimerToken { kind, serial },
            previous.map(|serial| TimerToken { kind, serial }),
        )
    }

    /// Disarms the timer of the given kind, returning its token if it was armed.
    pub fn disarm(&mut self, kind: TimerKind) -> Option<TimerToken> {
        self.armed[kind.index()]
            .take()
            .map(|serial| TimerToken { kind, serial })
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed[kind.index()].is_some()
    }

    /// Called when a timer fires. Returns `true` and disarms it if the token is the current one.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        let slot = &mut self.armed[token.kind.index()];
        if *slot == Some(token.serial) {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Disarms everything, returning the tokens that were armed.
    pub fn disarm_all(&mut self) -> impl Iterator<Item = TimerToken> + '_ {
        let armed = &mut self.armed;
        TimerKind::ALL.iter().filter_map(move |kind| {
            armed[kind.index()]
                .take()
                .map(|serial| TimerToken { kind: *kind, serial })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_reset_waits_for_cooldown() {
        let mut throttle = ResetThrottle::new();
        assert!(!throttle.request());
        assert!(throttle.is_pending());
        assert!(throttle.cooldown_elapsed());
        throttle.on_reset_issued();
        assert_eq!(throttle.state(), BusResetState::Resetting);
        assert!(!throttle.is_pending());
    }

    #[test]
    fn critical_section_holds_resets() {
        let mut throttle = ResetThrottle::new();
        assert!(!throttle.cooldown_elapsed());
        throttle.disable().unwrap();
        throttle.disable().unwrap();
        assert!(!throttle.request());
        assert!(!throttle.enable());
        assert!(throttle.enable());
    }

    #[test]
    fn disable_fails_while_resetting() {
        let mut throttle = ResetThrottle::new();
        throttle.on_reset_issued();
        assert_eq!(throttle.disable(), Err(ResetError::ResetUnavoidable));
        throttle.on_bus_reset();
        assert!(throttle.disable().is_ok());
    }

    #[test]
    fn hardware_reset_satisfies_pending_request() {
        let mut throttle = ResetThrottle::new();
        throttle.request();
        throttle.on_bus_reset();
        assert!(!throttle.cooldown_elapsed());
    }

    #[test]
    fn stale_timer_tokens() {
        let mut timers = Timers::new();
        let (first, _) = timers.arm(TimerKind::Prune);
        let (second, replaced) = timers.arm(TimerKind::Prune);
        assert_eq!(replaced, Some(first));
        assert!(!timers.fire(first));
        assert!(timers.fire(second));
        assert!(!timers.fire(second));
    }

    #[test]
    fn disarm_all() {
        let mut timers = Timers::new();
        timers.arm(TimerKind::SelfIdTimeout);
        timers.arm(TimerKind::ResetCooldown);
        assert_eq!(timers.disarm_all().count(), 2);
        assert!(!timers.is_armed(TimerKind::SelfIdTimeout));
    }

    #[test]
    fn gap_recovery_uses_long_reset() {
        let mut policy = DefaultResetFormPolicy;
        let mut context = ResetFormContext::default();
        assert_eq!(policy.choose(&context), ResetForm::Short);
        context.gap_count_recovery = true;
        assert_eq!(policy.choose(&context), ResetForm::Long);
    }
}
