//! Device lifecycle state machine
//!
//! ```text
//!   Uninitialized --init--> Disabled --start--> Started --suspend--> Suspended
//!                              ^                  |  ^                  |
//!                              +------stop--------+  +--resume/reset----+
//! ```
//!
//! The `powered` flag (enable/disable) is orthogonal to the lifecycle states
//! and may only change while Disabled.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Uninitialized,
    Disabled,
    Started,
    Suspended,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Uninitialized => "uninitialized",
            DeviceState::Disabled => "disabled",
            DeviceState::Started => "started",
            DeviceState::Suspended => "suspended",
        };
        f.write_str(name)
    }
}

/// What a start request achieved
///
/// `Aborted` is neither success nor error: the peripheral abandoned startup
/// (supply glitch, cable pulled) and no `Started` confirmation was emitted.
/// `Deferred` means the request was queued or forwarded; the `Started`
/// notification, not this value, proves success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartStatus {
    Started,
    Aborted,
    Deferred,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    state: DeviceState,
    powered: bool,
    /// Hardware reported a bus suspend that has not been followed by resume/reset
    bus_suspended: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: DeviceState::Uninitialized,
            powered: false,
            bus_suspended: false,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn is_bus_suspended(&self) -> bool {
        self.bus_suspended
    }

    /// Started or Suspended
    pub fn is_running(&self) -> bool {
        matches!(self.state, DeviceState::Started | DeviceState::Suspended)
    }

    pub fn require(&self, op: &'static str, expected: DeviceState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    pub fn require_initialized(&self, op: &'static str) -> Result<()> {
        if self.state == DeviceState::Uninitialized {
            return Err(Error::InvalidState {
                op,
                state: self.state,
            });
        }
        Ok(())
    }

    pub fn init(&mut self) -> Result<()> {
        self.require("init", DeviceState::Uninitialized)?;
        self.state = DeviceState::Disabled;
        Ok(())
    }

    /// Returns whether the flag changed
    pub fn set_powered(&mut self, op: &'static str, powered: bool) -> Result<bool> {
        self.require(op, DeviceState::Disabled)?;
        let changed = self.powered != powered;
        self.powered = powered;
        Ok(changed)
    }

    pub fn on_started(&mut self) {
        self.state = DeviceState::Started;
        self.bus_suspended = false;
    }

    pub fn on_stopped(&mut self) {
        self.state = DeviceState::Disabled;
        self.bus_suspended = false;
    }

    /// Record a hardware-reported bus suspend; only meaningful while Started
    pub fn on_bus_suspend(&mut self) -> bool {
        if self.state != DeviceState::Started {
            return false;
        }
        self.bus_suspended = true;
        true
    }

    /// Bus activity (resume or reset) seen; returns whether Suspended was left
    pub fn on_bus_activity(&mut self) -> bool {
        self.bus_suspended = false;
        if self.state == DeviceState::Suspended {
            self.state = DeviceState::Started;
            return true;
        }
        false
    }

    /// A suspend request may only act on a suspend the hardware reported
    pub fn can_enter_suspend(&self) -> bool {
        self.state == DeviceState::Started && self.bus_suspended
    }

    pub fn on_suspended(&mut self) {
        self.state = DeviceState::Suspended;
    }
}
