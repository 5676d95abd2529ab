//! SOF and remote-wakeup subscriptions
//!
//! SOF subscribers form a second chain threaded through the registry slots,
//! so per-frame dispatch visits only the interested instances. Remote wakeup
//! is a plain counter of instances that need it.

use crate::error::{Error, Result};
use crate::event::{Event, Outcome};
use crate::registry::ClassHandle;
use crate::stack::Core;
use crate::state::DeviceState;
use tracing::{debug, trace, warn};

/// Number of instances that require remote wakeup
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RwuCounter {
    count: usize,
}

impl RwuCounter {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn enabled(&self) -> bool {
        self.count > 0
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    /// Floor at zero; returns `false` if the counter was already empty
    pub fn decrement(&mut self) -> bool {
        match self.count.checked_sub(1) {
            Some(count) => {
                self.count = count;
                true
            }
            None => false,
        }
    }
}

impl Core {
    /// SOF generation is needed when configured explicitly or anyone listens
    pub(crate) fn sof_required(&self) -> bool {
        self.enable_sof || self.registry.sof_len() > 0
    }

    pub(crate) fn update_sof_enable(&mut self) {
        let enabled = self.sof_required();
        self.driver.set_sof_enabled(enabled);
        debug!(enabled, subscribers = self.registry.sof_len(), "SOF generation updated");
    }

    fn require_member(&self, op: &'static str, handle: ClassHandle) -> Result<()> {
        self.state.require(op, DeviceState::Disabled)?;
        if !self.registry.contains(handle) {
            warn!(%handle, op, "subscription for an instance that is not appended");
            return Err(Error::InvalidState {
                op,
                state: self.state.state(),
            });
        }
        Ok(())
    }

    pub(crate) fn sof_register(&mut self, handle: ClassHandle) -> Result<()> {
        self.require_member("sof_register", handle)?;
        self.registry.sof_link(handle)?;
        self.update_sof_enable();
        Ok(())
    }

    /// Works during the instance's own removal, after it left the main chain
    pub(crate) fn sof_unregister(&mut self, handle: ClassHandle) -> Result<()> {
        self.state.require("sof_unregister", DeviceState::Disabled)?;
        self.registry.sof_unlink(handle)?;
        self.update_sof_enable();
        Ok(())
    }

    /// Deliver a frame to the SOF chain only
    pub(crate) fn sof_dispatch(&mut self, frame: u16) {
        let event = Event::StartOfFrame { frame };
        let mut cursor = self.registry.sof_head();
        while let Some(handle) = cursor {
            cursor = self.registry.sof_next(handle);
            if self.registry.is_busy(handle) {
                continue;
            }
            if let Outcome::Failed(e) = self.invoke(handle, &event, None) {
                trace!(%handle, frame, error = %e, "SOF handler failed");
            }
        }
    }

    pub(crate) fn remote_wakeup_register(&mut self, handle: ClassHandle) -> Result<()> {
        self.require_member("remote_wakeup_register", handle)?;
        self.rwu.increment();
        debug!(%handle, count = self.rwu.count(), "remote wakeup requested");
        Ok(())
    }

    pub(crate) fn remote_wakeup_unregister(&mut self, handle: ClassHandle) -> Result<()> {
        self.state
            .require("remote_wakeup_unregister", DeviceState::Disabled)?;
        if !self.registry.is_live(handle) {
            return Err(Error::NotFound);
        }
        if !self.rwu.decrement() {
            warn!(%handle, "remote wakeup unregister with no registrations left");
            return Err(Error::InvalidState {
                op: "remote_wakeup_unregister (counter at zero)",
                state: self.state.state(),
            });
        }
        debug!(%handle, count = self.rwu.count(), "remote wakeup released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_floor() {
        let mut rwu = RwuCounter::default();
        assert!(!rwu.enabled());
        assert!(!rwu.decrement());
        assert_eq!(rwu.count(), 0);

        rwu.increment();
        rwu.increment();
        assert!(rwu.enabled());
        assert!(rwu.decrement());
        assert!(rwu.enabled());
        assert!(rwu.decrement());
        assert!(!rwu.enabled());
        assert!(!rwu.decrement());
    }
}
