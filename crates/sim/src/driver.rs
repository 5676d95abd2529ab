//! Simulated peripheral
//!
//! `SimDriver` is the hardware end of the stack. It records what the stack
//! asks of it and exposes the electrical side (pull-up, resume signalling)
//! to the simulated host through [`BusLines`].

use protocol::EndpointAddress;
use serde::Serialize;
use stack::DeviceDriver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

/// Signals shared between the peripheral and the simulated host
#[derive(Debug, Default)]
pub struct BusLines {
    pull_up: AtomicBool,
    resume: AtomicBool,
    low_power: AtomicBool,
}

impl BusLines {
    /// The device is attached and visible to the host
    pub fn is_attached(&self) -> bool {
        self.pull_up.load(Ordering::Acquire)
    }

    /// Consume a pending remote wakeup request
    pub fn take_resume(&self) -> bool {
        self.resume.swap(false, Ordering::AcqRel)
    }

    pub fn is_low_power(&self) -> bool {
        self.low_power.load(Ordering::Acquire)
    }

    /// Host drove resume or reset; the peripheral leaves low power
    pub fn wake(&self) {
        self.low_power.store(false, Ordering::Release);
    }
}

/// Counters reported in status snapshots
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverStats {
    pub starts: u32,
    pub aborted_starts: u32,
    pub control_data: u32,
    pub control_acks: u32,
    pub control_stalls: u32,
    pub transfers: u32,
    pub bytes_armed: u64,
    pub sof_enabled: bool,
    pub enabled_endpoints: Vec<u8>,
    pub stalled_endpoints: Vec<u8>,
}

pub struct SimDriver {
    enabled: bool,
    glitch_probability: f64,
    lines: Arc<BusLines>,
    stats: Arc<Mutex<DriverStats>>,
}

impl SimDriver {
    pub fn new(glitch_probability: f64) -> Self {
        Self {
            enabled: false,
            glitch_probability,
            lines: Arc::new(BusLines::default()),
            stats: Arc::new(Mutex::new(DriverStats::default())),
        }
    }

    pub fn lines(&self) -> Arc<BusLines> {
        Arc::clone(&self.lines)
    }

    pub fn stats(&self) -> Arc<Mutex<DriverStats>> {
        Arc::clone(&self.stats)
    }

    fn update(&self, f: impl FnOnce(&mut DriverStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }
}

fn toggle(list: &mut Vec<u8>, ep: EndpointAddress, on: bool) {
    let raw = ep.raw();
    list.retain(|&e| e != raw);
    if on {
        list.push(raw);
    }
}

impl DeviceDriver for SimDriver {
    fn enable(&mut self) {
        self.enabled = true;
        debug!("peripheral clocks on");
    }

    fn disable(&mut self) {
        self.enabled = false;
        debug!("peripheral clocks off");
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn start(&mut self, enable_sof: bool) -> bool {
        if self.glitch_probability > 0.0 && rand::random::<f64>() < self.glitch_probability {
            warn!("supply glitch during start, pull-up not connected");
            self.update(|s| s.aborted_starts += 1);
            return false;
        }
        self.lines.pull_up.store(true, Ordering::Release);
        self.update(|s| {
            s.starts += 1;
            s.sof_enabled = enable_sof;
        });
        true
    }

    fn stop(&mut self) {
        self.lines.pull_up.store(false, Ordering::Release);
        self.lines.low_power.store(false, Ordering::Release);
        self.update(|s| {
            s.enabled_endpoints.clear();
            s.stalled_endpoints.clear();
        });
    }

    fn set_sof_enabled(&mut self, enabled: bool) {
        self.update(|s| s.sof_enabled = enabled);
    }

    fn suspend(&mut self) -> bool {
        if !self.lines.is_attached() {
            return false;
        }
        self.lines.low_power.store(true, Ordering::Release);
        true
    }

    fn remote_wakeup(&mut self) {
        debug!("driving resume signalling");
        self.lines.resume.store(true, Ordering::Release);
    }

    fn ep_enable(&mut self, ep: EndpointAddress) {
        self.update(|s| toggle(&mut s.enabled_endpoints, ep, true));
    }

    fn ep_disable(&mut self, ep: EndpointAddress) {
        self.update(|s| toggle(&mut s.enabled_endpoints, ep, false));
    }

    fn ep_transfer(&mut self, ep: EndpointAddress, data: &[u8]) {
        trace!(%ep, len = data.len(), "endpoint armed");
        self.update(|s| {
            s.transfers += 1;
            s.bytes_armed += data.len() as u64;
        });
    }

    fn ep_stall(&mut self, ep: EndpointAddress) {
        self.update(|s| toggle(&mut s.stalled_endpoints, ep, true));
    }

    fn ep_clear_stall(&mut self, ep: EndpointAddress) {
        self.update(|s| toggle(&mut s.stalled_endpoints, ep, false));
    }

    fn ep_is_stalled(&self, ep: EndpointAddress) -> bool {
        let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.stalled_endpoints.contains(&ep.raw())
    }

    fn control_respond(&mut self, data: &[u8]) {
        trace!(len = data.len(), "control data stage");
        self.update(|s| s.control_data += 1);
    }

    fn control_ack(&mut self) {
        trace!("control status stage");
        self.update(|s| s.control_acks += 1);
    }

    fn control_stall(&mut self) {
        debug!("control pipe stalled");
        self.update(|s| s.control_stalls += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Direction;

    #[test]
    fn test_start_certain_glitch_aborts() {
        let mut driver = SimDriver::new(1.0);
        let lines = driver.lines();
        assert!(!driver.start(false));
        assert!(!lines.is_attached());
        assert_eq!(driver.stats().lock().unwrap().aborted_starts, 1);
    }

    #[test]
    fn test_start_and_resume_lines() {
        let mut driver = SimDriver::new(0.0);
        let lines = driver.lines();
        assert!(driver.start(true));
        assert!(lines.is_attached());

        assert!(driver.suspend());
        assert!(lines.is_low_power());
        driver.remote_wakeup();
        assert!(lines.take_resume());
        assert!(!lines.take_resume());

        driver.stop();
        assert!(!lines.is_attached());
        assert!(!driver.suspend());
    }

    #[test]
    fn test_stall_bookkeeping() {
        let mut driver = SimDriver::new(0.0);
        let ep = EndpointAddress::new(1, Direction::In);
        driver.ep_stall(ep);
        driver.ep_stall(ep);
        assert!(driver.ep_is_stalled(ep));
        driver.ep_clear_stall(ep);
        assert!(!driver.ep_is_stalled(ep));
    }
}
