//! Simulated host and bus
//!
//! Runs on its own thread and plays the part of the peripheral's interrupt
//! line: every bus event it produces enters the stack the way real hardware
//! would, either straight into the interrupt ring or through a channel the
//! worker turns into `isr_event` calls.

use crate::config::BusSettings;
use crate::driver::BusLines;
use anyhow::{Context, Result, bail};
use protocol::descriptor::kind;
use protocol::{EndpointAddress, FEATURE_DEVICE_REMOTE_WAKEUP, Recipient, SetupPacket};
use serde::Serialize;
use stack::{Event, InterruptHandle, TransferStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Address the host assigns during enumeration
pub const DEVICE_ADDRESS: u8 = 7;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(2);
/// Frames the host stays idle after suspending before resuming on its own
const SUSPEND_IDLE_FRAMES: u32 = 100;
const MAX_RETRIES: u32 = 50;
const RETRY_BACKOFF: Duration = Duration::from_micros(200);

/// Where bus events go
pub enum BusSink {
    /// Buffered mode: push straight into the stack's ring
    Interrupt(InterruptHandle),
    /// Immediate mode: the worker thread calls `isr_event`
    Forward(async_channel::Sender<Event>),
}

impl BusSink {
    fn deliver(&self, event: Event) -> stack::Result<()> {
        match self {
            BusSink::Interrupt(irq) => irq.raise(event),
            BusSink::Forward(tx) => tx
                .send_blocking(event)
                .map_err(|_| stack::Error::Internal("worker stopped listening".to_string())),
        }
    }
}

/// Endpoints the host exercises after configuration
#[derive(Debug, Clone, Copy)]
pub struct BusEndpoints {
    pub loopback_out: EndpointAddress,
    pub loopback_in: EndpointAddress,
    pub heartbeat_in: EndpointAddress,
}

/// What the host did, reported when the script ends
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusReport {
    pub control_requests: u32,
    pub frames: u32,
    pub transfers: u32,
    /// Deliveries refused with a full queue and retried
    pub retries: u32,
    pub suspends: u32,
    pub remote_wakeups: u32,
    pub host_resumes: u32,
    pub detached_early: bool,
}

struct Host {
    sink: BusSink,
    lines: Arc<BusLines>,
    settings: BusSettings,
    endpoints: BusEndpoints,
    stop: Arc<AtomicBool>,
    report: BusReport,
}

impl Host {
    fn frame_interval(&self) -> Duration {
        Duration::from_micros(self.settings.frame_interval_us)
    }

    fn deliver(&mut self, event: Event) -> Result<()> {
        for _ in 0..MAX_RETRIES {
            match self.sink.deliver(event) {
                Ok(()) => return Ok(()),
                Err(stack::Error::QueueFull { .. }) => {
                    self.report.retries += 1;
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(e) => return Err(e).with_context(|| format!("delivering {}", event.name())),
            }
        }
        bail!("queue stayed full while delivering {}", event.name())
    }

    fn control(&mut self, setup: SetupPacket) -> Result<()> {
        trace!(?setup, "host control request");
        self.report.control_requests += 1;
        self.deliver(Event::Setup(setup))?;
        thread::sleep(self.frame_interval());
        Ok(())
    }

    fn transfer(&mut self, ep: EndpointAddress) -> Result<()> {
        self.report.transfers += 1;
        self.deliver(Event::EndpointTransferDone {
            ep,
            status: TransferStatus::Ok,
        })
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn wait_for_attach(&self) -> Result<()> {
        let deadline = Instant::now() + ATTACH_TIMEOUT;
        while !self.lines.is_attached() {
            if self.stopping() {
                bail!("stopped before the device attached");
            }
            if Instant::now() > deadline {
                bail!("device never connected its pull-up");
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    fn enumerate(&mut self) -> Result<()> {
        self.deliver(Event::Reset)?;
        thread::sleep(self.frame_interval());

        self.control(SetupPacket::get_descriptor(kind::DEVICE, 0, 64))?;
        self.deliver(Event::Reset)?;
        self.control(SetupPacket::set_address(DEVICE_ADDRESS))?;
        self.control(SetupPacket::get_descriptor(kind::DEVICE, 0, 18))?;
        self.control(SetupPacket::get_descriptor(kind::CONFIGURATION, 0, 9))?;
        self.control(SetupPacket::get_descriptor(kind::CONFIGURATION, 0, 255))?;
        self.control(SetupPacket::get_descriptor(kind::STRING, 0, 255))?;
        self.control(SetupPacket::get_descriptor(kind::STRING, 2, 255))?;
        self.control(SetupPacket::set_configuration(1))?;
        if self.settings.remote_wakeup {
            self.control(SetupPacket::set_feature(
                Recipient::Device,
                FEATURE_DEVICE_REMOTE_WAKEUP,
                0,
            ))?;
        }
        info!(address = DEVICE_ADDRESS, "host finished enumeration");
        Ok(())
    }

    /// Stop sending SOF and wait for the device or our own timeout to resume
    fn suspend_bus(&mut self) -> Result<()> {
        debug!("host suspending the bus");
        self.report.suspends += 1;
        self.deliver(Event::Suspend)?;

        let mut woken = false;
        for _ in 0..SUSPEND_IDLE_FRAMES {
            if self.stopping() {
                return Ok(());
            }
            if self.lines.take_resume() {
                woken = true;
                break;
            }
            thread::sleep(self.frame_interval());
        }

        let low_power = self.lines.is_low_power();
        if woken {
            info!(low_power, "device signalled remote wakeup");
            self.report.remote_wakeups += 1;
        } else {
            debug!(low_power, "host resuming the bus");
            self.report.host_resumes += 1;
        }
        self.lines.wake();
        self.deliver(Event::Resume)
    }

    fn run_frames(&mut self) -> Result<()> {
        let endpoints = self.endpoints;
        for n in 0..self.settings.frames {
            if self.stopping() {
                break;
            }
            if !self.lines.is_attached() {
                warn!(frame = n, "device detached, host stops");
                self.report.detached_early = true;
                break;
            }

            self.deliver(Event::StartOfFrame {
                frame: (n & 0x7FF) as u16,
            })?;
            self.report.frames += 1;

            match n % 8 {
                0 => self.transfer(endpoints.loopback_out)?,
                1 => self.transfer(endpoints.loopback_in)?,
                _ => {}
            }
            if n % 10 == 9 {
                self.transfer(endpoints.heartbeat_in)?;
            }

            if self.settings.suspend_after_frames != 0 && n + 1 == self.settings.suspend_after_frames
            {
                self.suspend_bus()?;
            }
            thread::sleep(self.frame_interval());
        }
        Ok(())
    }

    fn run(mut self) -> Result<BusReport> {
        self.wait_for_attach()?;
        self.enumerate()?;
        self.run_frames()?;
        info!(frames = self.report.frames, "host script finished");
        Ok(self.report)
    }
}

/// Spawn the simulated host
///
/// The thread waits for the device to attach, enumerates it, then runs the
/// frame script. Setting `stop` ends it early.
pub fn spawn_bus(
    sink: BusSink,
    lines: Arc<BusLines>,
    settings: BusSettings,
    endpoints: BusEndpoints,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<Result<BusReport>>> {
    let host = Host {
        sink,
        lines,
        settings,
        endpoints,
        stop,
        report: BusReport::default(),
    };
    thread::Builder::new()
        .name("usb-bus".to_string())
        .spawn(move || host.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimDriver;
    use protocol::Direction;
    use stack::DeviceDriver;

    fn endpoints() -> BusEndpoints {
        BusEndpoints {
            loopback_out: EndpointAddress::new(1, Direction::Out),
            loopback_in: EndpointAddress::new(1, Direction::In),
            heartbeat_in: EndpointAddress::new(2, Direction::In),
        }
    }

    fn attached_lines() -> Arc<BusLines> {
        let mut driver = SimDriver::new(0.0);
        assert!(driver.start(false));
        driver.lines()
    }

    #[test]
    fn test_script_over_forward_channel() {
        let (tx, rx) = async_channel::unbounded();
        let settings = BusSettings {
            frames: 20,
            frame_interval_us: 0,
            suspend_after_frames: 10,
            start_glitch_probability: 0.0,
            remote_wakeup: false,
        };

        let handle = spawn_bus(
            BusSink::Forward(tx),
            attached_lines(),
            settings,
            endpoints(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        let report = handle.join().expect("bus thread panicked").unwrap();

        let events: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events[0], Event::Reset);
        assert_eq!(report.frames, 20);
        assert_eq!(report.suspends, 1);
        assert_eq!(report.host_resumes, 1);
        assert_eq!(report.control_requests, 8);

        let sofs = events
            .iter()
            .filter(|e| matches!(e, Event::StartOfFrame { .. }))
            .count();
        assert_eq!(sofs, 20);
        let suspend_at = events.iter().position(|e| *e == Event::Suspend).unwrap();
        assert_eq!(events[suspend_at + 1], Event::Resume);
    }

    #[test]
    fn test_never_attached_device_times_out_on_stop() {
        let (tx, _rx) = async_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(true));
        let handle = spawn_bus(
            BusSink::Forward(tx),
            Arc::new(BusLines::default()),
            BusSettings::default(),
            endpoints(),
            stop,
        )
        .unwrap();
        assert!(handle.join().expect("bus thread panicked").is_err());
    }
}
