//! Test utilities for the device stack
//!
//! Provides a recording hardware driver and a scriptable class instance for
//! tests, benchmarks and doc examples.
//!
//! # Example
//!
//! ```
//! use stack::test_utils::{MockDriver, RecordingClass};
//! use stack::{StackConfig, UsbdStack};
//!
//! let (driver, probe) = MockDriver::new();
//! let mut usbd = UsbdStack::new(driver);
//! usbd.init(StackConfig::immediate()).unwrap();
//!
//! let journal = RecordingClass::journal();
//! usbd.append(Box::new(RecordingClass::new("a", &journal).with_sof())).unwrap();
//! assert!(probe.log().sof_enabled);
//! ```

use crate::class::{ClassContext, UsbClass, downcast_mut};
use crate::driver::DeviceDriver;
use crate::error::Error;
use crate::event::{Event, Outcome};
use protocol::descriptor::kind;
use protocol::EndpointAddress;
use std::sync::{Arc, Mutex, MutexGuard};

/// What the stack sent back on the control pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Data(Vec<u8>),
    Ack,
    Stall,
}

/// Commands observed by [`MockDriver`], plus scripted behaviour
#[derive(Debug, Clone, Default)]
pub struct DriverLog {
    pub enabled: bool,
    pub started: bool,
    pub sof_enabled: bool,
    /// Every `set_sof_enabled` call, in order
    pub sof_updates: Vec<bool>,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub suspend_calls: usize,
    pub wakeup_calls: usize,
    pub enabled_endpoints: Vec<EndpointAddress>,
    pub stalled: Vec<EndpointAddress>,
    pub responses: Vec<ControlResponse>,
    pub transfers: Vec<(EndpointAddress, Vec<u8>)>,
    /// Next `start` reports an aborted startup
    pub glitch_next_start: bool,
    /// `suspend` reports that bus activity resumed
    pub refuse_suspend: bool,
}

fn lock(log: &Mutex<DriverLog>) -> MutexGuard<'_, DriverLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}

/// Hardware stand-in that records every command
pub struct MockDriver {
    log: Arc<Mutex<DriverLog>>,
}

/// Test-side view of a [`MockDriver`] that was moved into the stack
#[derive(Clone)]
pub struct DriverProbe {
    log: Arc<Mutex<DriverLog>>,
}

impl MockDriver {
    pub fn new() -> (Self, DriverProbe) {
        let log = Arc::new(Mutex::new(DriverLog::default()));
        (
            Self {
                log: Arc::clone(&log),
            },
            DriverProbe { log },
        )
    }
}

impl DriverProbe {
    /// Snapshot of everything recorded so far
    pub fn log(&self) -> DriverLog {
        lock(&self.log).clone()
    }

    pub fn glitch_next_start(&self) {
        lock(&self.log).glitch_next_start = true;
    }

    pub fn refuse_suspend(&self, refuse: bool) {
        lock(&self.log).refuse_suspend = refuse;
    }

    /// Drain the control responses recorded so far
    pub fn take_responses(&self) -> Vec<ControlResponse> {
        std::mem::take(&mut lock(&self.log).responses)
    }

    pub fn last_response(&self) -> Option<ControlResponse> {
        lock(&self.log).responses.last().cloned()
    }
}

impl DeviceDriver for MockDriver {
    fn enable(&mut self) {
        lock(&self.log).enabled = true;
    }

    fn disable(&mut self) {
        lock(&self.log).enabled = false;
    }

    fn is_enabled(&self) -> bool {
        lock(&self.log).enabled
    }

    fn start(&mut self, enable_sof: bool) -> bool {
        let mut log = lock(&self.log);
        log.start_calls += 1;
        if std::mem::take(&mut log.glitch_next_start) {
            return false;
        }
        log.started = true;
        log.sof_enabled = enable_sof;
        true
    }

    fn stop(&mut self) {
        let mut log = lock(&self.log);
        log.stop_calls += 1;
        log.started = false;
    }

    fn set_sof_enabled(&mut self, enabled: bool) {
        let mut log = lock(&self.log);
        log.sof_enabled = enabled;
        log.sof_updates.push(enabled);
    }

    fn suspend(&mut self) -> bool {
        let mut log = lock(&self.log);
        log.suspend_calls += 1;
        !log.refuse_suspend
    }

    fn remote_wakeup(&mut self) {
        lock(&self.log).wakeup_calls += 1;
    }

    fn ep_enable(&mut self, ep: EndpointAddress) {
        let mut log = lock(&self.log);
        if !log.enabled_endpoints.contains(&ep) {
            log.enabled_endpoints.push(ep);
        }
    }

    fn ep_disable(&mut self, ep: EndpointAddress) {
        lock(&self.log).enabled_endpoints.retain(|e| *e != ep);
    }

    fn ep_transfer(&mut self, ep: EndpointAddress, data: &[u8]) {
        lock(&self.log).transfers.push((ep, data.to_vec()));
    }

    fn ep_stall(&mut self, ep: EndpointAddress) {
        let mut log = lock(&self.log);
        if !log.stalled.contains(&ep) {
            log.stalled.push(ep);
        }
    }

    fn ep_clear_stall(&mut self, ep: EndpointAddress) {
        lock(&self.log).stalled.retain(|e| *e != ep);
    }

    fn ep_is_stalled(&self, ep: EndpointAddress) -> bool {
        lock(&self.log).stalled.contains(&ep)
    }

    fn control_respond(&mut self, data: &[u8]) {
        lock(&self.log)
            .responses
            .push(ControlResponse::Data(data.to_vec()));
    }

    fn control_ack(&mut self) {
        lock(&self.log).responses.push(ControlResponse::Ack);
    }

    fn control_stall(&mut self) {
        lock(&self.log).responses.push(ControlResponse::Stall);
    }
}

/// One event seen by a [`RecordingClass`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub label: String,
    pub event: Event,
    /// Delivered through an endpoint handler override
    pub via_override: bool,
}

/// Journal shared by several recording instances to observe ordering
pub type Journal = Arc<Mutex<Vec<JournalEntry>>>;

/// Scriptable class instance that records every event it receives
pub struct RecordingClass {
    label: String,
    blob: Vec<u8>,
    journal: Journal,
    reply: Outcome,
    fail_append: Option<Error>,
    sof: bool,
    rwu: bool,
    unregister_on_remove: bool,
    /// SOF events received
    pub frames: u32,
    /// Errors returned by context calls made from inside the handler
    pub errors: Vec<Error>,
}

impl RecordingClass {
    pub fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    /// Labels and events in the order they were recorded
    pub fn entries(journal: &Journal) -> Vec<JournalEntry> {
        journal.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Labels that received `event`, in order
    pub fn receivers(journal: &Journal, event: &Event) -> Vec<String> {
        Self::entries(journal)
            .into_iter()
            .filter(|entry| entry.event == *event)
            .map(|entry| entry.label)
            .collect()
    }

    /// An instance with an empty blob that declines every request
    pub fn new(label: &str, journal: &Journal) -> Self {
        Self {
            label: label.to_string(),
            blob: Vec::new(),
            journal: Arc::clone(journal),
            reply: Outcome::Declined,
            fail_append: None,
            sof: false,
            rwu: false,
            unregister_on_remove: true,
            frames: 0,
            errors: Vec::new(),
        }
    }

    /// Add an interface with the given endpoints to the blob
    pub fn with_interface(mut self, iface: u8, endpoints: &[u8]) -> Self {
        self.blob.extend(interface_blob(iface, endpoints));
        self
    }

    pub fn with_descriptors(mut self, blob: Vec<u8>) -> Self {
        self.blob = blob;
        self
    }

    /// Reply to Setup and transfer events
    pub fn with_outcome(mut self, reply: Outcome) -> Self {
        self.reply = reply;
        self
    }

    /// Refuse the append notification
    pub fn failing_append(mut self, error: Error) -> Self {
        self.fail_append = Some(error);
        self
    }

    /// Subscribe to SOF when appended
    pub fn with_sof(mut self) -> Self {
        self.sof = true;
        self
    }

    /// Register for remote wakeup when appended
    pub fn with_rwu(mut self) -> Self {
        self.rwu = true;
        self
    }

    /// Leave SOF/RWU registrations behind on removal
    pub fn forget_unregister(mut self) -> Self {
        self.unregister_on_remove = false;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn record(&self, event: &Event, via_override: bool) {
        self.journal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(JournalEntry {
                label: self.label.clone(),
                event: *event,
                via_override,
            });
    }

    /// Endpoint handler override for tests
    pub fn override_handler(
        class: &mut dyn UsbClass,
        _ctx: &mut ClassContext<'_>,
        event: &Event,
    ) -> Outcome {
        match downcast_mut::<RecordingClass>(class) {
            Some(this) => {
                this.record(event, true);
                this.reply.clone()
            }
            None => Outcome::Failed(Error::InvalidParam("override installed on a foreign class")),
        }
    }
}

impl UsbClass for RecordingClass {
    fn descriptors(&self) -> &[u8] {
        &self.blob
    }

    fn event(&mut self, ctx: &mut ClassContext<'_>, event: &Event) -> Outcome {
        self.record(event, false);
        match event {
            Event::InstanceAppended => {
                if let Some(e) = self.fail_append.clone() {
                    return Outcome::Failed(e);
                }
                if self.sof
                    && let Err(e) = ctx.sof_register()
                {
                    self.errors.push(e);
                }
                if self.rwu
                    && let Err(e) = ctx.remote_wakeup_register()
                {
                    self.errors.push(e);
                }
                Outcome::ack()
            }
            Event::InstanceRemoved => {
                if self.unregister_on_remove {
                    if self.sof
                        && let Err(e) = ctx.sof_unregister()
                    {
                        self.errors.push(e);
                    }
                    if self.rwu
                        && let Err(e) = ctx.remote_wakeup_unregister()
                    {
                        self.errors.push(e);
                    }
                }
                Outcome::ack()
            }
            Event::StartOfFrame { .. } => {
                self.frames += 1;
                Outcome::ack()
            }
            Event::Setup(_) | Event::EndpointTransferDone { .. } => self.reply.clone(),
            _ => Outcome::ack(),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Vendor-specific interface descriptor followed by bulk endpoint descriptors
pub fn interface_blob(iface: u8, endpoints: &[u8]) -> Vec<u8> {
    let mut blob = vec![
        9,
        kind::INTERFACE,
        iface,
        0,
        endpoints.len() as u8,
        0xFF,
        0,
        0,
        0,
    ];
    for &ep in endpoints {
        blob.extend_from_slice(&[7, kind::ENDPOINT, ep, 0x02, 64, 0, 0]);
    }
    blob
}
