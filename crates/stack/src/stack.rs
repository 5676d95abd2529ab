//! The stack context object
//!
//! [`UsbdStack`] owns everything: the registry, the dispatch table, the
//! subscriptions, the state machine, the hardware driver and the event
//! bridge. Application code drives it from task context; the peripheral
//! feeds it through [`UsbdStack::isr_event`] or an [`InterruptHandle`].

use crate::bridge::{Bridge, InterruptHandle, StateNotifier};
use crate::class::{self, EndpointHandler, UsbClass};
use crate::config::{Delivery, StackConfig};
use crate::dispatch::{BindingView, DispatchTable};
use crate::driver::DeviceDriver;
use crate::error::{Error, Result};
use crate::event::{Event, Outcome};
use crate::registry::{ClassHandle, Registry};
use crate::state::{DeviceState, StartStatus, StateMachine};
use crate::std_request::{BusState, ControlState};
use crate::subscription::RwuCounter;
use protocol::{EndpointAddress, SetupPacket};
use tracing::{debug, error, info, trace, warn};

/// Everything a running class handler may reach through its context
pub(crate) struct Core {
    pub(crate) registry: Registry,
    pub(crate) table: DispatchTable,
    pub(crate) rwu: RwuCounter,
    pub(crate) state: StateMachine,
    pub(crate) control: ControlState,
    pub(crate) driver: Box<dyn DeviceDriver>,
    pub(crate) enable_sof: bool,
    pub(crate) faulted: Option<String>,
}

impl Core {
    fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            registry: Registry::new(),
            table: DispatchTable::new(),
            rwu: RwuCounter::default(),
            state: StateMachine::new(),
            control: ControlState::default(),
            driver,
            enable_sof: false,
            faulted: None,
        }
    }

    pub(crate) fn check_healthy(&self) -> Result<()> {
        match &self.faulted {
            Some(reason) => Err(Error::Internal(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn fault(&mut self, reason: String) {
        error!(%reason, "USB stack faulted, refusing further I/O");
        self.faulted = Some(reason);
    }
}

pub struct UsbdStack {
    core: Core,
    bridge: Bridge,
    notifier: Option<StateNotifier>,
}

impl UsbdStack {
    /// Wrap a peripheral driver; the stack starts Uninitialized
    pub fn new(driver: impl DeviceDriver + 'static) -> Self {
        Self::with_driver(Box::new(driver))
    }

    pub fn with_driver(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            core: Core::new(driver),
            bridge: Bridge::Unset,
            notifier: None,
        }
    }

    // ===== lifecycle =====

    pub fn init(&mut self, config: StackConfig) -> Result<()> {
        self.core.state.require("init", DeviceState::Uninitialized)?;

        let StackConfig {
            delivery,
            state_notifier,
            enable_sof,
            self_powered,
        } = config;

        let bridge = match delivery {
            Delivery::Immediate { forward } => Bridge::Immediate { forward },
            Delivery::Buffered {
                capacity,
                isr_observer,
            } => Bridge::Buffered(InterruptHandle::new(capacity, isr_observer)?),
        };

        self.core.state.init()?;
        self.bridge = bridge;
        self.notifier = state_notifier;
        self.core.enable_sof = enable_sof;
        self.core.control.self_powered = self_powered;

        info!(
            buffered = matches!(self.bridge, Bridge::Buffered(_)),
            enable_sof, "USB stack initialized"
        );
        Ok(())
    }

    /// Teardown is not part of the contract; always fails, nothing changes
    ///
    /// Use [`UsbdStack::shutdown`] to take the stack apart instead.
    pub fn uninit(&mut self) -> Result<()> {
        Err(Error::NotSupported("uninit"))
    }

    /// Stop, detach every instance, power down and hand back the driver
    pub fn shutdown(mut self) -> Box<dyn DeviceDriver> {
        if let Err(e) = self.process_stop() {
            warn!(error = %e, "stop during shutdown failed");
        }
        if self.core.state.state() != DeviceState::Uninitialized {
            if let Err(e) = self.core.remove_all() {
                warn!(error = %e, "detaching classes during shutdown failed");
            }
            if let Ok(true) = self.core.state.set_powered("shutdown", false) {
                self.core.driver.disable();
            }
        }
        info!("USB stack shut down");
        self.core.driver
    }

    pub fn enable(&mut self) -> Result<()> {
        self.core.state.require_initialized("enable")?;
        if self.core.state.set_powered("enable", true)? {
            self.core.driver.enable();
            debug!("peripheral powered");
        }
        Ok(())
    }

    pub fn disable(&mut self) -> Result<()> {
        self.core.state.require_initialized("disable")?;
        if self.core.state.set_powered("disable", false)? {
            self.core.driver.disable();
            debug!("peripheral released");
        }
        Ok(())
    }

    /// Request startup
    ///
    /// `Started` is only reported when startup completed inline. With a
    /// queue or forward hook the request is `Deferred` and the `Started`
    /// notification is the real confirmation; it may never come if the
    /// peripheral aborts.
    pub fn start(&mut self) -> Result<StartStatus> {
        self.core.check_healthy()?;
        self.core.state.require_initialized("start")?;
        if !self.core.state.is_powered() {
            return Err(Error::InvalidState {
                op: "start (peripheral not enabled)",
                state: self.core.state.state(),
            });
        }
        if self.defer(Event::StartRequested)? {
            return Ok(StartStatus::Deferred);
        }
        self.process_start()
    }

    /// Stopping an already stopped stack does nothing
    pub fn stop(&mut self) -> Result<()> {
        self.core.state.require_initialized("stop")?;
        if self.defer(Event::StopRequested)? {
            return Ok(());
        }
        self.process_stop()
    }

    /// Enter low power after the hardware reported a bus suspend
    ///
    /// Returns whether the request was taken. Inline processing reports
    /// `false` when there was no reported suspend to act on.
    pub fn suspend_request(&mut self) -> Result<bool> {
        self.core.state.require_initialized("suspend_request")?;
        if self.defer(Event::SuspendRequested)? {
            return Ok(true);
        }
        self.process_suspend()
    }

    /// Ask the host to resume the bus
    ///
    /// `true` means accepted for processing, not awake; the `Resume` event
    /// confirms. `false` when the host has not enabled remote wakeup.
    pub fn wakeup_request(&mut self) -> Result<bool> {
        self.core.state.require_initialized("wakeup_request")?;
        if !self.core.control.remote_wakeup {
            debug!("wakeup request ignored, host did not enable remote wakeup");
            return Ok(false);
        }
        if !self.defer(Event::WakeupRequested)? {
            self.process_wakeup()?;
        }
        Ok(true)
    }

    fn process_start(&mut self) -> Result<StartStatus> {
        if self.core.state.is_running() {
            debug!("start requested while already running");
            return Ok(StartStatus::Started);
        }
        self.core.state.require("start", DeviceState::Disabled)?;
        if !self.core.state.is_powered() {
            return Err(Error::InvalidState {
                op: "start (peripheral not enabled)",
                state: self.core.state.state(),
            });
        }

        let sof = self.core.sof_required();
        if !self.core.driver.start(sof) {
            warn!("peripheral abandoned startup, staying disabled");
            return Ok(StartStatus::Aborted);
        }

        self.core.state.on_started();
        info!(sof, "USB device started");
        self.core.all_call(&Event::Started);
        self.notify(&Event::Started);
        Ok(StartStatus::Started)
    }

    fn process_stop(&mut self) -> Result<()> {
        if !self.core.state.is_running() {
            trace!("stop requested while not running");
            return Ok(());
        }
        self.core.driver.stop();
        self.core.state.on_stopped();
        self.core.control.reset();
        info!("USB device stopped");
        self.core.all_call(&Event::Stopped);
        self.notify(&Event::Stopped);
        Ok(())
    }

    fn process_suspend(&mut self) -> Result<bool> {
        if !self.core.state.can_enter_suspend() {
            debug!(state = %self.core.state.state(), "suspend request without a bus suspend, ignored");
            return Ok(false);
        }
        if !self.core.driver.suspend() {
            debug!("bus activity resumed before entering low power");
            return Ok(false);
        }
        self.core.state.on_suspended();
        info!("USB device suspended");
        Ok(true)
    }

    fn process_wakeup(&mut self) -> Result<()> {
        let suspended = self.core.state.state() == DeviceState::Suspended
            || (self.core.state.state() == DeviceState::Started
                && self.core.state.is_bus_suspended());
        if !suspended {
            debug!(state = %self.core.state.state(), "wakeup requested on an active bus");
            return Ok(());
        }
        self.core.driver.remote_wakeup();
        info!("remote wakeup signalled");
        Ok(())
    }

    /// Route a request through the bridge
    ///
    /// Returns `true` when the event was queued or forwarded and `false`
    /// when the caller must execute it inline.
    fn defer(&mut self, event: Event) -> Result<bool> {
        match &mut self.bridge {
            Bridge::Unset => Err(Error::InvalidState {
                op: event.name(),
                state: self.core.state.state(),
            }),
            Bridge::Immediate { forward: None } => Ok(false),
            Bridge::Immediate {
                forward: Some(forward),
            } => {
                forward(event);
                Ok(true)
            }
            Bridge::Buffered(handle) => {
                handle.post(event)?;
                Ok(true)
            }
        }
    }

    fn notify(&mut self, event: &Event) {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier(event);
        }
    }

    // ===== event path =====

    /// Entry point for raw bus events from interrupt context
    pub fn isr_event(&mut self, event: Event) -> Result<()> {
        self.core.check_healthy()?;
        self.core.state.require_initialized("isr_event")?;
        if !event.is_bus_event() {
            return Err(Error::InvalidParam("only bus events enter through isr_event"));
        }

        if let Bridge::Immediate { forward: None } = self.bridge {
            return self.event_execute(event);
        }
        match &mut self.bridge {
            Bridge::Immediate {
                forward: Some(forward),
            } => {
                forward(event);
                Ok(())
            }
            Bridge::Buffered(handle) => handle.raise(event),
            _ => Err(Error::InvalidState {
                op: "isr_event",
                state: self.core.state.state(),
            }),
        }
    }

    /// Fully dispatch one event in the current context
    ///
    /// Called by the pump for queued events, and by forward-hook owners for
    /// the events they were handed.
    pub fn event_execute(&mut self, event: Event) -> Result<()> {
        self.core.check_healthy()?;
        if event.is_bus_event() && !self.core.state.is_running() {
            debug!(event = event.name(), "bus event while not running, dropped");
            return Ok(());
        }

        match event {
            Event::Setup(setup) => {
                self.core.handle_setup(setup);
            }
            Event::StartOfFrame { frame } => {
                self.core.sof_dispatch(frame);
                if self.core.enable_sof {
                    self.notify(&event);
                }
            }
            Event::Reset => {
                self.core.state.on_bus_activity();
                self.core.control.reset();
                debug!("bus reset");
                self.core.all_call(&event);
                self.notify(&event);
            }
            Event::Suspend => {
                if self.core.state.on_bus_suspend() {
                    debug!("bus suspend reported");
                    self.core.all_call(&event);
                    self.notify(&event);
                } else {
                    trace!(state = %self.core.state.state(), "bus suspend ignored");
                }
            }
            Event::Resume => {
                if self.core.state.on_bus_activity() {
                    info!("USB device resumed");
                }
                self.core.all_call(&event);
                self.notify(&event);
            }
            Event::EndpointTransferDone { ep, status } => {
                if let Outcome::Failed(e) = self.core.ep_call(ep, &event) {
                    warn!(%ep, ?status, error = %e, "transfer completion not handled");
                }
            }
            Event::StartRequested => {
                let status = self.process_start()?;
                trace!(?status, "deferred start processed");
            }
            Event::StopRequested => self.process_stop()?,
            Event::SuspendRequested => {
                self.process_suspend()?;
            }
            Event::WakeupRequested => self.process_wakeup()?,
            Event::InstanceAppended | Event::InstanceRemoved | Event::Started | Event::Stopped => {
                return Err(Error::InvalidParam("notification events cannot be executed"));
            }
        }
        Ok(())
    }

    /// Pump: execute at most one queued event
    ///
    /// Returns whether an event was available. Never blocks.
    pub fn process_queue(&mut self) -> Result<bool> {
        self.core.check_healthy()?;
        let Some(event) = (match &self.bridge {
            Bridge::Buffered(handle) => handle.pop(),
            _ => None,
        }) else {
            return Ok(false);
        };

        if let Err(e) = self.event_execute(event) {
            if e.is_fatal() {
                return Err(e);
            }
            warn!(event = event.name(), error = %e, "queued event failed");
        }
        Ok(true)
    }

    /// Producer handle for interrupt context; `None` unless buffered
    pub fn interrupt_handle(&self) -> Option<InterruptHandle> {
        self.bridge.interrupt_handle()
    }

    pub fn queue_len(&self) -> usize {
        self.bridge.queue_len()
    }

    // ===== class registry =====

    pub fn append(&mut self, class: Box<dyn UsbClass>) -> Result<ClassHandle> {
        self.core.append(class)
    }

    pub fn remove(&mut self, handle: ClassHandle) -> Result<Box<dyn UsbClass>> {
        self.core.remove(handle)
    }

    /// Detach every instance; a failure faults the stack
    pub fn remove_all(&mut self) -> Result<Vec<Box<dyn UsbClass>>> {
        let result = self.core.remove_all();
        if self.core.faulted.is_some() {
            self.bridge.poison();
        }
        result
    }

    /// Handles in chain order
    pub fn classes(&self) -> Vec<ClassHandle> {
        self.core.registry.iter().collect()
    }

    pub fn class<T: UsbClass>(&self, handle: ClassHandle) -> Option<&T> {
        self.core
            .registry
            .class_ref(handle)
            .and_then(class::downcast_ref::<T>)
    }

    pub fn class_mut<T: UsbClass>(&mut self, handle: ClassHandle) -> Option<&mut T> {
        self.core
            .registry
            .class_mut(handle)
            .and_then(class::downcast_mut::<T>)
    }

    pub fn find_descriptor(
        &self,
        handle: ClassHandle,
        descriptor_type: u8,
        index: u8,
    ) -> Result<Option<&[u8]>> {
        self.core.find_descriptor(handle, descriptor_type, index)
    }

    pub fn set_endpoint_handler(
        &mut self,
        owner: ClassHandle,
        ep: EndpointAddress,
        handler: EndpointHandler,
    ) -> Result<()> {
        self.core.set_endpoint_handler(owner, ep, handler)
    }

    /// Live interface/endpoint bindings
    pub fn bindings(&self) -> Vec<BindingView> {
        self.core.table.snapshot()
    }

    pub fn interface_owner(&self, iface: u8) -> Option<ClassHandle> {
        self.core.table.interface_owner(iface)
    }

    pub fn endpoint_owner(&self, ep: EndpointAddress) -> Option<ClassHandle> {
        self.core.table.endpoint_owner(ep)
    }

    // ===== subscriptions =====

    pub fn sof_register(&mut self, handle: ClassHandle) -> Result<()> {
        self.core.sof_register(handle)
    }

    pub fn sof_unregister(&mut self, handle: ClassHandle) -> Result<()> {
        self.core.sof_unregister(handle)
    }

    /// SOF subscribers in registration order
    pub fn sof_subscribers(&self) -> Vec<ClassHandle> {
        self.core.registry.sof_iter().collect()
    }

    pub fn sof_enabled(&self) -> bool {
        self.core.sof_required()
    }

    pub fn remote_wakeup_register(&mut self, handle: ClassHandle) -> Result<()> {
        self.core.remote_wakeup_register(handle)
    }

    pub fn remote_wakeup_unregister(&mut self, handle: ClassHandle) -> Result<()> {
        self.core.remote_wakeup_unregister(handle)
    }

    /// Some instance needs remote wakeup
    pub fn remote_wakeup_enabled(&self) -> bool {
        self.core.rwu.enabled()
    }

    /// The host set DEVICE_REMOTE_WAKEUP
    pub fn host_remote_wakeup_enabled(&self) -> bool {
        self.core.control.remote_wakeup
    }

    // ===== dispatch primitives =====

    pub fn iface_call(&mut self, iface: u8, event: &Event) -> Outcome {
        self.core.iface_call(iface, event)
    }

    pub fn ep_call(&mut self, ep: EndpointAddress, event: &Event) -> Outcome {
        self.core.ep_call(ep, event)
    }

    pub fn all_call(&mut self, event: &Event) {
        self.core.all_call(event)
    }

    pub fn all_until_served_call(&mut self, event: &Event) -> Outcome {
        self.core.all_until_served_call(event)
    }

    /// Route an interface-recipient request without touching the control pipe
    pub fn interface_std_req_handle(&mut self, setup: SetupPacket) -> Outcome {
        self.core.interface_request(setup)
    }

    /// Route an endpoint-recipient request without touching the control pipe
    pub fn endpoint_std_req_handle(&mut self, setup: SetupPacket) -> Outcome {
        self.core.endpoint_request(setup)
    }

    // ===== status =====

    pub fn state(&self) -> DeviceState {
        self.core.state.state()
    }

    pub fn is_powered(&self) -> bool {
        self.core.state.is_powered()
    }

    pub fn is_faulted(&self) -> bool {
        self.core.faulted.is_some()
    }

    pub fn bus_state(&self) -> BusState {
        self.core.control.bus
    }

    pub fn address(&self) -> u8 {
        self.core.control.address
    }

    pub fn configuration(&self) -> u8 {
        self.core.control.configuration
    }

    pub fn driver(&self) -> &dyn DeviceDriver {
        self.core.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> &mut dyn DeviceDriver {
        self.core.driver.as_mut()
    }
}

impl std::fmt::Debug for UsbdStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbdStack")
            .field("state", &self.core.state.state())
            .field("powered", &self.core.state.is_powered())
            .field("classes", &self.core.registry.len())
            .field("sof_subscribers", &self.core.registry.sof_len())
            .field("rwu", &self.core.rwu.count())
            .field("queue_len", &self.bridge.queue_len())
            .field("faulted", &self.core.faulted)
            .finish()
    }
}
