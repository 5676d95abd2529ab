//! Stack worker thread
//!
//! The `UsbdStack` is single-threaded: this thread owns it and is the only
//! task context that ever touches it. Tokio talks to it through the control
//! bridge; the simulated bus talks to it through the interrupt ring
//! (buffered mode) or a forwarding channel (immediate mode).

use crate::bus::{self, BusEndpoints, BusReport, BusSink};
use crate::classes::{DeviceCore, Heartbeat, Loopback};
use crate::config::{Mode, SimConfig};
use crate::driver::{BusLines, DriverStats, SimDriver};
use anyhow::{Context, Result, anyhow};
use common::ControlWorker;
use serde::Serialize;
use stack::{
    BindingView, BusState, ClassHandle, DeviceState, Event, StackConfig, StartStatus, UsbClass,
    UsbdStack,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Queued events executed per loop iteration before commands are polled again
const PUMP_BUDGET: usize = 64;
const IDLE_SLEEP: Duration = Duration::from_micros(200);
const HEARTBEAT_PERIOD: u16 = 100;

/// Commands from the Tokio runtime to the stack thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Start,
    Stop,
    Wakeup,
    SuspendRequest,
    Status,
    Shutdown,
}

/// What the stack thread reports back
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SimNotification {
    /// Confirmed state change seen by the state notifier
    Stack { event: Event },
    StartResult { status: StartStatus },
    /// Whether a suspend or wakeup request was taken
    Request { command: String, accepted: bool },
    Status(Box<StatusSnapshot>),
    BusFinished { report: BusReport },
    Failed { context: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: DeviceState,
    pub bus: BusState,
    pub address: u8,
    pub configuration: u8,
    pub faulted: bool,
    pub queue_len: usize,
    pub interrupts: u64,
    pub sof_enabled: bool,
    pub host_remote_wakeup: bool,
    pub classes: Vec<String>,
    pub bindings: Vec<BindingView>,
    pub loopback: FunctionStats,
    pub heartbeat: FunctionStats,
    pub driver: DriverStats,
}

enum Step {
    Busy,
    Idle,
    Shutdown,
}

/// Per-function counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct FunctionStats {
    /// Packets produced (echoes or beats)
    pub sent: u32,
    /// IN transfers the host completed
    pub completed: u32,
    pub errors: u32,
}

struct Functions {
    loopback: ClassHandle,
    heartbeat: ClassHandle,
    endpoints: BusEndpoints,
}

pub struct StackWorker {
    usbd: UsbdStack,
    control: ControlWorker<SimCommand, SimNotification>,
    config: SimConfig,
    functions: Functions,
    notifications: async_channel::Receiver<Event>,
    /// Immediate mode: bus events waiting for `isr_event`
    forwarded: Option<(async_channel::Sender<Event>, async_channel::Receiver<Event>)>,
    lines: Arc<BusLines>,
    stats: Arc<Mutex<DriverStats>>,
    interrupts: Arc<AtomicU64>,
    bus: Option<JoinHandle<Result<BusReport>>>,
    bus_spawned: bool,
    bus_stop: Arc<AtomicBool>,
}

impl StackWorker {
    /// Build the stack, append the demo functions and power the peripheral
    pub fn new(
        control: ControlWorker<SimCommand, SimNotification>,
        config: SimConfig,
    ) -> Result<Self> {
        let driver = SimDriver::new(config.bus.start_glitch_probability);
        let lines = driver.lines();
        let stats = driver.stats();
        let interrupts = Arc::new(AtomicU64::new(0));

        let (notify_tx, notifications) = async_channel::unbounded();
        let stack_config = match config.sim.mode {
            Mode::Immediate => StackConfig::immediate(),
            Mode::Buffered => {
                let counter = Arc::clone(&interrupts);
                StackConfig::buffered(config.sim.queue_capacity).with_isr_observer(
                    move |event, queued| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        if !queued {
                            warn!(event = event.name(), "interrupt event was not queued");
                        }
                    },
                )
            }
        }
        .with_sof(config.sim.enable_sof)
        .with_state_notifier(move |event| {
            notify_state(&notify_tx, event);
        });

        let mut usbd = UsbdStack::new(driver);
        usbd.init(stack_config).context("Failed to initialize the stack")?;

        let loopback = Loopback::new(0, 1);
        let heartbeat = Heartbeat::new(1, 2, HEARTBEAT_PERIOD);
        let endpoints = BusEndpoints {
            loopback_out: loopback.out_ep(),
            loopback_in: loopback.in_ep(),
            heartbeat_in: heartbeat.in_ep(),
        };
        let core = DeviceCore::new(
            &config.device,
            &[loopback.descriptors(), heartbeat.descriptors()],
            false,
            config.bus.remote_wakeup,
        );

        usbd.append(Box::new(core))
            .context("Failed to append device descriptors")?;
        let loopback = usbd
            .append(Box::new(loopback))
            .context("Failed to append loopback function")?;
        let heartbeat = usbd
            .append(Box::new(heartbeat))
            .context("Failed to append heartbeat function")?;
        usbd.enable().context("Failed to power the peripheral")?;

        info!(
            mode = ?config.sim.mode,
            classes = usbd.classes().len(),
            "stack ready"
        );

        let forwarded = match config.sim.mode {
            Mode::Immediate => Some(async_channel::unbounded()),
            Mode::Buffered => None,
        };

        Ok(Self {
            usbd,
            control,
            config,
            functions: Functions {
                loopback,
                heartbeat,
                endpoints,
            },
            notifications,
            forwarded,
            lines,
            stats,
            interrupts,
            bus: None,
            bus_spawned: false,
            bus_stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Main loop; runs until `Shutdown` or until the stack faults
    pub fn run(mut self) -> Result<()> {
        info!("stack worker started");

        let result = loop {
            match self.step() {
                Ok(Step::Shutdown) => {
                    info!("stack worker shutting down");
                    break Ok(());
                }
                Ok(Step::Busy) => {}
                Ok(Step::Idle) => std::thread::sleep(IDLE_SLEEP),
                Err(e) => {
                    error!("stack worker failed: {:#}", e);
                    self.notify_failure("worker", &e);
                    break Err(e);
                }
            }
        };

        self.finish();
        result
    }

    fn step(&mut self) -> Result<Step> {
        let mut busy = false;

        match self.control.try_recv_command() {
            Some(SimCommand::Shutdown) => return Ok(Step::Shutdown),
            Some(cmd) => {
                busy = true;
                self.handle_command(cmd);
            }
            None => {}
        }

        busy |= self.pump()? > 0;
        busy |= self.forward_notifications()?;
        self.reap_bus()?;

        Ok(if busy { Step::Busy } else { Step::Idle })
    }

    fn handle_command(&mut self, cmd: SimCommand) {
        debug!(?cmd, "command");
        match cmd {
            SimCommand::Start => match self.usbd.start() {
                Ok(status) => {
                    if status == StartStatus::Aborted {
                        warn!("peripheral aborted startup");
                    }
                    self.send(SimNotification::StartResult { status });
                }
                Err(e) => self.notify_failure("start", &e),
            },
            SimCommand::Stop => {
                if let Err(e) = self.usbd.stop() {
                    self.notify_failure("stop", &e);
                }
            }
            SimCommand::SuspendRequest => match self.usbd.suspend_request() {
                Ok(accepted) => self.send(SimNotification::Request {
                    command: "suspend".to_string(),
                    accepted,
                }),
                Err(e) => self.notify_failure("suspend", &e),
            },
            SimCommand::Wakeup => match self.usbd.wakeup_request() {
                Ok(accepted) => self.send(SimNotification::Request {
                    command: "wakeup".to_string(),
                    accepted,
                }),
                Err(e) => self.notify_failure("wakeup", &e),
            },
            SimCommand::Status => {
                let snapshot = self.snapshot();
                self.send(SimNotification::Status(Box::new(snapshot)));
            }
            SimCommand::Shutdown => {}
        }
    }

    /// Execute pending bus events; returns how many ran
    fn pump(&mut self) -> Result<usize> {
        let mut ran = 0;
        if let Some((_, rx)) = &self.forwarded {
            while ran < PUMP_BUDGET {
                let Ok(event) = rx.try_recv() else { break };
                self.interrupts.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.usbd.isr_event(event) {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!(event = event.name(), error = %e, "bus event rejected");
                }
                ran += 1;
            }
        } else {
            while ran < PUMP_BUDGET && self.usbd.process_queue()? {
                ran += 1;
            }
        }
        Ok(ran)
    }

    /// Relay state notifications; the first `Started` attaches the host
    fn forward_notifications(&mut self) -> Result<bool> {
        let mut any = false;
        while let Ok(event) = self.notifications.try_recv() {
            any = true;
            if event == Event::Started && !self.bus_spawned {
                self.spawn_bus()?;
            }
            if !matches!(event, Event::StartOfFrame { .. }) {
                self.send(SimNotification::Stack { event });
            }
        }
        Ok(any)
    }

    fn spawn_bus(&mut self) -> Result<()> {
        let sink = match (&self.forwarded, self.usbd.interrupt_handle()) {
            (Some((tx, _)), _) => BusSink::Forward(tx.clone()),
            (None, Some(irq)) => BusSink::Interrupt(irq),
            (None, None) => return Err(anyhow!("no path for bus events")),
        };
        let handle = bus::spawn_bus(
            sink,
            Arc::clone(&self.lines),
            self.config.bus.clone(),
            self.functions.endpoints,
            Arc::clone(&self.bus_stop),
        )
        .context("Failed to spawn bus thread")?;
        self.bus = Some(handle);
        self.bus_spawned = true;
        Ok(())
    }

    fn reap_bus(&mut self) -> Result<()> {
        if !self.bus.as_ref().is_some_and(JoinHandle::is_finished) {
            return Ok(());
        }
        let Some(handle) = self.bus.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(Ok(report)) => self.send(SimNotification::BusFinished { report }),
            Ok(Err(e)) => {
                warn!("bus script failed: {:#}", e);
                self.send(SimNotification::Failed {
                    context: "bus".to_string(),
                    error: format!("{:#}", e),
                });
            }
            Err(_) => return Err(anyhow!("bus thread panicked")),
        }
        Ok(())
    }

    fn snapshot(&self) -> StatusSnapshot {
        let driver = self
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        StatusSnapshot {
            state: self.usbd.state(),
            bus: self.usbd.bus_state(),
            address: self.usbd.address(),
            configuration: self.usbd.configuration(),
            faulted: self.usbd.is_faulted(),
            queue_len: self.usbd.queue_len(),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            sof_enabled: self.usbd.sof_enabled(),
            host_remote_wakeup: self.usbd.host_remote_wakeup_enabled(),
            classes: self.usbd.classes().iter().map(ToString::to_string).collect(),
            bindings: self.usbd.bindings(),
            loopback: self
                .usbd
                .class::<Loopback>(self.functions.loopback)
                .map(|l| FunctionStats {
                    sent: l.echoed,
                    completed: l.in_completed,
                    errors: l.errors,
                })
                .unwrap_or_default(),
            heartbeat: self
                .usbd
                .class::<Heartbeat>(self.functions.heartbeat)
                .map(|h| FunctionStats {
                    sent: h.beats,
                    completed: h.delivered,
                    errors: 0,
                })
                .unwrap_or_default(),
            driver,
        }
    }

    fn send(&self, notification: SimNotification) {
        if let Err(e) = self.control.send_notification(notification) {
            debug!(error = %e, "runtime no longer listening");
        }
    }

    fn notify_failure(&self, context: &str, error: &dyn std::fmt::Display) {
        self.send(SimNotification::Failed {
            context: context.to_string(),
            error: error.to_string(),
        });
    }

    /// Stop the host, then take the stack apart
    fn finish(mut self) {
        self.bus_stop.store(true, Ordering::Release);
        if let Some(handle) = self.bus.take()
            && handle.join().is_err()
        {
            error!("bus thread panicked");
        }

        let driver = self.usbd.shutdown();
        debug!(enabled = driver.is_enabled(), "peripheral released");
        info!("stack worker stopped");
    }
}

/// Spawn the stack worker thread
pub fn spawn_stack_worker(
    control: ControlWorker<SimCommand, SimNotification>,
    config: SimConfig,
) -> std::io::Result<JoinHandle<Result<()>>> {
    std::thread::Builder::new()
        .name("usb-stack".to_string())
        .spawn(move || {
            let worker = StackWorker::new(control, config)?;
            worker.run()
        })
}

/// Queue a state notification for the worker loop; false once it hung up
fn notify_state(tx: &async_channel::Sender<Event>, event: &Event) -> bool {
    match tx.try_send(*event) {
        Ok(()) => true,
        Err(e) => {
            debug!(event = event.name(), error = %e, "state notification dropped");
            false
        }
    }
}
