//! Interrupt-to-task event bridge
//!
//! In buffered mode interrupt context only ever touches the [`EventQueue`],
//! a lock-free bounded ring; the task context pops one event per pump call.
//! In immediate mode there is no queue and events are executed (or handed to
//! the configured forward hook) on the spot.

use crate::error::{Error, Result};
use crate::event::Event;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, trace};

/// Receives every event the stack would otherwise execute inline
///
/// Whoever installs it is expected to call
/// [`UsbdStack::event_execute`](crate::UsbdStack::event_execute) later from a
/// context where running the class handlers is allowed.
pub type ForwardHook = Box<dyn FnMut(Event) + Send>;

/// Interrupt-context observer of raw events
///
/// The flag says whether the event was visible in the queue right after the
/// push. It can be a false negative when the consumer pops concurrently and
/// must only be used for diagnostics.
pub type IsrObserver = Arc<dyn Fn(&Event, bool) + Send + Sync>;

/// Task-context notification of state changes (Started, Stopped, Reset, ...)
pub type StateNotifier = Box<dyn FnMut(&Event) + Send>;

/// Bounded FIFO shared by the interrupt and task contexts
pub struct EventQueue {
    ring: ArrayQueue<Event>,
    poisoned: AtomicBool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParam("event queue capacity must be non-zero"));
        }
        Ok(Self {
            ring: ArrayQueue::new(capacity),
            poisoned: AtomicBool::new(false),
        })
    }

    /// Never overwrites: a full ring is reported, the event is not recorded
    pub fn push(&self, event: Event) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::Internal("event queue poisoned by a faulted stack".into()));
        }
        self.ring.push(event).map_err(|_| Error::QueueFull {
            capacity: self.ring.capacity(),
        })
    }

    pub fn pop(&self) -> Option<Event> {
        self.ring.pop()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Producer end for interrupt context (buffered mode only)
///
/// Cheap to clone and safe to move to the thread that plays the interrupt
/// role.
#[derive(Clone)]
pub struct InterruptHandle {
    queue: Arc<EventQueue>,
    observer: Option<IsrObserver>,
}

impl InterruptHandle {
    pub(crate) fn new(capacity: usize, observer: Option<IsrObserver>) -> Result<Self> {
        Ok(Self {
            queue: Arc::new(EventQueue::new(capacity)?),
            observer,
        })
    }

    /// Record a raw bus event for the task context
    pub fn raise(&self, event: Event) -> Result<()> {
        if !event.is_bus_event() {
            return Err(Error::InvalidParam("only bus events may be raised"));
        }
        self.post(event)
    }

    /// Push any event, including application requests
    pub(crate) fn post(&self, event: Event) -> Result<()> {
        let pushed = self.queue.push(event);
        if let Err(e) = &pushed {
            error!(event = event.name(), error = %e, "USB event lost at interrupt entry");
        }

        if let Some(observer) = &self.observer {
            let queued = pushed.is_ok() && !self.queue.is_empty();
            observer(&event, queued);
        }

        trace!(event = event.name(), len = self.queue.len(), "event queued");
        pushed
    }

    pub(crate) fn pop(&self) -> Option<Event> {
        self.queue.pop()
    }

    pub(crate) fn poison(&self) {
        self.queue.poison();
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("queue", &self.queue)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Delivery policy fixed at init
pub(crate) enum Bridge {
    Unset,
    Immediate { forward: Option<ForwardHook> },
    Buffered(InterruptHandle),
}

impl Bridge {
    pub(crate) fn interrupt_handle(&self) -> Option<InterruptHandle> {
        match self {
            Bridge::Buffered(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        match self {
            Bridge::Buffered(handle) => handle.queue_len(),
            _ => 0,
        }
    }

    pub(crate) fn poison(&self) {
        if let Bridge::Buffered(handle) = self {
            handle.poison();
        }
    }
}
