//! Events and handler outcomes
//!
//! One [`Event`] type travels every path through the stack: raw bus events
//! raised from interrupt context, application requests queued from task
//! context, and lifecycle notifications delivered to class instances. Events
//! are `Copy` and small enough to sit in the interrupt-to-task ring.

use crate::error::{Error, Result};
use bytes::Bytes;
use protocol::{EndpointAddress, SetupPacket};
use serde::{Deserialize, Serialize};

/// Completion status of an endpoint transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Ok,
    /// Host sent more data than the buffer holds
    Overload,
    Aborted,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Control transfer setup stage received
    Setup(SetupPacket),
    StartOfFrame {
        frame: u16,
    },
    Reset,
    Suspend,
    Resume,
    EndpointTransferDone {
        ep: EndpointAddress,
        status: TransferStatus,
    },
    /// Delivered only to the instance that was just appended
    InstanceAppended,
    /// Delivered only to the instance being removed
    InstanceRemoved,
    StartRequested,
    StopRequested,
    SuspendRequested,
    WakeupRequested,
    /// Confirmation that the peripheral really started
    Started,
    Stopped,
}

impl Event {
    /// Events the hardware may raise from interrupt context
    pub const fn is_bus_event(&self) -> bool {
        matches!(
            self,
            Event::Setup(_)
                | Event::StartOfFrame { .. }
                | Event::Reset
                | Event::Suspend
                | Event::Resume
                | Event::EndpointTransferDone { .. }
        )
    }

    /// Application requests that travel the deferred path
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Event::StartRequested
                | Event::StopRequested
                | Event::SuspendRequested
                | Event::WakeupRequested
        )
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Event::Setup(_) => "setup",
            Event::StartOfFrame { .. } => "sof",
            Event::Reset => "reset",
            Event::Suspend => "suspend",
            Event::Resume => "resume",
            Event::EndpointTransferDone { .. } => "ep_transfer_done",
            Event::InstanceAppended => "instance_appended",
            Event::InstanceRemoved => "instance_removed",
            Event::StartRequested => "start_requested",
            Event::StopRequested => "stop_requested",
            Event::SuspendRequested => "suspend_requested",
            Event::WakeupRequested => "wakeup_requested",
            Event::Started => "started",
            Event::Stopped => "stopped",
        }
    }
}

/// Payload of a handled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handled, nothing to send back (status stage only for control transfers)
    Ack,
    /// Data stage content for a device-to-host control transfer
    Data(Bytes),
}

/// Result of offering an event to a handler
///
/// `Declined` means "not mine, try the next handler" and is kept apart from
/// `Failed` so chain dispatch can never mistake a handled-but-failed request
/// for one nobody claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled(Reply),
    Declined,
    Failed(Error),
}

impl Outcome {
    pub fn ack() -> Self {
        Outcome::Handled(Reply::Ack)
    }

    pub fn data(data: impl Into<Bytes>) -> Self {
        Outcome::Handled(Reply::Data(data.into()))
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, Outcome::Declined)
    }

    pub fn is_handled(&self) -> bool {
        matches!(self, Outcome::Handled(_))
    }

    /// Collapse into a `Result`, turning `Declined` into [`Error::Declined`]
    pub fn into_result(self) -> Result<Reply> {
        match self {
            Outcome::Handled(reply) => Ok(reply),
            Outcome::Declined => Err(Error::Declined),
            Outcome::Failed(e) => Err(e),
        }
    }
}

impl From<Result<()>> for Outcome {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::ack(),
            Err(e) => Outcome::Failed(e),
        }
    }
}
