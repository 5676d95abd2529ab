//! Stack error taxonomy

use crate::state::DeviceState;
use protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation attempted outside the lifecycle state it requires
    #[error("Invalid state for {op}: device is {state}")]
    InvalidState {
        op: &'static str,
        state: DeviceState,
    },

    /// Absent instance, or dispatch to an unbound interface/endpoint
    #[error("Not found")]
    NotFound,

    /// Argument rejected: EP0 claim, foreign handler override, bad request value
    #[error("Invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Interface or endpoint already claimed by another instance
    #[error("Already assigned")]
    AlreadyAssigned,

    /// Every handler in the chain declined the event
    #[error("Declined by every handler")]
    Declined,

    /// A structural invariant is already broken; USB I/O must not continue
    #[error("Internal error: {0}")]
    Internal(String),

    /// The interrupt-to-task queue overflowed; the event was not recorded
    #[error("Event queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Operation the stack does not offer, such as `uninit`
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Malformed setup packet, endpoint address or descriptor blob
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl Error {
    /// Whether the stack must stop all further USB I/O after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
