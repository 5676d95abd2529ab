//! Common utilities for the usbd binaries
//!
//! This crate provides what the simulator and other hosts of the device
//! stack share: tracing setup, error handling, and the async channel
//! bridge between a Tokio runtime and the thread that owns the stack.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{ControlBridge, ControlWorker, DEFAULT_CHANNEL_CAPACITY, create_control_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
