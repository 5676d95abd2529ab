//! USB device stack core
//!
//! This crate owns the device lifecycle, hands bus events from interrupt
//! context to task context, and dispatches them to a chain of pluggable
//! class instances that claim interfaces and endpoints.
//!
//! # Example
//!
//! ```
//! use stack::test_utils::{MockDriver, RecordingClass};
//! use stack::{DeviceState, Event, StackConfig, StartStatus, UsbdStack};
//!
//! let (driver, _probe) = MockDriver::new();
//! let mut usbd = UsbdStack::new(driver);
//! usbd.init(StackConfig::immediate()).unwrap();
//!
//! let journal = RecordingClass::journal();
//! let handle = usbd
//!     .append(Box::new(RecordingClass::new("demo", &journal).with_interface(0, &[0x81])))
//!     .unwrap();
//!
//! usbd.enable().unwrap();
//! assert_eq!(usbd.start().unwrap(), StartStatus::Started);
//! assert_eq!(usbd.state(), DeviceState::Started);
//!
//! usbd.isr_event(Event::Reset).unwrap();
//! assert_eq!(usbd.classes(), vec![handle]);
//! ```

pub mod bridge;
pub mod class;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod event;
pub mod registry;
pub mod state;
pub mod std_request;
pub mod subscription;
pub mod test_utils;

mod stack;

pub use bridge::{EventQueue, ForwardHook, InterruptHandle, IsrObserver, StateNotifier};
pub use class::{ClassContext, Claims, EndpointHandler, UsbClass};
pub use config::{DEFAULT_QUEUE_CAPACITY, Delivery, StackConfig};
pub use dispatch::{BindingTarget, BindingView, INTERFACE_SLOTS};
pub use driver::DeviceDriver;
pub use error::{Error, Result};
pub use event::{Event, Outcome, Reply, TransferStatus};
pub use registry::ClassHandle;
pub use state::{DeviceState, StartStatus, StateMachine};
pub use std_request::BusState;
pub use subscription::RwuCounter;
pub use stack::UsbdStack;
