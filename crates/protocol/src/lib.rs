//! USB device-side wire vocabulary
//!
//! This crate defines the byte-level pieces every layer of the device stack
//! agrees on: control-transfer setup packets, endpoint addresses and the
//! descriptor blobs class instances publish.
//!
//! # Example
//!
//! ```
//! use protocol::{EndpointAddress, SetupPacket, Recipient};
//! use protocol::descriptor::{self, kind};
//!
//! let setup = SetupPacket::get_status(Recipient::Endpoint, 0x81);
//! assert_eq!(setup.endpoint().unwrap(), EndpointAddress::try_from(0x81).unwrap());
//!
//! let blob = [9, kind::INTERFACE, 3, 0, 1, 0xFF, 0, 0, 0, 7, kind::ENDPOINT, 0x83, 3, 8, 0, 1];
//! assert_eq!(descriptor::interfaces(&blob).unwrap(), vec![3]);
//! assert_eq!(descriptor::find(&blob, kind::ENDPOINT, 0), Some(9..16));
//! ```

pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod setup;

pub use descriptor::{Descriptor, DescriptorIter};
pub use endpoint::{Direction, ENDPOINT_SLOTS, EndpointAddress};
pub use error::{ProtocolError, Result};
pub use setup::{
    FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT, Recipient, RequestKind, SETUP_PACKET_LEN,
    SetupPacket, StandardRequest,
};
