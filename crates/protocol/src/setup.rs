//! Control transfer setup packets
//!
//! Decodes the 8-byte standard device request that opens every control
//! transfer and exposes the bit fields of `bmRequestType`:
//!
//! ```text
//! bmRequestType  bRequest  wValue  wIndex  wLength
//!     u8            u8      u16le   u16le   u16le
//! ```

use crate::endpoint::{Direction, EndpointAddress};
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Size of a setup packet on the wire
pub const SETUP_PACKET_LEN: usize = 8;

/// Feature selector: endpoint halt (recipient endpoint)
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
/// Feature selector: device remote wakeup (recipient device)
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// Request type field (`bmRequestType` bits 5..=6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Standard,
    Class,
    Vendor,
    Reserved,
}

/// Request recipient (`bmRequestType` bits 0..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved(u8),
}

/// Standard request codes (`bRequest` when the kind is standard)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StandardRequest {
    GetStatus,
    ClearFeature,
    SetFeature,
    SetAddress,
    GetDescriptor,
    SetDescriptor,
    GetConfiguration,
    SetConfiguration,
    GetInterface,
    SetInterface,
    SynchFrame,
}

impl StandardRequest {
    pub const fn code(self) -> u8 {
        match self {
            Self::GetStatus => 0,
            Self::ClearFeature => 1,
            Self::SetFeature => 3,
            Self::SetAddress => 5,
            Self::GetDescriptor => 6,
            Self::SetDescriptor => 7,
            Self::GetConfiguration => 8,
            Self::SetConfiguration => 9,
            Self::GetInterface => 10,
            Self::SetInterface => 11,
            Self::SynchFrame => 12,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::GetStatus,
            1 => Self::ClearFeature,
            3 => Self::SetFeature,
            5 => Self::SetAddress,
            6 => Self::GetDescriptor,
            7 => Self::SetDescriptor,
            8 => Self::GetConfiguration,
            9 => Self::SetConfiguration,
            10 => Self::GetInterface,
            11 => Self::SetInterface,
            12 => Self::SynchFrame,
            _ => return None,
        })
    }
}

/// Decoded setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    /// Decode a setup packet from its little-endian wire form
    ///
    /// # Example
    /// ```
    /// use protocol::{SetupPacket, StandardRequest};
    ///
    /// let raw = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
    /// let setup = SetupPacket::parse(&raw).unwrap();
    /// assert_eq!(setup.standard_request(), Some(StandardRequest::GetDescriptor));
    /// assert_eq!(setup.descriptor_type(), 1);
    /// assert_eq!(setup.length, 18);
    /// ```
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SETUP_PACKET_LEN {
            return Err(ProtocolError::BufferTooSmall {
                needed: SETUP_PACKET_LEN,
                available: bytes.len(),
            });
        }

        Ok(Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        })
    }

    /// Encode back to the wire form
    pub fn to_bytes(&self) -> [u8; SETUP_PACKET_LEN] {
        let mut out = [0u8; SETUP_PACKET_LEN];
        out[0] = self.request_type;
        out[1] = self.request;
        LittleEndian::write_u16(&mut out[2..4], self.value);
        LittleEndian::write_u16(&mut out[4..6], self.index);
        LittleEndian::write_u16(&mut out[6..8], self.length);
        out
    }

    /// Build a request from its fields
    pub fn new(
        direction: Direction,
        kind: RequestKind,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        let dir_bit = match direction {
            Direction::In => 0x80,
            Direction::Out => 0x00,
        };
        let kind_bits = match kind {
            RequestKind::Standard => 0,
            RequestKind::Class => 1,
            RequestKind::Vendor => 2,
            RequestKind::Reserved => 3,
        } << 5;
        let recipient_bits = match recipient {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
            Recipient::Reserved(r) => r & 0x1F,
        };

        Self {
            request_type: dir_bit | kind_bits | recipient_bits,
            request,
            value,
            index,
            length,
        }
    }

    fn standard(
        direction: Direction,
        recipient: Recipient,
        request: StandardRequest,
        value: u16,
        index: u16,
        length: u16,
    ) -> Self {
        Self::new(
            direction,
            RequestKind::Standard,
            recipient,
            request.code(),
            value,
            index,
            length,
        )
    }

    /// GET_DESCRIPTOR addressed to the device
    pub fn get_descriptor(descriptor_type: u8, descriptor_index: u8, length: u16) -> Self {
        Self::standard(
            Direction::In,
            Recipient::Device,
            StandardRequest::GetDescriptor,
            (u16::from(descriptor_type) << 8) | u16::from(descriptor_index),
            0,
            length,
        )
    }

    /// GET_DESCRIPTOR addressed to an interface (class-specific descriptors)
    pub fn get_interface_descriptor(
        interface: u8,
        descriptor_type: u8,
        descriptor_index: u8,
        length: u16,
    ) -> Self {
        Self::standard(
            Direction::In,
            Recipient::Interface,
            StandardRequest::GetDescriptor,
            (u16::from(descriptor_type) << 8) | u16::from(descriptor_index),
            u16::from(interface),
            length,
        )
    }

    pub fn set_address(address: u8) -> Self {
        Self::standard(
            Direction::Out,
            Recipient::Device,
            StandardRequest::SetAddress,
            u16::from(address),
            0,
            0,
        )
    }

    pub fn get_configuration() -> Self {
        Self::standard(
            Direction::In,
            Recipient::Device,
            StandardRequest::GetConfiguration,
            0,
            0,
            1,
        )
    }

    pub fn set_configuration(value: u8) -> Self {
        Self::standard(
            Direction::Out,
            Recipient::Device,
            StandardRequest::SetConfiguration,
            u16::from(value),
            0,
            0,
        )
    }

    pub fn get_interface(interface: u8) -> Self {
        Self::standard(
            Direction::In,
            Recipient::Interface,
            StandardRequest::GetInterface,
            0,
            u16::from(interface),
            1,
        )
    }

    pub fn set_interface(interface: u8, alternate: u8) -> Self {
        Self::standard(
            Direction::Out,
            Recipient::Interface,
            StandardRequest::SetInterface,
            u16::from(alternate),
            u16::from(interface),
            0,
        )
    }

    /// GET_STATUS; `index` is the interface number or endpoint address
    pub fn get_status(recipient: Recipient, index: u16) -> Self {
        Self::standard(
            Direction::In,
            recipient,
            StandardRequest::GetStatus,
            0,
            index,
            2,
        )
    }

    pub fn set_feature(recipient: Recipient, feature: u16, index: u16) -> Self {
        Self::standard(
            Direction::Out,
            recipient,
            StandardRequest::SetFeature,
            feature,
            index,
            0,
        )
    }

    pub fn clear_feature(recipient: Recipient, feature: u16, index: u16) -> Self {
        Self::standard(
            Direction::Out,
            recipient,
            StandardRequest::ClearFeature,
            feature,
            index,
            0,
        )
    }

    pub const fn direction(&self) -> Direction {
        if self.request_type & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn kind(&self) -> RequestKind {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => RequestKind::Reserved,
        }
    }

    pub const fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            r => Recipient::Reserved(r),
        }
    }

    /// Decoded `bRequest` for standard requests, `None` otherwise
    pub const fn standard_request(&self) -> Option<StandardRequest> {
        match self.kind() {
            RequestKind::Standard => StandardRequest::from_code(self.request),
            _ => None,
        }
    }

    /// Target interface number (low byte of `wIndex`)
    pub const fn interface(&self) -> u8 {
        (self.index & 0xFF) as u8
    }

    /// Target endpoint (low byte of `wIndex`)
    pub fn endpoint(&self) -> Result<EndpointAddress> {
        EndpointAddress::try_from((self.index & 0xFF) as u8)
    }

    /// Descriptor type for GET_DESCRIPTOR (high byte of `wValue`)
    pub const fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    /// Descriptor index for GET_DESCRIPTOR (low byte of `wValue`)
    pub const fn descriptor_index(&self) -> u8 {
        (self.value & 0xFF) as u8
    }
}
