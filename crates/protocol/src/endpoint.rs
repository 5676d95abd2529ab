//! Endpoint addressing

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of distinct endpoint addresses (16 OUT + 16 IN)
pub const ENDPOINT_SLOTS: usize = 32;

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

/// USB endpoint address (`bEndpointAddress`)
///
/// Bit 7 carries the direction, bits 0..=3 the endpoint number. Bits 4..=6
/// are reserved and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    /// Default control endpoint, OUT half
    pub const EP0_OUT: Self = Self(0x00);
    /// Default control endpoint, IN half
    pub const EP0_IN: Self = Self(0x80);

    const DIR_IN: u8 = 0x80;
    const NUMBER_MASK: u8 = 0x0F;

    /// Build an address from an endpoint number (0..=15) and direction
    ///
    /// Only the low four bits of `number` are kept in release builds.
    pub const fn new(number: u8, direction: Direction) -> Self {
        debug_assert!(number <= Self::NUMBER_MASK, "endpoint number out of range");
        let number = number & Self::NUMBER_MASK;
        match direction {
            Direction::Out => Self(number),
            Direction::In => Self(number | Self::DIR_IN),
        }
    }

    /// Raw `bEndpointAddress` value
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Endpoint number without the direction bit
    pub const fn number(self) -> u8 {
        self.0 & Self::NUMBER_MASK
    }

    pub const fn direction(self) -> Direction {
        if self.0 & Self::DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }

    pub const fn is_in(self) -> bool {
        self.0 & Self::DIR_IN != 0
    }

    /// True for either half of endpoint 0
    pub const fn is_control(self) -> bool {
        self.number() == 0
    }

    /// Dense table slot: OUT endpoints map to 0..16, IN endpoints to 16..32
    pub const fn index(self) -> usize {
        let n = self.number() as usize;
        if self.is_in() { 16 + n } else { n }
    }

    /// Inverse of [`EndpointAddress::index`]
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0..=15 => Some(Self::new(index as u8, Direction::Out)),
            16..=31 => Some(Self::new((index - 16) as u8, Direction::In)),
            _ => None,
        }
    }
}

impl TryFrom<u8> for EndpointAddress {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self> {
        if raw & 0x70 != 0 {
            return Err(ProtocolError::InvalidEndpoint(raw));
        }
        Ok(Self(raw))
    }
}

impl From<EndpointAddress> for u8 {
    fn from(ep: EndpointAddress) -> Self {
        ep.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_fields() {
        let ep = EndpointAddress::new(2, Direction::In);
        assert_eq!(ep.raw(), 0x82);
        assert_eq!(ep.number(), 2);
        assert!(ep.is_in());
        assert_eq!(ep.direction(), Direction::In);
        assert!(!ep.is_control());
        assert_eq!(ep.to_string(), "0x82");
    }

    #[test]
    fn test_endpoint_index_is_dense() {
        assert_eq!(EndpointAddress::EP0_OUT.index(), 0);
        assert_eq!(EndpointAddress::EP0_IN.index(), 16);
        assert_eq!(EndpointAddress::new(15, Direction::In).index(), 31);

        for i in 0..ENDPOINT_SLOTS {
            let ep = EndpointAddress::from_index(i).unwrap();
            assert_eq!(ep.index(), i);
        }
        assert!(EndpointAddress::from_index(ENDPOINT_SLOTS).is_none());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "endpoint number out of range")]
    fn test_new_rejects_wide_number() {
        let _ = EndpointAddress::new(16, Direction::In);
    }

    #[test]
    fn test_endpoint_reserved_bits_rejected() {
        assert!(EndpointAddress::try_from(0x81).is_ok());
        assert_eq!(
            EndpointAddress::try_from(0x91),
            Err(ProtocolError::InvalidEndpoint(0x91))
        );
    }
}
