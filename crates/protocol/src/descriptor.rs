//! Descriptor blobs
//!
//! A class instance publishes its descriptors as one contiguous byte blob of
//! `(bLength, bDescriptorType, payload...)` records. This module walks such
//! blobs and locates sub-descriptors; it never builds them.

use crate::endpoint::EndpointAddress;
use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::ops::Range;

/// Descriptor type codes (`bDescriptorType`)
pub mod kind {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const STRING: u8 = 0x03;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const DEVICE_QUALIFIER: u8 = 0x06;
    pub const INTERFACE_ASSOCIATION: u8 = 0x0B;
    pub const BOS: u8 = 0x0F;
    pub const HID: u8 = 0x21;
    pub const HID_REPORT: u8 = 0x22;
}

/// One record found while walking a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    /// Byte offset of the record inside the blob
    pub offset: usize,
    /// `bDescriptorType`
    pub kind: u8,
    /// The whole record, header included
    pub bytes: &'a [u8],
}

/// Iterator over the records of a descriptor blob
///
/// Yields a single `MalformedDescriptor` error and then stops if a record has
/// a length below 2 or runs past the end of the blob.
pub struct DescriptorIter<'a> {
    blob: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(blob: &'a [u8]) -> Self {
        Self {
            blob,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<Descriptor<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.blob.len() {
            return None;
        }

        let offset = self.offset;
        let rest = &self.blob[offset..];
        let len = rest[0] as usize;
        if len < 2 || len > rest.len() {
            self.failed = true;
            return Some(Err(ProtocolError::MalformedDescriptor { offset }));
        }

        self.offset += len;
        Some(Ok(Descriptor {
            offset,
            kind: rest[1],
            bytes: &rest[..len],
        }))
    }
}

/// Locate a sub-descriptor by `(type, index)`
///
/// `index` selects the n-th record of that type, with two exceptions that
/// follow GET_DESCRIPTOR addressing:
/// - INTERFACE matches `bInterfaceNumber` at alternate setting 0;
/// - CONFIGURATION spans `wTotalLength` bytes (clamped to the blob) so the
///   returned range covers the interfaces and endpoints that follow it.
///
/// A malformed tail ends the scan; records before it are still searchable.
///
/// # Example
/// ```
/// use protocol::descriptor::{find, kind};
///
/// // Two string descriptors: "A" and "B"
/// let blob = [4, kind::STRING, b'A', 0, 4, kind::STRING, b'B', 0];
/// assert_eq!(find(&blob, kind::STRING, 1), Some(4..8));
/// assert_eq!(find(&blob, kind::STRING, 2), None);
/// ```
pub fn find(blob: &[u8], descriptor_type: u8, index: u8) -> Option<Range<usize>> {
    let mut seen = 0u8;

    for record in DescriptorIter::new(blob) {
        let Ok(desc) = record else { break };
        if desc.kind != descriptor_type {
            continue;
        }

        let hit = match descriptor_type {
            kind::INTERFACE => desc.bytes.len() >= 4 && desc.bytes[2] == index && desc.bytes[3] == 0,
            _ => {
                let hit = seen == index;
                seen = seen.saturating_add(1);
                hit
            }
        };
        if !hit {
            continue;
        }

        let len = match descriptor_type {
            kind::CONFIGURATION if desc.bytes.len() >= 4 => {
                let total = LittleEndian::read_u16(&desc.bytes[2..4]) as usize;
                total.clamp(desc.bytes.len(), blob.len() - desc.offset)
            }
            _ => desc.bytes.len(),
        };
        return Some(desc.offset..desc.offset + len);
    }

    None
}

/// Distinct interface numbers declared by INTERFACE records, in blob order
pub fn interfaces(blob: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for record in DescriptorIter::new(blob) {
        let desc = record?;
        if desc.kind != kind::INTERFACE {
            continue;
        }
        if desc.bytes.len() < 4 {
            return Err(ProtocolError::MalformedDescriptor {
                offset: desc.offset,
            });
        }
        let number = desc.bytes[2];
        if !out.contains(&number) {
            out.push(number);
        }
    }
    Ok(out)
}

/// Distinct endpoint addresses declared by ENDPOINT records, in blob order
pub fn endpoints(blob: &[u8]) -> Result<Vec<EndpointAddress>> {
    let mut out = Vec::new();
    for record in DescriptorIter::new(blob) {
        let desc = record?;
        if desc.kind != kind::ENDPOINT {
            continue;
        }
        if desc.bytes.len() < 3 {
            return Err(ProtocolError::MalformedDescriptor {
                offset: desc.offset,
            });
        }
        let ep = EndpointAddress::try_from(desc.bytes[2])?;
        if !out.contains(&ep) {
            out.push(ep);
        }
    }
    Ok(out)
}
