//! Integration tests for the wire vocabulary
//!
//! Walks realistic descriptor blobs (a composite configuration, strings,
//! malformed tails) and decodes setup packets captured from a host.
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use protocol::descriptor::{self, kind};
use protocol::{
    Direction, EndpointAddress, ProtocolError, Recipient, RequestKind, SetupPacket,
    StandardRequest,
};

/// Configuration header + two interfaces (one with an alternate setting)
fn composite_configuration() -> Vec<u8> {
    let mut blob = vec![9, kind::CONFIGURATION, 0, 0, 2, 1, 0, 0x80, 50];
    // Interface 0, alt 0, interrupt IN
    blob.extend_from_slice(&[9, kind::INTERFACE, 0, 0, 1, 0x03, 0, 0, 0]);
    blob.extend_from_slice(&[9, kind::HID, 0x11, 0x01, 0, 1, kind::HID_REPORT, 0x22, 0]);
    blob.extend_from_slice(&[7, kind::ENDPOINT, 0x81, 0x03, 8, 0, 10]);
    // Interface 1, alt 0 and alt 1, bulk pair
    blob.extend_from_slice(&[9, kind::INTERFACE, 1, 0, 0, 0xFF, 0, 0, 0]);
    blob.extend_from_slice(&[9, kind::INTERFACE, 1, 1, 2, 0xFF, 0, 0, 0]);
    blob.extend_from_slice(&[7, kind::ENDPOINT, 0x02, 0x02, 64, 0, 0]);
    blob.extend_from_slice(&[7, kind::ENDPOINT, 0x82, 0x02, 64, 0, 0]);

    let total = blob.len() as u16;
    blob[2..4].copy_from_slice(&total.to_le_bytes());
    blob
}

mod descriptor_walk {
    use super::*;

    #[test]
    fn test_records_cover_blob() {
        let blob = composite_configuration();
        let records: Vec<_> = descriptor::DescriptorIter::new(&blob)
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 8);
        assert_eq!(records[0].kind, kind::CONFIGURATION);
        let covered: usize = records.iter().map(|r| r.bytes.len()).sum();
        assert_eq!(covered, blob.len());
    }

    #[test]
    fn test_claims_deduplicate_alternates() {
        let blob = composite_configuration();
        assert_eq!(descriptor::interfaces(&blob).unwrap(), vec![0, 1]);
        assert_eq!(
            descriptor::endpoints(&blob).unwrap(),
            vec![
                EndpointAddress::new(1, Direction::In),
                EndpointAddress::new(2, Direction::Out),
                EndpointAddress::new(2, Direction::In),
            ]
        );
    }

    #[test]
    fn test_configuration_spans_total_length() {
        let blob = composite_configuration();
        assert_eq!(
            descriptor::find(&blob, kind::CONFIGURATION, 0),
            Some(0..blob.len())
        );
        assert_eq!(descriptor::find(&blob, kind::CONFIGURATION, 1), None);
    }

    #[test]
    fn test_interface_lookup_ignores_alternates() {
        let blob = composite_configuration();
        let range = descriptor::find(&blob, kind::INTERFACE, 1).unwrap();
        assert_eq!(&blob[range.start + 2..range.start + 4], &[1, 0]);
        assert_eq!(descriptor::find(&blob, kind::INTERFACE, 2), None);
    }

    #[test]
    fn test_nth_endpoint_and_class_descriptor() {
        let blob = composite_configuration();
        let range = descriptor::find(&blob, kind::ENDPOINT, 2).unwrap();
        assert_eq!(blob[range.start + 2], 0x82);

        let hid = descriptor::find(&blob, kind::HID, 0).unwrap();
        assert_eq!(hid.len(), 9);
    }

    #[test]
    fn test_malformed_tail_keeps_prefix_searchable() {
        let mut blob = vec![4, kind::STRING, b'A', 0];
        blob.extend_from_slice(&[9, kind::INTERFACE, 3]);

        assert_eq!(descriptor::find(&blob, kind::STRING, 0), Some(0..4));
        assert_eq!(
            descriptor::interfaces(&blob),
            Err(ProtocolError::MalformedDescriptor { offset: 4 })
        );
    }

    #[test]
    fn test_zero_length_record_stops_walk() {
        let blob = [0u8, kind::DEVICE, 0, 0];
        let mut iter = descriptor::DescriptorIter::new(&blob);
        assert!(matches!(
            iter.next(),
            Some(Err(ProtocolError::MalformedDescriptor { offset: 0 }))
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_reserved_endpoint_bits_rejected() {
        let blob = [7, kind::ENDPOINT, 0x91, 0x02, 64, 0, 0];
        assert_eq!(
            descriptor::endpoints(&blob),
            Err(ProtocolError::InvalidEndpoint(0x91))
        );
    }
}

mod setup_decoding {
    use super::*;

    #[test]
    fn test_host_enumeration_sequence() {
        // Requests as a host sends them right after reset
        let captured: [([u8; 8], StandardRequest); 4] = [
            ([0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00], StandardRequest::GetDescriptor),
            ([0x00, 0x05, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00], StandardRequest::SetAddress),
            ([0x80, 0x06, 0x00, 0x02, 0x00, 0x00, 0xFF, 0x00], StandardRequest::GetDescriptor),
            ([0x00, 0x09, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00], StandardRequest::SetConfiguration),
        ];

        for (raw, expected) in captured {
            let setup = SetupPacket::parse(&raw).unwrap();
            assert_eq!(setup.standard_request(), Some(expected));
            assert_eq!(setup.recipient(), Recipient::Device);
            assert_eq!(setup.to_bytes(), raw);
        }

        let addr = SetupPacket::parse(&captured[1].0).unwrap();
        assert_eq!(addr, SetupPacket::set_address(7));
    }

    #[test]
    fn test_builders_match_wire_encoding() {
        let setup = SetupPacket::get_interface_descriptor(2, kind::HID_REPORT, 0, 0x41);
        assert_eq!(setup.to_bytes(), [0x81, 0x06, 0x00, 0x22, 0x02, 0x00, 0x41, 0x00]);
        assert_eq!(setup.interface(), 2);

        let halt = SetupPacket::clear_feature(Recipient::Endpoint, 0, 0x82);
        assert_eq!(halt.to_bytes(), [0x02, 0x01, 0x00, 0x00, 0x82, 0x00, 0x00, 0x00]);
        assert_eq!(halt.endpoint().unwrap(), EndpointAddress::new(2, Direction::In));
    }

    #[test]
    fn test_class_request_is_not_standard() {
        // HID SET_IDLE
        let setup = SetupPacket::parse(&[0x21, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(setup.kind(), RequestKind::Class);
        assert_eq!(setup.recipient(), Recipient::Interface);
        assert_eq!(setup.direction(), Direction::Out);
        assert_eq!(setup.standard_request(), None);
    }

    #[test]
    fn test_short_packet_rejected() {
        assert_eq!(
            SetupPacket::parse(&[0x80, 0x06, 0x00]),
            Err(ProtocolError::BufferTooSmall {
                needed: 8,
                available: 3
            })
        );
    }

    #[test]
    fn test_reserved_recipient_preserved() {
        let setup = SetupPacket::parse(&[0x1F, 0x00, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(setup.recipient(), Recipient::Reserved(0x1F));
    }
}
