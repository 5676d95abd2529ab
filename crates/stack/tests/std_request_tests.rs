//! Standard Request Handling Tests
//!
//! Setup packets travel the full path: interrupt entry, routing, class
//! dispatch and the control-pipe response recorded by the mock driver.
//!
//! Run with: `cargo test -p stack --test std_request_tests`

use protocol::descriptor::kind;
use protocol::{
    Direction, EndpointAddress, FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT, Recipient,
    RequestKind, SetupPacket,
};
use stack::test_utils::{ControlResponse, DriverProbe, Journal, MockDriver, RecordingClass};
use stack::{BusState, Event, Outcome, StackConfig, UsbdStack};

const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
];

struct Fixture {
    usbd: UsbdStack,
    probe: DriverProbe,
    journal: Journal,
}

impl Fixture {
    fn build(config: StackConfig, function: impl FnOnce(&Journal) -> RecordingClass) -> Self {
        let (driver, probe) = MockDriver::new();
        let journal = RecordingClass::journal();
        let mut usbd = UsbdStack::new(driver);
        usbd.init(config).unwrap();

        usbd.append(Box::new(
            RecordingClass::new("device", &journal).with_descriptors(DEVICE_DESCRIPTOR.to_vec()),
        ))
        .unwrap();
        usbd.append(Box::new(function(&journal).with_interface(0, &[0x81, 0x01])))
            .unwrap();

        usbd.enable().unwrap();
        usbd.start().unwrap();
        usbd.isr_event(Event::Reset).unwrap();
        Self {
            usbd,
            probe,
            journal,
        }
    }

    fn plain() -> Self {
        Self::with_function(|journal| RecordingClass::new("function", journal))
    }

    fn with_function(function: impl FnOnce(&Journal) -> RecordingClass) -> Self {
        Self::build(StackConfig::immediate(), function)
    }

    fn request(&mut self, setup: SetupPacket) -> ControlResponse {
        self.usbd.isr_event(Event::Setup(setup)).unwrap();
        self.probe.last_response().expect("no control response")
    }

    fn address_and_configure(&mut self) {
        assert_eq!(self.request(SetupPacket::set_address(5)), ControlResponse::Ack);
        assert_eq!(
            self.request(SetupPacket::set_configuration(1)),
            ControlResponse::Ack
        );
    }
}

// ============================================================================
// Device Recipient
// ============================================================================

#[test]
fn test_device_descriptor_truncated_to_length() {
    let mut fx = Fixture::plain();

    assert_eq!(
        fx.request(SetupPacket::get_descriptor(kind::DEVICE, 0, 8)),
        ControlResponse::Data(DEVICE_DESCRIPTOR[..8].to_vec())
    );
    assert_eq!(
        fx.request(SetupPacket::get_descriptor(kind::DEVICE, 0, 64)),
        ControlResponse::Data(DEVICE_DESCRIPTOR.to_vec())
    );
}

#[test]
fn test_missing_descriptor_stalls() {
    let mut fx = Fixture::plain();
    assert_eq!(
        fx.request(SetupPacket::get_descriptor(kind::STRING, 4, 255)),
        ControlResponse::Stall
    );
}

#[test]
fn test_first_instance_with_descriptor_answers() {
    // The function's interface record is the first INTERFACE in the chain
    let mut fx = Fixture::plain();
    match fx.request(SetupPacket::get_descriptor(kind::INTERFACE, 0, 64)) {
        ControlResponse::Data(bytes) => {
            assert_eq!(bytes.len(), 9);
            assert_eq!(bytes[1], kind::INTERFACE);
        }
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn test_address_then_configuration() {
    let mut fx = Fixture::plain();
    assert_eq!(fx.usbd.bus_state(), BusState::Default);

    // Configuration needs an address first
    assert_eq!(
        fx.request(SetupPacket::set_configuration(1)),
        ControlResponse::Stall
    );

    fx.address_and_configure();
    assert_eq!(fx.usbd.address(), 5);
    assert_eq!(fx.usbd.configuration(), 1);
    assert_eq!(fx.usbd.bus_state(), BusState::Configured);

    let enabled = fx.probe.log().enabled_endpoints;
    assert!(enabled.contains(&EndpointAddress::new(1, Direction::In)));
    assert!(enabled.contains(&EndpointAddress::new(1, Direction::Out)));

    assert_eq!(
        fx.request(SetupPacket::get_configuration()),
        ControlResponse::Data(vec![1])
    );
}

#[test]
fn test_set_configuration_is_broadcast() {
    let mut fx = Fixture::plain();
    fx.address_and_configure();

    let setup = Event::Setup(SetupPacket::set_configuration(1));
    assert_eq!(
        RecordingClass::receivers(&fx.journal, &setup),
        vec!["device", "function"]
    );
}

#[test]
fn test_deconfigure_disables_endpoints() {
    let mut fx = Fixture::plain();
    fx.address_and_configure();

    assert_eq!(
        fx.request(SetupPacket::set_configuration(0)),
        ControlResponse::Ack
    );
    assert!(fx.probe.log().enabled_endpoints.is_empty());
    assert_eq!(fx.usbd.bus_state(), BusState::Addressed);

    assert_eq!(
        fx.request(SetupPacket::set_configuration(2)),
        ControlResponse::Stall
    );
}

#[test]
fn test_reset_clears_address_and_configuration() {
    let mut fx = Fixture::plain();
    fx.address_and_configure();

    fx.usbd.isr_event(Event::Reset).unwrap();
    assert_eq!(fx.usbd.address(), 0);
    assert_eq!(fx.usbd.configuration(), 0);
    assert_eq!(fx.usbd.bus_state(), BusState::Default);
}

#[test]
fn test_device_status_reports_power_and_wakeup() {
    let mut fx = Fixture::build(StackConfig::immediate().with_self_powered(true), |journal| {
        RecordingClass::new("function", journal).with_rwu()
    });

    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Device, 0)),
        ControlResponse::Data(vec![0x01, 0])
    );
    assert_eq!(
        fx.request(SetupPacket::set_feature(
            Recipient::Device,
            FEATURE_DEVICE_REMOTE_WAKEUP,
            0
        )),
        ControlResponse::Ack
    );
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Device, 0)),
        ControlResponse::Data(vec![0x03, 0])
    );

    assert_eq!(
        fx.request(SetupPacket::clear_feature(
            Recipient::Device,
            FEATURE_DEVICE_REMOTE_WAKEUP,
            0
        )),
        ControlResponse::Ack
    );
    assert!(!fx.usbd.host_remote_wakeup_enabled());
}

#[test]
fn test_remote_wakeup_feature_needs_a_subscriber() {
    let mut fx = Fixture::plain();
    assert_eq!(
        fx.request(SetupPacket::set_feature(
            Recipient::Device,
            FEATURE_DEVICE_REMOTE_WAKEUP,
            0
        )),
        ControlResponse::Stall
    );
    assert!(!fx.usbd.host_remote_wakeup_enabled());
}

#[test]
fn test_vendor_device_request_goes_to_first_taker() {
    let mut fx = Fixture::with_function(|journal| {
        RecordingClass::new("function", journal).with_outcome(Outcome::data(vec![0x42, 0x43]))
    });

    let setup = SetupPacket::new(
        Direction::In,
        RequestKind::Vendor,
        Recipient::Device,
        0x10,
        0,
        0,
        1,
    );
    assert_eq!(fx.request(setup), ControlResponse::Data(vec![0x42]));
    assert_eq!(
        RecordingClass::receivers(&fx.journal, &Event::Setup(setup)),
        vec!["device", "function"]
    );
}

// ============================================================================
// Interface Recipient
// ============================================================================

#[test]
fn test_interface_status_and_unbound() {
    let mut fx = Fixture::plain();
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Interface, 0)),
        ControlResponse::Data(vec![0, 0])
    );
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Interface, 5)),
        ControlResponse::Stall
    );
}

#[test]
fn test_set_interface_forwarded_once() {
    let mut fx = Fixture::with_function(|journal| {
        RecordingClass::new("function", journal).with_outcome(Outcome::ack())
    });

    let setup = SetupPacket::set_interface(0, 1);
    assert_eq!(fx.request(setup), ControlResponse::Ack);
    assert_eq!(
        RecordingClass::receivers(&fx.journal, &Event::Setup(setup)),
        vec!["function"]
    );
}

#[test]
fn test_declined_interface_request_stalls() {
    let mut fx = Fixture::plain();
    let setup = SetupPacket::get_interface(0);
    assert_eq!(fx.request(setup), ControlResponse::Stall);
    assert_eq!(
        RecordingClass::receivers(&fx.journal, &Event::Setup(setup)),
        vec!["function"]
    );
}

#[test]
fn test_interface_descriptor_from_owner() {
    let mut fx = Fixture::plain();
    match fx.request(SetupPacket::get_interface_descriptor(0, kind::ENDPOINT, 1, 64)) {
        ControlResponse::Data(bytes) => assert_eq!(bytes[2], 0x01),
        other => panic!("unexpected response {other:?}"),
    }
}

#[test]
fn test_interface_routing_without_control_pipe() {
    let mut fx = Fixture::plain();
    let before = fx.probe.log().responses.len();

    let outcome = fx
        .usbd
        .interface_std_req_handle(SetupPacket::get_status(Recipient::Interface, 0));
    assert_eq!(outcome, Outcome::data(vec![0, 0]));
    assert_eq!(fx.probe.log().responses.len(), before);
}

// ============================================================================
// Endpoint Recipient
// ============================================================================

#[test]
fn test_endpoint_halt_cycle() {
    let mut fx = Fixture::plain();
    let ep = EndpointAddress::new(1, Direction::In);

    assert_eq!(
        fx.request(SetupPacket::set_feature(
            Recipient::Endpoint,
            FEATURE_ENDPOINT_HALT,
            0x81
        )),
        ControlResponse::Ack
    );
    assert!(fx.probe.log().stalled.contains(&ep));
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Endpoint, 0x81)),
        ControlResponse::Data(vec![1, 0])
    );

    let clear = SetupPacket::clear_feature(Recipient::Endpoint, FEATURE_ENDPOINT_HALT, 0x81);
    assert_eq!(fx.request(clear), ControlResponse::Ack);
    assert!(fx.probe.log().stalled.is_empty());
    assert_eq!(
        RecordingClass::receivers(&fx.journal, &Event::Setup(clear)),
        vec!["function"]
    );

    let outcome = fx
        .usbd
        .endpoint_std_req_handle(SetupPacket::get_status(Recipient::Endpoint, 0x81));
    assert_eq!(outcome, Outcome::data(vec![0, 0]));
}

#[test]
fn test_endpoint_descriptor_from_owner() {
    let mut fx = Fixture::plain();
    let setup = SetupPacket::new(
        Direction::In,
        RequestKind::Standard,
        Recipient::Endpoint,
        0x06,
        u16::from(kind::ENDPOINT) << 8,
        0x81,
        64,
    );

    match fx.request(setup) {
        ControlResponse::Data(bytes) => {
            assert_eq!(bytes.len(), 7);
            assert_eq!(bytes[1], kind::ENDPOINT);
            assert_eq!(bytes[2], 0x81);
        }
        other => panic!("unexpected response {other:?}"),
    }
    // Served from the lookup, the owner never sees the raw request
    assert!(RecordingClass::receivers(&fx.journal, &Event::Setup(setup)).is_empty());

    let unbound = SetupPacket::new(
        Direction::In,
        RequestKind::Standard,
        Recipient::Endpoint,
        0x06,
        u16::from(kind::ENDPOINT) << 8,
        0x85,
        64,
    );
    assert_eq!(fx.request(unbound), ControlResponse::Stall);
}

#[test]
fn test_unbound_endpoint_and_control_halt_stall() {
    let mut fx = Fixture::plain();
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Endpoint, 0x85)),
        ControlResponse::Stall
    );
    assert_eq!(
        fx.request(SetupPacket::set_feature(
            Recipient::Endpoint,
            FEATURE_ENDPOINT_HALT,
            0x00
        )),
        ControlResponse::Stall
    );
    assert_eq!(
        fx.request(SetupPacket::get_status(Recipient::Endpoint, 0x80)),
        ControlResponse::Data(vec![0, 0])
    );
}
