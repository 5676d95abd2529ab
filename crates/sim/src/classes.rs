//! Demo class instances hosted by the simulator
//!
//! None of these speak a real USB class protocol; they exist to exercise the
//! stack's routing, overrides and subscriptions.

use crate::config::DeviceSettings;
use protocol::descriptor::kind;
use protocol::{Direction, EndpointAddress, RequestKind, StandardRequest};
use stack::class::downcast_mut;
use stack::{ClassContext, Claims, Event, Outcome, TransferStatus, UsbClass};
use tracing::{debug, trace, warn};

const LANGID_EN_US: u16 = 0x0409;

const STRING_MANUFACTURER: u8 = 1;
const STRING_PRODUCT: u8 = 2;
const STRING_SERIAL: u8 = 3;

/// bmAttributes bits of the configuration descriptor
const ATTR_BUS_POWERED: u8 = 0x80;
const ATTR_SELF_POWERED: u8 = 0x40;
const ATTR_REMOTE_WAKEUP: u8 = 0x20;

fn string_descriptor(text: &str) -> Vec<u8> {
    let mut out = vec![0, kind::STRING];
    for unit in text.encode_utf16().take(126) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// Device, configuration and string descriptors
///
/// Claims nothing; it is appended first so chain-order lookup finds the
/// device-level descriptors here.
pub struct DeviceCore {
    device: [u8; 18],
    configuration: Vec<u8>,
    strings: Vec<Vec<u8>>,
}

impl DeviceCore {
    /// `functions` are the descriptor blobs of every other instance, in
    /// the order they will be appended
    pub fn new(
        settings: &DeviceSettings,
        functions: &[&[u8]],
        self_powered: bool,
        remote_wakeup: bool,
    ) -> Self {
        let [vid_lo, vid_hi] = settings.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = settings.product_id.to_le_bytes();
        let device = [
            18,
            kind::DEVICE,
            0x00,
            0x02,
            0x00,
            0x00,
            0x00,
            64,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            0x00,
            0x01,
            STRING_MANUFACTURER,
            STRING_PRODUCT,
            STRING_SERIAL,
            1,
        ];

        let interfaces = functions
            .iter()
            .map(|blob| protocol::descriptor::interfaces(blob).map_or(0, |ifaces| ifaces.len()))
            .sum::<usize>();
        let mut attributes = ATTR_BUS_POWERED;
        if self_powered {
            attributes |= ATTR_SELF_POWERED;
        }
        if remote_wakeup {
            attributes |= ATTR_REMOTE_WAKEUP;
        }

        let mut configuration = vec![9, kind::CONFIGURATION, 0, 0, interfaces as u8, 1, 0, attributes, 50];
        for blob in functions {
            configuration.extend_from_slice(blob);
        }
        let total = configuration.len() as u16;
        configuration[2..4].copy_from_slice(&total.to_le_bytes());

        let mut langids = vec![4, kind::STRING];
        langids.extend_from_slice(&LANGID_EN_US.to_le_bytes());

        Self {
            device,
            configuration,
            strings: vec![
                langids,
                string_descriptor(&settings.manufacturer),
                string_descriptor(&settings.product),
                string_descriptor(&settings.serial),
            ],
        }
    }
}

impl UsbClass for DeviceCore {
    fn descriptors(&self) -> &[u8] {
        &self.configuration
    }

    fn event(&mut self, _ctx: &mut ClassContext<'_>, _event: &Event) -> Outcome {
        Outcome::Declined
    }

    fn claims(&self) -> protocol::Result<Claims> {
        Ok(Claims::default())
    }

    fn find_descriptor(&self, descriptor_type: u8, index: u8) -> Option<&[u8]> {
        match (descriptor_type, index) {
            (kind::DEVICE, 0) => Some(&self.device),
            (kind::CONFIGURATION, 0) => Some(&self.configuration),
            (kind::STRING, i) => self.strings.get(usize::from(i)).map(Vec::as_slice),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        "device-core"
    }
}

/// Vendor request returning the number of echoed packets
pub const LOOPBACK_REQ_COUNT: u8 = 0x01;

/// Bulk echo function: every OUT packet is answered on the IN endpoint
pub struct Loopback {
    blob: Vec<u8>,
    interface: u8,
    out_ep: EndpointAddress,
    in_ep: EndpointAddress,
    pub echoed: u32,
    pub in_completed: u32,
    pub errors: u32,
}

impl Loopback {
    pub const PACKET_SIZE: usize = 64;

    pub fn new(interface: u8, endpoint: u8) -> Self {
        let out_ep = EndpointAddress::new(endpoint, Direction::Out);
        let in_ep = EndpointAddress::new(endpoint, Direction::In);
        let mut blob = vec![9, kind::INTERFACE, interface, 0, 2, 0xFF, 0, 0, 0];
        for ep in [out_ep, in_ep] {
            blob.extend_from_slice(&[7, kind::ENDPOINT, ep.raw(), 0x02, 64, 0, 0]);
        }
        Self {
            blob,
            interface,
            out_ep,
            in_ep,
            echoed: 0,
            in_completed: 0,
            errors: 0,
        }
    }

    pub fn out_ep(&self) -> EndpointAddress {
        self.out_ep
    }

    pub fn in_ep(&self) -> EndpointAddress {
        self.in_ep
    }

    fn arm_out(&self, ctx: &mut ClassContext<'_>) {
        ctx.driver().ep_transfer(self.out_ep, &[0; Self::PACKET_SIZE]);
    }

    /// Installed over the OUT endpoint when appended
    fn echo_out(class: &mut dyn UsbClass, ctx: &mut ClassContext<'_>, event: &Event) -> Outcome {
        let Some(this) = downcast_mut::<Loopback>(class) else {
            return Outcome::Declined;
        };
        let Event::EndpointTransferDone { status, .. } = event else {
            return Outcome::Declined;
        };

        if *status != TransferStatus::Ok {
            warn!(ep = %this.out_ep, ?status, "loopback OUT transfer failed");
            this.errors += 1;
        } else {
            this.echoed += 1;
            let payload = [this.echoed as u8; Self::PACKET_SIZE];
            ctx.driver().ep_transfer(this.in_ep, &payload);
            trace!(count = this.echoed, "loopback echo armed");
        }
        this.arm_out(ctx);
        Outcome::ack()
    }
}

impl UsbClass for Loopback {
    fn descriptors(&self) -> &[u8] {
        &self.blob
    }

    fn event(&mut self, ctx: &mut ClassContext<'_>, event: &Event) -> Outcome {
        match event {
            Event::InstanceAppended => ctx
                .set_endpoint_handler(self.out_ep, Loopback::echo_out)
                .into(),
            Event::Setup(setup) => match (setup.kind(), setup.standard_request()) {
                (RequestKind::Standard, Some(StandardRequest::SetConfiguration)) => {
                    if setup.value != 0 {
                        self.arm_out(ctx);
                    }
                    Outcome::ack()
                }
                (RequestKind::Standard, Some(StandardRequest::SetInterface))
                    if setup.interface() == self.interface && setup.value == 0 =>
                {
                    Outcome::ack()
                }
                (RequestKind::Standard, Some(StandardRequest::GetInterface))
                    if setup.interface() == self.interface =>
                {
                    Outcome::data(vec![0])
                }
                (RequestKind::Vendor, _)
                    if setup.request == LOOPBACK_REQ_COUNT
                        && setup.direction() == Direction::In =>
                {
                    Outcome::data(self.echoed.to_le_bytes().to_vec())
                }
                _ => Outcome::Declined,
            },
            Event::EndpointTransferDone { ep, .. } if *ep == self.in_ep => {
                self.in_completed += 1;
                Outcome::ack()
            }
            Event::Reset | Event::Stopped => {
                debug!("loopback idle");
                Outcome::ack()
            }
            _ => Outcome::Declined,
        }
    }

    fn name(&self) -> &str {
        "loopback"
    }
}

/// Interrupt IN function that reports a beat every `period` frames
///
/// Subscribes to SOF and remote wakeup when appended and drops both
/// subscriptions when removed.
pub struct Heartbeat {
    blob: Vec<u8>,
    in_ep: EndpointAddress,
    period: u16,
    frames: u32,
    pub beats: u32,
    pub delivered: u32,
}

impl Heartbeat {
    pub fn new(interface: u8, endpoint: u8, period: u16) -> Self {
        let in_ep = EndpointAddress::new(endpoint, Direction::In);
        let mut blob = vec![9, kind::INTERFACE, interface, 0, 1, 0xFF, 0, 0, 0];
        blob.extend_from_slice(&[7, kind::ENDPOINT, in_ep.raw(), 0x03, 8, 0, 10]);
        Self {
            blob,
            in_ep,
            period: period.max(1),
            frames: 0,
            beats: 0,
            delivered: 0,
        }
    }

    pub fn in_ep(&self) -> EndpointAddress {
        self.in_ep
    }
}

impl UsbClass for Heartbeat {
    fn descriptors(&self) -> &[u8] {
        &self.blob
    }

    fn event(&mut self, ctx: &mut ClassContext<'_>, event: &Event) -> Outcome {
        match event {
            Event::InstanceAppended => {
                let subscribed = ctx
                    .sof_register()
                    .and_then(|()| ctx.remote_wakeup_register());
                subscribed.into()
            }
            Event::InstanceRemoved => {
                if let Err(e) = ctx.sof_unregister() {
                    warn!(error = %e, "heartbeat SOF unregister failed");
                }
                ctx.remote_wakeup_unregister().into()
            }
            Event::StartOfFrame { .. } => {
                self.frames += 1;
                if ctx.configuration() != 0 && self.frames % u32::from(self.period) == 0 {
                    self.beats += 1;
                    let report = self.beats.to_le_bytes();
                    ctx.driver().ep_transfer(self.in_ep, &report);
                }
                Outcome::ack()
            }
            Event::EndpointTransferDone { ep, status } if *ep == self.in_ep => {
                if *status == TransferStatus::Ok {
                    self.delivered += 1;
                }
                Outcome::ack()
            }
            Event::Reset => {
                self.frames = 0;
                Outcome::ack()
            }
            _ => Outcome::Declined,
        }
    }

    fn name(&self) -> &str {
        "heartbeat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::SetupPacket;
    use stack::test_utils::{ControlResponse, MockDriver};
    use stack::{StackConfig, UsbdStack};

    fn configured_stack() -> (UsbdStack, stack::test_utils::DriverProbe, stack::ClassHandle, stack::ClassHandle)
    {
        let (driver, probe) = MockDriver::new();
        let mut usbd = UsbdStack::new(driver);
        usbd.init(StackConfig::immediate()).unwrap();

        let loopback = Loopback::new(0, 1);
        let heartbeat = Heartbeat::new(1, 2, 4);
        let core = DeviceCore::new(
            &DeviceSettings::default(),
            &[loopback.descriptors(), heartbeat.descriptors()],
            false,
            true,
        );
        usbd.append(Box::new(core)).unwrap();
        let lb = usbd.append(Box::new(loopback)).unwrap();
        let hb = usbd.append(Box::new(heartbeat)).unwrap();

        usbd.enable().unwrap();
        usbd.start().unwrap();
        usbd.isr_event(Event::Reset).unwrap();
        usbd.isr_event(Event::Setup(SetupPacket::set_address(3))).unwrap();
        usbd.isr_event(Event::Setup(SetupPacket::set_configuration(1))).unwrap();
        (usbd, probe, lb, hb)
    }

    #[test]
    fn test_string_descriptor_utf16() {
        let desc = string_descriptor("ab");
        assert_eq!(desc, vec![6, kind::STRING, b'a', 0, b'b', 0]);
    }

    #[test]
    fn test_configuration_descriptor_wraps_functions() {
        let (mut usbd, probe, _lb, _hb) = configured_stack();
        usbd.isr_event(Event::Setup(SetupPacket::get_descriptor(kind::CONFIGURATION, 0, 255)))
            .unwrap();

        let Some(ControlResponse::Data(config)) = probe.last_response() else {
            panic!("configuration descriptor not served");
        };
        assert_eq!(config[4], 2);
        assert_eq!(config[7], ATTR_BUS_POWERED | ATTR_REMOTE_WAKEUP);
        assert_eq!(usize::from(u16::from_le_bytes([config[2], config[3]])), config.len());
        assert_eq!(protocol::descriptor::interfaces(&config).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_loopback_echoes_through_override() {
        let (mut usbd, probe, lb, _hb) = configured_stack();
        let out_ep = EndpointAddress::new(1, Direction::Out);

        for _ in 0..3 {
            usbd.isr_event(Event::EndpointTransferDone {
                ep: out_ep,
                status: TransferStatus::Ok,
            })
            .unwrap();
        }

        assert_eq!(usbd.class::<Loopback>(lb).unwrap().echoed, 3);
        let in_ep = EndpointAddress::new(1, Direction::In);
        let echoes = probe
            .log()
            .transfers
            .iter()
            .filter(|(ep, _)| *ep == in_ep)
            .count();
        assert_eq!(echoes, 3);
        assert!(usbd.bindings().iter().any(|b| b.overridden));
    }

    #[test]
    fn test_heartbeat_beats_on_sof_and_cleans_up() {
        let (mut usbd, _probe, _lb, hb) = configured_stack();
        assert!(usbd.sof_enabled());
        assert!(usbd.remote_wakeup_enabled());

        for frame in 0..8 {
            usbd.isr_event(Event::StartOfFrame { frame }).unwrap();
        }
        assert_eq!(usbd.class::<Heartbeat>(hb).unwrap().beats, 2);

        usbd.stop().unwrap();
        usbd.remove(hb).unwrap();
        assert!(!usbd.sof_enabled());
        assert!(!usbd.remote_wakeup_enabled());
    }
}
