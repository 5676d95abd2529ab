//! Standard request handling on the default control pipe
//!
//! Setup packets addressed to the device are served by the stack itself
//! where it owns the answer (address, configuration, status, features) and
//! by the class chain otherwise. Interface and endpoint requests are routed
//! through the dispatch table to the owning instance.

use crate::error::Error;
use crate::event::{Event, Outcome, Reply};
use crate::registry::ClassHandle;
use crate::stack::Core;
use bytes::Bytes;
use protocol::{
    FEATURE_DEVICE_REMOTE_WAKEUP, FEATURE_ENDPOINT_HALT, Recipient, RequestKind, SetupPacket,
    StandardRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Bus-level sub-state while the device is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusState {
    #[default]
    Default,
    Addressed,
    Configured,
}

/// Control-pipe state owned by the stack; cleared on bus reset
#[derive(Debug, Clone, Default)]
pub(crate) struct ControlState {
    pub(crate) bus: BusState,
    pub(crate) address: u8,
    pub(crate) configuration: u8,
    /// DEVICE_REMOTE_WAKEUP feature set by the host
    pub(crate) remote_wakeup: bool,
    pub(crate) self_powered: bool,
}

impl ControlState {
    pub(crate) fn reset(&mut self) {
        self.bus = BusState::Default;
        self.address = 0;
        self.configuration = 0;
        self.remote_wakeup = false;
    }
}

impl Core {
    /// Route a setup packet and drive the control pipe with the result
    pub(crate) fn handle_setup(&mut self, setup: SetupPacket) -> Outcome {
        let outcome = self.route_setup(setup);
        self.respond(&setup, &outcome);
        outcome
    }

    fn respond(&mut self, setup: &SetupPacket, outcome: &Outcome) {
        match outcome {
            Outcome::Handled(Reply::Data(data)) => {
                let len = data.len().min(setup.length as usize);
                self.driver.control_respond(&data[..len]);
            }
            Outcome::Handled(Reply::Ack) => self.driver.control_ack(),
            Outcome::Declined => {
                debug!(request_type = setup.request_type, request = setup.request, "unserved request, stalling");
                self.driver.control_stall();
            }
            Outcome::Failed(e) => {
                debug!(request_type = setup.request_type, request = setup.request, error = %e, "request failed, stalling");
                self.driver.control_stall();
            }
        }
    }

    pub(crate) fn route_setup(&mut self, setup: SetupPacket) -> Outcome {
        trace!(?setup, "setup");
        match (setup.recipient(), setup.kind()) {
            (Recipient::Device, RequestKind::Standard) => self.device_std_request(setup),
            (Recipient::Device | Recipient::Other, _) => {
                self.all_until_served_call(&Event::Setup(setup))
            }
            (Recipient::Interface, _) => self.interface_request(setup),
            (Recipient::Endpoint, _) => self.endpoint_request(setup),
            (Recipient::Reserved(r), _) => {
                warn!(recipient = r, "setup with reserved recipient");
                Outcome::Failed(Error::InvalidParam("reserved recipient"))
            }
        }
    }

    fn device_std_request(&mut self, setup: SetupPacket) -> Outcome {
        let Some(request) = setup.standard_request() else {
            return self.all_until_served_call(&Event::Setup(setup));
        };

        match request {
            StandardRequest::GetStatus => {
                let mut status = 0u8;
                if self.control.self_powered {
                    status |= 0x01;
                }
                if self.control.remote_wakeup {
                    status |= 0x02;
                }
                Outcome::data(vec![status, 0])
            }
            StandardRequest::SetFeature if setup.value == FEATURE_DEVICE_REMOTE_WAKEUP => {
                if !self.rwu.enabled() {
                    debug!("host tried to arm remote wakeup but no class needs it");
                    return Outcome::Failed(Error::NotSupported("remote wakeup"));
                }
                self.control.remote_wakeup = true;
                debug!("host enabled remote wakeup");
                Outcome::ack()
            }
            StandardRequest::ClearFeature if setup.value == FEATURE_DEVICE_REMOTE_WAKEUP => {
                self.control.remote_wakeup = false;
                debug!("host disabled remote wakeup");
                Outcome::ack()
            }
            StandardRequest::SetAddress => {
                self.control.address = (setup.value & 0x7F) as u8;
                self.control.bus = if self.control.address == 0 {
                    BusState::Default
                } else {
                    BusState::Addressed
                };
                info!(address = self.control.address, "address assigned");
                Outcome::ack()
            }
            StandardRequest::GetDescriptor => {
                let (ty, index) = (setup.descriptor_type(), setup.descriptor_index());
                let found = self.registry.iter().find_map(|handle| {
                    self.registry
                        .class_ref(handle)
                        .and_then(|class| class.find_descriptor(ty, index))
                        .map(Bytes::copy_from_slice)
                });
                match found {
                    Some(bytes) => Outcome::data(bytes),
                    None => {
                        debug!(descriptor_type = ty, index, "no instance provides descriptor");
                        Outcome::Failed(Error::NotFound)
                    }
                }
            }
            StandardRequest::GetConfiguration => Outcome::data(vec![self.control.configuration]),
            StandardRequest::SetConfiguration => self.set_configuration(setup),
            _ => self.all_until_served_call(&Event::Setup(setup)),
        }
    }

    fn set_configuration(&mut self, setup: SetupPacket) -> Outcome {
        if self.control.bus == BusState::Default {
            return Outcome::Failed(Error::InvalidParam("SET_CONFIGURATION before SET_ADDRESS"));
        }
        let value = setup.value & 0xFF;
        if value > 1 {
            return Outcome::Failed(Error::InvalidParam("unknown configuration value"));
        }

        let endpoints = self.table.bound_endpoints();
        if value == 0 {
            for &ep in &endpoints {
                self.driver.ep_disable(ep);
            }
            self.control.configuration = 0;
            self.control.bus = BusState::Addressed;
        } else {
            for &ep in &endpoints {
                self.driver.ep_enable(ep);
            }
            self.control.configuration = 1;
            self.control.bus = BusState::Configured;
        }
        info!(configuration = value, endpoints = endpoints.len(), "configuration selected");

        self.all_call(&Event::Setup(setup));
        Outcome::ack()
    }

    /// Interface-recipient requests, routed to the interface owner
    pub(crate) fn interface_request(&mut self, setup: SetupPacket) -> Outcome {
        let iface = setup.interface();
        let Some(owner) = self.table.interface_owner(iface) else {
            debug!(iface, "request for unbound interface");
            return Outcome::Failed(Error::NotFound);
        };

        match setup.standard_request() {
            Some(StandardRequest::GetStatus) => Outcome::data(vec![0, 0]),
            Some(StandardRequest::GetDescriptor) => self.owner_descriptor(owner, setup),
            // Alternate setting selection belongs to the class; forwarded once
            _ => self.iface_call(iface, &Event::Setup(setup)),
        }
    }

    /// Endpoint-recipient requests: halt feature handling, then the owner
    pub(crate) fn endpoint_request(&mut self, setup: SetupPacket) -> Outcome {
        let ep = match setup.endpoint() {
            Ok(ep) => ep,
            Err(e) => return Outcome::Failed(e.into()),
        };
        if !ep.is_control() && self.table.endpoint_owner(ep).is_none() {
            debug!(%ep, "request for unbound endpoint");
            return Outcome::Failed(Error::NotFound);
        }

        match setup.standard_request() {
            Some(StandardRequest::GetStatus) => {
                Outcome::data(vec![u8::from(self.driver.ep_is_stalled(ep)), 0])
            }
            Some(StandardRequest::SetFeature) if setup.value == FEATURE_ENDPOINT_HALT => {
                if ep.is_control() {
                    return Outcome::Failed(Error::InvalidParam("cannot halt endpoint 0"));
                }
                self.driver.ep_stall(ep);
                debug!(%ep, "endpoint halted by host");
                Outcome::ack()
            }
            Some(StandardRequest::ClearFeature) if setup.value == FEATURE_ENDPOINT_HALT => {
                if ep.is_control() {
                    return Outcome::Failed(Error::InvalidParam("cannot halt endpoint 0"));
                }
                self.driver.ep_clear_stall(ep);
                debug!(%ep, "endpoint halt cleared by host");
                // The owner resets its data toggle / transfer state
                if let Outcome::Failed(e) = self.ep_call(ep, &Event::Setup(setup)) {
                    debug!(%ep, error = %e, "owner failed to observe halt clear");
                }
                Outcome::ack()
            }
            Some(StandardRequest::GetDescriptor) if !ep.is_control() => {
                match self.table.endpoint_owner(ep) {
                    Some(owner) => self.owner_descriptor(owner, setup),
                    None => Outcome::Failed(Error::NotFound),
                }
            }
            _ if ep.is_control() => Outcome::Failed(Error::NotFound),
            _ => self.ep_call(ep, &Event::Setup(setup)),
        }
    }

    fn owner_descriptor(&self, owner: ClassHandle, setup: SetupPacket) -> Outcome {
        match self.find_descriptor(owner, setup.descriptor_type(), setup.descriptor_index()) {
            Ok(Some(desc)) => Outcome::data(Bytes::copy_from_slice(desc)),
            Ok(None) => Outcome::Failed(Error::NotFound),
            Err(e) => Outcome::Failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_keeps_power_source() {
        let mut control = ControlState {
            bus: BusState::Configured,
            address: 5,
            configuration: 1,
            remote_wakeup: true,
            self_powered: true,
        };
        control.reset();
        assert_eq!(control.bus, BusState::Default);
        assert_eq!(control.address, 0);
        assert_eq!(control.configuration, 0);
        assert!(!control.remote_wakeup);
        assert!(control.self_powered);
    }
}
