//! Class driver capability
//!
//! A class instance is a pluggable protocol implementation: it publishes a
//! descriptor blob, owns the interfaces and endpoints that blob declares, and
//! reacts to routed events. While a handler runs it receives a
//! [`ClassContext`], the slice of the stack it is allowed to touch.

use crate::driver::DeviceDriver;
use crate::error::Result;
use crate::event::{Event, Outcome};
use crate::registry::ClassHandle;
use crate::stack::Core;
use crate::state::DeviceState;
use protocol::{EndpointAddress, descriptor};
use std::any::Any;

/// Interfaces and endpoints an instance claims when appended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    pub interfaces: Vec<u8>,
    pub endpoints: Vec<EndpointAddress>,
}

impl Claims {
    /// Everything the INTERFACE and ENDPOINT records of a blob declare
    pub fn from_descriptors(blob: &[u8]) -> protocol::Result<Self> {
        Ok(Self {
            interfaces: descriptor::interfaces(blob)?,
            endpoints: descriptor::endpoints(blob)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty() && self.endpoints.is_empty()
    }
}

pub trait UsbClass: Any + Send + 'static {
    /// Descriptor blob (interface, endpoint and class-specific records)
    fn descriptors(&self) -> &[u8];

    /// Handle an event routed to this instance
    fn event(&mut self, ctx: &mut ClassContext<'_>, event: &Event) -> Outcome;

    /// Interfaces/endpoints to claim; derived from the blob by default
    fn claims(&self) -> protocol::Result<Claims> {
        Claims::from_descriptors(self.descriptors())
    }

    /// Locate a descriptor by `(type, index)` for GET_DESCRIPTOR
    ///
    /// Override to serve descriptors that do not live in the blob, such as
    /// report descriptors.
    fn find_descriptor(&self, descriptor_type: u8, index: u8) -> Option<&[u8]> {
        let blob = self.descriptors();
        descriptor::find(blob, descriptor_type, index).map(|range| &blob[range])
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Replacement endpoint handler installed with `set_endpoint_handler`
///
/// Receives the owning instance; use [`downcast_mut`] to reach its concrete type.
pub type EndpointHandler = fn(&mut dyn UsbClass, &mut ClassContext<'_>, &Event) -> Outcome;

pub fn downcast_ref<T: UsbClass>(class: &dyn UsbClass) -> Option<&T> {
    (class as &dyn Any).downcast_ref::<T>()
}

pub fn downcast_mut<T: UsbClass>(class: &mut dyn UsbClass) -> Option<&mut T> {
    (class as &mut dyn Any).downcast_mut::<T>()
}

/// What a running handler may do to the stack on its own behalf
pub struct ClassContext<'a> {
    handle: ClassHandle,
    core: &'a mut Core,
}

impl<'a> ClassContext<'a> {
    pub(crate) fn new(handle: ClassHandle, core: &'a mut Core) -> Self {
        Self { handle, core }
    }

    /// Handle of the instance this context belongs to
    pub fn handle(&self) -> ClassHandle {
        self.handle
    }

    pub fn device_state(&self) -> DeviceState {
        self.core.state.state()
    }

    /// Current configuration value set by the host (0 = unconfigured)
    pub fn configuration(&self) -> u8 {
        self.core.control.configuration
    }

    pub fn sof_register(&mut self) -> Result<()> {
        self.core.sof_register(self.handle)
    }

    pub fn sof_unregister(&mut self) -> Result<()> {
        self.core.sof_unregister(self.handle)
    }

    pub fn sof_enabled(&self) -> bool {
        self.core.sof_required()
    }

    pub fn remote_wakeup_register(&mut self) -> Result<()> {
        self.core.remote_wakeup_register(self.handle)
    }

    pub fn remote_wakeup_unregister(&mut self) -> Result<()> {
        self.core.remote_wakeup_unregister(self.handle)
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        self.core.rwu.enabled()
    }

    /// Redirect events of one of this instance's endpoints
    pub fn set_endpoint_handler(
        &mut self,
        ep: EndpointAddress,
        handler: EndpointHandler,
    ) -> Result<()> {
        self.core.set_endpoint_handler(self.handle, ep, handler)
    }

    pub fn driver(&mut self) -> &mut dyn DeviceDriver {
        self.core.driver.as_mut()
    }
}
