//! Interface/endpoint ownership and the dispatch primitives
//!
//! The table maps every interface number and endpoint address to the
//! instance that claimed it, plus an optional replacement handler for
//! endpoints. Ownership only changes through append/remove; a handler
//! override only changes which function sees the events.

use crate::class::{ClassContext, EndpointHandler};
use crate::error::{Error, Result};
use crate::event::{Event, Outcome};
use crate::registry::ClassHandle;
use crate::stack::Core;
use crate::state::DeviceState;
use protocol::{ENDPOINT_SLOTS, EndpointAddress};
use serde::Serialize;
use tracing::{debug, trace, warn};

/// Number of interface bindings
pub const INTERFACE_SLOTS: usize = 32;

#[derive(Clone, Copy)]
struct EndpointBinding {
    owner: ClassHandle,
    handler: Option<EndpointHandler>,
}

/// What a binding points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingTarget {
    Interface(u8),
    Endpoint(EndpointAddress),
}

/// Read-only view of one live binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindingView {
    pub target: BindingTarget,
    pub owner: ClassHandle,
    /// An explicit endpoint handler replaces the owner's default one
    pub overridden: bool,
}

pub(crate) struct DispatchTable {
    interfaces: [Option<ClassHandle>; INTERFACE_SLOTS],
    endpoints: [Option<EndpointBinding>; ENDPOINT_SLOTS],
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub(crate) fn new() -> Self {
        Self {
            interfaces: [None; INTERFACE_SLOTS],
            endpoints: [None; ENDPOINT_SLOTS],
        }
    }

    pub(crate) fn claim_interface(&mut self, iface: u8, owner: ClassHandle) -> Result<()> {
        let slot = self
            .interfaces
            .get_mut(iface as usize)
            .ok_or(Error::InvalidParam("interface number out of range"))?;
        if slot.is_some() {
            return Err(Error::AlreadyAssigned);
        }
        *slot = Some(owner);
        Ok(())
    }

    pub(crate) fn claim_endpoint(&mut self, ep: EndpointAddress, owner: ClassHandle) -> Result<()> {
        if ep.is_control() {
            return Err(Error::InvalidParam("endpoint 0 belongs to the stack"));
        }
        let slot = &mut self.endpoints[ep.index()];
        if slot.is_some() {
            return Err(Error::AlreadyAssigned);
        }
        *slot = Some(EndpointBinding {
            owner,
            handler: None,
        });
        Ok(())
    }

    pub(crate) fn release_interface(&mut self, iface: u8) {
        if let Some(slot) = self.interfaces.get_mut(iface as usize) {
            *slot = None;
        }
    }

    pub(crate) fn release_endpoint(&mut self, ep: EndpointAddress) {
        self.endpoints[ep.index()] = None;
    }

    /// Drop every binding owned by `owner`; returns how many were released
    pub(crate) fn release_owner(&mut self, owner: ClassHandle) -> usize {
        let mut released = 0;
        for slot in self.interfaces.iter_mut() {
            if *slot == Some(owner) {
                *slot = None;
                released += 1;
            }
        }
        for slot in self.endpoints.iter_mut() {
            if slot.is_some_and(|b| b.owner == owner) {
                *slot = None;
                released += 1;
            }
        }
        released
    }

    pub(crate) fn interface_owner(&self, iface: u8) -> Option<ClassHandle> {
        self.interfaces.get(iface as usize).copied().flatten()
    }

    pub(crate) fn endpoint_owner(&self, ep: EndpointAddress) -> Option<ClassHandle> {
        self.endpoints[ep.index()].map(|b| b.owner)
    }

    fn endpoint_binding(&self, ep: EndpointAddress) -> Option<EndpointBinding> {
        self.endpoints[ep.index()]
    }

    /// Install a replacement handler; only the current owner may do this
    pub(crate) fn set_handler(
        &mut self,
        owner: ClassHandle,
        ep: EndpointAddress,
        handler: EndpointHandler,
    ) -> Result<()> {
        match self.endpoints[ep.index()].as_mut() {
            Some(binding) if binding.owner == owner => {
                binding.handler = Some(handler);
                Ok(())
            }
            Some(_) => Err(Error::InvalidParam("endpoint owned by another instance")),
            None => Err(Error::InvalidParam("endpoint not claimed")),
        }
    }

    /// Endpoints that currently have an owner, in slot order
    pub(crate) fn bound_endpoints(&self) -> Vec<EndpointAddress> {
        self.endpoints
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .filter_map(|(index, _)| EndpointAddress::from_index(index))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<BindingView> {
        let interfaces = self
            .interfaces
            .iter()
            .enumerate()
            .filter_map(|(iface, owner)| {
                owner.map(|owner| BindingView {
                    target: BindingTarget::Interface(iface as u8),
                    owner,
                    overridden: false,
                })
            });
        let endpoints = self
            .endpoints
            .iter()
            .enumerate()
            .filter_map(|(index, binding)| {
                let binding = binding.as_ref()?;
                Some(BindingView {
                    target: BindingTarget::Endpoint(EndpointAddress::from_index(index)?),
                    owner: binding.owner,
                    overridden: binding.handler.is_some(),
                })
            });
        interfaces.chain(endpoints).collect()
    }
}

impl Core {
    /// Run one handler with the instance moved out of its slot
    ///
    /// `via` selects an endpoint override instead of the instance's own
    /// `event` method. A target that is already executing cannot be entered
    /// again and reports `InvalidState`.
    pub(crate) fn invoke(
        &mut self,
        handle: ClassHandle,
        event: &Event,
        via: Option<EndpointHandler>,
    ) -> Outcome {
        if !self.registry.is_live(handle) {
            return Outcome::Failed(Error::NotFound);
        }
        let Some(mut class) = self.registry.take_class(handle) else {
            warn!(%handle, event = event.name(), "re-entrant dispatch into an executing instance");
            return Outcome::Failed(Error::InvalidState {
                op: "dispatch (instance busy)",
                state: self.state.state(),
            });
        };

        let outcome = {
            let mut ctx = ClassContext::new(handle, self);
            match via {
                Some(handler) => handler(class.as_mut(), &mut ctx, event),
                None => class.event(&mut ctx, event),
            }
        };
        self.registry.restore_class(handle, class);

        trace!(%handle, event = event.name(), ?outcome, "dispatched");
        outcome
    }

    pub(crate) fn iface_call(&mut self, iface: u8, event: &Event) -> Outcome {
        match self.table.interface_owner(iface) {
            Some(owner) => self.invoke(owner, event, None),
            None => {
                debug!(iface, event = event.name(), "interface not bound");
                Outcome::Failed(Error::NotFound)
            }
        }
    }

    pub(crate) fn ep_call(&mut self, ep: EndpointAddress, event: &Event) -> Outcome {
        match self.table.endpoint_binding(ep) {
            Some(binding) => self.invoke(binding.owner, event, binding.handler),
            None => {
                debug!(%ep, event = event.name(), "endpoint not bound");
                Outcome::Failed(Error::NotFound)
            }
        }
    }

    /// Offer the event to every instance in chain order, ignoring results
    pub(crate) fn all_call(&mut self, event: &Event) {
        let mut cursor = self.registry.head();
        while let Some(handle) = cursor {
            cursor = self.registry.next(handle);
            if self.registry.is_busy(handle) {
                continue;
            }
            if let Outcome::Failed(e) = self.invoke(handle, event, None) {
                debug!(%handle, event = event.name(), error = %e, "broadcast handler failed");
            }
        }
    }

    /// First instance in chain order that does not decline wins
    pub(crate) fn all_until_served_call(&mut self, event: &Event) -> Outcome {
        let mut cursor = self.registry.head();
        while let Some(handle) = cursor {
            cursor = self.registry.next(handle);
            if self.registry.is_busy(handle) {
                continue;
            }
            let outcome = self.invoke(handle, event, None);
            if !outcome.is_declined() {
                return outcome;
            }
        }
        Outcome::Declined
    }

    pub(crate) fn set_endpoint_handler(
        &mut self,
        owner: ClassHandle,
        ep: EndpointAddress,
        handler: EndpointHandler,
    ) -> Result<()> {
        self.state.require("set_endpoint_handler", DeviceState::Disabled)?;
        if !self.registry.is_live(owner) {
            return Err(Error::NotFound);
        }
        self.table.set_handler(owner, ep, handler)?;
        debug!(%owner, %ep, "endpoint handler overridden");
        Ok(())
    }
}
