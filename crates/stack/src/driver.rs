//! Hardware collaborator
//!
//! The low-level peripheral driver is opaque to the stack: it raises raw bus
//! events (see [`crate::UsbdStack::isr_event`] and [`crate::InterruptHandle`])
//! and accepts the commands below.

use protocol::EndpointAddress;

pub trait DeviceDriver: Send {
    /// Power the peripheral (may start requesting clocks on bus reset)
    fn enable(&mut self);

    /// Release the peripheral and its power resources
    fn disable(&mut self);

    fn is_enabled(&self) -> bool;

    /// Enable interrupts and pull-ups
    ///
    /// Returns `false` when startup was abandoned, e.g. the supply glitched
    /// or the cable was unplugged mid-sequence. That is not an error: the
    /// stack simply stays disabled and emits no confirmation.
    fn start(&mut self, enable_sof: bool) -> bool;

    /// Disable interrupts and pull-ups; the host sees a disconnect
    fn stop(&mut self);

    fn set_sof_enabled(&mut self, enabled: bool);

    /// Enter low-power mode after a bus suspend
    ///
    /// Returns `false` if bus activity resumed before the transition.
    fn suspend(&mut self) -> bool;

    /// Drive resume signalling on a suspended bus
    fn remote_wakeup(&mut self);

    fn ep_enable(&mut self, ep: EndpointAddress);
    fn ep_disable(&mut self, ep: EndpointAddress);

    /// Arm an endpoint with a transfer buffer
    fn ep_transfer(&mut self, ep: EndpointAddress, data: &[u8]);

    fn ep_stall(&mut self, ep: EndpointAddress);
    fn ep_clear_stall(&mut self, ep: EndpointAddress);
    fn ep_is_stalled(&self, ep: EndpointAddress) -> bool;

    /// Data stage of the current control transfer
    fn control_respond(&mut self, data: &[u8]);

    /// Status stage of a control transfer with no data stage
    fn control_ack(&mut self);

    fn control_stall(&mut self);
}
