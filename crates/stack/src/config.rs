//! Stack configuration
//!
//! The delivery policy is a single enum so that a forward hook (immediate
//! mode) and an interrupt observer (buffered mode) can never both be set.

use crate::bridge::{ForwardHook, IsrObserver, StateNotifier};
use crate::event::Event;
use std::fmt;
use std::sync::Arc;

/// Default depth of the interrupt-to-task ring
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// How raw bus events and application requests reach the dispatch path
pub enum Delivery {
    /// Execute in the calling context, or hand over to `forward` if set
    Immediate { forward: Option<ForwardHook> },
    /// Queue in a bounded ring drained by `UsbdStack::process_queue`
    Buffered {
        capacity: usize,
        isr_observer: Option<IsrObserver>,
    },
}

impl Default for Delivery {
    fn default() -> Self {
        Delivery::Immediate { forward: None }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Immediate { forward } => f
                .debug_struct("Immediate")
                .field("forward", &forward.is_some())
                .finish(),
            Delivery::Buffered {
                capacity,
                isr_observer,
            } => f
                .debug_struct("Buffered")
                .field("capacity", capacity)
                .field("isr_observer", &isr_observer.is_some())
                .finish(),
        }
    }
}

#[derive(Default)]
pub struct StackConfig {
    pub delivery: Delivery,
    /// Called from task context on every confirmed state change
    pub state_notifier: Option<StateNotifier>,
    /// Generate SOF even when no instance subscribed
    pub enable_sof: bool,
    /// Reported in the device GET_STATUS response
    pub self_powered: bool,
}

impl StackConfig {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn buffered(capacity: usize) -> Self {
        Self {
            delivery: Delivery::Buffered {
                capacity,
                isr_observer: None,
            },
            ..Self::default()
        }
    }

    /// Selects immediate delivery with a forward hook
    pub fn with_forward_hook(mut self, hook: impl FnMut(Event) + Send + 'static) -> Self {
        self.delivery = Delivery::Immediate {
            forward: Some(Box::new(hook)),
        };
        self
    }

    /// Selects buffered delivery (keeping any capacity already chosen)
    pub fn with_isr_observer(
        mut self,
        observer: impl Fn(&Event, bool) + Send + Sync + 'static,
    ) -> Self {
        let capacity = match self.delivery {
            Delivery::Buffered { capacity, .. } => capacity,
            Delivery::Immediate { .. } => DEFAULT_QUEUE_CAPACITY,
        };
        self.delivery = Delivery::Buffered {
            capacity,
            isr_observer: Some(Arc::new(observer)),
        };
        self
    }

    pub fn with_state_notifier(
        mut self,
        notifier: impl FnMut(&Event) + Send + 'static,
    ) -> Self {
        self.state_notifier = Some(Box::new(notifier));
        self
    }

    pub fn with_sof(mut self, enable_sof: bool) -> Self {
        self.enable_sof = enable_sof;
        self
    }

    pub fn with_self_powered(mut self, self_powered: bool) -> Self {
        self.self_powered = self_powered;
        self
    }

    pub fn is_buffered(&self) -> bool {
        matches!(self.delivery, Delivery::Buffered { .. })
    }
}

impl fmt::Debug for StackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackConfig")
            .field("delivery", &self.delivery)
            .field("state_notifier", &self.state_notifier.is_some())
            .field("enable_sof", &self.enable_sof)
            .field("self_powered", &self.self_powered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_immediate() {
        let config = StackConfig::default();
        assert!(!config.is_buffered());
        assert!(!config.enable_sof);
        assert!(config.state_notifier.is_none());
    }

    #[test]
    fn test_observer_switches_to_buffered() {
        let config = StackConfig::immediate().with_isr_observer(|_, _| {});
        match config.delivery {
            Delivery::Buffered {
                capacity,
                isr_observer,
            } => {
                assert_eq!(capacity, DEFAULT_QUEUE_CAPACITY);
                assert!(isr_observer.is_some());
            }
            other => panic!("unexpected delivery {other:?}"),
        }

        let config = StackConfig::buffered(8).with_isr_observer(|_, _| {});
        assert!(matches!(config.delivery, Delivery::Buffered { capacity: 8, .. }));
    }

    #[test]
    fn test_forward_hook_replaces_buffered() {
        let config = StackConfig::buffered(8).with_forward_hook(|_| {});
        assert!(matches!(
            config.delivery,
            Delivery::Immediate { forward: Some(_) }
        ));
    }

    #[test]
    fn test_debug_hides_closures() {
        let config = StackConfig::buffered(4).with_sof(true);
        let text = format!("{config:?}");
        assert!(text.contains("capacity: 4"));
        assert!(text.contains("enable_sof: true"));
    }
}
