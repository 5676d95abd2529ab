//! Async channel bridge between the Tokio runtime and the stack thread
//!
//! The device stack is single-threaded and owned by one worker thread.
//! Tokio tasks talk to it through commands, and the worker reports back
//! through notifications. Both directions are bounded `async-channel`s so a
//! stalled side applies backpressure instead of growing without limit.

use async_channel::{Receiver, Sender, bounded};

/// Capacity used by callers that have no better number
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Handle for the Tokio runtime (async)
pub struct ControlBridge<C, N> {
    cmd_tx: Sender<C>,
    notify_rx: Receiver<N>,
}

// Manual impl: a derive would require `C: Clone` and `N: Clone`
impl<C, N> Clone for ControlBridge<C, N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            notify_rx: self.notify_rx.clone(),
        }
    }
}

impl<C, N> ControlBridge<C, N> {
    /// Send a command to the worker thread
    pub async fn send_command(&self, cmd: C) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| crate::Error::Channel("worker thread is gone".to_string()))
    }

    /// Receive a notification from the worker thread
    pub async fn recv_notification(&self) -> crate::Result<N> {
        self.notify_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Whether the worker dropped its end
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Handle for the worker thread (blocking)
pub struct ControlWorker<C, N> {
    cmd_rx: Receiver<C>,
    notify_tx: Sender<N>,
}

impl<C, N> ControlWorker<C, N> {
    /// Receive a command from the Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<C> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<C> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send a notification to the Tokio runtime (blocking)
    pub fn send_notification(&self, notification: N) -> crate::Result<()> {
        self.notify_tx
            .send_blocking(notification)
            .map_err(|_| crate::Error::Channel("runtime side is gone".to_string()))
    }
}

/// Create the channel bridge between Tokio and the worker thread
///
/// Returns (ControlBridge for Tokio, ControlWorker for the worker thread).
/// A capacity of zero is raised to one.
pub fn create_control_bridge<C, N>(capacity: usize) -> (ControlBridge<C, N>, ControlWorker<C, N>) {
    let capacity = capacity.max(1);
    let (cmd_tx, cmd_rx) = bounded(capacity);
    let (notify_tx, notify_rx) = bounded(capacity);

    (
        ControlBridge { cmd_tx, notify_rx },
        ControlWorker { cmd_rx, notify_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_recv_empty() {
        let (_bridge, worker) = create_control_bridge::<u32, ()>(4);
        assert!(worker.try_recv_command().is_none());
    }

    #[test]
    fn test_worker_reports_closed_runtime() {
        let (bridge, worker) = create_control_bridge::<u32, u32>(4);
        drop(bridge);
        assert!(matches!(
            worker.send_notification(1),
            Err(crate::Error::Channel(_))
        ));
        assert!(worker.recv_command().is_err());
    }
}
