//! Shutdown Coordinator.
//!
//! Idempotent: both shutdown paths — a `SHUTDOWN_UNIVERSE` message counted
//! out over its ten-minute window, and a process signal (Ctrl-C / SIGTERM)
//! — call [`ShutdownCoordinator::begin`], and the second call is a no-op.
//! The coordinator itself only decides *what* to broadcast and *when* the
//! drain is over; [`crate::control::ControlLoop`] keeps servicing inbound
//! protocol during the drain exactly as it does on every other tick.

use std::time::{Duration, Instant};

use crate::instance::manager::{InstanceManager, Outbound};
use crate::message::Message;

/// Drain window for the shutdown coordinator's instance drain.
pub const DRAIN_WINDOW: Duration = crate::config::SHUTDOWN_DRAIN_WINDOW;

/// Orderly drain of the instance fleet with a bounded timeout.
pub struct ShutdownCoordinator {
    deadline: Option<Instant>,
}

impl ShutdownCoordinator {
    /// No shutdown in progress.
    pub fn new() -> ShutdownCoordinator {
        ShutdownCoordinator { deadline: None }
    }

    /// Whether a drain is currently in progress.
    pub fn is_draining(&self) -> bool {
        self.deadline.is_some()
    }

    /// Starts the drain if one isn't already running: returns a `Shutdown`
    /// addressed to every live instance for the caller to send — addressed
    /// individually rather than a transport-wide broadcast, since the
    /// transport's other peer is the chat relay, not an instance. Returns
    /// an empty vec on a repeat call (idempotent).
    pub fn begin(&mut self, instances: &InstanceManager) -> Vec<Outbound> {
        if self.deadline.is_some() {
            return Vec::new();
        }

        self.deadline = Some(Instant::now() + DRAIN_WINDOW);
        instances.all_sys_addrs().into_iter().map(|addr| Outbound::ToPeer(addr, Message::Shutdown)).collect()
    }

    /// Whether the drain should stop: every instance has reported
    /// `shutdownComplete`, or the 60-second window has elapsed. Always
    /// `false` before `begin` is called.
    pub fn is_drain_complete(&self, instances: &InstanceManager) -> bool {
        match self.deadline {
            None => false,
            Some(deadline) => instances.all_shutdown_complete() || Instant::now() >= deadline,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> ShutdownCoordinator {
        ShutdownCoordinator::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    fn empty_manager() -> InstanceManager {
        InstanceManager::new(PathBuf::from("/bin/true"), false)
    }

    #[test]
    fn begin_is_idempotent() {
        let mgr = empty_manager();
        let mut coordinator = ShutdownCoordinator::new();

        coordinator.begin(&mgr);
        assert!(coordinator.is_draining());
        assert!(coordinator.begin(&mgr).is_empty(), "a second begin must not re-broadcast");
    }

    #[test]
    fn drain_is_immediately_complete_with_no_instances() {
        let mgr = empty_manager();
        let mut coordinator = ShutdownCoordinator::new();

        assert!(!coordinator.is_drain_complete(&mgr), "not draining yet");
        coordinator.begin(&mgr);
        assert!(coordinator.is_drain_complete(&mgr), "an empty fleet drains instantly");
    }
}
