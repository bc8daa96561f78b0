//! Instance lifecycle: the [`Instance`] data model, the
//! [`registry::InstanceRegistry`] that indexes instances, and the
//! [`manager::InstanceManager`] that resolves zones to instances and runs
//! the affirmation handshake.

pub mod manager;
pub mod registry;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use crate::config::{DEFAULT_HARD_CAP, DEFAULT_SOFT_CAP};

/// Stable transport-level peer identity: `(binaryAddress, port)`, comparable
/// by value.
pub type SysAddr = SocketAddr;

/// A client's request to enter a zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: u64,
    pub mythran_shift: bool,
    pub requester: SysAddr,
}

/// One running world-server process.
#[derive(Debug)]
pub struct Instance {
    pub map_id: u16,
    pub clone_id: u32,
    pub instance_id: u16,
    pub port: u16,
    pub ip: String,
    pub sys_addr: SysAddr,

    pub ready: bool,
    pub shutting_down: bool,
    pub shutdown_complete: bool,

    pub soft_cap: u32,
    pub hard_cap: u32,
    /// Player count only — no operation anywhere reads anything but
    /// cardinality (see DESIGN.md, Open Question on the `players` field).
    pub players: u32,

    pub pending_requests: VecDeque<TransferRequest>,
    /// Keyed by `requestID` so `AFFIRM_TRANSFER_RESPONSE` can remove by ID
    /// in O(1) instead of a linear scan.
    pub pending_affirmations: HashMap<u64, TransferRequest>,
    pub affirmation_timeout: u32,

    pub private_password: Option<String>,
}

impl Instance {
    /// Constructs a freshly spawned instance: not ready, no players, default caps.
    pub fn spawned(map_id: u16, clone_id: u32, instance_id: u16, ip: String, port: u16, sys_addr: SysAddr) -> Instance {
        Instance {
            map_id,
            clone_id,
            instance_id,
            port,
            ip,
            sys_addr,
            ready: false,
            shutting_down: false,
            shutdown_complete: false,
            soft_cap: DEFAULT_SOFT_CAP,
            hard_cap: DEFAULT_HARD_CAP,
            players: 0,
            pending_requests: VecDeque::new(),
            pending_affirmations: HashMap::new(),
            affirmation_timeout: 0,
            private_password: None,
        }
    }

    /// The `(mapID, cloneID, instanceID)` key that must be unique across the
    /// registry.
    pub fn key(&self) -> (u16, u32, u16) {
        (self.map_id, self.clone_id, self.instance_id)
    }

    /// Whether a new pending request may currently be enqueued: while
    /// `shuttingDown`, no new pending requests may be enqueued.
    pub fn accepts_pending(&self) -> bool {
        !self.shutting_down
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    #[test]
    fn a_freshly_spawned_instance_accepts_pending_requests() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100);
        let instance = Instance::spawned(1200, 0, 1, "10.0.0.5".to_owned(), 9100, addr);

        assert!(!instance.ready);
        assert!(instance.accepts_pending());
    }

    #[test]
    fn a_shutting_down_instance_no_longer_accepts_pending_requests() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9100);
        let mut instance = Instance::spawned(1200, 0, 1, "10.0.0.5".to_owned(), 9100, addr);

        instance.shutting_down = true;
        assert!(!instance.accepts_pending());
    }
}
