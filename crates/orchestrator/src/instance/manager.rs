//! Instance Manager: zone-to-instance resolution, process launch,
//! ready-gating, the pending-request queue, the two-phase affirmation
//! handshake, and affirmation-timeout redirection.

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::AFFIRMATION_TIMEOUT_TICKS;
use crate::message::Message;
use crate::process::{self, SpawnArgs};

use super::registry::{InstanceHandle, InstanceRegistry};
use super::{Instance, SysAddr, TransferRequest};

/// A message this component wants sent out, either to one peer or to every
/// connected peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ToPeer(SysAddr, Message),
    Broadcast(Message),
}

/// Owns the [`InstanceRegistry`] and the policy for filling it.
pub struct InstanceManager {
    registry: InstanceRegistry,
    world_binary: PathBuf,
    use_sudo: bool,
    next_instance_id: u16,
}

impl InstanceManager {
    /// Creates a manager with an empty registry.
    pub fn new(world_binary: PathBuf, use_sudo: bool) -> InstanceManager {
        InstanceManager { registry: InstanceRegistry::new(), world_binary, use_sudo, next_instance_id: 1 }
    }

    /// Read-only access to the underlying registry, for diagnostics and
    /// `GET_INSTANCES`.
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Picks the next instance ID for `map_id`, skipping any value already
    /// occupied in the registry. Collisions arise after crash recovery:
    /// `handle_server_info` bumps `next_instance_id` past every ID a
    /// reconnecting world reports, but a defensive skip here guards against
    /// a `SERVER_INFO` that never arrives (e.g. the world is still down)
    /// leaving a stale reservation behind.
    fn allocate_instance_id(&mut self, map_id: u16) -> u16 {
        loop {
            let id = self.next_instance_id;
            self.next_instance_id = self.next_instance_id.wrapping_add(1);
            if self.registry.find_by_map_and_instance(map_id, id).is_none() {
                return id;
            }
        }
    }

    /// Spawns a new world-server process for `(map_id, clone_id)` and inserts
    /// a not-ready [`Instance`] for it.
    pub async fn launch(&mut self, map_id: u16, clone_id: u32, external_ip: &str) -> anyhow::Result<InstanceHandle> {
        let port = process::choose_free_port(external_ip).await?;
        let instance_id = self.allocate_instance_id(map_id);

        process::spawn_world(
            &self.world_binary,
            &SpawnArgs {
                ip: external_ip,
                port,
                map_id,
                instance_id,
                clone_id,
                max_players: crate::config::DEFAULT_HARD_CAP,
            },
            self.use_sudo,
        )?;

        let sys_addr: SocketAddr = format!("{external_ip}:{port}").parse()?;
        let instance = Instance::spawned(map_id, clone_id, instance_id, external_ip.to_owned(), port, sys_addr);

        Ok(self.registry.add(instance))
    }

    /// `getInstance(mapID, cloneID)`: reuses an existing, non-shutting-down,
    /// non-private instance under its soft cap, or launches a new one.
    pub async fn resolve_zone(&mut self, map_id: u16, clone_id: u32, external_ip: &str) -> anyhow::Result<InstanceHandle> {
        for handle in self.registry.find_by_map_id(map_id) {
            let Some(instance) = self.registry.get(handle) else { continue };

            if !instance.shutting_down && instance.private_password.is_none() && instance.players < instance.soft_cap {
                return Ok(handle);
            }
        }

        self.launch(map_id, clone_id, external_ip).await
    }

    /// `CREATE_PRIVATE_ZONE`: always launches a fresh instance (never reuses
    /// an existing one) and marks it ready immediately — private zones skip
    /// the affirmation handshake entirely.
    pub async fn create_private_zone(
        &mut self,
        map_id: u32,
        clone_id: u32,
        password: String,
        external_ip: &str,
    ) -> anyhow::Result<InstanceHandle> {
        let handle = self.launch(map_id as u16, clone_id, external_ip).await?;
        self.registry.set_private_password(handle, password);

        if let Some(instance) = self.registry.get_mut(handle) {
            instance.ready = true;
        }

        Ok(handle)
    }

    /// `REQUEST_ZONE_TRANSFER`: resolves (or spawns) an instance, then either
    /// starts the affirmation handshake if it's ready or enqueues the
    /// request if it isn't.
    pub async fn request_zone_transfer(
        &mut self,
        req: TransferRequest,
        map_id: u32,
        clone_id: u32,
        external_ip: &str,
    ) -> anyhow::Result<Vec<Outbound>> {
        let handle = self.resolve_zone(map_id as u16, clone_id, external_ip).await?;
        let instance = self.registry.get_mut(handle).expect("resolve_zone always returns a valid handle");

        if instance.ready {
            let prep = Outbound::ToPeer(instance.sys_addr, Message::PrepZone { zone_id: instance.map_id as i32 });
            instance.pending_affirmations.insert(req.request_id, req);
            Ok(vec![prep])
        } else {
            instance.pending_requests.push_back(req);
            Ok(vec![])
        }
    }

    /// `WORLD_READY`: marks the instance ready (monotonically — a no-op if
    /// already ready) and drains its pending queue into the affirmation
    /// handshake.
    pub fn world_ready(&mut self, zone_id: u16, instance_id: u16) -> Vec<Outbound> {
        let Some(handle) = self.registry.find_by_map_and_instance(zone_id, instance_id) else {
            tracing::debug!(zone_id, instance_id, "WORLD_READY for an unknown instance");
            return Vec::new();
        };

        let instance = self.registry.get_mut(handle).expect("handle just looked up");
        instance.ready = true;

        let mut outbound = Vec::with_capacity(instance.pending_requests.len());
        while let Some(req) = instance.pending_requests.pop_front() {
            outbound.push(Outbound::ToPeer(instance.sys_addr, Message::PrepZone { zone_id: instance.map_id as i32 }));
            instance.pending_affirmations.insert(req.request_id, req);
        }

        outbound
    }

    /// `AFFIRM_TRANSFER_RESPONSE`: completes the handshake and returns the
    /// `ZONE_TRANSFER_RESPONSE` to send to the original requester. `None` if
    /// the reporting peer is unknown or the request ID is stale.
    pub fn affirm_transfer(&mut self, instance_peer: SysAddr, request_id: u64) -> Option<Outbound> {
        let handle = self.registry.get_by_sys_addr(instance_peer)?;
        let instance = self.registry.get_mut(handle)?;
        let req = instance.pending_affirmations.remove(&request_id)?;

        Some(Outbound::ToPeer(
            req.requester,
            Message::ZoneTransferResponse {
                request_id: req.request_id,
                mythran_shift: req.mythran_shift,
                map_id: instance.map_id,
                instance_id: instance.instance_id,
                clone_id: instance.clone_id,
                ip: instance.ip.clone(),
                port: instance.port,
            },
        ))
    }

    /// `REQUEST_PRIVATE_ZONE`: responds immediately without affirmation, or
    /// `None` if no instance was created with this password (the caller is
    /// expected to time out).
    pub fn request_private_zone(
        &self,
        password: &str,
        request_id: u64,
        mythran_shift: bool,
        requester: SysAddr,
    ) -> Option<Outbound> {
        let handle = self.registry.find_private(password)?;
        let instance = self.registry.get(handle)?;

        Some(Outbound::ToPeer(
            requester,
            Message::ZoneTransferResponse {
                request_id,
                mythran_shift,
                map_id: instance.map_id,
                instance_id: instance.instance_id,
                clone_id: instance.clone_id,
                ip: instance.ip.clone(),
                port: instance.port,
            },
        ))
    }

    /// `PLAYER_ADDED` / `PLAYER_REMOVED`: adjusts the tracked player count.
    /// Silently a no-op for an unknown instance.
    pub fn adjust_player_count(&mut self, map_id: u16, instance_id: u16, delta: i64) {
        let Some(handle) = self.registry.find_by_map_and_instance(map_id, instance_id) else { return };
        let Some(instance) = self.registry.get_mut(handle) else { return };

        instance.players = (instance.players as i64 + delta).clamp(0, u32::MAX as i64) as u32;
    }

    /// Advances every instance's affirmation timeout by one tick, redirecting
    /// any instance that has been wedged for [`AFFIRMATION_TIMEOUT_TICKS`].
    pub async fn tick_affirmation_timeouts(&mut self, external_ip: &str) -> anyhow::Result<Vec<Outbound>> {
        let mut outbound = Vec::new();
        let mut wedged = Vec::new();

        for handle in self.registry.handles() {
            let Some(instance) = self.registry.get_mut(handle) else { continue };

            if instance.pending_affirmations.is_empty() {
                instance.affirmation_timeout = 0;
                continue;
            }

            instance.affirmation_timeout += 1;
            if instance.affirmation_timeout >= AFFIRMATION_TIMEOUT_TICKS {
                wedged.push(handle);
            }
        }

        for handle in wedged {
            outbound.extend(self.shut_down_and_redirect(handle, external_ip).await?);
        }

        Ok(outbound)
    }

    /// Marks `handle` shutting down, sends it `Shutdown`, and redirects every
    /// request it was holding (queued or mid-affirmation) to a freshly
    /// resolved instance for the same `(mapID, cloneID)`. Shared by the
    /// timeout path and the explicit `SHUTDOWN_INSTANCE` command. A no-op if
    /// the instance is already shutting down, so a wedge redirect and an
    /// explicit shutdown request racing each other never double-redirect the
    /// same requests.
    async fn shut_down_and_redirect(&mut self, handle: InstanceHandle, external_ip: &str) -> anyhow::Result<Vec<Outbound>> {
        let Some(instance) = self.registry.get_mut(handle) else { return Ok(Vec::new()) };
        if instance.shutting_down {
            return Ok(Vec::new());
        }

        instance.shutting_down = true;
        let map_id = instance.map_id;
        let clone_id = instance.clone_id;
        let sys_addr = instance.sys_addr;

        let mut redirected: Vec<TransferRequest> = instance.pending_affirmations.drain().map(|(_, v)| v).collect();
        redirected.extend(instance.pending_requests.drain(..));

        let mut outbound = vec![Outbound::ToPeer(sys_addr, Message::Shutdown)];
        for req in redirected {
            outbound.extend(self.request_zone_transfer(req, map_id as u32, clone_id, external_ip).await?);
        }

        Ok(outbound)
    }

    /// `SHUTDOWN_INSTANCE`: shuts down one named instance on operator
    /// request; access control for who may send this is out of scope here.
    /// Silently a no-op for an unknown `(zoneID, instanceID)` pair.
    pub async fn shutdown_instance(&mut self, zone_id: u32, instance_id: u16, external_ip: &str) -> anyhow::Result<Vec<Outbound>> {
        let Some(handle) = self.registry.find_by_map_and_instance(zone_id as u16, instance_id) else {
            return Ok(Vec::new());
        };

        self.shut_down_and_redirect(handle, external_ip).await
    }

    /// `SHUTDOWN_RESPONSE`: records that the reporting instance has finished
    /// its own teardown. The instance is actually removed from the registry
    /// on the next `reclaim_complete` sweep or transport disconnect, not
    /// here, so a stale or duplicate response from an already-reclaimed peer
    /// is harmless.
    pub fn mark_shutdown_complete(&mut self, peer: SysAddr) {
        let Some(handle) = self.registry.get_by_sys_addr(peer) else { return };
        if let Some(instance) = self.registry.get_mut(handle) {
            instance.shutdown_complete = true;
        }
    }

    /// Removes every instance that has reported `shutdownComplete`. Returns
    /// the handles removed, for logging.
    pub fn reclaim_complete(&mut self) -> Vec<InstanceHandle> {
        let to_remove: Vec<_> =
            self.registry.iter().filter(|(_, instance)| instance.shutdown_complete).map(|(handle, _)| handle).collect();

        for handle in &to_remove {
            self.registry.remove(*handle);
        }

        to_remove
    }

    /// Removes an instance whose transport peer disconnected, inferring a
    /// clean shutdown completion.
    pub fn remove_by_sys_addr(&mut self, addr: SysAddr) -> Option<Instance> {
        let handle = self.registry.get_by_sys_addr(addr)?;
        self.registry.remove(handle)
    }

    /// `SERVER_INFO` for a world: reconstructs an instance record if master
    /// doesn't know this `(zoneID, instanceID)` pair yet (e.g. after a master
    /// restart), otherwise just refreshes the transport peer. `cloneID` is
    /// not carried by `SERVER_INFO` on the wire; a reconstructed instance
    /// defaults to clone 0, which is safe because `findByMapAndInstance`
    /// never keys on `cloneID` (see DESIGN.md).
    pub fn handle_server_info(&mut self, zone_id: u16, instance_id: u16, ip: String, port: u16, peer: SysAddr) -> InstanceHandle {
        // A reconnecting world reports an instance ID master itself handed
        // out before it crashed; a fresh `launch()` must never reissue it.
        self.next_instance_id = self.next_instance_id.max(instance_id.wrapping_add(1));

        if let Some(handle) = self.registry.find_by_map_and_instance(zone_id, instance_id) {
            self.registry.rebind_sys_addr(handle, peer);
            return handle;
        }

        let mut instance = Instance::spawned(zone_id, 0, instance_id, ip, port, peer);
        // A reconnecting world was already running before master crashed;
        // it cannot be un-ready.
        instance.ready = true;
        self.registry.add(instance)
    }

    /// `GET_INSTANCES`: every known `(mapID, cloneID, instanceID)` triple,
    /// optionally filtered to one `mapID`.
    pub fn instance_triples(&self, zone_filter: Option<u16>) -> Vec<crate::message::InstanceTriple> {
        self.registry
            .iter()
            .map(|(_, instance)| instance)
            .filter(|instance| zone_filter.map(|zone| zone == instance.map_id).unwrap_or(true))
            .map(|instance| crate::message::InstanceTriple {
                map_id: instance.map_id,
                clone_id: instance.clone_id,
                instance_id: instance.instance_id,
            })
            .collect()
    }

    /// The transport peer of the instance that should receive a
    /// `RESPOND_INSTANCES` reply, sent directly rather than broadcast.
    pub fn responding_peer(&self, zone_id: u16, instance_id: u16) -> Option<SysAddr> {
        let handle = self.registry.find_by_map_and_instance(zone_id, instance_id)?;
        Some(self.registry.get(handle)?.sys_addr)
    }

    /// Every instance's transport peer, for the Shutdown Coordinator's
    /// broadcast.
    pub fn all_sys_addrs(&self) -> Vec<SysAddr> {
        self.registry.iter().map(|(_, instance)| instance.sys_addr).collect()
    }

    /// Whether every known instance has finished its own teardown, i.e. the
    /// registry is fully drained or every remaining row reports
    /// `shutdownComplete`.
    pub fn all_shutdown_complete(&self) -> bool {
        self.registry.iter().all(|(_, instance)| instance.shutdown_complete)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn manager() -> InstanceManager {
        InstanceManager::new(PathBuf::from("/bin/true"), false)
    }

    fn peer(port: u16) -> SysAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn cold_zone_transfer_enqueues_then_affirms() {
        let mut mgr = manager();

        let req = TransferRequest { request_id: 7, mythran_shift: false, requester: peer(5000) };
        let outbound = mgr.request_zone_transfer(req, 1200, 0, "127.0.0.1").await.unwrap();
        assert!(outbound.is_empty(), "fresh instance is not ready, request should only be queued");

        let handle = mgr.registry().find_by_map_id(1200)[0];
        let instance_id = mgr.registry().get(handle).unwrap().instance_id;

        let outbound = mgr.world_ready(1200, instance_id);
        assert_eq!(outbound.len(), 1);
        assert!(matches!(outbound[0], Outbound::ToPeer(_, Message::PrepZone { zone_id: 1200 })));

        let instance_sys_addr = mgr.registry().get(handle).unwrap().sys_addr;
        let response = mgr.affirm_transfer(instance_sys_addr, 7).expect("affirmation completes");
        match response {
            Outbound::ToPeer(target, Message::ZoneTransferResponse { request_id, map_id, instance_id: resp_id, .. }) => {
                assert_eq!(target, peer(5000));
                assert_eq!(request_id, 7);
                assert_eq!(map_id, 1200);
                assert_eq!(resp_id, instance_id);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn private_zone_skips_affirmation() {
        let mut mgr = manager();
        let handle = mgr.create_private_zone(1300, 5, "hunter2".to_owned(), "127.0.0.1").await.unwrap();
        assert!(mgr.registry().get(handle).unwrap().ready);

        let response = mgr.request_private_zone("hunter2", 9, true, peer(6000)).expect("password matches");
        match response {
            Outbound::ToPeer(target, Message::ZoneTransferResponse { clone_id, .. }) => {
                assert_eq!(target, peer(6000));
                assert_eq!(clone_id, 5);
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_private_password_yields_nothing() {
        let mgr = manager();
        assert!(mgr.request_private_zone("nope", 1, false, peer(6000)).is_none());
    }

    #[tokio::test]
    async fn affirmation_wedge_redirects_to_a_fresh_instance() {
        let mut mgr = manager();

        let req = TransferRequest { request_id: 7, mythran_shift: false, requester: peer(5000) };
        mgr.request_zone_transfer(req, 1200, 0, "127.0.0.1").await.unwrap();

        let wedged_handle = mgr.registry().find_by_map_id(1200)[0];
        let wedged_instance_id = mgr.registry().get(wedged_handle).unwrap().instance_id;
        mgr.world_ready(1200, wedged_instance_id);

        // Never affirm. Advance the clock past the timeout.
        let mut last = Vec::new();
        for _ in 0..AFFIRMATION_TIMEOUT_TICKS {
            last = mgr.tick_affirmation_timeouts("127.0.0.1").await.unwrap();
        }

        assert!(mgr.registry().get(wedged_handle).unwrap().shutting_down);
        assert!(last.iter().any(|o| matches!(o, Outbound::ToPeer(_, Message::Shutdown))));

        let handles = mgr.registry().find_by_map_id(1200);
        assert_eq!(handles.len(), 2, "a fresh instance should have been launched for the redirect");

        let fresh_handle = handles.into_iter().find(|&h| h != wedged_handle).unwrap();
        let fresh = mgr.registry().get(fresh_handle).unwrap();
        assert!(!fresh.ready, "the redirect target is freshly launched and not yet ready");
        assert_eq!(fresh.pending_requests.len(), 1, "the redirected request now waits on the fresh instance");
        assert_eq!(fresh.pending_requests[0].request_id, 7);
    }

    #[tokio::test]
    async fn player_count_feeds_soft_cap_resolution() {
        let mut mgr = manager();
        let handle = mgr.launch(1200, 0, "127.0.0.1").await.unwrap();

        let instance_id = mgr.registry().get(handle).unwrap().instance_id;
        mgr.adjust_player_count(1200, instance_id, 12);

        let resolved = mgr.resolve_zone(1200, 0, "127.0.0.1").await.unwrap();
        assert_ne!(resolved, handle, "instance at soft cap should not be reused");
    }

    #[test]
    fn server_info_reconstructs_unknown_instance_as_ready() {
        let mut mgr = manager();
        let handle = mgr.handle_server_info(1200, 3, "10.0.0.5".to_owned(), 9100, peer(9100));

        let instance = mgr.registry().get(handle).unwrap();
        assert!(instance.ready);
        assert_eq!(mgr.registry().find_by_map_and_instance(1200, 3), Some(handle));
    }

    #[tokio::test]
    async fn launch_after_crash_recovery_never_reissues_a_reconnected_instance_id() {
        let mut mgr = manager();

        // A world reconnects post-restart with the low instance ID master
        // itself would have handed out next, at soft cap so it won't be
        // reused by `resolve_zone`.
        let recovered = mgr.handle_server_info(1200, 1, "10.0.0.5".to_owned(), 9100, peer(9100));
        let soft_cap = mgr.registry().get(recovered).unwrap().soft_cap;
        mgr.adjust_player_count(1200, 1, soft_cap as i64);

        let fresh = mgr.launch(1200, 0, "127.0.0.1").await.unwrap();

        assert_ne!(fresh, recovered);
        assert_eq!(mgr.registry().len(), 2, "both instances must coexist without a panic or an overwritten index");
        assert_eq!(mgr.registry().find_by_map_and_instance(1200, 1), Some(recovered));
    }

    #[tokio::test]
    async fn server_info_for_known_instance_only_rebinds_peer() {
        let mut mgr = manager();
        let handle = mgr.launch(1200, 0, "127.0.0.1").await.unwrap();
        let instance_id = mgr.registry().get(handle).unwrap().instance_id;

        let rebinding = mgr.handle_server_info(1200, instance_id, "127.0.0.1".to_owned(), 9999, peer(42));
        assert_eq!(rebinding, handle);
        assert_eq!(mgr.registry().get(handle).unwrap().sys_addr, peer(42));
        assert_eq!(mgr.registry().len(), 1, "must not duplicate the instance");
    }

    #[tokio::test]
    async fn explicit_shutdown_instance_redirects_like_a_wedge() {
        let mut mgr = manager();

        let req = TransferRequest { request_id: 11, mythran_shift: false, requester: peer(5000) };
        mgr.request_zone_transfer(req, 1200, 0, "127.0.0.1").await.unwrap();

        let handle = mgr.registry().find_by_map_id(1200)[0];
        let instance_id = mgr.registry().get(handle).unwrap().instance_id;

        let outbound = mgr.shutdown_instance(1200, instance_id, "127.0.0.1").await.unwrap();
        assert!(outbound.iter().any(|o| matches!(o, Outbound::ToPeer(_, Message::Shutdown))));
        assert!(mgr.registry().get(handle).unwrap().shutting_down);

        let handles = mgr.registry().find_by_map_id(1200);
        assert_eq!(handles.len(), 2, "the redirected request launches a fresh instance");
    }

    #[tokio::test]
    async fn shutdown_instance_is_a_noop_for_unknown_pair() {
        let mut mgr = manager();
        assert!(mgr.shutdown_instance(9999, 1, "127.0.0.1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_shutdown_complete_then_reclaim_removes_instance() {
        let mut mgr = manager();
        let handle = mgr.launch(1200, 0, "127.0.0.1").await.unwrap();
        let sys_addr = mgr.registry().get(handle).unwrap().sys_addr;

        mgr.mark_shutdown_complete(sys_addr);
        let reclaimed = mgr.reclaim_complete();

        assert_eq!(reclaimed, vec![handle]);
        assert!(mgr.registry().get(handle).is_none());
    }

    #[tokio::test]
    async fn instance_triples_respects_zone_filter() {
        let mut mgr = manager();
        mgr.launch(1200, 0, "127.0.0.1").await.unwrap();
        mgr.launch(1300, 0, "127.0.0.1").await.unwrap();

        assert_eq!(mgr.instance_triples(None).len(), 2);
        assert_eq!(mgr.instance_triples(Some(1200)).len(), 1);
        assert_eq!(mgr.instance_triples(Some(1200))[0].map_id, 1200);
    }
}
