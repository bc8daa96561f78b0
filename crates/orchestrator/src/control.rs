//! Control Loop: the fixed-tick driver that drains inbound messages,
//! advances affirmation timeouts, reaps shut-down instances, and owns the
//! two convergent shutdown paths.
//!
//! Split in two pieces, mirroring `core/src/instance.rs`'s separation of
//! pure packet handling from the network receive loop (`process_*` free
//! functions vs. `net_receiver`): [`Dispatcher`] holds every piece of
//! mutable registry state and turns one decoded [`Message`] into zero or
//! more [`Outbound`]s with no I/O of its own, so it is exercised directly by
//! tests; [`ControlLoop`] is the thin tokio driver that owns the
//! [`Transport`], ticks [`Dispatcher`], and performs the actual sends.

use std::time::Instant;

use tokio::time::MissedTickBehavior;

use crate::allocator::PersistentIdAllocator;
use crate::chat::ChatPeer;
use crate::config::{HIGH_FRAME_RATE, LOG_FLUSH_INTERVAL, SQL_KEEPALIVE_INTERVAL, UNIVERSE_SHUTDOWN_WINDOW};
use crate::context::Context;
use crate::instance::manager::{InstanceManager, Outbound};
use crate::instance::{SysAddr, TransferRequest};
use crate::message::{Message, ServerType};
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{Event, Transport};

/// Pure message-handling core: the Allocator, Session Registry, Instance
/// Registry and Manager, minus the transport itself. This is the only place
/// all of those singletons are constructed, so there is exactly one of each
/// at runtime even though nothing here prevents a second `Dispatcher` from
/// being built. What matters is identity in the running program, not the
/// type system enforcing it.
pub struct Dispatcher {
    ctx: Context,
    allocator: PersistentIdAllocator,
    sessions: SessionRegistry,
    instances: InstanceManager,
    chat: ChatPeer,
    universe_shutdown: bool,
}

impl Dispatcher {
    /// Builds a dispatcher around an already-loaded allocator and an
    /// already-constructed instance manager (which needs the world binary
    /// path and sudo flag from config); the session registry and chat peer
    /// start empty.
    pub fn new(ctx: Context, allocator: PersistentIdAllocator, instances: InstanceManager) -> Dispatcher {
        Dispatcher { ctx, allocator, sessions: SessionRegistry::new(), instances, chat: ChatPeer::new(), universe_shutdown: false }
    }

    /// Read-only access to the instance manager, for the control loop's
    /// per-tick sweep and the shutdown coordinator's completion check.
    pub fn instances(&self) -> &InstanceManager {
        &self.instances
    }

    /// Flushes the Persistent-ID high-water mark.
    pub async fn save_allocator(&self) -> anyhow::Result<()> {
        self.allocator.save().await
    }

    /// Pings storage to keep the connection alive.
    pub async fn ping_storage(&self) -> anyhow::Result<()> {
        self.ctx.storage().ping().await
    }

    /// Whether `SHUTDOWN_UNIVERSE` has been received.
    pub fn universe_shutdown(&self) -> bool {
        self.universe_shutdown
    }

    fn external_ip(&self) -> String {
        self.ctx.config().external_ip.clone()
    }

    /// Decodes and handles one inbound frame from `peer`. Malformed frames
    /// are logged at debug and otherwise ignored rather than propagated as
    /// an error.
    pub async fn handle_frame(&mut self, peer: SysAddr, frame: &[u8]) -> Vec<Outbound> {
        match Message::decode_frame(frame) {
            Ok(message) => self.dispatch(peer, message).await,
            Err(error) => {
                tracing::debug!(%peer, %error, "dropping malformed frame");
                Vec::new()
            }
        }
    }

    /// Routes one decoded message to the owning component and returns the
    /// replies to send.
    async fn dispatch(&mut self, peer: SysAddr, message: Message) -> Vec<Outbound> {
        match message {
            Message::RequestPersistentId { request_id } => {
                let object_id = self.allocator.allocate();
                vec![Outbound::ToPeer(peer, Message::PersistentIdResponse { request_id, object_id })]
            }

            Message::RequestZoneTransfer { request_id, mythran_shift, zone_id, clone_id } => {
                let req = TransferRequest { request_id, mythran_shift, requester: peer };
                let external_ip = self.external_ip();
                match self.instances.request_zone_transfer(req, zone_id, clone_id, &external_ip).await {
                    Ok(outbound) => outbound,
                    Err(error) => {
                        tracing::warn!(%error, zone_id, "failed to resolve zone for transfer request");
                        Vec::new()
                    }
                }
            }

            Message::ServerInfo { port, zone_id, instance_id, server_type, ip } => {
                match server_type {
                    ServerType::World => {
                        self.instances.handle_server_info(zone_id as u16, instance_id as u16, ip, port as u16, peer);
                    }
                    ServerType::Chat => {
                        self.chat.register(peer);
                        tracing::info!(%peer, "chat relay registered");
                    }
                    ServerType::Unknown(raw) => {
                        tracing::debug!(raw, "SERVER_INFO with unrecognized serverType");
                    }
                }
                Vec::new()
            }

            Message::SetSessionKey { session_key, username } => {
                let displaced = self.sessions.set(session_key, &username);
                if displaced.is_some() {
                    vec![Outbound::Broadcast(Message::NewSessionAlert { session_key, username })]
                } else {
                    Vec::new()
                }
            }

            Message::RequestSessionKey { username } => match self.sessions.query(&username) {
                Some(session_key) => vec![Outbound::ToPeer(peer, Message::SessionKeyResponse { session_key, username })],
                None => Vec::new(),
            },

            Message::PlayerAdded { map_id, instance_id } => {
                self.instances.adjust_player_count(map_id, instance_id, 1);
                Vec::new()
            }
            Message::PlayerRemoved { map_id, instance_id } => {
                self.instances.adjust_player_count(map_id, instance_id, -1);
                Vec::new()
            }

            Message::CreatePrivateZone { map_id, clone_id, password } => {
                let external_ip = self.external_ip();
                if let Err(error) = self.instances.create_private_zone(map_id, clone_id, password, &external_ip).await {
                    tracing::warn!(%error, map_id, "failed to create private zone");
                }
                Vec::new()
            }

            Message::RequestPrivateZone { request_id, mythran_shift, password } => {
                match self.instances.request_private_zone(&password, request_id, mythran_shift, peer) {
                    Some(outbound) => vec![outbound],
                    None => {
                        tracing::debug!(request_id, "no private zone for the given password");
                        Vec::new()
                    }
                }
            }

            Message::WorldReady { zone_id, instance_id } => self.instances.world_ready(zone_id, instance_id),

            Message::AffirmTransferResponse { request_id } => match self.instances.affirm_transfer(peer, request_id) {
                Some(outbound) => vec![outbound],
                None => {
                    tracing::debug!(%peer, request_id, "affirmation from unknown peer or stale request");
                    Vec::new()
                }
            },

            Message::ShutdownResponse => {
                self.instances.mark_shutdown_complete(peer);
                Vec::new()
            }

            Message::ShutdownUniverse => {
                tracing::info!("universe shutdown requested");
                self.universe_shutdown = true;
                Vec::new()
            }

            Message::ShutdownInstance { zone_id, instance_id } => {
                let external_ip = self.external_ip();
                match self.instances.shutdown_instance(zone_id, instance_id, &external_ip).await {
                    Ok(outbound) => outbound,
                    Err(error) => {
                        tracing::warn!(%error, zone_id, instance_id, "failed to shut down instance");
                        Vec::new()
                    }
                }
            }

            Message::GetInstances { object_id, zone_id, responding_zone_id, responding_instance_id } => {
                let triples = self.instances.instance_triples(zone_id);
                match self.instances.responding_peer(responding_zone_id, responding_instance_id) {
                    Some(target) => vec![Outbound::ToPeer(target, Message::RespondInstances { object_id, instances: triples })],
                    None => {
                        tracing::debug!(responding_zone_id, responding_instance_id, "GET_INSTANCES responder is unknown");
                        Vec::new()
                    }
                }
            }

            // Master-emitted-only messages arriving inbound are protocol
            // misuse; log and drop.
            Message::PersistentIdResponse { .. }
            | Message::ZoneTransferResponse { .. }
            | Message::NewSessionAlert { .. }
            | Message::SessionKeyResponse { .. }
            | Message::PrepZone { .. }
            | Message::Shutdown
            | Message::RespondInstances { .. } => {
                tracing::debug!(%peer, "received a master-outbound-only message kind");
                Vec::new()
            }
        }
    }

    /// Transport disconnect/timeout for `peer`: reclaims its instance (if
    /// any) and checks whether the chat relay was lost.
    pub fn handle_peer_lost(&mut self, peer: SysAddr) {
        if self.instances.remove_by_sys_addr(peer).is_some() {
            tracing::info!(%peer, "instance disconnected");
        }

        if self.chat.handle_disconnect(peer, self.universe_shutdown) {
            tracing::warn!(%peer, "chat relay lost; awaiting reconnect");
        }
    }

    /// Advances every instance's affirmation timeout by one tick.
    pub async fn tick_affirmation_timeouts(&mut self) -> Vec<Outbound> {
        let external_ip = self.external_ip();
        match self.instances.tick_affirmation_timeouts(&external_ip).await {
            Ok(outbound) => outbound,
            Err(error) => {
                tracing::warn!(%error, "failed to redirect a wedged instance");
                Vec::new()
            }
        }
    }

    /// Every instance that finished its own teardown this tick.
    pub fn reclaim_complete(&mut self) -> usize {
        self.instances.reclaim_complete().len()
    }
}

/// The fixed-tick driver owning the transport and the shutdown coordinator.
pub struct ControlLoop {
    dispatcher: Dispatcher,
    transport: Transport,
    shutdown: ShutdownCoordinator,
    universe_ticks: u32,
    universe_tick_limit: u32,
}

impl ControlLoop {
    /// Assembles the control loop from its already-constructed parts.
    pub fn new(dispatcher: Dispatcher, transport: Transport) -> ControlLoop {
        let ticks_per_second = 1.0 / HIGH_FRAME_RATE.as_secs_f64();
        let universe_tick_limit = (UNIVERSE_SHUTDOWN_WINDOW.as_secs_f64() * ticks_per_second).round() as u32;

        ControlLoop { dispatcher, transport, shutdown: ShutdownCoordinator::new(), universe_ticks: 0, universe_tick_limit }
    }

    fn send_all(&self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::ToPeer(peer, message) => self.transport.send(peer, message.encode()),
                Outbound::Broadcast(message) => self.transport.broadcast(message.encode()),
            }
        }
    }

    async fn drain_inbound(&mut self) {
        while let Some(event) = self.transport.try_receive() {
            match event {
                Event::Message { peer, frame } => {
                    let outbound = self.dispatcher.handle_frame(peer, &frame).await;
                    self.send_all(outbound);
                }
                Event::DisconnectNotification { peer } | Event::ConnectionLost { peer } => {
                    self.dispatcher.handle_peer_lost(peer);
                }
            }
        }
    }

    /// Broadcasts `Shutdown` to every live instance and flushes the
    /// allocator; idempotent.
    async fn begin_shutdown(&mut self) {
        let outbound = self.shutdown.begin(self.dispatcher.instances());
        if outbound.is_empty() && !self.shutdown.is_draining() {
            return;
        }

        tracing::info!("shutdown coordinator starting drain");
        self.send_all(outbound);

        if let Err(error) = self.dispatcher.save_allocator().await {
            tracing::error!(%error, "failed to flush persistent-id allocator during shutdown");
        }
    }

    /// Runs until the shutdown coordinator's drain completes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(HIGH_FRAME_RATE);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_log_flush = Instant::now();
        let mut last_sql_keepalive = Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c(), if !self.shutdown.is_draining() => {
                    tracing::info!("received interrupt signal");
                    self.begin_shutdown().await;
                }
            }

            self.drain_inbound().await;

            let timeouts = self.dispatcher.tick_affirmation_timeouts().await;
            self.send_all(timeouts);

            let reclaimed = self.dispatcher.reclaim_complete();
            if reclaimed > 0 {
                tracing::debug!(reclaimed, "reclaimed shut-down instances");
            }

            if last_log_flush.elapsed() >= LOG_FLUSH_INTERVAL {
                tracing::debug!("log flush");
                last_log_flush = Instant::now();
            }

            if last_sql_keepalive.elapsed() >= SQL_KEEPALIVE_INTERVAL {
                if let Err(error) = self.dispatcher.ping_storage().await {
                    tracing::warn!(%error, "SQL keepalive ping failed");
                }
                last_sql_keepalive = Instant::now();
            }

            if self.dispatcher.universe_shutdown() && !self.shutdown.is_draining() {
                self.universe_ticks += 1;
                if self.universe_ticks >= self.universe_tick_limit {
                    self.begin_shutdown().await;
                }
            }

            if self.shutdown.is_draining() && self.shutdown.is_drain_complete(self.dispatcher.instances()) {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::storage::FakeStorage;

    fn peer(port: u16) -> SysAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_config() -> Config {
        Config::parse(
            r#"
                external_ip = "127.0.0.1"
                master_ip = "0.0.0.0"
                port = 0
                max_clients = 100
                sql_connection = "sqlite::memory:"
                client_location = "."
                world_binary = "/bin/true"
            "#,
        )
        .unwrap()
    }

    async fn dispatcher() -> Dispatcher {
        let ctx = Context::new(test_config(), Arc::new(FakeStorage::new()));
        let allocator = PersistentIdAllocator::load(Arc::new(FakeStorage::new())).await.unwrap();
        let instances = InstanceManager::new(PathBuf::from("/bin/true"), false);
        Dispatcher::new(ctx, allocator, instances)
    }

    #[tokio::test]
    async fn request_persistent_id_allocates_and_replies() {
        let mut d = dispatcher().await;

        let first = d.handle_frame(peer(1), &Message::RequestPersistentId { request_id: 1 }.encode()).await;
        let second = d.handle_frame(peer(1), &Message::RequestPersistentId { request_id: 2 }.encode()).await;

        let id_of = |outbound: &[Outbound]| match &outbound[0] {
            Outbound::ToPeer(_, Message::PersistentIdResponse { object_id, .. }) => *object_id,
            other => panic!("unexpected: {other:?}"),
        };

        assert!(id_of(&first) < id_of(&second));
    }

    #[tokio::test]
    async fn session_displacement_broadcasts_new_session_alert() {
        let mut d = dispatcher().await;

        let first = d.dispatch(peer(1), Message::SetSessionKey { session_key: 100, username: "alice".to_owned() }).await;
        assert!(first.is_empty());

        let second = d.dispatch(peer(1), Message::SetSessionKey { session_key: 200, username: "alice".to_owned() }).await;
        assert_eq!(second.len(), 1);
        match &second[0] {
            Outbound::Broadcast(Message::NewSessionAlert { session_key, username }) => {
                assert_eq!(*session_key, 200);
                assert_eq!(username, "alice");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_session_key_for_unknown_user_yields_nothing() {
        let mut d = dispatcher().await;
        let outbound = d.dispatch(peer(1), Message::RequestSessionKey { username: "nobody".to_owned() }).await;
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn shutdown_universe_sets_the_flag_without_replying() {
        let mut d = dispatcher().await;
        assert!(!d.universe_shutdown());

        let outbound = d.dispatch(peer(1), Message::ShutdownUniverse).await;
        assert!(outbound.is_empty());
        assert!(d.universe_shutdown());
    }

    #[tokio::test]
    async fn malformed_frame_is_dropped_without_panicking() {
        let mut d = dispatcher().await;
        let outbound = d.handle_frame(peer(1), &[1, 2, 3]).await;
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn get_instances_replies_to_the_responding_peer() {
        let mut d = dispatcher().await;
        let external_ip = d.external_ip();
        d.instances.launch(1200, 0, &external_ip).await.unwrap();

        let handle = d.instances.registry().find_by_map_id(1200)[0];
        let responder = d.instances.registry().get(handle).unwrap();
        let (responding_zone_id, responding_instance_id, responding_peer) =
            (responder.map_id, responder.instance_id, responder.sys_addr);

        let outbound = d
            .dispatch(
                peer(9),
                Message::GetInstances { object_id: 1, zone_id: None, responding_zone_id, responding_instance_id },
            )
            .await;

        assert_eq!(outbound.len(), 1);
        match &outbound[0] {
            Outbound::ToPeer(target, Message::RespondInstances { instances, .. }) => {
                assert_eq!(*target, responding_peer);
                assert_eq!(instances.len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn universe_shutdown_tick_limit_falls_within_the_nine_to_eleven_minute_window() {
        let d = dispatcher().await;
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let ticks_per_second = 1.0 / HIGH_FRAME_RATE.as_secs_f64();
        let loop_ = ControlLoop::new(d, transport);

        let lower_bound = (9.0 * 60.0 * ticks_per_second) as u32;
        let upper_bound = (11.0 * 60.0 * ticks_per_second) as u32;

        assert!(
            loop_.universe_tick_limit >= lower_bound && loop_.universe_tick_limit <= upper_bound,
            "expected {} to fall within [{lower_bound}, {upper_bound}]",
            loop_.universe_tick_limit
        );
    }

    #[tokio::test]
    async fn peer_loss_reclaims_its_instance() {
        let mut d = dispatcher().await;
        let external_ip = d.external_ip();
        let handle = d.instances.launch(1200, 0, &external_ip).await.unwrap();
        let sys_addr = d.instances.registry().get(handle).unwrap().sys_addr;

        d.handle_peer_lost(sys_addr);
        assert!(d.instances.registry().get(handle).is_none());
    }
}
