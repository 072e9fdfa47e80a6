use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::swarm::SwarmEvent;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId, Swarm, identity::Keypair, mdns, noise, tcp, yamux};
use relay_protocol::WebrtcConfig;
use relay_protocol::mesh::{RelayInfo, RoomInfo};
use tokio::sync::{RwLock, oneshot};
use ulid::Ulid;
use webrtc::api::API;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::peer_conn::PeerConn;
use crate::room::Room;

use super::behaviour::{RELAY_METRICS_TOPIC, ROOM_STATES_TOPIC, RelayBehaviour, RelayBehaviourEvent};

pub const METRICS_PUBLISH_INTERVAL: Duration = Duration::from_secs(15);
const MESH_DIAL_TIMEOUT: Duration = Duration::from_secs(15);
/// Ping round-trips of zero are folded up to this floor so a latency of zero never
/// reads as "no measurement taken" in the published metrics snapshot.
const MIN_LATENCY: Duration = Duration::from_micros(1);

/// An inter-relay `PeerConnection` this relay opened to pull a remote room's media in,
/// keyed by room name in `Relay::requested_conns` for the lifetime of the mirror.
pub struct MeshBridge {
    pub peer: PeerId,
    pub peer_conn: Arc<PeerConn>,
}

/// The mesh-facing half of a relay: its libp2p swarm, the rooms it owns, and its view
/// of every other relay it has heard from (directly or via gossip).
pub struct Relay {
    pub peer_id: PeerId,
    pub local_rooms: RwLock<HashMap<Ulid, Arc<Room>>>,
    pub mesh_peers: RwLock<HashMap<PeerId, RelayInfo>>,
    pub mesh_rooms: RwLock<HashMap<String, RoomInfo>>,
    pub latencies: RwLock<HashMap<PeerId, Duration>>,
    pub webrtc_api: Arc<API>,
    pub webrtc_config: WebrtcConfig,
    pub stream_control: libp2p_stream::Control,
    /// Inter-relay `PeerConnection`s this relay is serving to other relays, keyed by
    /// the peer on the other end. Closed and pruned when that peer disconnects.
    served_streams: RwLock<HashMap<PeerId, Vec<Arc<PeerConn>>>>,
    /// Inter-relay `PeerConnection`s this relay opened to mirror a remote room, keyed
    /// by room name (a stream is always scoped to exactly one room).
    requested_conns: RwLock<HashMap<String, Arc<MeshBridge>>>,
    /// Room names with a `request_room_stream` in flight but not yet resolved to
    /// either a bridge or a failure, so a second trigger (join + gossip landing at
    /// nearly the same time) doesn't open two streams for the same room.
    pending_requests: RwLock<HashSet<String>>,
    /// Dials awaiting resolution within [`MESH_DIAL_TIMEOUT`], keyed by the peer the
    /// dialed multiaddr named. Resolved (and removed) the moment that peer's
    /// connection either succeeds or fails.
    pending_dials: RwLock<HashMap<PeerId, oneshot::Sender<()>>>,
    swarm: tokio::sync::Mutex<Swarm<RelayBehaviour>>,
}

impl Relay {
    pub async fn new(
        keypair: Keypair,
        port: u16,
        webrtc_api: Arc<API>,
        webrtc_config: WebrtcConfig,
    ) -> Result<Arc<Self>> {
        let peer_id = keypair.public().to_peer_id();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .context("failed to configure TCP transport")?
            .with_websocket(noise::Config::new, yamux::Config::default)
            .await
            .context("failed to configure WebSocket transport")?
            .with_behaviour(|key| {
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(|message: &gossipsub::Message| {
                        gossipsub::MessageId::from(gossip_message_id(&message.data))
                    })
                    .build()
                    .expect("valid gossipsub config");
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .expect("valid gossipsub behaviour");

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )
                .expect("valid mdns behaviour");

                let ping = libp2p::ping::Behaviour::default();

                let identify = libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                    "/relay-mesh/1.0".to_string(),
                    key.public(),
                ));

                let stream = libp2p_stream::Behaviour::new();

                RelayBehaviour {
                    gossipsub,
                    mdns,
                    ping,
                    identify,
                    stream,
                }
            })
            .context("failed to build relay network behaviour")?
            .build();

        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(ROOM_STATES_TOPIC))
            .context("failed to subscribe to room-states topic")?;
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&IdentTopic::new(RELAY_METRICS_TOPIC))
            .context("failed to subscribe to relay-metrics topic")?;

        let stream_control = swarm.behaviour().stream.new_control();

        for proto in ["tcp", "ws"] {
            for ip_version in ["ip4", "ip6"] {
                let addr: Multiaddr = match proto {
                    "tcp" => format!("/{ip_version}/0.0.0.0/tcp/{port}").parse(),
                    _ => format!("/{ip_version}/0.0.0.0/tcp/{}/ws", port + 1).parse(),
                }
                .expect("well-formed multiaddr");
                if let Err(e) = swarm.listen_on(addr.clone()) {
                    tracing::warn!(%addr, "failed to listen: {e}");
                }
            }
        }

        Ok(Arc::new(Self {
            peer_id,
            local_rooms: RwLock::new(HashMap::new()),
            mesh_peers: RwLock::new(HashMap::new()),
            mesh_rooms: RwLock::new(HashMap::new()),
            latencies: RwLock::new(HashMap::new()),
            webrtc_api,
            webrtc_config,
            stream_control,
            served_streams: RwLock::new(HashMap::new()),
            requested_conns: RwLock::new(HashMap::new()),
            pending_requests: RwLock::new(HashSet::new()),
            pending_dials: RwLock::new(HashMap::new()),
            swarm: tokio::sync::Mutex::new(swarm),
        }))
    }

    /// Drive the swarm event loop and the two stream-protocol responders. Runs until
    /// the process shuts down.
    pub async fn run(self: Arc<Self>) {
        let metrics_relay = Arc::clone(&self);
        tokio::spawn(async move { metrics_relay.periodic_metrics_publisher().await });

        tokio::spawn(super::stream_protocol::run_request_responder(Arc::clone(&self)));
        tokio::spawn(super::stream_protocol::run_push_responder(Arc::clone(&self)));

        loop {
            let event = {
                let mut swarm = self.swarm.lock().await;
                swarm.select_next_some().await
            };
            self.handle_swarm_event(event).await;
        }
    }

    pub fn ice_configuration(&self) -> RTCConfiguration {
        crate::webrtc_api::ice_configuration(&self.webrtc_config)
    }

    pub async fn local_room_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.local_rooms.read().await.values().find(|r| r.name == name).cloned()
    }

    /// Resolve the room an inbound `/stream-push/1.0` should mirror into: reuse an
    /// existing local room of that name if it isn't already carrying a different
    /// active producer, otherwise create one.
    pub async fn find_or_create_pushed_room(&self, name: &str, pusher: PeerId) -> Option<Arc<Room>> {
        let mut rooms = self.local_rooms.write().await;
        if let Some(room) = rooms.values().find(|r| r.name == name) {
            if room.is_online() {
                tracing::debug!(%pusher, room = %name, "rejecting push for already-active room");
                return None;
            }
            return Some(Arc::clone(room));
        }
        let room = Arc::new(Room::new(Ulid::new(), name.to_string(), pusher.to_string()));
        rooms.insert(room.id, Arc::clone(&room));
        Some(room)
    }

    pub async fn add_served_stream(&self, peer: PeerId, pc: Arc<PeerConn>) {
        self.served_streams.write().await.entry(peer).or_default().push(pc);
    }

    pub async fn remove_served_stream(&self, peer: PeerId) {
        self.served_streams.write().await.remove(&peer);
    }

    pub async fn remove_requested_stream(&self, room_name: &str) {
        self.requested_conns.write().await.remove(room_name);
    }

    /// Claims `room_name` for an in-flight request, returning `false` (without
    /// claiming anything) if a bridge for it already exists or is being established.
    pub async fn begin_request(&self, room_name: &str) -> bool {
        if self.requested_conns.read().await.contains_key(room_name) {
            return false;
        }
        self.pending_requests.write().await.insert(room_name.to_string())
    }

    pub async fn abort_request(&self, room_name: &str) {
        self.pending_requests.write().await.remove(room_name);
    }

    pub async fn complete_request(&self, room_name: String, bridge: Arc<MeshBridge>) {
        self.pending_requests.write().await.remove(&room_name);
        self.requested_conns.write().await.insert(room_name, bridge);
    }

    /// True if a mirror of `room_name` is already established or being negotiated.
    pub async fn has_requested_stream(&self, room_name: &str) -> bool {
        self.requested_conns.read().await.contains_key(room_name)
            || self.pending_requests.read().await.contains(room_name)
    }

    /// Look up the mesh-visible owner of `room_name`, if any relay other than this
    /// one currently reports it online. Used both at participant-join time and from
    /// gossip updates to decide whether to open a stream-request.
    pub async fn remote_online_owner(&self, room_name: &str) -> Option<PeerId> {
        let info = self.mesh_rooms.read().await.get(room_name).cloned()?;
        if !info.online || info.owner_id == self.peer_id.to_string() {
            return None;
        }
        info.owner_id.parse().ok()
    }

    /// Request a room's media from whichever relay the mesh currently reports as its
    /// online owner, if we don't already have (or are already establishing) a bridge
    /// for it. Called both when a participant joins an offline local room and when
    /// gossip reports a previously-offline remote room coming online.
    pub async fn maybe_request_stream(self: &Arc<Self>, room: Arc<Room>) {
        if room.is_online() || self.has_requested_stream(&room.name).await {
            return;
        }
        let Some(owner) = self.remote_online_owner(&room.name).await else {
            return;
        };
        let room_name = room.name.clone();
        tokio::spawn(super::stream_protocol::request_room_stream(
            Arc::clone(self),
            room,
            room_name,
            owner,
        ));
    }

    async fn handle_swarm_event(self: &Arc<Self>, event: SwarmEvent<RelayBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, peer_id = %self.peer_id, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                self.resolve_pending_dial(peer_id).await;
                self.on_peer_connected(peer_id).await;
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                self.on_peer_disconnected(peer_id).await;
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), .. } => {
                self.resolve_pending_dial(peer_id).await;
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                let mut dialed = Vec::new();
                {
                    let mut swarm = self.swarm.lock().await;
                    for (peer_id, addr) in peers {
                        tracing::debug!(%peer_id, %addr, "discovered relay via mDNS");
                        swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        match swarm.dial(addr.clone()) {
                            Ok(()) => dialed.push((peer_id, addr)),
                            Err(e) => tracing::debug!(%peer_id, "dial failed: {e}"),
                        }
                    }
                }
                for (peer_id, addr) in dialed {
                    self.await_dial_with_timeout(peer_id, addr).await;
                }
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                let mut swarm = self.swarm.lock().await;
                for (peer_id, _) in peers {
                    swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.handle_gossip_message(propagation_source, message).await;
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Ping(libp2p::ping::Event {
                peer,
                result: Ok(rtt),
                ..
            })) => {
                let rtt = rtt.max(MIN_LATENCY);
                self.latencies.write().await.insert(peer, rtt);
            }
            SwarmEvent::Behaviour(RelayBehaviourEvent::Ping(libp2p::ping::Event {
                peer,
                result: Err(e),
                ..
            })) => {
                tracing::debug!(%peer, "ping failed, dropping peer from mesh view: {e}");
                self.mesh_peers.write().await.remove(&peer);
                self.latencies.write().await.remove(&peer);
            }
            _ => {}
        }
    }

    /// Every newly connected peer is recorded, and since it may have missed every
    /// snapshot we've published so far, we publish fresh ones immediately rather than
    /// waiting for the next periodic tick.
    async fn on_peer_connected(self: &Arc<Self>, peer_id: PeerId) {
        tracing::info!(%peer_id, "relay connected");
        self.publish_metrics().await;
        self.publish_room_states().await;
    }

    /// Prunes every mesh room entry owned by the departed peer, and tears down any
    /// inter-relay `PeerConnection` (served or requested) that involved it — a remote
    /// room it was hosting for us, or a mirror it was asking us to host for it.
    async fn on_peer_disconnected(&self, peer_id: PeerId) {
        tracing::info!(%peer_id, "relay disconnected");
        let owner_id = peer_id.to_string();

        let mut mesh_rooms = self.mesh_rooms.write().await;
        let stale: Vec<String> = mesh_rooms
            .iter()
            .filter(|(_, room)| room.owner_id == owner_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            mesh_rooms.remove(name);
        }
        drop(mesh_rooms);

        self.mesh_peers.write().await.remove(&peer_id);
        self.latencies.write().await.remove(&peer_id);

        if let Some(served) = self.served_streams.write().await.remove(&peer_id) {
            for pc in served {
                let _ = pc.inner.close().await;
            }
        }

        let mut requested = self.requested_conns.write().await;
        let lost: Vec<String> = requested
            .iter()
            .filter(|(_, bridge)| bridge.peer == peer_id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &lost {
            if let Some(bridge) = requested.remove(name) {
                let _ = bridge.peer_conn.inner.close().await;
            }
        }
        drop(requested);

        if !stale.is_empty() {
            tracing::info!(%peer_id, rooms = stale.len(), "pruned mesh rooms owned by disconnected peer");
        }
    }

    async fn handle_gossip_message(self: &Arc<Self>, source: PeerId, message: gossipsub::Message) {
        if source == self.peer_id {
            return;
        }
        let Some(publisher) = message.source else {
            return;
        };
        if publisher != source {
            tracing::warn!(%source, claimed = %publisher, "dropping gossip message with spoofed source");
            return;
        }

        let topic = message.topic.as_str();
        if topic == ROOM_STATES_TOPIC {
            match serde_json::from_slice::<Vec<RoomInfo>>(&message.data) {
                Ok(rooms) => {
                    let mut transitions = Vec::new();
                    {
                        let mut mesh_rooms = self.mesh_rooms.write().await;
                        for room in rooms {
                            if room.owner_id != publisher.to_string() {
                                tracing::warn!(%publisher, owner = %room.owner_id, "dropping room snapshot with mismatched owner");
                                continue;
                            }
                            let previously_online =
                                mesh_rooms.get(&room.name).map(|r| r.online).unwrap_or(false);
                            if room.online && !previously_online {
                                transitions.push(room.name.clone());
                            }
                            mesh_rooms.insert(room.name.clone(), room);
                        }
                    }
                    for name in transitions {
                        if let Some(room) = self.local_room_by_name(&name).await
                            && room.participant_count().await > 0
                        {
                            self.maybe_request_stream(room).await;
                        }
                    }
                }
                Err(e) => tracing::warn!("malformed room-states message from {publisher}: {e}"),
            }
        } else if topic == RELAY_METRICS_TOPIC {
            match serde_json::from_slice::<RelayInfo>(&message.data) {
                Ok(info) if info.id == publisher.to_string() => {
                    self.mesh_peers.write().await.insert(publisher, info);
                }
                Ok(info) => {
                    tracing::warn!(%publisher, claimed = %info.id, "dropping relay-metrics message with spoofed id");
                }
                Err(e) => tracing::warn!("malformed relay-metrics message from {publisher}: {e}"),
            }
        }
    }

    /// Publish the set of rooms this relay actively produces (has a live ingest
    /// `PeerConnection` for) to `room-states`. A room this relay merely hosts
    /// locally for a waiting participant — but never produced itself — is never
    /// published, so ownership in the mesh stays unambiguous.
    pub async fn publish_room_states(&self) {
        let rooms = self.owned_room_infos().await;
        if rooms.is_empty() {
            return;
        }
        let Ok(payload) = serde_json::to_vec(&rooms) else {
            return;
        };
        let mut swarm = self.swarm.lock().await;
        if let Err(e) = swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(ROOM_STATES_TOPIC), payload)
        {
            tracing::debug!("failed to publish room-states (no peers yet?): {e}");
        }
    }

    async fn owned_room_infos(&self) -> Vec<RoomInfo> {
        let owner_id = self.peer_id.to_string();
        let rooms: Vec<Arc<Room>> = self.local_rooms.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(rooms.len());
        for room in rooms {
            if room.ingest_peer_conn.lock().await.is_none() {
                continue;
            }
            infos.push(RoomInfo {
                id: room.id,
                name: room.name.clone(),
                online: room.is_online(),
                owner_id: owner_id.clone(),
            });
        }
        infos
    }

    async fn periodic_metrics_publisher(self: Arc<Self>) {
        let mut interval = tokio::time::interval(METRICS_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;
            self.publish_metrics().await;
        }
    }

    async fn publish_metrics(&self) {
        let rooms: HashMap<String, RoomInfo> = self
            .owned_room_infos()
            .await
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();
        let latencies: HashMap<String, Duration> = self
            .latencies
            .read()
            .await
            .iter()
            .map(|(peer, rtt)| (peer.to_string(), *rtt))
            .collect();

        let listen_addrs: Vec<String> = {
            let swarm = self.swarm.lock().await;
            swarm.listeners().map(|a| a.to_string()).collect()
        };

        let info = RelayInfo {
            id: self.peer_id.to_string(),
            mesh_addrs: listen_addrs,
            rooms,
            latencies,
        };
        let Ok(payload) = serde_json::to_vec(&info) else {
            return;
        };
        let mut swarm = self.swarm.lock().await;
        if let Err(e) = swarm
            .behaviour_mut()
            .gossipsub
            .publish(IdentTopic::new(RELAY_METRICS_TOPIC), payload)
        {
            tracing::debug!("failed to publish relay-metrics (no peers yet?): {e}");
        }
    }

    /// Dial a relay at an explicit multiaddr, used by the control endpoint's
    /// `join_mesh` action to bridge two relays that aren't on the same LAN (where
    /// mDNS would otherwise find them). If the address names a peer ID, the dial is
    /// bounded to 15 seconds — a stalled handshake with an unreachable address is
    /// logged and abandoned rather than left to resolve silently whenever it likes.
    pub async fn dial(self: &Arc<Self>, addr: Multiaddr) {
        let target_peer = addr.iter().find_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        });

        let dial_result = {
            let mut swarm = self.swarm.lock().await;
            swarm.dial(addr.clone())
        };
        if let Err(e) = dial_result {
            tracing::warn!(%addr, "failed to dial relay: {e}");
            return;
        }

        let Some(target_peer) = target_peer else {
            return;
        };
        self.await_dial_with_timeout(target_peer, addr).await;
    }

    /// Register a 15-second timeout for a dial already handed to the swarm, resolved
    /// the moment `target_peer`'s connection succeeds or fails (see
    /// `resolve_pending_dial`). Shared by the control endpoint's explicit `dial` and
    /// mDNS-triggered connects, both of which must bound how long a stalled handshake
    /// with an unreachable address is left to resolve on its own.
    async fn await_dial_with_timeout(self: &Arc<Self>, target_peer: PeerId, addr: Multiaddr) {
        let (tx, rx) = oneshot::channel();
        self.pending_dials.write().await.insert(target_peer, tx);

        let relay = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::time::timeout(MESH_DIAL_TIMEOUT, rx).await.is_err() {
                relay.pending_dials.write().await.remove(&target_peer);
                tracing::warn!(%addr, %target_peer, "mesh dial timed out after 15s");
            }
        });
    }

    async fn resolve_pending_dial(&self, peer_id: PeerId) {
        if let Some(tx) = self.pending_dials.write().await.remove(&peer_id) {
            let _ = tx.send(());
        }
    }
}

/// Content-addressed message ID so a message rebroadcast by multiple relays
/// during mesh convergence is only ever delivered to gossipsub subscribers once.
fn gossip_message_id(data: &[u8]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
