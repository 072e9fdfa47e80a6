use libp2p::{gossipsub, identify, mdns, ping, swarm::NetworkBehaviour};

pub const ROOM_STATES_TOPIC: &str = "room-states";
pub const RELAY_METRICS_TOPIC: &str = "relay-metrics";

/// The combined set of protocols every relay speaks to every other relay it is
/// connected to: gossip for room/relay state broadcast, mDNS for same-network
/// discovery, ping for liveness and the round-trip latency the metrics snapshot
/// reports, identify so peers learn each other's listen addresses, and raw
/// bidirectional streams for the inter-relay stream-request/stream-push protocols.
#[derive(NetworkBehaviour)]
pub struct RelayBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}
