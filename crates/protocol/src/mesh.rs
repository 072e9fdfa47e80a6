use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Public, gossiped description of a room. Published on the `room-states` topic as
/// part of an owner's full snapshot and consumed by every other relay in the mesh to
/// build a view of rooms it does not itself host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    pub online: bool,
    /// Stringified libp2p `PeerId` of the relay that owns (hosts) this room.
    pub owner_id: String,
}

/// Public, gossiped description of a relay: its mesh addresses and the rooms it owns.
/// Published on the `relay-metrics` topic every metrics interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInfo {
    /// Stringified libp2p `PeerId` of the relay this info describes.
    pub id: String,
    pub mesh_addrs: Vec<String>,
    pub rooms: HashMap<String, RoomInfo>,
    #[serde(with = "latency_map")]
    pub latencies: HashMap<String, Duration>,
}

mod latency_map {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &HashMap<String, Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let as_millis: HashMap<&String, u128> =
            map.iter().map(|(k, v)| (k, v.as_millis())).collect();
        as_millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<String, Duration>, D::Error> {
        let as_millis: HashMap<String, u64> = HashMap::deserialize(deserializer)?;
        Ok(as_millis
            .into_iter()
            .map(|(k, v)| (k, Duration::from_millis(v)))
            .collect())
    }
}

/// SDP payload carried by `StreamMessage::Offer`/`StreamMessage::Answer`. A bare
/// string would work just as well on the wire, but a named field keeps the shape
/// consistent with the other variants and leaves room to add `sdp_type` later
/// without breaking the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

/// Trickled ICE candidate payload, mirroring `IceCandidateInit` but kept separate
/// since inter-relay streams never carry a `messages::SignalingMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Envelope for the `/stream-request/1.0` and `/stream-push/1.0` inter-relay protocols.
/// Every frame on an inter-relay stream is one of these, JSON-encoded and length-prefixed
/// (see `crate::frame`). Unlike the request/response RPCs these protocols used to ride on,
/// a single stream carries many of these messages over its lifetime — one per negotiation
/// step — since the stream itself is scoped to exactly one room and stays open for as
/// long as that room's media keeps flowing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Opens a `/stream-push/1.0` stream: "here is a room I'd like you to mirror".
    PushRoom { payload: String },
    /// Opens a `/stream-request/1.0` stream: "send me this room's media if you have it".
    RequestRoom { payload: String },
    /// Reply to `RequestRoom`/`PushRoom` when the named room isn't a local, online room
    /// owned by the relay receiving the request.
    RequestOffline { payload: String },
    /// SDP offer for the inter-relay `PeerConnection` carrying the room's media.
    Offer { payload: SdpPayload },
    /// SDP answer completing that negotiation.
    Answer { payload: SdpPayload },
    /// Trickled ICE candidate for the inter-relay `PeerConnection`.
    Ice { payload: IcePayload },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_info_round_trips_through_json() {
        let mut rooms = HashMap::new();
        rooms.insert(
            "movie-night".to_string(),
            RoomInfo {
                id: Ulid::new(),
                name: "movie-night".to_string(),
                online: true,
                owner_id: "12D3KooW".to_string(),
            },
        );
        let mut latencies = HashMap::new();
        latencies.insert("12D3KooW".to_string(), Duration::from_millis(42));

        let info = RelayInfo {
            id: "12D3KooWSelf".to_string(),
            mesh_addrs: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
            rooms,
            latencies,
        };

        let json = serde_json::to_string(&info).unwrap();
        let restored: RelayInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, info);
    }

    #[test]
    fn stream_message_tags_are_stable() {
        let msg = StreamMessage::RequestOffline { payload: "movie-night".to_string() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "request_offline");
        assert_eq!(json["payload"], "movie-night");
    }

    #[test]
    fn offer_and_answer_carry_sdp() {
        let msg = StreamMessage::Offer {
            payload: SdpPayload { sdp: "v=0".to_string() },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["payload"]["sdp"], "v=0");
    }
}
