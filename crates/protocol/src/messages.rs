use serde::{Deserialize, Serialize};

/// Who is joining a room's WebSocket endpoint. Carried on the first frame of every
/// connection and never re-sent; it determines whether the socket is treated as a
/// producer (ingest) or a viewer (participant) for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinerType {
    Node,
    Client,
}

/// Outcome communicated back to a joiner once its role has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    /// The room has no active producer (for a client) or already has one (for a node).
    Offline,
    /// A node attempted to join a room that already has an online producer.
    InUse,
    Ok,
}

/// First (and only) frame a joiner sends: declares its role in the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinMessage {
    pub joiner_type: JoinerType,
}

/// An SDP offer or answer, nested under `SignalingMessage::Sdp` the way a browser's
/// `RTCSessionDescriptionInit` is shaped: a `type` discriminant alongside the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdpDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Every subsequent signaling message, tagged by `payload_type` so a single read loop
/// can route by shape without a second parse pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type", rename_all = "lowercase")]
pub enum SignalingMessage {
    Sdp { sdp: SdpDescription },
    Ice { candidate: IceCandidateInit },
    Answer { answer_type: AnswerType },
    Log { level: String, message: String },
    Metrics { payload: serde_json::Value },
}

/// Mirrors the shape of `RTCIceCandidateInit` so it can be forwarded to/from a browser
/// peer without reinterpreting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joiner_type_serializes_as_snake_case_string() {
        let json = serde_json::to_string(&JoinerType::Client).unwrap();
        assert_eq!(json, "\"client\"");
    }

    #[test]
    fn answer_type_round_trips() {
        for variant in [AnswerType::Offline, AnswerType::InUse, AnswerType::Ok] {
            let json = serde_json::to_string(&variant).unwrap();
            let restored: AnswerType = serde_json::from_str(&json).unwrap();
            assert_eq!(restored, variant);
        }
    }

    #[test]
    fn signaling_message_tags_by_payload_type() {
        let msg = SignalingMessage::Sdp {
            sdp: SdpDescription { kind: "offer".to_string(), sdp: "v=0".to_string() },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload_type"], "sdp");
        assert_eq!(json["sdp"]["type"], "offer");
        assert_eq!(json["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn join_message_parses_minimal_frame() {
        let raw = r#"{"joiner_type":"node"}"#;
        let parsed: JoinMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.joiner_type, JoinerType::Node);
    }
}
