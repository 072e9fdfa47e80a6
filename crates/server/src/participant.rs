use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tokio::sync::Mutex;
use ulid::Ulid;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::peer_conn::PeerConn;
use crate::room::Room;
use crate::ws_conn::SafeWebSocket;

static NEXT_NAME_SEED: AtomicU64 = AtomicU64::new(0);

const NAME_ADJECTIVES: &[&str] = &[
    "swift", "quiet", "amber", "brave", "lucky", "calm", "bold", "keen", "mellow", "vivid",
];
const NAME_NOUNS: &[&str] = &[
    "otter", "falcon", "cedar", "comet", "ember", "harbor", "lynx", "maple", "nebula", "willow",
];

/// Generates a cosmetic two-word display name, e.g. "swift-otter". Purely for showing
/// something nicer than a raw ULID in logs and any future viewer UI; it has no role in
/// identity or routing.
pub fn generate_display_name() -> String {
    let seed = NEXT_NAME_SEED.fetch_add(1, Ordering::Relaxed);
    let adjective = NAME_ADJECTIVES[(seed as usize) % NAME_ADJECTIVES.len()];
    let noun = NAME_NOUNS[(seed as usize / NAME_ADJECTIVES.len()) % NAME_NOUNS.len()];
    format!("{adjective}-{noun}")
}

/// A viewer connected to a room's WebSocket endpoint, waiting for (or already
/// receiving) the room's audio/video tracks over its own `PeerConn`.
pub struct Participant {
    pub id: Ulid,
    pub display_name: String,
    pub ws: Arc<SafeWebSocket>,
    pub peer_conn: Arc<PeerConn>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl Participant {
    pub fn new(id: Ulid, ws: Arc<SafeWebSocket>, peer_conn: Arc<PeerConn>) -> Self {
        Self {
            id,
            display_name: generate_display_name(),
            ws,
            peer_conn,
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Add a room's track to this participant's connection, spawning the RTCP drain
    /// loop every sender needs to keep its congestion control fed.
    pub async fn add_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = track;
        let sender = self.peer_conn.inner.add_track(track).await?;
        let drain_target = Arc::clone(&sender);
        tokio::spawn(async move {
            crate::media_pipe::drain_sender_rtcp(drain_target).await;
        });
        self.senders.lock().await.push(sender);
        Ok(())
    }

    /// Remove every previously added sender so the next `add_track` pass (after a room
    /// comes back online with a new producer) starts from a clean transceiver set.
    pub async fn clear_tracks(&self) -> Result<()> {
        let mut senders = self.senders.lock().await;
        for sender in senders.drain(..) {
            let _ = self.peer_conn.inner.remove_track(&sender).await;
        }
        Ok(())
    }

    /// Create and send an SDP offer reflecting whatever tracks have been added so far.
    pub async fn signal_offer(&self) -> Result<()> {
        let offer = self.peer_conn.inner.create_offer(None).await?;
        self.peer_conn.inner.set_local_description(offer.clone()).await?;
        self.ws.send_sdp(&offer).await
    }

    pub async fn set_remote_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        self.peer_conn.inner.set_remote_description(answer).await?;
        self.peer_conn.drain_ice_buffer().await
    }

    /// Create this participant's own data channel and forward everything it sends to
    /// the room's data channel, if one is currently bound — either the room's local
    /// producer's channel, or (for a room mirrored in from elsewhere in the mesh) the
    /// inter-relay bridge's channel. Created eagerly, before any offer is signaled, so
    /// it's already open by the time the participant's client starts sending input.
    pub async fn create_data_channel(&self, room: Arc<Room>) -> Result<()> {
        let dc = self
            .peer_conn
            .inner
            .create_data_channel(
                "data",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    max_retransmits: Some(0),
                    ..Default::default()
                }),
            )
            .await?;

        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let room = Arc::clone(&room);
            Box::pin(async move {
                let data = if tracing::enabled!(tracing::Level::DEBUG) {
                    relay_protocol::stamp_relay_to_node(&msg.data).unwrap_or_else(|| msg.data.to_vec())
                } else {
                    msg.data.to_vec()
                };
                if let Some(room_dc) = room.data_channel.lock().await.clone() {
                    let _ = room_dc.send(&bytes::Bytes::from(data)).await;
                }
            })
        }));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_are_stable_two_word_pairs() {
        let name = generate_display_name();
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(NAME_ADJECTIVES.contains(&parts[0]));
        assert!(NAME_NOUNS.contains(&parts[1]));
    }
}
