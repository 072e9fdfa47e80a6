use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use relay_protocol::AnswerType;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::participant::Participant;

/// A named media channel, owned by exactly one relay, carrying at most one producer's
/// audio+video at a time.
///
/// `online` is derived state: it flips to `true` only on the transition where both
/// tracks become present, and to `false` only on the transition where either track is
/// cleared. Every other `set_track` call (e.g. a track arriving while the other slot
/// is already empty) leaves `online` untouched — this is what keeps a producer
/// restarting just its video track from flapping the room's public state every frame.
pub struct Room {
    pub id: Ulid,
    pub name: String,
    /// Stringified libp2p `PeerId` of the relay that owns this room.
    pub owner_id: String,
    pub online: AtomicBool,
    pub ingest_peer_conn: Mutex<Option<Arc<RTCPeerConnection>>>,
    pub audio_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    pub video_track: RwLock<Option<Arc<TrackLocalStaticRTP>>>,
    pub data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    pub participants: RwLock<HashMap<Ulid, Arc<Participant>>>,
}

impl Room {
    pub fn new(id: Ulid, name: String, owner_id: String) -> Self {
        Self {
            id,
            name,
            owner_id,
            online: AtomicBool::new(false),
            ingest_peer_conn: Mutex::new(None),
            audio_track: RwLock::new(None),
            video_track: RwLock::new(None),
            data_channel: Mutex::new(None),
            participants: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub async fn add_participant(&self, participant: Arc<Participant>) {
        self.participants
            .write()
            .await
            .insert(participant.id, participant);
    }

    pub async fn remove_participant(&self, id: Ulid) {
        self.participants.write().await.remove(&id);
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Set (or clear) one of the room's two media slots and act on whatever transition
    /// that produces, if any. Returns `true` if the room's online state changed.
    pub async fn set_track(
        &self,
        kind: RTPCodecType,
        track: Option<Arc<TrackLocalStaticRTP>>,
    ) -> bool {
        match kind {
            RTPCodecType::Audio => *self.audio_track.write().await = track,
            RTPCodecType::Video => *self.video_track.write().await = track,
            RTPCodecType::Unspecified => return false,
        }

        let now_online =
            self.audio_track.read().await.is_some() && self.video_track.read().await.is_some();
        let was_online = self.online.swap(now_online, Ordering::AcqRel);

        if was_online == now_online {
            return false;
        }

        if now_online {
            self.signal_participants_with_tracks().await;
        } else {
            self.signal_participants_offline().await;
        }
        true
    }

    async fn signal_participants_with_tracks(&self) {
        let audio = self.audio_track.read().await.clone();
        let video = self.video_track.read().await.clone();
        let participants: Vec<_> = self.participants.read().await.values().cloned().collect();

        for participant in participants {
            if let Some(audio) = &audio
                && let Err(e) = participant.add_track(Arc::clone(audio)).await
            {
                tracing::warn!(participant = %participant.id, "failed to add audio track: {e}");
            }
            if let Some(video) = &video
                && let Err(e) = participant.add_track(Arc::clone(video)).await
            {
                tracing::warn!(participant = %participant.id, "failed to add video track: {e}");
            }
            if let Err(e) = participant.signal_offer().await {
                tracing::warn!(participant = %participant.id, "failed to signal offer: {e}");
            }
        }
    }

    async fn signal_participants_offline(&self) {
        let participants: Vec<_> = self.participants.read().await.values().cloned().collect();
        for participant in participants {
            if participant.ws.is_closed() {
                continue;
            }
            if let Err(e) = participant.ws.send_answer(AnswerType::Offline).await {
                tracing::debug!(participant = %participant.id, "failed to signal offline: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_room() -> Room {
        Room::new(Ulid::new(), "test-room".to_string(), "12D3KooWSelf".to_string())
    }

    #[tokio::test]
    async fn online_only_flips_once_both_tracks_are_present() {
        let room = new_room();
        assert!(!room.is_online());

        let changed = room.set_track(RTPCodecType::Audio, None).await;
        assert!(!changed);
        assert!(!room.is_online());
    }

    #[tokio::test]
    async fn clearing_one_track_while_online_goes_offline() {
        let room = new_room();
        *room.audio_track.write().await = Some(fake_track());
        let changed = room.set_track(RTPCodecType::Video, Some(fake_track())).await;
        assert!(changed);
        assert!(room.is_online());

        let changed = room.set_track(RTPCodecType::Video, None).await;
        assert!(changed);
        assert!(!room.is_online());
    }

    #[tokio::test]
    async fn redundant_set_track_does_not_re_signal() {
        let room = new_room();
        *room.audio_track.write().await = Some(fake_track());
        *room.video_track.write().await = Some(fake_track());
        room.online.store(true, Ordering::Release);

        let changed = room.set_track(RTPCodecType::Audio, Some(fake_track())).await;
        assert!(!changed);
        assert!(room.is_online());
    }

    fn fake_track() -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability {
                mime_type: webrtc::api::media_engine::MIME_TYPE_VP8.to_string(),
                ..Default::default()
            },
            "test".to_string(),
            "test-stream".to_string(),
        ))
    }
}
