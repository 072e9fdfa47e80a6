use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use futures::stream::SplitStream;
use relay_protocol::{AnswerType, SignalingMessage};
use ulid::Ulid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::AppState;
use crate::participant::Participant;
use crate::peer_conn::PeerConn;
use crate::ws_conn::SafeWebSocket;

/// Handles a viewer ("client") connection: a `Participant` is added to the named room
/// regardless of whether it currently has a producer, so a viewer that arrives before
/// (or between) producers still gets tracks the moment the room goes online.
pub async fn handle(
    state: Arc<AppState>,
    room_name: String,
    ws: Arc<SafeWebSocket>,
    mut stream: SplitStream<WebSocket>,
) {
    let room = crate::ingest::get_or_create_room(&state, &room_name).await;

    let peer_conn = match PeerConn::new(
        &state.webrtc_api,
        crate::webrtc_api::ice_configuration(&state.config.webrtc),
        || {},
    )
    .await
    {
        Ok(pc) => pc,
        Err(e) => {
            tracing::error!(%room_name, "failed to create participant peer connection: {e}");
            return;
        }
    };

    {
        let ws = Arc::clone(&ws);
        peer_conn.on_ice_candidate(move |candidate| {
            if let Some(candidate) = candidate {
                let ws = Arc::clone(&ws);
                tokio::spawn(async move {
                    let _ = ws.send_ice_candidate(candidate).await;
                });
            }
        });
    }

    let participant = Arc::new(Participant::new(Ulid::new(), Arc::clone(&ws), peer_conn));
    if let Err(e) = participant.create_data_channel(Arc::clone(&room)).await {
        tracing::warn!(participant = %participant.id, "failed to create participant data channel: {e}");
    }
    room.add_participant(Arc::clone(&participant)).await;

    if !room.is_online() {
        let _ = ws.send_answer(AnswerType::Offline).await;
        state.relay.maybe_request_stream(Arc::clone(&room)).await;
    } else {
        if let Some(audio) = room.audio_track.read().await.clone() {
            let _ = participant.add_track(audio).await;
        }
        if let Some(video) = room.video_track.read().await.clone() {
            let _ = participant.add_track(video).await;
        }
        if let Err(e) = participant.signal_offer().await {
            tracing::warn!(participant = %participant.id, "failed to signal initial offer: {e}");
        }
    }

    while let Some(message) = stream.next().await {
        let Ok(message) = message else { break };
        let Message::Text(text) = message else { continue };
        let Ok(signaling) = serde_json::from_str::<SignalingMessage>(&text) else {
            continue;
        };

        match signaling {
            SignalingMessage::Sdp { sdp } if sdp.kind == "answer" => {
                if let Ok(answer) = RTCSessionDescription::answer(sdp.sdp) {
                    if let Err(e) = participant.set_remote_answer(answer).await {
                        tracing::warn!(participant = %participant.id, "failed to set remote answer: {e}");
                    }
                }
            }
            SignalingMessage::Ice { candidate } => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: None,
                };
                let _ = participant.peer_conn.add_ice_candidate(init).await;
            }
            _ => {}
        }
    }

    room.remove_participant(participant.id).await;
    let _ = participant.peer_conn.inner.close().await;
    crate::ingest::maybe_delete_empty_room(&state, &room_name, &room).await;
}
