use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use futures::stream::SplitStream;
use relay_protocol::{AnswerType, SignalingMessage};
use ulid::Ulid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::AppState;
use crate::peer_conn::PeerConn;
use crate::room::Room;
use crate::ws_conn::SafeWebSocket;

/// Handles a producer ("node") connection: finds or creates the named room, wires up
/// a `PeerConn` that forwards whatever audio/video arrives onto the room's shared
/// local tracks, and tears the room down to offline when the connection ends.
///
/// A room that's already online refuses a second producer outright — only one
/// producer drives a room at a time.
pub async fn handle(
    state: Arc<AppState>,
    room_name: String,
    ws: Arc<SafeWebSocket>,
    mut stream: SplitStream<WebSocket>,
) {
    let room = get_or_create_room(&state, &room_name).await;

    if room.is_online() {
        let _ = ws.send_answer(AnswerType::InUse).await;
        return;
    }

    let on_close_room = Arc::clone(&room);
    let on_close_state = Arc::clone(&state);
    let room_name_for_close = room_name.clone();
    let peer_conn = match PeerConn::new(
        &state.webrtc_api,
        crate::webrtc_api::ice_configuration(&state.config.webrtc),
        move || {
            let room = Arc::clone(&on_close_room);
            let state = Arc::clone(&on_close_state);
            let room_name = room_name_for_close.clone();
            tokio::spawn(async move {
                let _ = room.set_track(RTPCodecType::Audio, None).await;
                room.set_track(RTPCodecType::Video, None).await;
                state.relay.publish_room_states().await;
                maybe_delete_empty_room(&state, &room_name, &room).await;
            });
        },
    )
    .await
    {
        Ok(pc) => pc,
        Err(e) => {
            tracing::error!(%room_name, "failed to create ingest peer connection: {e}");
            return;
        }
    };

    *room.ingest_peer_conn.lock().await = Some(Arc::clone(&peer_conn.inner));

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

    {
        let room = Arc::clone(&room);
        let state = Arc::clone(&state);
        peer_conn.inner.on_track(Box::new(move |remote_track, receiver, _| {
            let room = Arc::clone(&room);
            let state = Arc::clone(&state);
            Box::pin(async move {
                let kind = remote_track.kind();
                let local_track = Arc::new(TrackLocalStaticRTP::new(
                    remote_track.codec().capability,
                    format!("relay-{}-{kind}", room.name),
                    format!("relay-{}", room.name),
                ));
                room.set_track(kind, Some(Arc::clone(&local_track))).await;
                state.relay.publish_room_states().await;

                tokio::spawn(crate::media_pipe::drain_receiver_rtcp(receiver));
                crate::media_pipe::pump_rtp(remote_track, local_track).await;

                room.set_track(kind, None).await;
                state.relay.publish_room_states().await;
            })
        }));
    }

    {
        let room = Arc::clone(&room);
        peer_conn.inner.on_data_channel(Box::new(move |dc| {
            let room = Arc::clone(&room);
            Box::pin(async move {
                *room.data_channel.lock().await = Some(dc);
            })
        }));
    }

    let _ = ws.send_answer(AnswerType::Ok).await;

    while let Some(message) = stream.next().await {
        let Ok(message) = message else { break };
        let Message::Text(text) = message else { continue };
        let Ok(signaling) = serde_json::from_str::<SignalingMessage>(&text) else {
            continue;
        };

        match signaling {
            SignalingMessage::Sdp { sdp } if sdp.kind == "offer" => {
                if let Err(e) = handle_offer(&peer_conn, &ws, sdp.sdp).await {
                    tracing::warn!(%room_name, "failed to handle ingest SDP offer: {e}");
                }
            }
            SignalingMessage::Ice { candidate } => {
                let init = RTCIceCandidateInit {
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                    username_fragment: None,
                };
                let _ = peer_conn.add_ice_candidate(init).await;
            }
            _ => {}
        }
    }

    on_disconnect(&state, &room, &room_name).await;
}

async fn handle_offer(
    peer_conn: &Arc<PeerConn>,
    ws: &Arc<SafeWebSocket>,
    sdp: String,
) -> anyhow::Result<()> {
    let offer = RTCSessionDescription::offer(sdp)?;
    peer_conn.inner.set_remote_description(offer).await?;
    peer_conn.drain_ice_buffer().await?;

    let answer = peer_conn.inner.create_answer(None).await?;
    peer_conn.inner.set_local_description(answer.clone()).await?;
    ws.send_sdp(&answer).await
}

async fn on_disconnect(state: &Arc<AppState>, room: &Arc<Room>, room_name: &str) {
    room.set_track(RTPCodecType::Audio, None).await;
    room.set_track(RTPCodecType::Video, None).await;
    state.relay.publish_room_states().await;
    maybe_delete_empty_room(state, room_name, room).await;
}

pub(crate) async fn get_or_create_room(state: &Arc<AppState>, room_name: &str) -> Arc<Room> {
    let mut rooms = state.relay.local_rooms.write().await;
    if let Some(room) = rooms.values().find(|r| r.name == room_name) {
        return Arc::clone(room);
    }
    let room = Arc::new(Room::new(
        Ulid::new(),
        room_name.to_string(),
        state.relay.peer_id.to_string(),
    ));
    rooms.insert(room.id, Arc::clone(&room));
    room
}

/// Drops a room from the local table once it has no producer and no viewers left.
/// Corrects a reference-implementation bug where this unconditionally closed the
/// room's `PeerConnection` even when none had ever been created.
pub(crate) async fn maybe_delete_empty_room(state: &Arc<AppState>, room_name: &str, room: &Arc<Room>) {
    if room.participant_count().await > 0 {
        return;
    }
    let mut rooms = state.relay.local_rooms.write().await;
    if rooms.remove(&room.id).is_none() {
        return;
    }
    drop(rooms);

    if let Some(pc) = room.ingest_peer_conn.lock().await.take() {
        let _ = pc.close().await;
    }
    tracing::info!(%room_name, "room removed (empty)");
}
