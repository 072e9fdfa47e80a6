use std::sync::Arc;

use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use relay_protocol::mesh::{IcePayload, SdpPayload, StreamMessage};
use relay_protocol::{LENGTH_PREFIX_SIZE, MAX_FRAME_LEN};
use tokio::sync::mpsc;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::peer_conn::PeerConn;

use super::relay::{MeshBridge, Relay};

pub const STREAM_REQUEST_PROTOCOL: StreamProtocol = StreamProtocol::new("/stream-request/1.0");
pub const STREAM_PUSH_PROTOCOL: StreamProtocol = StreamProtocol::new("/stream-push/1.0");

/// Frames queued here are written to the stream in order by a single writer task, so
/// the ICE-candidate callback (fired from webrtc-rs's own executor) and the main
/// negotiation loop never race to write to the same half of the split stream.
type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

async fn read_message<T: AsyncRead + Unpin>(io: &mut T) -> std::io::Result<StreamMessage> {
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds {MAX_FRAME_LEN}-byte cap"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    io.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

fn encode_frame(msg: &StreamMessage) -> Vec<u8> {
    relay_protocol::frame::encode(msg).expect("StreamMessage always serializes")
}

fn spawn_writer<T>(mut write_half: T) -> FrameSender
where
    T: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });
    tx
}

fn ice_to_message(candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidate) -> Option<StreamMessage> {
    let init = candidate.to_json().ok()?;
    Some(StreamMessage::Ice {
        payload: IcePayload {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        },
    })
}

fn ice_from_payload(payload: IcePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: payload.candidate,
        sdp_mid: payload.sdp_mid,
        sdp_mline_index: payload.sdp_mline_index,
        username_fragment: None,
    }
}

/// Drive the `/stream-request/1.0` accept loop for as long as the relay runs, spawning
/// one task per inbound stream.
pub async fn run_request_responder(relay: Arc<Relay>) {
    let mut control = relay.stream_control.clone();
    let mut incoming = match control.accept(STREAM_REQUEST_PROTOCOL) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::error!("failed to register stream-request responder: {e}");
            return;
        }
    };
    while let Some((peer, stream)) = incoming.next().await {
        tokio::spawn(handle_incoming_request(Arc::clone(&relay), peer, stream));
    }
}

/// Drive the `/stream-push/1.0` accept loop. A relay that proactively pushes a room
/// (rather than waiting to be asked for one) opens one of these.
pub async fn run_push_responder(relay: Arc<Relay>) {
    let mut control = relay.stream_control.clone();
    let mut incoming = match control.accept(STREAM_PUSH_PROTOCOL) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::error!("failed to register stream-push responder: {e}");
            return;
        }
    };
    while let Some((peer, stream)) = incoming.next().await {
        tokio::spawn(handle_incoming_push(Arc::clone(&relay), peer, stream));
    }
}

/// Responder side of `/stream-request/1.0`: a remote relay asked us for a room we
/// (may) own. If it's ours and online, answer with an offer and negotiate an
/// inter-relay `PeerConnection` that mirrors the room's current tracks and data
/// channel; otherwise tell it the room is offline and close the stream.
async fn handle_incoming_request(relay: Arc<Relay>, peer: PeerId, stream: libp2p::Stream) {
    let (mut read_half, write_half) = stream.split();
    let tx = spawn_writer(write_half);

    let mut peer_conn: Option<Arc<PeerConn>> = None;

    loop {
        let msg = match read_message(&mut read_half).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%peer, "stream-request closed: {e}");
                break;
            }
        };

        match msg {
            StreamMessage::RequestRoom { payload: room_name } => {
                let room = relay.local_room_by_name(&room_name).await;
                let Some(room) = room.filter(|r| r.is_online() && r.owner_id == relay.peer_id.to_string())
                else {
                    let _ = tx.send(encode_frame(&StreamMessage::RequestOffline { payload: room_name }));
                    continue;
                };

                let relay_for_close = Arc::clone(&relay);
                let pc = match PeerConn::new(&relay.webrtc_api, relay.ice_configuration(), move || {
                    let relay = Arc::clone(&relay_for_close);
                    tokio::spawn(async move { relay.remove_served_stream(peer).await });
                })
                .await
                {
                    Ok(pc) => pc,
                    Err(e) => {
                        tracing::warn!(%peer, %room_name, "failed to create mesh responder peer connection: {e}");
                        continue;
                    }
                };

                if let Some(audio) = room.audio_track.read().await.clone() {
                    let track: Arc<dyn TrackLocal + Send + Sync> = audio;
                    let _ = pc.inner.add_track(track).await;
                }
                if let Some(video) = room.video_track.read().await.clone() {
                    let track: Arc<dyn TrackLocal + Send + Sync> = video;
                    let _ = pc.inner.add_track(track).await;
                }

                if let Ok(dc) = pc
                    .inner
                    .create_data_channel(
                        "relay-data",
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            max_retransmits: Some(2),
                            ..Default::default()
                        }),
                    )
                    .await
                {
                    let room_for_input = Arc::clone(&room);
                    dc.on_message(Box::new(move |msg: DataChannelMessage| {
                        let room = Arc::clone(&room_for_input);
                        Box::pin(async move {
                            if let Some(room_dc) = room.data_channel.lock().await.clone() {
                                let _ = room_dc.send(&msg.data).await;
                            }
                        })
                    }));
                }

                {
                    let tx = tx.clone();
                    pc.on_ice_candidate(move |candidate| {
                        if let Some(candidate) = candidate
                            && let Some(msg) = ice_to_message(candidate)
                        {
                            let _ = tx.send(encode_frame(&msg));
                        }
                    });
                }

                let offer = match pc.inner.create_offer(None).await {
                    Ok(offer) => offer,
                    Err(e) => {
                        tracing::warn!(%peer, %room_name, "failed to create mesh offer: {e}");
                        continue;
                    }
                };
                if pc.inner.set_local_description(offer.clone()).await.is_err() {
                    continue;
                }
                let _ = tx.send(encode_frame(&StreamMessage::Offer { payload: SdpPayload { sdp: offer.sdp } }));

                relay.add_served_stream(peer, Arc::clone(&pc)).await;
                peer_conn = Some(pc);
            }
            StreamMessage::Answer { payload } => {
                if let Some(pc) = &peer_conn
                    && let Ok(answer) = RTCSessionDescription::answer(payload.sdp)
                {
                    let _ = pc.inner.set_remote_description(answer).await;
                    let _ = pc.drain_ice_buffer().await;
                }
            }
            StreamMessage::Ice { payload } => {
                if let Some(pc) = &peer_conn {
                    let _ = pc.add_ice_candidate(ice_from_payload(payload)).await;
                }
            }
            _ => {}
        }
    }
}

/// Responder side of `/stream-push/1.0`: a remote relay is proactively pushing a room
/// at us. Accept unless we already own a different, online room of the same name;
/// the resulting `PeerConnection`'s incoming tracks and data channel get written
/// straight into the local `Room`, exactly as if a local producer had connected.
async fn handle_incoming_push(relay: Arc<Relay>, peer: PeerId, stream: libp2p::Stream) {
    let (mut read_half, write_half) = stream.split();
    let tx = spawn_writer(write_half);

    let mut peer_conn: Option<Arc<PeerConn>> = None;

    loop {
        let msg = match read_message(&mut read_half).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%peer, "stream-push closed: {e}");
                break;
            }
        };

        match msg {
            StreamMessage::PushRoom { payload: room_name } => {
                let room = relay.find_or_create_pushed_room(&room_name, peer).await;
                let Some(room) = room else {
                    let _ = tx.send(encode_frame(&StreamMessage::RequestOffline { payload: room_name }));
                    continue;
                };

                let relay_for_close = Arc::clone(&relay);
                let room_for_close = Arc::clone(&room);
                let pc = match PeerConn::new(&relay.webrtc_api, relay.ice_configuration(), move || {
                    let relay = Arc::clone(&relay_for_close);
                    let room = Arc::clone(&room_for_close);
                    tokio::spawn(async move {
                        room.set_track(RTPCodecType::Audio, None).await;
                        room.set_track(RTPCodecType::Video, None).await;
                        relay.remove_served_stream(peer).await;
                    });
                })
                .await
                {
                    Ok(pc) => pc,
                    Err(e) => {
                        tracing::warn!(%peer, %room_name, "failed to create mesh push peer connection: {e}");
                        continue;
                    }
                };

                {
                    let room = Arc::clone(&room);
                    pc.inner.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                        let room = Arc::clone(&room);
                        Box::pin(async move {
                            *room.data_channel.lock().await = Some(dc);
                        })
                    }));
                }

                {
                    let room = Arc::clone(&room);
                    pc.inner.on_track(Box::new(move |remote_track, receiver, _| {
                        let room = Arc::clone(&room);
                        Box::pin(async move {
                            let kind = remote_track.kind();
                            let local_track = Arc::new(TrackLocalStaticRTP::new(
                                remote_track.codec().capability,
                                format!("mesh-{}-{kind}", room.name),
                                format!("mesh-{}", room.name),
                            ));
                            room.set_track(kind, Some(Arc::clone(&local_track))).await;
                            tokio::spawn(crate::media_pipe::drain_receiver_rtcp(receiver));
                            crate::media_pipe::pump_rtp(remote_track, local_track).await;
                            room.set_track(kind, None).await;
                        })
                    }));
                }

                {
                    let tx = tx.clone();
                    pc.on_ice_candidate(move |candidate| {
                        if let Some(candidate) = candidate
                            && let Some(msg) = ice_to_message(candidate)
                        {
                            let _ = tx.send(encode_frame(&msg));
                        }
                    });
                }

                relay.add_served_stream(peer, Arc::clone(&pc)).await;
                peer_conn = Some(pc);
            }
            StreamMessage::Offer { payload } => {
                let Some(pc) = &peer_conn else { continue };
                let Ok(offer) = RTCSessionDescription::offer(payload.sdp) else { continue };
                if pc.inner.set_remote_description(offer).await.is_err() {
                    continue;
                }
                let _ = pc.drain_ice_buffer().await;

                let answer = match pc.inner.create_answer(None).await {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(%peer, "failed to create mesh push answer: {e}");
                        continue;
                    }
                };
                if pc.inner.set_local_description(answer.clone()).await.is_err() {
                    continue;
                }
                let _ = tx.send(encode_frame(&StreamMessage::Answer { payload: SdpPayload { sdp: answer.sdp } }));
            }
            StreamMessage::Ice { payload } => {
                if let Some(pc) = &peer_conn {
                    let _ = pc.add_ice_candidate(ice_from_payload(payload)).await;
                }
            }
            _ => {}
        }
    }
}

/// Requester side of `/stream-request/1.0`: ask `owner` for `room_name` and, once it
/// answers with an offer, mirror its tracks and data channel into our local `room`.
/// A no-op if a bridge for this room name is already pending or established.
pub async fn request_room_stream(relay: Arc<Relay>, room: Arc<crate::room::Room>, room_name: String, owner: PeerId) {
    if !relay.begin_request(&room_name).await {
        return;
    }

    let mut control = relay.stream_control.clone();
    let stream = match control.open_stream(owner, STREAM_REQUEST_PROTOCOL).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%owner, %room_name, "failed to open stream-request: {e}");
            relay.abort_request(&room_name).await;
            return;
        }
    };

    let (mut read_half, write_half) = stream.split();
    let tx = spawn_writer(write_half);

    if tx
        .send(encode_frame(&StreamMessage::RequestRoom { payload: room_name.clone() }))
        .is_err()
    {
        relay.abort_request(&room_name).await;
        return;
    }

    let offer_sdp = match read_message(&mut read_half).await {
        Ok(StreamMessage::Offer { payload }) => payload.sdp,
        Ok(StreamMessage::RequestOffline { .. }) => {
            tracing::debug!(%owner, %room_name, "remote relay reports room offline");
            relay.abort_request(&room_name).await;
            return;
        }
        Ok(_) | Err(_) => {
            relay.abort_request(&room_name).await;
            return;
        }
    };

    let relay_for_close = Arc::clone(&relay);
    let room_for_close = Arc::clone(&room);
    let name_for_close = room_name.clone();
    let pc = match PeerConn::new(&relay.webrtc_api, relay.ice_configuration(), move || {
        let relay = Arc::clone(&relay_for_close);
        let room = Arc::clone(&room_for_close);
        let room_name = name_for_close.clone();
        tokio::spawn(async move {
            room.set_track(RTPCodecType::Audio, None).await;
            room.set_track(RTPCodecType::Video, None).await;
            relay.remove_requested_stream(&room_name).await;
        });
    })
    .await
    {
        Ok(pc) => pc,
        Err(e) => {
            tracing::warn!(%owner, %room_name, "failed to create mesh requester peer connection: {e}");
            relay.abort_request(&room_name).await;
            return;
        }
    };

    let bridge = Arc::new(MeshBridge { peer: owner, peer_conn: Arc::clone(&pc) });
    relay.complete_request(room_name.clone(), Arc::clone(&bridge)).await;

    {
        let tx = tx.clone();
        pc.on_ice_candidate(move |candidate| {
            if let Some(candidate) = candidate
                && let Some(msg) = ice_to_message(candidate)
            {
                let _ = tx.send(encode_frame(&msg));
            }
        });
    }

    {
        let room = Arc::clone(&room);
        let room_name = room_name.clone();
        pc.inner.on_track(Box::new(move |remote_track, receiver, _| {
            let room = Arc::clone(&room);
            let room_name = room_name.clone();
            Box::pin(async move {
                let kind = remote_track.kind();
                let local_track = Arc::new(TrackLocalStaticRTP::new(
                    remote_track.codec().capability,
                    format!("mesh-{room_name}-{kind}"),
                    format!("mesh-{room_name}"),
                ));
                room.set_track(kind, Some(Arc::clone(&local_track))).await;
                tokio::spawn(crate::media_pipe::drain_receiver_rtcp(receiver));
                crate::media_pipe::pump_rtp(remote_track, local_track).await;
                room.set_track(kind, None).await;
            })
        }));
    }

    {
        let room = Arc::clone(&room);
        pc.inner.on_data_channel(Box::new(move |dc| {
            let room = Arc::clone(&room);
            Box::pin(async move {
                *room.data_channel.lock().await = Some(dc);
            })
        }));
    }

    let Ok(offer) = RTCSessionDescription::offer(offer_sdp) else {
        tracing::warn!(%owner, %room_name, "received malformed mesh offer SDP");
        return;
    };
    if pc.inner.set_remote_description(offer).await.is_err() {
        return;
    }
    let _ = pc.drain_ice_buffer().await;

    let answer = match pc.inner.create_answer(None).await {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(%owner, %room_name, "failed to create mesh answer: {e}");
            return;
        }
    };
    if pc.inner.set_local_description(answer.clone()).await.is_err() {
        return;
    }
    let _ = tx.send(encode_frame(&StreamMessage::Answer { payload: SdpPayload { sdp: answer.sdp } }));

    loop {
        match read_message(&mut read_half).await {
            Ok(StreamMessage::Ice { payload }) => {
                let _ = pc.add_ice_candidate(ice_from_payload(payload)).await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(%owner, %room_name, "mesh request stream closed: {e}");
                break;
            }
        }
    }
}
