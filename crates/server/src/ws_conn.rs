use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_protocol::{AnswerType, IceCandidateInit, SdpDescription, SignalingMessage};
use tokio::sync::Mutex;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// A mutex-guarded wrapper around an Axum WebSocket split sink, matching the shape of
/// the Go original's `SafeWebSocket`: every signaling handler sends JSON frames from
/// whatever task happens to produce them (ICE candidate callbacks, the RTP pump's
/// error path, the room's offer signaling), so writes need to be serialized against
/// each other even though the underlying socket isn't `Clone`.
pub struct SafeWebSocket {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    closed: std::sync::atomic::AtomicBool,
}

impl SafeWebSocket {
    pub fn split(socket: WebSocket) -> (Arc<Self>, SplitStream<WebSocket>) {
        let (sink, stream) = socket.split();
        (
            Arc::new(Self {
                sink: Mutex::new(sink),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
            stream,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::Acquire)
    }

    pub async fn send_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let text = serde_json::to_string(value).context("failed to serialize WS message")?;
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            self.closed.store(true, std::sync::atomic::Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn send_sdp(&self, description: &RTCSessionDescription) -> Result<()> {
        self.send_json(&SignalingMessage::Sdp {
            sdp: SdpDescription {
                kind: description.sdp_type.to_string(),
                sdp: description.sdp.clone(),
            },
        })
        .await
    }

    pub async fn send_ice_candidate(&self, candidate: RTCIceCandidate) -> Result<()> {
        let init = candidate.to_json().context("failed to marshal ICE candidate")?;
        self.send_json(&SignalingMessage::Ice {
            candidate: IceCandidateInit {
                candidate: init.candidate,
                sdp_mid: init.sdp_mid,
                sdp_mline_index: init.sdp_mline_index,
            },
        })
        .await
    }

    pub async fn send_answer(&self, answer_type: AnswerType) -> Result<()> {
        self.send_json(&SignalingMessage::Answer { answer_type }).await
    }

    pub async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
