use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Thin wrapper around an `RTCPeerConnection` that owns the one piece of behavior every
/// caller in this codebase needs identically: close the connection and fire a single
/// callback the first (and only the first) time it reaches a terminal state, and hold
/// ICE candidates that arrive before a remote description has been set instead of
/// dropping them.
pub struct PeerConn {
    pub inner: Arc<RTCPeerConnection>,
    ice_buffer: Mutex<Vec<RTCIceCandidateInit>>,
}

impl PeerConn {
    /// Create a new peer connection and register the close-on-terminal-state handler.
    /// `on_close` fires exactly once, after `Close()` has already been called, mirroring
    /// the ingest/egress handlers' expectation that by the time their callback runs the
    /// connection is fully torn down and safe to forget.
    pub async fn new<F>(api: &API, config: RTCConfiguration, on_close: F) -> Result<Arc<Self>>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("failed to create peer connection")?,
        );

        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let close_target = Arc::clone(&inner);
        let on_close = Arc::new(on_close);
        inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let closed = Arc::clone(&closed);
            let close_target = Arc::clone(&close_target);
            let on_close = Arc::clone(&on_close);
            let fire = matches!(
                state,
                RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed
            );
            Box::pin(async move {
                if fire && !closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    let _ = close_target.close().await;
                    on_close();
                }
            })
        }));

        Ok(Arc::new(Self {
            inner,
            ice_buffer: Mutex::new(Vec::new()),
        }))
    }

    /// Queue or immediately apply a remote ICE candidate, depending on whether a remote
    /// description has been set yet.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        if self.inner.remote_description().await.is_some() {
            self.inner
                .add_ice_candidate(candidate)
                .await
                .context("failed to add ICE candidate")
        } else {
            self.ice_buffer.lock().await.push(candidate);
            Ok(())
        }
    }

    /// Drain and apply every buffered ICE candidate, in arrival order. Call this right
    /// after setting the remote description for the first time.
    pub async fn drain_ice_buffer(&self) -> Result<()> {
        let buffered: Vec<_> = self.ice_buffer.lock().await.drain(..).collect();
        for candidate in buffered {
            self.inner
                .add_ice_candidate(candidate)
                .await
                .context("failed to apply buffered ICE candidate")?;
        }
        Ok(())
    }

    pub fn on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(Option<RTCIceCandidate>) + Send + Sync + 'static,
    {
        self.inner
            .on_ice_candidate(Box::new(move |candidate| {
                handler(candidate);
                Box::pin(async {})
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::WebrtcConfig;

    #[tokio::test]
    async fn buffers_ice_candidates_until_remote_description_is_set() {
        let config = WebrtcConfig::default();
        let api = crate::webrtc_api::build_api(&config).unwrap();
        let ice_config = crate::webrtc_api::ice_configuration(&config);

        let peer_conn = PeerConn::new(&api, ice_config, || {}).await.unwrap();

        peer_conn
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: "candidate:1 1 UDP 1 127.0.0.1 9 typ host".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(peer_conn.ice_buffer.lock().await.len(), 1);
    }
}
