use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures::StreamExt;
use relay_protocol::JoinMessage;

use crate::AppState;
use crate::ws_conn::SafeWebSocket;

pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/api/ws/{room_name}", get(ws_handler));

    if state.config.server.control_secret.is_some() {
        router = router.route("/api/control", post(control_handler));
    }

    router.with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(room_name): Path<String>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| async move {
        let (ws, mut stream) = SafeWebSocket::split(socket);

        let join = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<JoinMessage>(&text) {
                    Ok(join) => break join,
                    Err(e) => {
                        tracing::debug!(%room_name, "ignoring non-join frame while waiting to join: {e}");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!(%room_name, "websocket error before join: {e}");
                    return;
                }
            }
        };

        match join.joiner_type {
            relay_protocol::JoinerType::Node => {
                crate::ingest::handle(state, room_name, ws, stream).await;
            }
            relay_protocol::JoinerType::Client => {
                crate::egress::handle(state, room_name, ws, stream).await;
            }
        }
    })
}

/// Shared-secret-gated control endpoint. Authorization uses a constant-time
/// comparison so the relay doesn't leak how many leading bytes of a guessed secret
/// were correct through response timing.
async fn control_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let Some(expected) = &state.config.server.control_secret else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    #[derive(serde::Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum ControlMessage {
        JoinMesh { value: String },
    }

    match serde_json::from_slice::<ControlMessage>(&body) {
        Ok(ControlMessage::JoinMesh { value: addr }) => match addr.parse() {
            Ok(multiaddr) => {
                state.relay.dial(multiaddr).await;
                StatusCode::OK.into_response()
            }
            Err(e) => (StatusCode::BAD_REQUEST, format!("invalid multiaddr: {e}")).into_response(),
        },
        Err(e) => (StatusCode::BAD_REQUEST, format!("invalid control message: {e}")).into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longer-secret"));
    }

    #[test]
    fn constant_time_eq_accepts_matching_bytes() {
        assert!(constant_time_eq(b"same-secret", b"same-secret"));
    }

    #[test]
    fn constant_time_eq_rejects_near_miss() {
        assert!(!constant_time_eq(b"same-secreu", b"same-secret"));
    }

    // --- HTTP-level integration tests ---
    //
    // These use `tower::ServiceExt::oneshot` to send requests through the axum
    // router without starting a real HTTP server or TLS listener.

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use relay_protocol::RelayConfig;
    use tower::ServiceExt;

    async fn body_text(response: axum::response::Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn test_app_state(control_secret: Option<&str>) -> Arc<AppState> {
        let mut config = RelayConfig::default();
        config.server.control_secret = control_secret.map(str::to_string);
        let webrtc_api = Arc::new(crate::webrtc_api::build_api(&config.webrtc).unwrap());
        let identity = libp2p::identity::Keypair::generate_ed25519();
        let relay = crate::mesh::Relay::new(identity, 0, Arc::clone(&webrtc_api), config.webrtc.clone())
            .await
            .unwrap();
        Arc::new(AppState { config, webrtc_api, relay })
    }

    #[tokio::test]
    async fn control_endpoint_absent_without_a_configured_secret() {
        let state = test_app_state(None).await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/control")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn control_endpoint_rejects_missing_authorization() {
        let state = test_app_state(Some("topsecret")).await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/control")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn control_endpoint_rejects_malformed_body_once_authorized() {
        let state = test_app_state(Some("topsecret")).await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/control")
            .header("authorization", "topsecret")
            .body(Body::from("not json"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn control_endpoint_rejects_unparseable_multiaddr() {
        let state = test_app_state(Some("topsecret")).await;
        let app = build_router(state);

        let request = Request::builder()
            .method("POST")
            .uri("/api/control")
            .header("authorization", "topsecret")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"type":"join_mesh","value":"not-a-multiaddr"}"#))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("invalid multiaddr"));
    }
}
