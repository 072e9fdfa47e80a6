mod config;
mod egress;
mod http;
mod identity;
mod ingest;
mod media_pipe;
mod mesh;
mod participant;
mod peer_conn;
mod room;
mod tls;
mod webrtc_api;
mod ws_conn;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use relay_protocol::RelayConfig;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use webrtc::api::API;

use crate::mesh::Relay;

pub struct AppState {
    pub config: RelayConfig,
    pub webrtc_api: Arc<API>,
    pub relay: Arc<Relay>,
}

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/relay.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();

    let mut config = config::load_config(&config_path)?;
    if let Some(p) = port_override {
        config.server.port = p;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{issue}");
            } else {
                tracing::warn!("{issue}");
            }
        }
        if has_errors {
            tracing::error!(
                "configuration has {} issue(s); fix the ERROR(s) above and restart",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let identity = identity::load_or_generate(&config.mesh.persist_dir, config.mesh.regen_identity)
        .context("failed to establish relay identity")?;

    let webrtc_api =
        Arc::new(webrtc_api::build_api(&config.webrtc).context("failed to build WebRTC API")?);

    let mesh_port = config.server.port + 1000;
    let relay = Relay::new(identity, mesh_port, Arc::clone(&webrtc_api), config.webrtc.clone())
        .await
        .context("failed to start mesh relay")?;
    tracing::info!(peer_id = %relay.peer_id, "relay identity established");

    let state = Arc::new(AppState {
        config: config.clone(),
        webrtc_api,
        relay: Arc::clone(&relay),
    });

    tokio::spawn(Arc::clone(&relay).run());

    let app = http::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
        .parse()
        .context("invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    let tls_config = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) => Some(tls::make_acceptor(tls::build_tls_config(cert, key)?)),
        _ => None,
    };

    tracing::info!("===========================================");
    tracing::info!("  Relay Mesh v0.1.0");
    tracing::info!(
        "  Listening on {}://{bind_addr}",
        if tls_config.is_some() { "https" } else { "http" }
    );
    tracing::info!("===========================================");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let app = app.clone();
                let tls_acceptor = tls_config.clone();

                tokio::spawn(async move {
                    match tls_acceptor {
                        Some(acceptor) => {
                            let tls_stream = match tokio::time::timeout(
                                std::time::Duration::from_secs(10),
                                acceptor.accept(stream),
                            )
                            .await
                            {
                                Ok(Ok(s)) => s,
                                Ok(Err(e)) => {
                                    tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                                    return;
                                }
                                Err(_) => {
                                    tracing::debug!(%peer_addr, "TLS handshake timed out");
                                    return;
                                }
                            };
                            serve_connection(tls_stream, app, peer_addr).await;
                        }
                        None => {
                            serve_connection(stream, app, peer_addr).await;
                        }
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn serve_connection<S>(stream: S, app: axum::Router, peer_addr: SocketAddr)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(stream);
    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
    let builder = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());

    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
        tracing::debug!(%peer_addr, "connection error: {e}");
    }
}
