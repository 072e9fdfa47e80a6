use std::sync::Arc;

use anyhow::{Context, Result};
use relay_protocol::WebrtcConfig;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::ice::udp_mux::{UDPMuxDefault, UDPMuxParams};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTCRtpHeaderExtensionCapability, RTPCodecType};

/// The playout-delay RTP header extension negotiated on both audio and video so
/// downstream pipelines can request a fixed buffering window instead of whatever a
/// jitter buffer guesses. Registered once on the shared `MediaEngine`; the actual
/// min/max values are set per-packet in `media_pipe`.
pub const PLAYOUT_DELAY_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/playout-delay";

const H265_PAYLOAD_TYPE: u8 = 48;
const H265_RTX_PAYLOAD_TYPE: u8 = 49;
const MIME_TYPE_H265: &str = "video/H265";

/// Build the shared WebRTC `API` instance used by every `PeerConn` the relay creates,
/// across both producer ingest and viewer egress peer connections.
pub fn build_api(config: &WebrtcConfig) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("failed to register default codecs")?;
    register_h265(&mut media_engine)?;
    register_playout_delay(&mut media_engine)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("failed to register default interceptors")?;

    let setting_engine = build_setting_engine(config)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn register_h265(media_engine: &mut MediaEngine) -> Result<()> {
    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H265.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: supported_video_rtcp_feedback(),
                },
                payload_type: H265_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .context("failed to register H.265 codec")?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: "video/rtx".to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: format!("apt={H265_PAYLOAD_TYPE}"),
                    rtcp_feedback: Vec::new(),
                },
                payload_type: H265_RTX_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .context("failed to register H.265 RTX codec")
}

fn supported_video_rtcp_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: String::new(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ]
}

fn register_playout_delay(media_engine: &mut MediaEngine) -> Result<()> {
    for codec_type in [RTPCodecType::Audio, RTPCodecType::Video] {
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: PLAYOUT_DELAY_URI.to_owned(),
                },
                codec_type,
                None,
            )
            .with_context(|| format!("failed to register playout-delay extension for {codec_type:?}"))?;
    }
    Ok(())
}

fn build_setting_engine(config: &WebrtcConfig) -> Result<SettingEngine> {
    let mut setting_engine = SettingEngine::default();

    if let Some(ip) = &config.nat_1to1_ip {
        setting_engine.set_nat_1to1_ips(
            vec![ip.clone()],
            webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType::Host,
        );
    }

    if config.udp_mux_port != 0 {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", config.udp_mux_port))
            .with_context(|| format!("failed to bind UDP mux port {}", config.udp_mux_port))?;
        let udp_socket = tokio::net::UdpSocket::from_std(socket)
            .context("failed to hand UDP mux socket to tokio")?;
        let mux = UDPMuxDefault::new(UDPMuxParams::new(udp_socket));
        setting_engine.set_network_types(vec![webrtc::ice::network_type::NetworkType::Udp4]);
        setting_engine.set_udp_network(UDPNetwork::Muxed(Arc::new(mux)));
    } else if config.udp_port_start != 0 && config.udp_port_end != 0 {
        let ephemeral = EphemeralUDP::new(config.udp_port_start, config.udp_port_end)
            .context("invalid ephemeral UDP port range")?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
    }

    setting_engine.set_include_loopback_candidate(true);
    setting_engine.enable_sctp_zero_checksum(true);

    Ok(setting_engine)
}

/// ICE server configuration shared by every peer connection: the configured STUN
/// server, with no TURN server since the mesh design relies on relays themselves
/// being reachable rather than falling back to a TURN relay.
pub fn ice_configuration(config: &WebrtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![format!("stun:{}", config.stun_server)],
            ..Default::default()
        }],
        ..Default::default()
    }
}
