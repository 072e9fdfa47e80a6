use std::sync::Arc;

use webrtc::rtp::extension::playout_delay_extension::PlayoutDelayExtension;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::webrtc_util::Marshal;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

/// Forwards RTP packets from a producer's inbound track to the room's shared local
/// track, stamping every packet with a zero-latency playout-delay hint so viewer
/// players don't build up their own buffering on top of the relay's.
///
/// Runs until the remote track ends (EOF from `read_rtp`, silent) or any other read or
/// write error occurs (logged, except the closed-pipe write error expected during the
/// normal shutdown race when the room's PeerConn is already tearing down).
pub async fn pump_rtp(remote_track: Arc<TrackRemote>, local_track: Arc<TrackLocalStaticRTP>) {
    let extension_uri = crate::webrtc_api::PLAYOUT_DELAY_URI;
    let extension_id = remote_track
        .params()
        .header_extensions
        .iter()
        .find(|ext| ext.uri == extension_uri)
        .map(|ext| ext.id)
        .unwrap_or(0);

    let playout_delay = PlayoutDelayExtension { min_delay: 0, max_delay: 0 };
    let payload = match playout_delay.marshal() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("failed to marshal playout-delay extension: {e}");
            return;
        }
    };

    loop {
        let (mut packet, _attributes) = match remote_track.read_rtp().await {
            Ok(pair) => pair,
            Err(webrtc::Error::ErrDataChannelNotOpen) | Err(webrtc::Error::ErrClosedPipe) => break,
            Err(e) if e.to_string().contains("EOF") => break,
            Err(e) => {
                tracing::warn!(kind = %remote_track.kind(), "RTP read error: {e}");
                break;
            }
        };

        if extension_id != 0
            && let Err(e) = packet.header.set_extension(extension_id, payload.clone().into())
        {
            tracing::debug!("failed to set playout-delay extension: {e}");
        }

        if let Err(e) = local_track.write_rtp(&packet).await {
            if !matches!(e, webrtc::Error::ErrClosedPipe) {
                tracing::warn!(kind = %remote_track.kind(), "RTP write error: {e}");
            }
            break;
        }
    }
}

/// Drains RTCP packets arriving at an ingest receiver (the producer's inbound track)
/// so its sender-side congestion control keeps getting feedback. The contents aren't
/// otherwise consumed.
pub async fn drain_receiver_rtcp(receiver: Arc<RTCRtpReceiver>) {
    let mut rtcp_buf = vec![0u8; 1500];
    while receiver.read(&mut rtcp_buf).await.is_ok() {}
}

/// Drains RTCP packets arriving at a participant's outbound sender (REMB/NACK/PLI from
/// the viewer). Every sender this relay creates needs this loop running or its RTCP
/// buffer backs up and the viewer's feedback is silently dropped.
pub async fn drain_sender_rtcp(sender: Arc<RTCRtpSender>) {
    let mut rtcp_buf = vec![0u8; 1500];
    while sender.read(&mut rtcp_buf).await.is_ok() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playout_delay_extension_marshals_to_three_bytes() {
        let ext = PlayoutDelayExtension { min_delay: 0, max_delay: 0 };
        let payload = ext.marshal().unwrap();
        assert_eq!(payload.len(), 3);
    }
}
