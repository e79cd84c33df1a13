use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::media::{LocalMedia, TrackKind};
use crate::peer::{PeerConnection, PeerConnector, RemoteTrack};
use crate::signaling_types::{IceCandidate, SdpKind, SessionDescription};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::{rtp_receiver::RTCRtpReceiver, RTCRtpTransceiver};
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::{interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    track::track_local::TrackLocal,
};

pub struct RtcPeerConnector {
    ice_servers: Vec<String>,
}

impl RtcPeerConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        RtcPeerConnector { ice_servers }
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        media: &LocalMedia,
        events: EventSender,
    ) -> Result<Box<dyn PeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_default_codecs().map_err(Error::negotiation)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m).map_err(Error::negotiation)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(Error::negotiation)?,
        );

        for track in media.tracks() {
            let Some(rtc_track) = track.rtc_track() else {
                continue;
            };
            let rtp_sender = peer_connection
                .add_track(rtc_track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(Error::negotiation)?;

            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
            });
        }

        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                info!("Peer connection state has changed: {s}");
                Box::pin(async {})
            },
        ));

        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = ice_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("Local candidate gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(SessionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                events.emit(SessionEvent::RemoteTrack {
                    stream_id: track.stream_id().to_string(),
                    track: RemoteTrack {
                        track_id: track.id().to_string(),
                        kind,
                    },
                });

                tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                Box::pin(async {})
            },
        ));

        Ok(Box::new(RtcPeerConnection { pc: peer_connection }))
    }
}

pub struct RtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    rtc.map_err(Error::negotiation)
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(Error::negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(Error::negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let candidate = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(Error::negotiation)
    }

    async fn close(&self) -> Result<()> {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.stop().await {
                debug!("Error stopping sender: {}", e);
            }
        }
        self.pc.close().await.map_err(Error::negotiation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    #[test]
    fn test_description_kind_maps_to_rtc() {
        let offer = to_rtc(SessionDescription::offer(MINIMAL_SDP)).unwrap();
        assert_eq!(offer.sdp, MINIMAL_SDP);
        assert_eq!(
            offer.sdp_type,
            webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Offer
        );

        let answer = to_rtc(SessionDescription::answer(MINIMAL_SDP)).unwrap();
        assert_eq!(
            answer.sdp_type,
            webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Answer
        );
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let connector = RtcPeerConnector::new(vec![]);
        let media = LocalMedia::new(
            crate::media::LocalTrack::new(TrackKind::Audio, "a"),
            crate::media::LocalTrack::new(TrackKind::Video, "v"),
        );
        let (events, _rx) = crate::events::channel();
        let conn = connector.connect(&media, events).await.unwrap();

        let result = conn
            .add_ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            })
            .await;
        assert!(matches!(result, Err(Error::NegotiationFailure(_))));

        conn.close().await.unwrap();
    }
}
