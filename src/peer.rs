//! Offer/answer and trickle-ICE protocol over the signaling side channel.
//!
//! `PeerSession` owns the negotiation rules; the media engine behind it is any
//! `PeerConnection` (webrtc-rs in production, see `rtc`).

use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::media::{LocalMedia, TrackKind};
use crate::signaling::SignalSender;
use crate::signaling_types::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub kind: TrackKind,
}

/// The peer's media stream. Its tracks are announced one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn track(&self, kind: TrackKind) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Stops every outbound sender, then tears the connection down.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Builds a connection carrying `media`. Newly gathered local candidates
    /// and incoming remote tracks are reported on `events`.
    async fn connect(
        &self,
        media: &LocalMedia,
        events: EventSender,
    ) -> Result<Box<dyn PeerConnection>>;
}

pub struct PeerSession {
    conn: Box<dyn PeerConnection>,
    signal: SignalSender,
    remote_stream: Option<RemoteStream>,
    closed: bool,
}

impl PeerSession {
    pub fn new(conn: Box<dyn PeerConnection>, signal: SignalSender) -> Self {
        PeerSession {
            conn,
            signal,
            remote_stream: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::negotiation("peer session is closed"));
        }
        Ok(())
    }

    pub async fn initiate(&mut self) -> Result<()> {
        self.ensure_open()?;
        let offer = self.conn.create_offer().await?;
        self.conn.set_local_description(offer.clone()).await?;
        info!("Sending offer");
        self.signal.send(SignalingMessage::Offer { offer });
        Ok(())
    }

    pub async fn handle_offer(&mut self, offer: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if offer.kind != SdpKind::Offer {
            return Err(Error::negotiation("offer message carried an answer"));
        }
        self.conn.set_remote_description(offer).await?;
        let answer = self.conn.create_answer().await?;
        self.conn.set_local_description(answer.clone()).await?;
        info!("Sending answer");
        self.signal.send(SignalingMessage::Answer { answer });
        Ok(())
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if answer.kind != SdpKind::Answer {
            return Err(Error::negotiation("answer message carried an offer"));
        }
        self.conn.set_remote_description(answer).await
    }

    /// A rejected candidate is logged and otherwise ignored.
    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) -> bool {
        if self.closed {
            return false;
        }
        match self.conn.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Error adding ICE candidate: {}", e);
                false
            }
        }
    }

    /// Trickle: every local candidate goes out as soon as it is known.
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        if self.closed {
            return;
        }
        debug!("Sending local candidate {}", candidate.candidate);
        self.signal.send(SignalingMessage::Ice { candidate });
    }

    /// Attaches an incoming track. A track of another stream replaces the
    /// active stream; returns true in that case (or for the first stream).
    pub fn add_remote_track(&mut self, stream_id: &str, track: RemoteTrack) -> bool {
        match self.remote_stream.as_mut() {
            Some(stream) if stream.stream_id == stream_id => {
                if !stream.tracks.iter().any(|t| t.track_id == track.track_id) {
                    stream.tracks.push(track);
                }
                false
            }
            _ => {
                info!("Remote stream {} attached", stream_id);
                self.remote_stream = Some(RemoteStream {
                    stream_id: stream_id.to_string(),
                    tracks: vec![track],
                });
                true
            }
        }
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.remote_stream = None;
        if let Err(e) = self.conn.close().await {
            warn!("Error closing peer connection: {}", e);
        }
    }
}
