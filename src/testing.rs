//! In-process fakes for the session's collaborators.

use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::media::{LocalMedia, LocalTrack, MediaCapture, TrackGate, TrackKind};
use crate::peer::{PeerConnection, PeerConnector, RemoteTrack};
use crate::sign::SignSource;
use crate::signaling::{Outbound, RoomId, SignalSender, SignalingChannel, SignalingConnector};
use crate::signaling_types::{IceCandidate, SessionDescription, SignalingMessage};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct FakePeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    offers: usize,
    closes: usize,
}

/// Rejects candidates until a remote description is set, like a browser.
#[derive(Clone, Default)]
pub struct FakePeerConnection {
    state: Arc<Mutex<FakePeerState>>,
}

impl FakePeerConnection {
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock().unwrap();
        state.offers += 1;
        Ok(SessionDescription::offer(format!("local-offer-{}", state.offers)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.state.lock().unwrap().remote.is_none() {
            return Err(Error::negotiation("no remote offer"));
        }
        Ok(SessionDescription::answer("local-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().unwrap().local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.state.lock().unwrap().remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(Error::negotiation("remote description not set"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakePeerConnector {
    created: Arc<Mutex<Vec<(FakePeerConnection, EventSender)>>>,
}

impl FakePeerConnector {
    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> FakePeerConnection {
        self.created.lock().unwrap().last().unwrap().0.clone()
    }

    /// Plays the media engine reporting a freshly gathered candidate.
    pub fn gather(&self, candidate: &str) {
        let created = self.created.lock().unwrap();
        let (_, events) = created.last().unwrap();
        events.emit(SessionEvent::LocalCandidate(IceCandidate {
            candidate: candidate.to_string(),
            ..Default::default()
        }));
    }

    pub fn remote_track(&self, stream_id: &str, track_id: &str, kind: TrackKind) {
        let created = self.created.lock().unwrap();
        let (_, events) = created.last().unwrap();
        events.emit(SessionEvent::RemoteTrack {
            stream_id: stream_id.to_string(),
            track: RemoteTrack {
                track_id: track_id.to_string(),
                kind,
            },
        });
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(
        &self,
        _media: &LocalMedia,
        events: EventSender,
    ) -> Result<Box<dyn PeerConnection>> {
        let conn = FakePeerConnection::default();
        self.created.lock().unwrap().push((conn.clone(), events));
        Ok(Box::new(conn))
    }
}

struct Link {
    events: EventSender,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Signaling connector whose far end is the test itself.
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    links: Arc<Mutex<Vec<Link>>>,
    refuse: Arc<Mutex<bool>>,
}

impl LoopbackConnector {
    pub fn refuse(&self, refuse: bool) {
        *self.refuse.lock().unwrap() = refuse;
    }

    pub fn connections(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Delivers `message` as if the remote peer had sent it.
    pub fn inject(&self, message: SignalingMessage) {
        let index = self.connections() - 1;
        self.inject_into(index, message);
    }

    /// Delivers on the `index`th channel ever opened, closed or not.
    pub fn inject_into(&self, index: usize, message: SignalingMessage) {
        let links = self.links.lock().unwrap();
        links[index].events.emit(SessionEvent::Signal(message));
    }

    pub fn drop_connection(&self) {
        let links = self.links.lock().unwrap();
        links.last().unwrap().events.emit(SessionEvent::SignalingClosed);
    }

    /// Messages written to the latest channel since the last call.
    pub fn sent(&self) -> Vec<SignalingMessage> {
        let mut links = self.links.lock().unwrap();
        let link = links.last_mut().unwrap();
        let mut out = Vec::new();
        while let Ok(outbound) = link.outbound.try_recv() {
            if let Outbound::Message(message) = outbound {
                out.push(message);
            }
        }
        out
    }

    pub fn closed(&self) -> bool {
        let mut links = self.links.lock().unwrap();
        let link = links.last_mut().unwrap();
        loop {
            match link.outbound.try_recv() {
                Ok(Outbound::Close) => return true,
                Ok(Outbound::Message(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}

#[async_trait]
impl SignalingConnector for LoopbackConnector {
    async fn connect(&self, room: &RoomId, events: EventSender) -> Result<SignalingChannel> {
        if *self.refuse.lock().unwrap() {
            return Err(Error::ConnectionRefused(format!("room {}", room)));
        }
        let (tx, outbound) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(Link { events, outbound });
        Ok(SignalingChannel::new(room.clone(), SignalSender::new(tx), None))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Grant,
    Deny,
    Missing,
}

#[derive(Clone)]
pub struct ScriptedCapture {
    mode: Arc<Mutex<CaptureMode>>,
    gates: Arc<Mutex<Vec<TrackGate>>>,
}

impl ScriptedCapture {
    pub fn new(mode: CaptureMode) -> Self {
        ScriptedCapture {
            mode: Arc::new(Mutex::new(mode)),
            gates: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_mode(&self, mode: CaptureMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Tracks handed out so far that have not been stopped.
    pub fn live_tracks(&self) -> usize {
        self.gates
            .lock()
            .unwrap()
            .iter()
            .filter(|g| g.is_live())
            .count()
    }
}

#[async_trait]
impl MediaCapture for ScriptedCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        match *self.mode.lock().unwrap() {
            CaptureMode::Deny => {
                return Err(Error::PermissionDenied("camera: denied by user".to_string()))
            }
            CaptureMode::Missing => {
                return Err(Error::DeviceUnavailable("camera: not found".to_string()))
            }
            CaptureMode::Grant => {}
        }
        let audio = LocalTrack::new(TrackKind::Audio, "mic");
        let video = LocalTrack::new(TrackKind::Video, "cam");
        self.gates
            .lock()
            .unwrap()
            .extend([audio.gate(), video.gate()]);
        Ok(LocalMedia::new(audio, video))
    }
}

/// Serves queued responses in order, repeating the last one.
pub struct CannedSigns {
    responses: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: AtomicUsize,
}

impl CannedSigns {
    pub fn new(responses: Vec<Result<String>>) -> Self {
        CannedSigns {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| r.map_err(|e| e.to_string()))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignSource for CannedSigns {
    async fn latest(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        let response = if responses.len() > 1 {
            responses.pop_front()
        } else {
            responses.front().cloned()
        };
        match response {
            Some(Ok(word)) => Ok(word),
            Some(Err(e)) => Err(Error::PollFailure(e)),
            None => Ok(String::new()),
        }
    }
}
