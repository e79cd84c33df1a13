//! Call session orchestrator.
//!
//! Composes signaling, capture, the peer session, transcription and sign
//! polling into one joinable room membership. All component callbacks arrive
//! on a single event queue and are handled one at a time, so the state below
//! is only ever touched from `&mut self`.

use crate::error::{Error, Result};
use crate::events::{self, EventReceiver, EventSender, SessionEvent, Tagged};
use crate::media::{LocalMedia, MediaCapture, TrackKind};
use crate::peer::{PeerConnector, PeerSession, RemoteStream};
use crate::sign::{self, SignPoller, SignSource};
use crate::signaling::{RoomId, SignalingChannel, SignalingConnector};
use crate::signaling_types::SignalingMessage;
use crate::transcription::{
    Origin, RecognitionResult, SegmentKind, SpeechRecognizer, TranscriptSegment,
    TranscriptionSource, NO_SPEECH,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Joining,
    Connected,
    OnCall,
    Ended,
}

pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
    use CallState::*;
    matches!(
        (from, to),
        (Idle, Joining)
            | (Ended, Joining)
            | (Joining, Connected)
            | (Joining, Idle)
            | (Connected, OnCall)
            | (Connected, Ended)
            | (OnCall, Ended)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub origin: Origin,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StateChanged(CallState),
    ChatAppended(ChatEntry),
    TranscriptChanged(TranscriptSegment),
    SignLabelChanged(String),
    RemoteStreamChanged(Option<RemoteStream>),
}

/// What the meeting screen shows. The chat log is append-only; the other
/// panels are replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomView {
    pub chat: Vec<ChatEntry>,
    pub transcript: Option<TranscriptSegment>,
    pub sign_label: Option<String>,
    pub remote_stream: Option<RemoteStream>,
}

/// Factories for the per-join components.
pub struct Services {
    pub signaling: Arc<dyn SignalingConnector>,
    pub capture: Arc<dyn MediaCapture>,
    pub peers: Arc<dyn PeerConnector>,
    pub recognizer: Option<Arc<dyn SpeechRecognizer>>,
    pub signs: Arc<dyn SignSource>,
    pub sign_interval: Duration,
}

struct Membership {
    channel: SignalingChannel,
    media: LocalMedia,
    peer: PeerSession,
}

pub struct CallSession {
    services: Services,
    state: CallState,
    room: Option<RoomId>,
    membership: Option<Membership>,
    epoch: u64,
    transcription: TranscriptionSource,
    poller: SignPoller,
    view: RoomView,
    events: EventSender,
    updates: broadcast::Sender<UiEvent>,
}

impl CallSession {
    /// Returns the session and the receiving end of its event queue; feed
    /// every received event back through `handle_event`.
    pub fn new(services: Services) -> (Self, EventReceiver) {
        let (events, inbox) = events::channel();
        let (updates, _) = broadcast::channel(256);
        let transcription = TranscriptionSource::new(services.recognizer.clone());
        let poller = SignPoller::new(Arc::clone(&services.signs), services.sign_interval);
        let session = CallSession {
            services,
            state: CallState::Idle,
            room: None,
            membership: None,
            epoch: 0,
            transcription,
            poller,
            view: RoomView::default(),
            events,
            updates,
        };
        (session, inbox)
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn view(&self) -> &RoomView {
        &self.view
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.updates.subscribe()
    }

    pub fn has_peer_session(&self) -> bool {
        self.membership.is_some()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.membership.as_ref().map(|m| &m.media)
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcription.is_active()
    }

    pub fn is_polling_signs(&self) -> bool {
        self.poller.is_active()
    }

    fn publish(&self, event: UiEvent) {
        let _ = self.updates.send(event);
    }

    fn transition(&mut self, to: CallState) -> Result<()> {
        if !is_valid_transition(self.state, to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!("Call state {:?} -> {:?}", self.state, to);
        self.state = to;
        self.publish(UiEvent::StateChanged(to));
        Ok(())
    }

    /// Opens the room's signaling channel, captures local media and prepares
    /// a peer session. Any failure leaves the session back in `Idle` with
    /// nothing retained.
    pub async fn join(&mut self, room: &str) -> Result<()> {
        let room = RoomId::parse(room)?;
        if let Some(current) = &self.room {
            if matches!(self.state, CallState::Connected | CallState::OnCall) {
                return Err(Error::AlreadyJoined(current.to_string()));
            }
        }
        self.transition(CallState::Joining)?;
        self.view = RoomView::default();

        self.epoch += 1;
        let events = self.events.retag(self.epoch);

        let mut channel = match self.services.signaling.connect(&room, events.clone()).await {
            Ok(channel) => channel,
            Err(e) => return Err(self.abort_join(e)),
        };

        let mut media = match self.services.capture.acquire().await {
            Ok(media) => media,
            Err(e) => {
                channel.close();
                return Err(self.abort_join(e));
            }
        };

        let conn = match self.services.peers.connect(&media, events).await {
            Ok(conn) => conn,
            Err(e) => {
                media.release();
                channel.close();
                return Err(self.abort_join(e));
            }
        };

        let peer = PeerSession::new(conn, channel.sender());
        self.membership = Some(Membership {
            channel,
            media,
            peer,
        });
        self.room = Some(room);
        self.set_remote_stream(None);
        self.transition(CallState::Connected)
    }

    fn abort_join(&mut self, err: Error) -> Error {
        warn!("Join failed: {}", err);
        self.room = None;
        if let Err(e) = self.transition(CallState::Idle) {
            warn!("{}", e);
        }
        err
    }

    /// Sends an offer to whoever else is in the room.
    pub async fn start_call(&mut self) -> Result<()> {
        if self.state != CallState::Connected {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: CallState::OnCall,
            });
        }
        let membership = self.membership.as_mut().ok_or(Error::ChannelClosed)?;
        match membership.peer.initiate().await {
            Ok(()) => self.transition(CallState::OnCall),
            Err(e) => {
                error!("Could not start call: {}", e);
                Ok(())
            }
        }
    }

    /// Tears down the peer session, capture devices and channel, and stops
    /// transcription and sign polling. Safe to call in any state, any number
    /// of times.
    pub async fn end_call(&mut self) {
        self.transcription.stop();
        self.poller.stop();

        let Some(mut membership) = self.membership.take() else {
            return;
        };
        membership.peer.close().await;
        membership.media.release();
        membership.channel.close();
        self.set_remote_stream(None);

        if matches!(self.state, CallState::Connected | CallState::OnCall) {
            if let Err(e) = self.transition(CallState::Ended) {
                warn!("{}", e);
            }
        }
    }

    pub fn send_chat(&mut self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let membership = self.membership.as_ref().ok_or(Error::ChannelClosed)?;
        membership.channel.send(SignalingMessage::Chat {
            message: text.to_string(),
        });
        self.append_chat(Origin::Local, text.to_string());
        Ok(())
    }

    /// Returns whether the microphone is now enabled.
    pub fn toggle_mute(&mut self) -> Result<bool> {
        self.toggle_track(TrackKind::Audio)
    }

    /// Returns whether the camera is now enabled.
    pub fn toggle_camera(&mut self) -> Result<bool> {
        self.toggle_track(TrackKind::Video)
    }

    fn toggle_track(&mut self, kind: TrackKind) -> Result<bool> {
        let media = self.local_media().ok_or(Error::NoLocalMedia)?;
        let enabled = media.toggle(kind);
        info!("{:?} track {}", kind, if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Returns whether transcription is running. An unavailable recognizer
    /// only disables the feature.
    pub fn start_transcription(&mut self) -> bool {
        match self.transcription.start(&self.events) {
            Ok(()) => true,
            Err(e) => {
                warn!("Transcription disabled: {}", e);
                false
            }
        }
    }

    pub fn stop_transcription(&mut self) {
        self.transcription.stop();
    }

    /// Flips transcription, returning whether it is now running.
    pub fn toggle_transcription(&mut self) -> bool {
        if self.transcription.is_active() {
            self.stop_transcription();
            false
        } else {
            self.start_transcription()
        }
    }

    pub fn start_sign_polling(&mut self) {
        self.poller.start(&self.events);
    }

    pub fn stop_sign_polling(&mut self) {
        self.poller.stop();
    }

    /// Handles every event already waiting in `inbox` without blocking.
    pub async fn pump(&mut self, inbox: &mut EventReceiver) -> usize {
        let mut handled = 0;
        while let Ok(tagged) = inbox.try_recv() {
            self.handle_event(tagged).await;
            handled += 1;
        }
        handled
    }

    pub async fn handle_event(&mut self, tagged: Tagged) {
        let Tagged { tag, event } = tagged;
        match event {
            SessionEvent::Recognition(result) => {
                if self.transcription.accepts(tag) {
                    self.on_recognition(result);
                } else {
                    debug!("Discarding result from stopped recognizer");
                }
            }
            SessionEvent::SignPolled(result) => {
                if self.poller.accepts(tag) {
                    self.on_sign(result);
                }
            }
            event => {
                if tag != self.epoch || self.membership.is_none() {
                    debug!("Discarding event from a previous membership: {:?}", event);
                    return;
                }
                self.on_membership_event(event).await;
            }
        }
    }

    async fn on_membership_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Signal(message) => self.on_signal(message).await,
            SessionEvent::SignalingClosed => {
                warn!("Signaling channel closed by remote");
                self.end_call().await;
            }
            SessionEvent::LocalCandidate(candidate) => {
                if let Some(membership) = &self.membership {
                    membership.peer.emit_local_candidate(candidate);
                }
            }
            SessionEvent::RemoteTrack { stream_id, track } => {
                let Some(membership) = self.membership.as_mut() else {
                    return;
                };
                let replaced = membership.peer.add_remote_track(&stream_id, track);
                let stream = membership.peer.remote_stream().cloned();
                if replaced {
                    self.set_remote_stream(stream);
                } else {
                    self.view.remote_stream = stream;
                }
            }
            SessionEvent::Recognition(_) | SessionEvent::SignPolled(_) => {}
        }
    }

    async fn on_signal(&mut self, message: SignalingMessage) {
        let Some(membership) = self.membership.as_mut() else {
            return;
        };
        match message {
            SignalingMessage::Offer { offer } => match membership.peer.handle_offer(offer).await {
                Ok(()) => {
                    if self.state == CallState::Connected {
                        if let Err(e) = self.transition(CallState::OnCall) {
                            warn!("{}", e);
                        }
                    }
                }
                Err(e) => error!("Error handling offer: {}", e),
            },
            SignalingMessage::Answer { answer } => {
                if let Err(e) = membership.peer.handle_answer(answer).await {
                    error!("Error handling answer: {}", e);
                }
            }
            SignalingMessage::Ice { candidate } => {
                membership.peer.handle_remote_candidate(candidate).await;
            }
            SignalingMessage::Chat { message } => self.append_chat(Origin::Remote, message),
            SignalingMessage::Transcript { text, is_final } => {
                self.set_transcript(TranscriptSegment {
                    origin: Origin::Remote,
                    kind: if is_final {
                        SegmentKind::Final
                    } else {
                        SegmentKind::Interim
                    },
                    text,
                });
            }
        }
    }

    fn on_recognition(&mut self, result: RecognitionResult) {
        let snapshot = result.snapshot();
        if let Some(membership) = &self.membership {
            if self.transcription.should_forward(&snapshot) {
                membership.channel.send(SignalingMessage::Transcript {
                    text: snapshot.text.clone(),
                    is_final: snapshot.kind == SegmentKind::Final,
                });
            }
        }
        let shown = if snapshot.text.is_empty() {
            TranscriptSegment {
                text: NO_SPEECH.to_string(),
                ..snapshot
            }
        } else {
            snapshot
        };
        self.set_transcript(shown);
    }

    fn on_sign(&mut self, result: Result<String>) {
        match result {
            Ok(word) => {
                let label = sign::display_label(&word);
                self.view.sign_label = Some(label.clone());
                self.publish(UiEvent::SignLabelChanged(label));
            }
            Err(e) => warn!("Error fetching sign: {}", e),
        }
    }

    fn append_chat(&mut self, origin: Origin, text: String) {
        let entry = ChatEntry { origin, text };
        self.view.chat.push(entry.clone());
        self.publish(UiEvent::ChatAppended(entry));
    }

    fn set_transcript(&mut self, segment: TranscriptSegment) {
        self.view.transcript = Some(segment.clone());
        self.publish(UiEvent::TranscriptChanged(segment));
    }

    fn set_remote_stream(&mut self, stream: Option<RemoteStream>) {
        if self.view.remote_stream == stream {
            return;
        }
        self.view.remote_stream = stream.clone();
        self.publish(UiEvent::RemoteStreamChanged(stream));
    }
}
