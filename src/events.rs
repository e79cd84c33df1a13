//! The single inbound event queue of a call session.
//!
//! Every asynchronous source (signaling reader, peer connection callbacks,
//! speech recognizer, sign poller) pushes into the same queue. Each sender is
//! stamped with the tag of the component instance that owns it, so events from
//! a torn-down instance can be recognised and dropped by the orchestrator.

use crate::error::Result;
use crate::peer::RemoteTrack;
use crate::signaling_types::{IceCandidate, SignalingMessage};
use crate::transcription::RecognitionResult;
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum SessionEvent {
    Signal(SignalingMessage),
    SignalingClosed,
    LocalCandidate(IceCandidate),
    RemoteTrack { stream_id: String, track: RemoteTrack },
    Recognition(RecognitionResult),
    SignPolled(Result<String>),
}

#[derive(Debug)]
pub struct Tagged {
    pub tag: u64,
    pub event: SessionEvent,
}

pub type EventReceiver = mpsc::UnboundedReceiver<Tagged>;

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Tagged>,
    tag: u64,
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx, tag: 0 }, rx)
}

impl EventSender {
    /// Same queue, different owner.
    pub fn retag(&self, tag: u64) -> Self {
        EventSender {
            tx: self.tx.clone(),
            tag,
        }
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Returns false once the session has gone away.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(Tagged {
                tag: self.tag,
                event,
            })
            .is_ok()
    }
}
