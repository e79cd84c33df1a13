use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};
use crate::signaling_types::{Decoded, SignalingMessage};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};
use tracing::{debug, info, warn};

/// User supplied room token, trimmed and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidRoom);
        }
        Ok(RoomId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub enum Outbound {
    Message(SignalingMessage),
    Close,
}

/// Fire-and-forget handle onto the channel's writer task.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Outbound>,
    closed: Arc<AtomicBool>,
}

impl SignalSender {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        SignalSender {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn send(&self, message: SignalingMessage) {
        if self.is_closed() {
            debug!("Dropping {} message on closed channel", message.kind());
            return;
        }
        if self.tx.send(Outbound::Message(message)).is_err() {
            debug!("Signaling writer already gone");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close);
        }
    }
}

pub struct SignalingChannel {
    room: RoomId,
    sender: SignalSender,
    reader: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn new(room: RoomId, sender: SignalSender, reader: Option<JoinHandle<()>>) -> Self {
        SignalingChannel {
            room,
            sender,
            reader,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn sender(&self) -> SignalSender {
        self.sender.clone()
    }

    pub fn send(&self, message: SignalingMessage) {
        self.sender.send(message);
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Stops delivery and lets the writer flush and close the socket.
    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if !self.sender.is_closed() {
            info!("Closing signaling channel for room {}", self.room);
        }
        self.sender.close();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Opens the room's channel. Every inbound message is delivered to
    /// `events`, in receipt order; channel loss is reported as
    /// `SessionEvent::SignalingClosed`.
    async fn connect(&self, room: &RoomId, events: EventSender) -> Result<SignalingChannel>;
}

/// Hands one decoded frame to the session queue.
pub fn deliver(text: &str, events: &EventSender) {
    match SignalingMessage::decode(text) {
        Ok(Decoded::Message(message)) => {
            events.emit(SessionEvent::Signal(message));
        }
        Ok(Decoded::Unknown(kind)) => {
            warn!("Unknown message type: {:?}", kind);
        }
        Err(e) => {
            warn!("Error parsing signaling message: {}", e);
        }
    }
}

pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        WsConnector {
            base_url: base_url.into(),
        }
    }

    pub fn room_url(&self, room: &RoomId) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("signaling url {}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("signaling url {} has no path", self.base_url)))?
            .pop_if_empty()
            .push(room.as_str());
        Ok(url)
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, room: &RoomId, events: EventSender) -> Result<SignalingChannel> {
        let url = self.room_url(room)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::ConnectionRefused(format!("{}: {}", url, e)))?;
        info!("Signaling channel open: {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let message = match outbound {
                    Outbound::Message(message) => message,
                    Outbound::Close => break,
                };
                let text = match message.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize {} message: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(TungsteniteMessage::Text(text)).await {
                    warn!("Error sending signaling message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(TungsteniteMessage::Text(text)) => deliver(&text, &events),
                    Ok(TungsteniteMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Error receiving signaling message: {}", e);
                        break;
                    }
                }
            }
            events.emit(SessionEvent::SignalingClosed);
        });

        Ok(SignalingChannel::new(
            room.clone(),
            SignalSender::new(tx),
            Some(reader),
        ))
    }
}
