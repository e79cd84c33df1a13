//! EduMeet: one-to-one video rooms with live captions and sign polling,
//! plus the relay that carries their signaling.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod media;
pub mod peer;
pub mod rtc;
pub mod server;
pub mod session;
pub mod sign;
pub mod signaling;
pub mod signaling_types;
pub mod toon;
pub mod transcription;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use events::SessionEvent;
pub use session::{CallSession, CallState, RoomView, Services, UiEvent};
pub use signaling_types::SignalingMessage;
