use crate::session::CallState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("signaling connection refused: {0}")]
    ConnectionRefused(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("speech recognition unavailable")]
    RecognitionUnavailable,

    #[error("sign poll failed: {0}")]
    PollFailure(String),

    /// Rendered to the user verbatim.
    #[error("{0}")]
    AuthFailure(String),

    #[error("room identifier must not be empty")]
    InvalidRoom,

    #[error("already joined room {0}")]
    AlreadyJoined(String),

    #[error("invalid call state transition from {from:?} to {to:?}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("no local media tracks")]
    NoLocalMedia,

    #[error("upload failed: {0}")]
    UploadFailure(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a failed device open onto the capture taxonomy.
    pub fn from_capture_io(device: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("{}: {}", device, err))
            }
            _ => Error::DeviceUnavailable(format!("{}: {}", device, err)),
        }
    }

    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        Error::NegotiationFailure(err.to_string())
    }
}
