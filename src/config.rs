//! Client configuration loaded from a TOML file.

use crate::error::{Error, Result};
use crate::media::AudioSource;
use crate::sign::DEFAULT_POLL_INTERVAL;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Relay base; the room id is appended as one path segment.
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    #[serde(default = "default_backend_url")]
    pub sign_service_url: String,

    /// Milliseconds between sign polls.
    #[serde(default = "default_sign_poll_interval")]
    pub sign_poll_interval: u64,

    #[serde(default = "default_backend_url")]
    pub media_backend_url: String,

    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CaptureConfig {
    /// IVF file (VP8) standing in for the camera.
    pub video_file: Option<PathBuf>,

    #[serde(default)]
    pub audio: AudioSource,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AuthConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,

    #[serde(default = "default_users_table")]
    pub table: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            url: None,
            api_key: None,
            table: default_users_table(),
        }
    }
}

fn default_signaling_url() -> String {
    "ws://localhost:8000/ws".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_sign_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_ice_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_users_table() -> String {
    "users".to_string()
}

fn default_session_file() -> PathBuf {
    PathBuf::from(".edumeet-session.json")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            signaling_url: default_signaling_url(),
            sign_service_url: default_backend_url(),
            sign_poll_interval: default_sign_poll_interval(),
            media_backend_url: default_backend_url(),
            ice_servers: default_ice_servers(),
            capture: CaptureConfig::default(),
            auth: AuthConfig::default(),
            session_file: default_session_file(),
        }
    }
}

impl Config {
    /// Reads `path` when given; a missing explicit file is an error.
    /// Without a path every field takes its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::parse(&content)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.sign_poll_interval)
    }
}
