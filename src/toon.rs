//! Client for the document-to-media generation backend.

use crate::error::{Error, Result};

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};

pub const NO_SUMMARY: &str = "No summary generated yet.";

/// Backend reply. Paths are server-relative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GeneratedMedia {
    #[serde(default)]
    pub summary: String,

    #[serde(rename = "videoPaths", default)]
    pub video_paths: Vec<String>,

    /// Older backends answer with a single video.
    #[serde(rename = "videoPath", default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,

    #[serde(rename = "audioPath", default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
}

/// What the player shows: absolute URLs and a printable summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Playback {
    pub summary: String,
    pub videos: Vec<String>,
    pub audio: Option<String>,
}

impl GeneratedMedia {
    pub fn render(&self, origin: &str) -> Playback {
        let origin = origin.trim_end_matches('/');
        let absolute = |path: &str| format!("{}{}", origin, path);

        let summary = if self.summary.trim().is_empty() {
            NO_SUMMARY.to_string()
        } else {
            self.summary.clone()
        };
        let videos = self
            .video_paths
            .iter()
            .chain(self.video_path.iter())
            .filter(|p| !p.is_empty())
            .map(|p| absolute(p))
            .collect();
        let audio = self
            .audio_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(absolute);

        Playback {
            summary,
            videos,
            audio,
        }
    }
}

pub struct ToonClient {
    client: reqwest::Client,
    origin: String,
}

impl ToonClient {
    pub fn new(origin: &str) -> Self {
        ToonClient {
            client: reqwest::Client::new(),
            origin: origin.trim_end_matches('/').to_string(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub async fn upload(&self, document: &Path, username: &str) -> Result<GeneratedMedia> {
        let bytes = tokio::fs::read(document).await?;
        let file_name = document
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        info!("Uploading {} ({} bytes) as {}", file_name, bytes.len(), username);

        let form = Form::new()
            .part("document", Part::bytes(bytes).file_name(file_name))
            .text("username", username.to_string());

        let response = self
            .client
            .post(format!("{}/upload", self.origin))
            .multipart(form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!("Upload failed: {}", e);
                Error::UploadFailure(e.to_string())
            })?;

        response
            .json::<GeneratedMedia>()
            .await
            .map_err(|e| Error::UploadFailure(e.to_string()))
    }
}
