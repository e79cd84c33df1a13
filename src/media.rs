use crate::error::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{fs::File, io::BufReader, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::{
    api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8},
    media::{io::ivf_reader::IVFReader, Sample},
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
};

/// One 20 ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const OPUS_FRAME: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Flags shared between a track and the task feeding it.
#[derive(Debug, Clone)]
pub struct TrackGate {
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl TrackGate {
    fn new() -> Self {
        TrackGate {
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

pub struct LocalTrack {
    kind: TrackKind,
    id: String,
    gate: TrackGate,
    rtc: Option<Arc<TrackLocalStaticSample>>,
    pump: Option<JoinHandle<()>>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        LocalTrack {
            kind,
            id: id.into(),
            gate: TrackGate::new(),
            rtc: None,
            pump: None,
        }
    }

    pub fn with_rtc(kind: TrackKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        let mut track = LocalTrack::new(kind, rtc.id());
        track.rtc = Some(rtc);
        track
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gate(&self) -> TrackGate {
        self.gate.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    pub fn is_live(&self) -> bool {
        self.gate.is_live()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.gate.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Returns the new enabled state.
    pub fn toggle(&self) -> bool {
        !self.gate.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn rtc_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.rtc.clone()
    }

    fn attach_pump(&mut self, pump: JoinHandle<()>) {
        self.pump = Some(pump);
    }

    pub fn stop(&mut self) {
        if self.gate.live.swap(false, Ordering::SeqCst) {
            debug!("Stopping {:?} track {}", self.kind, self.id);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Locally captured audio and video, exclusively owned by one room membership.
pub struct LocalMedia {
    audio: LocalTrack,
    video: LocalTrack,
}

impl LocalMedia {
    pub fn new(audio: LocalTrack, video: LocalTrack) -> Self {
        LocalMedia { audio, video }
    }

    pub fn track(&self, kind: TrackKind) -> &LocalTrack {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.audio, &self.video]
    }

    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        self.track(kind).set_enabled(enabled);
    }

    pub fn toggle(&self, kind: TrackKind) -> bool {
        self.track(kind).toggle()
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| t.is_live()).count()
    }

    /// Stops every track. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.active_tracks() > 0 {
            info!("Releasing local capture devices");
        }
        self.audio.stop();
        self.video.stop();
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSource {
    #[default]
    Silence,
    None,
}

/// Camera stand-in reading VP8 frames from an IVF file, looped, with an Opus
/// silence microphone.
pub struct FileCapture {
    video_file: Option<PathBuf>,
    audio: AudioSource,
}

impl FileCapture {
    pub fn new(video_file: Option<PathBuf>, audio: AudioSource) -> Self {
        FileCapture { video_file, audio }
    }
}

#[async_trait]
impl MediaCapture for FileCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        let path = self
            .video_file
            .clone()
            .ok_or_else(|| Error::DeviceUnavailable("no camera configured".to_string()))?;
        probe_ivf(&path)?;
        if self.audio == AudioSource::None {
            return Err(Error::DeviceUnavailable("no microphone configured".to_string()));
        }

        let video_rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "edumeet-local".to_owned(),
        ));
        let audio_rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "edumeet-local".to_owned(),
        ));

        let mut video = LocalTrack::with_rtc(TrackKind::Video, Arc::clone(&video_rtc));
        let mut audio = LocalTrack::with_rtc(TrackKind::Audio, Arc::clone(&audio_rtc));
        video.attach_pump(tokio::spawn(pump_video(path.clone(), video_rtc, video.gate())));
        audio.attach_pump(tokio::spawn(pump_silence(audio_rtc, audio.gate())));

        info!("Acquired camera {} and microphone", path.display());
        Ok(LocalMedia::new(audio, video))
    }
}

fn probe_ivf(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| Error::from_capture_io("camera", e))?;
    IVFReader::new(BufReader::new(file))
        .map_err(|e| Error::DeviceUnavailable(format!("camera {}: {}", path.display(), e)))?;
    Ok(())
}

async fn pump_video(path: PathBuf, track: Arc<TrackLocalStaticSample>, gate: TrackGate) {
    while gate.is_live() {
        if let Err(e) = write_ivf_to_track(&path, &track, &gate).await {
            warn!("Camera file {} stopped: {}", path.display(), e);
            break;
        }
    }
}

/// Milliseconds per frame, at least one. Widened so file-supplied values
/// cannot overflow.
fn frame_interval_ms(numerator: u32, denominator: u32) -> u64 {
    (1000 * u64::from(numerator) / u64::from(denominator)).max(1)
}

async fn write_ivf_to_track(
    path: &Path,
    track: &TrackLocalStaticSample,
    gate: &TrackGate,
) -> anyhow::Result<()> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let (mut ivf, header) = IVFReader::new(reader)?;

    if header.timebase_denominator == 0 {
        anyhow::bail!("invalid IVF timebase");
    }
    let sleep_time = Duration::from_millis(frame_interval_ms(
        header.timebase_numerator,
        header.timebase_denominator,
    ));
    let mut ticker = tokio::time::interval(sleep_time);
    let mut frames = 0usize;

    loop {
        ticker.tick().await;
        if !gate.is_live() {
            return Ok(());
        }
        let frame = match ivf.parse_next_frame() {
            Ok((frame, _)) => frame,
            Err(_) if frames > 0 => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        frames += 1;
        if gate.is_enabled() {
            track
                .write_sample(&Sample {
                    data: frame.freeze(),
                    duration: sleep_time,
                    ..Default::default()
                })
                .await?;
        }
    }
}

async fn pump_silence(track: Arc<TrackLocalStaticSample>, gate: TrackGate) {
    let mut ticker = tokio::time::interval(OPUS_FRAME);
    while gate.is_live() {
        ticker.tick().await;
        if !gate.is_enabled() {
            continue;
        }
        let sample = Sample {
            data: Bytes::from_static(&OPUS_SILENCE),
            duration: OPUS_FRAME,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            warn!("Microphone stopped: {}", e);
            break;
        }
    }
}
