use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const LANGUAGE: &str = "en-US";
pub const NO_SPEECH: &str = "(no speech detected)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecognizedSegment {
    pub transcript: String,
    pub is_final: bool,
}

/// One recognizer callback: the full result list plus the index of the first
/// entry that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub result_index: usize,
    pub results: Vec<RecognizedSegment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Interim,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub origin: Origin,
    pub kind: SegmentKind,
    pub text: String,
}

impl RecognitionResult {
    pub fn single(transcript: impl Into<String>, is_final: bool) -> Self {
        RecognitionResult {
            result_index: 0,
            results: vec![RecognizedSegment {
                transcript: transcript.into(),
                is_final,
            }],
        }
    }

    /// Replaces, never appends to, whatever was shown before.
    pub fn snapshot(&self) -> TranscriptSegment {
        let pending = self.results.get(self.result_index..).unwrap_or_default();
        let text: String = pending.iter().map(|r| r.transcript.as_str()).collect();
        let kind = if !pending.is_empty() && pending.iter().all(|r| r.is_final) {
            SegmentKind::Final
        } else {
            SegmentKind::Interim
        };
        TranscriptSegment {
            origin: Origin::Local,
            kind,
            text,
        }
    }
}

pub struct RecognitionTask {
    handle: Option<JoinHandle<()>>,
}

impl RecognitionTask {
    pub fn new(handle: JoinHandle<()>) -> Self {
        RecognitionTask {
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for RecognitionTask {
    fn drop(&mut self) {
        self.stop();
    }
}

pub trait SpeechRecognizer: Send + Sync {
    /// Starts continuous recognition; every result is pushed to `events`.
    fn start(&self, language: &str, events: EventSender) -> Result<RecognitionTask>;
}

/// Recognizer whose results are pushed in by the host, one
/// `RecognitionResult` per platform callback.
#[derive(Clone)]
pub struct FeedRecognizer {
    tx: broadcast::Sender<RecognitionResult>,
}

impl Default for FeedRecognizer {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        FeedRecognizer { tx }
    }
}

impl FeedRecognizer {
    /// Returns false when no recognition is running.
    pub fn push(&self, result: RecognitionResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

impl SpeechRecognizer for FeedRecognizer {
    fn start(&self, language: &str, events: EventSender) -> Result<RecognitionTask> {
        let mut rx = self.tx.subscribe();
        info!("Speech recognition started ({})", language);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(result) => {
                        if !events.emit(SessionEvent::Recognition(result)) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!("Recognizer dropped {} results", n),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Ok(RecognitionTask::new(handle))
    }
}

pub struct TranscriptionSource {
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    active: Option<RecognitionTask>,
    generation: u64,
    last_forwarded: Option<(String, SegmentKind)>,
}

impl TranscriptionSource {
    pub fn new(recognizer: Option<Arc<dyn SpeechRecognizer>>) -> Self {
        TranscriptionSource {
            recognizer,
            active: None,
            generation: 0,
            last_forwarded: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn start(&mut self, events: &EventSender) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        let recognizer = self
            .recognizer
            .as_ref()
            .ok_or(Error::RecognitionUnavailable)?;
        self.generation += 1;
        let task = recognizer.start(LANGUAGE, events.retag(self.generation))?;
        self.active = Some(task);
        self.last_forwarded = None;
        Ok(())
    }

    /// Already dispatched results are not retracted.
    pub fn stop(&mut self) {
        if let Some(mut task) = self.active.take() {
            task.stop();
            info!("Speech recognition stopped");
        }
    }

    /// Whether a result tagged `tag` came from the running recognizer.
    pub fn accepts(&self, tag: u64) -> bool {
        self.is_active() && tag == self.generation
    }

    /// Coalesces repeats so an unchanged snapshot is not re-sent. A segment
    /// turning final with the same text still counts as a change.
    pub fn should_forward(&mut self, segment: &TranscriptSegment) -> bool {
        let unchanged = matches!(
            &self.last_forwarded,
            Some((text, kind)) if *text == segment.text && *kind == segment.kind
        );
        if unchanged {
            debug!("Skipping unchanged transcript snapshot");
            return false;
        }
        self.last_forwarded = Some((segment.text.clone(), segment.kind));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    fn segment(text: &str, is_final: bool) -> RecognizedSegment {
        RecognizedSegment {
            transcript: text.to_string(),
            is_final,
        }
    }

    #[test]
    fn test_snapshot_concatenates_from_result_index() {
        let result = RecognitionResult {
            result_index: 1,
            results: vec![
                segment("already final. ", true),
                segment("hello ", false),
                segment("world", false),
            ],
        };
        let snapshot = result.snapshot();
        assert_eq!(snapshot.text, "hello world");
        assert_eq!(snapshot.kind, SegmentKind::Interim);
        assert_eq!(snapshot.origin, Origin::Local);
    }

    #[test]
    fn test_snapshot_final_when_all_pending_final() {
        let snapshot = RecognitionResult::single("done", true).snapshot();
        assert_eq!(snapshot.kind, SegmentKind::Final);
    }

    #[test]
    fn test_snapshot_out_of_range_index_is_empty() {
        let result = RecognitionResult {
            result_index: 5,
            results: vec![segment("x", true)],
        };
        let snapshot = result.snapshot();
        assert_eq!(snapshot.text, "");
        assert_eq!(snapshot.kind, SegmentKind::Interim);
    }

    #[test]
    fn test_unavailable_recognizer() {
        let (sender, _rx) = events::channel();
        let mut source = TranscriptionSource::new(None);
        assert!(!source.is_available());
        assert!(matches!(
            source.start(&sender),
            Err(Error::RecognitionUnavailable)
        ));
        assert!(!source.is_active());
    }

    #[tokio::test]
    async fn test_feed_results_reach_queue_until_stopped() {
        let (sender, mut rx) = events::channel();
        let recognizer = FeedRecognizer::default();
        let mut source = TranscriptionSource::new(Some(Arc::new(recognizer.clone())));

        source.start(&sender).unwrap();
        assert!(recognizer.push(RecognitionResult::single("hi", false)));

        let tagged = rx.recv().await.unwrap();
        assert!(source.accepts(tagged.tag));
        assert!(matches!(tagged.event, SessionEvent::Recognition(_)));

        source.stop();
        assert!(!source.accepts(tagged.tag));
    }

    #[tokio::test]
    async fn test_restart_rejects_previous_generation() {
        let (sender, _rx) = events::channel();
        let mut source = TranscriptionSource::new(Some(Arc::new(FeedRecognizer::default())));
        source.start(&sender).unwrap();
        let first = source.generation;
        source.stop();
        source.start(&sender).unwrap();
        assert!(!source.accepts(first));
        assert!(source.accepts(first + 1));
    }

    #[test]
    fn test_repeated_snapshot_not_forwarded() {
        let mut source = TranscriptionSource::new(None);
        let interim = RecognitionResult::single("hello", false).snapshot();
        assert!(source.should_forward(&interim));
        assert!(!source.should_forward(&interim));
        assert!(source.should_forward(&RecognitionResult::single("hello there", false).snapshot()));
    }

    #[test]
    fn test_same_text_turning_final_is_forwarded() {
        let mut source = TranscriptionSource::new(None);
        let interim = RecognitionResult::single("hello", false).snapshot();
        let last = RecognitionResult::single("hello", true).snapshot();
        assert!(source.should_forward(&interim));
        assert!(source.should_forward(&last));
        assert!(!source.should_forward(&last));
    }
}
