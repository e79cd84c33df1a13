//! Periodic polling of the sign-recognition service.

use crate::error::{Error, Result};
use crate::events::{EventSender, SessionEvent};

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub const NO_SIGN: &str = "No sign detected";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Deserialize)]
struct SignWord {
    word: String,
}

#[async_trait]
pub trait SignSource: Send + Sync {
    /// Most recently recognised gesture; empty when none.
    async fn latest(&self) -> Result<String>;
}

pub struct HttpSignSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSignSource {
    /// A request still unanswered after `timeout` fails as `PollFailure`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("sign service client: {}", e)))?;
        Ok(HttpSignSource {
            client,
            endpoint: format!("{}/sign-word", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SignSource for HttpSignSource {
    async fn latest(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::PollFailure(e.to_string()))?;
        let body: SignWord = response
            .json()
            .await
            .map_err(|e| Error::PollFailure(e.to_string()))?;
        Ok(body.word)
    }
}

/// Text shown for a polled token.
pub fn display_label(word: &str) -> String {
    let word = word.trim();
    if word.is_empty() {
        NO_SIGN.to_string()
    } else {
        word.to_string()
    }
}

pub struct SignPoller {
    source: Arc<dyn SignSource>,
    interval: Duration,
    ticker: Option<JoinHandle<()>>,
    generation: u64,
}

impl SignPoller {
    pub fn new(source: Arc<dyn SignSource>, interval: Duration) -> Self {
        SignPoller {
            source,
            interval,
            ticker: None,
            generation: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    /// One request per tick. Requests are not awaited by the ticker, so a
    /// slow response never delays the next poll.
    pub fn start(&mut self, events: &EventSender) {
        if self.is_active() {
            return;
        }
        self.generation += 1;
        let events = events.retag(self.generation);
        let source = Arc::clone(&self.source);
        let period = self.interval.max(Duration::from_millis(1));

        self.ticker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let source = Arc::clone(&source);
                let events = events.clone();
                tokio::spawn(async move {
                    let result = source.latest().await;
                    events.emit(SessionEvent::SignPolled(result));
                });
            }
        }));
        info!("Sign polling started every {:?}", period);
    }

    /// Cancels the ticker. In-flight requests still resolve, but their
    /// results no longer pass `accepts`.
    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            info!("Sign polling stopped");
        }
    }

    pub fn accepts(&self, tag: u64) -> bool {
        let accepted = self.is_active() && tag == self.generation;
        if !accepted {
            debug!("Discarding sign result from stopped poller");
        }
        accepted
    }
}

impl Drop for SignPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::testing::CannedSigns;

    #[test]
    fn test_empty_word_shows_placeholder() {
        assert_eq!(display_label(""), "No sign detected");
        assert_eq!(display_label("  "), "No sign detected");
        assert_eq!(display_label("hello"), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_once_per_interval() {
        let signs = Arc::new(CannedSigns::new(vec![Ok("a".to_string())]));
        let (sender, mut rx) = events::channel();
        let mut poller = SignPoller::new(signs.clone(), DEFAULT_POLL_INTERVAL);

        poller.start(&sender);
        for _ in 0..3 {
            let tagged = rx.recv().await.unwrap();
            assert!(poller.accepts(tagged.tag));
        }
        poller.stop();
        assert!(signs.calls() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_polling() {
        let signs = Arc::new(CannedSigns::new(vec![
            Err(Error::PollFailure("down".to_string())),
            Ok("b".to_string()),
        ]));
        let (sender, mut rx) = events::channel();
        let mut poller = SignPoller::new(signs, DEFAULT_POLL_INTERVAL);
        poller.start(&sender);

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.event, SessionEvent::SignPolled(Err(_))));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second.event, SessionEvent::SignPolled(Ok(ref w)) if w == "b"));
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let source =
            HttpSignSource::new(&format!("http://{}", addr), Duration::from_millis(200)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), source.latest())
            .await
            .expect("request should give up on its own");
        assert!(matches!(result, Err(Error::PollFailure(_))));
        held.abort();
    }

    #[tokio::test]
    async fn test_results_after_stop_are_rejected() {
        let (sender, _rx) = events::channel();
        let mut poller = SignPoller::new(
            Arc::new(CannedSigns::new(vec![Ok("a".to_string())])),
            DEFAULT_POLL_INTERVAL,
        );
        poller.start(&sender);
        let tag = poller.generation;
        poller.stop();
        assert!(!poller.accepts(tag));

        poller.start(&sender);
        assert!(!poller.accepts(tag));
        assert!(poller.accepts(tag + 1));
    }
}
