//! Token sources: where assistant replies come from.
//!
//! A [`TokenSource`] writes fragments into a [`FragmentSink`]. [`open_stream`]
//! runs the source on its own task and hands the consumer a
//! [`FragmentStream`] that yields fragments in delivery order, then either ends
//! (normal completion) or yields one error (failure).

pub mod mock;
pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::{GenerationSettings, Message, ModelInfo};

pub use mock::MockTokenSource;
pub use ollama::OllamaTokenSource;

const FRAGMENT_BUFFER: usize = 64;

/// Everything a token source needs for one assistant reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    /// Prior history, oldest first. Never includes the reply being generated.
    pub history: Vec<Message>,
    pub settings: GenerationSettings,
}

impl TurnRequest {
    pub fn last_user_message(&self) -> Option<&Message> {
        self.history
            .iter()
            .rev()
            .find(|m| m.role == crate::models::MessageRole::User)
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Streams one reply into `sink`. Returns `Ok` when the reply is complete or
    /// the sink was cancelled, `Err` when generation failed.
    async fn produce(&self, request: TurnRequest, sink: FragmentSink) -> Result<(), AppError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError>;

    async fn check_connection(&self) -> bool;
}

/// Producer half handed to [`TokenSource::produce`].
pub struct FragmentSink {
    tx: mpsc::Sender<Result<String, AppError>>,
    cancel: CancellationToken,
}

impl FragmentSink {
    /// Delivers one fragment. Empty fragments are dropped. Returns `false` once
    /// the consumer has gone away or cancelled; the producer should stop.
    pub async fn send(&self, fragment: impl Into<String>) -> bool {
        let fragment = fragment.into();
        if self.cancel.is_cancelled() {
            return false;
        }
        if fragment.is_empty() {
            return true;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(fragment)) => sent.is_ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the consumer closes the stream.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Consumer half of one reply. Not restartable.
pub struct FragmentStream {
    rx: mpsc::Receiver<Result<String, AppError>>,
    cancel: CancellationToken,
    producer: Option<JoinHandle<()>>,
    finished: bool,
}

impl FragmentStream {
    /// Next fragment; `None` on normal completion, `Some(Err)` exactly once on failure.
    pub async fn next(&mut self) -> Option<Result<String, AppError>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(fragment)) => Some(Ok(fragment)),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                let producer = self.producer.take()?;
                match producer.await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Token source task failed: {e}");
                        Some(Err(AppError::inference(format!("token source task failed: {e}"))))
                    }
                }
            }
        }
    }

    /// Stops the producer and waits for its task to exit.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            if let Err(e) = producer.await {
                error!("Token source task failed during shutdown: {e}");
            }
        }
        debug!("Fragment stream closed");
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

/// Starts `source` on a background task and returns the consumer half.
pub fn open_stream(source: Arc<dyn TokenSource>, request: TurnRequest) -> FragmentStream {
    let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
    let cancel = CancellationToken::new();
    let sink = FragmentSink { tx: tx.clone(), cancel: cancel.clone() };

    let producer = tokio::spawn(async move {
        if let Err(e) = source.produce(request, sink).await {
            error!("Token source failed: {e}");
            let _ = tx.send(Err(e)).await;
        }
    });

    FragmentStream { rx, cancel, producer: Some(producer), finished: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> TurnRequest {
        TurnRequest {
            history: vec![Message::user("hello")],
            settings: GenerationSettings::default(),
        }
    }

    #[tokio::test]
    async fn delivers_fragments_in_order_then_ends() {
        let source = Arc::new(MockTokenSource::scripted(["a", "", "b", "c"]));
        let mut stream = open_stream(source, request());

        let mut received = Vec::new();
        while let Some(item) = stream.next().await {
            received.push(item.unwrap());
        }
        assert_eq!(received, vec!["a", "b", "c"]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_is_distinct_from_completion() {
        let source = Arc::new(MockTokenSource::scripted(["a", "b", "c"]).failing_after(2));
        let mut stream = open_stream(source, request());

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        let failure = stream.next().await.unwrap();
        assert!(failure.unwrap_err().is_transport());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn close_stops_a_stalled_producer() {
        let source = Arc::new(MockTokenSource::scripted(["a", "b"]).stalling_after(1));
        let mut stream = open_stream(source.clone(), request());

        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(source.active_producers(), 1);

        tokio::time::timeout(Duration::from_secs(2), stream.close())
            .await
            .expect("close should join the producer");
        assert_eq!(source.active_producers(), 0);
    }
}
