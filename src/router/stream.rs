// SPDX-License-Identifier: MIT
//! Streaming controller.
//!
//! Wraps a provider chunk stream in a driver task that forwards chunks
//! unchanged, accumulates the final result, and enforces a chunk watchdog:
//! if no chunk arrives within the budget the stream is aborted. Callers get
//! `abort()`, `is_active()`, `content()`, and `wait()`.

use futures_util::StreamExt as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{GatewayError, Result};
use crate::router::provider::{ChunkStream, StreamChunk};

/// Final accounting for a finished (or aborted) stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub content: String,
    /// Latency to the first chunk; `None` when nothing arrived.
    pub first_chunk_latency: Option<Duration>,
    pub duration: Duration,
    pub chunk_count: u64,
    pub aborted: bool,
    pub error: Option<String>,
}

pub struct StreamController {
    aborted: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
    active: Arc<AtomicBool>,
    content: Arc<StdMutex<String>>,
    chunks_rx: StdMutex<Option<mpsc::Receiver<StreamChunk>>>,
    outcome_rx: StdMutex<Option<oneshot::Receiver<StreamOutcome>>>,
}

impl StreamController {
    /// Spawn the driver task over `stream`.
    pub fn spawn(mut stream: ChunkStream, chunk_timeout: Duration) -> Arc<Self> {
        let (chunk_tx, chunk_rx) = mpsc::channel::<StreamChunk>(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let controller = Arc::new(Self {
            aborted: Arc::new(AtomicBool::new(false)),
            abort_notify: Arc::new(Notify::new()),
            active: Arc::new(AtomicBool::new(true)),
            content: Arc::new(StdMutex::new(String::new())),
            chunks_rx: StdMutex::new(Some(chunk_rx)),
            outcome_rx: StdMutex::new(Some(outcome_rx)),
        });

        let aborted = controller.aborted.clone();
        let abort_notify = controller.abort_notify.clone();
        let active = controller.active.clone();
        let content = controller.content.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut first_chunk_latency = None;
            let mut chunk_count = 0u64;
            let mut was_aborted = false;
            let mut error = None;

            loop {
                tokio::select! {
                    _ = abort_notify.notified() => {
                        was_aborted = true;
                        break;
                    }
                    next = tokio::time::timeout(chunk_timeout, stream.next()) => match next {
                        Err(_) => {
                            was_aborted = true;
                            error = Some(format!(
                                "no chunk within {}ms — stream aborted",
                                chunk_timeout.as_millis()
                            ));
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(e))) => {
                            error = Some(e.to_string());
                            break;
                        }
                        Ok(Some(Ok(chunk))) => {
                            if first_chunk_latency.is_none() {
                                first_chunk_latency = Some(started.elapsed());
                            }
                            chunk_count += 1;
                            content.lock().expect("stream content lock").push_str(&chunk.content);
                            let is_complete = chunk.is_complete;
                            // Forward unchanged; a dropped consumer is fine,
                            // the controller keeps accumulating.
                            let _ = chunk_tx.send(chunk).await;
                            if is_complete {
                                break;
                            }
                        }
                    }
                }
            }

            if was_aborted {
                aborted.store(true, Ordering::SeqCst);
            }
            active.store(false, Ordering::SeqCst);
            let outcome = StreamOutcome {
                content: content.lock().expect("stream content lock").clone(),
                first_chunk_latency,
                duration: started.elapsed(),
                chunk_count,
                aborted: was_aborted,
                error,
            };
            let _ = outcome_tx.send(outcome);
        });

        controller
    }

    /// Cooperatively stop the driver. Safe to call more than once.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.abort_notify.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Content accumulated so far.
    pub fn content(&self) -> String {
        self.content.lock().expect("stream content lock").clone()
    }

    /// Take the forwarded-chunk receiver. First caller wins.
    pub fn take_chunks(&self) -> Option<mpsc::Receiver<StreamChunk>> {
        self.chunks_rx.lock().expect("stream chunks lock").take()
    }

    /// Wait for the driver to finish and return the final accounting.
    /// Errors on a second call.
    pub async fn wait(&self) -> Result<StreamOutcome> {
        let rx = self
            .outcome_rx
            .lock()
            .expect("stream outcome lock")
            .take()
            .ok_or_else(|| GatewayError::internal("stream outcome already consumed"))?;
        rx.await
            .map_err(|_| GatewayError::internal("stream driver dropped without an outcome"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::provider::{ProviderError, ProviderErrorKind};

    fn chunk(content: &str, complete: bool) -> Result<StreamChunk, ProviderError> {
        Ok(StreamChunk {
            content: content.into(),
            is_complete: complete,
            model: None,
            token_count: None,
            metadata: None,
        })
    }

    #[tokio::test]
    async fn accumulates_and_counts_chunks() {
        let stream: ChunkStream = Box::pin(futures_util::stream::iter(vec![
            chunk("hel", false),
            chunk("lo", false),
            chunk("", true),
        ]));
        let ctl = StreamController::spawn(stream, Duration::from_secs(1));
        let outcome = ctl.wait().await.unwrap();
        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.chunk_count, 3);
        assert!(!outcome.aborted);
        assert!(outcome.first_chunk_latency.is_some());
        assert!(!ctl.is_active());
    }

    #[tokio::test]
    async fn forwards_chunks_unchanged() {
        let stream: ChunkStream =
            Box::pin(futures_util::stream::iter(vec![chunk("a", false), chunk("", true)]));
        let ctl = StreamController::spawn(stream, Duration::from_secs(1));
        let mut rx = ctl.take_chunks().unwrap();
        assert_eq!(rx.recv().await.unwrap().content, "a");
        assert!(rx.recv().await.unwrap().is_complete);
        assert!(ctl.take_chunks().is_none());
    }

    #[tokio::test]
    async fn watchdog_aborts_a_stalled_stream() {
        // A stream that never yields.
        let stream: ChunkStream = Box::pin(futures_util::stream::pending());
        let ctl = StreamController::spawn(stream, Duration::from_millis(30));
        let outcome = ctl.wait().await.unwrap();
        assert!(outcome.aborted);
        assert!(outcome.error.unwrap().contains("no chunk"));
        assert_eq!(outcome.chunk_count, 0);
        assert!(outcome.first_chunk_latency.is_none());
    }

    #[tokio::test]
    async fn abort_stops_the_driver() {
        let stream: ChunkStream = Box::pin(futures_util::stream::pending());
        let ctl = StreamController::spawn(stream, Duration::from_secs(60));
        ctl.abort();
        let outcome = ctl.wait().await.unwrap();
        assert!(outcome.aborted);
    }

    #[tokio::test]
    async fn provider_error_ends_the_stream() {
        let stream: ChunkStream = Box::pin(futures_util::stream::iter(vec![
            chunk("partial", false),
            Err(ProviderError::new(ProviderErrorKind::Server, "mid-stream 500")),
        ]));
        let ctl = StreamController::spawn(stream, Duration::from_secs(1));
        let outcome = ctl.wait().await.unwrap();
        assert_eq!(outcome.content, "partial");
        assert!(outcome.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn wait_twice_is_an_error() {
        let stream: ChunkStream = Box::pin(futures_util::stream::iter(vec![chunk("", true)]));
        let ctl = StreamController::spawn(stream, Duration::from_secs(1));
        ctl.wait().await.unwrap();
        assert!(ctl.wait().await.is_err());
    }
}
