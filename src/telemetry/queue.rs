//! Bounded, non-blocking queue feeding the durable log sink.
//!
//! Producers never wait: [`TelemetryQueue::enqueue`] is a `try_send` that drops
//! the record when the buffer is full. A single background consumer persists
//! records one at a time, each under its own timeout, so a slow sink fills the
//! buffer and causes drops instead of slowing requests down.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::LogRecord;
use crate::metrics;
use crate::store::LogSink;

/// Configuration for a [`TelemetryQueue`].
#[derive(Debug, Clone)]
pub struct TelemetryQueueConfig {
    /// Fixed buffer capacity
    pub capacity: usize,
    /// Budget for persisting a single record
    pub persist_timeout: Duration,
}

impl Default for TelemetryQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            persist_timeout: Duration::from_millis(500),
        }
    }
}

/// Many-producer, single-consumer pipeline from request handlers to a [`LogSink`].
///
/// Lifecycle: `new` (accepting, nothing persisted yet) → `start` (consumer
/// running) → `stop` (input closed, buffer drained, consumer joined).
/// Calling `enqueue` concurrently with or after `stop` is a caller error; such
/// records are rejected and counted as dropped.
pub struct TelemetryQueue {
    sender: RwLock<Option<mpsc::Sender<LogRecord>>>,
    receiver: Mutex<Option<mpsc::Receiver<LogRecord>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn LogSink>,
    config: TelemetryQueueConfig,
    dropped: AtomicU64,
}

impl TelemetryQueue {
    pub fn new(sink: Arc<dyn LogSink>, config: TelemetryQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            sender: RwLock::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
            sink,
            config,
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a record without blocking.
    ///
    /// Returns `false` if the record was dropped because the buffer is full or
    /// the queue is shutting down. Drops are counted, never logged.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        let sender = self.sender.read();
        let accepted = match sender.as_ref() {
            Some(tx) => match tx.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
            },
            None => false,
        };

        if !accepted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_telemetry_dropped();
        }
        accepted
    }

    /// Launch the background consumer. Only the first call has any effect.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let Some(rx) = self.receiver.lock().take() else {
            warn!("Telemetry queue consumer already started");
            return;
        };

        let handle = tokio::spawn(consume(
            rx,
            Arc::clone(&self.sink),
            self.config.persist_timeout,
        ));
        *self.worker.lock() = Some(handle);

        info!(
            capacity = self.config.capacity,
            persist_timeout_ms = self.config.persist_timeout.as_millis() as u64,
            "Telemetry queue started"
        );
    }

    /// Close the input side and wait until every buffered record has been
    /// handed to the sink and the consumer has exited.
    ///
    /// If `start` was never called, the buffer is drained on the caller's task.
    pub async fn stop(&self) {
        drop(self.sender.write().take());

        let worker = self.worker.lock().take();
        let pending = self.receiver.lock().take();

        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!(error = %e, "Telemetry queue consumer terminated abnormally");
            }
        } else if let Some(rx) = pending {
            consume(rx, Arc::clone(&self.sink), self.config.persist_timeout).await;
        }

        info!(dropped = self.dropped(), "Telemetry queue stopped");
    }

    /// Records rejected because the buffer was full or the queue was closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Records currently buffered.
    pub fn len(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Persist records sequentially until the channel is closed and empty.
///
/// Failures are not retried or re-queued. The first failure after a success is
/// logged at `warn`, subsequent ones only at `debug`.
async fn consume(
    mut rx: mpsc::Receiver<LogRecord>,
    sink: Arc<dyn LogSink>,
    persist_timeout: Duration,
) {
    let mut failing = false;

    while let Some(record) = rx.recv().await {
        let outcome = match tokio::time::timeout(persist_timeout, sink.append(&record)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", persist_timeout)),
        };

        match outcome {
            Ok(()) if failing => {
                failing = false;
                info!("Telemetry sink recovered");
            }
            Ok(()) => {}
            Err(e) if !failing => {
                failing = true;
                warn!(error = %e, "Telemetry sink write failed; records are being dropped");
            }
            Err(e) => debug!(error = %e, "Dropped telemetry record"),
        }
    }

    debug!("Telemetry queue consumer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, Result};
    use crate::telemetry::LogLevel;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingSink {
        records: Mutex<Vec<LogRecord>>,
    }

    #[async_trait]
    impl LogSink for CollectingSink {
        async fn append(&self, record: &LogRecord) -> Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn load_recent(&self, limit: usize) -> Result<Vec<LogRecord>> {
            Ok(self.records.lock().iter().rev().take(limit).cloned().collect())
        }

        fn recent_capacity(&self) -> usize {
            usize::MAX
        }
    }

    #[derive(Default)]
    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LogSink for FailingSink {
        async fn append(&self, _record: &LogRecord) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::BackendUnavailable("sink offline".to_string()))
        }

        async fn load_recent(&self, _limit: usize) -> Result<Vec<LogRecord>> {
            Ok(Vec::new())
        }

        fn recent_capacity(&self) -> usize {
            0
        }
    }

    /// Never completes an append; counts how often it was asked.
    #[derive(Default)]
    struct StallingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl LogSink for StallingSink {
        async fn append(&self, _record: &LogRecord) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn load_recent(&self, _limit: usize) -> Result<Vec<LogRecord>> {
            Ok(Vec::new())
        }

        fn recent_capacity(&self) -> usize {
            0
        }
    }

    fn record(message: &str) -> LogRecord {
        LogRecord::new(chrono::Utc::now(), LogLevel::Info, message)
    }

    fn config(capacity: usize) -> TelemetryQueueConfig {
        TelemetryQueueConfig {
            capacity,
            persist_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let sink = Arc::new(CollectingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(4));

        for i in 0..4 {
            assert!(queue.enqueue(record(&format!("r{}", i))));
        }
        assert_eq!(queue.len(), 4);

        let started = Instant::now();
        let accepted = queue.enqueue(record("overflow"));
        let elapsed = started.elapsed();

        assert!(!accepted);
        assert!(elapsed < Duration::from_millis(1), "enqueue took {:?}", elapsed);
        assert_eq!(queue.dropped(), 1);

        queue.start();
        queue.stop().await;

        let persisted = sink.records.lock();
        assert_eq!(persisted.len(), 4);
        assert!(persisted.iter().all(|r| r.message != "overflow"));
    }

    #[tokio::test]
    async fn test_stop_drains_buffered_records() {
        let sink = Arc::new(CollectingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(64));
        queue.start();

        for i in 0..50 {
            assert!(queue.enqueue(record(&format!("r{}", i))));
        }
        queue.stop().await;

        let persisted = sink.records.lock();
        assert_eq!(persisted.len(), 50);
        assert_eq!(persisted[0].message, "r0");
        assert_eq!(persisted[49].message, "r49");
    }

    #[tokio::test]
    async fn test_stop_without_start_drains_inline() {
        let sink = Arc::new(CollectingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(8));

        queue.enqueue(record("a"));
        queue.enqueue(record("b"));
        queue.stop().await;

        assert_eq!(sink.records.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_after_stop_is_rejected() {
        let sink = Arc::new(CollectingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(8));
        queue.start();
        queue.stop().await;

        assert!(!queue.enqueue(record("late")));
        assert_eq!(queue.dropped(), 1);
        assert!(sink.records.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failures_are_not_retried() {
        let sink = Arc::new(FailingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(8));
        queue.start();

        for i in 0..3 {
            queue.enqueue(record(&format!("r{}", i)));
        }
        queue.stop().await;

        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let sink = Arc::new(CollectingSink::default());
        let queue = TelemetryQueue::new(sink.clone(), config(8));
        queue.start();
        queue.start();

        queue.enqueue(record("once"));
        queue.stop().await;

        assert_eq!(sink.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_sink_is_bounded_by_persist_timeout() {
        let sink = Arc::new(StallingSink::default());
        let queue = TelemetryQueue::new(
            sink.clone(),
            TelemetryQueueConfig {
                capacity: 8,
                persist_timeout: Duration::from_millis(50),
            },
        );
        queue.start();

        for i in 0..4 {
            assert!(queue.enqueue(record(&format!("r{}", i))));
        }

        let started = Instant::now();
        queue.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(150), "stop took {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(queue.dropped(), 0);
    }
}
