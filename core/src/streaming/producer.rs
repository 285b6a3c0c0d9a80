use super::transport::Transport;
use super::{encode_snapshot, snapshot_key};
use crate::config::StreamingConfig;
use crate::error::{TransportError, TransportResult};
use crate::snapshot::{ThreadId, ThreadSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Invoked with the thread id of every snapshot that could not be published
pub type ErrorCallback = Arc<dyn Fn(ThreadId, &TransportError) + Send + Sync>;

#[derive(Debug, Default)]
pub struct ProducerStats {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProducerCounts {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl ProducerStats {
    pub fn counts(&self) -> ProducerCounts {
        ProducerCounts {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Publishes snapshots asynchronously, keyed by thread id so that one
/// thread's snapshots stay in order on a single partition.
///
/// `send` never blocks the sampler: snapshots go through a bounded queue to a
/// background publisher task.
pub struct SnapshotProducer {
    channel: String,
    transport: Arc<dyn Transport>,
    sender: Mutex<Option<mpsc::Sender<Arc<ThreadSnapshot>>>>,
    publisher: Mutex<Option<JoinHandle<()>>>,
    on_error: ErrorCallback,
    stats: Arc<ProducerStats>,
}

impl SnapshotProducer {
    pub fn new(transport: Arc<dyn Transport>, config: &StreamingConfig) -> Self {
        let on_error: ErrorCallback = Arc::new(|thread_id: ThreadId, error: &TransportError| {
            tracing::warn!("Failed to publish snapshot of thread {}: {}", thread_id, error);
        });
        Self::with_error_callback(transport, config, on_error)
    }

    pub fn with_error_callback(
        transport: Arc<dyn Transport>,
        config: &StreamingConfig,
        on_error: ErrorCallback,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.producer_queue.max(1));
        let stats = Arc::new(ProducerStats::default());
        let publisher = tokio::spawn(Self::run_publisher(
            Arc::clone(&transport),
            config.channel.clone(),
            receiver,
            Arc::clone(&on_error),
            Arc::clone(&stats),
        ));
        tracing::info!(
            "Snapshot producer publishing to {} (queue {})",
            config.channel,
            config.producer_queue
        );

        Self {
            channel: config.channel.clone(),
            transport,
            sender: Mutex::new(Some(sender)),
            publisher: Mutex::new(Some(publisher)),
            on_error,
            stats,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stats(&self) -> ProducerCounts {
        self.stats.counts()
    }

    /// Queue a snapshot for publication without waiting
    pub fn send(&self, snapshot: Arc<ThreadSnapshot>) -> TransportResult<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        match sender.try_send(snapshot) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(snapshot)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let error = TransportError::QueueFull;
                (self.on_error)(snapshot.thread_id, &error);
                Err(error)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    /// Queue a whole sample; returns how many snapshots were accepted
    pub fn send_batch(&self, batch: impl IntoIterator<Item = Arc<ThreadSnapshot>>) -> usize {
        batch
            .into_iter()
            .map(|snapshot| self.send(snapshot))
            .filter(Result::is_ok)
            .count()
    }

    /// Stop accepting snapshots, publish what is queued and flush the
    /// transport, all within `grace`.
    pub async fn close(&self, grace: Duration) -> TransportResult<()> {
        drop(self.sender.lock().take());
        let publisher = self.publisher.lock().take();
        let Some(mut publisher) = publisher else {
            return Ok(());
        };

        let started = tokio::time::Instant::now();
        match timeout(grace, &mut publisher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Snapshot publisher task failed: {}", e),
            Err(_) => {
                publisher.abort();
                tracing::warn!("Snapshot publisher did not drain within {:?}", grace);
                return Err(TransportError::Timeout);
            }
        }

        let remaining = grace.saturating_sub(started.elapsed());
        self.transport.flush(remaining).await?;
        let counts = self.stats.counts();
        tracing::info!(
            "Snapshot producer closed: {} sent, {} failed, {} dropped",
            counts.sent,
            counts.failed,
            counts.dropped
        );
        Ok(())
    }

    async fn run_publisher(
        transport: Arc<dyn Transport>,
        channel: String,
        mut receiver: mpsc::Receiver<Arc<ThreadSnapshot>>,
        on_error: ErrorCallback,
        stats: Arc<ProducerStats>,
    ) {
        while let Some(snapshot) = receiver.recv().await {
            let published = match encode_snapshot(&snapshot) {
                Ok(payload) => {
                    transport
                        .publish(&channel, &snapshot_key(&snapshot), payload)
                        .await
                }
                Err(e) => Err(e),
            };
            match published {
                Ok(()) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    on_error(snapshot.thread_id, &e);
                }
            }
        }
    }
}

impl Drop for SnapshotProducer {
    fn drop(&mut self) {
        if let Some(publisher) = self.publisher.get_mut().take() {
            publisher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ThreadState;
    use crate::streaming::decode_snapshot;
    use crate::streaming::transport::{MemoryTransport, Subscription};

    fn config(queue: usize) -> StreamingConfig {
        StreamingConfig {
            enabled: true,
            producer_queue: queue,
            ..StreamingConfig::default()
        }
    }

    fn snapshot(thread: ThreadId, at: u64) -> Arc<ThreadSnapshot> {
        Arc::new(ThreadSnapshot::new(thread, "worker", ThreadState::Runnable, at))
    }

    #[tokio::test]
    async fn close_delivers_everything_queued() {
        let transport = MemoryTransport::new(2);
        let producer = SnapshotProducer::new(Arc::new(transport.clone()), &config(64));
        for at in 0..10 {
            producer.send(snapshot(at % 3, at)).unwrap();
        }
        producer.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(producer.stats().sent, 10);

        let mut subscription = transport.subscribe("thread-snapshots", "g").await.unwrap();
        let messages = subscription.poll(Duration::from_millis(50)).await.unwrap();
        assert_eq!(messages.len(), 10);
        let first = decode_snapshot(&messages[0].payload).unwrap();
        assert_eq!(messages[0].key, first.thread_id.to_string());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let producer = SnapshotProducer::new(Arc::new(MemoryTransport::new(1)), &config(8));
        producer.close(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(producer.send(snapshot(1, 0)), Err(TransportError::Closed)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_queue_reports_through_callback() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let producer = SnapshotProducer::with_error_callback(
            Arc::new(MemoryTransport::new(1)),
            &config(2),
            Arc::new(move |thread: ThreadId, error: &TransportError| {
                assert!(matches!(error, TransportError::QueueFull));
                sink.lock().push(thread);
            }),
        );

        // The publisher cannot run until this task yields, so the queue fills.
        producer.send(snapshot(1, 0)).unwrap();
        producer.send(snapshot(2, 0)).unwrap();
        assert!(matches!(producer.send(snapshot(3, 0)), Err(TransportError::QueueFull)));
        assert_eq!(*reported.lock(), vec![3]);
        assert_eq!(producer.stats().dropped, 1);

        producer.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(producer.stats().sent, 2);
    }

    #[tokio::test]
    async fn publish_failures_are_counted() {
        let transport = MemoryTransport::strict(1);
        let producer = SnapshotProducer::new(Arc::new(transport), &config(8));
        producer.send(snapshot(7, 0)).unwrap();
        producer.close(Duration::from_secs(1)).await.unwrap();
        assert_eq!(producer.stats().failed, 1);
        assert_eq!(producer.stats().sent, 0);
    }
}
