use super::decode_snapshot;
use super::transport::{Message, Subscription, Transport};
use crate::accumulator::AccumulatorRegistry;
use crate::config::StreamingConfig;
use crate::error::{TransportError, TransportResult};
use crate::graph::WaitForGraph;
use crate::snapshot::{ThreadId, ThreadSnapshot};
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const DEFAULT_TRACKED_THREADS: NonZeroUsize = match NonZeroUsize::new(16_384) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    decoded: AtomicU64,
    rejected: AtomicU64,
    recorded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerCounts {
    pub received: u64,
    pub decoded: u64,
    pub rejected: u64,
    pub recorded: u64,
}

impl ConsumerStats {
    pub fn counts(&self) -> ConsumerCounts {
        ConsumerCounts {
            received: self.received.load(Ordering::Relaxed),
            decoded: self.decoded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
        }
    }
}

/// Member of a consumer group feeding published snapshots into a shared
/// accumulator registry.
///
/// Each snapshot waiting on an owned lock is charged the time since the same
/// thread's previous snapshot seen by this consumer (zero on first sight).
/// Keying by thread id keeps one thread on one partition, so the pairing holds
/// as long as partitions are not reassigned mid-stream.
pub struct SnapshotConsumer {
    transport: Arc<dyn Transport>,
    channel: String,
    group: String,
    poll_timeout: Duration,
    registry: Arc<AccumulatorRegistry>,
    graph: Option<Arc<WaitForGraph>>,
    previous: LruCache<ThreadId, Arc<ThreadSnapshot>>,
    stats: Arc<ConsumerStats>,
}

impl SnapshotConsumer {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &StreamingConfig,
        registry: Arc<AccumulatorRegistry>,
    ) -> Self {
        let tracked = NonZeroUsize::new(config.tracked_threads).unwrap_or(DEFAULT_TRACKED_THREADS);
        Self {
            transport,
            channel: config.channel.clone(),
            group: config.consumer_group.clone(),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.max(1)),
            registry,
            graph: None,
            previous: LruCache::new(tracked),
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Also maintain a wait-for graph from the consumed snapshots
    pub fn with_graph(mut self, graph: Arc<WaitForGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn registry(&self) -> &Arc<AccumulatorRegistry> {
        &self.registry
    }

    /// Apply one delivered record; undecodable payloads are counted and skipped
    pub fn handle_message(&mut self, message: &Message) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let snapshot = match decode_snapshot(&message.payload) {
            Ok(snapshot) => {
                self.stats.decoded.fetch_add(1, Ordering::Relaxed);
                Arc::new(snapshot)
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Skipping undecodable record {}/{}@{}: {}",
                    message.channel,
                    message.partition,
                    message.offset,
                    e
                );
                return;
            }
        };
        self.apply(snapshot);
    }

    fn apply(&mut self, snapshot: Arc<ThreadSnapshot>) {
        let previous = self.previous.put(snapshot.thread_id, Arc::clone(&snapshot));
        let prev = previous.as_deref().unwrap_or(snapshot.as_ref());

        if let Some(lock) = snapshot.waiting_on.as_ref().filter(|lock| lock.is_owned()) {
            self.registry.record_block(lock, prev, &snapshot);
            self.stats.recorded.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(graph) = &self.graph {
            graph.update_waits(previous.as_deref(), &snapshot);
        }
    }

    /// Poll until `shutdown` flips to true or the transport fails fatally.
    ///
    /// Transient errors are logged and the poll is retried. The subscription is
    /// closed, committing consumed offsets, on every exit path.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TransportResult<()> {
        let mut subscription = self.transport.subscribe(&self.channel, &self.group).await?;
        tracing::info!("Consumer joined group {} on {}", self.group, self.channel);

        let outcome = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            let polled = tokio::select! {
                polled = subscription.poll(self.poll_timeout) => polled,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                    continue;
                }
            };
            match polled {
                Ok(messages) => {
                    for message in &messages {
                        self.handle_message(message);
                    }
                }
                Err(e) if e.is_fatal() => break Err(e),
                Err(e) => tracing::warn!("Poll on {} failed, retrying: {}", self.channel, e),
            }
        };

        subscription.close().await;
        let counts = self.stats.counts();
        tracing::info!(
            "Consumer left group {}: {} received, {} recorded, {} rejected",
            self.group,
            counts.received,
            counts.recorded,
            counts.rejected
        );
        outcome
    }

    /// Run on a background task
    pub fn spawn(self) -> ConsumerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let stats = self.stats();
        let task = tokio::spawn(self.run(receiver));
        ConsumerHandle {
            shutdown,
            running: AtomicBool::new(true),
            task: Some(task),
            stats,
        }
    }
}

pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
    task: Option<JoinHandle<TransportResult<()>>>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stats(&self) -> ConsumerCounts {
        self.stats.counts()
    }

    /// Live counters that stay readable after `stop` consumes the handle
    pub fn shared_stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    /// Signal the consumer and wait up to `grace` for it to leave its group
    pub async fn stop(mut self, grace: Duration) -> TransportResult<()> {
        self.running.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        match timeout(grace, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!("Consumer task failed: {}", e);
                Ok(())
            }
            Err(_) => {
                task.abort();
                tracing::warn!("Consumer did not stop within {:?}; aborted", grace);
                Err(TransportError::Timeout)
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContentionPolicy;
    use crate::snapshot::{LockEvent, LockKind, ThreadState};
    use crate::streaming::transport::MemoryTransport;
    use crate::streaming::{encode_snapshot, snapshot_key};

    fn blocked(thread: ThreadId, owner: ThreadId, at: u64) -> ThreadSnapshot {
        ThreadSnapshot::new(thread, format!("t{thread}"), ThreadState::Blocked, at).waiting_on(
            LockEvent::new("L", "Lock", LockKind::Monitor).owned_by(owner, format!("t{owner}")),
        )
    }

    fn message(snapshot: &ThreadSnapshot, offset: u64) -> Message {
        Message {
            channel: "thread-snapshots".to_string(),
            partition: 0,
            offset,
            key: snapshot_key(snapshot),
            payload: encode_snapshot(snapshot).unwrap(),
        }
    }

    fn consumer() -> SnapshotConsumer {
        SnapshotConsumer::new(
            Arc::new(MemoryTransport::new(1)),
            &StreamingConfig::default(),
            Arc::new(AccumulatorRegistry::new(ContentionPolicy::default())),
        )
    }

    #[test]
    fn pairs_with_previous_snapshot_of_same_thread() {
        let mut consumer = consumer();
        for (offset, snapshot) in [blocked(2, 1, 100), blocked(3, 1, 120), blocked(2, 1, 160)]
            .iter()
            .enumerate()
        {
            consumer.handle_message(&message(snapshot, offset as u64));
        }
        let record = consumer.registry().record("L").unwrap();
        // first sightings contribute zero, the second sighting of thread 2 adds 60
        assert_eq!(record.block_count, 3);
        assert_eq!(record.total_blocked_ms, 60);
        assert_eq!(record.unique_waiter_count, 2);
        assert_eq!(consumer.stats().counts().recorded, 3);
    }

    #[test]
    fn unowned_waits_are_not_recorded() {
        let mut consumer = consumer();
        let snapshot = ThreadSnapshot::new(5, "t5", ThreadState::Blocked, 10)
            .waiting_on(LockEvent::new("L", "Lock", LockKind::Monitor));
        consumer.handle_message(&message(&snapshot, 0));
        assert!(consumer.registry().is_empty());
        let counts = consumer.stats().counts();
        assert_eq!((counts.received, counts.decoded, counts.recorded), (1, 1, 0));
    }

    #[test]
    fn garbage_is_rejected_without_state_change() {
        let mut consumer = consumer();
        let mut garbage = message(&blocked(2, 1, 0), 0);
        garbage.payload = b"{oops".to_vec();
        consumer.handle_message(&garbage);
        let counts = consumer.stats().counts();
        assert_eq!(counts.rejected, 1);
        assert!(consumer.registry().is_empty());
    }

    #[test]
    fn graph_tracks_consumed_waits() {
        let graph = Arc::new(WaitForGraph::new());
        let mut consumer = consumer().with_graph(Arc::clone(&graph));
        consumer.handle_message(&message(&blocked(1, 2, 0), 0));
        consumer.handle_message(&message(&blocked(2, 1, 0), 1));
        assert!(graph.has_deadlock());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawned_consumer_drains_and_stops() {
        let transport = MemoryTransport::new(2);
        let registry = Arc::new(AccumulatorRegistry::new(ContentionPolicy::default()));
        let config = StreamingConfig::default();
        let handle =
            SnapshotConsumer::new(Arc::new(transport.clone()), &config, Arc::clone(&registry)).spawn();

        for snapshot in [blocked(2, 1, 0), blocked(2, 1, 40), blocked(2, 1, 90)] {
            transport
                .publish(&config.channel, &snapshot_key(&snapshot), encode_snapshot(&snapshot).unwrap())
                .await
                .unwrap();
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handle.stats().recorded < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.is_running());
        let stats = handle.shared_stats();
        handle.stop(Duration::from_secs(1)).await.unwrap();

        let counts = stats.counts();
        assert_eq!(counts.decoded, 3);
        assert_eq!(counts.recorded, 3);
        assert_eq!(registry.record("L").unwrap().total_blocked_ms, 90);
        assert_eq!(transport.lag(&config.channel, &config.consumer_group), 0);
        assert_eq!(transport.members(&config.channel, &config.consumer_group), 0);
    }

    #[tokio::test]
    async fn closed_transport_ends_the_loop_with_an_error() {
        let transport = MemoryTransport::new(1);
        let registry = Arc::new(AccumulatorRegistry::new(ContentionPolicy::default()));
        let handle =
            SnapshotConsumer::new(Arc::new(transport.clone()), &StreamingConfig::default(), registry).spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.close();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while handle.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = handle.stop(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
