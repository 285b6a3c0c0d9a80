use crate::accumulator::AccumulatorRegistry;
use crate::analysis::ContentionAnalyzer;
use crate::capture::SnapshotCapture;
use crate::config::Config;
use crate::graph::{Deadlock, WaitForGraph};
use crate::history::{HistoryStore, LockHistory, ThreadHistory};
use crate::record::{
    ContentionPolicy, ContentionRecord, ContentionSummary, LockContentionReport, ProfilingWindow,
};
use crate::snapshot::{ThreadId, ThreadSnapshot};
use crate::source::SnapshotSource;
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, sleep, timeout_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Everything the engine knows about the observed process
pub struct ContentionState {
    store: Arc<HistoryStore>,
    registry: Arc<AccumulatorRegistry>,
    graph: Arc<WaitForGraph>,
    analyzer: ContentionAnalyzer,
    retention_cycles: u64,
    samples: AtomicU64,
    ingested: AtomicU64,
    first_sample_ms: AtomicU64,
    last_sample_ms: AtomicU64,
}

impl ContentionState {
    pub fn new(config: &Config) -> Self {
        Self {
            store: Arc::new(HistoryStore::new(config.retention.clone())),
            registry: Arc::new(AccumulatorRegistry::new(ContentionPolicy::from(
                &config.analysis,
            ))),
            graph: Arc::new(WaitForGraph::new()),
            analyzer: ContentionAnalyzer::new(&config.analysis),
            retention_cycles: config.retention.retention_cycles,
            samples: AtomicU64::new(0),
            ingested: AtomicU64::new(0),
            first_sample_ms: AtomicU64::new(u64::MAX),
            last_sample_ms: AtomicU64::new(0),
        }
    }

    /// File one snapshot and update the accumulators and wait-for graph.
    ///
    /// The interval since the thread's previous snapshot is charged to the
    /// lock that previous snapshot was blocked on.
    pub fn ingest(&self, snapshot: Arc<ThreadSnapshot>) {
        let previous = self.store.append_snapshot(Arc::clone(&snapshot));
        if let Some(prev) = previous.as_deref() {
            if let (true, Some(lock)) = (prev.is_blocked(), prev.waiting_on.as_ref()) {
                self.registry.record_block(lock, prev, &snapshot);
            }
        }
        self.graph.update_waits(previous.as_deref(), &snapshot);

        self.first_sample_ms
            .fetch_min(snapshot.timestamp_ms, Ordering::Relaxed);
        self.last_sample_ms
            .fetch_max(snapshot.timestamp_ms, Ordering::Relaxed);
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ingest_batch(&self, batch: impl IntoIterator<Item = Arc<ThreadSnapshot>>) {
        for snapshot in batch {
            self.ingest(snapshot);
        }
    }

    /// Start a sampling cycle for retention bookkeeping
    pub fn begin_cycle(&self) -> u64 {
        self.samples.fetch_add(1, Ordering::Relaxed);
        self.registry.begin_cycle();
        self.store.begin_cycle()
    }

    /// Drop identities unseen for the configured number of cycles
    pub fn evict_stale(&self) {
        let evicted_threads = self.store.evict_stale(self.retention_cycles);
        let evicted_locks = self.registry.evict_stale(self.retention_cycles);
        if !evicted_threads.is_empty() {
            self.graph.remove_threads(evicted_threads.iter().copied());
        }
        if !evicted_threads.is_empty() || evicted_locks > 0 {
            tracing::info!(
                "Retention evicted {} threads and {} lock accumulators",
                evicted_threads.len(),
                evicted_locks
            );
        }
    }

    /// Span between the earliest and latest ingested sample
    pub fn observed_window(&self) -> ProfilingWindow {
        let first = self.first_sample_ms.load(Ordering::Relaxed);
        let last = self.last_sample_ms.load(Ordering::Relaxed);
        if first == u64::MAX {
            ProfilingWindow::new(0, 0)
        } else {
            ProfilingWindow::new(first, last)
        }
    }
}

/// Counters describing engine throughput
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub samples: u64,
    pub ingested: u64,
    pub dropped: u64,
    pub pending: usize,
    pub threads: usize,
    pub locks: usize,
    pub accumulators: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
}

/// One reporting pass over live state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineReport {
    pub session_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub window: ProfilingWindow,
    pub stats: EngineStats,
    pub top_contention: Vec<LockContentionReport>,
    pub convoys: Vec<String>,
    pub hot_locks: Vec<ContentionRecord>,
    pub deadlocks: Vec<Deadlock>,
    pub blocking_chains: Vec<Vec<ThreadId>>,
    pub summary: ContentionSummary,
}

/// Main engine that coordinates sampling, ingestion and reporting
pub struct LockscopeEngine {
    session_id: Uuid,
    config: Config,
    capture: Arc<SnapshotCapture>,
    state: Arc<ContentionState>,
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    sampler: Mutex<Option<JoinHandle<()>>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl LockscopeEngine {
    pub fn new(config: Config) -> Self {
        let capture = Arc::new(SnapshotCapture::new(config.engine.buffer_size));
        let state = Arc::new(ContentionState::new(&config));
        let (shutdown, _) = watch::channel(false);
        Self {
            session_id: Uuid::new_v4(),
            config,
            capture,
            state,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            sampler: Mutex::new(None),
            processor: Mutex::new(None),
        }
    }

    /// Start sampling `source` on the configured interval
    pub async fn start(&self, source: Arc<dyn SnapshotSource>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(false);
        tracing::info!(
            "Starting engine session {} with source {} every {}ms",
            self.session_id,
            source.name(),
            self.config.engine.sample_interval_ms
        );

        let sampler = task::spawn(Self::run_sampler(
            source,
            Arc::clone(&self.capture),
            Arc::clone(&self.state),
            Duration::from_millis(self.config.engine.sample_interval_ms.max(1)),
            self.shutdown.subscribe(),
        ));
        let processor = task::spawn(Self::process_snapshots(
            Arc::clone(&self.capture),
            Arc::clone(&self.state),
            self.config.engine.batch_size.max(1),
            Duration::from_millis(self.config.engine.flush_interval_ms),
            self.shutdown.subscribe(),
        ));

        *self.sampler.lock() = Some(sampler);
        *self.processor.lock() = Some(processor);
        Ok(())
    }

    /// Stop cooperatively; tasks still running after the grace period are aborted
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.send_replace(true);

        let deadline = Instant::now() + Duration::from_millis(self.config.engine.stop_grace_ms);
        let handles: Vec<JoinHandle<()>> = [self.sampler.lock().take(), self.processor.lock().take()]
            .into_iter()
            .flatten()
            .collect();
        for mut handle in handles {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Engine task failed: {}", e),
                Err(_) => {
                    tracing::warn!("Engine task did not stop within the grace period; aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }

        self.flush();
        tracing::info!("Engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait until the source is exhausted, then ingest everything queued.
    ///
    /// The processor is stopped before the final flush so a thread's
    /// snapshots are never ingested by two tasks at once.
    pub async fn wait_for_source(&self) {
        let sampler = self.sampler.lock().take();
        if let Some(handle) = sampler {
            if let Err(e) = handle.await {
                tracing::warn!("Sampler task failed: {}", e);
            }
        }

        self.shutdown.send_replace(true);
        let processor = self.processor.lock().take();
        if let Some(handle) = processor {
            if let Err(e) = handle.await {
                tracing::warn!("Processor task failed: {}", e);
            }
        }
        self.flush();
    }

    /// Ingest every queued snapshot on the calling thread.
    ///
    /// Only call this while the processing task is not running.
    fn flush(&self) {
        let batch = self.capture.drain();
        if !batch.is_empty() {
            tracing::debug!("Flushing {} queued snapshots", batch.len());
            self.state.ingest_batch(batch);
        }
    }

    async fn run_sampler(
        source: Arc<dyn SnapshotSource>,
        capture: Arc<SnapshotCapture>,
        state: Arc<ContentionState>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let cycle = state.begin_cycle();
            match source.sample().await {
                Ok(Some(batch)) => {
                    let total = batch.len();
                    let mut dropped = 0usize;
                    for snapshot in batch {
                        if capture.capture(Arc::new(snapshot)).is_err() {
                            dropped += 1;
                        }
                    }
                    if dropped > 0 {
                        tracing::warn!(
                            "Capture queue full: dropped {} of {} snapshots in cycle {}",
                            dropped,
                            total,
                            cycle
                        );
                    } else {
                        tracing::debug!("Cycle {} captured {} snapshots", cycle, total);
                    }
                }
                Ok(None) => {
                    tracing::info!("Source {} exhausted after {} cycles", source.name(), cycle - 1);
                    break;
                }
                Err(e) => tracing::warn!("Sampling {} failed: {}", source.name(), e),
            }

            state.evict_stale();
        }
    }

    async fn process_snapshots(
        capture: Arc<SnapshotCapture>,
        state: Arc<ContentionState>,
        batch_size: usize,
        flush_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = capture.drain_batch(batch_size);
            if !batch.is_empty() {
                state.ingest_batch(batch);
                task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = sleep(flush_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    // Ingestion ---------------------------------------------------------------

    pub fn ingest(&self, snapshot: ThreadSnapshot) {
        self.state.ingest(Arc::new(snapshot));
    }

    pub fn ingest_batch(&self, batch: impl IntoIterator<Item = ThreadSnapshot>) {
        self.state.ingest_batch(batch.into_iter().map(Arc::new));
    }

    pub fn capture(&self) -> Arc<SnapshotCapture> {
        Arc::clone(&self.capture)
    }

    pub fn state(&self) -> Arc<ContentionState> {
        Arc::clone(&self.state)
    }

    /// Shared accumulator map, also fed by streaming consumers
    pub fn registry(&self) -> Arc<AccumulatorRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn graph(&self) -> Arc<WaitForGraph> {
        Arc::clone(&self.state.graph)
    }

    pub fn store(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.state.store)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    // Reporting ---------------------------------------------------------------

    pub fn thread_histories(&self) -> HashMap<ThreadId, ThreadHistory> {
        self.state.store.thread_histories()
    }

    pub fn lock_histories(&self) -> HashMap<String, LockHistory> {
        self.state.store.lock_histories()
    }

    /// Live accumulator records, hottest first
    pub fn contention_records(&self) -> Vec<ContentionRecord> {
        self.state.registry.records()
    }

    pub fn analyze_lock_contention(&self) -> Vec<ContentionRecord> {
        self.state
            .analyzer
            .analyze_lock_contention(&self.thread_histories())
    }

    pub fn analyze_hot_locks(&self, observation_window_ms: u64) -> Vec<ContentionRecord> {
        self.state
            .analyzer
            .analyze_hot_locks(&self.lock_histories(), observation_window_ms)
    }

    pub fn generate_contention_records(
        &self,
        batch: &[ThreadSnapshot],
        top_k: usize,
    ) -> Vec<ContentionRecord> {
        self.state.analyzer.generate_contention_records(batch, top_k)
    }

    pub fn aggregate_statistics(&self) -> ContentionSummary {
        self.state
            .analyzer
            .aggregate_statistics(&self.thread_histories(), &self.lock_histories())
    }

    pub fn detect_cycles(&self) -> Vec<Vec<ThreadId>> {
        self.state.graph.detect_cycles()
    }

    pub fn has_deadlock(&self) -> bool {
        self.state.graph.has_deadlock()
    }

    pub fn deadlocks(&self) -> Vec<Deadlock> {
        self.state.graph.deadlocks()
    }

    pub fn dead_blocks(&self) -> Vec<Vec<ThreadId>> {
        self.state.analyzer.detect_dead_blocks(&self.state.graph)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            samples: self.state.samples.load(Ordering::Relaxed),
            ingested: self.state.ingested.load(Ordering::Relaxed),
            dropped: self.capture.dropped(),
            pending: self.capture.pending(),
            threads: self.state.store.thread_count(),
            locks: self.state.store.lock_count(),
            accumulators: self.state.registry.len(),
            graph_nodes: self.state.graph.node_count(),
            graph_edges: self.state.graph.edge_count(),
        }
    }

    /// Build a report over `window`, or over everything observed so far
    pub fn report(&self, window: Option<ProfilingWindow>) -> EngineReport {
        let window = window.unwrap_or_else(|| self.state.observed_window());
        let analysis = &self.config.analysis;

        let records = self.contention_records();
        let convoys = records
            .iter()
            .filter(|record| record.convoy)
            .map(|record| record.lock_id.clone())
            .collect();
        let top_contention = records
            .into_iter()
            .take(if analysis.top_k == 0 { usize::MAX } else { analysis.top_k })
            .map(|record| LockContentionReport::from_record(record, window))
            .collect();

        let hot_window = if window.duration_ms() > 0 {
            window.duration_ms()
        } else {
            analysis.observation_window_ms
        };

        EngineReport {
            session_id: self.session_id,
            generated_at: Utc::now(),
            window,
            stats: self.stats(),
            top_contention,
            convoys,
            hot_locks: self.analyze_hot_locks(hot_window),
            deadlocks: self.deadlocks(),
            blocking_chains: self.dead_blocks(),
            summary: self.aggregate_statistics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{LockEvent, LockKind, ThreadState};
    use crate::source::{ReplaySource, SyntheticSource, DEADLOCK_THREADS, HOT_LOCK_ID};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.engine.sample_interval_ms = 5;
        config.engine.flush_interval_ms = 1;
        config.engine.stop_grace_ms = 1_000;
        config
    }

    #[test]
    fn ingest_closes_blocked_interval_on_next_sample() {
        let engine = LockscopeEngine::new(Config::default());
        let lock = LockEvent::new("l", "L", LockKind::Monitor).owned_by(2, "t2");
        engine.ingest(ThreadSnapshot::new(1, "t1", ThreadState::Runnable, 0));
        engine.ingest(ThreadSnapshot::new(1, "t1", ThreadState::Blocked, 50).waiting_on(lock));
        assert!(engine.contention_records().is_empty());
        assert_eq!(engine.graph().wait_time(1, 2), Some(50));

        engine.ingest(ThreadSnapshot::new(1, "t1", ThreadState::Runnable, 120));
        let records = engine.contention_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].total_blocked_ms, 70);
        assert_eq!(records[0].block_count, 1);
        assert_eq!(engine.graph().edge_count(), 0);
        assert_eq!(engine.analyze_lock_contention(), records);
    }

    #[test]
    fn report_includes_convoy_and_deadlock() {
        let engine = LockscopeEngine::new(Config::default());
        let source = SyntheticSource::new(6, 100).with_deadlock(true);
        for tick in 0..20 {
            engine.ingest_batch(source.batch_at(tick));
        }

        let report = engine.report(None);
        assert_eq!(report.window, ProfilingWindow::new(0, 1_900));
        assert_eq!(report.top_contention[0].record.lock_id, HOT_LOCK_ID);
        assert!(report.convoys.contains(&HOT_LOCK_ID.to_string()));
        assert_eq!(report.deadlocks.len(), 1);
        assert_eq!(report.deadlocks[0].threads, DEADLOCK_THREADS.to_vec());
        assert!(!report.hot_locks.is_empty());
        assert_eq!(report.summary.total_threads, 8);
        assert_eq!(report.stats.ingested, 160);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_engine_start_stop() {
        let engine = LockscopeEngine::new(fast_config());
        let source = Arc::new(SyntheticSource::new(4, 10));
        assert!(engine.start(source).await.is_ok());
        assert!(engine.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        engine.stop().await;
        assert!(!engine.is_running());

        let stats = engine.stats();
        assert!(stats.samples > 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.threads, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn replayed_capture_is_fully_ingested() {
        let engine = LockscopeEngine::new(fast_config());
        let synthetic = SyntheticSource::new(5, 100);
        let batches: Vec<Vec<ThreadSnapshot>> = (0..6).map(|tick| synthetic.batch_at(tick)).collect();
        let direct = LockscopeEngine::new(Config::default());
        for batch in &batches {
            direct.ingest_batch(batch.clone());
        }
        let source = Arc::new(ReplaySource::new("recorded", batches));

        engine.start(source).await.unwrap();
        engine.wait_for_source().await;
        engine.stop().await;

        assert_eq!(engine.stats().ingested, 30);
        assert_eq!(engine.stats().samples, 7);
        let records = engine.contention_records();
        assert!(records[0].total_blocked_ms > 0);
        assert_eq!(records, direct.contention_records());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wait_for_source_keeps_per_thread_order() {
        let mut config = fast_config();
        config.engine.batch_size = 1;
        config.engine.buffer_size = 10_000;
        let engine = LockscopeEngine::new(config);

        let lock = LockEvent::new("l", "L", LockKind::Monitor).owned_by(2, "t2");
        let batch: Vec<ThreadSnapshot> = (0..5_000u64)
            .map(|i| {
                ThreadSnapshot::new(1, "t1", ThreadState::Blocked, i * 10).waiting_on(lock.clone())
            })
            .collect();
        let source = Arc::new(ReplaySource::new("single-thread", vec![batch]));

        engine.start(source).await.unwrap();
        engine.wait_for_source().await;
        engine.stop().await;

        let record = engine.registry().record("l").unwrap();
        assert_eq!(engine.stats().ingested, 5_000);
        assert_eq!(record.block_count, 4_999);
        assert_eq!(record.total_blocked_ms, 49_990);
        assert_eq!(engine.graph().wait_time(1, 2), Some(49_991));
    }

    #[tokio::test]
    async fn stale_threads_leave_the_graph() {
        let mut config = Config::default();
        config.retention.retention_cycles = 1;
        let engine = LockscopeEngine::new(config);
        let state = engine.state();

        state.begin_cycle();
        engine.ingest(
            ThreadSnapshot::new(1, "t1", ThreadState::Blocked, 0)
                .waiting_on(LockEvent::new("l", "L", LockKind::Monitor).owned_by(2, "t2")),
        );
        state.begin_cycle();
        state.begin_cycle();
        state.evict_stale();

        assert!(engine.thread_histories().is_empty());
        assert!(!engine.graph().contains_thread(1));
    }
}
