use crate::accumulator::{BlockObservation, LockContentionAccumulator};
use crate::config::AnalysisConfig;
use crate::graph::{wait_edge, WaitForGraph};
use crate::history::{LockHistory, ThreadHistory};
use crate::record::{
    BlockedThreadStats, ContentionPolicy, ContentionRecord, ContentionSummary, LockBlockedTime,
};
use crate::snapshot::{LockEvent, StackKey, ThreadId, ThreadSnapshot};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

/// Stateless ranking and aggregation over histories and snapshot batches.
///
/// Every call builds fresh accumulators and returns freshly constructed
/// values, so an analyzer can be shared across tasks without locking.
#[derive(Debug, Clone)]
pub struct ContentionAnalyzer {
    policy: ContentionPolicy,
    summary_top_n: usize,
}

impl ContentionAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            policy: ContentionPolicy::from(config),
            summary_top_n: config.summary_top_n,
        }
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    fn accumulator_for<'a>(
        &self,
        accumulators: &'a mut HashMap<String, LockContentionAccumulator>,
        lock: &LockEvent,
    ) -> &'a mut LockContentionAccumulator {
        accumulators
            .entry(lock.lock_id.clone())
            .or_insert_with(|| LockContentionAccumulator::for_event(lock, self.policy))
    }

    /// Feed every (blocked, next) snapshot pair into its lock's accumulator,
    /// hottest lock first
    pub fn analyze_lock_contention(
        &self,
        thread_histories: &HashMap<ThreadId, ThreadHistory>,
    ) -> Vec<ContentionRecord> {
        let mut accumulators = HashMap::new();
        for history in thread_histories.values() {
            for (prev, curr) in history.pairs() {
                if !prev.is_blocked() {
                    continue;
                }
                if let Some(lock) = &prev.waiting_on {
                    self.accumulator_for(&mut accumulators, lock)
                        .record_block(lock, prev, curr);
                }
            }
        }

        let mut records: Vec<ContentionRecord> =
            accumulators.values().map(|acc| acc.to_record()).collect();
        rank_records(&mut records);
        records
    }

    /// Lock-level view: every contended event is charged the time until the
    /// lock's next event. Only locks with positive blocked time are reported.
    pub fn analyze_hot_locks(
        &self,
        lock_histories: &HashMap<String, LockHistory>,
        observation_window_ms: u64,
    ) -> Vec<ContentionRecord> {
        let mut records = Vec::new();
        for history in lock_histories.values() {
            let mut accumulator = LockContentionAccumulator::with_policy(
                history.lock_id.clone(),
                history.lock_name.clone(),
                history.kind,
                self.policy,
            );
            for (prev, curr) in history.pairs().filter(|(prev, _)| prev.contended) {
                accumulator.observe(BlockObservation {
                    waiter: prev
                        .waiter_thread_id
                        .map(|id| (id, prev.waiter_thread_name.as_deref().unwrap_or(""))),
                    owner: prev
                        .owner()
                        .map(|id| (id, prev.owner_thread_name.as_deref())),
                    delta_ms: curr.timestamp_ms.saturating_sub(prev.timestamp_ms),
                    at_ms: curr.timestamp_ms,
                    stack: StackKey::from_frames(&prev.stack),
                });
            }
            if accumulator.total_blocked_ms() > 0 {
                records.push(
                    accumulator
                        .to_record()
                        .with_hot_stats(observation_window_ms, self.policy.hot_stack_limit),
                );
            }
        }
        rank_records(&mut records);
        records
    }

    /// Batch variant: pairs each snapshot with the same thread's previous one
    /// in the batch (or itself on first sight) whenever it waits on an owned
    /// lock, and keeps only the `top_k` hottest locks. `top_k == 0` keeps all.
    pub fn generate_contention_records(
        &self,
        batch: &[ThreadSnapshot],
        top_k: usize,
    ) -> Vec<ContentionRecord> {
        let mut accumulators = HashMap::new();
        let mut last_seen: HashMap<ThreadId, &ThreadSnapshot> = HashMap::new();

        for snapshot in batch {
            let prev = last_seen
                .insert(snapshot.thread_id, snapshot)
                .unwrap_or(snapshot);
            let Some(lock) = snapshot.waiting_on.as_ref().filter(|lock| lock.is_owned()) else {
                continue;
            };
            self.accumulator_for(&mut accumulators, lock)
                .record_block(lock, prev, snapshot);
        }

        top_n_by(
            accumulators.values().map(LockContentionAccumulator::to_record),
            top_k,
            record_rank,
        )
    }

    /// System-wide totals plus the hottest threads and locks
    pub fn aggregate_statistics(
        &self,
        thread_histories: &HashMap<ThreadId, ThreadHistory>,
        lock_histories: &HashMap<String, LockHistory>,
    ) -> ContentionSummary {
        let mut summary = ContentionSummary {
            total_threads: thread_histories.len(),
            total_locks: lock_histories.len(),
            ..ContentionSummary::default()
        };

        let mut hot_threads = Vec::new();
        for history in thread_histories.values() {
            let mut stats = BlockedThreadStats {
                thread_id: history.thread_id,
                thread_name: history.thread_name.clone(),
                total_blocked_ms: 0,
                block_count: 0,
                max_single_block_ms: 0,
            };
            for (prev, curr) in history.pairs().filter(|(prev, _)| prev.is_blocked()) {
                let delta = curr.timestamp_ms.saturating_sub(prev.timestamp_ms);
                stats.total_blocked_ms += delta;
                stats.block_count += 1;
                stats.max_single_block_ms = stats.max_single_block_ms.max(delta);
            }
            summary.total_block_events += u64::from(stats.block_count);
            summary.total_blocked_ms += stats.total_blocked_ms;

            if stats.total_blocked_ms > 0 {
                summary.blocked_threads += 1;
                summary.max_blocked_ms_per_thread =
                    summary.max_blocked_ms_per_thread.max(stats.total_blocked_ms);
                hot_threads.push(stats);
            }
        }

        let mut hot_locks = Vec::new();
        for history in lock_histories.values() {
            let total_blocked_ms: u64 = history
                .pairs()
                .filter(|(prev, _)| prev.contended)
                .map(|(prev, curr)| curr.timestamp_ms.saturating_sub(prev.timestamp_ms))
                .sum();
            if total_blocked_ms > 0 {
                summary.contended_locks += 1;
                summary.max_blocked_ms_per_lock =
                    summary.max_blocked_ms_per_lock.max(total_blocked_ms);
                hot_locks.push(LockBlockedTime {
                    lock_id: history.lock_id.clone(),
                    lock_name: history.lock_name.clone(),
                    kind: history.kind,
                    total_blocked_ms,
                });
            }
        }

        let top_n = self.summary_top_n;
        summary.top_hot_threads = top_n_by(hot_threads, top_n, |stats| {
            (stats.total_blocked_ms, Reverse(stats.thread_id))
        });
        summary.top_hot_locks = top_n_by(hot_locks, top_n, |lock| {
            (lock.total_blocked_ms, Reverse(lock.lock_id.clone()))
        });
        summary
    }

    /// Wait-for graph of one snapshot batch; edge weight is the time since the
    /// thread's previous snapshot in the batch, at least 1 ms
    pub fn build_wait_for_graph(&self, batch: &[ThreadSnapshot]) -> WaitForGraph {
        let graph = WaitForGraph::new();
        let mut last_seen: HashMap<ThreadId, &ThreadSnapshot> = HashMap::new();
        let mut edges = Vec::new();
        for snapshot in batch {
            graph.add_thread(snapshot.thread_id);
            let prev = last_seen.insert(snapshot.thread_id, snapshot);
            edges.extend(wait_edge(prev, snapshot));
        }
        graph.add_edges(edges);
        graph
    }

    pub fn detect_dead_blocks(&self, graph: &WaitForGraph) -> Vec<Vec<ThreadId>> {
        graph.get_dead_blocks()
    }
}

impl Default for ContentionAnalyzer {
    fn default() -> Self {
        Self::new(&AnalysisConfig::default())
    }
}

fn record_rank(record: &ContentionRecord) -> (u64, Reverse<String>) {
    (record.total_blocked_ms, Reverse(record.lock_id.clone()))
}

/// Hottest first; equal blocked time falls back to lock id order
pub(crate) fn rank_records(records: &mut [ContentionRecord]) {
    records.sort_by(|a, b| {
        b.total_blocked_ms
            .cmp(&a.total_blocked_ms)
            .then_with(|| a.lock_id.cmp(&b.lock_id))
    });
}

struct Keyed<K, T> {
    key: K,
    item: T,
}

impl<K: Ord, T> PartialEq for Keyed<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Ord, T> Eq for Keyed<K, T> {}

impl<K: Ord, T> PartialOrd for Keyed<K, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, T> Ord for Keyed<K, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// The `n` items with the greatest key, greatest first, through a size-`n`
/// min-heap. `n == 0` keeps everything.
pub(crate) fn top_n_by<T, K: Ord>(
    items: impl IntoIterator<Item = T>,
    n: usize,
    key: impl Fn(&T) -> K,
) -> Vec<T> {
    let mut heap = BinaryHeap::new();
    for item in items {
        heap.push(Reverse(Keyed {
            key: key(&item),
            item,
        }));
        if n > 0 && heap.len() > n {
            heap.pop();
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(keyed)| keyed.item)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{LockKind, StackFrame, ThreadState};

    fn runnable(thread: ThreadId, at: u64) -> ThreadSnapshot {
        ThreadSnapshot::new(thread, format!("t{thread}"), ThreadState::Runnable, at)
    }

    fn blocked_on(thread: ThreadId, at: u64, lock: &str, owner: ThreadId) -> ThreadSnapshot {
        ThreadSnapshot::new(thread, format!("t{thread}"), ThreadState::Blocked, at)
            .with_stack(vec![StackFrame::new("app", format!("enter_{lock}"))])
            .waiting_on(
                LockEvent::new(lock, lock.to_uppercase(), LockKind::Monitor)
                    .owned_by(owner, format!("t{owner}"))
                    .contended(true)
                    .at(at),
            )
    }

    fn histories(snapshots: Vec<ThreadSnapshot>) -> HashMap<ThreadId, ThreadHistory> {
        let mut histories: HashMap<ThreadId, ThreadHistory> = HashMap::new();
        for snapshot in snapshots {
            histories
                .entry(snapshot.thread_id)
                .or_insert_with(|| ThreadHistory::new(snapshot.thread_id, snapshot.thread_name.clone()))
                .push(std::sync::Arc::new(snapshot));
        }
        histories
    }

    #[test]
    fn blocked_interval_is_closed_by_the_next_sample() {
        let analyzer = ContentionAnalyzer::default();

        let two = histories(vec![runnable(1, 0), blocked_on(1, 50, "l", 2)]);
        assert!(analyzer.analyze_lock_contention(&two).is_empty());

        let three = histories(vec![runnable(1, 0), blocked_on(1, 50, "l", 2), runnable(1, 120)]);
        let records = analyzer.analyze_lock_contention(&three);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_count, 1);
        assert_eq!(records[0].total_blocked_ms, 70);
        assert_eq!(records[0].main_owner_id, Some(2));
        assert_eq!(records[0].blocked_thread_ids, vec![1]);
    }

    #[test]
    fn records_are_ranked_by_blocked_time() {
        let analyzer = ContentionAnalyzer::default();
        let records = analyzer.analyze_lock_contention(&histories(vec![
            blocked_on(1, 0, "a", 9),
            runnable(1, 10),
            blocked_on(2, 0, "b", 9),
            runnable(2, 40),
            blocked_on(3, 0, "c", 9),
            runnable(3, 40),
        ]));
        let order: Vec<&str> = records.iter().map(|r| r.lock_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn empty_inputs_yield_empty_results() {
        let analyzer = ContentionAnalyzer::default();
        assert!(analyzer.analyze_lock_contention(&HashMap::new()).is_empty());
        assert!(analyzer.analyze_hot_locks(&HashMap::new(), 1_000).is_empty());
        assert!(analyzer.generate_contention_records(&[], 5).is_empty());
        assert_eq!(
            analyzer.aggregate_statistics(&HashMap::new(), &HashMap::new()),
            ContentionSummary::default()
        );
    }

    #[test]
    fn batch_pairs_first_sighting_with_itself() {
        let analyzer = ContentionAnalyzer::default();
        let records = analyzer.generate_contention_records(&[blocked_on(1, 100, "l", 2)], 0);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block_count, 1);
        assert_eq!(records[0].total_blocked_ms, 0);
        assert_eq!(records[0].ownership_frequency.get(&2), Some(&1));

        let records = analyzer.generate_contention_records(
            &[blocked_on(1, 100, "l", 2), blocked_on(1, 130, "l", 2), runnable(1, 200)],
            0,
        );
        assert_eq!(records[0].block_count, 2);
        assert_eq!(records[0].total_blocked_ms, 30);
    }

    #[test]
    fn top_k_matches_unbounded_prefix() {
        let analyzer = ContentionAnalyzer::default();
        let mut batch = Vec::new();
        for lock in 0..12u64 {
            let thread = lock + 1;
            batch.push(blocked_on(thread, 0, &format!("lock-{lock:02}"), 100));
            batch.push(blocked_on(thread, (lock * 37) % 11 * 10 + 5, &format!("lock-{lock:02}"), 100));
        }

        let unbounded = analyzer.generate_contention_records(&batch, 0);
        assert_eq!(unbounded.len(), 12);
        assert!(unbounded
            .windows(2)
            .all(|w| w[0].total_blocked_ms >= w[1].total_blocked_ms));

        for k in [1, 3, 5, 12, 20] {
            let bounded = analyzer.generate_contention_records(&batch, k);
            assert_eq!(bounded.len(), k.min(12));
            assert_eq!(bounded, unbounded[..k.min(12)].to_vec());
        }
    }

    #[test]
    fn hot_locks_use_lock_level_history() {
        let analyzer = ContentionAnalyzer::default();
        let waiter = |thread: ThreadId, at: u64| {
            let mut event = LockEvent::new("h", "H", LockKind::Synchronizer)
                .owned_by(7, "t7")
                .contended(true)
                .at(at)
                .with_stack(vec![StackFrame::new("app", "flush")]);
            event.waiter_thread_id = Some(thread);
            event.waiter_thread_name = Some(format!("t{thread}"));
            event
        };
        let mut locks = HashMap::new();
        locks.insert(
            "h".to_string(),
            LockHistory::from_events(
                "h",
                "H",
                LockKind::Synchronizer,
                vec![waiter(1, 0), waiter(2, 100), waiter(3, 250)],
            ),
        );
        locks.insert(
            "idle".to_string(),
            LockHistory::from_events(
                "idle",
                "Idle",
                LockKind::Monitor,
                vec![LockEvent::new("idle", "Idle", LockKind::Monitor).at(0)],
            ),
        );

        let records = analyzer.analyze_hot_locks(&locks, 1_000);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.total_blocked_ms, 250);
        assert_eq!(record.block_count, 2);
        assert_eq!(record.blocked_thread_ids, vec![1, 2]);
        assert_eq!(record.main_owner_id, Some(7));
        let hot = record.hot.as_ref().unwrap();
        assert!((hot.normalized_blocked_ratio - 0.25).abs() < 1e-12);
        assert_eq!(hot.top_hot_stacks.len(), 1);
    }

    #[test]
    fn summary_keeps_hottest_threads() {
        let analyzer = ContentionAnalyzer::new(&AnalysisConfig {
            summary_top_n: 2,
            ..AnalysisConfig::default()
        });
        let mut snapshots = Vec::new();
        for thread in 1..=4u64 {
            snapshots.push(blocked_on(thread, 0, "l", 9));
            snapshots.push(runnable(thread, thread * 10));
        }
        let summary = analyzer.aggregate_statistics(&histories(snapshots), &HashMap::new());

        assert_eq!(summary.total_threads, 4);
        assert_eq!(summary.blocked_threads, 4);
        assert_eq!(summary.total_blocked_ms, 100);
        assert_eq!(summary.max_blocked_ms_per_thread, 40);
        assert_eq!(summary.total_block_events, 4);
        let top: Vec<ThreadId> = summary.top_hot_threads.iter().map(|t| t.thread_id).collect();
        assert_eq!(top, vec![4, 3]);
    }

    #[test]
    fn batch_graph_weights_follow_sample_gaps() {
        let analyzer = ContentionAnalyzer::default();
        let graph = analyzer.build_wait_for_graph(&[
            blocked_on(1, 0, "l", 2),
            blocked_on(1, 10, "l", 2),
            blocked_on(1, 30, "l", 2),
            blocked_on(1, 60, "l", 2),
            runnable(3, 60),
        ]);
        // 1 for the first sighting, then 10 + 20 + 30
        assert_eq!(graph.wait_time(1, 2), Some(61));
        assert_eq!(graph.node_count(), 3);
        assert_eq!(analyzer.detect_dead_blocks(&graph), vec![vec![1, 2]]);
    }

    #[test]
    fn top_n_keeps_everything_when_unbounded() {
        let kept = top_n_by(vec![3, 9, 1, 7], 0, |v| *v);
        assert_eq!(kept, vec![9, 7, 3, 1]);
        let kept = top_n_by(vec![3, 9, 1, 7], 2, |v| *v);
        assert_eq!(kept, vec![9, 7]);
    }
}
