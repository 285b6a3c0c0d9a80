use crate::config::RetentionConfig;
use crate::snapshot::{LockEvent, LockKind, ThreadId, ThreadSnapshot};
use dashmap::DashMap;
use itertools::Itertools;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ordered snapshot sequence for one thread, in arrival order
#[derive(Debug, Clone)]
pub struct ThreadHistory {
    pub thread_id: ThreadId,
    pub thread_name: String,
    snapshots: VecDeque<Arc<ThreadSnapshot>>,
}

impl ThreadHistory {
    pub fn new(thread_id: ThreadId, thread_name: impl Into<String>) -> Self {
        Self {
            thread_id,
            thread_name: thread_name.into(),
            snapshots: VecDeque::new(),
        }
    }

    /// Build a history from already-ordered snapshots
    pub fn from_snapshots(
        thread_id: ThreadId,
        thread_name: impl Into<String>,
        snapshots: impl IntoIterator<Item = ThreadSnapshot>,
    ) -> Self {
        let mut history = Self::new(thread_id, thread_name);
        for snapshot in snapshots {
            history.push(Arc::new(snapshot));
        }
        history
    }

    pub fn push(&mut self, snapshot: Arc<ThreadSnapshot>) {
        if self.thread_name.is_empty() && !snapshot.thread_name.is_empty() {
            self.thread_name = snapshot.thread_name.clone();
        }
        self.snapshots.push_back(snapshot);
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &ThreadSnapshot> {
        self.snapshots.iter().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn last(&self) -> Option<&Arc<ThreadSnapshot>> {
        self.snapshots.back()
    }

    /// Consecutive (earlier, later) snapshot pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&ThreadSnapshot, &ThreadSnapshot)> {
        self.snapshots().tuple_windows()
    }

    /// Time spent in intervals whose opening sample shows the thread blocked
    pub fn total_blocked_ms(&self) -> u64 {
        self.pairs()
            .filter(|(prev, _)| prev.is_blocked())
            .map(|(prev, curr)| curr.timestamp_ms.saturating_sub(prev.timestamp_ms))
            .sum()
    }

    pub fn max_held_locks(&self) -> usize {
        self.snapshots()
            .map(ThreadSnapshot::held_lock_count)
            .max()
            .unwrap_or(0)
    }

    fn trim_to(&mut self, max_len: usize) {
        while max_len > 0 && self.snapshots.len() > max_len {
            self.snapshots.pop_front();
        }
    }
}

/// Ordered event sequence for one lock identity with incrementally derived counters
#[derive(Debug, Clone)]
pub struct LockHistory {
    pub lock_id: String,
    pub lock_name: String,
    pub kind: LockKind,
    events: VecDeque<Arc<LockEvent>>,
    pub first_seen_ms: Option<u64>,
    pub last_seen_ms: u64,
    pub max_contended_count: u32,
    pub total_contention_events: u64,
}

impl LockHistory {
    pub fn new(lock_id: impl Into<String>, lock_name: impl Into<String>, kind: LockKind) -> Self {
        Self {
            lock_id: lock_id.into(),
            lock_name: lock_name.into(),
            kind,
            events: VecDeque::new(),
            first_seen_ms: None,
            last_seen_ms: 0,
            max_contended_count: 0,
            total_contention_events: 0,
        }
    }

    pub fn from_events(
        lock_id: impl Into<String>,
        lock_name: impl Into<String>,
        kind: LockKind,
        events: impl IntoIterator<Item = LockEvent>,
    ) -> Self {
        let mut history = Self::new(lock_id, lock_name, kind);
        for event in events {
            history.push(Arc::new(event));
        }
        history
    }

    pub fn push(&mut self, event: Arc<LockEvent>) {
        let at = event.timestamp_ms;
        self.first_seen_ms.get_or_insert(at);
        self.last_seen_ms = self.last_seen_ms.max(at);
        if event.contended {
            self.max_contended_count = self.max_contended_count.max(1);
            self.total_contention_events += 1;
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> impl Iterator<Item = &LockEvent> {
        self.events.iter().map(|e| e.as_ref())
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&LockEvent, &LockEvent)> {
        self.events().tuple_windows()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn trim_to(&mut self, max_len: usize) {
        while max_len > 0 && self.events.len() > max_len {
            self.events.pop_front();
        }
    }
}

struct Tracked<T> {
    value: T,
    last_cycle: u64,
}

/// Append-only, concurrently writable store of thread and lock histories.
///
/// Entries are only dropped by the retention policy: identities not seen in
/// `retention_cycles` sampling cycles, and history length caps.
pub struct HistoryStore {
    threads: DashMap<ThreadId, Tracked<ThreadHistory>>,
    locks: DashMap<String, Tracked<LockHistory>>,
    cycle: AtomicU64,
    retention: RetentionConfig,
}

impl HistoryStore {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            threads: DashMap::new(),
            locks: DashMap::new(),
            cycle: AtomicU64::new(0),
            retention,
        }
    }

    /// Start a new sampling cycle; returns its number
    pub fn begin_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    /// Append a snapshot to its thread history and file its lock events.
    ///
    /// Returns the thread's previous snapshot; the lookup and the append happen
    /// under the same entry lock so concurrent producers see a consistent order.
    pub fn append_snapshot(&self, snapshot: Arc<ThreadSnapshot>) -> Option<Arc<ThreadSnapshot>> {
        let cycle = self.current_cycle();
        let previous = {
            let mut entry = self
                .threads
                .entry(snapshot.thread_id)
                .or_insert_with(|| Tracked {
                    value: ThreadHistory::new(snapshot.thread_id, snapshot.thread_name.clone()),
                    last_cycle: cycle,
                });
            let previous = entry.value.last().cloned();
            entry.last_cycle = cycle;
            entry.value.push(Arc::clone(&snapshot));
            entry.value.trim_to(self.retention.max_snapshots_per_thread);
            previous
        };

        for lock in snapshot.owned_locks() {
            self.append_lock_event(lock.clone());
        }
        if let Some(waiting) = &snapshot.waiting_on {
            let mut event = waiting.clone();
            event.waiter_thread_id.get_or_insert(snapshot.thread_id);
            if event.waiter_thread_name.is_none() && !snapshot.thread_name.is_empty() {
                event.waiter_thread_name = Some(snapshot.thread_name.clone());
            }
            if event.timestamp_ms == 0 {
                event.timestamp_ms = snapshot.timestamp_ms;
            }
            self.append_lock_event(event);
        }

        previous
    }

    pub fn append_lock_event(&self, event: LockEvent) {
        let cycle = self.current_cycle();
        let mut entry = self
            .locks
            .entry(event.lock_id.clone())
            .or_insert_with(|| Tracked {
                value: LockHistory::new(event.lock_id.clone(), event.lock_name.clone(), event.kind),
                last_cycle: cycle,
            });
        entry.last_cycle = cycle;
        entry.value.push(Arc::new(event));
        entry.value.trim_to(self.retention.max_events_per_lock);
    }

    pub fn thread_history(&self, thread_id: ThreadId) -> Option<ThreadHistory> {
        self.threads.get(&thread_id).map(|entry| entry.value.clone())
    }

    pub fn lock_history(&self, lock_id: &str) -> Option<LockHistory> {
        self.locks.get(lock_id).map(|entry| entry.value.clone())
    }

    /// Point-in-time copy of every thread history
    pub fn thread_histories(&self) -> HashMap<ThreadId, ThreadHistory> {
        self.threads
            .iter()
            .map(|entry| (*entry.key(), entry.value().value.clone()))
            .collect()
    }

    /// Point-in-time copy of every lock history
    pub fn lock_histories(&self) -> HashMap<String, LockHistory> {
        self.locks
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Drop histories not seen within `retention_cycles` cycles.
    ///
    /// Returns the evicted thread ids. An append racing with eviction either
    /// lands before the entry is removed or recreates a fresh entry.
    pub fn evict_stale(&self, retention_cycles: u64) -> Vec<ThreadId> {
        if retention_cycles == 0 {
            return Vec::new();
        }
        let current = self.current_cycle();
        let is_stale = |last: u64| current.saturating_sub(last) > retention_cycles;

        let mut evicted = Vec::new();
        self.threads.retain(|thread_id, entry| {
            let keep = !is_stale(entry.last_cycle);
            if !keep {
                evicted.push(*thread_id);
            }
            keep
        });
        let before = self.locks.len();
        self.locks.retain(|_, entry| !is_stale(entry.last_cycle));

        if !evicted.is_empty() || before != self.locks.len() {
            tracing::debug!(
                "Evicted {} thread histories and {} lock histories at cycle {}",
                evicted.len(),
                before - self.locks.len(),
                current
            );
        }
        evicted
    }

    pub fn clear(&self) {
        self.threads.clear();
        self.locks.clear();
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(RetentionConfig::default())
    }
}
