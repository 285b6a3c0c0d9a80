use crate::record::{severity_score, ContentionPolicy, ContentionRecord, StackFrequency};
use crate::snapshot::{LockEvent, LockKind, StackKey, ThreadId, ThreadSnapshot};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One blocked interval attributed to a lock
#[derive(Debug, Clone)]
pub(crate) struct BlockObservation<'a> {
    pub waiter: Option<(ThreadId, &'a str)>,
    pub owner: Option<(ThreadId, Option<&'a str>)>,
    pub delta_ms: u64,
    pub at_ms: u64,
    pub stack: StackKey,
}

/// Running contention aggregate for one lock.
///
/// Every derived figure (waiter count, max ownership) is maintained on update,
/// so queries never rescan past observations.
#[derive(Debug, Clone)]
pub struct LockContentionAccumulator {
    lock_id: String,
    lock_name: String,
    kind: LockKind,
    policy: ContentionPolicy,

    blocked_thread_ids: HashSet<ThreadId>,
    blocked_thread_names: HashSet<String>,
    ownership_frequency: HashMap<ThreadId, u32>,
    owner_names: HashMap<ThreadId, String>,
    unowned_blocks: u32,

    total_blocked_ms: u64,
    max_single_block_ms: u64,
    block_count: u32,
    last_timestamp_ms: u64,

    max_ownership: u32,
    unique_waiter_count: u32,

    blocking_stacks: HashMap<StackKey, u32>,
}

impl LockContentionAccumulator {
    pub fn new(lock_id: impl Into<String>, lock_name: impl Into<String>, kind: LockKind) -> Self {
        Self::with_policy(lock_id, lock_name, kind, ContentionPolicy::default())
    }

    pub fn with_policy(
        lock_id: impl Into<String>,
        lock_name: impl Into<String>,
        kind: LockKind,
        policy: ContentionPolicy,
    ) -> Self {
        Self {
            lock_id: lock_id.into(),
            lock_name: lock_name.into(),
            kind,
            policy,
            blocked_thread_ids: HashSet::new(),
            blocked_thread_names: HashSet::new(),
            ownership_frequency: HashMap::new(),
            owner_names: HashMap::new(),
            unowned_blocks: 0,
            total_blocked_ms: 0,
            max_single_block_ms: 0,
            block_count: 0,
            last_timestamp_ms: 0,
            max_ownership: 0,
            unique_waiter_count: 0,
            blocking_stacks: HashMap::new(),
        }
    }

    pub fn for_event(lock: &LockEvent, policy: ContentionPolicy) -> Self {
        Self::with_policy(lock.lock_id.clone(), lock.lock_name.clone(), lock.kind, policy)
    }

    /// Record that `prev`'s thread spent `curr - prev` blocked on `lock`
    pub fn record_block(&mut self, lock: &LockEvent, prev: &ThreadSnapshot, curr: &ThreadSnapshot) {
        self.observe(BlockObservation {
            waiter: Some((prev.thread_id, prev.thread_name.as_str())),
            owner: lock
                .owner()
                .map(|id| (id, lock.owner_thread_name.as_deref())),
            delta_ms: curr.timestamp_ms.saturating_sub(prev.timestamp_ms),
            at_ms: curr.timestamp_ms,
            stack: prev.stack_key(),
        });
    }

    pub(crate) fn observe(&mut self, observation: BlockObservation<'_>) {
        if let Some((thread_id, thread_name)) = observation.waiter {
            self.blocked_thread_ids.insert(thread_id);
            if !thread_name.is_empty() && !self.blocked_thread_names.contains(thread_name) {
                self.blocked_thread_names.insert(thread_name.to_string());
            }
        }

        self.total_blocked_ms += observation.delta_ms;
        self.max_single_block_ms = self.max_single_block_ms.max(observation.delta_ms);
        self.block_count += 1;
        self.last_timestamp_ms = self.last_timestamp_ms.max(observation.at_ms);

        match observation.owner {
            Some((owner_id, owner_name)) => {
                let frequency = self.ownership_frequency.entry(owner_id).or_insert(0);
                *frequency += 1;
                self.max_ownership = self.max_ownership.max(*frequency);
                if let Some(name) = owner_name {
                    self.owner_names
                        .entry(owner_id)
                        .or_insert_with(|| name.to_string());
                }
            }
            None => self.unowned_blocks += 1,
        }

        self.unique_waiter_count = self.blocked_thread_ids.len() as u32;
        *self.blocking_stacks.entry(observation.stack).or_insert(0) += 1;
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn total_blocked_ms(&self) -> u64 {
        self.total_blocked_ms
    }

    pub fn max_single_block_ms(&self) -> u64 {
        self.max_single_block_ms
    }

    pub fn unique_waiter_count(&self) -> u32 {
        self.unique_waiter_count
    }

    pub fn max_ownership(&self) -> u32 {
        self.max_ownership
    }

    pub fn last_timestamp_ms(&self) -> u64 {
        self.last_timestamp_ms
    }

    pub fn has_contention(&self) -> bool {
        self.block_count > 0
    }

    pub fn is_convoy(&self) -> bool {
        self.policy
            .is_convoy(self.max_ownership, self.block_count, self.unique_waiter_count)
    }

    pub fn severity_score(&self) -> f64 {
        severity_score(
            self.total_blocked_ms,
            self.block_count,
            self.ownership_frequency.len(),
            self.max_single_block_ms,
        )
    }

    /// Most frequent owner; ties go to the lowest thread id
    pub fn main_owner(&self) -> Option<ThreadId> {
        self.ownership_frequency
            .iter()
            .max_by(|(a_id, a_count), (b_id, b_count)| {
                a_count.cmp(b_count).then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| *id)
    }

    pub fn to_record(&self) -> ContentionRecord {
        let main_owner_id = self.main_owner();

        let mut blocked_thread_ids: Vec<ThreadId> = self.blocked_thread_ids.iter().copied().collect();
        blocked_thread_ids.sort_unstable();
        let mut blocked_thread_names: Vec<String> =
            self.blocked_thread_names.iter().cloned().collect();
        blocked_thread_names.sort();

        let mut blocking_stacks: Vec<StackFrequency> = self
            .blocking_stacks
            .iter()
            .map(|(stack, count)| StackFrequency {
                stack: stack.clone(),
                count: *count,
            })
            .collect();
        blocking_stacks.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.stack.cmp(&b.stack)));

        ContentionRecord {
            lock_id: self.lock_id.clone(),
            lock_name: self.lock_name.clone(),
            kind: self.kind,
            main_owner_id,
            main_owner_name: main_owner_id.and_then(|id| self.owner_names.get(&id).cloned()),
            blocked_thread_ids,
            blocked_thread_names,
            block_count: self.block_count,
            unique_waiter_count: self.unique_waiter_count,
            total_blocked_ms: self.total_blocked_ms,
            max_single_block_ms: self.max_single_block_ms,
            ownership_frequency: self
                .ownership_frequency
                .iter()
                .map(|(id, count)| (*id, *count))
                .collect::<BTreeMap<_, _>>(),
            max_ownership: self.max_ownership,
            unowned_blocks: self.unowned_blocks,
            last_timestamp_ms: self.last_timestamp_ms,
            blocking_stacks,
            severity_score: self.severity_score(),
            convoy: self.is_convoy(),
            hot: None,
        }
    }
}

struct RegistryEntry {
    accumulator: Mutex<LockContentionAccumulator>,
    last_cycle: AtomicU64,
}

/// Concurrent lock-id → accumulator map.
///
/// The map only hands out entries; each accumulator carries its own lock so
/// updates for different lock ids never serialize on each other.
pub struct AccumulatorRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    policy: ContentionPolicy,
    cycle: AtomicU64,
}

impl AccumulatorRegistry {
    pub fn new(policy: ContentionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            cycle: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> ContentionPolicy {
        self.policy
    }

    pub fn begin_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn entry_for(&self, lock: &LockEvent) -> Arc<RegistryEntry> {
        let cycle = self.cycle.load(Ordering::Acquire);
        let entry = self
            .entries
            .entry(lock.lock_id.clone())
            .or_insert_with(|| {
                Arc::new(RegistryEntry {
                    accumulator: Mutex::new(LockContentionAccumulator::for_event(lock, self.policy)),
                    last_cycle: AtomicU64::new(cycle),
                })
            })
            .clone();
        entry.last_cycle.store(cycle, Ordering::Release);
        entry
    }

    pub fn record_block(&self, lock: &LockEvent, prev: &ThreadSnapshot, curr: &ThreadSnapshot) {
        let entry = self.entry_for(lock);
        entry.accumulator.lock().record_block(lock, prev, curr);
    }

    /// Records for every lock with at least one block, hottest first
    pub fn records(&self) -> Vec<ContentionRecord> {
        let mut records: Vec<ContentionRecord> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|entry| {
                let accumulator = entry.accumulator.lock();
                accumulator.has_contention().then(|| accumulator.to_record())
            })
            .collect();
        crate::analysis::rank_records(&mut records);
        records
    }

    pub fn record(&self, lock_id: &str) -> Option<ContentionRecord> {
        let entry = self.entries.get(lock_id).map(|e| Arc::clone(e.value()))?;
        let accumulator = entry.accumulator.lock();
        Some(accumulator.to_record())
    }

    /// Records of locks currently classified as convoys
    pub fn convoys(&self) -> Vec<ContentionRecord> {
        self.records().into_iter().filter(|r| r.convoy).collect()
    }

    /// Drop accumulators for locks not blocked on within `retention_cycles`.
    ///
    /// An update holding an evicted entry finishes on the detached accumulator;
    /// the next update for that lock starts a fresh one.
    pub fn evict_stale(&self, retention_cycles: u64) -> usize {
        if retention_cycles == 0 {
            return 0;
        }
        let current = self.cycle.load(Ordering::Acquire);
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            current.saturating_sub(entry.last_cycle.load(Ordering::Acquire)) <= retention_cycles
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for AccumulatorRegistry {
    fn default() -> Self {
        Self::new(ContentionPolicy::default())
    }
}
