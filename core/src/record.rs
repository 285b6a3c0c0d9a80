use crate::config::AnalysisConfig;
use crate::snapshot::{LockKind, StackKey, ThreadId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Thresholds applied when a record is emitted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContentionPolicy {
    /// A lock is a convoy when one owner holds more than this share of blocks
    pub convoy_ownership_ratio: f64,
    /// ...and strictly more than this many distinct waiters queued behind it
    pub convoy_min_waiters: u32,
    pub hot_stack_limit: usize,
}

impl Default for ContentionPolicy {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for ContentionPolicy {
    fn from(config: &AnalysisConfig) -> Self {
        Self {
            convoy_ownership_ratio: config.convoy_ownership_ratio,
            convoy_min_waiters: config.convoy_min_waiters,
            hot_stack_limit: config.hot_stack_limit,
        }
    }
}

impl ContentionPolicy {
    pub fn is_convoy(&self, max_ownership: u32, block_count: u32, unique_waiters: u32) -> bool {
        f64::from(max_ownership) > f64::from(block_count) * self.convoy_ownership_ratio
            && unique_waiters > self.convoy_min_waiters
    }
}

/// `total * ln(blocks + 1) * ln(owners + 1) / (max_single + 1)`, zero without blocks
pub fn severity_score(
    total_blocked_ms: u64,
    block_count: u32,
    distinct_owners: usize,
    max_single_block_ms: u64,
) -> f64 {
    if block_count == 0 {
        return 0.0;
    }
    total_blocked_ms as f64
        * (f64::from(block_count) + 1.0).ln()
        * (distinct_owners as f64 + 1.0).ln()
        / (max_single_block_ms as f64 + 1.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrequency {
    pub stack: StackKey,
    pub count: u32,
}

/// Fields only the hot-lock aggregation computes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotLockStats {
    /// Total blocked time over the observation window (may exceed 1 when
    /// several threads block concurrently)
    pub normalized_blocked_ratio: f64,
    pub observation_window_ms: u64,
    pub top_hot_stacks: Vec<StackKey>,
}

/// Immutable contention report for one lock, computed once at emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentionRecord {
    pub lock_id: String,
    pub lock_name: String,
    pub kind: LockKind,
    pub main_owner_id: Option<ThreadId>,
    pub main_owner_name: Option<String>,
    pub blocked_thread_ids: Vec<ThreadId>,
    pub blocked_thread_names: Vec<String>,
    pub block_count: u32,
    pub unique_waiter_count: u32,
    pub total_blocked_ms: u64,
    pub max_single_block_ms: u64,
    pub ownership_frequency: BTreeMap<ThreadId, u32>,
    pub max_ownership: u32,
    pub unowned_blocks: u32,
    pub last_timestamp_ms: u64,
    pub blocking_stacks: Vec<StackFrequency>,
    pub severity_score: f64,
    pub convoy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot: Option<HotLockStats>,
}

impl ContentionRecord {
    pub fn has_contention(&self) -> bool {
        self.block_count > 0
    }

    pub fn distinct_owners(&self) -> usize {
        self.ownership_frequency.len()
    }

    /// Attach hot-lock fields for the given observation window
    pub fn with_hot_stats(mut self, observation_window_ms: u64, stack_limit: usize) -> Self {
        let top_hot_stacks = self
            .blocking_stacks
            .iter()
            .take(stack_limit)
            .map(|entry| entry.stack.clone())
            .collect();
        self.hot = Some(HotLockStats {
            normalized_blocked_ratio: self.total_blocked_ms as f64
                / observation_window_ms.max(1) as f64,
            observation_window_ms,
            top_hot_stacks,
        });
        self
    }
}

impl fmt::Display for ContentionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let owner = self
            .main_owner_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "Lock[{}:{}] owner={} blockedThreads={} totalBlockedTime={} maxBlock={} convoy={}",
            self.kind,
            self.lock_name,
            owner,
            self.unique_waiter_count,
            self.total_blocked_ms,
            self.max_single_block_ms,
            self.convoy
        )?;
        if let Some(hot) = &self.hot {
            write!(
                f,
                " normalized={:.2} topStacks={}",
                hot.normalized_blocked_ratio,
                hot.top_hot_stacks.len()
            )?;
        }
        Ok(())
    }
}

/// Observation interval a report is normalized against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingWindow {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl ProfilingWindow {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// A record paired with its window-relative figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockContentionReport {
    pub record: ContentionRecord,
    pub severity_score: f64,
    pub blocked_ratio: f64,
    pub convoy: bool,
}

impl LockContentionReport {
    pub fn from_record(record: ContentionRecord, window: ProfilingWindow) -> Self {
        let blocked_ratio = record.total_blocked_ms as f64 / window.duration_ms().max(1) as f64;
        Self {
            severity_score: record.severity_score,
            convoy: record.convoy,
            blocked_ratio,
            record,
        }
    }
}

/// Per-thread blocked-time figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedThreadStats {
    pub thread_id: ThreadId,
    pub thread_name: String,
    pub total_blocked_ms: u64,
    pub block_count: u32,
    pub max_single_block_ms: u64,
}

/// Lock-level blocked time used in summaries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBlockedTime {
    pub lock_id: String,
    pub lock_name: String,
    pub kind: LockKind,
    pub total_blocked_ms: u64,
}

/// System-wide aggregate over thread and lock histories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentionSummary {
    pub total_threads: usize,
    pub blocked_threads: usize,
    pub total_blocked_ms: u64,
    pub max_blocked_ms_per_thread: u64,
    pub total_block_events: u64,
    pub total_locks: usize,
    pub contended_locks: usize,
    pub max_blocked_ms_per_lock: u64,
    pub top_hot_threads: Vec<BlockedThreadStats>,
    pub top_hot_locks: Vec<LockBlockedTime>,
}
