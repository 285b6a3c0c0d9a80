use crate::snapshot::{LockEvent, LockKind, StackFrame, ThreadId, ThreadSnapshot, ThreadState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::BufRead;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supplier of complete per-instant thread snapshots.
///
/// How the snapshots are obtained (runtime introspection, a remote agent, a
/// recording) is up to the implementation.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Snapshots of all live threads at one instant; `None` once exhausted
    async fn sample(&self) -> Result<Option<Vec<ThreadSnapshot>>>;

    fn name(&self) -> &str;
}

/// Plays back pre-recorded sample batches in order
pub struct ReplaySource {
    name: String,
    batches: Mutex<VecDeque<Vec<ThreadSnapshot>>>,
}

impl ReplaySource {
    pub fn new(name: impl Into<String>, batches: Vec<Vec<ThreadSnapshot>>) -> Self {
        Self {
            name: name.into(),
            batches: Mutex::new(batches.into()),
        }
    }

    /// Read a JSON-lines capture: one snapshot per line, consecutive lines with
    /// the same timestamp forming one sample. Undecodable lines are skipped.
    pub fn from_reader(name: impl Into<String>, reader: impl BufRead) -> Result<Self> {
        let mut batches: Vec<Vec<ThreadSnapshot>> = Vec::new();
        let mut skipped = 0usize;
        for (number, line) in reader.lines().enumerate() {
            let line = line.context("Failed to read snapshot line")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let snapshot: ThreadSnapshot = match serde_json::from_str(line) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Skipping malformed snapshot on line {}: {}", number + 1, e);
                    skipped += 1;
                    continue;
                }
            };
            match batches.last_mut() {
                Some(batch)
                    if batch
                        .last()
                        .is_some_and(|last| last.timestamp_ms == snapshot.timestamp_ms) =>
                {
                    batch.push(snapshot)
                }
                _ => batches.push(vec![snapshot]),
            }
        }
        let name = name.into();
        tracing::info!(
            "Loaded {} sample batches from {} ({} lines skipped)",
            batches.len(),
            name,
            skipped
        );
        Ok(Self::new(name, batches))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open capture {}", path.display()))?;
        Self::from_reader(path.display().to_string(), std::io::BufReader::new(file))
    }

    pub fn remaining(&self) -> usize {
        self.batches.lock().len()
    }

    /// Every remaining snapshot in recorded order, consuming the source
    pub fn into_snapshots(self) -> Vec<ThreadSnapshot> {
        self.batches.into_inner().into_iter().flatten().collect()
    }
}

#[async_trait]
impl SnapshotSource for ReplaySource {
    async fn sample(&self) -> Result<Option<Vec<ThreadSnapshot>>> {
        Ok(self.batches.lock().pop_front())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub const HOT_LOCK_ID: &str = "hot-lock";
pub const DEADLOCK_THREADS: [ThreadId; 2] = [1_001, 1_002];

/// Deterministic simulated process.
///
/// Worker 1 owns a hot monitor four samples out of five (worker 2 takes it
/// otherwise) while the remaining workers queue behind it. With `deadlock`
/// set, two extra threads each hold one lock and wait for the other's.
pub struct SyntheticSource {
    workers: u64,
    step_ms: u64,
    deadlock: bool,
    max_samples: Option<u64>,
    tick: AtomicU64,
}

impl SyntheticSource {
    pub fn new(workers: u64, step_ms: u64) -> Self {
        Self {
            workers: workers.max(2),
            step_ms: step_ms.max(1),
            deadlock: false,
            max_samples: None,
            tick: AtomicU64::new(0),
        }
    }

    pub fn with_deadlock(mut self, deadlock: bool) -> Self {
        self.deadlock = deadlock;
        self
    }

    /// Stop after `samples` batches
    pub fn limited_to(mut self, samples: u64) -> Self {
        self.max_samples = Some(samples);
        self
    }

    /// The batch for sample number `tick`
    pub fn batch_at(&self, tick: u64) -> Vec<ThreadSnapshot> {
        let at = tick * self.step_ms;
        let owner: ThreadId = if tick % 5 == 4 { 2 } else { 1 };
        let hot_lock = || {
            LockEvent::new(HOT_LOCK_ID, "HotLock", LockKind::Monitor)
                .owned_by(owner, worker_name(owner))
                .contended(true)
                .at(at)
        };

        let mut batch = Vec::with_capacity(self.workers as usize + 2);
        for worker in 1..=self.workers {
            let name = worker_name(worker);
            let snapshot = if worker == owner {
                ThreadSnapshot::new(worker, name, ThreadState::Runnable, at)
                    .with_stack(vec![
                        StackFrame::new("sim", "hold_hot_lock").at("sim.rs", 18),
                        StackFrame::new("sim", "worker_loop"),
                    ])
                    .holding(hot_lock())
            } else if (tick + worker) % 4 == 0 {
                ThreadSnapshot::new(worker, name, ThreadState::TimedWaiting, at)
                    .with_stack(vec![StackFrame::new("sim", "pause"), StackFrame::new("sim", "worker_loop")])
            } else {
                ThreadSnapshot::new(worker, name, ThreadState::Blocked, at)
                    .with_stack(vec![
                        StackFrame::new("sim", "enter_hot_lock").at("sim.rs", 12),
                        StackFrame::new("sim", "worker_loop"),
                    ])
                    .waiting_on(hot_lock())
            };
            batch.push(snapshot);
        }

        if self.deadlock {
            let [left, right] = DEADLOCK_THREADS;
            let lock = |id: &str, holder: ThreadId| {
                LockEvent::new(id, id.to_uppercase(), LockKind::Synchronizer)
                    .owned_by(holder, worker_name(holder))
                    .contended(true)
                    .at(at)
            };
            for (me, other, mine, theirs) in [(left, right, "lock-a", "lock-b"), (right, left, "lock-b", "lock-a")] {
                batch.push(
                    ThreadSnapshot::new(me, worker_name(me), ThreadState::Blocked, at)
                        .with_stack(vec![StackFrame::new("sim", "transfer").at("sim.rs", 40)])
                        .holding(lock(mine, me))
                        .waiting_on(lock(theirs, other)),
                );
            }
        }
        batch
    }
}

fn worker_name(id: ThreadId) -> String {
    format!("sim-worker-{id}")
}

#[async_trait]
impl SnapshotSource for SyntheticSource {
    async fn sample(&self) -> Result<Option<Vec<ThreadSnapshot>>> {
        let tick = self.tick.fetch_add(1, Ordering::AcqRel);
        if self.max_samples.is_some_and(|max| tick >= max) {
            return Ok(None);
        }
        Ok(Some(self.batch_at(tick)))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
