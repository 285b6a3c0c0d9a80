use lockscope_core::snapshot::{LockEvent, LockKind, StackFrame, ThreadId, ThreadSnapshot, ThreadState};

pub const LOCK_ID: &str = "L";

pub fn thread_name(id: ThreadId) -> String {
    format!("T{id}")
}

pub fn lock_owned_by(lock_id: &str, owner: ThreadId) -> LockEvent {
    LockEvent::new(lock_id, lock_id.to_lowercase(), LockKind::Monitor)
        .owned_by(owner, thread_name(owner))
        .contended(true)
}

pub fn runnable(thread: ThreadId, at: u64) -> ThreadSnapshot {
    ThreadSnapshot::new(thread, thread_name(thread), ThreadState::Runnable, at)
        .with_stack(vec![StackFrame::new("app", "work")])
}

pub fn blocked_on(thread: ThreadId, lock_id: &str, owner: ThreadId, at: u64) -> ThreadSnapshot {
    ThreadSnapshot::new(thread, thread_name(thread), ThreadState::Blocked, at)
        .with_stack(vec![
            StackFrame::new("app", "enter").at("app.rs", 7),
            StackFrame::new("app", "work"),
        ])
        .waiting_on(lock_owned_by(lock_id, owner).at(at))
}

/// T1 runs at 0, blocks on L (owned by T2) at 50 and runs again at 120
pub struct ThreeSampleScenario {
    pub snapshots: Vec<ThreadSnapshot>,
    pub expected_blocked_ms: u64,
}

pub fn three_sample_scenario() -> ThreeSampleScenario {
    ThreeSampleScenario {
        snapshots: vec![runnable(1, 0), blocked_on(1, LOCK_ID, 2, 50), runnable(1, 120)],
        expected_blocked_ms: 70,
    }
}

/// One waiter per lock, seen twice so the lock accrues exactly the given total
pub fn graded_batch(totals: &[(&str, u64)]) -> Vec<ThreadSnapshot> {
    let mut batch = Vec::new();
    for (index, (lock_id, blocked_ms)) in totals.iter().enumerate() {
        let waiter = 100 + index as ThreadId;
        batch.push(blocked_on(waiter, lock_id, 1, 0));
        batch.push(blocked_on(waiter, lock_id, 1, *blocked_ms));
    }
    batch
}

/// Three threads each holding one lock and waiting on the next one's
pub fn ring_batch(threads: [ThreadId; 3], at: u64) -> Vec<ThreadSnapshot> {
    (0..3)
        .map(|i| {
            let me = threads[i];
            let next = threads[(i + 1) % 3];
            blocked_on(me, &format!("ring-{next}"), next, at)
                .holding(lock_owned_by(&format!("ring-{me}"), me))
        })
        .collect()
}

/// One capture line per snapshot
pub fn jsonl_capture(snapshots: &[ThreadSnapshot]) -> String {
    snapshots
        .iter()
        .filter_map(|snapshot| serde_json::to_string(snapshot).ok())
        .collect::<Vec<_>>()
        .join("\n")
}
