use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Identifier of an observed thread, as reported by the snapshot source.
pub type ThreadId = u64;

/// Scheduling state of a thread at the sample instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    pub fn is_blocked(self) -> bool {
        matches!(self, ThreadState::Blocked)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, ThreadState::Waiting | ThreadState::TimedWaiting)
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        ThreadState::Runnable
    }
}

/// How a lock was acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    Monitor,      // implicit, critical-section syntax
    Synchronizer, // explicit lock object
}

impl Default for LockKind {
    fn default() -> Self {
        LockKind::Monitor
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Monitor => f.write_str("monitor"),
            LockKind::Synchronizer => f.write_str("synchronizer"),
        }
    }
}

/// A single frame of a captured call stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub function: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl StackFrame {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            file: None,
            line: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.function)?;
        } else {
            write!(f, "{}::{}", self.module, self.function)?;
        }
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, " ({}:{})", file, line),
            (Some(file), None) => write!(f, " ({})", file),
            _ => Ok(()),
        }
    }
}

/// Canonical form of a call stack, used as a frequency-map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackKey(pub Vec<String>);

impl StackKey {
    pub fn from_frames(frames: &[StackFrame]) -> Self {
        Self(frames.iter().map(|frame| frame.to_string()).collect())
    }

    pub fn frames(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Innermost frame, if any
    pub fn top(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

/// One lock as observed on one thread at one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEvent {
    pub lock_id: String,
    #[serde(default)]
    pub lock_name: String,
    #[serde(default)]
    pub kind: LockKind,
    #[serde(default, with = "owner_id")]
    pub owner_thread_id: Option<ThreadId>,
    #[serde(default)]
    pub owner_thread_name: Option<String>,
    #[serde(default)]
    pub contended: bool,
    #[serde(default)]
    pub timestamp_ms: u64,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    /// Thread seen waiting for this lock in the same sample, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiter_thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiter_thread_name: Option<String>,
}

impl LockEvent {
    pub fn new(lock_id: impl Into<String>, lock_name: impl Into<String>, kind: LockKind) -> Self {
        Self {
            lock_id: lock_id.into(),
            lock_name: lock_name.into(),
            kind,
            owner_thread_id: None,
            owner_thread_name: None,
            contended: false,
            timestamp_ms: 0,
            stack: Vec::new(),
            waiter_thread_id: None,
            waiter_thread_name: None,
        }
    }

    pub fn owned_by(mut self, thread_id: ThreadId, thread_name: impl Into<String>) -> Self {
        self.owner_thread_id = Some(thread_id);
        self.owner_thread_name = Some(thread_name.into());
        self
    }

    pub fn contended(mut self, contended: bool) -> Self {
        self.contended = contended;
        self
    }

    pub fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.owner_thread_id, Some(id) if id > 0)
    }

    /// Owner id if the lock is owned
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner_thread_id.filter(|id| *id > 0)
    }
}

/// One thread's observed state at a sample instant. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub thread_name: String,
    #[serde(default)]
    pub state: ThreadState,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
    #[serde(default)]
    pub locked_monitors: Vec<LockEvent>,
    #[serde(default)]
    pub locked_synchronizers: Vec<LockEvent>,
    #[serde(default)]
    pub waiting_on: Option<LockEvent>,
    /// Monotonic sample time
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ThreadSnapshot {
    pub fn new(
        thread_id: ThreadId,
        thread_name: impl Into<String>,
        state: ThreadState,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            thread_id,
            thread_name: thread_name.into(),
            state,
            stack: Vec::new(),
            locked_monitors: Vec::new(),
            locked_synchronizers: Vec::new(),
            waiting_on: None,
            timestamp_ms,
        }
    }

    pub fn with_stack(mut self, stack: Vec<StackFrame>) -> Self {
        self.stack = stack;
        self
    }

    pub fn holding(mut self, lock: LockEvent) -> Self {
        match lock.kind {
            LockKind::Monitor => self.locked_monitors.push(lock),
            LockKind::Synchronizer => self.locked_synchronizers.push(lock),
        }
        self
    }

    pub fn waiting_on(mut self, lock: LockEvent) -> Self {
        self.waiting_on = Some(lock);
        self
    }

    pub fn is_blocked(&self) -> bool {
        self.state.is_blocked()
    }

    pub fn held_lock_count(&self) -> usize {
        self.locked_monitors.len()
            + self.locked_synchronizers.len()
            + usize::from(self.waiting_on.is_some())
    }

    /// Owned monitors followed by owned synchronizers
    pub fn owned_locks(&self) -> impl Iterator<Item = &LockEvent> {
        self.locked_monitors
            .iter()
            .chain(self.locked_synchronizers.iter())
    }

    pub fn stack_key(&self) -> StackKey {
        StackKey::from_frames(&self.stack)
    }
}

impl fmt::Display for ThreadSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}] state={:?} heldLocks={} waitingOn={}",
            self.thread_id,
            self.thread_name,
            self.state,
            self.held_lock_count(),
            self.waiting_on
                .as_ref()
                .map(|lock| lock.lock_name.as_str())
                .unwrap_or("none")
        )
    }
}

/// Owner ids arrive as `null`, as a negative sentinel or as an unsigned id
/// where `0` means "not owned".
mod owner_id {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawOwner {
        Id(u64),
        Signed(i64),
    }

    pub fn serialize<S: Serializer>(value: &Option<ThreadId>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(id) => serializer.serialize_u64(*id),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ThreadId>, D::Error> {
        let raw: Option<RawOwner> = Option::deserialize(deserializer)?;
        Ok(match raw {
            Some(RawOwner::Id(id)) if id > 0 => Some(id),
            Some(RawOwner::Signed(id)) if id > 0 => Some(id as ThreadId),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn held_lock_count_includes_waiting_lock() {
        let snapshot = ThreadSnapshot::new(7, "worker-7", ThreadState::Blocked, 100)
            .holding(LockEvent::new("a", "A", LockKind::Monitor).owned_by(7, "worker-7"))
            .holding(LockEvent::new("b", "B", LockKind::Synchronizer).owned_by(7, "worker-7"))
            .waiting_on(LockEvent::new("c", "C", LockKind::Monitor).owned_by(3, "worker-3"));

        assert_eq!(snapshot.held_lock_count(), 3);
        assert_eq!(snapshot.owned_locks().count(), 2);
        assert!(snapshot.is_blocked());
    }

    #[test]
    fn sentinel_owner_decodes_as_unowned() {
        let json = r#"{"lock_id":"L","owner_thread_id":-1}"#;
        let event: LockEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.owner_thread_id, None);
        assert!(!event.is_owned());

        let json = r#"{"lock_id":"L","owner_thread_id":0}"#;
        let event: LockEvent = serde_json::from_str(json).unwrap();
        assert!(!event.is_owned());

        let json = r#"{"lock_id":"L","owner_thread_id":42}"#;
        let event: LockEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.owner(), Some(42));
    }

    #[test]
    fn owner_ids_above_signed_range_survive_encoding() {
        let event = LockEvent::new("L", "L", LockKind::Monitor).owned_by(u64::MAX, "t");
        let decoded: LockEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(decoded.owner(), Some(u64::MAX));

        let json = r#"{"lock_id":"L","owner_thread_id":null}"#;
        let event: LockEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.owner(), None);
    }

    #[test]
    fn partial_snapshot_defaults_missing_fields() {
        let json = r#"{"thread_id":9}"#;
        let snapshot: ThreadSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.thread_name, "");
        assert_eq!(snapshot.state, ThreadState::Runnable);
        assert!(snapshot.stack.is_empty());
        assert!(snapshot.waiting_on.is_none());
        assert_eq!(snapshot.held_lock_count(), 0);
    }

    #[test]
    fn stack_key_renders_frames() {
        let key = StackKey::from_frames(&[
            StackFrame::new("bank", "transfer").at("bank.rs", 42),
            StackFrame::new("", "main"),
        ]);
        assert_eq!(key.frames(), &["bank::transfer (bank.rs:42)", "main"]);
        assert_eq!(key.top(), Some("bank::transfer (bank.rs:42)"));
    }
}
