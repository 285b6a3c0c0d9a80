use crate::snapshot::ThreadSnapshot;
use anyhow::Result;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded lock-free queue between the sampler and the processing task
pub struct SnapshotCapture {
    sender: Sender<Arc<ThreadSnapshot>>,
    receiver: Receiver<Arc<ThreadSnapshot>>,
    dropped: AtomicU64,
}

impl SnapshotCapture {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, receiver) = bounded(buffer_size.max(1));
        Self {
            sender,
            receiver,
            dropped: AtomicU64::new(0),
        }
    }

    /// Capture a snapshot (non-blocking); a full queue drops it
    pub fn capture(&self, snapshot: Arc<ThreadSnapshot>) -> Result<()> {
        self.sender.try_send(snapshot).map_err(|e| {
            if matches!(e, TrySendError::Full(_)) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            anyhow::anyhow!("Failed to capture snapshot: {}", e)
        })
    }

    /// Drain up to `max` pending snapshots
    pub fn drain_batch(&self, max: usize) -> Vec<Arc<ThreadSnapshot>> {
        self.receiver.try_iter().take(max).collect()
    }

    /// Drain all pending snapshots
    pub fn drain(&self) -> Vec<Arc<ThreadSnapshot>> {
        self.receiver.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ThreadState;

    fn snapshot(thread: u64) -> Arc<ThreadSnapshot> {
        Arc::new(ThreadSnapshot::new(thread, "worker", ThreadState::Runnable, 0))
    }

    #[test]
    fn test_snapshot_capture() {
        let capture = SnapshotCapture::new(1000);
        assert!(capture.capture(snapshot(1)).is_ok());
        let snapshots = capture.drain();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(capture.pending(), 0);
    }

    #[test]
    fn test_full_queue_drops() {
        let capture = SnapshotCapture::new(2);
        assert!(capture.capture(snapshot(1)).is_ok());
        assert!(capture.capture(snapshot(2)).is_ok());
        assert!(capture.capture(snapshot(3)).is_err());
        assert_eq!(capture.dropped(), 1);

        let batch = capture.drain_batch(1);
        assert_eq!(batch[0].thread_id, 1);
        assert_eq!(capture.pending(), 1);
    }
}
