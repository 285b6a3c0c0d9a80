//! Publish/subscribe distribution of thread snapshots between processes.
//!
//! A [`SnapshotProducer`] publishes each snapshot keyed by thread id; one or
//! more [`SnapshotConsumer`]s in a consumer group feed them into a shared
//! [`AccumulatorRegistry`](crate::accumulator::AccumulatorRegistry).

pub mod consumer;
pub mod producer;
pub mod transport;

pub use consumer::{ConsumerCounts, ConsumerHandle, ConsumerStats, SnapshotConsumer};
pub use producer::{ErrorCallback, ProducerCounts, ProducerStats, SnapshotProducer};
pub use transport::{MemoryTransport, Message, Subscription, Transport};

use crate::error::TransportResult;
use crate::snapshot::ThreadSnapshot;

/// Message key for a snapshot: its thread id in decimal
pub fn snapshot_key(snapshot: &ThreadSnapshot) -> String {
    snapshot.thread_id.to_string()
}

pub fn encode_snapshot(snapshot: &ThreadSnapshot) -> TransportResult<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

pub fn decode_snapshot(payload: &[u8]) -> TransportResult<ThreadSnapshot> {
    Ok(serde_json::from_slice(payload)?)
}
