use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// One delivered record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Named, keyed, partitioned publish/subscribe channel with consumer groups
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, key: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Join `group` on `channel`; members of one group share its partitions
    async fn subscribe(&self, channel: &str, group: &str) -> TransportResult<Box<dyn Subscription>>;

    /// Wait until everything published so far is delivered to the channel
    async fn flush(&self, timeout: Duration) -> TransportResult<()>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for records; an empty batch means none arrived
    async fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<Message>>;

    /// Commit what has been consumed and leave the group
    async fn close(&mut self);
}

#[derive(Default)]
struct GroupState {
    /// Next offset to deliver, per partition
    committed: Vec<u64>,
    members: Vec<u64>,
}

struct ChannelState {
    partitions: Vec<Vec<Message>>,
    groups: HashMap<String, GroupState>,
}

impl ChannelState {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
            groups: HashMap::new(),
        }
    }
}

struct Broker {
    partitions: u32,
    auto_create: bool,
    max_poll_records: usize,
    channels: Mutex<HashMap<String, ChannelState>>,
    published: Notify,
    closed: AtomicBool,
    next_member: AtomicU64,
}

impl Broker {
    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn with_channel<T>(
        &self,
        channel: &str,
        f: impl FnOnce(&mut ChannelState) -> T,
    ) -> TransportResult<T> {
        let mut channels = self.channels.lock();
        if !channels.contains_key(channel) {
            if !self.auto_create {
                return Err(TransportError::UnknownChannel(channel.to_string()));
            }
            channels.insert(channel.to_string(), ChannelState::new(self.partitions));
        }
        match channels.get_mut(channel) {
            Some(state) => Ok(f(state)),
            None => Err(TransportError::UnknownChannel(channel.to_string())),
        }
    }

    fn leave(&self, channel: &str, group: &str, member: u64) {
        let mut channels = self.channels.lock();
        if let Some(group) = channels
            .get_mut(channel)
            .and_then(|state| state.groups.get_mut(group))
        {
            group.members.retain(|m| *m != member);
        }
    }
}

fn partition_for(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

/// In-process broker.
///
/// Records are routed to partitions by key hash, so one key is always
/// delivered in publish order. Partitions are assigned round-robin over the
/// sorted members of a group and reassigned whenever a member joins or leaves.
/// Offsets are committed on the next poll or on close, so a member that
/// disappears without closing has its last batch redelivered.
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

impl MemoryTransport {
    /// Channels are created on first use
    pub fn new(partitions: u32) -> Self {
        Self::build(partitions, true, DEFAULT_MAX_POLL_RECORDS)
    }

    /// Only channels created through `create_channel` exist
    pub fn strict(partitions: u32) -> Self {
        Self::build(partitions, false, DEFAULT_MAX_POLL_RECORDS)
    }

    /// Auto-creating transport delivering at most `max_poll_records` per poll
    pub fn with_max_poll_records(partitions: u32, max_poll_records: usize) -> Self {
        Self::build(partitions, true, max_poll_records)
    }

    fn build(partitions: u32, auto_create: bool, max_poll_records: usize) -> Self {
        Self {
            broker: Arc::new(Broker {
                partitions: partitions.max(1),
                auto_create,
                max_poll_records: max_poll_records.max(1),
                channels: Mutex::new(HashMap::new()),
                published: Notify::new(),
                closed: AtomicBool::new(false),
                next_member: AtomicU64::new(1),
            }),
        }
    }

    pub fn create_channel(&self, channel: &str) {
        self.broker
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| ChannelState::new(self.broker.partitions));
    }

    /// Records published to `channel` and not yet delivered to `group`
    pub fn lag(&self, channel: &str, group: &str) -> u64 {
        let channels = self.broker.channels.lock();
        let Some(state) = channels.get(channel) else {
            return 0;
        };
        state
            .partitions
            .iter()
            .enumerate()
            .map(|(partition, log)| {
                let committed = state
                    .groups
                    .get(group)
                    .and_then(|g| g.committed.get(partition).copied())
                    .unwrap_or(0);
                (log.len() as u64).saturating_sub(committed)
            })
            .sum()
    }

    pub fn members(&self, channel: &str, group: &str) -> usize {
        self.broker
            .channels
            .lock()
            .get(channel)
            .and_then(|state| state.groups.get(group))
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    /// Fail every further operation with `TransportError::Closed`
    pub fn close(&self) {
        self.broker.closed.store(true, Ordering::Release);
        self.broker.published.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.broker.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, channel: &str, key: &str, payload: Vec<u8>) -> TransportResult<()> {
        self.broker.check_open()?;
        let partition = partition_for(key, self.broker.partitions);
        self.broker.with_channel(channel, |state| {
            let log = &mut state.partitions[partition as usize];
            log.push(Message {
                channel: channel.to_string(),
                partition,
                offset: log.len() as u64,
                key: key.to_string(),
                payload,
            });
        })?;
        self.broker.published.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, channel: &str, group: &str) -> TransportResult<Box<dyn Subscription>> {
        self.broker.check_open()?;
        let member = self.broker.next_member.fetch_add(1, Ordering::Relaxed);
        let partitions = self.broker.partitions as usize;
        self.broker.with_channel(channel, |state| {
            let group = state.groups.entry(group.to_string()).or_default();
            group.committed.resize(partitions, 0);
            group.members.push(member);
            group.members.sort_unstable();
        })?;
        tracing::debug!("Member {} joined group {} on {}", member, group, channel);

        Ok(Box::new(MemorySubscription {
            broker: Arc::clone(&self.broker),
            channel: channel.to_string(),
            group: group.to_string(),
            member,
            uncommitted: Vec::new(),
            left: false,
        }))
    }

    async fn flush(&self, _timeout: Duration) -> TransportResult<()> {
        // publishes land in the log synchronously
        self.broker.check_open()
    }
}

struct MemorySubscription {
    broker: Arc<Broker>,
    channel: String,
    group: String,
    member: u64,
    /// (partition, next offset) delivered by the last poll
    uncommitted: Vec<(usize, u64)>,
    left: bool,
}

impl MemorySubscription {
    /// Commit the previous batch, then take the next one from assigned partitions
    fn fetch(&mut self) -> TransportResult<Vec<Message>> {
        let member = self.member;
        let max = self.broker.max_poll_records;
        let uncommitted = std::mem::take(&mut self.uncommitted);
        let group_name = self.group.clone();

        let (messages, delivered) = self.broker.with_channel(&self.channel, |state| {
            let Some(group) = state.groups.get_mut(&group_name) else {
                return (Vec::new(), Vec::new());
            };
            for (partition, next) in uncommitted {
                if let Some(committed) = group.committed.get_mut(partition) {
                    *committed = (*committed).max(next);
                }
            }

            let Some(slot) = group.members.iter().position(|m| *m == member) else {
                return (Vec::new(), Vec::new());
            };
            let stride = group.members.len();
            let mut messages = Vec::new();
            let mut delivered = Vec::new();
            for (partition, log) in state.partitions.iter().enumerate() {
                if partition % stride != slot || messages.len() >= max {
                    continue;
                }
                let start = group.committed[partition] as usize;
                let take = (max - messages.len()).min(log.len().saturating_sub(start));
                if take == 0 {
                    continue;
                }
                messages.extend_from_slice(&log[start..start + take]);
                delivered.push((partition, (start + take) as u64));
            }
            (messages, delivered)
        })?;

        self.uncommitted = delivered;
        Ok(messages)
    }

    fn leave(&mut self) {
        if !self.left {
            self.left = true;
            self.broker.leave(&self.channel, &self.group, self.member);
            tracing::debug!("Member {} left group {} on {}", self.member, self.group, self.channel);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> TransportResult<Vec<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let broker = Arc::clone(&self.broker);
            let notified = broker.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.broker.check_open()?;
            if self.left {
                return Err(TransportError::Closed);
            }
            let messages = self.fetch()?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(&mut self) {
        if self.left {
            return;
        }
        let uncommitted = std::mem::take(&mut self.uncommitted);
        let group_name = self.group.clone();
        let _ = self.broker.with_channel(&self.channel, |state| {
            if let Some(group) = state.groups.get_mut(&group_name) {
                for (partition, next) in uncommitted {
                    if let Some(committed) = group.committed.get_mut(partition) {
                        *committed = (*committed).max(next);
                    }
                }
            }
        });
        self.leave();
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn keys_keep_publish_order() {
        let transport = MemoryTransport::new(4);
        for i in 0..10u8 {
            transport.publish("snapshots", "42", vec![i]).await.unwrap();
        }
        let mut subscription = transport.subscribe("snapshots", "g").await.unwrap();
        let messages = subscription.poll(SHORT).await.unwrap();
        let payloads: Vec<u8> = messages.iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, (0..10).collect::<Vec<_>>());
        assert!(messages.iter().all(|m| m.partition == messages[0].partition));
    }

    #[tokio::test]
    async fn group_members_split_partitions() {
        let transport = MemoryTransport::new(4);
        let mut first = transport.subscribe("c", "g").await.unwrap();
        let mut second = transport.subscribe("c", "g").await.unwrap();
        assert_eq!(transport.members("c", "g"), 2);

        for key in 0..40 {
            transport.publish("c", &key.to_string(), vec![]).await.unwrap();
        }
        let a = first.poll(SHORT).await.unwrap();
        let b = second.poll(SHORT).await.unwrap();
        assert_eq!(a.len() + b.len(), 40);
        assert!(a.iter().all(|m| m.partition % 2 == 0));
        assert!(b.iter().all(|m| m.partition % 2 == 1));

        first.close().await;
        second.close().await;
        assert_eq!(transport.lag("c", "g"), 0);
        assert_eq!(transport.members("c", "g"), 0);
    }

    #[tokio::test]
    async fn separate_groups_each_see_everything() {
        let transport = MemoryTransport::new(2);
        let mut one = transport.subscribe("c", "g1").await.unwrap();
        let mut two = transport.subscribe("c", "g2").await.unwrap();
        for key in 0..5 {
            transport.publish("c", &key.to_string(), vec![]).await.unwrap();
        }
        assert_eq!(one.poll(SHORT).await.unwrap().len(), 5);
        assert_eq!(two.poll(SHORT).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn unclosed_member_batch_is_redelivered() {
        let transport = MemoryTransport::new(1);
        transport.publish("c", "1", vec![7]).await.unwrap();

        let mut crashed = transport.subscribe("c", "g").await.unwrap();
        assert_eq!(crashed.poll(SHORT).await.unwrap().len(), 1);
        drop(crashed);

        let mut replacement = transport.subscribe("c", "g").await.unwrap();
        let redelivered = replacement.poll(SHORT).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload, vec![7]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poll_wakes_on_publish() {
        let transport = MemoryTransport::new(1);
        let mut subscription = transport.subscribe("c", "g").await.unwrap();
        let publisher = transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("c", "k", vec![1]).await.unwrap();
        });
        let messages = subscription.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let transport = MemoryTransport::new(1);
        let mut subscription = transport.subscribe("c", "g").await.unwrap();
        assert!(subscription.poll(SHORT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_transport_rejects_unknown_channels() {
        let transport = MemoryTransport::strict(1);
        let err = transport.publish("missing", "k", vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownChannel(ref c) if c == "missing"));

        transport.create_channel("present");
        assert!(transport.publish("present", "k", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn closed_transport_is_fatal() {
        let transport = MemoryTransport::new(1);
        let mut subscription = transport.subscribe("c", "g").await.unwrap();
        transport.close();
        let err = subscription.poll(SHORT).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            transport.publish("c", "k", vec![]).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn poll_respects_max_records() {
        let transport = MemoryTransport::with_max_poll_records(1, 3);
        for i in 0..5u8 {
            transport.publish("c", "k", vec![i]).await.unwrap();
        }
        let mut subscription = transport.subscribe("c", "g").await.unwrap();
        assert_eq!(subscription.poll(SHORT).await.unwrap().len(), 3);
        assert_eq!(subscription.poll(SHORT).await.unwrap().len(), 2);
        subscription.close().await;
        assert_eq!(transport.lag("c", "g"), 0);
    }
}
