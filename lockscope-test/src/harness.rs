use anyhow::{Context, Result};
use lockscope_core::accumulator::AccumulatorRegistry;
use lockscope_core::graph::WaitForGraph;
use lockscope_core::record::ContentionPolicy;
use lockscope_core::snapshot::ThreadSnapshot;
use lockscope_core::streaming::{
    ConsumerCounts, ConsumerHandle, MemoryTransport, SnapshotConsumer, SnapshotProducer, Transport,
};
use lockscope_core::{Config, LockscopeEngine};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};

/// Feeds the same snapshots to an in-process engine and, over a memory
/// transport, to a consumer group, so both paths can be compared.
pub struct TestPipeline {
    config: Config,
    engine: LockscopeEngine,
    transport: MemoryTransport,
    producer: SnapshotProducer,
    consumers: Vec<ConsumerHandle>,
    registry: Arc<AccumulatorRegistry>,
    graph: Arc<WaitForGraph>,
    pushed: AtomicU64,
}

impl TestPipeline {
    pub async fn new(mut config: Config, consumers: usize) -> Result<Self> {
        config.streaming.enabled = true;
        config.streaming.poll_timeout_ms = 10;
        config.streaming.close_timeout_ms = 2_000;
        config.validate()?;

        let transport = MemoryTransport::new(config.streaming.partitions);
        let shared: Arc<dyn Transport> = Arc::new(transport.clone());
        let registry = Arc::new(AccumulatorRegistry::new(ContentionPolicy::from(
            &config.analysis,
        )));
        let graph = Arc::new(WaitForGraph::new());

        let consumers = (0..consumers.max(1))
            .map(|_| {
                SnapshotConsumer::new(Arc::clone(&shared), &config.streaming, Arc::clone(&registry))
                    .with_graph(Arc::clone(&graph))
                    .spawn()
            })
            .collect();

        Ok(Self {
            engine: LockscopeEngine::new(config.clone()),
            producer: SnapshotProducer::new(shared, &config.streaming),
            config,
            transport,
            consumers,
            registry,
            graph,
            pushed: AtomicU64::new(0),
        })
    }

    pub fn engine(&self) -> &LockscopeEngine {
        &self.engine
    }

    pub fn transport(&self) -> &MemoryTransport {
        &self.transport
    }

    /// Registry fed by the consumer group
    pub fn registry(&self) -> &Arc<AccumulatorRegistry> {
        &self.registry
    }

    /// Wait-for graph fed by the consumer group
    pub fn graph(&self) -> &Arc<WaitForGraph> {
        &self.graph
    }

    /// Ingest locally and publish one sample
    pub fn push(&self, batch: Vec<ThreadSnapshot>) -> Result<()> {
        let batch: Vec<Arc<ThreadSnapshot>> = batch.into_iter().map(Arc::new).collect();
        for snapshot in &batch {
            self.producer
                .send(Arc::clone(snapshot))
                .context("producer rejected snapshot")?;
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
        self.engine.state().ingest_batch(batch);
        Ok(())
    }

    /// Wait until the consumer group has handled everything published so far
    pub async fn settle(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let streaming = &self.config.streaming;
        loop {
            let pushed = self.pushed.load(Ordering::Relaxed);
            let producer = self.producer.stats();
            let sent = producer.sent;
            let received: u64 = self.consumers.iter().map(|c| c.stats().received).sum();
            let lag = self.transport.lag(&streaming.channel, &streaming.consumer_group);
            if producer.sent + producer.failed >= pushed && lag == 0 && received >= sent {
                return Ok(());
            }
            if Instant::now() >= deadline {
                anyhow::bail!("pipeline did not settle: sent {sent}, received {received}, lag {lag}");
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    /// Close the producer, drain the group and stop every consumer
    pub async fn shutdown(self) -> Result<Vec<ConsumerCounts>> {
        let grace = Duration::from_millis(self.config.streaming.close_timeout_ms);
        self.producer.close(grace).await?;
        self.settle(grace).await?;

        let mut counts = Vec::with_capacity(self.consumers.len());
        for consumer in self.consumers {
            let stats = consumer.shared_stats();
            consumer.stop(grace).await?;
            counts.push(stats.counts());
        }
        Ok(counts)
    }
}
