//! Packet pipeline: the stage sequence every packet passes through --
//! Receive -> Decode+ReplayCheck -> DelayAssign -> BatchAccumulate -> Forward.
//!
//! Workers pull from a bounded input channel (backpressure surfaces to the
//! caller of [`PacketPipeline::submit`] as a queue-full error), peel one
//! Sphinx layer, and hand a [`pool::PipelineSlot`] carrying its assigned
//! deadline straight to the adaptive batcher -- DelayAssign never blocks
//! the worker itself, only the slot's eligibility to flush. A separate
//! flush task polls the batcher and drains completed batches into the
//! pipeline's output queues for the transport layer to pick up, and a
//! third task evicts expired replay-cache entries on a timer.
//!
//! Cover packets (see `crate::cover`) are counted and consumed at this hop
//! rather than relayed further: modeling cover-traffic relay chains across
//! multiple hops is out of scope here.

pub mod batching;
pub mod pool;
pub mod replay;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core::reputation::{ReputationAction, ReputationEngine};
use crate::crypto::sphinx::{NextHop, SphinxError, SphinxProcessor};
use crate::utils::packet::Packet;
use crate::utils::timing_defense::{TimingDefenseConfig, TimingDefenseManager};
use crate::vrf::poisson_delay::DelayInjector;
use crate::{MixnodeError, Result};

pub use batching::{
    AdaptiveBatchProcessor, AdaptiveBatchingConfig, BatchingStats, BatchingStrategy, FlushTrigger,
};
pub use pool::{PipelineSlot, Stage};

use pool::MemoryPool;
use replay::ReplayCache;

/// How often the replay cache evicts entries past its window.
const REPLAY_EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Recent per-packet latencies kept to compute `p99_latency_ms`.
const LATENCY_SAMPLE_WINDOW: usize = 4096;

/// Why a packet never made it to forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Malformed,
    Replay,
    AuthFailure,
    QueueFull,
    Backpressure,
}

impl From<SphinxError> for DropReason {
    fn from(e: SphinxError) -> Self {
        match e {
            SphinxError::Malformed(_) => DropReason::Malformed,
            SphinxError::AuthFailure => DropReason::AuthFailure,
            SphinxError::Replay => DropReason::Replay,
        }
    }
}

/// Counts of dropped packets broken out by [`DropReason`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DroppedByReason {
    pub malformed: u64,
    pub replay: u64,
    pub auth_failure: u64,
    pub queue_full: u64,
    pub backpressure: u64,
}

/// Atomics-backed statistics; cheap to read from any task.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub packets_submitted: AtomicU64,
    pub packets_processed: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub packets_dropped: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_replay: AtomicU64,
    dropped_auth_failure: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_backpressure: AtomicU64,
    total_processing_time_ns: AtomicU64,
    recent_latencies_ns: Mutex<VecDeque<u64>>,
}

impl PipelineStats {
    fn record_submitted(&self) {
        self.packets_submitted.fetch_add(1, Ordering::Relaxed);
    }

    async fn record_processed(&self, elapsed: Duration) {
        self.packets_processed.fetch_add(1, Ordering::Relaxed);
        let elapsed_ns = elapsed.as_nanos() as u64;
        self.total_processing_time_ns
            .fetch_add(elapsed_ns, Ordering::Relaxed);

        let mut recent = self.recent_latencies_ns.lock().await;
        recent.push_back(elapsed_ns);
        if recent.len() > LATENCY_SAMPLE_WINDOW {
            recent.pop_front();
        }
    }

    fn record_dropped(&self, reason: DropReason) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Replay => &self.dropped_replay,
            DropReason::AuthFailure => &self.dropped_auth_failure,
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::Backpressure => &self.dropped_backpressure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_forwarded(&self, count: u64) {
        self.packets_forwarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn avg_processing_time_ns(&self) -> u64 {
        let processed = self.packets_processed.load(Ordering::Relaxed);
        if processed == 0 {
            return 0;
        }
        self.total_processing_time_ns.load(Ordering::Relaxed) / processed
    }

    pub fn dropped_by_reason(&self) -> DroppedByReason {
        DroppedByReason {
            malformed: self.dropped_malformed.load(Ordering::Relaxed),
            replay: self.dropped_replay.load(Ordering::Relaxed),
            auth_failure: self.dropped_auth_failure.load(Ordering::Relaxed),
            queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
        }
    }

    /// 99th-percentile latency over the most recent [`LATENCY_SAMPLE_WINDOW`]
    /// processed packets, in milliseconds.
    pub async fn p99_latency_ms(&self) -> f64 {
        let mut samples: Vec<u64> = self.recent_latencies_ns.lock().await.iter().copied().collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_unstable();
        let idx = ((samples.len() as f64) * 0.99).ceil() as usize;
        let idx = idx.saturating_sub(1).min(samples.len() - 1);
        samples[idx] as f64 / 1_000_000.0
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.packets_processed.load(Ordering::Relaxed),
            self.packets_forwarded.load(Ordering::Relaxed),
            self.packets_dropped.load(Ordering::Relaxed),
        )
    }
}

/// A packet routed to a concrete next hop, ready for the transport layer.
pub struct ForwardedPacket {
    pub next_hop: SocketAddr,
    pub payload: Bytes,
}

/// A peeled payload with nowhere further to go: delivered locally.
pub struct DeliveredPacket {
    pub payload: Bytes,
}

/// Configuration for a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub max_queue_depth: usize,
    pub pool_max: usize,
    pub mean_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queue_depth: 4096,
            pool_max: 1024,
            mean_delay: Duration::from_millis(200),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(2000),
        }
    }
}

/// The packet pipeline: owns the worker pool, memory pool, replay cache,
/// delay injector, and adaptive batcher, and exposes `submit`/`shutdown`.
pub struct PacketPipeline {
    config: PipelineConfig,
    input_tx: mpsc::Sender<(Bytes, SocketAddr)>,
    input_rx: Arc<Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>>,
    output: Arc<Mutex<std::collections::VecDeque<ForwardedPacket>>>,
    delivered: Arc<Mutex<std::collections::VecDeque<DeliveredPacket>>>,
    pool: Arc<MemoryPool>,
    replay_cache: Arc<ReplayCache>,
    sphinx: Arc<SphinxProcessor>,
    delay_injector: Arc<Mutex<DelayInjector>>,
    timing_defense: Arc<TimingDefenseManager>,
    batcher: Arc<AdaptiveBatchProcessor>,
    reputation: Arc<Mutex<ReputationEngine>>,
    stats: Arc<PipelineStats>,
    shutdown: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PacketPipeline {
    pub fn new(sphinx: SphinxProcessor, config: PipelineConfig) -> Result<Self> {
        let (input_tx, input_rx) = mpsc::channel(config.max_queue_depth);
        let batcher = AdaptiveBatchProcessor::new(AdaptiveBatchingConfig::default())?;
        let delay_injector =
            DelayInjector::new(config.mean_delay, config.min_delay, config.max_delay)?;

        Ok(Self {
            input_tx,
            input_rx: Arc::new(Mutex::new(input_rx)),
            output: Arc::new(Mutex::new(std::collections::VecDeque::new())),
            delivered: Arc::new(Mutex::new(std::collections::VecDeque::new())),
            pool: Arc::new(MemoryPool::new(config.pool_max)),
            replay_cache: Arc::new(ReplayCache::new()),
            sphinx: Arc::new(sphinx),
            delay_injector: Arc::new(Mutex::new(delay_injector)),
            timing_defense: Arc::new(TimingDefenseManager::new(TimingDefenseConfig::default())),
            batcher: Arc::new(batcher),
            reputation: Arc::new(Mutex::new(ReputationEngine::new())),
            stats: Arc::new(PipelineStats::default()),
            shutdown: Arc::new(Notify::new()),
            config,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Shared handle to the reputation engine this pipeline feeds
    /// observations into, so a caller (e.g. `MixNode`) can persist or
    /// inspect it alongside the relay lottery.
    pub fn reputation_handle(&self) -> Arc<Mutex<ReputationEngine>> {
        Arc::clone(&self.reputation)
    }

    /// Shared handle to the timing defense manager tracking this pipeline's
    /// per-hop delay randomization, for callers that want to inspect
    /// resistance metrics (e.g. a metrics-export task).
    pub fn timing_defense_handle(&self) -> Arc<TimingDefenseManager> {
        Arc::clone(&self.timing_defense)
    }

    /// Spawn the worker tasks and the batch-flush task. Safe to call
    /// through a shared `Arc<PacketPipeline>` since the handle list is
    /// itself behind a lock.
    pub async fn start(&self) -> Result<()> {
        for worker_id in 0..self.config.workers.max(1) {
            let input_rx = Arc::clone(&self.input_rx);
            let sphinx = Arc::clone(&self.sphinx);
            let replay_cache = Arc::clone(&self.replay_cache);
            let delay_injector = Arc::clone(&self.delay_injector);
            let timing_defense = Arc::clone(&self.timing_defense);
            let batcher = Arc::clone(&self.batcher);
            let pool = Arc::clone(&self.pool);
            let reputation = Arc::clone(&self.reputation);
            let stats = Arc::clone(&self.stats);
            let shutdown = Arc::clone(&self.shutdown);

            let handle = tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = input_rx.lock().await;
                        tokio::select! {
                            packet = rx.recv() => packet,
                            _ = shutdown.notified() => None,
                        }
                    };

                    let Some((raw, source)) = next else {
                        break;
                    };

                    let started = Instant::now();
                    match process_one(
                        raw,
                        source,
                        &sphinx,
                        &replay_cache,
                        &delay_injector,
                        &timing_defense,
                        &batcher,
                        &pool,
                        &reputation,
                    )
                    .await
                    {
                        Ok(()) => stats.record_processed(started.elapsed()).await,
                        Err(reason) => {
                            debug!(worker_id, ?reason, "packet dropped");
                            stats.record_dropped(reason);
                        }
                    }
                }
            });
            self.handles.lock().await.push(handle);
        }

        let batcher = Arc::clone(&self.batcher);
        let pool = Arc::clone(&self.pool);
        let output = Arc::clone(&self.output);
        let delivered = Arc::clone(&self.delivered);
        let stats = Arc::clone(&self.stats);
        let shutdown = Arc::clone(&self.shutdown);
        let flush_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => break,
                }
                if let Ok(Some(batch)) = batcher.maybe_flush().await {
                    let mut forwarded = 0u64;
                    for slot in batch {
                        let next_hop = slot.next_hop;
                        let payload = Bytes::copy_from_slice(slot.payload());
                        match next_hop {
                            NextHop::Terminal => {
                                delivered.lock().await.push_back(DeliveredPacket { payload });
                            }
                            NextHop::Forward(addr) => {
                                output
                                    .lock()
                                    .await
                                    .push_back(ForwardedPacket { next_hop: addr, payload });
                            }
                        }
                        forwarded += 1;
                        pool.release_slot(slot).await;
                    }
                    stats.record_forwarded(forwarded);
                }
            }
        });
        self.handles.lock().await.push(flush_handle);

        let replay_cache = Arc::clone(&self.replay_cache);
        let shutdown = Arc::clone(&self.shutdown);
        let eviction_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REPLAY_EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.notified() => break,
                }
                replay_cache.evict_expired().await;
            }
        });
        self.handles.lock().await.push(eviction_handle);

        Ok(())
    }

    /// Enqueue a raw wire packet received from `source`; returns an error
    /// if every worker is already backed up to `max_queue_depth`.
    pub async fn submit(&self, raw: Bytes, source: SocketAddr) -> Result<()> {
        match self.input_tx.try_send((raw, source)) {
            Ok(()) => {
                self.stats.record_submitted();
                Ok(())
            }
            Err(_) => {
                self.stats.record_dropped(DropReason::QueueFull);
                Err(MixnodeError::Packet("queue full".into()))
            }
        }
    }

    pub async fn drain_forwarded(&self, max: usize) -> Vec<ForwardedPacket> {
        let mut output = self.output.lock().await;
        let n = output.len().min(max);
        output.drain(..n).collect()
    }

    pub async fn drain_delivered(&self, max: usize) -> Vec<DeliveredPacket> {
        let mut delivered = self.delivered.lock().await;
        let n = delivered.len().min(max);
        delivered.drain(..n).collect()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn memory_pool_stats(&self) -> (u64, u64) {
        self.pool.stats()
    }

    pub fn pool_hit_rate(&self) -> f64 {
        self.pool.hit_rate()
    }

    pub async fn set_load(&self, load: f64) {
        self.batcher.update_network_load(load).await;
        self.delay_injector.lock().await.set_load(load);
    }

    /// Stop accepting work and wait for in-flight workers to drain.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn process_one(
    raw: Bytes,
    source: SocketAddr,
    sphinx: &SphinxProcessor,
    replay_cache: &ReplayCache,
    delay_injector: &Mutex<DelayInjector>,
    timing_defense: &TimingDefenseManager,
    batcher: &AdaptiveBatchProcessor,
    pool: &MemoryPool,
    reputation: &Mutex<ReputationEngine>,
) -> std::result::Result<(), DropReason> {
    let packet = Packet::decode(raw).map_err(|_| DropReason::Malformed)?;
    if packet.is_cover() {
        // Cover traffic terminates here; it exists to be observed, not relayed.
        return Ok(());
    }

    let peeled = sphinx.process(&packet.data).map_err(DropReason::from)?;

    if !replay_cache.check_and_insert(peeled.replay_tag).await {
        return Err(DropReason::Replay);
    }

    if let NextHop::Forward(addr) = peeled.next_hop {
        let mut rep = reputation.lock().await;
        rep.observe(addr);
        rep.apply(addr, ReputationAction::SuccessfulTask);
    }

    let circuit_id = u64::from_be_bytes(peeled.replay_tag[..8].try_into().unwrap());
    let base_delay = delay_injector.lock().await.next_delay(circuit_id);
    let delay = timing_defense.randomize_delay(base_delay).await;
    timing_defense
        .record_packet_timing(circuit_id, peeled.inner.len(), base_delay, delay)
        .await;
    let total_delay = match timing_defense.mask_burst_pattern().await {
        Some(burst_delay) => delay + burst_delay,
        None => delay,
    };

    // DelayAssign never blocks the worker: the deadline travels with the
    // slot, and the batcher's own flush task is what waits on it.
    let deadline = Instant::now() + total_delay;
    let slot = pool
        .acquire_slot(peeled.next_hop, &peeled.inner, source, deadline)
        .await;

    batcher
        .submit_packet(slot)
        .await
        .map_err(|_| DropReason::Backpressure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::crypto::{derive_shared_secret, seal};
    use bytes::{BufMut, BytesMut};
    use rand_core::OsRng;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn test_source() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn build_terminal_packet(recipient_public: &PublicKey) -> Bytes {
        let ephemeral_secret = StaticSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);
        let shared = derive_shared_secret(&ephemeral_secret, recipient_public);
        let aad = [crate::MIXNODE_VERSION, 0u8];
        let ciphertext = seal(&shared, &aad, b"payload").unwrap();
        let replay_tag = crate::crypto::sphinx::replay_tag_for(&ephemeral_public, &ciphertext);

        let mut sphinx_layer = BytesMut::new();
        sphinx_layer.put_u8(crate::MIXNODE_VERSION);
        sphinx_layer.put_slice(ephemeral_public.as_bytes());
        sphinx_layer.put_u8(0);
        sphinx_layer.put_slice(&replay_tag);
        sphinx_layer.put_slice(&ciphertext);

        let wire_packet = Packet::data(sphinx_layer.freeze(), 0);
        wire_packet.encode().unwrap()
    }

    #[tokio::test]
    async fn submit_then_process_delivers_terminal_packet() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let sphinx = SphinxProcessor::new(secret);

        let config = PipelineConfig {
            workers: 1,
            min_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(5),
            mean_delay: Duration::from_millis(1),
            ..PipelineConfig::default()
        };

        let mut pipeline = PacketPipeline::new(sphinx, config).unwrap();
        pipeline.start().await.unwrap();

        let raw = build_terminal_packet(&public);
        pipeline.submit(raw, test_source()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let delivered = pipeline.drain_delivered(10).await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(&delivered[0].payload[..], b"payload");

        assert_eq!(pipeline.stats().packets_submitted.load(Ordering::Relaxed), 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_packet_is_dropped_and_counted() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let sphinx = SphinxProcessor::new(secret);
        let config = PipelineConfig {
            workers: 1,
            ..PipelineConfig::default()
        };

        let mut pipeline = PacketPipeline::new(sphinx, config).unwrap();
        pipeline.start().await.unwrap();

        pipeline
            .submit(Bytes::from_static(b"\x01\x00\x00\x00\x00"), test_source())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (_, _, dropped) = pipeline.stats().snapshot();
        assert_eq!(dropped, 1);
        assert_eq!(pipeline.stats().dropped_by_reason().malformed, 1);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn processed_packets_feed_the_timing_defense_history() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let sphinx = SphinxProcessor::new(secret);

        let config = PipelineConfig {
            workers: 1,
            min_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(5),
            mean_delay: Duration::from_millis(1),
            ..PipelineConfig::default()
        };

        let mut pipeline = PacketPipeline::new(sphinx, config).unwrap();
        pipeline.start().await.unwrap();
        let timing_defense = pipeline.timing_defense_handle();

        for _ in 0..5 {
            let raw = build_terminal_packet(&public);
            pipeline.submit(raw, test_source()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = timing_defense.get_timing_stats().await;
        assert!(stats.entropy >= 0.0);
        assert!(pipeline.stats().p99_latency_ms().await >= 0.0);

        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn buffers_are_recycled_through_the_memory_pool_on_the_real_path() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let sphinx = SphinxProcessor::new(secret);

        let config = PipelineConfig {
            workers: 1,
            min_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(1),
            mean_delay: Duration::from_millis(0),
            ..PipelineConfig::default()
        };

        let mut pipeline = PacketPipeline::new(sphinx, config).unwrap();
        pipeline.start().await.unwrap();

        for _ in 0..5 {
            let raw = build_terminal_packet(&public);
            pipeline.submit(raw, test_source()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (_allocated, reused) = pipeline.memory_pool_stats();
        assert!(reused > 0, "expected at least one recycled buffer, got stats with 0 reuse");
        assert!(pipeline.pool_hit_rate() > 0.0);

        pipeline.shutdown().await.unwrap();
    }
}
