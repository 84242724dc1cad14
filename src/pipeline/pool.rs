//! Bounded memory pool for reusable packet buffers, and the pool-owned
//! [`PipelineSlot`] that carries a packet's scheduling metadata from
//! DelayAssign through the batcher to the transport layer.
//!
//! Backed by a `tokio::sync::Mutex`-guarded free list rather than a
//! lock-free structure: the critical section is a single `Vec::pop`/`push`,
//! and the dependency stack this crate carries forward has no lock-free
//! queue crate, so a mutex matches how the rest of the pipeline already
//! shares state (see `pipeline::batching`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::sync::Mutex;

use crate::crypto::sphinx::NextHop;

const DEFAULT_BUFFER_CAPACITY: usize = 2048;

/// Stage a packet has reached as it moves through the pipeline. Carried on
/// [`PipelineSlot`] so a flush decision or a diagnostics dump can tell where
/// a packet is without re-deriving it from side channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoded,
    DelayAssigned,
    Batched,
    Forwarded,
}

/// A packet's payload plus the scheduling metadata the pipeline threads
/// from DelayAssign through the batcher: when it arrived, the deadline
/// DelayAssign computed for it, who it came from, and which batch (if any)
/// it was released in. The underlying buffer is pool-owned -- callers
/// return it via [`MemoryPool::release_slot`] once the batch has been
/// handed off to the transport layer.
#[derive(Debug)]
pub struct PipelineSlot {
    pub next_hop: NextHop,
    pub buf: BytesMut,
    pub arrival: Instant,
    pub deadline: Instant,
    pub source: SocketAddr,
    pub batch_id: u64,
    pub stage: Stage,
}

impl PipelineSlot {
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }
}

/// A pool of reusable `BytesMut` buffers, bounded to `pool_max` entries.
pub struct MemoryPool {
    free_list: Arc<Mutex<Vec<BytesMut>>>,
    pool_max: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl MemoryPool {
    pub fn new(pool_max: usize) -> Self {
        Self {
            free_list: Arc::new(Mutex::new(Vec::with_capacity(pool_max))),
            pool_max,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take a buffer from the pool, or allocate a fresh one on a miss.
    pub async fn acquire(&self) -> BytesMut {
        let mut free_list = self.free_list.lock().await;
        if let Some(mut buf) = free_list.pop() {
            buf.clear();
            self.reused.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY)
        }
    }

    /// Return a buffer to the pool, dropping it instead if the pool is at
    /// capacity (`pool_max`).
    pub async fn release(&self, buf: BytesMut) {
        let mut free_list = self.free_list.lock().await;
        if free_list.len() < self.pool_max {
            free_list.push(buf);
        }
    }

    /// Acquire a buffer, copy `payload` into it, and wrap it as a slot
    /// carrying the scheduling metadata assigned at DelayAssign.
    pub async fn acquire_slot(
        &self,
        next_hop: NextHop,
        payload: &[u8],
        source: SocketAddr,
        deadline: Instant,
    ) -> PipelineSlot {
        let mut buf = self.acquire().await;
        buf.extend_from_slice(payload);
        PipelineSlot {
            next_hop,
            buf,
            arrival: Instant::now(),
            deadline,
            source,
            batch_id: 0,
            stage: Stage::DelayAssigned,
        }
    }

    /// Return a slot's buffer to the pool once it has been forwarded or
    /// delivered and is no longer needed.
    pub async fn release_slot(&self, slot: PipelineSlot) {
        self.release(slot.buf).await;
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.allocated.load(Ordering::Relaxed),
            self.reused.load(Ordering::Relaxed),
        )
    }

    /// Fraction of `acquire` calls served from the free list rather than
    /// freshly allocated, as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let reused = self.reused.load(Ordering::Relaxed);
        let total = allocated + reused;
        if total == 0 {
            return 0.0;
        }
        (reused as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reused_buffer_counts_as_a_hit() {
        let pool = MemoryPool::new(8);
        let buf = pool.acquire().await;
        pool.release(buf).await;
        let _buf2 = pool.acquire().await;

        let (allocated, reused) = pool.stats();
        assert_eq!(allocated, 1);
        assert_eq!(reused, 1);
    }

    #[tokio::test]
    async fn slot_round_trip_recycles_its_buffer() {
        use std::time::{Duration, Instant};

        let pool = MemoryPool::new(8);
        let source: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);

        let slot = pool.acquire_slot(NextHop::Terminal, b"payload", source, deadline).await;
        assert_eq!(slot.payload(), b"payload");
        pool.release_slot(slot).await;

        let slot2 = pool.acquire_slot(NextHop::Terminal, b"next", source, deadline).await;
        assert_eq!(slot2.payload(), b"next");

        let (allocated, reused) = pool.stats();
        assert_eq!(allocated, 1);
        assert_eq!(reused, 1);
    }

    #[tokio::test]
    async fn pool_drops_excess_buffers_beyond_capacity() {
        let pool = MemoryPool::new(1);
        pool.release(BytesMut::new()).await;
        pool.release(BytesMut::new()).await;
        let (_, _) = pool.stats();
        let mut free_list = pool.free_list.lock().await;
        assert_eq!(free_list.len(), 1);
        free_list.clear();
    }
}
