//! BetaNet mixnet core: a Sphinx-packet relay node.
//!
//! Accepts length-prefixed packets over TCP, peels one Sphinx layer,
//! schedules a Poisson-distributed delay, batches packets adaptively,
//! blends in cover traffic, and forwards to a next hop chosen by a
//! VRF-driven, reputation-weighted lottery.
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                  betanet_mixcore                   │
//! ├────────────────────────────────────────────────────┤
//! │  server::tcp    – length-prefixed framing, dial pool│
//! │  pipeline       – pool, adaptive batching, stages   │
//! │  crypto::sphinx – per-hop decrypt, MAC, replay tag  │
//! │  core::relay_lottery – VRF weighted selection       │
//! │  core::reputation    – points, decay, cost_of_forgery│
//! │  vrf::poisson_delay  – delay injection               │
//! │  cover               – cover traffic generator       │
//! └────────────────────────────────────────────────────┘
//! ```

#![allow(missing_docs)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub mod core;

#[allow(clippy::module_inception)]
pub mod crypto;

pub mod vrf;

pub mod utils;

pub mod cover;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod server;

pub use core::config::NodeConfig;
pub use core::node::MixNode;
pub use crypto::sphinx::{SphinxError, SphinxProcessor};
pub use pipeline::{PacketPipeline, PipelineStats};
pub use utils::packet::Packet;

/// Mixnode protocol version, packed into the Sphinx header's reserved byte.
pub const MIXNODE_VERSION: u8 = core::protocol_version::ProtocolVersion::V1_2_0.encode_byte();

/// Maximum wire-frame packet size (spec.md §3 `Packet`).
pub const MAX_WIRE_PACKET_SIZE: usize = 65_536;

/// Maximum Sphinx cell size inside a forwarded packet.
pub const MAX_SPHINX_CELL_SIZE: usize = 2048;

/// Crate-wide error taxonomy. Fatal variants map to process exit codes in
/// `bin/betanetd.rs` (1 = config, 2 = crypto/key, 3 = panic/corruption).
#[derive(Debug, Error)]
pub enum MixnodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Packet error: {0}")]
    Packet(String),

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reputation snapshot corrupted: {0}")]
    CorruptSnapshot(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("VRF error: {0}")]
    Vrf(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Result type for mixnode operations.
pub type Result<T> = std::result::Result<T, MixnodeError>;

/// Snapshot of a node's running statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MixnodeStats {
    pub packets_processed: u64,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub cover_traffic_sent: u64,
    pub avg_processing_time_us: f64,
    pub uptime_secs: u64,
}

impl MixnodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&mut self, processing_time: Duration) {
        self.packets_processed += 1;
        let time_us = processing_time.as_micros() as f64;
        self.avg_processing_time_us =
            (self.avg_processing_time_us * (self.packets_processed - 1) as f64 + time_us)
                / self.packets_processed as f64;
    }

    pub fn record_forwarded(&mut self) {
        self.packets_forwarded += 1;
    }

    pub fn record_dropped(&mut self) {
        self.packets_dropped += 1;
    }

    pub fn record_cover_traffic(&mut self) {
        self.cover_traffic_sent += 1;
    }
}

/// Common surface for a running mixnode, regardless of transport.
#[async_trait::async_trait]
pub trait MixnodeTrait: Send + Sync {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self) -> Result<()>;
    async fn process_packet(&self, packet: &[u8]) -> Result<Option<Vec<u8>>>;
    fn stats(&self) -> Arc<RwLock<MixnodeStats>>;
    fn address(&self) -> SocketAddr;
}

/// Throughput/latency/efficiency targets this pipeline is tuned against.
pub struct PerformanceTargets {
    pub target_throughput_pps: f64,
    pub max_avg_latency_ms: f64,
    pub min_pool_hit_rate_pct: f64,
    pub max_drop_rate_pct: f64,
}

impl Default for PerformanceTargets {
    fn default() -> Self {
        Self {
            target_throughput_pps: 25_000.0,
            max_avg_latency_ms: 1.0,
            min_pool_hit_rate_pct: 85.0,
            max_drop_rate_pct: 0.1,
        }
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn stats_track_processed_and_forwarded() {
        let mut stats = MixnodeStats::new();
        stats.record_processed(Duration::from_micros(100));
        assert_eq!(stats.packets_processed, 1);
        assert_eq!(stats.avg_processing_time_us, 100.0);

        stats.record_forwarded();
        assert_eq!(stats.packets_forwarded, 1);
    }

    #[test]
    fn performance_targets_match_design_goals() {
        let targets = PerformanceTargets::default();
        assert_eq!(targets.target_throughput_pps, 25_000.0);
        assert_eq!(targets.max_avg_latency_ms, 1.0);
    }
}
