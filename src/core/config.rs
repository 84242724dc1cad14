//! Node configuration: CLI flags via `clap`, each overridable by an
//! environment variable of the same name, matching how `bin/betanetd.rs`
//! is invoked in both a shell and a container.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Runtime configuration for a single mixnode process.
#[derive(Parser, Debug, Clone)]
#[command(name = "betanetd", about = "BetaNet mixnet relay node")]
pub struct NodeConfig {
    /// Address to accept incoming Sphinx-framed TCP connections on.
    #[arg(long, env = "BETANETD_LISTEN_ADDR", default_value = "0.0.0.0:7777")]
    pub listen_addr: SocketAddr,

    /// Path to this node's X25519 static secret (32 raw bytes). Generated
    /// on first run if absent.
    #[arg(long, env = "BETANETD_NODE_KEY")]
    pub node_key: Option<PathBuf>,

    /// Path to persist/restore the reputation engine's JSON snapshot.
    #[arg(long, env = "BETANETD_REPUTATION_SNAPSHOT")]
    pub reputation_snapshot: Option<PathBuf>,

    /// Number of pipeline worker tasks.
    #[arg(long, env = "PIPELINE_WORKERS", default_value_t = 4)]
    pub pipeline_workers: usize,

    /// Initial adaptive batch size.
    #[arg(long, env = "BATCH_SIZE", default_value_t = 32)]
    pub batch_size: usize,

    /// Memory pool capacity, in buffers.
    #[arg(long, env = "POOL_SIZE", default_value_t = 1024)]
    pub pool_size: usize,

    /// Maximum packets allowed to queue per worker before `submit` rejects.
    #[arg(long, env = "MAX_QUEUE_DEPTH", default_value_t = 4096)]
    pub max_queue_depth: usize,

    /// Throughput target used to size the adaptive batcher (packets/sec).
    #[arg(long, env = "TARGET_THROUGHPUT", default_value_t = 25_000.0)]
    pub target_throughput_pps: f64,

    /// `tracing` env-filter directive, e.g. `info` or `betanet_mixcore=debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Per-connection read buffer size, in bytes.
    #[arg(long, env = "BUFFER_SIZE", default_value_t = 65_536)]
    pub buffer_size: usize,

    #[arg(long, env = "CONNECTION_TIMEOUT_MS", default_value_t = 30_000)]
    pub connection_timeout_ms: u64,

    #[arg(long, env = "MEAN_DELAY_MS", default_value_t = 200)]
    pub mean_delay_ms: u64,

    #[arg(long, env = "MIN_DELAY_MS", default_value_t = 10)]
    pub min_delay_ms: u64,

    #[arg(long, env = "MAX_DELAY_MS", default_value_t = 2_000)]
    pub max_delay_ms: u64,

    /// Whether to emit cover traffic alongside real packets.
    #[arg(long, env = "COVER_TRAFFIC_ENABLED", default_value_t = false)]
    pub cover_traffic_enabled: bool,

    /// Minimum stake (in the lottery's units) a relay must hold before it
    /// can be selected, guarding against cheap Sybil swarms.
    #[arg(long, env = "MIN_RELAY_STAKE", default_value_t = 1.0)]
    pub min_relay_stake: f64,
}

impl NodeConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn mean_delay(&self) -> Duration {
        Duration::from_millis(self.mean_delay_ms)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        // clap::Parser::parse_from(&[] as &[&str]) would require argv[0];
        // build directly from field defaults instead so `Default` works
        // outside of CLI parsing (tests, library embedding).
        Self {
            listen_addr: "0.0.0.0:7777".parse().unwrap(),
            node_key: None,
            reputation_snapshot: None,
            pipeline_workers: 4,
            batch_size: 32,
            pool_size: 1024,
            max_queue_depth: 4096,
            target_throughput_pps: 25_000.0,
            log_level: "info".to_string(),
            buffer_size: 65_536,
            connection_timeout_ms: 30_000,
            mean_delay_ms: 200,
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            cover_traffic_enabled: false,
            min_relay_stake: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_delay_ordering() {
        let config = NodeConfig::default();
        assert!(config.min_delay() <= config.mean_delay());
        assert!(config.mean_delay() <= config.max_delay());
    }

    #[test]
    fn parses_from_explicit_cli_args() {
        let config = NodeConfig::parse_from([
            "betanetd",
            "--listen-addr",
            "127.0.0.1:9999",
            "--pipeline-workers",
            "8",
        ]);
        assert_eq!(config.listen_addr, "127.0.0.1:9999".parse().unwrap());
        assert_eq!(config.pipeline_workers, 8);
    }
}
