//! Wires the pipeline, relay lottery, reputation engine, cover traffic
//! generator, and TCP transport into one running mixnode process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand_core::OsRng;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use x25519_dalek::StaticSecret;

use crate::core::config::NodeConfig;
use crate::core::relay_lottery::RelayLottery;
use crate::core::reputation::ReputationEngine;
use crate::cover::{AdvancedCoverTrafficGenerator, CoverTrafficConfig};
use crate::crypto::sphinx::SphinxProcessor;
use crate::pipeline::{PacketPipeline, PipelineConfig};
use crate::server::TcpServer;
use crate::{MixnodeError, MixnodeStats, MixnodeTrait, Result};

fn load_or_generate_secret(path: Option<&std::path::Path>) -> Result<StaticSecret> {
    let Some(path) = path else {
        return Ok(StaticSecret::random_from_rng(OsRng));
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(MixnodeError::Io)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MixnodeError::Config(format!("{} is not a 32-byte key", path.display())))?;
        Ok(StaticSecret::from(key))
    } else {
        let secret = StaticSecret::random_from_rng(OsRng);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(MixnodeError::Io)?;
        }
        std::fs::write(path, secret.to_bytes()).map_err(MixnodeError::Io)?;
        Ok(secret)
    }
}

/// A running mixnode: owns the TCP transport, which in turn owns the
/// packet pipeline, plus the relay lottery and cover traffic generator
/// that operate alongside it.
pub struct MixNode {
    config: NodeConfig,
    address: SocketAddr,
    server: Option<TcpServer>,
    lottery: Arc<Mutex<RelayLottery>>,
    reputation: Arc<Mutex<ReputationEngine>>,
    cover_generator: Arc<AdvancedCoverTrafficGenerator>,
    stats: Arc<RwLock<MixnodeStats>>,
    started_at: Arc<Mutex<Option<Instant>>>,
}

impl MixNode {
    pub fn new(config: NodeConfig) -> Result<Self> {
        let secret = load_or_generate_secret(config.node_key.as_deref())?;
        let sphinx = SphinxProcessor::new(secret);
        let address = config.listen_addr;

        let pipeline_config = PipelineConfig {
            workers: config.pipeline_workers,
            max_queue_depth: config.max_queue_depth,
            pool_max: config.pool_size,
            mean_delay: config.mean_delay(),
            min_delay: config.min_delay(),
            max_delay: config.max_delay(),
        };
        let pipeline = PacketPipeline::new(sphinx, pipeline_config)?;

        let reputation = pipeline.reputation_handle();
        if let Some(path) = &config.reputation_snapshot {
            if path.exists() {
                let loaded = ReputationEngine::load_from_path(path)?;
                // Uncontended: no worker task exists yet to race this lock.
                let mut guard = reputation
                    .try_lock()
                    .map_err(|_| MixnodeError::Config("reputation engine locked at startup".into()))?;
                *guard = loaded;
            }
        }

        let lottery = RelayLottery::with_sybil_resistance(config.min_relay_stake as u64);

        let cover_generator = AdvancedCoverTrafficGenerator::new(CoverTrafficConfig {
            enabled: config.cover_traffic_enabled,
            ..CoverTrafficConfig::default()
        });

        let server = TcpServer::new(config.clone(), pipeline);

        Ok(Self {
            config,
            address,
            server: Some(server),
            lottery: Arc::new(Mutex::new(lottery)),
            reputation,
            cover_generator: Arc::new(cover_generator),
            stats: Arc::new(RwLock::new(MixnodeStats::new())),
            started_at: Arc::new(Mutex::new(None)),
        })
    }

    pub fn lottery_handle(&self) -> Arc<Mutex<RelayLottery>> {
        Arc::clone(&self.lottery)
    }

    pub fn reputation_handle(&self) -> Arc<Mutex<ReputationEngine>> {
        Arc::clone(&self.reputation)
    }

    /// Periodically refresh the lottery's cached weights from the shared
    /// reputation engine so relay selection reflects recent decay/actions.
    fn spawn_reputation_sync(&self) {
        let lottery = Arc::clone(&self.lottery);
        let reputation = Arc::clone(&self.reputation);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let rep = reputation.lock().await;
                lottery.lock().await.sync_with_reputation(&rep);
            }
        });
    }

    fn spawn_cover_traffic(&self) {
        if !self.config.cover_traffic_enabled {
            return;
        }
        let generator = Arc::clone(&self.cover_generator);
        tokio::spawn(async move {
            loop {
                let interval = generator.cover_interval().await;
                tokio::time::sleep(interval).await;
                if generator.maybe_emit().await.is_none() {
                    continue;
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl MixnodeTrait for MixNode {
    async fn start(&mut self) -> Result<()> {
        *self.started_at.lock().await = Some(Instant::now());
        self.spawn_reputation_sync();
        self.spawn_cover_traffic();

        let mut server = self.server.take().ok_or_else(|| {
            MixnodeError::Config("mixnode already started".to_string())
        })?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("TCP server exited: {}", e);
            }
        });

        info!("mixnode started on {}", self.address);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(path) = &self.config.reputation_snapshot {
            let rep = self.reputation.lock().await;
            rep.save_to_path(path)?;
        }
        Ok(())
    }

    async fn process_packet(&self, _packet: &[u8]) -> Result<Option<Vec<u8>>> {
        Err(MixnodeError::Network(
            "direct packet submission requires the running TCP transport; connect instead"
                .to_string(),
        ))
    }

    fn stats(&self) -> Arc<RwLock<MixnodeStats>> {
        Arc::clone(&self.stats)
    }

    fn address(&self) -> SocketAddr {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_default_config() {
        let config = NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::default()
        };
        let node = MixNode::new(config).unwrap();
        assert_eq!(node.address(), "127.0.0.1:0".parse().unwrap());
    }
}
