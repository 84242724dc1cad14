//! TCP transport for the mixnode.
//!
//! Provides the network I/O layer for receiving and forwarding Sphinx
//! packets across the mixnet topology. Incoming connections feed raw wire
//! packets straight into [`PacketPipeline::submit`]; a background task
//! drains the pipeline's forwarded queue and dials the next hop for each
//! one, routing through [`TcpClient`]'s pooled connections and tripping a
//! per-destination circuit breaker after repeated failures.
//!
//! No version handshake runs over this transport: the protocol version
//! lives in the Sphinx header itself (see `crypto::sphinx`), and an
//! unsupported version is rejected there as a malformed packet rather than
//! negotiated up front.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::config::NodeConfig;
use crate::pipeline::PacketPipeline;
use crate::{MixnodeError, Result};

const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
const CIRCUIT_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Tracks consecutive forwarding failures per destination and trips a
/// 30-second cool-off after five in a row, so one unreachable next hop
/// doesn't burn a forwarding-task iteration on every batch.
#[derive(Default)]
struct ForwardingCircuitBreaker {
    failures: HashMap<SocketAddr, u32>,
    open_until: HashMap<SocketAddr, Instant>,
}

impl ForwardingCircuitBreaker {
    fn is_open(&self, addr: SocketAddr) -> bool {
        matches!(self.open_until.get(&addr), Some(until) if Instant::now() < *until)
    }

    fn record_success(&mut self, addr: SocketAddr) {
        self.failures.remove(&addr);
        self.open_until.remove(&addr);
    }

    fn record_failure(&mut self, addr: SocketAddr) {
        let count = self.failures.entry(addr).or_insert(0);
        *count += 1;
        if *count >= CIRCUIT_BREAKER_THRESHOLD {
            self.open_until
                .insert(addr, Instant::now() + CIRCUIT_BREAKER_COOLDOWN);
            *count = 0;
        }
    }
}

/// A pooled outbound connection, evicted once idle past `idle_timeout`.
struct PooledConn {
    stream: TcpStream,
    last_used: Instant,
}

/// Keeps one idle-timeout-bounded outbound connection per destination so
/// repeated forwards to the same next hop don't pay a fresh TCP handshake
/// each time.
struct ConnectionPool {
    conns: Mutex<HashMap<SocketAddr, PooledConn>>,
    idle_timeout: Duration,
}

impl ConnectionPool {
    fn new(idle_timeout: Duration) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    async fn take(&self, addr: SocketAddr) -> Option<TcpStream> {
        let mut conns = self.conns.lock().await;
        if let Some(pooled) = conns.remove(&addr) {
            if pooled.last_used.elapsed() < self.idle_timeout {
                return Some(pooled.stream);
            }
        }
        None
    }

    async fn put_back(&self, addr: SocketAddr, stream: TcpStream) {
        let mut conns = self.conns.lock().await;
        conns.insert(
            addr,
            PooledConn {
                stream,
                last_used: Instant::now(),
            },
        );
    }
}

fn frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// TCP server for handling mixnode network I/O.
pub struct TcpServer {
    config: NodeConfig,
    pipeline: Arc<PacketPipeline>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    node_id: String,
    pool: Arc<ConnectionPool>,
    circuit_breaker: Arc<Mutex<ForwardingCircuitBreaker>>,
}

impl TcpServer {
    pub fn new(config: NodeConfig, pipeline: PacketPipeline) -> Self {
        let idle_timeout = config.connection_timeout();
        Self {
            config,
            pipeline: Arc::new(pipeline),
            shutdown_tx: None,
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            pool: Arc::new(ConnectionPool::new(idle_timeout)),
            circuit_breaker: Arc::new(Mutex::new(ForwardingCircuitBreaker::default())),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start accepting connections and the background forwarding task.
    pub async fn run(&mut self) -> Result<()> {
        info!("starting mixnode TCP server on {}", self.config.listen_addr);

        self.pipeline.start().await?;

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(MixnodeError::Io)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        info!("listening on {}", self.config.listen_addr);

        self.spawn_forwarding_task(shutdown_tx.subscribe());

        let mut shutdown_rx_main = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!("accepted connection from {}", peer_addr);
                            let pipeline = Arc::clone(&self.pipeline);
                            let config = self.config.clone();
                            let shutdown_rx = shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) =
                                    Self::handle_connection(stream, peer_addr, pipeline, config, shutdown_rx)
                                        .await
                                {
                                    error!("connection error for {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => error!("failed to accept connection: {}", e),
                    }
                }
                _ = shutdown_rx_main.recv() => {
                    info!("TCP server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Drain the pipeline's forwarded-packet queue and dial each next hop,
    /// skipping destinations whose circuit breaker is currently open.
    fn spawn_forwarding_task(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let pipeline = Arc::clone(&self.pipeline);
        let pool = Arc::clone(&self.pool);
        let circuit_breaker = Arc::clone(&self.circuit_breaker);
        let forward_timeout = self.config.connection_timeout();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(10));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.recv() => break,
                }

                for forwarded in pipeline.drain_forwarded(64).await {
                    let addr = forwarded.next_hop;
                    if circuit_breaker.lock().await.is_open(addr) {
                        debug!(%addr, "circuit open, dropping forwarded packet");
                        continue;
                    }

                    let result = tokio::time::timeout(
                        forward_timeout,
                        Self::dial_and_send(&pool, addr, &forwarded.payload),
                    )
                    .await;

                    let mut breaker = circuit_breaker.lock().await;
                    match result {
                        Ok(Ok(())) => breaker.record_success(addr),
                        Ok(Err(e)) => {
                            warn!(%addr, "forward failed: {}", e);
                            breaker.record_failure(addr);
                        }
                        Err(_) => {
                            warn!(%addr, "forward timed out");
                            breaker.record_failure(addr);
                        }
                    }
                }
            }
        });
    }

    async fn dial_and_send(pool: &ConnectionPool, addr: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut stream = match pool.take(addr).await {
            Some(stream) => stream,
            None => TcpStream::connect(addr)
                .await
                .map_err(|e| MixnodeError::Network(format!("connect to {addr} failed: {e}")))?,
        };

        stream
            .write_all(&frame(payload))
            .await
            .map_err(MixnodeError::Io)?;
        stream.flush().await.map_err(MixnodeError::Io)?;

        pool.put_back(addr, stream).await;
        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        pipeline: Arc<PacketPipeline>,
        config: NodeConfig,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        debug!("handling connection from {}", peer_addr);
        let mut buffer = BytesMut::with_capacity(config.buffer_size);

        loop {
            tokio::select! {
                result = tokio::time::timeout(config.connection_timeout(), stream.read_buf(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => {
                            debug!("connection closed by peer {}", peer_addr);
                            break;
                        }
                        Ok(Ok(n)) => {
                            debug!("received {} bytes from {}", n, peer_addr);

                            while buffer.len() >= 4 {
                                let length = u32::from_be_bytes([
                                    buffer[0], buffer[1], buffer[2], buffer[3],
                                ]) as usize;

                                if buffer.len() < 4 + length {
                                    break;
                                }

                                let packet_data = buffer.split_to(4 + length).split_off(4);
                                let packet_bytes: Bytes = packet_data.freeze();

                                if let Err(e) = pipeline.submit(packet_bytes, peer_addr).await {
                                    warn!("failed to submit packet: {}", e);
                                }
                            }

                            let delivered = pipeline.drain_delivered(16).await;
                            if !delivered.is_empty() {
                                debug!("writing back {} delivered packets", delivered.len());
                                for item in delivered {
                                    if let Err(e) = stream.write_all(&frame(&item.payload)).await {
                                        error!("failed to write response: {}", e);
                                        break;
                                    }
                                }
                                if let Err(e) = stream.flush().await {
                                    error!("failed to flush stream: {}", e);
                                    break;
                                }
                            }
                        }
                        Ok(Err(e)) => {
                            error!("read error from {}: {}", peer_addr, e);
                            break;
                        }
                        Err(_) => {
                            warn!("connection timeout for {}", peer_addr);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("shutdown signal received for connection {}", peer_addr);
                    break;
                }
            }
        }

        Ok(())
    }

    pub fn pipeline_stats(&self) -> Arc<crate::pipeline::PipelineStats> {
        self.pipeline.stats()
    }
}

/// TCP client for directly dialing another mixnode (used outside the
/// forwarding task, e.g. by tooling or tests that want a raw send/response
/// round trip rather than fire-and-forget forwarding).
pub struct TcpClient {
    next_hop: SocketAddr,
}

impl TcpClient {
    pub fn new(next_hop: SocketAddr) -> Self {
        Self { next_hop }
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<Vec<u8>> {
        debug!("connecting to {}", self.next_hop);

        let mut stream = TcpStream::connect(self.next_hop)
            .await
            .map_err(|e| MixnodeError::Network(format!("connection failed: {e}")))?;

        stream
            .write_all(&frame(packet))
            .await
            .map_err(MixnodeError::Io)?;
        stream.flush().await.map_err(MixnodeError::Io)?;

        let mut length_buf = [0u8; 4];
        stream
            .read_exact(&mut length_buf)
            .await
            .map_err(MixnodeError::Io)?;
        let response_length = u32::from_be_bytes(length_buf) as usize;
        let mut response = vec![0u8; response_length];
        stream
            .read_exact(&mut response)
            .await
            .map_err(MixnodeError::Io)?;

        Ok(response)
    }

    pub async fn send_packet_with_timeout(
        &self,
        packet: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        tokio::time::timeout(timeout, self.send_packet(packet))
            .await
            .map_err(|_| MixnodeError::Network("request timeout".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sphinx::SphinxProcessor;
    use crate::pipeline::PipelineConfig;
    use crate::utils::packet::Packet;
    use bytes::Bytes;
    use rand_core::OsRng;
    use x25519_dalek::StaticSecret;

    fn test_pipeline() -> PacketPipeline {
        let secret = StaticSecret::random_from_rng(OsRng);
        PacketPipeline::new(SphinxProcessor::new(secret), PipelineConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn server_creation_has_no_shutdown_handle_until_run() {
        let config = NodeConfig::default();
        let pipeline = test_pipeline();

        let server = TcpServer::new(config, pipeline);
        assert!(server.shutdown_tx.is_none());
    }

    #[tokio::test]
    async fn client_round_trip_against_running_server() {
        let mut config = NodeConfig::default();
        config.listen_addr = "127.0.0.1:19101".parse().unwrap();

        let pipeline = test_pipeline();

        let mut server = TcpServer::new(config.clone(), pipeline);
        tokio::spawn(async move {
            server.run().await.ok();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let client = TcpClient::new(config.listen_addr);
        let garbage_packet = Packet::data(Bytes::from(vec![1, 2, 3, 4]), 0);
        let encoded = garbage_packet.encode().unwrap();

        // A malformed Sphinx payload is dropped by the pipeline, so no
        // delivered response arrives within the timeout; this still
        // exercises the accept/submit path end-to-end.
        let result = client
            .send_packet_with_timeout(&encoded, Duration::from_millis(300))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn circuit_breaker_opens_after_threshold_failures() {
        let mut breaker = ForwardingCircuitBreaker::default();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        for _ in 0..CIRCUIT_BREAKER_THRESHOLD {
            assert!(!breaker.is_open(addr));
            breaker.record_failure(addr);
        }
        assert!(breaker.is_open(addr));
    }

    #[test]
    fn circuit_breaker_resets_on_success() {
        let mut breaker = ForwardingCircuitBreaker::default();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        breaker.record_failure(addr);
        breaker.record_failure(addr);
        breaker.record_success(addr);
        assert_eq!(*breaker.failures.get(&addr).unwrap_or(&0), 0);
    }
}
