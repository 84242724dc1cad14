//! Node reputation engine.
//!
//! Tracks a points score in `[0, 200]` per relay (baseline 100), decays it
//! toward zero activity over idle days, and derives a Sybil cost-of-forgery
//! figure from points, stake, account age, and observed success ratio.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{MixnodeError, Result};

/// Baseline reputation points assigned to a newly observed relay.
pub const BASE_POINTS: f64 = 100.0;
/// Reputation points floor.
pub const MIN_POINTS: f64 = 0.0;
/// Reputation points ceiling.
pub const MAX_POINTS: f64 = 200.0;
/// Fractional daily decay applied per idle day.
pub const DECAY_PER_DAY: f64 = 0.99;

/// An action observed for a relay and its fixed point delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ReputationAction {
    SuccessfulTask,
    UptimeMilestone,
    HighQualityService,
    TaskFailure,
    DroppedConnection,
    MaliciousBehavior,
    Custom(f64),
}

impl ReputationAction {
    /// Fixed point delta for this action.
    pub fn delta(self) -> f64 {
        match self {
            ReputationAction::SuccessfulTask => 10.0,
            ReputationAction::UptimeMilestone => 5.0,
            ReputationAction::HighQualityService => 20.0,
            ReputationAction::TaskFailure => -15.0,
            ReputationAction::DroppedConnection => -25.0,
            ReputationAction::MaliciousBehavior => -50.0,
            ReputationAction::Custom(delta) => delta,
        }
    }

    /// Whether this action counts toward the success ratio used by
    /// [`ReputationEngine::cost_of_forgery`].
    fn is_success(self) -> bool {
        self.delta() > 0.0
    }
}

/// Performance metrics folded into a relay's lottery weight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub packets_processed: u64,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
    pub uptime_percent: f64,
    pub avg_latency_ms: f64,
}

impl PerformanceMetrics {
    pub fn latency_score(&self) -> f64 {
        (1.0 - (self.avg_latency_ms / 200.0)).max(0.0)
    }

    pub fn success_rate(&self) -> f64 {
        if self.packets_processed == 0 {
            return 1.0;
        }
        self.packets_forwarded as f64 / self.packets_processed as f64
    }
}

/// Persisted reputation record for a single relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReputation {
    pub address: SocketAddr,
    pub points: f64,
    pub stake: u64,
    pub created_at_secs: u64,
    pub last_active_secs: u64,
    pub successes: u64,
    pub failures: u64,
    pub metrics: PerformanceMetrics,
}

impl NodeReputation {
    fn new(address: SocketAddr, now_secs: u64) -> Self {
        Self {
            address,
            points: BASE_POINTS,
            stake: 0,
            created_at_secs: now_secs,
            last_active_secs: now_secs,
            successes: 0,
            failures: 0,
            metrics: PerformanceMetrics::default(),
        }
    }

    /// Reputation score scaled to `[0.0, 1.0]` for lottery weighting.
    pub fn reputation_score(&self) -> f64 {
        (self.points / MAX_POINTS).clamp(0.0, 1.0)
    }

    fn success_ratio(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.5
        } else {
            self.successes as f64 / total as f64
        }
    }

    fn age_days(&self, now_secs: u64) -> f64 {
        now_secs.saturating_sub(self.created_at_secs) as f64 / 86_400.0
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The reputation engine: one record per known relay address.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReputationEngine {
    nodes: HashMap<SocketAddr, NodeReputation>,
}

impl ReputationEngine {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a relay, or return its existing record unchanged.
    pub fn observe(&mut self, address: SocketAddr) -> &NodeReputation {
        let now = now_secs();
        self.nodes
            .entry(address)
            .or_insert_with(|| NodeReputation::new(address, now))
    }

    /// Apply an action to a relay, clamping points to `[MIN_POINTS, MAX_POINTS]`.
    pub fn apply(&mut self, address: SocketAddr, action: ReputationAction) {
        let now = now_secs();
        let node = self
            .nodes
            .entry(address)
            .or_insert_with(|| NodeReputation::new(address, now));

        node.points = (node.points + action.delta()).clamp(MIN_POINTS, MAX_POINTS);
        node.last_active_secs = now;
        if action.is_success() {
            node.successes += 1;
        } else {
            node.failures += 1;
        }
    }

    /// Set or update a relay's staked amount.
    pub fn set_stake(&mut self, address: SocketAddr, stake: u64) {
        let now = now_secs();
        self.nodes
            .entry(address)
            .or_insert_with(|| NodeReputation::new(address, now))
            .stake = stake;
    }

    /// Decay every relay's points by `DECAY_PER_DAY` raised to the number of
    /// whole and fractional days since it was last active.
    pub fn decay_all(&mut self) {
        let now = now_secs();
        for node in self.nodes.values_mut() {
            let idle_days = now.saturating_sub(node.last_active_secs) as f64 / 86_400.0;
            if idle_days <= 0.0 {
                continue;
            }
            node.points = (node.points * DECAY_PER_DAY.powf(idle_days)).clamp(MIN_POINTS, MAX_POINTS);
        }
    }

    pub fn get(&self, address: &SocketAddr) -> Option<&NodeReputation> {
        self.nodes.get(address)
    }

    /// All known relays, for syncing into the lottery's weight table.
    pub fn candidates(&self) -> impl Iterator<Item = &NodeReputation> {
        self.nodes.values()
    }

    /// Cost of forging this relay's standing: grows with stake, points,
    /// account age, and observed success ratio, so a freshly spun-up Sybil
    /// identity starts out cheap to discard.
    pub fn cost_of_forgery(&self, address: &SocketAddr) -> f64 {
        let Some(node) = self.nodes.get(address) else {
            return 0.0;
        };
        let now = now_secs();
        let stake_term = (node.stake.max(1) as f64).ln();
        let points_term = (node.points / 100.0).max(0.1);
        let age_term = 1.0 + node.age_days(now).min(365.0) / 365.0;
        let success_term = 1.0 + node.success_ratio();
        stake_term * points_term * age_term * success_term
    }

    /// Atomically persist the reputation table as JSON: write to a temp
    /// file in the same directory, then rename over the destination.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&self.nodes)
            .map_err(|e| MixnodeError::Config(format!("reputation serialize error: {e}")))?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Load a persisted snapshot. A malformed file (truncated write, disk
    /// corruption, foreign format) is reported as [`MixnodeError::CorruptSnapshot`],
    /// distinct from an ordinary configuration mistake, so the caller can
    /// map it to its own exit code.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let nodes: HashMap<SocketAddr, NodeReputation> = serde_json::from_slice(&data)
            .map_err(|e| MixnodeError::CorruptSnapshot(format!("{}: {e}", path.display())))?;
        Ok(Self { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn new_relay_starts_at_baseline() {
        let mut engine = ReputationEngine::new();
        let rep = engine.observe(addr(9000));
        assert_eq!(rep.points, BASE_POINTS);
    }

    #[test]
    fn actions_clamp_to_bounds() {
        let mut engine = ReputationEngine::new();
        for _ in 0..30 {
            engine.apply(addr(9001), ReputationAction::HighQualityService);
        }
        assert_eq!(engine.get(&addr(9001)).unwrap().points, MAX_POINTS);

        for _ in 0..30 {
            engine.apply(addr(9002), ReputationAction::MaliciousBehavior);
        }
        assert_eq!(engine.get(&addr(9002)).unwrap().points, MIN_POINTS);
    }

    #[test]
    fn malicious_behavior_outweighs_task_failure() {
        let mut engine = ReputationEngine::new();
        engine.apply(addr(9003), ReputationAction::TaskFailure);
        let after_failure = engine.get(&addr(9003)).unwrap().points;
        engine.apply(addr(9003), ReputationAction::MaliciousBehavior);
        let after_malicious = engine.get(&addr(9003)).unwrap().points;
        assert!(after_malicious < after_failure);
    }

    #[test]
    fn cost_of_forgery_grows_with_stake_and_age() {
        let mut engine = ReputationEngine::new();
        engine.observe(addr(9004));
        engine.set_stake(addr(9004), 10);
        let low = engine.cost_of_forgery(&addr(9004));
        engine.set_stake(addr(9004), 100_000);
        let high = engine.cost_of_forgery(&addr(9004));
        assert!(high > low);
    }

    #[test]
    fn json_round_trips_through_disk() {
        let mut engine = ReputationEngine::new();
        engine.apply(addr(9005), ReputationAction::SuccessfulTask);
        engine.set_stake(addr(9005), 500);

        let path = std::env::temp_dir().join(format!("betanet-reputation-test-{}.json", std::process::id()));
        engine.save_to_path(&path).unwrap();
        let loaded = ReputationEngine::load_from_path(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let original = engine.get(&addr(9005)).unwrap();
        let restored = loaded.get(&addr(9005)).unwrap();
        assert_eq!(original.points, restored.points);
        assert_eq!(original.stake, restored.stake);
    }

    #[test]
    fn decay_reduces_points_for_idle_nodes() {
        let mut engine = ReputationEngine::new();
        engine.apply(addr(9006), ReputationAction::HighQualityService);
        let node = engine.nodes.get_mut(&addr(9006)).unwrap();
        node.last_active_secs -= 10 * 86_400;
        let before = node.points;
        engine.decay_all();
        assert!(engine.get(&addr(9006)).unwrap().points < before);
    }
}
